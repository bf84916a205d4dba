//! Per-gate notice delivery
//!
//! A gate pushes lifecycle notices while holding its own lock; pushing never
//! waits on the network. A single listener task per gate drains the channel
//! in order, taking a worker pool slot for each delivery, so notices for one
//! gate arrive in the order their transitions happened.

use async_channel::{Receiver, Sender};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{GateDescriptor, Identity, NoticeType, NotificationDispatcher};
use crate::gate::pool::WorkerPool;

#[derive(Debug, Clone)]
struct Notice {
    event: NoticeType,
    identity: Option<Identity>,
}

#[derive(Debug)]
pub struct NoticeQueue {
    tx: Sender<Notice>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl NoticeQueue {
    pub fn start(
        dispatcher: NotificationDispatcher,
        descriptor: GateDescriptor,
        pool: &WorkerPool,
    ) -> Self {
        let (tx, rx) = async_channel::unbounded();
        let worker = pool.spawn_listener(deliver(rx, dispatcher, descriptor, pool.clone()));
        Self {
            tx,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Queue a notice. Returns `false` once the queue has been closed.
    pub fn push(&self, event: NoticeType, identity: Option<Identity>) -> bool {
        match self.tx.try_send(Notice { event, identity }) {
            Ok(()) => true,
            Err(e) => {
                warn!(%event, "notice dropped: {}", e);
                false
            }
        }
    }

    /// Stop accepting notices. Already queued ones are still delivered.
    pub fn close(&self) {
        self.tx.close();
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Close the queue and wait until every queued notice has been sent
    pub async fn drained(&self) {
        self.close();
        let worker = self.worker.lock().await.take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                warn!("notice worker failed: {}", e);
            }
        }
    }
}

async fn deliver(
    rx: Receiver<Notice>,
    dispatcher: NotificationDispatcher,
    descriptor: GateDescriptor,
    pool: WorkerPool,
) {
    while let Ok(notice) = rx.recv().await {
        let _permit = pool.acquire().await;
        let delivered = dispatcher
            .notice(notice.event, &descriptor, notice.identity.as_ref())
            .await;
        if !delivered {
            warn!(
                gate = %descriptor.step_id,
                event = %notice.event,
                "notice not delivered"
            );
        }
    }
    debug!(gate = %descriptor.step_id, "notice queue drained");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callback::CallbackClient;
    use crate::pipeline::{GateConfig, HttpConfig};
    use std::sync::Arc;

    fn descriptor() -> GateDescriptor {
        GateDescriptor {
            run_id: 1,
            step_id: "Gate".into(),
            node_id: "3".into(),
            pipeline_name: "app".into(),
            pipeline_full_name: "app".into(),
            devops_id: String::new(),
            submitter: None,
        }
    }

    #[tokio::test]
    async fn test_closed_queue_rejects_push() {
        let dispatcher = NotificationDispatcher::new(
            CallbackClient::new(HttpConfig::default()).unwrap(),
            Arc::new(GateConfig::default()),
        );
        let pool = WorkerPool::current(1);
        let queue = NoticeQueue::start(dispatcher, descriptor(), &pool);

        assert!(queue.push(NoticeType::Ready, None));
        queue.drained().await;
        assert!(queue.is_closed());
        assert!(!queue.push(NoticeType::Abort, None));
    }
}
