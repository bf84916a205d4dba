//! In-process host implementations
//!
//! Used by the sandbox server and by tests. State sits behind std mutexes; a
//! poisoned lock is recovered rather than propagated since every critical
//! section here is a plain push or read.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Notify;
use tracing::{debug, info};

use super::{
    BuildLog, ExecutionLocator, HostError, MarkerKind, RunAnnotator, RunInfo, RunMarker, RunStore,
    Suspendable,
};
use crate::gate::execution::StepGate;
use crate::gate::outcome::FlowInterrupted;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// How a suspended node was resumed
#[derive(Debug, Clone, PartialEq)]
pub enum Resumption {
    Success(Option<Value>),
    Failure(FlowInterrupted),
}

impl Resumption {
    pub fn is_success(&self) -> bool {
        matches!(self, Resumption::Success(_))
    }
}

#[derive(Debug, Default)]
struct ContextState {
    pause_label: Option<String>,
    paused: bool,
    resumptions: Vec<Resumption>,
}

/// A suspended flow node that records how it was resumed
#[derive(Debug, Default)]
pub struct MemoryContext {
    state: Mutex<ContextState>,
    resumed: Notify,
}

impl MemoryContext {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn is_paused(&self) -> bool {
        lock(&self.state).paused
    }

    pub fn pause_label(&self) -> Option<String> {
        lock(&self.state).pause_label.clone()
    }

    pub fn resumptions(&self) -> Vec<Resumption> {
        lock(&self.state).resumptions.clone()
    }

    pub fn resume_count(&self) -> usize {
        lock(&self.state).resumptions.len()
    }

    /// Wait until the node has been resumed, up to `timeout`
    pub async fn wait_resumed(&self, timeout: Duration) -> Option<Resumption> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(first) = lock(&self.state).resumptions.first().cloned() {
                return Some(first);
            }
            if tokio::time::timeout_at(deadline, self.resumed.notified())
                .await
                .is_err()
            {
                return lock(&self.state).resumptions.first().cloned();
            }
        }
    }

    fn record(&self, resumption: Resumption) {
        lock(&self.state).resumptions.push(resumption);
        self.resumed.notify_one();
    }
}

impl Suspendable for MemoryContext {
    fn pause(&self, label: &str) -> Result<(), HostError> {
        let mut state = lock(&self.state);
        state.pause_label = Some(label.to_string());
        state.paused = true;
        Ok(())
    }

    fn end_pause(&self) -> Result<(), HostError> {
        lock(&self.state).paused = false;
        Ok(())
    }

    fn on_success(&self, value: Option<Value>) {
        debug!("node resumed with success");
        self.record(Resumption::Success(value));
    }

    fn on_failure(&self, failure: FlowInterrupted) {
        debug!("node resumed with failure: {}", failure);
        self.record(Resumption::Failure(failure));
    }
}

/// Markers and console lines of one run
#[derive(Debug, Default)]
pub struct MemoryRun {
    markers: Mutex<Vec<RunMarker>>,
    lines: Mutex<Vec<String>>,
}

impl MemoryRun {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn markers(&self) -> Vec<RunMarker> {
        lock(&self.markers).clone()
    }

    pub fn has_marker(&self, kind: MarkerKind) -> bool {
        lock(&self.markers).iter().any(|m| m.kind() == kind)
    }

    pub fn log_lines(&self) -> Vec<String> {
        lock(&self.lines).clone()
    }
}

impl RunAnnotator for MemoryRun {
    fn add_marker(&self, marker: RunMarker) {
        lock(&self.markers).push(marker);
    }

    fn remove_marker(&self, kind: MarkerKind, gate_id: &str) {
        lock(&self.markers).retain(|m| !(m.kind() == kind && m.gate_id() == Some(gate_id)));
    }
}

impl BuildLog for MemoryRun {
    fn println(&self, line: &str) {
        info!("[console] {}", line);
        lock(&self.lines).push(line.to_string());
    }
}

/// Gate ids by run, kept in memory
#[derive(Debug, Default)]
pub struct MemoryRunStore {
    records: Mutex<HashMap<String, Vec<String>>>,
    fail_saves: AtomicBool,
}

impl MemoryRunStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make subsequent saves fail
    pub fn set_fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }

    pub fn record(&self, run: &RunInfo) -> Option<Vec<String>> {
        lock(&self.records).get(&run.key()).cloned()
    }
}

#[async_trait]
impl RunStore for MemoryRunStore {
    async fn save_gate_ids(&self, run: &RunInfo, ids: &[String]) -> Result<(), HostError> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(HostError::Engine(format!("cannot save {}", run)));
        }
        lock(&self.records).insert(run.key(), ids.to_vec());
        Ok(())
    }

    async fn load_gate_ids(&self, run: &RunInfo) -> Result<Vec<String>, HostError> {
        Ok(lock(&self.records).get(&run.key()).cloned().unwrap_or_default())
    }
}

/// Live suspended gates by run, as an engine would report them after a restart
#[derive(Default)]
pub struct MemoryLocator {
    runs: Mutex<HashMap<String, Vec<Arc<StepGate>>>>,
    delay: Mutex<Option<Duration>>,
    broken: AtomicBool,
}

impl MemoryLocator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, run: &RunInfo, gate: Arc<StepGate>) {
        lock(&self.runs).entry(run.key()).or_default().push(gate);
    }

    /// Make the run known with no suspended gates
    pub fn register_run(&self, run: &RunInfo) {
        lock(&self.runs).entry(run.key()).or_default();
    }

    /// Simulate an engine that is still restoring its executions
    pub fn set_delay(&self, delay: Option<Duration>) {
        *lock(&self.delay) = delay;
    }

    /// Simulate an engine that fails to report its executions
    pub fn set_broken(&self, broken: bool) {
        self.broken.store(broken, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for MemoryLocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryLocator")
            .field("runs", &lock(&self.runs).len())
            .finish()
    }
}

#[async_trait]
impl ExecutionLocator for MemoryLocator {
    async fn suspended_gates(
        &self,
        run: &RunInfo,
    ) -> Result<Option<Vec<Arc<StepGate>>>, HostError> {
        let delay = *lock(&self.delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.broken.load(Ordering::SeqCst) {
            return Err(HostError::Engine(format!("executions of {} unavailable", run)));
        }
        Ok(lock(&self.runs).get(&run.key()).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gate::outcome::InterruptionCause;

    #[tokio::test]
    async fn test_context_records_resumptions() {
        let context = MemoryContext::new();
        context.pause("Input").unwrap();
        assert!(context.is_paused());
        assert_eq!(context.pause_label().as_deref(), Some("Input"));

        context.on_failure(FlowInterrupted::new(InterruptionCause::stopped("killed")));
        let resumed = context.wait_resumed(Duration::from_millis(10)).await;
        assert!(matches!(resumed, Some(Resumption::Failure(_))));
        assert_eq!(context.resume_count(), 1);
    }

    #[tokio::test]
    async fn test_wait_resumed_times_out() {
        let context = MemoryContext::new();
        assert!(context.wait_resumed(Duration::from_millis(20)).await.is_none());
    }

    #[test]
    fn test_markers_removed_by_kind_and_gate() {
        let run = MemoryRun::new();
        run.add_marker(RunMarker::Deploying {
            gate_id: "A".into(),
        });
        run.add_marker(RunMarker::Deploying {
            gate_id: "B".into(),
        });
        run.remove_marker(MarkerKind::Deploying, "A");
        assert_eq!(
            run.markers(),
            vec![RunMarker::Deploying {
                gate_id: "B".into()
            }]
        );
    }

    #[tokio::test]
    async fn test_store_round_trip() {
        let store = MemoryRunStore::new();
        let run = RunInfo::new(3, "app");
        assert!(store.load_gate_ids(&run).await.unwrap().is_empty());

        store
            .save_gate_ids(&run, &["A".to_string(), "B".to_string()])
            .await
            .unwrap();
        assert_eq!(store.load_gate_ids(&run).await.unwrap(), vec!["A", "B"]);

        store.set_fail_saves(true);
        assert!(store.save_gate_ids(&run, &[]).await.is_err());
    }
}
