//! Per-run registry of open gates
//!
//! The registry keeps the ordered ids of a run's open gates and, once
//! resident, the live [`StepGate`]s. Ids are written to the [`RunStore`] after
//! every mutation so they survive a restart; the live gates do not, and are
//! recovered lazily from the engine the first time the registry is used
//! afterwards.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::gate::error::GateError;
use crate::gate::execution::StepGate;
use crate::host::{ExecutionLocator, RunInfo, RunStore};

/// Default bound on waiting for the engine to restore a run's executions
pub const DEFAULT_LOAD_TIMEOUT: Duration = Duration::from_secs(60);

/// Where the registry stands with respect to live gates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadStatus {
    /// Only ids are known
    Unloaded,
    /// Reconciliation with the engine is running
    Loading,
    Loaded,
    /// Some ids on record had no live gate
    Partial,
}

enum Residency {
    Unloaded,
    Loaded(Vec<Arc<StepGate>>),
    Partial(Vec<Arc<StepGate>>),
}

struct RegistryState {
    ids: Vec<String>,
    residency: Residency,
}

impl RegistryState {
    fn gates(&self) -> Option<&Vec<Arc<StepGate>>> {
        match &self.residency {
            Residency::Unloaded => None,
            Residency::Loaded(gates) | Residency::Partial(gates) => Some(gates),
        }
    }

    fn gates_mut(&mut self) -> Option<&mut Vec<Arc<StepGate>>> {
        match &mut self.residency {
            Residency::Unloaded => None,
            Residency::Loaded(gates) | Residency::Partial(gates) => Some(gates),
        }
    }
}

pub struct GateRegistry {
    run: RunInfo,
    store: Arc<dyn RunStore>,
    locator: Option<Arc<dyn ExecutionLocator>>,
    load_timeout: Duration,
    loading: AtomicBool,
    state: Mutex<RegistryState>,
}

impl GateRegistry {
    /// Registry of a run that has just started: nothing to recover
    pub fn new(run: RunInfo, store: Arc<dyn RunStore>) -> Self {
        Self {
            run,
            store,
            locator: None,
            load_timeout: DEFAULT_LOAD_TIMEOUT,
            loading: AtomicBool::new(false),
            state: Mutex::new(RegistryState {
                ids: Vec::new(),
                residency: Residency::Loaded(Vec::new()),
            }),
        }
    }

    /// Registry of a run restored after a restart, knowing only `ids`
    pub fn restore(
        run: RunInfo,
        ids: Vec<String>,
        store: Arc<dyn RunStore>,
        locator: Arc<dyn ExecutionLocator>,
    ) -> Self {
        Self {
            run,
            store,
            locator: Some(locator),
            load_timeout: DEFAULT_LOAD_TIMEOUT,
            loading: AtomicBool::new(false),
            state: Mutex::new(RegistryState {
                ids,
                residency: Residency::Unloaded,
            }),
        }
    }

    /// Restore a run's registry from the ids on record in `store`
    pub async fn reopen(
        run: RunInfo,
        store: Arc<dyn RunStore>,
        locator: Arc<dyn ExecutionLocator>,
    ) -> Result<Self, GateError> {
        let ids = store.load_gate_ids(&run).await?;
        debug!("Reopening {} with {} gate ids on record", run, ids.len());
        Ok(Self::restore(run, ids, store, locator))
    }

    pub fn with_load_timeout(mut self, timeout: Duration) -> Self {
        self.load_timeout = timeout;
        self
    }

    pub fn run(&self) -> &RunInfo {
        &self.run
    }

    /// How long reconciliation with the engine may take
    pub fn load_timeout(&self) -> Duration {
        self.load_timeout
    }

    pub async fn status(&self) -> LoadStatus {
        if self.loading.load(Ordering::SeqCst) {
            return LoadStatus::Loading;
        }
        match self.state.lock().await.residency {
            Residency::Unloaded => LoadStatus::Unloaded,
            Residency::Loaded(_) => LoadStatus::Loaded,
            Residency::Partial(_) => LoadStatus::Partial,
        }
    }

    /// Ids on record, resident or not
    pub async fn ids(&self) -> Vec<String> {
        self.state.lock().await.ids.clone()
    }

    /// Reconcile with the engine if that has not happened yet
    pub async fn ensure_loaded(&self) -> Result<LoadStatus, GateError> {
        let mut state = self.state.lock().await;
        self.load(&mut state).await
    }

    async fn load(&self, state: &mut RegistryState) -> Result<LoadStatus, GateError> {
        match state.residency {
            Residency::Loaded(_) => return Ok(LoadStatus::Loaded),
            Residency::Partial(_) => return Ok(LoadStatus::Partial),
            Residency::Unloaded => {}
        }

        let Some(locator) = &self.locator else {
            warn!("No execution locator for {}; gates stay unloaded", self.run);
            return Ok(LoadStatus::Unloaded);
        };

        self.loading.store(true, Ordering::SeqCst);
        let result =
            tokio::time::timeout(self.load_timeout, locator.suspended_gates(&self.run)).await;
        self.loading.store(false, Ordering::SeqCst);

        let live = match result {
            Err(_) => {
                return Err(GateError::StateUnavailable(format!(
                    "executions of {} not restored within {:?}",
                    self.run, self.load_timeout
                )))
            }
            Ok(Err(e)) => {
                warn!("Failed to load executions of {}: {}", self.run, e);
                return Ok(LoadStatus::Unloaded);
            }
            Ok(Ok(None)) => {
                warn!("{} has no flow execution", self.run);
                return Ok(LoadStatus::Unloaded);
            }
            Ok(Ok(Some(live))) => live,
        };

        let mut gates = Vec::with_capacity(state.ids.len());
        for id in &state.ids {
            if let Some(gate) = live.iter().find(|g| g.id() == id.as_str()) {
                gates.push(Arc::clone(gate));
            }
        }

        if gates.len() == state.ids.len() {
            info!("Recovered {} gates of {}", gates.len(), self.run);
            state.residency = Residency::Loaded(gates);
            Ok(LoadStatus::Loaded)
        } else {
            warn!(
                "Expected {} gates in {} but recovered {}",
                state.ids.len(),
                self.run,
                gates.len()
            );
            state.residency = Residency::Partial(gates);
            Ok(LoadStatus::Partial)
        }
    }

    fn unavailable(&self) -> GateError {
        GateError::StateUnavailable(format!("gates of {} are not loaded", self.run))
    }

    pub async fn add(&self, gate: Arc<StepGate>) -> Result<(), GateError> {
        let mut state = self.state.lock().await;
        self.load(&mut state).await?;

        let id = gate.id().to_string();
        state.gates_mut().ok_or_else(|| self.unavailable())?.push(gate);
        state.ids.push(id.clone());

        if let Err(e) = self.store.save_gate_ids(&self.run, &state.ids).await {
            state.ids.pop();
            if let Some(gates) = state.gates_mut() {
                gates.pop();
            }
            return Err(e.into());
        }

        debug!(gate = %id, "registered in {}", self.run);
        Ok(())
    }

    /// Remove `gate`. Returns `false` when it was not registered.
    pub async fn remove(&self, gate: &StepGate) -> Result<bool, GateError> {
        let mut state = self.state.lock().await;
        self.load(&mut state).await?;

        let gates = state.gates_mut().ok_or_else(|| self.unavailable())?;
        let Some(index) = gates.iter().position(|g| std::ptr::eq(Arc::as_ptr(g), gate)) else {
            return Ok(false);
        };
        gates.remove(index);

        if let Some(pos) = state.ids.iter().position(|id| id.as_str() == gate.id()) {
            state.ids.remove(pos);
        }

        if let Err(e) = self.store.save_gate_ids(&self.run, &state.ids).await {
            warn!(gate = %gate.id(), "Failed to persist gate ids of {}: {}", self.run, e);
        }

        debug!(gate = %gate.id(), "removed from {}", self.run);
        Ok(true)
    }

    pub async fn find(&self, id: &str) -> Result<Option<Arc<StepGate>>, GateError> {
        let mut state = self.state.lock().await;
        self.load(&mut state).await?;
        Ok(state
            .gates()
            .and_then(|gates| gates.iter().find(|g| g.id() == id).cloned()))
    }

    pub async fn list(&self) -> Result<Vec<Arc<StepGate>>, GateError> {
        let mut state = self.state.lock().await;
        self.load(&mut state).await?;
        Ok(state.gates().cloned().unwrap_or_default())
    }
}

impl std::fmt::Debug for GateRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GateRegistry")
            .field("run", &self.run)
            .field("load_timeout", &self.load_timeout)
            .finish()
    }
}
