//! # Deploy Gate
//!
//! Approval gates for paused pipeline steps. A gate suspends a running
//! workflow until an external decision arrives, then resumes it exactly once
//! with success or failure.
//!
//! ## Lifecycle
//!
//! - **pending** - the gate is open and reachable by id
//! - **submitted** - the deployment system accepted a deploy request
//! - **deployed** - the deployment system reported completion (terminal)
//! - **aborted** - a user, the engine, bad parameters or a refused deploy
//!   request ended the gate (terminal)
//!
//! Lifecycle notices (`ready`, `submitted`, `success`, `abort`) are posted to
//! the notice callback on a background worker pool and never hold up a
//! transition.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use deploy_gate::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = GateConfig::load("gate.yaml")?;
//!     let services = Arc::new(GateServices::from_config(
//!         config,
//!         tokio::runtime::Handle::current(),
//!     )?);
//!
//!     let info = RunInfo::new(42, "team/app");
//!     let run = MemoryRun::new();
//!     let registry = Arc::new(services.registry(info.clone(), MemoryRunStore::new()));
//!     let handle = Arc::new(RunHandle::new(info, run.clone(), run, registry));
//!
//!     let step = DeployStep::new("Release to production?").with_submitter("release-managers");
//!     let gate = StepGate::new(step, "12", handle, MemoryContext::new(), services);
//!     gate.open().await?;
//!
//!     let manager = Principal::new("alice").with_authorities(["release-managers"]);
//!     let state = gate.abort(&manager, None, true).await?;
//!     println!("gate {} is {}", gate.id(), state);
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod callback;
pub mod gate;
pub mod host;
pub mod pipeline;

// Re-export main types
pub use api::{router, ApiError, ApiState, Caller, GateView, RunTable};
pub use callback::{
    CallbackClient, CallbackError, CallbackResponse, GateDescriptor, Identity, NoticeQueue,
    NoticeType, NotificationDispatcher,
};
pub use gate::{
    AccessControl, FlowInterrupted, GateError, GateRegistry, GateServices, GateState, IdStrategy,
    InterruptionCause, LoadStatus, Outcome, Permission, PermissionEvaluator, Principal,
    StaticAccessControl, StepGate, WorkerPool,
};
pub use host::{
    BuildLog, ExecutionLocator, HostError, JsonRunStore, MarkerKind, MemoryContext, MemoryLocator,
    MemoryRun, MemoryRunStore, Resumption, RunAnnotator, RunHandle, RunInfo, RunMarker, RunStore,
    Suspendable,
};
pub use pipeline::{
    ConfigError, DeployRequest, DeployStep, GateConfig, HttpConfig, ParameterDefinition, Params,
};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::api::{router, ApiError, ApiState, Caller, GateView, RunTable};
    pub use crate::callback::{Identity, NoticeType, NotificationDispatcher};
    pub use crate::gate::{
        AccessControl, FlowInterrupted, GateError, GateRegistry, GateServices, GateState,
        InterruptionCause, LoadStatus, Outcome, Principal, StaticAccessControl, StepGate,
    };
    pub use crate::host::{
        ExecutionLocator, JsonRunStore, MemoryContext, MemoryLocator, MemoryRun, MemoryRunStore,
        Resumption, RunHandle, RunInfo, RunMarker, RunStore, Suspendable,
    };
    pub use crate::pipeline::{
        DeployRequest, DeployStep, GateConfig, HttpConfig, ParameterDefinition, Params,
    };
}
