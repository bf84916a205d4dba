//! Deploy gates
//!
//! This module contains:
//! - `execution` - The `StepGate` state machine and the services it shares
//! - `registry` - Per-run registry of open gates with lazy reconciliation
//! - `outcome` - Tagged outcome of a gate and the failures it resumes with
//! - `permission` - Who may settle or cancel a gate
//! - `pool` - Bounded background workers for notices and deferred aborts
//! - `error` - Errors surfaced to callers

pub mod error;
pub mod execution;
pub mod outcome;
pub mod permission;
pub mod pool;
pub mod registry;

pub use error::GateError;
pub use execution::{GateServices, StepGate, PAUSE_LABEL};
pub use outcome::{FlowInterrupted, GateState, InterruptionCause, Outcome};
pub use permission::{
    AccessControl, IdStrategy, JobGrants, Permission, PermissionEvaluator, Principal,
    StaticAccessControl, SYSTEM_NAME,
};
pub use pool::{WorkerPool, DEFAULT_WORKERS};
pub use registry::{GateRegistry, LoadStatus, DEFAULT_LOAD_TIMEOUT};
