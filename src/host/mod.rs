//! Contracts with the workflow engine hosting the gates
//!
//! The gate core never talks to an engine directly. It sees the engine through
//! these narrow traits:
//! - `Suspendable` - the paused flow node: pause, end the pause, resume once
//! - `RunAnnotator` - lightweight markers attached to the owning run
//! - `BuildLog` - the run's console
//! - `RunStore` - durable record of the gate ids of a run
//! - `ExecutionLocator` - live suspended gates of a run, used after a restart
//!
//! `memory` implements all of them in process; `file_store` keeps gate ids on
//! disk.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::gate::execution::StepGate;
use crate::gate::outcome::FlowInterrupted;
use crate::gate::registry::GateRegistry;

pub mod file_store;
pub mod memory;

pub use file_store::JsonRunStore;
pub use memory::{MemoryContext, MemoryLocator, MemoryRun, MemoryRunStore, Resumption};

#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Engine error: {0}")]
    Engine(String),
}

/// Identity of the run owning a set of gates
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunInfo {
    pub number: u64,
    /// Last segment of the pipeline's full name
    pub pipeline_name: String,
    pub pipeline_full_name: String,
    /// Full name of the folder containing the pipeline, empty at top level
    pub devops_id: String,
    /// Run page, relative to the server root, with a trailing slash
    pub url: String,
}

impl RunInfo {
    pub fn new(number: u64, pipeline_full_name: impl Into<String>) -> Self {
        let full_name = pipeline_full_name.into();
        let (devops_id, pipeline_name) = match full_name.rsplit_once('/') {
            Some((parent, name)) => (parent.to_string(), name.to_string()),
            None => (String::new(), full_name.clone()),
        };
        let url = format!("pipelines/{}/runs/{}/", raw_encode(&full_name), number);

        Self {
            number,
            pipeline_name,
            pipeline_full_name: full_name,
            devops_id,
            url,
        }
    }

    /// Stable key of the run, unique across pipelines
    pub fn key(&self) -> String {
        format!("{}#{}", self.pipeline_full_name, self.number)
    }
}

impl std::fmt::Display for RunInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} #{}", self.pipeline_full_name, self.number)
    }
}

/// Everything but RFC 3986 unreserved characters
const RAW: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Percent-encode everything but unreserved characters
pub fn raw_encode(text: &str) -> String {
    utf8_percent_encode(text, RAW).to_string()
}

/// Marker records attached to a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunMarker {
    ApprovedBy {
        user_id: String,
    },
    /// A release requested by this gate is in flight
    Deploying {
        gate_id: String,
    },
    DeploySubmitted {
        gate_id: String,
        approver: Option<String>,
        parameters: Option<Value>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MarkerKind {
    ApprovedBy,
    Deploying,
    DeploySubmitted,
}

impl RunMarker {
    pub fn kind(&self) -> MarkerKind {
        match self {
            RunMarker::ApprovedBy { .. } => MarkerKind::ApprovedBy,
            RunMarker::Deploying { .. } => MarkerKind::Deploying,
            RunMarker::DeploySubmitted { .. } => MarkerKind::DeploySubmitted,
        }
    }

    pub fn gate_id(&self) -> Option<&str> {
        match self {
            RunMarker::ApprovedBy { .. } => None,
            RunMarker::Deploying { gate_id } | RunMarker::DeploySubmitted { gate_id, .. } => {
                Some(gate_id)
            }
        }
    }
}

/// The suspended flow node a gate resumes
pub trait Suspendable: Send + Sync {
    /// Mark the node as paused
    fn pause(&self, label: &str) -> Result<(), HostError>;

    fn end_pause(&self) -> Result<(), HostError>;

    /// Resume the workflow successfully. Called at most once.
    fn on_success(&self, value: Option<Value>);

    /// Resume the workflow with a failure. Called at most once.
    fn on_failure(&self, failure: FlowInterrupted);
}

pub trait RunAnnotator: Send + Sync {
    fn add_marker(&self, marker: RunMarker);

    /// Remove markers of `kind` that belong to `gate_id`
    fn remove_marker(&self, kind: MarkerKind, gate_id: &str);
}

pub trait BuildLog: Send + Sync {
    fn println(&self, line: &str);
}

#[async_trait]
pub trait RunStore: Send + Sync {
    async fn save_gate_ids(&self, run: &RunInfo, ids: &[String]) -> Result<(), HostError>;

    /// Ids on record for `run`, empty when there is no record
    async fn load_gate_ids(&self, run: &RunInfo) -> Result<Vec<String>, HostError>;
}

#[async_trait]
pub trait ExecutionLocator: Send + Sync {
    /// Gates currently suspended in `run`. `None` when the run has no live
    /// flow execution.
    async fn suspended_gates(&self, run: &RunInfo) -> Result<Option<Vec<Arc<StepGate>>>, HostError>;
}

/// Everything a gate needs from the run that owns it
pub struct RunHandle {
    pub info: RunInfo,
    pub annotator: Arc<dyn RunAnnotator>,
    pub log: Arc<dyn BuildLog>,
    pub registry: Arc<GateRegistry>,
}

impl RunHandle {
    pub fn new(
        info: RunInfo,
        annotator: Arc<dyn RunAnnotator>,
        log: Arc<dyn BuildLog>,
        registry: Arc<GateRegistry>,
    ) -> Self {
        Self {
            info,
            annotator,
            log,
            registry,
        }
    }

    /// Job name used for permission checks
    pub fn job(&self) -> &str {
        &self.info.pipeline_full_name
    }
}

impl std::fmt::Debug for RunHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunHandle").field("info", &self.info).finish()
    }
}
