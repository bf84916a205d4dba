//! Gates without a pipeline engine
//!
//! The sandbox plays the engine's part for in-memory runs: it opens gates on
//! request and records how each gate resumed its node, so the deployment and
//! notice integrations can be exercised end to end.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::info;

use super::{ApiError, GateView, RunTable};
use crate::gate::{GateError, GateServices, StepGate};
use crate::host::{MemoryContext, MemoryRun, Resumption, RunHandle, RunInfo, RunStore};
use crate::pipeline::DeployStep;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenGateRequest {
    /// Flow node the gate pauses; numbered by the sandbox when absent
    #[serde(default)]
    pub node_id: Option<String>,
    #[serde(default)]
    pub step: DeployStep,
}

/// How a sandbox node was resumed
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumptionView {
    pub resumed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

impl ResumptionView {
    fn of(resumption: Option<Resumption>) -> Self {
        match resumption {
            None => Self {
                resumed: false,
                success: None,
                value: None,
                failure: None,
            },
            Some(Resumption::Success(value)) => Self {
                resumed: true,
                success: Some(true),
                value,
                failure: None,
            },
            Some(Resumption::Failure(failure)) => Self {
                resumed: true,
                success: Some(false),
                value: None,
                failure: Some(failure.to_string()),
            },
        }
    }
}

pub struct Sandbox {
    services: Arc<GateServices>,
    store: Arc<dyn RunStore>,
    runs: Arc<RunTable>,
    nodes: Mutex<HashMap<String, Arc<MemoryContext>>>,
}

impl Sandbox {
    pub fn new(services: Arc<GateServices>, store: Arc<dyn RunStore>, runs: Arc<RunTable>) -> Self {
        Self {
            services,
            store,
            runs,
            nodes: Mutex::new(HashMap::new()),
        }
    }

    pub fn runs(&self) -> &Arc<RunTable> {
        &self.runs
    }

    fn node_key(run: &RunInfo, node_id: &str) -> String {
        format!("{}@{}", run.key(), node_id)
    }

    /// Open a gate in run `number` of `pipeline`, creating the run if needed
    pub async fn open_gate(
        &self,
        pipeline: &str,
        number: u64,
        request: OpenGateRequest,
    ) -> Result<Arc<StepGate>, GateError> {
        let info = RunInfo::new(number, pipeline);
        let store = Arc::clone(&self.store);
        let services = &self.services;
        let run = self
            .runs
            .get_or_insert_with(info, |info| {
                let memory = MemoryRun::new();
                let registry = Arc::new(services.registry(info.clone(), store));
                Arc::new(RunHandle::new(info, memory.clone(), memory, registry))
            })
            .await;

        let mut nodes = self.nodes.lock().await;
        let node_id = request
            .node_id
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| (nodes.len() + 1).to_string());
        let context = MemoryContext::new();

        let gate = StepGate::new(
            request.step,
            node_id.clone(),
            Arc::clone(&run),
            context.clone(),
            Arc::clone(&self.services),
        );
        gate.open().await?;
        nodes.insert(Self::node_key(&run.info, &node_id), context);

        info!(gate = %gate.id(), run = %run.info, "sandbox gate opened on node {}", node_id);
        Ok(gate)
    }

    /// How the node paused by a gate was resumed, if it is known
    pub async fn resumption(&self, pipeline: &str, number: u64, node_id: &str) -> Option<ResumptionView> {
        let key = Self::node_key(&RunInfo::new(number, pipeline), node_id);
        let context = self.nodes.lock().await.get(&key).cloned()?;
        Some(ResumptionView::of(context.resumptions().into_iter().next()))
    }
}

pub fn router(sandbox: Arc<Sandbox>) -> Router {
    Router::new()
        .route("/sandbox/pipelines/{pipeline}/runs/{number}/gates", post(open_gate))
        .route(
            "/sandbox/pipelines/{pipeline}/runs/{number}/nodes/{node}",
            get(node_resumption),
        )
        .with_state(sandbox)
}

async fn open_gate(
    State(sandbox): State<Arc<Sandbox>>,
    Path((pipeline, number)): Path<(String, u64)>,
    body: Bytes,
) -> Result<(StatusCode, Json<GateView>), ApiError> {
    let request = match super::parse_body(&body)? {
        Value::Null => OpenGateRequest::default(),
        value => serde_json::from_value(value).map_err(|e| ApiError::BadBody(e.to_string()))?,
    };
    let gate = sandbox.open_gate(&pipeline, number, request).await?;
    Ok((StatusCode::CREATED, Json(GateView::of(&gate).await)))
}

async fn node_resumption(
    State(sandbox): State<Arc<Sandbox>>,
    Path((pipeline, number, node)): Path<(String, u64, String)>,
) -> Result<Json<ResumptionView>, ApiError> {
    sandbox
        .resumption(&pipeline, number, &node)
        .await
        .map(Json)
        .ok_or_else(|| ApiError::Gate(GateError::NotFound(format!("node {}", node))))
}
