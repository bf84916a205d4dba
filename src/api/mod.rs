//! HTTP surface of the gates
//!
//! This module contains:
//! - the gate router: listing gates of a run and the inbound operations
//!   (`submit`, `proceed`, `proceedEmpty`, `abort`, `success`, `failure`)
//! - `sandbox` - routes that open gates without a pipeline engine
//!
//! Gates are addressed as `/pipelines/{pipeline}/runs/{number}/deploy/{gate}`,
//! with the pipeline's full name percent-encoded. Callers are identified by
//! the `X-Forwarded-User` and `X-Forwarded-Groups` headers set by the
//! authenticating proxy; mutating routes are POST only.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{FromRequestParts, Path, State},
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::RwLock;

use crate::gate::{GateError, GateState, Principal, StepGate};
use crate::host::{RunHandle, RunInfo};
use crate::pipeline::{ParameterDefinition, Params};

pub mod sandbox;

pub const USER_HEADER: &str = "x-forwarded-user";
pub const GROUPS_HEADER: &str = "x-forwarded-groups";

/// Live runs reachable through the API, by run key
#[derive(Default)]
pub struct RunTable {
    runs: RwLock<HashMap<String, Arc<RunHandle>>>,
}

impl RunTable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn insert(&self, run: Arc<RunHandle>) {
        self.runs.write().await.insert(run.info.key(), run);
    }

    pub async fn get(&self, pipeline: &str, number: u64) -> Option<Arc<RunHandle>> {
        let key = RunInfo::new(number, pipeline).key();
        self.runs.read().await.get(&key).cloned()
    }

    /// The run for `info`, created with `make` when unknown
    pub async fn get_or_insert_with<F>(&self, info: RunInfo, make: F) -> Arc<RunHandle>
    where
        F: FnOnce(RunInfo) -> Arc<RunHandle>,
    {
        let mut runs = self.runs.write().await;
        Arc::clone(runs.entry(info.key()).or_insert_with(|| make(info)))
    }

    pub async fn len(&self) -> usize {
        self.runs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.runs.read().await.is_empty()
    }
}

#[derive(Clone)]
pub struct ApiState {
    runs: Arc<RunTable>,
}

impl ApiState {
    pub fn new(runs: Arc<RunTable>) -> Self {
        Self { runs }
    }

    async fn run(&self, pipeline: &str, number: u64) -> Result<Arc<RunHandle>, ApiError> {
        self.runs.get(pipeline, number).await.ok_or_else(|| {
            ApiError::Gate(GateError::NotFound(format!("run {} #{}", pipeline, number)))
        })
    }

    async fn gate(&self, pipeline: &str, number: u64, id: &str) -> Result<Arc<StepGate>, ApiError> {
        let run = self.run(pipeline, number).await?;
        run.registry
            .find(id)
            .await?
            .ok_or_else(|| ApiError::Gate(GateError::NotFound(id.to_string())))
    }
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/pipelines/{pipeline}/runs/{number}/deploy", get(list_gates))
        .route(
            "/pipelines/{pipeline}/runs/{number}/deploy/{gate}",
            get(show_gate),
        )
        .route(
            "/pipelines/{pipeline}/runs/{number}/deploy/{gate}/submit",
            post(submit),
        )
        .route(
            "/pipelines/{pipeline}/runs/{number}/deploy/{gate}/proceed",
            post(proceed),
        )
        .route(
            "/pipelines/{pipeline}/runs/{number}/deploy/{gate}/proceedEmpty",
            post(proceed_empty),
        )
        .route(
            "/pipelines/{pipeline}/runs/{number}/deploy/{gate}/abort",
            post(abort),
        )
        .route(
            "/pipelines/{pipeline}/runs/{number}/deploy/{gate}/success",
            post(success),
        )
        .route(
            "/pipelines/{pipeline}/runs/{number}/deploy/{gate}/failure",
            post(failure),
        )
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

fn header<'a>(parts: &'a Parts, name: &str) -> Option<&'a str> {
    parts
        .headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Authenticated caller of a route
#[derive(Debug, Clone)]
pub struct Caller(pub Principal);

impl<S> FromRequestParts<S> for Caller
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let user = header(parts, USER_HEADER).ok_or(ApiError::Unauthorized)?;
        let groups: Vec<String> = header(parts, GROUPS_HEADER)
            .map(|g| {
                g.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        Ok(Caller(Principal::new(user).with_authorities(groups)))
    }
}

/// What the API shows of a gate
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GateView {
    pub id: String,
    pub node_id: String,
    pub message: String,
    pub display_name: String,
    pub ok: String,
    pub submitter: Option<String>,
    pub submitter_parameter: Option<String>,
    pub parameters: Vec<ParameterDefinition>,
    pub state: GateState,
}

impl GateView {
    pub async fn of(gate: &StepGate) -> Self {
        let step = gate.step();
        Self {
            id: gate.id().to_string(),
            node_id: gate.node_id().to_string(),
            message: step.message().to_string(),
            display_name: gate.display_name(),
            ok: step.ok().to_string(),
            submitter: step.submitter().map(str::to_string),
            submitter_parameter: step.submitter_parameter().map(str::to_string),
            parameters: step.parameters().to_vec(),
            state: gate.state().await,
        }
    }
}

fn transition(gate: &StepGate, state: GateState) -> Json<Value> {
    Json(json!({ "gate": gate.id(), "state": state }))
}

fn parse_body(body: &Bytes) -> Result<Value, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Value::Null);
    }
    serde_json::from_slice(body).map_err(|e| ApiError::BadBody(e.to_string()))
}

fn parse_params(body: &Bytes) -> Result<Option<Params>, ApiError> {
    match parse_body(body)? {
        Value::Null => Ok(None),
        Value::Object(map) if map.is_empty() => Ok(None),
        Value::Object(map) => Ok(Some(map.into_iter().collect())),
        other => Err(ApiError::BadBody(format!(
            "expected a JSON object, got {}",
            other
        ))),
    }
}

async fn list_gates(
    State(st): State<ApiState>,
    Path((pipeline, number)): Path<(String, u64)>,
) -> Result<Json<Vec<GateView>>, ApiError> {
    let run = st.run(&pipeline, number).await?;
    let mut views = Vec::new();
    for gate in run.registry.list().await? {
        views.push(GateView::of(&gate).await);
    }
    Ok(Json(views))
}

async fn show_gate(
    State(st): State<ApiState>,
    Path((pipeline, number, id)): Path<(String, u64, String)>,
) -> Result<Json<GateView>, ApiError> {
    let gate = st.gate(&pipeline, number, &id).await?;
    Ok(Json(GateView::of(&gate).await))
}

async fn submit(
    State(st): State<ApiState>,
    Path((pipeline, number, id)): Path<(String, u64, String)>,
    Caller(principal): Caller,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let gate = st.gate(&pipeline, number, &id).await?;
    let form = parse_body(&body)?;
    let state = gate.submit(&principal, &form).await?;
    Ok(transition(&gate, state))
}

async fn proceed(
    State(st): State<ApiState>,
    Path((pipeline, number, id)): Path<(String, u64, String)>,
    Caller(principal): Caller,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let gate = st.gate(&pipeline, number, &id).await?;
    let form = parse_body(&body)?;
    let state = gate.proceed_form(&principal, &form).await?;
    Ok(transition(&gate, state))
}

async fn proceed_empty(
    State(st): State<ApiState>,
    Path((pipeline, number, id)): Path<(String, u64, String)>,
    Caller(principal): Caller,
) -> Result<Json<Value>, ApiError> {
    let gate = st.gate(&pipeline, number, &id).await?;
    let state = gate.proceed_empty(&principal).await?;
    Ok(transition(&gate, state))
}

async fn abort(
    State(st): State<ApiState>,
    Path((pipeline, number, id)): Path<(String, u64, String)>,
    Caller(principal): Caller,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let gate = st.gate(&pipeline, number, &id).await?;
    let params = parse_params(&body)?;
    let state = gate.abort(&principal, params, true).await?;
    Ok(transition(&gate, state))
}

async fn success(
    State(st): State<ApiState>,
    Path((pipeline, number, id)): Path<(String, u64, String)>,
    Caller(principal): Caller,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let gate = st.gate(&pipeline, number, &id).await?;
    let params = parse_params(&body)?;
    let state = gate.confirm_success(&principal, params).await?;
    Ok(transition(&gate, state))
}

async fn failure(
    State(st): State<ApiState>,
    Path((pipeline, number, id)): Path<(String, u64, String)>,
    Caller(principal): Caller,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let gate = st.gate(&pipeline, number, &id).await?;
    let params = parse_params(&body)?;
    let state = gate.report_failure(&principal, params).await?;
    Ok(transition(&gate, state))
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Gate(#[from] GateError),

    #[error("Missing caller identity")]
    Unauthorized,

    #[error("Malformed request body: {0}")]
    BadBody(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::BadBody(_) => StatusCode::BAD_REQUEST,
            ApiError::Gate(e) => match e {
                GateError::PermissionDenied(_) => StatusCode::FORBIDDEN,
                GateError::AlreadySettled { .. } | GateError::NotSubmitted(_) => {
                    StatusCode::CONFLICT
                }
                GateError::ReleaseInFlight(_) => StatusCode::LOCKED,
                GateError::InvalidParameters(_) | GateError::UnknownParameter(_) => {
                    StatusCode::BAD_REQUEST
                }
                GateError::NotFound(_) => StatusCode::NOT_FOUND,
                GateError::StateUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
                GateError::Host(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            ApiError::Gate(e) => e.kind(),
            ApiError::Unauthorized => "unauthorized",
            ApiError::BadBody(_) => "bad_body",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        } else {
            tracing::debug!(error = %self, "request rejected");
        }
        let body = Json(json!({
            "error": self.kind(),
            "message": self.to_string(),
        }));
        (status, body).into_response()
    }
}
