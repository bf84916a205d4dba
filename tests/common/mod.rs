#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use deploy_gate::prelude::*;
use serde_json::{json, Value};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

pub const DEPLOY_PATH: &str =
    "/api/v1/kubernetes/tenants/t1/projects/p1/leoapps/a1/tpls/tpl1/clusters/dev/deploy";
pub const NOTICE_PATH: &str = "/notice";
pub const RESUME_TIMEOUT: Duration = Duration::from_secs(2);

/// A run with one registry, backed by a mock deployment and notice server
pub struct Harness {
    pub server: MockServer,
    pub services: Arc<GateServices>,
    pub store: Arc<MemoryRunStore>,
    pub info: RunInfo,
    pub run: Arc<MemoryRun>,
    pub handle: Arc<RunHandle>,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_access(StaticAccessControl::unsecured()).await
    }

    pub async fn with_access(access: StaticAccessControl) -> Self {
        Self::build(access, |_| {}).await
    }

    pub async fn build<F>(access: StaticAccessControl, configure: F) -> Self
    where
        F: FnOnce(&mut GateConfig),
    {
        let server = MockServer::start().await;

        let mut config = GateConfig {
            deploy_callback: server.uri(),
            notice_callback: format!("{}{}", server.uri(), NOTICE_PATH),
            http: HttpConfig {
                connect_timeout_ms: 500,
                request_timeout_ms: 2000,
                max_attempts: 1,
                ..Default::default()
            },
            ..Default::default()
        };
        configure(&mut config);

        let services = Arc::new(
            GateServices::new(config, Arc::new(access), tokio::runtime::Handle::current())
                .expect("Failed to create gate services"),
        );

        let store = MemoryRunStore::new();
        let info = RunInfo::new(7, "team/app");
        let run = MemoryRun::new();
        let registry = Arc::new(services.registry(info.clone(), store.clone()));
        let handle = Arc::new(RunHandle::new(
            info.clone(),
            run.clone(),
            run.clone(),
            registry,
        ));

        Self {
            server,
            services,
            store,
            info,
            run,
            handle,
        }
    }

    pub async fn mount_deploy(&self, template: ResponseTemplate, expected: u64) {
        Mock::given(method("POST"))
            .and(path(DEPLOY_PATH))
            .respond_with(template)
            .expect(expected)
            .mount(&self.server)
            .await;
    }

    pub async fn accept_deploys(&self, expected: u64) {
        self.mount_deploy(
            ResponseTemplate::new(200).set_body_json(json!({"rtnCode": "000000"})),
            expected,
        )
        .await;
    }

    pub async fn mount_notices(&self) {
        Mock::given(method("POST"))
            .and(path(NOTICE_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"rtnCode": "000000"})))
            .mount(&self.server)
            .await;
    }

    /// Create a gate on node `node_id` without opening it
    pub fn gate(&self, step: DeployStep, node_id: &str) -> (Arc<StepGate>, Arc<MemoryContext>) {
        let context = MemoryContext::new();
        let gate = StepGate::new(
            step,
            node_id,
            Arc::clone(&self.handle),
            context.clone(),
            Arc::clone(&self.services),
        );
        (gate, context)
    }

    pub async fn open(&self, step: DeployStep) -> (Arc<StepGate>, Arc<MemoryContext>) {
        let (gate, context) = self.gate(step, "12");
        gate.open().await.expect("Failed to open gate");
        (gate, context)
    }

    pub async fn requests_to(&self, target: &str) -> Vec<Request> {
        self.server
            .received_requests()
            .await
            .unwrap_or_default()
            .into_iter()
            .filter(|r| r.url.path() == target)
            .collect()
    }

    /// `type` of every notice received, in arrival order
    pub async fn notice_types(&self) -> Vec<String> {
        self.requests_to(NOTICE_PATH)
            .await
            .iter()
            .filter_map(|r| serde_json::from_slice::<Value>(&r.body).ok())
            .filter_map(|body| body["type"].as_str().map(str::to_string))
            .collect()
    }
}

pub fn deploy_params() -> Params {
    [
        ("deploy", json!("true")),
        ("tenantId", json!("t1")),
        ("projectId", json!("p1")),
        ("appId", json!("a1")),
        ("tplId", json!("tpl1")),
        ("env", json!("dev")),
        ("userId", json!("42")),
        ("userName", json!("alice")),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect()
}

pub fn user(name: &str) -> Principal {
    Principal::new(name)
}

/// The failure a context was resumed with
pub async fn resumed_failure(context: &MemoryContext) -> FlowInterrupted {
    match context.wait_resumed(RESUME_TIMEOUT).await {
        Some(Resumption::Failure(failure)) => failure,
        other => panic!("expected a failure resumption, got {:?}", other),
    }
}
