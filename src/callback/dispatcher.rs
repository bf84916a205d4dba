//! Best-effort callbacks
//!
//! Every call here answers with a plain `bool`. Transport errors, bad
//! statuses and rejecting `rtnCode`s are logged and reported as `false`;
//! nothing is ever raised to the gate driving the transition.

use std::sync::Arc;

use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use super::{CallbackClient, Identity, NoticeType};
use crate::pipeline::{DeployRequest, GateConfig};

/// What the external systems are told about a gate
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GateDescriptor {
    pub run_id: u64,
    pub step_id: String,
    pub node_id: String,
    pub pipeline_name: String,
    pub pipeline_full_name: String,
    /// Full name of the folder owning the pipeline, empty at top level
    pub devops_id: String,
    pub submitter: Option<String>,
}

impl GateDescriptor {
    /// Body of a notice callback
    pub fn notice_payload(&self) -> Map<String, Value> {
        let mut payload = Map::new();
        payload.insert("runId".into(), json!(self.run_id));
        payload.insert("stepId".into(), json!(self.step_id));
        payload.insert("inputId".into(), json!(self.step_id));
        payload.insert("nodeId".into(), json!(self.node_id));
        payload.insert("pipelineName".into(), json!(self.pipeline_name));
        payload.insert("pipelineFullName".into(), json!(self.pipeline_full_name));
        payload.insert("submitter".into(), json!(self.submitter));
        payload
    }

    /// Body of a deploy callback
    pub fn deploy_payload(&self, node_id: &str) -> Value {
        json!({
            "runId": self.run_id,
            "nodeId": node_id,
            "stepId": self.step_id,
            "inputId": self.step_id,
            "pipelineId": self.pipeline_name,
            "devopsId": self.devops_id,
        })
    }
}

#[derive(Debug, Clone)]
pub struct NotificationDispatcher {
    client: CallbackClient,
    config: Arc<GateConfig>,
}

impl NotificationDispatcher {
    pub fn new(client: CallbackClient, config: Arc<GateConfig>) -> Self {
        Self { client, config }
    }

    pub fn config(&self) -> &GateConfig {
        &self.config
    }

    /// POST `payload` with `type = event` to `url`.
    ///
    /// An empty `url` means "not configured" and counts as delivered.
    pub async fn notify(
        &self,
        url: &str,
        event: &str,
        payload: Map<String, Value>,
        identity: Option<&Identity>,
    ) -> bool {
        if url.trim().is_empty() {
            debug!(event, "notice callback not configured");
            return true;
        }

        let mut body = Map::with_capacity(payload.len() + 1);
        body.insert("type".into(), Value::String(event.to_string()));
        body.extend(payload);
        let body = Value::Object(body);

        match self.client.post_json(url, &body, identity).await {
            Ok(response) if response.is_accepted() => true,
            Ok(response) => {
                warn!(
                    event,
                    status = response.status,
                    rtn_code = ?response.rtn_code(),
                    "callback rejected"
                );
                false
            }
            Err(e) => {
                warn!(event, error = %e, "callback failed");
                false
            }
        }
    }

    /// Send a lifecycle notice for `gate`
    pub async fn notice(
        &self,
        event: NoticeType,
        gate: &GateDescriptor,
        identity: Option<&Identity>,
    ) -> bool {
        info!(gate = %gate.step_id, run = gate.run_id, %event, "notice");
        let url = self.config.notice_callback.clone();
        self.notify(&url, event.as_str(), gate.notice_payload(), identity)
            .await
    }

    /// Ask the deployment system to start the release. `false` on any failure,
    /// including a missing deploy callback.
    pub async fn request_deploy(&self, request: &DeployRequest, gate: &GateDescriptor) -> bool {
        let url = match self.config.deploy_url(request) {
            Ok(url) => url,
            Err(e) => {
                warn!(gate = %gate.step_id, error = %e, "cannot build deploy url");
                return false;
            }
        };

        let body = gate.deploy_payload(&request.node_id);
        info!(gate = %gate.step_id, %url, "Deploy body is {}", body);

        match self
            .client
            .post_json(&url, &body, Some(&request.identity()))
            .await
        {
            Ok(response) if response.is_accepted() => true,
            Ok(response) => {
                warn!(
                    gate = %gate.step_id,
                    status = response.status,
                    rtn_code = ?response.rtn_code(),
                    "deploy request rejected"
                );
                false
            }
            Err(e) => {
                warn!(gate = %gate.step_id, error = %e, "deploy request failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::HttpConfig;

    fn descriptor() -> GateDescriptor {
        GateDescriptor {
            run_id: 7,
            step_id: "Gate".into(),
            node_id: "12".into(),
            pipeline_name: "app".into(),
            pipeline_full_name: "team/app".into(),
            devops_id: "team".into(),
            submitter: Some("alice".into()),
        }
    }

    #[test]
    fn test_notice_payload_fields() {
        let payload = descriptor().notice_payload();
        assert_eq!(payload["runId"], json!(7));
        assert_eq!(payload["stepId"], json!("Gate"));
        assert_eq!(payload["inputId"], json!("Gate"));
        assert_eq!(payload["pipelineFullName"], json!("team/app"));
        assert_eq!(payload["submitter"], json!("alice"));
    }

    #[test]
    fn test_deploy_payload_fields() {
        let body = descriptor().deploy_payload("99");
        assert_eq!(body["nodeId"], json!("99"));
        assert_eq!(body["pipelineId"], json!("app"));
        assert_eq!(body["devopsId"], json!("team"));
    }

    #[tokio::test]
    async fn test_unconfigured_notice_is_delivered() {
        let client = CallbackClient::new(HttpConfig::default()).unwrap();
        let dispatcher = NotificationDispatcher::new(client, Arc::new(GateConfig::default()));
        assert!(
            dispatcher
                .notice(NoticeType::Ready, &descriptor(), None)
                .await
        );
    }

    #[tokio::test]
    async fn test_unconfigured_deploy_fails() {
        let client = CallbackClient::new(HttpConfig::default()).unwrap();
        let dispatcher = NotificationDispatcher::new(client, Arc::new(GateConfig::default()));
        let request = DeployRequest {
            tenant_id: "t".into(),
            project_id: "p".into(),
            app_id: "a".into(),
            tpl_id: "tpl".into(),
            env: "dev".into(),
            user_id: "1".into(),
            user_name: "alice".into(),
            node_id: "12".into(),
        };
        assert!(!dispatcher.request_deploy(&request, &descriptor()).await);
    }
}
