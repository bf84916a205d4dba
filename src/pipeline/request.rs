//! Submitted parameters and the deploy request extracted from them

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::callback::Identity;
use crate::gate::error::GateError;

/// Parameters submitted to a gate, by name
pub type Params = HashMap<String, Value>;

/// A non-empty value under this key marks a phase-1 deploy request
pub const DEPLOY_FIELD: &str = "deploy";

/// Whether `params` asks for a deploy (phase 1) rather than reporting completion
pub fn is_deploy_request(params: Option<&Params>) -> bool {
    params
        .and_then(|p| p.get(DEPLOY_FIELD))
        .map(|v| !text(Some(v)).is_empty())
        .unwrap_or(false)
}

/// Convert submitted parameters into the value handed back to the workflow
pub fn params_value(params: Params) -> Value {
    Value::Object(params.into_iter().collect())
}

fn text(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.trim().to_string(),
        Some(other) => other.to_string(),
    }
}

/// Fields the deployment system needs to start a release
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployRequest {
    pub tenant_id: String,
    pub project_id: String,
    pub app_id: String,
    pub tpl_id: String,
    pub env: String,
    pub user_id: String,
    pub user_name: String,
    /// Flow node the release targets
    pub node_id: String,
}

impl DeployRequest {
    pub const REQUIRED: [&'static str; 7] = [
        "tenantId",
        "projectId",
        "appId",
        "tplId",
        "env",
        "userId",
        "userName",
    ];

    /// Extract the request from submitted parameters. `node_id` is used when
    /// the submission does not name a target node.
    pub fn from_params(params: &Params, node_id: &str) -> Result<Self, GateError> {
        let missing: Vec<&str> = Self::REQUIRED
            .iter()
            .copied()
            .filter(|key| text(params.get(*key)).is_empty())
            .collect();
        if !missing.is_empty() {
            return Err(GateError::InvalidParameters(format!(
                "Params error: missing {}",
                missing.join(", ")
            )));
        }

        let field = |key: &str| text(params.get(key));
        let node = field("nodeId");

        Ok(Self {
            tenant_id: field("tenantId"),
            project_id: field("projectId"),
            app_id: field("appId"),
            tpl_id: field("tplId"),
            env: field("env"),
            user_id: field("userId"),
            user_name: field("userName"),
            node_id: if node.is_empty() {
                node_id.to_string()
            } else {
                node
            },
        })
    }

    pub fn identity(&self) -> Identity {
        Identity::new(Some(self.user_id.clone()), Some(self.user_name.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn full() -> Params {
        [
            ("deploy", json!("true")),
            ("tenantId", json!("t1")),
            ("projectId", json!("p1")),
            ("appId", json!("a1")),
            ("tplId", json!("tpl1")),
            ("env", json!("dev")),
            ("userId", json!(42)),
            ("userName", json!("alice")),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
    }

    #[test]
    fn test_extracts_all_fields() {
        let req = DeployRequest::from_params(&full(), "17").unwrap();
        assert_eq!(req.tenant_id, "t1");
        assert_eq!(req.user_id, "42");
        assert_eq!(req.node_id, "17");
    }

    #[test]
    fn test_explicit_node_id_wins() {
        let mut params = full();
        params.insert("nodeId".into(), json!("99"));
        let req = DeployRequest::from_params(&params, "17").unwrap();
        assert_eq!(req.node_id, "99");
    }

    #[test]
    fn test_missing_fields_are_listed() {
        let mut params = full();
        params.insert("projectId".into(), json!(""));
        params.remove("env");
        let err = DeployRequest::from_params(&params, "17").unwrap_err();
        match err {
            GateError::InvalidParameters(msg) => {
                assert!(msg.contains("projectId"));
                assert!(msg.contains("env"));
                assert!(!msg.contains("tenantId"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_whitespace_counts_as_empty() {
        let mut params = full();
        params.insert("tplId".into(), json!("   "));
        assert!(DeployRequest::from_params(&params, "1").is_err());
    }

    #[test]
    fn test_deploy_flag() {
        assert!(is_deploy_request(Some(&full())));
        assert!(!is_deploy_request(None));

        let mut params = full();
        params.insert(DEPLOY_FIELD.into(), json!(""));
        assert!(!is_deploy_request(Some(&params)));
        params.remove(DEPLOY_FIELD);
        assert!(!is_deploy_request(Some(&params)));
    }
}
