//! Gate configuration
//!
//! Loaded from YAML; every field has a default so an empty file is valid.
//!
//! ```yaml
//! deploy_callback: "http://deployer.internal"
//! notice_callback: "http://notifier.internal/notice"
//! load_executions_timeout_secs: 60
//! http:
//!   connect_timeout_ms: 3000
//!   request_timeout_ms: 60000
//! security:
//!   use_security: true
//!   admins: [root]
//!   deployers: [deploy-bot]
//!   jobs:
//!     "team/app":
//!       build: [developers]
//!       cancel: [oncall]
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use handlebars::Handlebars;
use serde::{Deserialize, Serialize};

use super::request::DeployRequest;
use crate::gate::permission::StaticAccessControl;
use crate::gate::pool::DEFAULT_WORKERS;

pub const DEPLOY_CALLBACK_ENV: &str = "DEPLOY_GATE_DEPLOY_CALLBACK";
pub const NOTICE_CALLBACK_ENV: &str = "DEPLOY_GATE_NOTICE_CALLBACK";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parse error in {file}: {error}")]
    Yaml {
        file: String,
        error: serde_yaml::Error,
    },

    #[error("Deploy callback is not configured")]
    DeployCallbackMissing,

    #[error("Template error: {0}")]
    Template(String),
}

/// Outbound HTTP pool policy shared by every gate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,

    #[serde(default = "default_pool_max_idle")]
    pub pool_max_idle_per_host: usize,

    /// Attempts per request, first one included. Only failures to connect are retried.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_retry_initial_delay")]
    pub retry_initial_delay_ms: u64,

    #[serde(default = "default_retry_max_delay")]
    pub retry_max_delay_ms: u64,
}

fn default_connect_timeout() -> u64 {
    3000
}

fn default_request_timeout() -> u64 {
    60000
}

fn default_pool_max_idle() -> usize {
    150
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_initial_delay() -> u64 {
    200
}

fn default_retry_max_delay() -> u64 {
    2000
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout(),
            request_timeout_ms: default_request_timeout(),
            pool_max_idle_per_host: default_pool_max_idle(),
            max_attempts: default_max_attempts(),
            retry_initial_delay_ms: default_retry_initial_delay(),
            retry_max_delay_ms: default_retry_max_delay(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateConfig {
    /// Base URL of the deployment system. Empty means not configured.
    #[serde(default)]
    pub deploy_callback: String,

    /// Path appended to `deploy_callback`, rendered with the deploy request fields
    #[serde(default = "default_deploy_path")]
    pub deploy_path: String,

    /// Lifecycle notice endpoint. Empty disables notices.
    #[serde(default)]
    pub notice_callback: String,

    /// How long registry reconciliation waits for the engine after a restart
    #[serde(default = "default_load_timeout")]
    pub load_executions_timeout_secs: u64,

    #[serde(default = "default_notice_workers")]
    pub notice_workers: usize,

    /// Where the sandbox server persists gate ids; in memory when absent
    #[serde(default)]
    pub state_dir: Option<PathBuf>,

    #[serde(default)]
    pub http: HttpConfig,

    #[serde(default)]
    pub security: StaticAccessControl,
}

fn default_deploy_path() -> String {
    "/api/v1/kubernetes/tenants/{{tenantId}}/projects/{{projectId}}/leoapps/{{appId}}/tpls/{{tplId}}/clusters/{{env}}/deploy".to_string()
}

fn default_load_timeout() -> u64 {
    60
}

fn default_notice_workers() -> usize {
    DEFAULT_WORKERS
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            deploy_callback: String::new(),
            deploy_path: default_deploy_path(),
            notice_callback: String::new(),
            load_executions_timeout_secs: default_load_timeout(),
            notice_workers: default_notice_workers(),
            state_dir: None,
            http: HttpConfig::default(),
            security: StaticAccessControl::default(),
        }
    }
}

impl GateConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content).map_err(|error| ConfigError::Yaml {
            file: path.display().to_string(),
            error,
        })
    }

    pub fn from_yaml(content: &str) -> Result<Self, serde_yaml::Error> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(content)
    }

    /// Apply `DEPLOY_GATE_*` environment overrides
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(url) = std::env::var(DEPLOY_CALLBACK_ENV) {
            self.deploy_callback = url;
        }
        if let Ok(url) = std::env::var(NOTICE_CALLBACK_ENV) {
            self.notice_callback = url;
        }
        self
    }

    pub fn load_executions_timeout(&self) -> Duration {
        Duration::from_secs(self.load_executions_timeout_secs)
    }

    /// Full deploy URL for `request`
    pub fn deploy_url(&self, request: &DeployRequest) -> Result<String, ConfigError> {
        let base = self.deploy_callback.trim().trim_end_matches('/');
        if base.is_empty() {
            return Err(ConfigError::DeployCallbackMissing);
        }

        let mut templates = Handlebars::new();
        templates.register_escape_fn(handlebars::no_escape);
        templates.set_strict_mode(true);
        let path = templates
            .render_template(&self.deploy_path, request)
            .map_err(|e| ConfigError::Template(e.to_string()))?;

        if path.starts_with('/') {
            Ok(format!("{}{}", base, path))
        } else {
            Ok(format!("{}/{}", base, path))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> DeployRequest {
        DeployRequest {
            tenant_id: "t1".into(),
            project_id: "p1".into(),
            app_id: "a1".into(),
            tpl_id: "tpl1".into(),
            env: "dev".into(),
            user_id: "42".into(),
            user_name: "alice".into(),
            node_id: "17".into(),
        }
    }

    #[test]
    fn test_default_config() {
        let config = GateConfig::default();
        assert!(config.deploy_callback.is_empty());
        assert!(config.notice_callback.is_empty());
        assert_eq!(config.load_executions_timeout(), Duration::from_secs(60));
        assert_eq!(config.http.max_attempts, 3);
        assert!(config.security.use_security);
    }

    #[test]
    fn test_empty_yaml_is_default() {
        let config = GateConfig::from_yaml("").unwrap();
        assert_eq!(config.deploy_path, default_deploy_path());
    }

    #[test]
    fn test_deploy_url() {
        let config = GateConfig {
            deploy_callback: "http://deployer.internal/".into(),
            ..Default::default()
        };
        assert_eq!(
            config.deploy_url(&request()).unwrap(),
            "http://deployer.internal/api/v1/kubernetes/tenants/t1/projects/p1/leoapps/a1/tpls/tpl1/clusters/dev/deploy"
        );
    }

    #[test]
    fn test_deploy_url_not_escaped() {
        let mut req = request();
        req.env = "a&b".into();
        let config = GateConfig {
            deploy_callback: "http://d".into(),
            deploy_path: "deploy/{{env}}".into(),
            ..Default::default()
        };
        assert_eq!(config.deploy_url(&req).unwrap(), "http://d/deploy/a&b");
    }

    #[test]
    fn test_deploy_url_requires_callback() {
        let config = GateConfig::default();
        assert!(matches!(
            config.deploy_url(&request()),
            Err(ConfigError::DeployCallbackMissing)
        ));
    }

    #[test]
    fn test_unknown_template_field() {
        let config = GateConfig {
            deploy_callback: "http://d".into(),
            deploy_path: "/{{cluster}}".into(),
            ..Default::default()
        };
        assert!(matches!(
            config.deploy_url(&request()),
            Err(ConfigError::Template(_))
        ));
    }
}
