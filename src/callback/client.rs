//! Pooled HTTP client for callback endpoints
//!
//! One client is shared by every gate in the process. It posts JSON with
//! `Content-Type: application/json;charset=utf-8` and, when the acting user is
//! known, a `LEO-USER` identity header. Retries are limited to failures to
//! establish a connection: once a request may have reached the server it is
//! never repeated, so a deploy is never requested twice.

use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::{debug, info, warn};

use super::{CallbackError, Identity};
use crate::pipeline::HttpConfig;

pub const IDENTITY_HEADER: &str = "LEO-USER";
pub const JSON_CONTENT_TYPE: &str = "application/json;charset=utf-8";

/// `rtnCode` value the external systems use for success
pub const SUCCESS_CODE: &str = "000000";

#[derive(Debug, Clone)]
pub struct CallbackResponse {
    pub status: u16,
    pub body: Value,
    pub elapsed_ms: u64,
}

impl CallbackResponse {
    /// The `rtnCode` embedded in a JSON body, if any
    pub fn rtn_code(&self) -> Option<String> {
        match self.body.get("rtnCode")? {
            Value::String(s) => Some(s.clone()),
            Value::Null => None,
            other => Some(other.to_string()),
        }
    }

    /// HTTP 200, and `rtnCode == "000000"` when the body carries one
    pub fn is_accepted(&self) -> bool {
        self.status == 200
            && self
                .rtn_code()
                .map(|code| code == SUCCESS_CODE)
                .unwrap_or(true)
    }
}

#[derive(Debug, Clone)]
pub struct CallbackClient {
    config: HttpConfig,
    client: reqwest::Client,
}

impl CallbackClient {
    pub fn new(config: HttpConfig) -> Result<Self, CallbackError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_millis(config.connect_timeout_ms))
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .pool_max_idle_per_host(config.pool_max_idle_per_host)
            .build()
            .map_err(|e| CallbackError::ClientBuild(e.to_string()))?;

        Ok(Self { config, client })
    }

    pub fn config(&self) -> &HttpConfig {
        &self.config
    }

    fn should_retry(&self, error: &reqwest::Error, attempt: u32) -> bool {
        attempt.saturating_add(1) < self.config.max_attempts
            && error.is_connect()
            && !error.is_timeout()
    }

    /// Doubles from the initial delay, capped at the max delay
    fn retry_delay(&self, attempt: u32) -> Duration {
        let factor = 1u64
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u64::MAX);
        let delay = self.config.retry_initial_delay_ms.saturating_mul(factor);
        Duration::from_millis(delay.min(self.config.retry_max_delay_ms))
    }

    /// POST `body` to `url`. Any response counts as `Ok`, whatever its status.
    pub async fn post_json(
        &self,
        url: &str,
        body: &Value,
        identity: Option<&Identity>,
    ) -> Result<CallbackResponse, CallbackError> {
        let payload = serde_json::to_string(body)?;
        let header = identity.and_then(Identity::header_value);
        let max_attempts = self.config.max_attempts.max(1);

        let mut attempt = 0;
        loop {
            if attempt > 0 {
                let delay = self.retry_delay(attempt);
                warn!(
                    "Retrying callback (attempt {}/{}) after {:?}",
                    attempt + 1,
                    max_attempts,
                    delay
                );
                tokio::time::sleep(delay).await;
            }

            let mut request = self
                .client
                .post(url)
                .header(reqwest::header::CONTENT_TYPE, JSON_CONTENT_TYPE)
                .body(payload.clone());
            if let Some(value) = &header {
                request = request.header(IDENTITY_HEADER, value);
            }

            debug!("POST {} {}", url, payload);
            let start = Instant::now();

            match request.send().await {
                Ok(response) => {
                    let status = response.status().as_u16();
                    let text = response.text().await.unwrap_or_default();
                    let elapsed_ms = start.elapsed().as_millis() as u64;
                    let body = if text.is_empty() {
                        Value::Null
                    } else {
                        serde_json::from_str(&text).unwrap_or(Value::String(text))
                    };

                    info!("POST {} -> {} ({}ms)", url, status, elapsed_ms);
                    return Ok(CallbackResponse {
                        status,
                        body,
                        elapsed_ms,
                    });
                }
                Err(e) if self.should_retry(&e, attempt) => {
                    warn!("Callback connection failed: {}", e);
                    attempt += 1;
                }
                Err(e) if e.is_timeout() => return Err(CallbackError::Timeout),
                Err(e) => return Err(CallbackError::Transport(e.to_string())),
            }
        }
    }
}
