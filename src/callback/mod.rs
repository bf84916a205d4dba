//! Outbound callbacks to the deployment and notice systems
//!
//! This module contains:
//! - `client` - Pooled HTTP client posting JSON with the identity header
//! - `dispatcher` - Best-effort notice and deploy callbacks that never fail loudly
//! - `queue` - Per-gate ordered, non-blocking notice delivery

use serde::{Deserialize, Serialize};

pub mod client;
pub mod dispatcher;
pub mod queue;

pub use client::{CallbackClient, CallbackResponse, IDENTITY_HEADER, SUCCESS_CODE};
pub use dispatcher::{GateDescriptor, NotificationDispatcher};
pub use queue::NoticeQueue;

/// Errors talking to a callback endpoint
#[derive(Debug, thiserror::Error)]
pub enum CallbackError {
    #[error("Failed to build HTTP client: {0}")]
    ClientBuild(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Lifecycle events sent to the notice callback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoticeType {
    /// Gate opened
    Ready,
    /// Deployment system accepted the deploy request
    Submitted,
    Success,
    Abort,
}

impl NoticeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NoticeType::Ready => "ready",
            NoticeType::Submitted => "submitted",
            NoticeType::Success => "success",
            NoticeType::Abort => "abort",
        }
    }
}

impl std::fmt::Display for NoticeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Acting user forwarded to the external systems in the identity header
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
}

impl Identity {
    pub fn new(user_id: Option<String>, user_name: Option<String>) -> Self {
        let keep = |v: Option<String>| v.filter(|s| !s.is_empty());
        Self {
            user_id: keep(user_id),
            user_name: keep(user_name),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.user_id.is_none() && self.user_name.is_none()
    }

    /// Header value, or `None` when there is nobody to name
    pub fn header_value(&self) -> Option<String> {
        if self.is_empty() {
            return None;
        }
        serde_json::to_string(self).ok()
    }
}
