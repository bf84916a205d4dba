//! Deploy step definition
//!
//! The declarative half of a gate: what the pipeline author wrote. A step is
//! turned into a live [`crate::gate::StepGate`] when the pipeline reaches it.
//!
//! ```yaml
//! message: "Release to production?"
//! id: prod-release
//! submitter: "alice, release-managers"
//! submitterParameter: approver
//! ok: Ship it
//! parameters:
//!   - type: choice
//!     name: region
//!     choices: [eu, us]
//! ```

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::parameter::ParameterDefinition;

pub const DEFAULT_MESSAGE: &str = "Pipeline has paused and needs your input before proceeding";
pub const DEFAULT_OK: &str = "Proceed";

const DISPLAY_NAME_LIMIT: usize = 32;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployStep {
    #[serde(default = "default_message")]
    message: String,

    /// Explicit id; derived from the message when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<String>,

    /// Comma-separated users or groups allowed to settle the gate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    submitter: Option<String>,

    /// Parameter that receives the name of whoever submitted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    submitter_parameter: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    parameters: Vec<ParameterDefinition>,

    /// Caption of the proceed button
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ok: Option<String>,
}

fn default_message() -> String {
    DEFAULT_MESSAGE.to_string()
}

fn fix_empty_and_trim(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Uppercase the first character if it is an ASCII lowercase letter
pub fn capitalize(id: &str) -> String {
    let mut chars = id.chars();
    match chars.next() {
        Some(first) if first.is_ascii_lowercase() => {
            let mut out = String::with_capacity(id.len());
            out.push(first.to_ascii_uppercase());
            out.push_str(chars.as_str());
            out
        }
        _ => id.to_string(),
    }
}

/// Hex digest used to derive ids from messages
pub fn digest_of(text: &str) -> String {
    hex::encode(Sha256::digest(text.as_bytes()))
}

impl DeployStep {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            id: None,
            submitter: None,
            submitter_parameter: None,
            parameters: Vec::new(),
            ok: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.set_id(Some(id.into()));
        self
    }

    pub fn with_submitter(mut self, submitter: impl Into<String>) -> Self {
        self.set_submitter(Some(submitter.into()));
        self
    }

    pub fn with_submitter_parameter(mut self, name: impl Into<String>) -> Self {
        self.submitter_parameter = fix_empty_and_trim(Some(name.into()));
        self
    }

    pub fn with_parameters(mut self, parameters: Vec<ParameterDefinition>) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn with_ok(mut self, ok: impl Into<String>) -> Self {
        self.ok = fix_empty_and_trim(Some(ok.into()));
        self
    }

    pub fn set_id(&mut self, id: Option<String>) {
        self.id = id.filter(|v| !v.is_empty()).map(|v| capitalize(&v));
    }

    pub fn set_submitter(&mut self, submitter: Option<String>) {
        self.submitter = fix_empty_and_trim(submitter);
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// The gate id: the explicit id, or the digest of the message, with the
    /// first letter uppercased either way
    pub fn id(&self) -> String {
        match self.id.as_deref().filter(|v| !v.is_empty()) {
            Some(id) => capitalize(id),
            None => capitalize(&digest_of(&self.message)),
        }
    }

    pub fn submitter(&self) -> Option<&str> {
        self.submitter
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    pub fn submitter_parameter(&self) -> Option<&str> {
        self.submitter_parameter
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    pub fn parameters(&self) -> &[ParameterDefinition] {
        &self.parameters
    }

    pub fn ok(&self) -> &str {
        self.ok
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(DEFAULT_OK)
    }

    /// Message shortened for listings
    pub fn display_name(&self) -> String {
        if self.message.chars().count() < DISPLAY_NAME_LIMIT {
            return self.message.clone();
        }
        let short: String = self.message.chars().take(DISPLAY_NAME_LIMIT).collect();
        format!("{}...", short)
    }
}

impl Default for DeployStep {
    fn default() -> Self {
        Self::new(DEFAULT_MESSAGE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capitalize() {
        assert_eq!(capitalize("x"), "X");
        assert_eq!(capitalize("abc"), "Abc");
        assert_eq!(capitalize("Abc"), "Abc");
        assert_eq!(capitalize("9ab"), "9ab");
        assert_eq!(capitalize(""), "");
    }

    #[test]
    fn test_digest_is_hex() {
        let d = digest_of("hello world");
        assert_eq!(d.len(), 64);
        assert!(d.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_empty_id_is_derived() {
        let mut step = DeployStep::new("hello world");
        step.set_id(Some(String::new()));
        assert_eq!(step.id(), capitalize(&digest_of("hello world")));
    }

    #[test]
    fn test_ok_default() {
        assert_eq!(DeployStep::new("m").ok(), DEFAULT_OK);
        assert_eq!(DeployStep::new("m").with_ok("  Ship  ").ok(), "Ship");
    }

    #[test]
    fn test_display_name_truncates() {
        let short = DeployStep::new("Release?");
        assert_eq!(short.display_name(), "Release?");

        let long = DeployStep::new("a".repeat(40));
        assert_eq!(long.display_name(), format!("{}...", "a".repeat(32)));
    }

    #[test]
    fn test_submitter_trimmed() {
        let step = DeployStep::new("m").with_submitter("  alice,bob  ");
        assert_eq!(step.submitter(), Some("alice,bob"));

        let blank = DeployStep::new("m").with_submitter("   ");
        assert_eq!(blank.submitter(), None);
    }
}
