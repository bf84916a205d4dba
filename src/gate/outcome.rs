//! Gate outcome types
//!
//! A gate's progress is a single tagged value rather than a bag of flags:
//! `None` while pending, then one of the [`Outcome`] variants. The variant
//! carries only the data that makes sense in that state, so "deployed but
//! never submitted" cannot be represented.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::gate::permission::Principal;

/// Externally visible state of a gate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GateState {
    /// Opened, nothing decided yet
    Pending,
    /// A deploy request is being posted to the deployment system
    Submitting,
    /// The deployment system accepted the request (phase 1 done)
    Submitted,
    /// The deployment system confirmed completion
    Deployed,
    Aborted,
}

impl GateState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, GateState::Deployed | GateState::Aborted)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            GateState::Pending => "pending",
            GateState::Submitting => "submitting",
            GateState::Submitted => "submitted",
            GateState::Deployed => "deployed",
            GateState::Aborted => "aborted",
        }
    }
}

impl fmt::Display for GateState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a gate was interrupted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InterruptionCause {
    /// Aborted by a principal (None when nobody could be identified)
    Rejected {
        user_id: Option<String>,
        timestamp: DateTime<Utc>,
    },
    /// The submission failed validation
    ParamError {
        error: String,
        timestamp: DateTime<Utc>,
    },
    /// The deployment system refused or could not be reached
    DeployRejected { timestamp: DateTime<Utc> },
    /// The owning run was stopped by the workflow engine
    Stopped {
        reason: String,
        timestamp: DateTime<Utc>,
    },
}

impl InterruptionCause {
    pub fn rejected_by(principal: &Principal) -> Self {
        let user_id = (!principal.is_system() && !principal.name().is_empty())
            .then(|| principal.name().to_string());
        InterruptionCause::Rejected {
            user_id,
            timestamp: Utc::now(),
        }
    }

    pub fn param_error(error: impl Into<String>) -> Self {
        InterruptionCause::ParamError {
            error: error.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn deploy_rejected() -> Self {
        InterruptionCause::DeployRejected {
            timestamp: Utc::now(),
        }
    }

    pub fn stopped(reason: impl Into<String>) -> Self {
        InterruptionCause::Stopped {
            reason: reason.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            InterruptionCause::Rejected { timestamp, .. }
            | InterruptionCause::ParamError { timestamp, .. }
            | InterruptionCause::DeployRejected { timestamp }
            | InterruptionCause::Stopped { timestamp, .. } => *timestamp,
        }
    }

    pub fn short_description(&self) -> String {
        match self {
            InterruptionCause::Rejected {
                user_id: Some(user),
                ..
            } => format!("Rejected by {}", user),
            InterruptionCause::Rejected { user_id: None, .. } => "Rejected".to_string(),
            InterruptionCause::ParamError { error, .. } => format!("Rejected by {}", error),
            InterruptionCause::DeployRejected { .. } => {
                "Rejected by the deployment system".to_string()
            }
            InterruptionCause::Stopped { reason, .. } => format!("Stopped: {}", reason),
        }
    }
}

/// Failure handed back to the workflow engine when a gate is aborted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("Aborted: {}", cause.short_description())]
pub struct FlowInterrupted {
    pub cause: InterruptionCause,
}

impl FlowInterrupted {
    pub fn new(cause: InterruptionCause) -> Self {
        Self { cause }
    }
}

/// Result of a gate transition. Created once per transition, never mutated.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Provisional: a deploy request is in flight. Guards against re-entry.
    Submitting,
    Submitted {
        value: Option<Value>,
    },
    Deployed {
        value: Option<Value>,
    },
    Aborted {
        failure: FlowInterrupted,
        /// Whether the deployment system had accepted a request before the abort
        submitted: bool,
        deployed: bool,
    },
}

impl Outcome {
    pub fn aborted(failure: FlowInterrupted, submitted: bool, deployed: bool) -> Self {
        Outcome::Aborted {
            failure,
            submitted,
            deployed,
        }
    }

    pub fn state(&self) -> GateState {
        match self {
            Outcome::Submitting => GateState::Submitting,
            Outcome::Submitted { .. } => GateState::Submitted,
            Outcome::Deployed { .. } => GateState::Deployed,
            Outcome::Aborted { .. } => GateState::Aborted,
        }
    }

    /// Payload for the workflow on success
    pub fn value(&self) -> Option<&Value> {
        match self {
            Outcome::Submitted { value } | Outcome::Deployed { value } => value.as_ref(),
            _ => None,
        }
    }

    pub fn failure(&self) -> Option<&FlowInterrupted> {
        match self {
            Outcome::Aborted { failure, .. } => Some(failure),
            _ => None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.failure().is_none()
    }

    pub fn is_failure(&self) -> bool {
        self.failure().is_some()
    }

    pub fn is_submitted(&self) -> bool {
        match self {
            Outcome::Submitting => false,
            Outcome::Submitted { .. } | Outcome::Deployed { .. } => true,
            Outcome::Aborted { submitted, .. } => *submitted,
        }
    }

    pub fn is_deployed(&self) -> bool {
        match self {
            Outcome::Deployed { .. } => true,
            Outcome::Aborted { deployed, .. } => *deployed,
            _ => false,
        }
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self, Outcome::Aborted { .. })
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.failure() {
            Some(failure) => write!(f, "abnormal[{}]", failure)?,
            None => match self.value() {
                Some(value) => write!(f, "normal[{}]", value)?,
                None => write!(f, "normal[null]")?,
            },
        }
        write!(
            f,
            ",deployed[{}],submitted[{}],aborted[{}]",
            self.is_deployed(),
            self.is_submitted(),
            self.is_aborted()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_states() {
        assert_eq!(Outcome::Submitting.state(), GateState::Submitting);
        assert!(!GateState::Submitted.is_terminal());
        assert!(GateState::Deployed.is_terminal());
        assert!(GateState::Aborted.is_terminal());
    }

    #[test]
    fn test_flags_follow_variant() {
        let submitted = Outcome::Submitted {
            value: Some(json!({"env": "dev"})),
        };
        assert!(submitted.is_submitted());
        assert!(!submitted.is_deployed());
        assert!(!submitted.is_aborted());
        assert!(submitted.is_success());

        let deployed = Outcome::Deployed { value: None };
        assert!(deployed.is_submitted());
        assert!(deployed.is_deployed());
        assert!(!deployed.is_aborted());
    }

    #[test]
    fn test_aborted_keeps_prior_flags() {
        let failure = FlowInterrupted::new(InterruptionCause::deploy_rejected());
        let outcome = Outcome::aborted(failure.clone(), true, false);
        assert!(outcome.is_aborted());
        assert!(outcome.is_submitted());
        assert!(!outcome.is_deployed());
        assert!(outcome.is_failure());
        assert_eq!(outcome.failure(), Some(&failure));
        assert_eq!(outcome.value(), None);
    }

    #[test]
    fn test_short_descriptions() {
        let by_user = InterruptionCause::rejected_by(&Principal::new("alice"));
        assert_eq!(by_user.short_description(), "Rejected by alice");

        let by_system = InterruptionCause::rejected_by(&Principal::system());
        assert_eq!(by_system.short_description(), "Rejected");

        let params = InterruptionCause::param_error("Params error");
        assert_eq!(params.short_description(), "Rejected by Params error");
    }

    #[test]
    fn test_display() {
        let outcome = Outcome::Deployed {
            value: Some(json!("v")),
        };
        assert_eq!(
            outcome.to_string(),
            "normal[\"v\"],deployed[true],submitted[true],aborted[false]"
        );
    }
}
