//! Gate error types

use crate::gate::outcome::GateState;
use crate::host::HostError;

/// Errors surfaced synchronously to whoever tried to move a gate
#[derive(Debug, thiserror::Error)]
pub enum GateError {
    #[error("{0}")]
    PermissionDenied(String),

    #[error("This deploy has been already given (gate {id} is {state})")]
    AlreadySettled { id: String, state: GateState },

    #[error("Gate {0} has no accepted deploy request to confirm")]
    NotSubmitted(String),

    #[error("Operation not allowed while the release of gate {0} is in flight")]
    ReleaseInFlight(String),

    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("No such parameter definition: {0}")]
    UnknownParameter(String),

    #[error("Cannot load state: {0}")]
    StateUnavailable(String),

    #[error("Gate not found: {0}")]
    NotFound(String),

    #[error("Host error: {0}")]
    Host(#[from] HostError),
}

impl GateError {
    /// Short machine-readable kind, used by the HTTP layer
    pub fn kind(&self) -> &'static str {
        match self {
            GateError::PermissionDenied(_) => "permission_denied",
            GateError::AlreadySettled { .. } => "already_settled",
            GateError::NotSubmitted(_) => "not_submitted",
            GateError::ReleaseInFlight(_) => "release_in_flight",
            GateError::InvalidParameters(_) => "invalid_parameters",
            GateError::UnknownParameter(_) => "unknown_parameter",
            GateError::StateUnavailable(_) => "state_unavailable",
            GateError::NotFound(_) => "not_found",
            GateError::Host(_) => "host",
        }
    }
}
