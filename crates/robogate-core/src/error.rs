//! Gateway-wide error taxonomy.
//!
//! Every failure a client can observe maps onto one of these variants; the
//! daemon translates them to HTTP statuses. Subsystem modules keep their own
//! narrower error types and convert into [`GatewayError`] at the handler
//! boundary.

use std::time::Duration;

use crate::lease::LeaseError;
use crate::safety::SafetyViolation;
use crate::supervisor::SupervisorError;

/// Top-level error taxonomy for the gateway.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// A backend is disconnected or a round-trip to it failed.
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    /// The request body or parameters were malformed.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The safety envelope rejected the command.
    #[error("{reason}: {detail}")]
    SafetyViolation {
        /// Stable machine-readable reason, e.g. `safety:z_out_of_bounds`.
        reason: String,
        /// Human-readable explanation.
        detail: String,
    },

    /// The presented token does not match the current lease.
    #[error("presented token does not match the current lease")]
    NotHolder,

    /// The lease existed but has been revoked or has expired.
    #[error("lease expired")]
    LeaseExpired,

    /// A mutually exclusive operation is already in progress.
    #[error("operation already in progress")]
    Busy,

    /// A service cannot start because dependencies are not running.
    #[error("dependencies not running: {missing:?}")]
    DependencyNotRunning {
        /// Dependency keys that are not in the `running` state.
        missing: Vec<String>,
    },

    /// An operation exceeded its deadline.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// An unexpected internal failure. The message is logged with a
    /// correlation id; clients only see the id.
    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Stable wire code for this error, used in JSON error bodies.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::BackendUnavailable(_) => "backend_unavailable",
            Self::InvalidArgument(_) => "invalid_argument",
            Self::SafetyViolation { .. } => "safety_violation",
            Self::NotHolder => "not_holder",
            Self::LeaseExpired => "lease_expired",
            Self::Busy => "busy",
            Self::DependencyNotRunning { .. } => "dependency_not_running",
            Self::Timeout(_) => "timeout",
            Self::Internal(_) => "internal",
        }
    }
}

impl From<SafetyViolation> for GatewayError {
    fn from(v: SafetyViolation) -> Self {
        Self::SafetyViolation {
            reason: v.reason,
            detail: v.detail,
        }
    }
}

impl From<LeaseError> for GatewayError {
    fn from(e: LeaseError) -> Self {
        match e {
            LeaseError::NotHolder => Self::NotHolder,
            LeaseError::UnknownTicket(t) => Self::InvalidArgument(format!("unknown ticket: {t}")),
        }
    }
}

impl From<SupervisorError> for GatewayError {
    fn from(e: SupervisorError) -> Self {
        match e {
            SupervisorError::DependencyNotRunning { missing, .. } => {
                Self::DependencyNotRunning { missing }
            },
            SupervisorError::UnknownService(key) => {
                Self::InvalidArgument(format!("unknown service: {key}"))
            },
            other => Self::Internal(other.to_string()),
        }
    }
}
