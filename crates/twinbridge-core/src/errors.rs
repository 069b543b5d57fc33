use std::time::Duration;

use crate::ids::ConnectionId;

/// Failure taxonomy for connection commands.
/// Only `Unavailable` is retryable; everything else is final for the request.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ConnectivityError {
    // Rejected before persistence
    #[error("connection configuration invalid: {0}")]
    ConfigurationInvalid(String),
    #[error("command rejected by validator: {0}")]
    ValidatorRejection(String),

    // Addressing
    #[error("connection {0} not accessible")]
    NotAccessible(ConnectionId),
    #[error("connection {0} already exists")]
    Conflict(ConnectionId),
    #[error("precondition '{header}' failed for connection {connection_id}")]
    PreconditionFailed {
        connection_id: ConnectionId,
        header: String,
    },

    // Runtime
    #[error("worker instantiation failed: {0}")]
    WorkerInstantiation(String),
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    #[error("unavailable: {message}")]
    Unavailable {
        message: String,
        timeout: Option<Duration>,
    },
    #[error("internal error: {0}")]
    Internal(String),
}

impl ConnectivityError {
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
            timeout: None,
        }
    }

    pub fn timed_out(what: &str, timeout: Duration) -> Self {
        Self::Unavailable {
            message: format!("{what} did not complete within {timeout:?}"),
            timeout: Some(timeout),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }

    /// Short classification string for logging/metrics.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::ConfigurationInvalid(_) => "configuration_invalid",
            Self::ValidatorRejection(_) => "validator_rejection",
            Self::NotAccessible(_) => "not_accessible",
            Self::Conflict(_) => "conflict",
            Self::PreconditionFailed { .. } => "precondition_failed",
            Self::WorkerInstantiation(_) => "worker_instantiation",
            Self::ConnectionFailed(_) => "connection_failed",
            Self::Unavailable { .. } => "unavailable",
            Self::Internal(_) => "internal",
        }
    }

    /// HTTP-style status code for the control plane.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::ConfigurationInvalid(_) | Self::ValidatorRejection(_) => 400,
            Self::NotAccessible(_) => 404,
            Self::Conflict(_) => 409,
            Self::PreconditionFailed { .. } => 412,
            Self::ConnectionFailed(_) => 502,
            Self::Unavailable { .. } => 503,
            Self::WorkerInstantiation(_) | Self::Internal(_) => 500,
        }
    }
}
