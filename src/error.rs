use crate::registry::{Operation, TransportKind};
use std::time::Duration;
use thiserror::Error;

/// A single registry call that did not succeed.
///
/// Every variant is retryable from the registrar's point of view. Transports
/// only have to decide whether the request reached the registry at all.
#[derive(Debug, Clone, Error)]
pub enum CallError {
    #[error("{operation} request never reached the registry: {reason}")]
    Unreachable { operation: Operation, reason: String },

    #[error("registry rejected {operation} request: {reason}")]
    Rejected { operation: Operation, reason: String },

    #[error("{operation} call timed out after {timeout:?}")]
    TimedOut { operation: Operation, timeout: Duration },

    #[error("{operation} call cancelled")]
    Cancelled { operation: Operation },

    #[error("{operation} is not supported by the {transport} transport")]
    Unsupported {
        operation: Operation,
        transport: TransportKind,
    },
}

impl CallError {
    pub fn unreachable(operation: Operation, reason: impl ToString) -> Self {
        CallError::Unreachable {
            operation,
            reason: reason.to_string(),
        }
    }

    pub fn rejected(operation: Operation, reason: impl ToString) -> Self {
        CallError::Rejected {
            operation,
            reason: reason.to_string(),
        }
    }

    pub fn operation(&self) -> Operation {
        match self {
            CallError::Unreachable { operation, .. }
            | CallError::Rejected { operation, .. }
            | CallError::TimedOut { operation, .. }
            | CallError::Cancelled { operation }
            | CallError::Unsupported { operation, .. } => *operation,
        }
    }

    /// True when the registry received the request and answered with a refusal.
    pub fn reached_registry(&self) -> bool {
        matches!(self, CallError::Rejected { .. })
    }
}

#[derive(Debug, Error)]
pub enum RegistrarError {
    #[error("invalid registrar configuration: {0}")]
    Configuration(String),

    #[error("failed to create {kind} registry client: {source}")]
    TransportConstruction {
        kind: TransportKind,
        #[source]
        source: anyhow::Error,
    },

    #[error(transparent)]
    Call(#[from] CallError),

    #[error("failed to register service '{service}' (ID: {instance_id}) after {attempts} attempt(s)")]
    RetriesExhausted {
        service: String,
        instance_id: String,
        attempts: u32,
        #[source]
        last_error: CallError,
    },

    #[error("registration of service '{service}' aborted due to context cancellation")]
    Cancelled { service: String },
}

impl RegistrarError {
    pub(crate) fn transport(kind: TransportKind, source: impl Into<anyhow::Error>) -> Self {
        RegistrarError::TransportConstruction {
            kind,
            source: source.into(),
        }
    }
}
