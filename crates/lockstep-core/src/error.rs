//! Error types shared across the lockstep crates.

use thiserror::Error;

use crate::types::CommResult;

/// Result type alias for protocol calls addressed to a specific node.
pub type CallResult<T> = Result<T, CallError>;

/// Communication failures reported by the transport.
///
/// Every variant is treated as a crash-stop signal for the addressed
/// node by the failover layer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommError {
    #[error("{target} unreachable: {reason}")]
    Unreachable { target: String, reason: String },

    #[error("connection to {target} lost")]
    Disconnected { target: String },

    #[error("address {address} already in use")]
    AddressInUse { address: String },

    #[error("no hosting information for node {0}")]
    UnknownNode(String),

    #[error("codec error: {0}")]
    Codec(String),
}

impl CommError {
    pub fn unreachable(target: impl ToString, reason: impl Into<String>) -> Self {
        Self::Unreachable {
            target: target.to_string(),
            reason: reason.into(),
        }
    }

    pub fn disconnected(target: impl ToString) -> Self {
        Self::Disconnected {
            target: target.to_string(),
        }
    }
}

/// Failure of a single protocol call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError {
    /// The request never got a reply. Retried by the failover layer.
    #[error(transparent)]
    Comm(#[from] CommError),

    /// The remote node answered with a non-`Ok` result. Never retried.
    #[error("request rejected: {0:?}")]
    Rejected(CommResult),
}

impl CallError {
    pub fn is_transient(&self) -> bool {
        matches!(self, CallError::Comm(_))
    }

    /// The `CommResult` to hand to the application for this failure.
    pub fn comm_result(&self) -> CommResult {
        match self {
            CallError::Comm(_) => CommResult::InternalError,
            CallError::Rejected(result) => *result,
        }
    }
}

/// Errors raised while loading or validating cluster configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Read(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(String),

    #[error("invalid duration {0:?}, expected e.g. \"500ms\" or \"5s\"")]
    Duration(String),

    #[error("invalid config: {0}")]
    Invalid(String),
}
