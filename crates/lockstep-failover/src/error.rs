//! Failover error types.

use thiserror::Error;

use lockstep_core::{CommResult, NodeId};

/// Result type alias for transactions.
pub type TransactionResult<T> = Result<T, TransactionError>;

/// Why transaction processing stopped for good.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FatalReason {
    #[error("node {0} failed and failover is disabled")]
    FailoverDisabled(NodeId),

    #[error("local node {0} failed")]
    LocalNodeFailed(NodeId),

    #[error("critical node {0} failed")]
    CriticalNodeFailed(NodeId),

    #[error("no promotion candidate left after {0} failed")]
    NoCandidate(NodeId),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransactionError {
    #[error("transaction processing terminated: {0}")]
    Terminated(FatalReason),

    #[error("process exit requested")]
    Exiting,

    /// The primary answered with a non-`Ok` result. Never retried.
    #[error("request rejected: {0:?}")]
    Rejected(CommResult),
}

impl TransactionError {
    pub fn comm_result(&self) -> CommResult {
        match self {
            TransactionError::Rejected(result) => *result,
            _ => CommResult::InternalError,
        }
    }
}
