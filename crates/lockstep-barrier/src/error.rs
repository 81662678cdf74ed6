//! Barrier error types.

use thiserror::Error;

use lockstep_core::CommResult;

use crate::barrier::BarrierCaller;

/// Result type alias for barrier operations.
pub type BarrierResult<T> = Result<T, BarrierError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BarrierError {
    #[error("barrier {0} not found")]
    NotFound(String),

    #[error("caller {caller} is not registered on barrier {barrier_id}")]
    UnknownCaller { barrier_id: String, caller: BarrierCaller },

    #[error("caller {caller} already arrived at barrier {barrier_id}")]
    DuplicateCaller { barrier_id: String, caller: BarrierCaller },

    #[error("barrier {barrier_id} timed out, {} caller(s) missing", missing.len())]
    TimedOut {
        barrier_id: String,
        missing: Vec<BarrierCaller>,
    },

    #[error("barrier {0} was deactivated")]
    Deactivated(String),

    #[error("barrier {barrier_id} is at generation {expected}, caller asked for {requested}")]
    GenerationAhead {
        barrier_id: String,
        requested: u64,
        expected: u64,
    },
}

impl BarrierError {
    /// How this error is reported to a remote caller.
    pub fn comm_result(&self) -> CommResult {
        match self {
            BarrierError::NotFound(_) | BarrierError::UnknownCaller { .. } => CommResult::NotAllowed,
            _ => CommResult::InternalError,
        }
    }
}
