//! Node controller errors.

use thiserror::Error;

use lockstep_core::{CallError, CommError, ConfigError, NodeId, ServiceAddress};

/// Result type alias for node controller operations.
pub type NodeResult<T> = Result<T, NodeError>;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("node {0} is not part of the cluster configuration")]
    UnknownNode(NodeId),

    #[error("failed to bind {service} on {address}: {source}")]
    Listen {
        service: &'static str,
        address: ServiceAddress,
        #[source]
        source: CommError,
    },

    #[error("bootstrap failed: {0}")]
    Bootstrap(String),

    #[error(transparent)]
    Call(#[from] CallError),
}
