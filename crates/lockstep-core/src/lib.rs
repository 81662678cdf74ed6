//! lockstep-core — shared building blocks for the lockstep cluster.
//!
//! Defines the domain types exchanged between cluster nodes, the wire
//! protocol (`ClusterRequest` / `ClusterResponse`), cluster configuration
//! loaded from TOML, and the narrow transport interface the rest of the
//! workspace talks through.
//!
//! # Architecture
//!
//! ```text
//! types      — NodeId, CommResult, ThreadRole, events, hosting info, recovery state
//! protocol   — request/response enums for every protocol group
//! config     — ClusterConfig (TOML) + validation
//! transport  — Transport / Connection / RequestHandler traits, ConnectionSet
//! local      — LocalNetwork, an in-process transport with failure injection
//! ```
//!
//! The raw socket layer is an external collaborator. `LocalNetwork` runs
//! every message through `serde_json` so in-process clusters exercise the
//! same encode/decode path a socket transport would.

pub mod config;
pub mod error;
pub mod local;
pub mod protocol;
pub mod transport;
pub mod types;

pub use config::ClusterConfig;
pub use error::{CallError, CallResult, CommError, ConfigError};
pub use local::LocalNetwork;
pub use protocol::{ClusterRequest, ClusterResponse, ResponsePayload};
pub use transport::{Connection, ConnectionSet, Listener, RequestHandler, RetryPolicy, Transport};
pub use types::*;
