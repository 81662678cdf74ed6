//! lockstep-barrier — network rendezvous points for the lockstep cluster.
//!
//! # Architecture
//!
//! ```text
//! BarrierService (one per hosting node and service)
//!   ├── Barrier (per ID)
//!   │   ├── expected callers: (node_id, caller_id) pairs
//!   │   ├── generation slot: released / timed out / deactivated
//!   │   └── observers: pre-release hook, timeout hook
//!   ├── timeout callbacks → node-failure candidates
//!   └── GenericBarrierHandler — serves barrier requests from the network
//!
//! BarrierClientPool (one per node)
//!   └── BarrierClientSet (per consumer) — its own connection to every node
//! ```
//!
//! A barrier releases only when every registered caller has arrived for
//! the current generation. The pre-release hooks run on the hosting node
//! before any caller returns. Missing callers are reported through the
//! service's timeout callbacks; dropping them is up to the failover layer.

pub mod barrier;
pub mod client;
pub mod error;
pub mod service;

pub use barrier::{Barrier, BarrierCaller, BarrierObserver, BarrierState, ReleaseData};
pub use client::{BarrierClientPool, BarrierClientSet, ClientSetId};
pub use error::{BarrierError, BarrierResult};
pub use service::{BarrierService, BarrierTimeout, GenericBarrierHandler, ReleaseCallback, TimeoutCallback};
