//! lockstep-failover — keeps the cluster alive when nodes disappear.
//!
//! Every protocol call a node makes is wrapped in a transaction addressed
//! to whoever is primary at the time. A communication failure reports the
//! addressed node as failed, and the transaction retries once the
//! failure has been handled.
//!
//! # Architecture
//!
//! ```text
//! FailoverController
//!   ├── RecoveryLock  — transactions read, recovery writes
//!   ├── SyncTracker   — issued/completed generations per barrier and caller
//!   ├── DataCache     — last GET result per name, tagged with its frame
//!   ├── FailureLog    — one handling per failed node
//!   └── ClusterOps    — addressed calls into the node controller
//!
//! HandleFailure(node)
//!   ├── failover disabled / self / critical → terminate
//!   ├── secondary → drop it, tell the others
//!   └── primary   → write lock, elect, broadcast, RECOVERY, repeat on failure
//! ```

pub mod cache;
pub mod controller;
pub mod election;
pub mod error;
pub mod failures;
pub mod recovery_lock;
pub mod transaction;

pub use cache::DataCache;
pub use controller::{FailoverController, FatalObserver};
pub use election::elect;
pub use error::{FatalReason, TransactionError, TransactionResult};
pub use failures::FailureLog;
pub use recovery_lock::RecoveryLock;
pub use transaction::{SyncKey, SyncTracker, TransactionKind};
