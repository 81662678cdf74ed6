//! lockstep-netapi — what the application calls.
//!
//! ```text
//! NetApi ── active FailoverController (rebindable)
//!   ├── cluster_sync()    game thread only
//!   ├── render_sync()     rendering thread only
//!   ├── events()          any thread
//!   └── generic_barrier() any thread
//! ```
//!
//! Every call resolves the active controller at call time and reports a
//! plain [`CommResult`](lockstep_core::CommResult) on failure.

pub mod facade;
pub mod groups;

pub use facade::{NetApi, NetResult};
pub use groups::{ClusterSyncApi, EventsApi, GenericBarrierApi, RenderSyncApi};
