//! Promotion candidate selection.

use std::collections::BTreeSet;

use lockstep_core::{FailoverSettings, NodeId};

/// Pick the next primary among `alive`.
///
/// With a configured backup list the first surviving candidate wins. The
/// smallest surviving node id is used only when no backup list was
/// configured at all, so every node picks the same one. A configured list
/// whose candidates are all gone never falls back: it yields `None` and
/// failover terminates.
pub fn elect(settings: &FailoverSettings, alive: &BTreeSet<NodeId>) -> Option<NodeId> {
    if settings.backups_configured {
        settings
            .backup_candidates
            .iter()
            .find(|candidate| alive.contains(*candidate))
            .cloned()
    } else {
        alive.iter().next().cloned()
    }
}
