//! Transaction kinds and barrier generation tracking.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Mutex;

use lockstep_core::protocol::barriers;

/// How a protocol call is wrapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionKind {
    /// Fetch replicated data. Cached per frame.
    Get,
    /// Fire-and-confirm request to the primary.
    Push,
    /// Barrier synchronization. Idempotent per generation.
    Sync,
    /// Same request to many nodes. Failures don't stop delivery.
    Mcast,
    /// One-shot state exchange with a promotion candidate.
    Recovery,
}

impl TransactionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TransactionKind::Get => "GET",
            TransactionKind::Push => "PUSH",
            TransactionKind::Sync => "SYNC",
            TransactionKind::Mcast => "MCAST",
            TransactionKind::Recovery => "RECOVERY",
        }
    }
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifies one sequence of barrier generations.
///
/// Frame barriers have a single caller per node. Generic barriers are
/// tracked per caller, since one node may host several.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SyncKey {
    pub barrier: String,
    pub caller: Option<String>,
}

impl SyncKey {
    pub fn frame(barrier: &str) -> Self {
        Self {
            barrier: barrier.to_string(),
            caller: None,
        }
    }

    pub fn generic(barrier_id: &str, caller_id: &str) -> Self {
        Self {
            barrier: barriers::generic(barrier_id),
            caller: Some(caller_id.to_string()),
        }
    }
}

impl fmt::Display for SyncKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.caller {
            Some(caller) => write!(f, "{}/{caller}", self.barrier),
            None => f.write_str(&self.barrier),
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Counters {
    issued: u64,
    completed: u64,
}

/// Issued and completed generation counters per [`SyncKey`].
#[derive(Debug, Default)]
pub struct SyncTracker {
    counters: Mutex<BTreeMap<SyncKey, Counters>>,
}

impl SyncTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a new generation for `key` and return its number.
    pub fn issue(&self, key: &SyncKey) -> u64 {
        let mut counters = self.counters.lock().expect("sync tracker lock");
        let entry = counters.entry(key.clone()).or_default();
        entry.issued += 1;
        entry.issued
    }

    pub fn issued(&self, key: &SyncKey) -> u64 {
        self.counters
            .lock()
            .expect("sync tracker lock")
            .get(key)
            .map_or(0, |c| c.issued)
    }

    pub fn completed(&self, key: &SyncKey) -> u64 {
        self.counters
            .lock()
            .expect("sync tracker lock")
            .get(key)
            .map_or(0, |c| c.completed)
    }

    pub fn is_completed(&self, key: &SyncKey, generation: u64) -> bool {
        self.completed(key) >= generation
    }

    pub fn complete(&self, key: &SyncKey, generation: u64) {
        let mut counters = self.counters.lock().expect("sync tracker lock");
        let entry = counters.entry(key.clone()).or_default();
        entry.completed = entry.completed.max(generation);
    }

    /// Drop every counter of `barrier`. A barrier created again under the
    /// same ID restarts at generation 1.
    pub fn forget_barrier(&self, barrier: &str) -> usize {
        let mut counters = self.counters.lock().expect("sync tracker lock");
        let before = counters.len();
        counters.retain(|key, _| key.barrier != barrier);
        before - counters.len()
    }

    /// Furthest completed generation per barrier key.
    pub fn progress(&self) -> BTreeMap<String, u64> {
        let counters = self.counters.lock().expect("sync tracker lock");
        let mut progress = BTreeMap::new();
        for (key, c) in counters.iter() {
            let slot = progress.entry(key.barrier.clone()).or_insert(0);
            *slot = (*slot).max(c.completed);
        }
        progress
    }

    /// Adopt the cluster-wide progress merged during recovery.
    ///
    /// A generation counts as completed locally only once it has been
    /// issued here too; callers that are behind still enter the barrier
    /// and get released immediately.
    pub fn apply(&self, progress: &BTreeMap<String, u64>) {
        let mut counters = self.counters.lock().expect("sync tracker lock");
        for (key, c) in counters.iter_mut() {
            if let Some(&merged) = progress.get(&key.barrier) {
                c.completed = c.completed.max(merged.min(c.issued));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generations_count_up() {
        let tracker = SyncTracker::new();
        let key = SyncKey::frame(barriers::FRAME_START);
        assert_eq!(tracker.issue(&key), 1);
        assert_eq!(tracker.issue(&key), 2);
        assert!(!tracker.is_completed(&key, 2));

        tracker.complete(&key, 2);
        tracker.complete(&key, 1);
        assert_eq!(tracker.completed(&key), 2);
    }

    #[test]
    fn progress_is_per_barrier() {
        let tracker = SyncTracker::new();
        let a = SyncKey::generic("phase", "a");
        let b = SyncKey::generic("phase", "b");
        tracker.issue(&a);
        tracker.issue(&a);
        tracker.issue(&b);
        tracker.complete(&a, 2);
        tracker.complete(&b, 1);

        let progress = tracker.progress();
        assert_eq!(progress["gb:phase"], 2);
        assert_eq!(a.to_string(), "gb:phase/a");
    }

    #[test]
    fn merged_progress_is_capped_by_what_was_issued() {
        let tracker = SyncTracker::new();
        let ahead = SyncKey::frame(barriers::FRAME_START);
        let behind = SyncKey::frame(barriers::FRAME_END);
        tracker.issue(&ahead);
        tracker.issue(&ahead);
        tracker.complete(&ahead, 1);
        tracker.issue(&behind);

        let mut merged = BTreeMap::new();
        merged.insert(barriers::FRAME_START.to_string(), 7);
        merged.insert(barriers::FRAME_END.to_string(), 0);
        tracker.apply(&merged);

        assert_eq!(tracker.completed(&ahead), 2);
        assert_eq!(tracker.completed(&behind), 0);
    }

    #[test]
    fn forgotten_barrier_restarts_at_one() {
        let tracker = SyncTracker::new();
        let main = SyncKey::generic("phase", "main");
        let other = SyncKey::generic("lobby", "main");
        tracker.issue(&main);
        tracker.complete(&main, 1);
        tracker.issue(&other);

        assert_eq!(tracker.forget_barrier(&barriers::generic("phase")), 1);
        assert_eq!(tracker.issue(&main), 1);
        assert!(!tracker.is_completed(&main, 1));
        assert_eq!(tracker.issued(&other), 1);
    }
}
