//! Bookkeeping of node failures being handled.
//!
//! A failure can be reported many times: by every transaction that hit
//! the dead node, by drop requests from peers, and by barrier timeouts.
//! The first report handles it. Later reports either wait for that
//! handling to finish or return at once.

use std::collections::BTreeMap;
use std::sync::{Condvar, Mutex};

use lockstep_core::NodeId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FailureState {
    InProgress,
    Done,
}

/// Outcome of reporting a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    /// The caller must handle the failure and then call [`FailureLog::finish`].
    Owner,
    /// Somebody else handled it, or is handling it.
    Handled,
}

#[derive(Debug, Default)]
pub struct FailureLog {
    states: Mutex<BTreeMap<NodeId, FailureState>>,
    changed: Condvar,
}

impl FailureLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the handling of `node_id`.
    ///
    /// With `wait` set and handling in progress elsewhere, blocks until
    /// it finishes.
    pub fn claim(&self, node_id: &str, wait: bool) -> Claim {
        let mut states = self.states.lock().expect("failure log lock");
        match states.get(node_id) {
            None => {
                states.insert(node_id.to_string(), FailureState::InProgress);
                Claim::Owner
            }
            Some(FailureState::Done) => Claim::Handled,
            Some(FailureState::InProgress) => {
                if wait {
                    while states.get(node_id) == Some(&FailureState::InProgress) {
                        states = self.changed.wait(states).expect("failure log lock");
                    }
                }
                Claim::Handled
            }
        }
    }

    pub fn finish(&self, node_id: &str) {
        self.states
            .lock()
            .expect("failure log lock")
            .insert(node_id.to_string(), FailureState::Done);
        self.changed.notify_all();
    }

    /// Record a failure handled as part of another one.
    pub fn mark_handled(&self, node_id: &str) {
        self.finish(node_id);
    }

    pub fn is_handled(&self, node_id: &str) -> bool {
        self.states.lock().expect("failure log lock").get(node_id) == Some(&FailureState::Done)
    }

    pub fn handled(&self) -> Vec<NodeId> {
        self.states
            .lock()
            .expect("failure log lock")
            .iter()
            .filter(|(_, state)| **state == FailureState::Done)
            .map(|(id, _)| id.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn first_claim_owns() {
        let log = FailureLog::new();
        assert_eq!(log.claim("b", true), Claim::Owner);
        assert_eq!(log.claim("b", false), Claim::Handled);
        log.finish("b");
        assert_eq!(log.claim("b", true), Claim::Handled);
        assert!(log.is_handled("b"));
        assert_eq!(log.handled(), vec!["b".to_string()]);
    }

    #[test]
    fn waiting_claim_returns_after_finish() {
        let log = Arc::new(FailureLog::new());
        assert_eq!(log.claim("a", true), Claim::Owner);

        let waiter_log = log.clone();
        let waiter = thread::spawn(move || {
            let claim = waiter_log.claim("a", true);
            (claim, waiter_log.is_handled("a"))
        });

        thread::sleep(Duration::from_millis(30));
        assert!(!waiter.is_finished());
        log.finish("a");

        assert_eq!(waiter.join().unwrap(), (Claim::Handled, true));
    }
}
