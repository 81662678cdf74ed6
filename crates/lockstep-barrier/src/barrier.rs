//! The barrier rendezvous primitive.
//!
//! A barrier holds a fixed set of expected callers. Each generation
//! completes when all of them have called `sync`, or when the timeout
//! measured from the first arrival elapses. Completed generations are
//! counted so that a caller retrying a generation it already passed gets
//! its cached response back instead of being counted twice.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, OnceLock, RwLock};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use lockstep_core::NodeId;

use crate::error::{BarrierError, BarrierResult};

/// One expected participant of a barrier. The same caller ID on two
/// nodes names two participants.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BarrierCaller {
    pub node_id: NodeId,
    pub caller_id: String,
}

impl BarrierCaller {
    pub fn new(node_id: impl Into<NodeId>, caller_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            caller_id: caller_id.into(),
        }
    }

    /// Expand a node → callers map into caller entries.
    pub fn from_node_map(node_to_callers: &BTreeMap<NodeId, Vec<String>>) -> Vec<BarrierCaller> {
        node_to_callers
            .iter()
            .flat_map(|(node, callers)| callers.iter().map(move |c| BarrierCaller::new(node.clone(), c.clone())))
            .collect()
    }
}

impl fmt::Display for BarrierCaller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.node_id, self.caller_id)
    }
}

/// Lifecycle of a barrier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarrierState {
    Created,
    WaitingForCallers,
    Releasing,
    Idle,
    /// The last generation timed out. The next arrival starts over.
    TimedOut,
    Deactivated,
}

/// Payloads handed to pre-release observers.
#[derive(Debug, Default)]
pub struct ReleaseData {
    pub requests: BTreeMap<BarrierCaller, Vec<u8>>,
    /// Callers without an entry get an empty response.
    pub responses: BTreeMap<BarrierCaller, Vec<u8>>,
}

impl ReleaseData {
    /// Give every caller the same response.
    pub fn respond_all(&mut self, data: &[u8]) {
        for caller in self.requests.keys() {
            self.responses.insert(caller.clone(), data.to_vec());
        }
    }
}

/// Hooks invoked by a barrier.
///
/// `on_pre_release` runs while the barrier is locked, before any caller
/// unblocks, exactly once per released generation. It must not call back
/// into the same barrier. `on_timeout` runs after the lock is dropped.
pub trait BarrierObserver: Send + Sync {
    fn on_pre_release(&self, _barrier_id: &str, _generation: u64, _data: &mut ReleaseData) {}

    fn on_timeout(&self, _barrier_id: &str, _generation: u64, _missing: &[BarrierCaller]) {}
}

#[derive(Debug)]
enum Outcome {
    Released(Arc<BTreeMap<BarrierCaller, Vec<u8>>>),
    TimedOut(Vec<BarrierCaller>),
    Deactivated,
}

#[derive(Debug)]
struct GenerationSlot {
    generation: u64,
    outcome: OnceLock<Outcome>,
}

impl GenerationSlot {
    fn new(generation: u64) -> Arc<Self> {
        Arc::new(Self {
            generation,
            outcome: OnceLock::new(),
        })
    }
}

struct Inner {
    state: BarrierState,
    expected: BTreeSet<BarrierCaller>,
    /// Request bytes for the current generation.
    arrived: BTreeMap<BarrierCaller, Vec<u8>>,
    deadline: Option<Instant>,
    released_through: u64,
    slot: Arc<GenerationSlot>,
    /// (generation, response) of each caller's last release.
    last_responses: HashMap<BarrierCaller, (u64, Vec<u8>)>,
    last_timeout: Option<(u64, Vec<BarrierCaller>)>,
}

impl Inner {
    fn quorum_reached(&self) -> bool {
        !self.arrived.is_empty() && self.expected.iter().all(|c| self.arrived.contains_key(c))
    }

    fn missing(&self) -> Vec<BarrierCaller> {
        self.expected
            .iter()
            .filter(|caller| !self.arrived.contains_key(*caller))
            .cloned()
            .collect()
    }

    /// Close the current generation and open the next one.
    fn advance(&mut self, generation: u64, outcome: Outcome) {
        let _ = self.slot.outcome.set(outcome);
        self.released_through = generation;
        self.slot = GenerationSlot::new(generation + 1);
        self.arrived.clear();
        self.deadline = None;
    }
}

/// A named rendezvous point.
pub struct Barrier {
    id: String,
    timeout: Duration,
    inner: Mutex<Inner>,
    released: Condvar,
    observers: RwLock<Vec<Arc<dyn BarrierObserver>>>,
}

impl Barrier {
    pub fn new(id: impl Into<String>, callers: impl IntoIterator<Item = BarrierCaller>, timeout: Duration) -> Self {
        let expected = callers.into_iter().collect();

        Self {
            id: id.into(),
            timeout,
            inner: Mutex::new(Inner {
                state: BarrierState::Created,
                expected,
                arrived: BTreeMap::new(),
                deadline: None,
                released_through: 0,
                slot: GenerationSlot::new(1),
                last_responses: HashMap::new(),
                last_timeout: None,
            }),
            released: Condvar::new(),
            observers: RwLock::new(Vec::new()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn add_observer(&self, observer: Arc<dyn BarrierObserver>) {
        let mut observers = self.observers.write().expect("observers lock");
        observers.push(observer);
    }

    pub fn state(&self) -> BarrierState {
        self.inner.lock().expect("barrier lock").state
    }

    /// Number of generations completed so far.
    pub fn released_through(&self) -> u64 {
        self.inner.lock().expect("barrier lock").released_through
    }

    pub fn expected_callers(&self) -> Vec<BarrierCaller> {
        let inner = self.inner.lock().expect("barrier lock");
        inner.expected.iter().cloned().collect()
    }

    /// Arrive at the current generation and block until it completes.
    pub fn sync(&self, caller: &BarrierCaller, request: Vec<u8>) -> BarrierResult<Vec<u8>> {
        let generation = self.inner.lock().expect("barrier lock").slot.generation;
        self.sync_generation(caller, generation, request)
    }

    /// Arrive at `generation` and block until it completes.
    ///
    /// A generation that already completed returns the caller's cached
    /// response immediately and does not count as an arrival.
    pub fn sync_generation(&self, caller: &BarrierCaller, generation: u64, request: Vec<u8>) -> BarrierResult<Vec<u8>> {
        let mut inner = self.inner.lock().expect("barrier lock");

        if inner.state == BarrierState::Deactivated {
            return Err(BarrierError::Deactivated(self.id.clone()));
        }

        if !inner.expected.contains(caller) {
            return Err(BarrierError::UnknownCaller {
                barrier_id: self.id.clone(),
                caller: caller.clone(),
            });
        }

        if generation <= inner.released_through {
            if let Some((timed_out, missing)) = &inner.last_timeout {
                if *timed_out == generation {
                    return Err(BarrierError::TimedOut {
                        barrier_id: self.id.clone(),
                        missing: missing.clone(),
                    });
                }
            }
            debug!(barrier_id = %self.id, %caller, generation, "generation already released");
            let cached = inner
                .last_responses
                .get(caller)
                .filter(|(g, _)| *g == generation)
                .map(|(_, data)| data.clone())
                .unwrap_or_default();
            return Ok(cached);
        }

        let current = inner.slot.generation;
        if generation > current {
            return Err(BarrierError::GenerationAhead {
                barrier_id: self.id.clone(),
                requested: generation,
                expected: current,
            });
        }

        if inner.arrived.contains_key(caller) {
            return Err(BarrierError::DuplicateCaller {
                barrier_id: self.id.clone(),
                caller: caller.clone(),
            });
        }

        inner.arrived.insert(caller.clone(), request);
        if inner.arrived.len() == 1 {
            inner.deadline = Some(Instant::now() + self.timeout);
            inner.state = BarrierState::WaitingForCallers;
        }
        debug!(
            barrier_id = %self.id,
            %caller,
            generation,
            arrived = inner.arrived.len(),
            expected = inner.expected.len(),
            "caller arrived"
        );

        let slot = Arc::clone(&inner.slot);
        if inner.quorum_reached() {
            self.release_locked(&mut inner);
        }

        let mut timed_out = None;
        while slot.outcome.get().is_none() {
            let now = Instant::now();
            match inner.deadline {
                Some(deadline) if now >= deadline && inner.state != BarrierState::Releasing => {
                    let missing = inner.missing();
                    warn!(
                        barrier_id = %self.id,
                        generation = slot.generation,
                        missing = missing.len(),
                        "barrier timed out"
                    );
                    inner.last_timeout = Some((slot.generation, missing.clone()));
                    inner.advance(slot.generation, Outcome::TimedOut(missing.clone()));
                    inner.state = BarrierState::TimedOut;
                    self.released.notify_all();
                    timed_out = Some(missing);
                }
                Some(deadline) => {
                    let wait = deadline.saturating_duration_since(now);
                    inner = self
                        .released
                        .wait_timeout(inner, wait)
                        .expect("barrier lock")
                        .0;
                }
                None => {
                    inner = self.released.wait(inner).expect("barrier lock");
                }
            }
        }
        drop(inner);

        if let Some(missing) = timed_out {
            for observer in self.observers_snapshot() {
                observer.on_timeout(&self.id, slot.generation, &missing);
            }
        }

        match slot.outcome.get() {
            Some(Outcome::Released(responses)) => Ok(responses.get(caller).cloned().unwrap_or_default()),
            Some(Outcome::TimedOut(missing)) => Err(BarrierError::TimedOut {
                barrier_id: self.id.clone(),
                missing: missing.clone(),
            }),
            Some(Outcome::Deactivated) | None => Err(BarrierError::Deactivated(self.id.clone())),
        }
    }

    /// Unregister every caller hosted on `node_id`.
    ///
    /// If the callers already waiting now form a full quorum, the current
    /// generation is released. Returns the number of callers removed.
    pub fn remove_node_callers(&self, node_id: &str) -> usize {
        let mut inner = self.inner.lock().expect("barrier lock");
        let removed: Vec<BarrierCaller> = inner
            .expected
            .iter()
            .filter(|caller| caller.node_id == node_id)
            .cloned()
            .collect();

        for caller in &removed {
            inner.expected.remove(caller);
            inner.arrived.remove(caller);
        }

        if !removed.is_empty() {
            info!(barrier_id = %self.id, %node_id, removed = removed.len(), "removed node callers");
            if inner.state != BarrierState::Deactivated && inner.quorum_reached() {
                self.release_locked(&mut inner);
            }
        }
        removed.len()
    }

    /// Mark every generation up to `generation` as completed.
    ///
    /// Callers currently waiting on one of those generations are released
    /// with an empty response. Lower values are ignored.
    pub fn set_released_through(&self, generation: u64) {
        let mut inner = self.inner.lock().expect("barrier lock");
        if generation <= inner.released_through || inner.state == BarrierState::Deactivated {
            return;
        }

        info!(
            barrier_id = %self.id,
            from = inner.released_through,
            to = generation,
            "fast-forwarding barrier"
        );
        inner.advance(generation, Outcome::Released(Arc::new(BTreeMap::new())));
        inner.state = BarrierState::Idle;
        self.released.notify_all();
    }

    /// Tear the barrier down. Waiting callers unblock with an error.
    pub fn deactivate(&self) {
        let mut inner = self.inner.lock().expect("barrier lock");
        if inner.state == BarrierState::Deactivated {
            return;
        }
        inner.state = BarrierState::Deactivated;
        let _ = inner.slot.outcome.set(Outcome::Deactivated);
        inner.arrived.clear();
        inner.deadline = None;
        self.released.notify_all();
        debug!(barrier_id = %self.id, "barrier deactivated");
    }

    fn release_locked(&self, inner: &mut Inner) {
        inner.state = BarrierState::Releasing;
        let generation = inner.slot.generation;

        let mut data = ReleaseData {
            requests: std::mem::take(&mut inner.arrived),
            responses: BTreeMap::new(),
        };
        for observer in self.observers_snapshot() {
            observer.on_pre_release(&self.id, generation, &mut data);
        }

        for caller in data.requests.keys() {
            let response = data.responses.get(caller).cloned().unwrap_or_default();
            inner.last_responses.insert(caller.clone(), (generation, response));
        }

        inner.advance(generation, Outcome::Released(Arc::new(data.responses)));
        inner.state = BarrierState::Idle;
        self.released.notify_all();
        debug!(barrier_id = %self.id, generation, "barrier released");
    }

    fn observers_snapshot(&self) -> Vec<Arc<dyn BarrierObserver>> {
        self.observers.read().expect("observers lock").clone()
    }
}

impl std::fmt::Debug for Barrier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Barrier")
            .field("id", &self.id)
            .field("timeout", &self.timeout)
            .finish()
    }
}
