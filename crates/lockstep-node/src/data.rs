//! Frame data published by the primary.

use std::collections::{BTreeMap, HashMap};

use lockstep_core::{EventsData, SyncGroup, TimeData};

/// Application state replicated from the primary to every node.
///
/// Sampled once per frame, when the frame-start barrier releases on the
/// node that hosts it.
pub trait ClusterDataSource: Send + Sync {
    fn time_data(&self) -> TimeData;

    fn objects(&self, _group: SyncGroup) -> HashMap<String, String> {
        HashMap::new()
    }

    fn native_input(&self) -> HashMap<String, String> {
        HashMap::new()
    }
}

/// Data source for nodes that never publish anything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullDataSource;

impl ClusterDataSource for NullDataSource {
    fn time_data(&self) -> TimeData {
        TimeData::default()
    }
}

/// Everything the GET requests of one frame are answered from.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrameSnapshot {
    /// Frame-start generation the snapshot was taken for.
    pub generation: u64,
    pub time_data: TimeData,
    pub objects: BTreeMap<SyncGroup, HashMap<String, String>>,
    pub native_input: HashMap<String, String>,
    pub events: EventsData,
}

impl FrameSnapshot {
    pub fn capture(source: &dyn ClusterDataSource, generation: u64, events: EventsData) -> Self {
        Self {
            generation,
            time_data: source.time_data(),
            objects: SyncGroup::ALL
                .iter()
                .map(|&group| (group, source.objects(group)))
                .collect(),
            native_input: source.native_input(),
            events,
        }
    }

    pub fn objects(&self, group: SyncGroup) -> HashMap<String, String> {
        self.objects.get(&group).cloned().unwrap_or_default()
    }
}
