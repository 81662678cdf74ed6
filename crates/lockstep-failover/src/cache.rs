//! Per-frame cache of GET transaction results.

use std::collections::BTreeMap;
use std::sync::Mutex;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::warn;

use lockstep_core::CachedEntry;

/// Last result of every GET transaction, tagged with the frame
/// generation it was fetched in.
///
/// Entries are stored serialized so they can be handed to a new primary
/// during recovery and replayed bit-for-bit.
#[derive(Debug, Default)]
pub struct DataCache {
    entries: Mutex<BTreeMap<String, CachedEntry>>,
}

impl DataCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached value of `name` if it was fetched in `generation`.
    pub fn get<T: DeserializeOwned>(&self, name: &str, generation: u64) -> Option<T> {
        let entries = self.entries.lock().expect("data cache lock");
        let entry = entries.get(name).filter(|e| e.generation == generation)?;
        match serde_json::from_slice(&entry.data) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(name, generation, error = %e, "discarding undecodable cache entry");
                None
            }
        }
    }

    pub fn put<T: Serialize>(&self, name: &str, generation: u64, value: &T) {
        let data = match serde_json::to_vec(value) {
            Ok(data) => data,
            Err(e) => {
                warn!(name, generation, error = %e, "result not cached");
                return;
            }
        };
        self.entries
            .lock()
            .expect("data cache lock")
            .insert(name.to_string(), CachedEntry { generation, data });
    }

    /// Take entries from a merged recovery state. Newer generations win.
    pub fn fill(&self, merged: &BTreeMap<String, CachedEntry>) {
        let mut entries = self.entries.lock().expect("data cache lock");
        for (name, entry) in merged {
            match entries.get(name) {
                Some(existing) if existing.generation >= entry.generation => {}
                _ => {
                    entries.insert(name.clone(), entry.clone());
                }
            }
        }
    }

    pub fn entries(&self) -> BTreeMap<String, CachedEntry> {
        self.entries.lock().expect("data cache lock").clone()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("data cache lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn reset(&self) {
        self.entries.lock().expect("data cache lock").clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lockstep_core::TimeData;

    fn time(game_time: f64) -> TimeData {
        TimeData {
            delta_time: 1.0 / 60.0,
            game_time,
            frame_time: None,
        }
    }

    #[test]
    fn hit_only_within_the_same_generation() {
        let cache = DataCache::new();
        cache.put("GetTimeData", 3, &time(1.5));

        assert_eq!(cache.get::<TimeData>("GetTimeData", 3), Some(time(1.5)));
        assert_eq!(cache.get::<TimeData>("GetTimeData", 4), None);
        assert_eq!(cache.get::<TimeData>("GetEventsData", 3), None);
    }

    #[test]
    fn fill_keeps_the_newest() {
        let cache = DataCache::new();
        cache.put("GetTimeData", 5, &time(5.0));

        let other = DataCache::new();
        other.put("GetTimeData", 4, &time(4.0));
        other.put("GetNativeInputData", 4, &std::collections::HashMap::<String, String>::new());

        cache.fill(&other.entries());
        assert_eq!(cache.get::<TimeData>("GetTimeData", 5), Some(time(5.0)));
        assert_eq!(cache.len(), 2);

        cache.reset();
        assert!(cache.is_empty());
    }
}
