//! Pending cluster events collected on the primary between frames.

use lockstep_core::{ClusterEventBinary, ClusterEventJson, EventsData};

/// Events queued for the next frame.
///
/// An event flagged `should_discard_on_repeat` replaces any earlier pending
/// event with the same key that carries the same flag.
#[derive(Debug, Default)]
pub struct EventQueue {
    json: Vec<ClusterEventJson>,
    binary: Vec<ClusterEventBinary>,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_json(&mut self, event: ClusterEventJson) {
        if event.should_discard_on_repeat {
            let key = event.dedup_key();
            self.json
                .retain(|e| !(e.should_discard_on_repeat && e.dedup_key() == key));
        }
        self.json.push(event);
    }

    pub fn push_binary(&mut self, event: ClusterEventBinary) {
        if event.should_discard_on_repeat {
            self.binary
                .retain(|e| !(e.should_discard_on_repeat && e.event_id == event.event_id));
        }
        self.binary.push(event);
    }

    pub fn len(&self) -> usize {
        self.json.len() + self.binary.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drain every pending event, oldest first.
    pub fn take(&mut self) -> EventsData {
        EventsData {
            json: std::mem::take(&mut self.json),
            binary: std::mem::take(&mut self.binary),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn json(name: &str, value: &str, discard: bool) -> ClusterEventJson {
        ClusterEventJson {
            category: "camera".into(),
            event_type: "move".into(),
            name: name.into(),
            parameters: HashMap::from([("v".to_string(), value.to_string())]),
            is_system_event: false,
            should_discard_on_repeat: discard,
        }
    }

    #[test]
    fn discard_on_repeat_keeps_latest() {
        let mut queue = EventQueue::new();
        queue.push_json(json("main", "1", true));
        queue.push_json(json("side", "1", true));
        queue.push_json(json("main", "2", true));

        let events = queue.take();
        assert_eq!(events.json.len(), 2);
        assert_eq!(events.json[0].name, "side");
        assert_eq!(events.json[1].parameters["v"], "2");
        assert!(queue.is_empty());
    }

    #[test]
    fn repeatable_events_accumulate() {
        let mut queue = EventQueue::new();
        queue.push_json(json("main", "1", false));
        queue.push_json(json("main", "2", false));
        queue.push_json(json("main", "3", true));
        assert_eq!(queue.len(), 3);
    }

    #[test]
    fn binary_events_dedup_by_id() {
        let mut queue = EventQueue::new();
        for (id, byte) in [(7, 1u8), (8, 2), (7, 3)] {
            queue.push_binary(ClusterEventBinary {
                event_id: id,
                event_data: vec![byte],
                is_system_event: false,
                should_discard_on_repeat: true,
            });
        }

        let events = queue.take();
        let ids: Vec<i32> = events.binary.iter().map(|e| e.event_id).collect();
        assert_eq!(ids, vec![8, 7]);
        assert_eq!(events.binary[1].event_data, vec![3]);
    }
}
