// SPDX-License-Identifier: MIT OR Apache-2.0
//! Per-device state slices and their short history.
//!
//! The history keeps the baseline (latest entry at or before "now") plus
//! everything scheduled after it, which is exactly what has to be pushed
//! again when a datastore value or a device connection changes.

use crate::datastore::datastore_dependencies;
use indexmap::IndexMap;
use playout_timeline::{mappings_for_device, Mappings, Time, TimelineState};
use std::collections::BTreeSet;

/// Default number of entries kept per device
pub const MAX_HISTORY: usize = 100;

/// Split a state into one state per device.
///
/// Every device in `device_ids` gets a state, empty if nothing maps to it.
/// Lookahead objects without a mapping of their own use the mapping of the
/// layer they prepare.
pub fn filter_layers_per_device(
    state: &TimelineState,
    mappings: &Mappings,
    device_ids: &[String],
) -> IndexMap<String, TimelineState> {
    let mut per_device: IndexMap<String, TimelineState> = device_ids
        .iter()
        .map(|id| (id.clone(), TimelineState::empty(state.time)))
        .collect();

    for (layer, entry) in &state.layers {
        let mapping = mappings.get(layer).or_else(|| {
            entry
                .object
                .is_lookahead
                .then_some(entry.object.lookahead_for_layer.as_ref())
                .flatten()
                .and_then(|target| mappings.get(target))
        });
        let Some(device_state) = mapping.and_then(|m| per_device.get_mut(&m.device_id)) else {
            continue;
        };
        device_state.layers.insert(layer.clone(), entry.clone());
    }

    for device_state in per_device.values_mut() {
        device_state.next_events = state
            .next_events
            .iter()
            .filter(|event| device_state.layers.values().any(|e| e.object.id == event.obj_id))
            .cloned()
            .collect();
    }
    per_device
}

/// A state as computed for one device
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceStateEntry {
    /// State time
    pub time: Time,
    /// Unfilled device state
    pub state: TimelineState,
    /// Datastore keys the state refers to
    pub dependencies: BTreeSet<String>,
    /// Mappings of the device
    pub mappings: Mappings,
}

impl DeviceStateEntry {
    /// Build an entry for `device_id` from its state
    pub fn new(device_id: &str, state: TimelineState, mappings: &Mappings) -> Self {
        Self {
            time: state.time,
            dependencies: datastore_dependencies(&state),
            mappings: mappings_for_device(mappings, device_id),
            state,
        }
    }
}

/// Device ID -> recent entries, ordered by time
#[derive(Debug, Clone)]
pub struct DeviceHistories {
    histories: IndexMap<String, Vec<DeviceStateEntry>>,
    max_entries: usize,
}

impl Default for DeviceHistories {
    fn default() -> Self {
        Self::new(MAX_HISTORY)
    }
}

impl DeviceHistories {
    /// Create with a per-device cap
    pub fn new(max_entries: usize) -> Self {
        Self {
            histories: IndexMap::new(),
            max_entries: max_entries.max(1),
        }
    }

    /// Record a new entry for `device_id`.
    ///
    /// Entries at or after the new time are superseded. Of the entries at or
    /// before `now` only the latest survives.
    pub fn record(&mut self, device_id: &str, entry: DeviceStateEntry, now: Time) {
        let history = self.histories.entry(device_id.to_string()).or_default();
        let baseline = history.iter().rposition(|e| e.time <= now);
        let time = entry.time;

        let mut index = 0;
        history.retain(|e| {
            let keep = e.time < time && (e.time > now || Some(index) == baseline);
            index += 1;
            keep
        });
        history.push(entry);

        if history.len() > self.max_entries {
            let skip = usize::from(history.first().is_some_and(|e| e.time <= now) && history.len() > 1);
            let excess = history.len() - self.max_entries;
            history.drain(skip..skip + excess);
        }
    }

    /// The baseline and all entries after `now`, in time order
    pub fn refill_targets(&self, device_id: &str, now: Time) -> Vec<DeviceStateEntry> {
        let Some(history) = self.histories.get(device_id) else {
            return Vec::new();
        };
        let from = history.iter().rposition(|e| e.time <= now).unwrap_or(0);
        history[from..].to_vec()
    }

    /// Devices holding an entry that depends on any of `keys`
    pub fn devices_depending_on(&self, keys: &BTreeSet<String>) -> Vec<String> {
        self.histories
            .iter()
            .filter(|(_, history)| history.iter().any(|e| !e.dependencies.is_disjoint(keys)))
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Drop histories of devices not in `device_ids`
    pub fn retain_devices(&mut self, device_ids: &[String]) {
        self.histories.retain(|id, _| device_ids.contains(id));
    }

    /// Entries recorded for a device
    pub fn history(&self, device_id: &str) -> &[DeviceStateEntry] {
        self.histories.get(device_id).map(Vec::as_slice).unwrap_or_default()
    }

    /// Forget everything
    pub fn clear(&mut self) {
        self.histories.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use playout_timeline::{
        DatastoreReference, DeviceType, Enable, EventKind, Mapping, NextEvent, ResolvedInstance, TimelineContent,
        TimelineObject, TimelineObjectInstance,
    };

    fn instance(object: TimelineObject) -> ResolvedInstance {
        ResolvedInstance {
            instance: TimelineObjectInstance {
                id: format!("@{}_0", object.id),
                start: 0,
                end: None,
                original_start: None,
                original_end: None,
                references: Vec::new(),
            },
            object,
            parent_id: None,
        }
    }

    fn entry(time: Time) -> DeviceStateEntry {
        DeviceStateEntry::new("dev", TimelineState::empty(time), &Mappings::new())
    }

    fn times(histories: &DeviceHistories) -> Vec<Time> {
        histories.history("dev").iter().map(|e| e.time).collect()
    }

    #[test]
    fn test_filter_by_mapping_and_lookahead() {
        let mut state = TimelineState::empty(100);
        let video = TimelineObject::new("video", Enable::at(0), TimelineContent::default()).with_id("clip");
        let lookahead = TimelineObject::new("video_lookahead", Enable::at(0), TimelineContent::default())
            .with_id("next_clip")
            .as_lookahead_for("video");
        let audio = TimelineObject::new("audio", Enable::at(0), TimelineContent::default()).with_id("fader");
        let unmapped = TimelineObject::new("nowhere", Enable::at(0), TimelineContent::default()).with_id("lost");
        for object in [video, lookahead, audio, unmapped] {
            state.layers.insert(object.layer.clone(), instance(object));
        }
        state.next_events.push(NextEvent {
            kind: EventKind::End,
            time: 500,
            obj_id: "fader".to_string(),
        });

        let mappings = Mappings::from([
            ("video".to_string(), Mapping::new(DeviceType::Casparcg, "caspar")),
            ("audio".to_string(), Mapping::new(DeviceType::Lawo, "lawo")),
        ]);
        let devices = vec!["caspar".to_string(), "lawo".to_string(), "idle".to_string()];
        let per_device = filter_layers_per_device(&state, &mappings, &devices);

        let layers = |id: &str| per_device[id].layers.keys().cloned().collect::<Vec<_>>();
        assert_eq!(layers("caspar"), vec!["video", "video_lookahead"]);
        assert_eq!(layers("lawo"), vec!["audio"]);
        assert!(per_device["idle"].layers.is_empty());
        assert_eq!(per_device["lawo"].next_events.len(), 1);
        assert!(per_device["caspar"].next_events.is_empty());
    }

    #[test]
    fn test_entry_collects_dependencies_and_mappings() {
        let content = TimelineContent::default().with_reference("text", DatastoreReference::new("headline"));
        let object = TimelineObject::new("gfx", Enable::at(0), content).with_id("lower_third");
        let mut state = TimelineState::empty(0);
        state.layers.insert("gfx".to_string(), instance(object));
        let mappings = Mappings::from([
            ("gfx".to_string(), Mapping::new(DeviceType::Casparcg, "dev")),
            ("other".to_string(), Mapping::new(DeviceType::Atem, "atem")),
        ]);

        let entry = DeviceStateEntry::new("dev", state, &mappings);
        assert!(entry.dependencies.contains("headline"));
        assert_eq!(entry.mappings.keys().collect::<Vec<_>>(), vec!["gfx"]);
    }

    #[test]
    fn test_record_keeps_baseline_and_future() {
        let mut histories = DeviceHistories::default();
        for time in [1000, 2000, 3000, 4000] {
            histories.record("dev", entry(time), 0);
        }
        assert_eq!(times(&histories), vec![1000, 2000, 3000, 4000]);

        // Two entries have passed; only the latest of them stays
        histories.record("dev", entry(5000), 2500);
        assert_eq!(times(&histories), vec![2000, 3000, 4000, 5000]);

        // A new state replaces everything from its time on
        histories.record("dev", entry(3500), 2600);
        assert_eq!(times(&histories), vec![2000, 3000, 3500]);

        assert_eq!(
            histories.refill_targets("dev", 3200).iter().map(|e| e.time).collect::<Vec<_>>(),
            vec![3000, 3500]
        );
    }

    #[test]
    fn test_record_caps_history_but_keeps_baseline() {
        let mut histories = DeviceHistories::new(3);
        histories.record("dev", entry(0), 0);
        for time in [100, 200, 300, 400] {
            histories.record("dev", entry(time), 50);
        }
        assert_eq!(times(&histories), vec![0, 300, 400]);
    }

    #[test]
    fn test_dependencies_lookup_and_retain() {
        let mut histories = DeviceHistories::default();
        let mut with_dep = entry(100);
        with_dep.dependencies.insert("score".to_string());
        histories.record("dev", with_dep, 0);
        histories.record("other", entry(100), 0);

        let keys = BTreeSet::from(["score".to_string()]);
        assert_eq!(histories.devices_depending_on(&keys), vec!["dev".to_string()]);

        histories.retain_devices(&["other".to_string()]);
        assert!(histories.history("dev").is_empty());
        assert_eq!(histories.history("other").len(), 1);
    }
}
