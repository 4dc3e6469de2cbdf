// SPDX-License-Identifier: MIT OR Apache-2.0
//! Live values substituted into resolved content at dispatch time.

use indexmap::IndexMap;
use playout_timeline::{Time, TimelineState};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;

/// A datastore value and when it last changed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatastoreEntry {
    /// Current value
    pub value: Value,
    /// Time of the last modification
    #[serde(default)]
    pub modified: Time,
}

impl DatastoreEntry {
    /// Create an entry
    pub fn new(value: impl Into<Value>, modified: Time) -> Self {
        Self {
            value: value.into(),
            modified,
        }
    }
}

/// Key -> entry
pub type Datastore = IndexMap<String, DatastoreEntry>;

/// Copy of `state` with every `$references` field replaced by its datastore value.
///
/// References to missing keys leave the field as it is. With `overwrite` set,
/// a value only applies if it was modified at or after the instance started.
pub fn fill_state_from_datastore(state: &TimelineState, datastore: &Datastore) -> TimelineState {
    let mut filled = state.clone();
    if datastore.is_empty() {
        return filled;
    }
    for entry in filled.layers.values_mut() {
        let started = entry.instance.original_start_or_start();
        let content = &mut entry.object.content;
        let references = std::mem::take(&mut content.references);
        for (path, reference) in &references {
            let Some(stored) = datastore.get(&reference.datastore_key) else {
                continue;
            };
            if reference.overwrite && stored.modified < started {
                continue;
            }
            content.set_path(path, stored.value.clone());
        }
        content.references = references;
    }
    filled
}

/// Datastore keys referenced anywhere in the state
pub fn datastore_dependencies(state: &TimelineState) -> BTreeSet<String> {
    state
        .layers
        .values()
        .flat_map(|entry| entry.object.content.references.values())
        .map(|reference| reference.datastore_key.clone())
        .collect()
}

/// Keys whose value differs between two stores, including added and removed keys
pub fn changed_keys(old: &Datastore, new: &Datastore) -> BTreeSet<String> {
    old.keys()
        .chain(new.keys())
        .filter(|key| old.get(*key).map(|e| &e.value) != new.get(*key).map(|e| &e.value))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use playout_timeline::{
        DatastoreReference, Enable, ResolvedInstance, TimelineContent, TimelineObject, TimelineObjectInstance,
    };
    use serde_json::json;

    fn state_with(content: TimelineContent, start: Time) -> TimelineState {
        let mut state = TimelineState::empty(start);
        state.layers.insert(
            "gfx".to_string(),
            ResolvedInstance {
                object: TimelineObject::new("gfx", Enable::at(start), content).with_id("lower_third"),
                instance: TimelineObjectInstance {
                    id: "@lower_third_0".to_string(),
                    start,
                    end: None,
                    original_start: Some(start),
                    original_end: None,
                    references: Vec::new(),
                },
                parent_id: None,
            },
        );
        state
    }

    fn content_of(state: &TimelineState) -> &TimelineContent {
        &state.layers["gfx"].object.content
    }

    #[test]
    fn test_fill_replaces_referenced_fields() {
        let content = TimelineContent::default()
            .with_field("template", "name")
            .with_reference("data.name", DatastoreReference::new("presenter"));
        let state = state_with(content, 1000);
        let datastore = Datastore::from([("presenter".to_string(), DatastoreEntry::new("Ada", 0))]);

        let filled = fill_state_from_datastore(&state, &datastore);
        assert_eq!(content_of(&filled).get_path("data.name"), Some(&json!("Ada")));
        assert_eq!(content_of(&filled).get_path("template"), Some(&json!("name")));
        // The input is left untouched
        assert_eq!(content_of(&state).get_path("data.name"), None);
    }

    #[test]
    fn test_overwrite_needs_fresh_value() {
        let mut reference = DatastoreReference::new("score");
        reference.overwrite = true;
        let content = TimelineContent::default()
            .with_field("score", 0)
            .with_reference("score", reference);
        let state = state_with(content, 5000);

        let stale = Datastore::from([("score".to_string(), DatastoreEntry::new(3, 4000))]);
        let filled = fill_state_from_datastore(&state, &stale);
        assert_eq!(content_of(&filled).get_path("score"), Some(&json!(0)));

        let fresh = Datastore::from([("score".to_string(), DatastoreEntry::new(4, 5000))]);
        let filled = fill_state_from_datastore(&state, &fresh);
        assert_eq!(content_of(&filled).get_path("score"), Some(&json!(4)));
    }

    #[test]
    fn test_dependencies_and_changed_keys() {
        let content = TimelineContent::default()
            .with_reference("a", DatastoreReference::new("k1"))
            .with_reference("b", DatastoreReference::new("k2"));
        let deps = datastore_dependencies(&state_with(content, 0));
        assert_eq!(deps.into_iter().collect::<Vec<_>>(), vec!["k1", "k2"]);

        let old = Datastore::from([
            ("same".to_string(), DatastoreEntry::new(1, 0)),
            ("changed".to_string(), DatastoreEntry::new(1, 0)),
            ("removed".to_string(), DatastoreEntry::new(1, 0)),
        ]);
        let new = Datastore::from([
            ("same".to_string(), DatastoreEntry::new(1, 100)),
            ("changed".to_string(), DatastoreEntry::new(2, 100)),
            ("added".to_string(), DatastoreEntry::new(1, 100)),
        ]);
        let changed: Vec<_> = changed_keys(&old, &new).into_iter().collect();
        assert_eq!(changed, vec!["added", "changed", "removed"]);
    }
}
