// SPDX-License-Identifier: MIT OR Apache-2.0
//! Resolved timelines and the state slices computed from them.

use crate::object::{Time, TimelineObject};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// A concrete interval during which an object is active
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineObjectInstance {
    /// Instance ID, unique within its object
    pub id: String,
    /// Start, clipped to the parent
    pub start: Time,
    /// End (exclusive), `None` when open ended
    pub end: Option<Time>,
    /// Start before clipping
    pub original_start: Option<Time>,
    /// End before clipping
    pub original_end: Option<Time>,
    /// IDs of objects this instance's timing refers to
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub references: Vec<String>,
}

impl TimelineObjectInstance {
    /// Whether `time` falls inside the instance
    pub fn is_active_at(&self, time: Time) -> bool {
        self.start <= time && self.end.map_or(true, |end| end > time)
    }

    /// The unclipped start
    pub fn original_start_or_start(&self) -> Time {
        self.original_start.unwrap_or(self.start)
    }
}

/// Resolution result for a single object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedObject {
    /// The object, without its children
    pub object: TimelineObject,
    /// ID of the parent group
    pub parent_id: Option<String>,
    /// Nesting depth, 0 for top level
    pub depth: usize,
    /// Concrete instances, sorted by start
    pub instances: Vec<TimelineObjectInstance>,
}

impl ResolvedObject {
    /// Instance active at `time`
    pub fn instance_at(&self, time: Time) -> Option<&TimelineObjectInstance> {
        self.instances.iter().find(|i| i.is_active_at(time))
    }
}

/// Statistics gathered while resolving
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolveStatistics {
    /// Number of objects resolved
    pub resolved_object_count: usize,
    /// Number of instances produced
    pub resolved_instance_count: usize,
    /// Objects served from the resolve cache
    pub cached_object_count: usize,
}

/// A fully resolved timeline, valid for a window starting at `time`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedTimeline {
    /// Time the timeline was resolved at
    pub time: Time,
    /// Time up to which repeating objects were expanded
    pub limit_time: Time,
    /// Object ID -> resolution
    pub objects: IndexMap<String, ResolvedObject>,
    /// Resolve statistics
    pub statistics: ResolveStatistics,
}

/// An object instance placed on a layer in a state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedInstance {
    /// The object with keyframes applied
    pub object: TimelineObject,
    /// The active instance
    pub instance: TimelineObjectInstance,
    /// Parent group ID
    pub parent_id: Option<String>,
}

/// Kind of an upcoming event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EventKind {
    /// An instance starts
    Start,
    /// An instance ends
    End,
    /// A keyframe starts or ends
    Keyframe,
}

/// An upcoming change in the timeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NextEvent {
    /// Event kind
    #[serde(rename = "type")]
    pub kind: EventKind,
    /// Event time
    pub time: Time,
    /// Object the event belongs to
    pub obj_id: String,
}

/// The state of all layers at one point in time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineState {
    /// Time of the slice
    pub time: Time,
    /// Layer -> active instance
    pub layers: IndexMap<String, ResolvedInstance>,
    /// Upcoming events, ordered by time
    pub next_events: Vec<NextEvent>,
}

impl TimelineState {
    /// An empty state at `time`
    pub fn empty(time: Time) -> Self {
        Self {
            time,
            layers: IndexMap::new(),
            next_events: Vec::new(),
        }
    }
}
