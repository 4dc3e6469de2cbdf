// SPDX-License-Identifier: MIT OR Apache-2.0
//! Timeline object definitions.
//!
//! A timeline is a tree of [`TimelineObject`]s. Each object says *when* it is
//! active (its [`EnableSpec`]) and *what* should be on its layer while it is
//! active (its [`TimelineContent`]).

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Milliseconds since the Unix epoch (or any shared monotonic origin)
pub type Time = i64;

/// Sentinel start value meaning "fix me to the current time"
pub const NOW: &str = "now";

/// A point in time, either absolute or symbolic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TimeExpr {
    /// Absolute time (group-relative for children)
    Absolute(Time),
    /// Expression such as `"now"`, `"#a.end + 100"` or `"1500"`
    Expression(String),
}

impl TimeExpr {
    /// The `"now"` sentinel
    pub fn now() -> Self {
        Self::Expression(NOW.to_string())
    }

    /// Whether this is the `"now"` sentinel
    pub fn is_now(&self) -> bool {
        matches!(self, Self::Expression(e) if e.trim() == NOW)
    }

    /// Absolute value, if any
    pub fn as_absolute(&self) -> Option<Time> {
        match self {
            Self::Absolute(t) => Some(*t),
            Self::Expression(_) => None,
        }
    }
}

impl From<Time> for TimeExpr {
    fn from(value: Time) -> Self {
        Self::Absolute(value)
    }
}

impl From<&str> for TimeExpr {
    fn from(value: &str) -> Self {
        Self::Expression(value.to_string())
    }
}

/// When an object is enabled
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Enable {
    /// Start of the object
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<TimeExpr>,
    /// End of the object (exclusive)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<TimeExpr>,
    /// Duration, used when `end` is not set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<TimeExpr>,
    /// Repeat interval in ms
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repeating: Option<Time>,
    /// Condition-style enable; only the "always on" form `1` is supported
    #[serde(rename = "while", default, skip_serializing_if = "Option::is_none")]
    pub while_: Option<TimeExpr>,
}

impl Enable {
    /// Enable starting at an absolute time
    pub fn at(start: Time) -> Self {
        Self {
            start: Some(TimeExpr::Absolute(start)),
            ..Default::default()
        }
    }

    /// Enable starting at a symbolic expression
    pub fn at_expr(start: impl Into<String>) -> Self {
        Self {
            start: Some(TimeExpr::Expression(start.into())),
            ..Default::default()
        }
    }

    /// Enable starting "now"
    pub fn now() -> Self {
        Self {
            start: Some(TimeExpr::now()),
            ..Default::default()
        }
    }

    /// Always-on enable (`while: 1`)
    pub fn always() -> Self {
        Self {
            while_: Some(TimeExpr::Absolute(1)),
            ..Default::default()
        }
    }

    /// Set the duration
    pub fn with_duration(mut self, duration: Time) -> Self {
        self.duration = Some(TimeExpr::Absolute(duration));
        self
    }

    /// Set the end
    pub fn with_end(mut self, end: impl Into<TimeExpr>) -> Self {
        self.end = Some(end.into());
        self
    }

    /// Set the repeat interval
    pub fn with_repeating(mut self, interval: Time) -> Self {
        self.repeating = Some(interval);
        self
    }

    /// Whether the start is the `"now"` sentinel
    pub fn starts_now(&self) -> bool {
        self.start.as_ref().is_some_and(TimeExpr::is_now)
    }

    /// Whether this is the always-on form
    pub fn is_always(&self) -> bool {
        match &self.while_ {
            Some(TimeExpr::Absolute(1)) => true,
            Some(TimeExpr::Expression(e)) => matches!(e.trim(), "1" | "true"),
            _ => false,
        }
    }
}

/// One or several enables for an object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EnableSpec {
    /// A single enable
    Single(Enable),
    /// Several enables, each producing its own instances
    Multiple(Vec<Enable>),
}

impl EnableSpec {
    /// All enables
    pub fn iter(&self) -> impl Iterator<Item = &Enable> {
        let slice: &[Enable] = match self {
            Self::Single(enable) => std::slice::from_ref(enable),
            Self::Multiple(enables) => enables,
        };
        slice.iter()
    }

    /// The single enable, if this is not a list
    pub fn single(&self) -> Option<&Enable> {
        match self {
            Self::Single(enable) => Some(enable),
            Self::Multiple(_) => None,
        }
    }

    /// Mutable access to the single enable, if this is not a list
    pub fn single_mut(&mut self) -> Option<&mut Enable> {
        match self {
            Self::Single(enable) => Some(enable),
            Self::Multiple(_) => None,
        }
    }
}

impl Default for EnableSpec {
    fn default() -> Self {
        Self::Single(Enable::default())
    }
}

impl From<Enable> for EnableSpec {
    fn from(value: Enable) -> Self {
        Self::Single(value)
    }
}

/// Kind of device a piece of content is meant for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviceType {
    /// Does nothing with its state
    #[default]
    Abstract,
    /// Vision mixer
    Atem,
    /// Graphics/video server
    Casparcg,
    /// Disk recorder
    Hyperdeck,
    /// Audio mixer
    Lawo,
    /// Audio mixer
    Sisyfos,
    /// Video server
    Quantel,
    /// Robotic camera head
    Panasonic,
    /// Generic HTTP endpoint
    Http,
    /// Generic OSC endpoint
    Osc,
}

impl DeviceType {
    /// Get the display name
    pub fn name(&self) -> &'static str {
        match self {
            Self::Abstract => "Abstract",
            Self::Atem => "ATEM",
            Self::Casparcg => "CasparCG",
            Self::Hyperdeck => "HyperDeck",
            Self::Lawo => "Lawo",
            Self::Sisyfos => "Sisyfos",
            Self::Quantel => "Quantel",
            Self::Panasonic => "Panasonic PTZ",
            Self::Http => "HTTP",
            Self::Osc => "OSC",
        }
    }
}

/// Placeholder pointing a content field at a datastore key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatastoreReference {
    /// Key in the datastore
    pub datastore_key: String,
    /// Only apply values modified after the object started
    #[serde(default)]
    pub overwrite: bool,
}

impl DatastoreReference {
    /// Reference a datastore key
    pub fn new(datastore_key: impl Into<String>) -> Self {
        Self {
            datastore_key: datastore_key.into(),
            overwrite: false,
        }
    }
}

/// Content of a timeline object.
///
/// The payload is opaque to the scheduler; only device integrations
/// interpret it, keyed by `device_type`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineContent {
    /// Device type discriminant
    #[serde(default)]
    pub device_type: DeviceType,
    /// Callback to fire when an instance starts playing
    #[serde(rename = "callBack", default, skip_serializing_if = "Option::is_none")]
    pub callback: Option<String>,
    /// Callback to fire when an instance stops playing
    #[serde(rename = "callBackStopped", default, skip_serializing_if = "Option::is_none")]
    pub callback_stopped: Option<String>,
    /// Data passed along with callbacks
    #[serde(rename = "callBackData", default, skip_serializing_if = "Option::is_none")]
    pub callback_data: Option<Value>,
    /// Field path -> datastore reference
    #[serde(rename = "$references", default, skip_serializing_if = "IndexMap::is_empty")]
    pub references: IndexMap<String, DatastoreReference>,
    /// Device specific payload
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl TimelineContent {
    /// Create empty content for a device type
    pub fn new(device_type: DeviceType) -> Self {
        Self {
            device_type,
            ..Default::default()
        }
    }

    /// Add a payload field
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }

    /// Add a datastore reference for a field path
    pub fn with_reference(mut self, path: impl Into<String>, reference: DatastoreReference) -> Self {
        self.references.insert(path.into(), reference);
        self
    }

    /// Set start/stop callbacks
    pub fn with_callbacks(
        mut self,
        callback: Option<&str>,
        callback_stopped: Option<&str>,
        data: Option<Value>,
    ) -> Self {
        self.callback = callback.map(str::to_string);
        self.callback_stopped = callback_stopped.map(str::to_string);
        self.callback_data = data;
        self
    }

    /// Whether start or stop callbacks are declared
    pub fn has_callbacks(&self) -> bool {
        self.callback.is_some() || self.callback_stopped.is_some()
    }

    /// Set a payload value at a dot separated path, creating objects on the way
    pub fn set_path(&mut self, path: &str, value: Value) {
        let mut parts = path.split('.').filter(|p| !p.is_empty()).peekable();
        let mut current = &mut self.payload;
        while let Some(part) = parts.next() {
            if parts.peek().is_none() {
                current.insert(part.to_string(), value);
                return;
            }
            let entry = current
                .entry(part.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !entry.is_object() {
                *entry = Value::Object(Map::new());
            }
            current = match entry {
                Value::Object(map) => map,
                _ => return,
            };
        }
    }

    /// Get a payload value at a dot separated path
    pub fn get_path(&self, path: &str) -> Option<&Value> {
        let mut parts = path.split('.').filter(|p| !p.is_empty());
        let first = parts.next()?;
        parts.try_fold(self.payload.get(first)?, |value, part| value.get(part))
    }

    /// Deep-merge a keyframe overlay into the payload
    pub fn merge_overlay(&mut self, overlay: &Map<String, Value>) {
        merge_maps(&mut self.payload, overlay);
    }
}

fn merge_maps(target: &mut Map<String, Value>, overlay: &Map<String, Value>) {
    for (key, value) in overlay {
        match (target.get_mut(key), value) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => merge_maps(existing, incoming),
            _ => {
                target.insert(key.clone(), value.clone());
            }
        }
    }
}

/// Partial content overlay active during part of its parent object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineKeyframe {
    /// Unique keyframe ID
    pub id: String,
    /// Enable, relative to the parent instance start
    pub enable: Enable,
    /// Content overlay
    #[serde(default)]
    pub content: Map<String, Value>,
    /// Disabled keyframes are ignored
    #[serde(default)]
    pub disabled: bool,
}

impl TimelineKeyframe {
    /// Create a keyframe
    pub fn new(id: impl Into<String>, enable: Enable, content: Map<String, Value>) -> Self {
        Self {
            id: id.into(),
            enable,
            content,
            disabled: false,
        }
    }
}

/// A node in the timeline tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineObject {
    /// Unique across the whole flattened tree
    pub id: String,
    /// When the object is active
    pub enable: EnableSpec,
    /// Target layer (key into the mappings)
    #[serde(default)]
    pub layer: String,
    /// Whether this object groups children
    #[serde(default)]
    pub is_group: bool,
    /// Child objects (groups only)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<TimelineObject>,
    /// Keyframe overlays
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keyframes: Vec<TimelineKeyframe>,
    /// Device content
    #[serde(default)]
    pub content: TimelineContent,
    /// Class tags
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub classes: Vec<String>,
    /// Layer conflict tie-break, higher wins
    #[serde(default)]
    pub priority: i32,
    /// Preparatory instance for another layer
    #[serde(default)]
    pub is_lookahead: bool,
    /// Layer this lookahead is preparing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lookahead_for_layer: Option<String>,
    /// Ignore keyframes when building states
    #[serde(default)]
    pub disable_keyframes: bool,
}

impl TimelineObject {
    /// Create an object with a random ID
    pub fn new(layer: impl Into<String>, enable: impl Into<EnableSpec>, content: TimelineContent) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            enable: enable.into(),
            layer: layer.into(),
            is_group: false,
            children: Vec::new(),
            keyframes: Vec::new(),
            content,
            classes: Vec::new(),
            priority: 0,
            is_lookahead: false,
            lookahead_for_layer: None,
            disable_keyframes: false,
        }
    }

    /// Create a group object
    pub fn group(enable: impl Into<EnableSpec>, children: Vec<TimelineObject>) -> Self {
        let mut group = Self::new("", enable, TimelineContent::default());
        group.is_group = true;
        group.children = children;
        group
    }

    /// Set the ID
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Set the priority
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Add a keyframe
    pub fn with_keyframe(mut self, keyframe: TimelineKeyframe) -> Self {
        self.keyframes.push(keyframe);
        self
    }

    /// Mark as lookahead for another layer
    pub fn as_lookahead_for(mut self, layer: impl Into<String>) -> Self {
        self.is_lookahead = true;
        self.lookahead_for_layer = Some(layer.into());
        self
    }

    /// The start of the single enable, if any
    pub fn start(&self) -> Option<&TimeExpr> {
        self.enable.single().and_then(|e| e.start.as_ref())
    }

    /// Number of objects in this subtree plus their keyframes
    pub fn size(&self) -> usize {
        1 + self.keyframes.len() + self.children.iter().map(Self::size).sum::<usize>()
    }

    /// Visit this object and all descendants, depth first, with their parent
    pub fn visit<'a>(&'a self, parent: Option<&'a TimelineObject>, f: &mut impl FnMut(&'a TimelineObject, Option<&'a TimelineObject>)) {
        f(self, parent);
        for child in &self.children {
            child.visit(Some(self), f);
        }
    }

    /// Visit this object and all descendants mutably, depth first
    pub fn visit_mut(&mut self, f: &mut impl FnMut(&mut TimelineObject)) {
        f(self);
        for child in &mut self.children {
            child.visit_mut(f);
        }
    }
}

/// Total number of objects, nested children and keyframes in a timeline
pub fn timeline_size(timeline: &[TimelineObject]) -> usize {
    timeline.iter().map(TimelineObject::size).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_now_sentinel() {
        assert!(TimeExpr::now().is_now());
        assert!(!TimeExpr::Absolute(0).is_now());
        assert!(!TimeExpr::from("#a.end").is_now());
        assert!(Enable::now().starts_now());
    }

    #[test]
    fn test_content_deserialize() {
        let content: TimelineContent = serde_json::from_value(json!({
            "deviceType": "CASPARCG",
            "callBack": "started",
            "$references": { "text.title": { "datastoreKey": "title" } },
            "text": { "title": "placeholder" },
            "layer": 10
        }))
        .unwrap();

        assert_eq!(content.device_type, DeviceType::Casparcg);
        assert_eq!(content.callback.as_deref(), Some("started"));
        assert_eq!(content.references["text.title"].datastore_key, "title");
        assert_eq!(content.get_path("text.title"), Some(&json!("placeholder")));
        assert_eq!(content.payload.get("layer"), Some(&json!(10)));
    }

    #[test]
    fn test_set_path_creates_objects() {
        let mut content = TimelineContent::new(DeviceType::Http).with_field("url", "x");
        content.set_path("params.body.value", json!(5));
        assert_eq!(content.get_path("params.body.value"), Some(&json!(5)));

        content.set_path("url", json!("y"));
        assert_eq!(content.payload["url"], json!("y"));
    }

    #[test]
    fn test_timeline_size_counts_children_and_keyframes() {
        let child = TimelineObject::new("L1", Enable::at(0), TimelineContent::default())
            .with_keyframe(TimelineKeyframe::new("kf", Enable::at(10), Map::new()));
        let group = TimelineObject::group(Enable::at(0), vec![child]);
        let single = TimelineObject::new("L2", Enable::now(), TimelineContent::default());

        assert_eq!(timeline_size(&[group, single]), 4);
    }

    #[test]
    fn test_merge_overlay_is_deep() {
        let mut content = TimelineContent::default().with_field("mix", json!({"input": 1, "rate": 25}));
        let overlay = json!({"mix": {"input": 2}}).as_object().cloned().unwrap();
        content.merge_overlay(&overlay);
        assert_eq!(content.payload["mix"], json!({"input": 2, "rate": 25}));
    }
}
