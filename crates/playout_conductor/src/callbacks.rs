// SPDX-License-Identifier: MIT OR Apache-2.0
//! Start/stop callback debouncing.
//!
//! Objects can ask to be told when they start or stop playing. A start and a
//! stop of the same object within the wait time cancel each other, so brief
//! flicker between ticks never reaches the host.

use crate::events::TimelineCallback;
use indexmap::IndexMap;
use playout_timeline::{Time, TimelineState};
use serde_json::Value;

/// An active object that declared callbacks
#[derive(Debug, Clone, PartialEq)]
pub struct ActiveCallback {
    /// Object ID
    pub object_id: String,
    /// When the instance started
    pub start_time: Time,
    /// Start callback name
    pub callback: Option<String>,
    /// Stop callback name
    pub callback_stopped: Option<String>,
    /// Callback payload
    pub callback_data: Option<Value>,
}

/// Active objects with callbacks, keyed by object, callbacks, start and payload
pub fn active_callbacks(state: &TimelineState) -> IndexMap<String, ActiveCallback> {
    state
        .layers
        .values()
        .filter(|entry| entry.object.content.has_callbacks())
        .map(|entry| {
            let content = &entry.object.content;
            let start_time = entry.instance.original_start_or_start();
            let data = content
                .callback_data
                .as_ref()
                .map(Value::to_string)
                .unwrap_or_default();
            let key = format!(
                "{}_{}_{}_{}_{}",
                entry.object.id,
                content.callback.as_deref().unwrap_or_default(),
                content.callback_stopped.as_deref().unwrap_or_default(),
                start_time,
                data
            );
            let active = ActiveCallback {
                object_id: entry.object.id.clone(),
                start_time,
                callback: content.callback.clone(),
                callback_stopped: content.callback_stopped.clone(),
                callback_data: content.callback_data.clone(),
            };
            (key, active)
        })
        .collect()
}

#[derive(Debug, Clone, Default)]
struct Transition {
    time: Time,
    callback: Option<TimelineCallback>,
}

/// Debounce state of one object
#[derive(Debug, Clone, Default)]
struct CallbackInstance {
    playing: Option<bool>,
    play: Option<Transition>,
    end: Option<Transition>,
}

impl CallbackInstance {
    fn is_pending(&self) -> bool {
        self.play.is_some() || self.end.is_some()
    }
}

/// Debounces start/stop callbacks
#[derive(Debug, Clone)]
pub struct CallbackDebouncer {
    wait_time: Time,
    sent: IndexMap<String, ActiveCallback>,
    instances: IndexMap<String, CallbackInstance>,
}

impl CallbackDebouncer {
    /// Create with a debounce window
    pub fn new(wait_time: Time) -> Self {
        Self {
            wait_time,
            sent: IndexMap::new(),
            instances: IndexMap::new(),
        }
    }

    /// Compare the active set of a tick with the previous one and queue transitions.
    ///
    /// Returns whether anything was queued.
    pub fn diff_active(&mut self, active: IndexMap<String, ActiveCallback>, state_time: Time) -> bool {
        let mut queued = false;
        for (key, object) in &active {
            if self.sent.contains_key(key) {
                continue;
            }
            if let Some(callback) = &object.callback {
                queued |= self.queue(
                    true,
                    TimelineCallback {
                        time: object.start_time,
                        instance_id: object.object_id.clone(),
                        callback: callback.clone(),
                        callback_data: object.callback_data.clone(),
                    },
                );
            }
        }

        let stopped: Vec<TimelineCallback> = self
            .sent
            .iter()
            .filter(|(key, _)| !active.contains_key(*key))
            .filter_map(|(_, object)| {
                Some(TimelineCallback {
                    time: state_time,
                    instance_id: object.object_id.clone(),
                    callback: object.callback_stopped.clone()?,
                    callback_data: object.callback_data.clone(),
                })
            })
            .collect();
        for callback in stopped {
            queued |= self.queue(false, callback);
        }

        self.sent = active;
        queued
    }

    /// Request a transition; an opposite pending transition within the wait time cancels out.
    ///
    /// Returns whether anything is pending afterwards for this object.
    pub fn queue(&mut self, playing: bool, callback: TimelineCallback) -> bool {
        let wait_time = self.wait_time;
        let instance_id = callback.instance_id.clone();
        let instance = self.instances.entry(instance_id.clone()).or_default();
        if instance.playing == Some(playing) {
            return instance.is_pending();
        }
        instance.playing = Some(playing);

        let (opposite, same) = if playing {
            (&mut instance.end, &mut instance.play)
        } else {
            (&mut instance.play, &mut instance.end)
        };
        if opposite.as_ref().is_some_and(|t| (callback.time - t.time).abs() < wait_time) {
            tracing::trace!(instance_id = %callback.instance_id, "callback annihilated");
            *opposite = None;
        } else {
            *same = Some(Transition {
                time: callback.time,
                callback: Some(callback),
            });
        }

        let pending = instance.is_pending();
        if !pending && !playing {
            self.instances.shift_remove(&instance_id);
        }
        pending
    }

    /// Fire transitions that are at least the wait time old.
    ///
    /// Stops come before starts, then ordered by time. Also returns the
    /// earliest time a remaining transition becomes due.
    pub fn flush(&mut self, now: Time) -> (Vec<TimelineCallback>, Option<Time>) {
        let due_before = now - self.wait_time;
        let mut fired: Vec<(bool, TimelineCallback)> = Vec::new();
        let mut next_due: Option<Time> = None;

        for instance in self.instances.values_mut() {
            for (is_start, slot) in [(false, &mut instance.end), (true, &mut instance.play)] {
                let Some(transition) = slot else {
                    continue;
                };
                if transition.time <= due_before {
                    if let Some(callback) = transition.callback.take() {
                        fired.push((is_start, callback));
                    }
                    *slot = None;
                } else {
                    let due = transition.time + self.wait_time;
                    next_due = Some(next_due.map_or(due, |t| t.min(due)));
                }
            }
        }
        self.instances.retain(|_, i| i.is_pending() || i.playing == Some(true));

        fired.sort_by_key(|(is_start, callback)| (*is_start, callback.time));
        (fired.into_iter().map(|(_, callback)| callback).collect(), next_due)
    }

    /// Whether any transition is pending
    pub fn has_pending(&self) -> bool {
        self.instances.values().any(CallbackInstance::is_pending)
    }
}
