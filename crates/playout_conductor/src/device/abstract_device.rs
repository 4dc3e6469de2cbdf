// SPDX-License-Identifier: MIT OR Apache-2.0
//! A device that only computes and logs commands.
//!
//! Useful as a stand-in for real hardware: every state is diffed against the
//! previous one into added/changed/removed commands, which are queued by time
//! and considered sent once their time has passed.

use super::{Device, DeviceFactory, DeviceOptions};
use crate::clock::Clock;
use crate::error::DeviceError;
use async_trait::async_trait;
use indexmap::IndexMap;
use parking_lot::Mutex;
use playout_timeline::{DeviceType, Mappings, Time, TimelineContent, TimelineState};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Number of handled states kept for diffing
const MAX_STATES: usize = 20;
/// Number of sent commands, handled states and clear calls kept for inspection
pub const MAX_RECORDED: usize = 1000;

/// What happened to a layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbstractCommandKind {
    /// An object appeared
    Added,
    /// The object or its content changed
    Changed,
    /// The layer became empty
    Removed,
}

/// A command computed from a state change
#[derive(Debug, Clone, PartialEq)]
pub struct AbstractCommand {
    /// Time the command should execute
    pub time: Time,
    /// Affected layer
    pub layer: String,
    /// Kind of change
    pub kind: AbstractCommandKind,
    /// Object now on the layer
    pub obj_id: Option<String>,
    /// Content now on the layer
    pub content: Option<TimelineContent>,
}

/// Diff two states layer by layer
pub fn diff_states(old: &TimelineState, new: &TimelineState) -> Vec<AbstractCommand> {
    let mut commands = Vec::new();
    for (layer, entry) in &new.layers {
        let kind = match old.layers.get(layer) {
            None => AbstractCommandKind::Added,
            Some(prev) if prev.object.id != entry.object.id || prev.object.content != entry.object.content => {
                AbstractCommandKind::Changed
            }
            Some(_) => continue,
        };
        commands.push(AbstractCommand {
            time: new.time,
            layer: layer.clone(),
            kind,
            obj_id: Some(entry.object.id.clone()),
            content: Some(entry.object.content.clone()),
        });
    }
    for layer in old.layers.keys().filter(|l| !new.layers.contains_key(*l)) {
        commands.push(AbstractCommand {
            time: new.time,
            layer: layer.clone(),
            kind: AbstractCommandKind::Removed,
            obj_id: None,
            content: None,
        });
    }
    commands
}

#[derive(Default)]
struct Inner {
    states: Vec<TimelineState>,
    queue: Vec<AbstractCommand>,
    sent: Vec<AbstractCommand>,
    handled: Vec<TimelineState>,
    cleared: Vec<Time>,
}

/// Drop the oldest items beyond `max`
fn truncate_front<T>(items: &mut Vec<T>, max: usize) {
    if items.len() > max {
        let excess = items.len() - max;
        items.drain(..excess);
    }
}

impl Inner {
    fn flush_due(&mut self, now: Time) {
        let (due, pending): (Vec<_>, Vec<_>) = self.queue.drain(..).partition(|c| c.time <= now);
        self.queue = pending;
        self.sent.extend(due);
        truncate_front(&mut self.sent, MAX_RECORDED);
    }
}

/// Device that diffs states into commands without talking to anything
pub struct AbstractDevice {
    device_id: String,
    clock: Arc<dyn Clock>,
    debug: AtomicBool,
    debug_state: AtomicBool,
    inner: Mutex<Inner>,
}

impl AbstractDevice {
    /// Create a device
    pub fn new(device_id: impl Into<String>, clock: Arc<dyn Clock>) -> Self {
        Self {
            device_id: device_id.into(),
            clock,
            debug: AtomicBool::new(false),
            debug_state: AtomicBool::new(false),
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Device ID
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// The most recent commands whose time has passed, in execution order
    pub fn sent_commands(&self) -> Vec<AbstractCommand> {
        let mut inner = self.inner.lock();
        inner.flush_due(self.clock.now());
        inner.sent.clone()
    }

    /// Commands still waiting for their time
    pub fn queued_commands(&self) -> Vec<AbstractCommand> {
        let mut inner = self.inner.lock();
        inner.flush_due(self.clock.now());
        inner.queue.clone()
    }

    /// The most recent states handed to the device, in order
    pub fn handled_states(&self) -> Vec<TimelineState> {
        self.inner.lock().handled.clone()
    }

    /// Times passed to recent `clear_future` calls
    pub fn cleared_futures(&self) -> Vec<Time> {
        self.inner.lock().cleared.clone()
    }
}

#[async_trait]
impl Device for AbstractDevice {
    fn device_type(&self) -> DeviceType {
        DeviceType::Abstract
    }

    async fn handle_state(&self, state: TimelineState, _mappings: Mappings) -> Result<(), DeviceError> {
        if self.debug_state.load(Ordering::Relaxed) {
            tracing::debug!(device_id = %self.device_id, time = state.time, layers = state.layers.len(), "handle state");
        }
        let mut inner = self.inner.lock();
        inner.flush_due(self.clock.now());

        let time = state.time;
        let previous = inner
            .states
            .iter()
            .rev()
            .find(|s| s.time < time)
            .cloned()
            .unwrap_or_else(|| TimelineState::empty(time));
        let commands = diff_states(&previous, &state);

        inner.queue.retain(|c| c.time < time);
        if self.debug.load(Ordering::Relaxed) {
            for command in &commands {
                tracing::debug!(device_id = %self.device_id, ?command, "queue command");
            }
        }
        inner.queue.extend(commands);

        inner.states.retain(|s| s.time < time);
        inner.states.push(state.clone());
        truncate_front(&mut inner.states, MAX_STATES);
        inner.handled.push(state);
        truncate_front(&mut inner.handled, MAX_RECORDED);
        Ok(())
    }

    async fn clear_future(&self, time: Time) -> Result<(), DeviceError> {
        let mut inner = self.inner.lock();
        inner.queue.retain(|c| c.time <= time);
        inner.cleared.push(time);
        truncate_front(&mut inner.cleared, MAX_RECORDED);
        Ok(())
    }

    fn set_debug_logging(&self, debug: bool, debug_state: bool) {
        self.debug.store(debug, Ordering::Relaxed);
        self.debug_state.store(debug_state, Ordering::Relaxed);
    }

    async fn terminate(&self) -> Result<(), DeviceError> {
        let mut inner = self.inner.lock();
        inner.queue.clear();
        tracing::debug!(device_id = %self.device_id, "terminated");
        Ok(())
    }
}

/// Creates [`AbstractDevice`]s for any configuration
pub struct AbstractDeviceFactory {
    clock: Arc<dyn Clock>,
    devices: Mutex<IndexMap<String, Arc<AbstractDevice>>>,
}

impl AbstractDeviceFactory {
    /// Create a factory
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            devices: Mutex::new(IndexMap::new()),
        }
    }

    /// The most recently created device with this ID
    pub fn device(&self, device_id: &str) -> Option<Arc<AbstractDevice>> {
        self.devices.lock().get(device_id).cloned()
    }
}

#[async_trait]
impl DeviceFactory for AbstractDeviceFactory {
    async fn create_device(&self, device_id: &str, options: &DeviceOptions) -> Result<Arc<dyn Device>, DeviceError> {
        if options.device_type != DeviceType::Abstract {
            tracing::debug!(device_id, device_type = options.device_type.name(), "standing in with abstract device");
        }
        let device = Arc::new(AbstractDevice::new(device_id, Arc::clone(&self.clock)));
        self.devices.lock().insert(device_id.to_string(), Arc::clone(&device));
        Ok(device)
    }
}
