// SPDX-License-Identifier: MIT OR Apache-2.0
//! The conductor: public handle of the scheduling loop.
//!
//! All mutations are sent as [`Action`]s to a single worker task, which owns
//! the scheduler state and runs the resolve ticks. The handle itself only
//! holds channels and shared services.

mod worker;

#[cfg(test)]
mod tests;

use crate::clock::{Clock, TokioClock};
use crate::datastore::Datastore;
use crate::device::{DeviceFactory, DeviceOptions, DeviceRegistry};
use crate::error::{ConductorError, Result};
use crate::events::{ConductorEvent, EventSink};
use crate::options::ConductorOptions;
use indexmap::IndexMap;
use parking_lot::Mutex;
use playout_timeline::{timeline_size, Mappings, Time, TimelineObject, TimelineResolver};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use worker::Worker;

/// Curve level of the resolve time estimate
const ESTIMATE_LEVEL: f64 = 250.0;
/// Lower bound of the resolve time estimate
const ESTIMATE_MIN: Time = 20;
/// Upper bound of the resolve time estimate
const ESTIMATE_MAX: Time = 200;

/// Estimate how long resolving a timeline of `object_count` objects takes, in ms
pub fn calculate_resolve_time(object_count: usize, multiplier: f64) -> Time {
    let estimate = (multiplier * 0.5 * ESTIMATE_LEVEL * (object_count as f64 / ESTIMATE_LEVEL).powf(0.7)).floor();
    (estimate as Time).clamp(ESTIMATE_MIN, ESTIMATE_MAX)
}

/// Work queued for the scheduling loop
pub(crate) enum Action {
    SetTimeline {
        timeline: Vec<TimelineObject>,
        size: usize,
        mappings: Option<Mappings>,
    },
    ResetResolver,
    SetDatastore(Datastore),
    ResyncDevice(String),
    ConnectionChanged(String),
    MakeReady {
        ok_to_destroy: bool,
        activation_id: Option<String>,
        done: oneshot::Sender<()>,
    },
    StandDown {
        ok_to_destroy: bool,
        done: oneshot::Sender<()>,
    },
    StartMeasure(String),
    SetTimelineHash(Option<String>),
    Flush(oneshot::Sender<()>),
}

/// Handle to a running playout scheduler
pub struct Conductor {
    options: ConductorOptions,
    clock: Arc<dyn Clock>,
    resolver: Arc<dyn TimelineResolver>,
    registry: Arc<DeviceRegistry>,
    events: EventSink,
    actions: mpsc::UnboundedSender<Action>,
    queued: Mutex<Option<mpsc::UnboundedReceiver<Action>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    timeline_size: AtomicUsize,
}

impl Conductor {
    /// Create a conductor on the wall clock.
    ///
    /// Returns the receiver all [`ConductorEvent`]s are delivered on.
    pub fn new(
        options: ConductorOptions,
        resolver: Arc<dyn TimelineResolver>,
        factory: Arc<dyn DeviceFactory>,
    ) -> (Self, mpsc::UnboundedReceiver<ConductorEvent>) {
        Self::with_clock(options, resolver, factory, Arc::new(TokioClock::new()))
    }

    /// Create a conductor on a custom clock
    pub fn with_clock(
        options: ConductorOptions,
        resolver: Arc<dyn TimelineResolver>,
        factory: Arc<dyn DeviceFactory>,
        clock: Arc<dyn Clock>,
    ) -> (Self, mpsc::UnboundedReceiver<ConductorEvent>) {
        let (events, event_rx) = EventSink::channel();
        let (actions, action_rx) = mpsc::unbounded_channel();
        let registry = DeviceRegistry::new(factory, Arc::clone(&clock), &options.timings, events.clone());

        let conductor = Self {
            options,
            clock,
            resolver,
            registry,
            events,
            actions,
            queued: Mutex::new(Some(action_rx)),
            worker: Mutex::new(None),
            timeline_size: AtomicUsize::new(0),
        };
        (conductor, event_rx)
    }

    /// Start the scheduling loop.
    ///
    /// Actions sent before this call are processed once the loop runs.
    pub async fn init(&self) -> Result<()> {
        let Some(action_rx) = self.queued.lock().take() else {
            return Err(ConductorError::AlreadyInitialized);
        };

        let tx = self.actions.clone();
        self.registry.set_on_change(move |device_id| {
            let _ = tx.send(Action::ConnectionChanged(device_id.to_string()));
        });

        let worker = Worker::new(
            self.options.clone(),
            Arc::clone(&self.clock),
            Arc::clone(&self.resolver),
            Arc::clone(&self.registry),
            self.events.clone(),
        );
        *self.worker.lock() = Some(tokio::spawn(worker.run(action_rx)));
        tracing::info!("conductor initialized");
        Ok(())
    }

    fn send(&self, action: Action) -> Result<()> {
        self.actions.send(action).map_err(|_| ConductorError::Stopped)
    }

    /// Replace the timeline, and the mappings if given
    pub fn set_timeline_and_mappings(&self, timeline: Vec<TimelineObject>, mappings: Option<Mappings>) -> Result<()> {
        let size = timeline_size(&timeline);
        self.timeline_size.store(size, Ordering::Relaxed);
        self.send(Action::SetTimeline {
            timeline,
            size,
            mappings,
        })
    }

    /// Number of objects, nested children and keyframes in the current timeline
    pub fn timeline_size(&self) -> usize {
        self.timeline_size.load(Ordering::Relaxed)
    }

    /// Drop the resolver cache and resolve again
    pub fn reset_resolver(&self) -> Result<()> {
        self.send(Action::ResetResolver)
    }

    /// Replace the datastore; devices depending on changed keys get their states again
    pub fn set_datastore(&self, datastore: Datastore) -> Result<()> {
        self.send(Action::SetDatastore(datastore))
    }

    /// Push the current and future states of a device again
    pub fn resync_device(&self, device_id: impl Into<String>) -> Result<()> {
        self.send(Action::ResyncDevice(device_id.into()))
    }

    /// Replace the desired device configuration
    pub fn set_device_configs(&self, configs: IndexMap<String, DeviceOptions>) {
        self.registry.set_device_configs(configs);
    }

    /// Add or replace one device
    pub fn add_device(&self, device_id: impl Into<String>, options: DeviceOptions) {
        self.registry.add_device(device_id, options);
    }

    /// Remove one device
    pub fn remove_device(&self, device_id: &str) {
        self.registry.remove_device(device_id);
    }

    /// The device connection registry
    pub fn device_registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    /// Prepare all devices for going on air, then resolve from scratch
    pub async fn devices_make_ready(&self, ok_to_destroy: bool, activation_id: Option<String>) -> Result<()> {
        let (done, rx) = oneshot::channel();
        self.send(Action::MakeReady {
            ok_to_destroy,
            activation_id,
            done,
        })?;
        rx.await.map_err(|_| ConductorError::Stopped)
    }

    /// Take all devices off air
    pub async fn devices_stand_down(&self, ok_to_destroy: bool) -> Result<()> {
        let (done, rx) = oneshot::channel();
        self.send(Action::StandDown { ok_to_destroy, done })?;
        rx.await.map_err(|_| ConductorError::Stopped)
    }

    /// Report timings of the next completed tick
    pub fn stat_start_measure(&self, reason: impl Into<String>) -> Result<()> {
        self.send(Action::StartMeasure(reason.into()))
    }

    /// Label following `ResolveDone` events
    pub fn set_timeline_hash(&self, hash: Option<String>) -> Result<()> {
        self.send(Action::SetTimelineHash(hash))
    }

    /// Wait until everything queued so far has been processed
    pub async fn flush(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(Action::Flush(tx))?;
        rx.await.map_err(|_| ConductorError::Stopped)
    }

    /// Stop the loop and disconnect all devices
    pub async fn terminate(&self) {
        if let Some(handle) = self.worker.lock().take() {
            handle.abort();
        }
        self.registry.terminate_all().await;
        tracing::info!("conductor terminated");
    }
}
