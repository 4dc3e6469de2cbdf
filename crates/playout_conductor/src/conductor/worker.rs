// SPDX-License-Identifier: MIT OR Apache-2.0
//! The scheduling loop.
//!
//! One task owns [`SchedulerState`] and serializes everything that touches
//! it: queued actions, resolve ticks and callback flushes.

use super::{calculate_resolve_time, Action};
use crate::callbacks::{active_callbacks, CallbackDebouncer};
use crate::clock::Clock;
use crate::datastore::{changed_keys, fill_state_from_datastore, Datastore};
use crate::device::{DeviceConnection, DeviceRegistry};
use crate::device_states::{filter_layers_per_device, DeviceHistories, DeviceStateEntry};
use crate::error::{ConductorError, DeviceError};
use crate::events::{ConductorEvent, EventSink, StatReport};
use crate::now_resolver::apply_fixups;
use crate::options::ConductorOptions;
use crate::resolution::ResolutionAdapter;
use crate::resolve_window::ResolveWindow;
use futures::future::join_all;
use playout_timeline::{
    DeviceType, Mappings, ResolvedTimeline, Time, TimelineObject, TimelineResolver, TimelineState,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// An open timing measurement
#[derive(Debug, Clone)]
struct Measurement {
    reason: String,
    started: Time,
    timeline_start_resolve: Option<Time>,
    timeline_resolved: Option<Time>,
    state_handled: Option<Time>,
}

impl Measurement {
    fn report(&self, done: Time) -> StatReport {
        let since = |t: Option<Time>| t.map(|t| t - self.started);
        StatReport {
            reason: self.reason.clone(),
            timeline_start_resolve: since(self.timeline_start_resolve),
            timeline_resolved: since(self.timeline_resolved),
            state_handled: since(self.state_handled),
            done: done - self.started,
        }
    }
}

/// Everything the scheduling loop mutates
pub(crate) struct SchedulerState {
    timeline: Vec<TimelineObject>,
    timeline_size: usize,
    mappings: Mappings,
    datastore: Datastore,
    next_resolve_time: Time,
    window: ResolveWindow,
    histories: DeviceHistories,
    callbacks: CallbackDebouncer,
    timeline_hash: Option<String>,
    measurement: Option<Measurement>,
}

impl SchedulerState {
    fn new(callback_wait_time: Time) -> Self {
        Self {
            timeline: Vec::new(),
            timeline_size: 0,
            mappings: Mappings::new(),
            datastore: Datastore::new(),
            next_resolve_time: 0,
            window: ResolveWindow::new(),
            histories: DeviceHistories::default(),
            callbacks: CallbackDebouncer::new(callback_wait_time),
            timeline_hash: None,
            measurement: None,
        }
    }
}

async fn maybe_sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn deadline_in(ms: Time) -> Instant {
    Instant::now() + Duration::from_millis(ms.max(0) as u64)
}

pub(crate) struct Worker {
    options: ConductorOptions,
    clock: Arc<dyn Clock>,
    adapter: ResolutionAdapter,
    registry: Arc<DeviceRegistry>,
    events: EventSink,
    state: SchedulerState,
    resolve_at: Option<Instant>,
    callbacks_at: Option<Instant>,
}

impl Worker {
    pub(crate) fn new(
        options: ConductorOptions,
        clock: Arc<dyn Clock>,
        resolver: Arc<dyn TimelineResolver>,
        registry: Arc<DeviceRegistry>,
        events: EventSink,
    ) -> Self {
        let timings = &options.timings;
        let adapter = ResolutionAdapter::new(
            resolver,
            options.multi_threaded_resolver,
            timings.resolve_limit_count,
            timings.now_fix_max_iterations,
            events.clone(),
        );
        Self {
            state: SchedulerState::new(timings.callback_wait_time),
            options,
            clock,
            adapter,
            registry,
            events,
            resolve_at: None,
            callbacks_at: None,
        }
    }

    pub(crate) async fn run(mut self, mut actions: mpsc::UnboundedReceiver<Action>) {
        loop {
            tokio::select! {
                action = actions.recv() => match action {
                    Some(action) => self.handle_action(action).await,
                    None => break,
                },
                () = maybe_sleep_until(self.resolve_at) => {
                    self.resolve_at = None;
                    self.tick().await;
                }
                () = maybe_sleep_until(self.callbacks_at) => {
                    self.callbacks_at = None;
                    self.send_callbacks();
                }
            }
        }
        tracing::debug!("scheduling loop stopped");
    }

    fn trigger_resolve(&mut self) {
        self.resolve_at = Some(Instant::now());
    }

    fn reset_resolver(&mut self) {
        self.adapter.reset();
        self.state.window.reset();
        self.state.next_resolve_time = 0;
        self.trigger_resolve();
    }

    async fn handle_action(&mut self, action: Action) {
        match action {
            Action::SetTimeline {
                timeline,
                size,
                mappings,
            } => {
                self.state.timeline = timeline;
                self.state.timeline_size = size;
                if let Some(mappings) = mappings {
                    self.state.mappings = mappings;
                }
                self.reset_resolver();
            }
            Action::ResetResolver => self.reset_resolver(),
            Action::SetDatastore(datastore) => self.set_datastore(datastore).await,
            Action::ResyncDevice(device_id) => self.resync_device(&device_id).await,
            Action::ConnectionChanged(device_id) => {
                self.events.debug(format!("Connection to \"{device_id}\" changed, resolving again"));
                self.reset_resolver();
            }
            Action::MakeReady {
                ok_to_destroy,
                activation_id,
                done,
            } => {
                let timeout = self.device_timeout();
                let results = self
                    .registry
                    .map_devices("makeReady", Some(timeout), |conn| {
                        let activation_id = activation_id.clone();
                        async move { conn.device.make_ready(ok_to_destroy, activation_id).await }
                    })
                    .await;
                self.report_device_errors(results);
                self.reset_resolver();
                let _ = done.send(());
            }
            Action::StandDown { ok_to_destroy, done } => {
                let timeout = self.device_timeout();
                let results = self
                    .registry
                    .map_devices("standDown", Some(timeout), |conn| async move {
                        conn.device.stand_down(ok_to_destroy).await
                    })
                    .await;
                self.report_device_errors(results);
                let _ = done.send(());
            }
            Action::StartMeasure(reason) => {
                self.state.measurement = Some(Measurement {
                    reason,
                    started: self.clock.now(),
                    timeline_start_resolve: None,
                    timeline_resolved: None,
                    state_handled: None,
                });
            }
            Action::SetTimelineHash(hash) => self.state.timeline_hash = hash,
            Action::Flush(done) => {
                let _ = done.send(());
            }
        }
    }

    fn device_timeout(&self) -> Duration {
        Duration::from_millis(self.options.timings.device_operation_timeout.max(0) as u64)
    }

    fn report_device_errors(&self, results: Vec<(String, Result<(), DeviceError>)>) {
        for (device_id, result) in results {
            if let Err(err) = result {
                self.events.error("device", ConductorError::device(device_id, err));
            }
        }
    }

    /// Run one resolve tick and re-arm the timer, whatever happened
    async fn tick(&mut self) {
        let started = self.clock.now();
        tracing::trace!(started, "resolve tick");

        let delay = match self.resolve_and_dispatch(started).await {
            Ok(delay) => delay,
            Err(err) => {
                self.events.error("resolveTimeline", err);
                self.options.timings.lookahead_time
            }
        };
        self.resolve_at = Some(deadline_in(delay));

        let done = self.clock.now();
        self.events.emit(ConductorEvent::ResolveDone {
            timeline_hash: self.state.timeline_hash.clone(),
            duration_ms: (done - started).max(0) as u64,
        });
        if let Some(measurement) = self.state.measurement.take() {
            let report = measurement.report(done);
            tracing::debug!(?report, "stat report");
            self.events.emit(ConductorEvent::StatReport(report));
        }
    }

    /// Resolve, dispatch and compute when to wake up next
    async fn resolve_and_dispatch(&mut self, now: Time) -> Result<Time, ConductorError> {
        let timings = self.options.timings.clone();

        let estimated = if self.options.proactive_resolve {
            calculate_resolve_time(self.state.timeline_size, self.options.estimate_resolve_time_multiplier)
        } else {
            0
        };

        let mut resolve_time = self.state.next_resolve_time;
        if resolve_time == 0 || resolve_time < now + estimated {
            resolve_time = now + estimated;
            self.state.next_resolve_time = resolve_time;
        } else if resolve_time > now + timings.lookahead_time {
            tracing::debug!(resolve_time, now, "too far ahead, deferring resolve");
            return Ok(timings.lookahead_time);
        }

        // Whether the cached window could not serve this tick, read before resolving replaces it
        let window_elapsed = self
            .state
            .window
            .reusable(resolve_time, timings.prepare_time)
            .is_none();

        let connections = self.registry.connections();
        let registry = Arc::clone(&self.registry);
        let prepare = registry.map_devices("prepareForHandleState", None, |conn| async move {
            conn.device.prepare_for_handle_state(resolve_time).await
        });
        let (prepared, resolved) = tokio::join!(prepare, self.resolve(resolve_time));
        self.report_device_errors(prepared);
        let resolved = resolved?;

        let tl_state = self.adapter.resolver().resolved_state(&resolved, resolve_time);
        self.dispatch(&connections, &tl_state).await;
        if let Some(measurement) = self.state.measurement.as_mut() {
            measurement.state_handled = Some(self.clock.now());
        }

        let after = self.clock.now();
        if after > resolve_time {
            self.events.warning(format!(
                "Resolve took too long ({} ms late), estimated resolve time was {estimated} ms",
                after - resolve_time
            ));
        }

        if self.state.callbacks.diff_active(active_callbacks(&tl_state), tl_state.time) {
            self.arm_callbacks(after + timings.callback_wait_time);
        }

        let next_event_time = tl_state.next_events.first().map(|e| e.time);
        let valid_to = self.state.window.valid_to();
        match next_event_time {
            Some(event_time) => {
                self.state.next_resolve_time = event_time.min(tl_state.time + timings.lookahead_time);
            }
            None if !window_elapsed => {}
            None => {
                self.state.next_resolve_time = tl_state.time;
                let time = tl_state.time;
                let results = self
                    .registry
                    .map_devices("clearFuture", None, |conn| async move { conn.device.clear_future(time).await })
                    .await;
                self.report_device_errors(results);
            }
        }

        let mut until = valid_to - timings.prepare_time - after;
        if let Some(event_time) = next_event_time {
            until = until.min(event_time - timings.prepare_time - after);
        }
        Ok(until.clamp(timings.min_trigger_time, timings.lookahead_time))
    }

    async fn resolve(&mut self, resolve_time: Time) -> Result<Arc<ResolvedTimeline>, ConductorError> {
        let timings = &self.options.timings;
        if let Some(resolved) = self.state.window.reusable(resolve_time, timings.prepare_time) {
            tracing::trace!(resolve_time, "reusing resolved timeline");
            return Ok(resolved);
        }

        let limit_time = timings.resolve_limit_time;
        if let Some(measurement) = self.state.measurement.as_mut() {
            measurement.timeline_start_resolve = Some(self.clock.now());
        }
        let output = self
            .adapter
            .resolve_timeline(
                resolve_time,
                &self.state.timeline,
                limit_time,
                self.options.use_cache_when_resolving,
            )
            .await?;
        apply_fixups(&mut self.state.timeline, &output.fixups);
        self.state
            .window
            .store(Arc::clone(&output.resolved), resolve_time, limit_time);
        if let Some(measurement) = self.state.measurement.as_mut() {
            measurement.timeline_resolved = Some(self.clock.now());
        }
        tracing::debug!(
            resolve_time,
            objects = output.resolved.statistics.resolved_object_count,
            cached = output.resolved.statistics.cached_object_count,
            "timeline resolved"
        );
        Ok(output.resolved)
    }

    fn dispatched(&self, conn: &DeviceConnection) -> bool {
        !(self.options.optimize_for_production && conn.device.device_type() == DeviceType::Abstract)
    }

    /// Fan the state out, record it and hand each device its filled slice
    async fn dispatch(&mut self, connections: &[DeviceConnection], tl_state: &TimelineState) {
        let device_ids: Vec<String> = connections.iter().map(|c| c.device_id.clone()).collect();
        self.state.histories.retain_devices(&device_ids);
        let mut per_device = filter_layers_per_device(tl_state, &self.state.mappings, &device_ids);

        let now = self.clock.now();
        let mut calls = Vec::new();
        for conn in connections {
            let Some(device_state) = per_device.shift_remove(&conn.device_id) else {
                continue;
            };
            let entry = DeviceStateEntry::new(&conn.device_id, device_state, &self.state.mappings);
            let filled = fill_state_from_datastore(&entry.state, &self.state.datastore);
            let mappings = entry.mappings.clone();
            self.state.histories.record(&conn.device_id, entry, now);
            if self.dispatched(conn) {
                calls.push(Self::handle_state(conn.clone(), filled, mappings));
            }
        }
        self.report_device_errors(join_all(calls).await);
    }

    async fn handle_state(
        conn: DeviceConnection,
        state: TimelineState,
        mappings: Mappings,
    ) -> (String, Result<(), DeviceError>) {
        let result = conn.device.handle_state(state, mappings).await;
        (conn.device_id, result)
    }

    /// Push the baseline and future entries of a device again, re-filled
    async fn resync_device(&mut self, device_id: &str) {
        let Some(conn) = self.registry.connection(device_id) else {
            self.events.warning(format!("Cannot resync \"{device_id}\": not connected"));
            return;
        };
        if !self.dispatched(&conn) {
            return;
        }
        let entries = self.state.histories.refill_targets(device_id, self.clock.now());
        tracing::debug!(device_id, entries = entries.len(), "resync device");
        for entry in entries {
            let filled = fill_state_from_datastore(&entry.state, &self.state.datastore);
            if let Err(err) = conn.device.handle_state(filled, entry.mappings).await {
                self.events.error("device", ConductorError::device(device_id, err));
            }
        }
    }

    async fn set_datastore(&mut self, datastore: Datastore) {
        let changed = changed_keys(&self.state.datastore, &datastore);
        self.state.datastore = datastore;
        if changed.is_empty() {
            return;
        }
        let affected = self.state.histories.devices_depending_on(&changed);
        tracing::debug!(?changed, ?affected, "datastore changed");
        for device_id in affected {
            self.resync_device(&device_id).await;
        }
    }

    fn arm_callbacks(&mut self, at: Time) {
        let deadline = deadline_in(at - self.clock.now());
        self.callbacks_at = Some(self.callbacks_at.map_or(deadline, |current| current.min(deadline)));
    }

    fn send_callbacks(&mut self) {
        let now = self.clock.now();
        let (fired, next_due) = self.state.callbacks.flush(now);
        for callback in fired {
            tracing::debug!(
                instance_id = %callback.instance_id,
                callback = %callback.callback,
                time = callback.time,
                "timeline callback"
            );
            self.events.emit(ConductorEvent::TimelineCallback(callback));
        }
        if let Some(due) = next_due {
            self.arm_callbacks(due);
        }
    }
}
