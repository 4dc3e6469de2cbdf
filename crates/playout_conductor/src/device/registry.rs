// SPDX-License-Identifier: MIT OR Apache-2.0
//! Reconciles desired device configuration with live connections.
//!
//! Each update pass plans create/update/delete/set-debug operations, runs
//! them concurrently and plans again until nothing is left to do. Failed
//! creations back off exponentially per device.

use super::{Device, DeviceFactory, DeviceOptions};
use crate::clock::Clock;
use crate::error::DeviceError;
use crate::events::{ConductorEvent, EventSink};
use crate::options::SchedulerTimings;
use futures::future::join_all;
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use playout_timeline::Time;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// A live device connection
#[derive(Clone)]
pub struct DeviceConnection {
    /// Device ID
    pub device_id: String,
    /// Options the device was created with
    pub options: DeviceOptions,
    /// The device
    pub device: Arc<dyn Device>,
}

impl std::fmt::Debug for DeviceConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceConnection")
            .field("device_id", &self.device_id)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

/// Failed creation bookkeeping for one device
#[derive(Debug, Clone)]
struct ConnectionAttempt {
    failures: u32,
    retry_at: Time,
}

/// Planned change to the live connections
#[derive(Debug, Clone)]
enum Operation {
    Create(String, DeviceOptions),
    Update(String, DeviceOptions),
    Delete(String),
    SetDebug(String, DeviceOptions),
}

type ChangeHook = Box<dyn Fn(&str) + Send + Sync>;

/// Registry of device connections
pub struct DeviceRegistry {
    factory: Arc<dyn DeviceFactory>,
    clock: Arc<dyn Clock>,
    events: EventSink,
    retry_base_delay: Time,
    retry_max_delay: Time,
    desired: RwLock<IndexMap<String, DeviceOptions>>,
    connections: RwLock<IndexMap<String, DeviceConnection>>,
    attempts: Mutex<HashMap<String, ConnectionAttempt>>,
    updating: AtomicBool,
    rerun: AtomicBool,
    retry_timer: Mutex<Option<JoinHandle<()>>>,
    on_change: RwLock<Option<ChangeHook>>,
    changed: Notify,
}

impl DeviceRegistry {
    /// Create an empty registry
    pub fn new(
        factory: Arc<dyn DeviceFactory>,
        clock: Arc<dyn Clock>,
        timings: &SchedulerTimings,
        events: EventSink,
    ) -> Arc<Self> {
        Arc::new(Self {
            factory,
            clock,
            events,
            retry_base_delay: timings.connection_retry_base_delay,
            retry_max_delay: timings.connection_retry_max_delay,
            desired: RwLock::new(IndexMap::new()),
            connections: RwLock::new(IndexMap::new()),
            attempts: Mutex::new(HashMap::new()),
            updating: AtomicBool::new(false),
            rerun: AtomicBool::new(false),
            retry_timer: Mutex::new(None),
            on_change: RwLock::new(None),
            changed: Notify::new(),
        })
    }

    /// Called with the device ID whenever a connection is added or removed
    pub fn set_on_change(&self, hook: impl Fn(&str) + Send + Sync + 'static) {
        *self.on_change.write() = Some(Box::new(hook));
    }

    /// Replace the desired configuration and reconcile
    pub fn set_device_configs(self: &Arc<Self>, configs: IndexMap<String, DeviceOptions>) {
        {
            let mut desired = self.desired.write();
            let mut attempts = self.attempts.lock();
            for (id, options) in &configs {
                let changed = desired.get(id).map_or(true, |old| old.differs_beyond_debug(options));
                if changed && attempts.remove(id).is_some() {
                    tracing::debug!(device_id = %id, "config changed, backoff reset");
                }
            }
            *desired = configs;
        }
        self.changed.notify_waiters();
        self.trigger_update();
    }

    /// Add or replace one device config and reconcile
    pub fn add_device(self: &Arc<Self>, device_id: impl Into<String>, options: DeviceOptions) {
        let mut configs = self.desired.read().clone();
        configs.insert(device_id.into(), options);
        self.set_device_configs(configs);
    }

    /// Remove one device config and reconcile
    pub fn remove_device(self: &Arc<Self>, device_id: &str) {
        let mut configs = self.desired.read().clone();
        configs.shift_remove(device_id);
        self.set_device_configs(configs);
    }

    /// Snapshot of the live connections
    pub fn connections(&self) -> Vec<DeviceConnection> {
        self.connections.read().values().cloned().collect()
    }

    /// A live connection by ID
    pub fn connection(&self, device_id: &str) -> Option<DeviceConnection> {
        self.connections.read().get(device_id).cloned()
    }

    /// Whether a device is connected
    pub fn is_connected(&self, device_id: &str) -> bool {
        self.connections.read().contains_key(device_id)
    }

    /// Whether every enabled device in the desired configuration is connected
    pub fn all_connected(&self) -> bool {
        let desired = self.desired.read();
        let connections = self.connections.read();
        desired
            .iter()
            .filter(|(_, options)| !options.disable)
            .all(|(id, _)| connections.contains_key(id))
    }

    /// Wait until [`Self::all_connected`] holds.
    ///
    /// Devices that keep failing keep this pending; callers bound it with a timeout.
    pub async fn wait_until_connected(&self) {
        loop {
            let changed = self.changed.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();
            if self.all_connected() {
                return;
            }
            changed.await;
        }
    }

    /// Start an update pass in the background
    pub fn trigger_update(self: &Arc<Self>) {
        let registry = Arc::clone(self);
        tokio::spawn(async move { registry.update_connections().await });
    }

    /// Reconcile until nothing is left to do.
    ///
    /// Calls made while a pass is running make that pass plan once more.
    pub async fn update_connections(self: Arc<Self>) {
        if self.updating.swap(true, Ordering::SeqCst) {
            self.rerun.store(true, Ordering::SeqCst);
            return;
        }

        loop {
            self.rerun.store(false, Ordering::SeqCst);
            let operations = self.plan(self.clock.now());
            if operations.is_empty() {
                self.updating.store(false, Ordering::SeqCst);
                // A call raced the release; take the guard back if nobody else did
                if self.rerun.load(Ordering::SeqCst) && !self.updating.swap(true, Ordering::SeqCst) {
                    continue;
                }
                break;
            }
            join_all(operations.into_iter().map(|op| self.execute(op))).await;
        }

        self.arm_retry_timer();
    }

    fn plan(&self, now: Time) -> Vec<Operation> {
        let desired = self.desired.read();
        let connections = self.connections.read();
        let attempts = self.attempts.lock();
        let may_create = |id: &str| attempts.get(id).map_or(true, |a| a.retry_at <= now);

        let mut operations = Vec::new();
        for (id, options) in desired.iter().filter(|(_, o)| !o.disable) {
            match connections.get(id) {
                None if may_create(id) => operations.push(Operation::Create(id.clone(), options.clone())),
                None => {}
                Some(conn) if conn.options.differs_beyond_debug(options) => {
                    if may_create(id) {
                        operations.push(Operation::Update(id.clone(), options.clone()));
                    }
                }
                Some(conn) if conn.options.debug_flags_differ(options) => {
                    operations.push(Operation::SetDebug(id.clone(), options.clone()));
                }
                Some(_) => {}
            }
        }
        for id in connections.keys() {
            if desired.get(id).map_or(true, |o| o.disable) {
                operations.push(Operation::Delete(id.clone()));
            }
        }
        operations
    }

    async fn execute(&self, operation: Operation) {
        match operation {
            Operation::Create(id, options) => self.create(id, options).await,
            Operation::Update(id, options) => {
                self.delete(&id).await;
                self.create(id, options).await;
            }
            Operation::Delete(id) => self.delete(&id).await,
            Operation::SetDebug(id, options) => {
                if let Some(conn) = self.connections.write().get_mut(&id) {
                    conn.device.set_debug_logging(options.debug, options.debug_state);
                    conn.options = options;
                }
            }
        }
    }

    async fn create(&self, device_id: String, options: DeviceOptions) {
        match self.factory.create_device(&device_id, &options).await {
            Ok(device) => {
                device.set_debug_logging(options.debug, options.debug_state);
                self.attempts.lock().remove(&device_id);
                self.connections.write().insert(
                    device_id.clone(),
                    DeviceConnection {
                        device_id: device_id.clone(),
                        options,
                        device,
                    },
                );
                tracing::info!(device_id = %device_id, "device connection added");
                self.events.emit(ConductorEvent::ConnectionAdded(device_id.clone()));
                self.notify(&device_id);
            }
            Err(err) => {
                let now = self.clock.now();
                let mut attempts = self.attempts.lock();
                let attempt = attempts.entry(device_id.clone()).or_insert(ConnectionAttempt {
                    failures: 0,
                    retry_at: now,
                });
                attempt.failures += 1;
                let delay = retry_delay(attempt.failures, self.retry_base_delay, self.retry_max_delay);
                attempt.retry_at = now + delay;
                drop(attempts);
                self.events.error(
                    format!("Device \"{device_id}\""),
                    format!("{err}, retrying in {delay} ms"),
                );
            }
        }
    }

    async fn delete(&self, device_id: &str) {
        let removed = self.connections.write().shift_remove(device_id);
        let Some(conn) = removed else {
            return;
        };
        if let Err(err) = conn.device.terminate().await {
            self.events.error(format!("Device \"{device_id}\""), err);
        }
        tracing::info!(device_id = %device_id, "device connection removed");
        self.events.emit(ConductorEvent::ConnectionRemoved(device_id.to_string()));
        self.notify(device_id);
    }

    fn notify(&self, device_id: &str) {
        if let Some(hook) = self.on_change.read().as_ref() {
            hook(device_id);
        }
        self.changed.notify_waiters();
    }

    /// Wake up when the earliest pending backoff expires
    fn arm_retry_timer(self: &Arc<Self>) {
        let now = self.clock.now();
        let next_retry = {
            let desired = self.desired.read();
            let connections = self.connections.read();
            self.attempts
                .lock()
                .iter()
                .filter(|(id, _)| desired.contains_key(*id) && !connections.contains_key(*id))
                .map(|(_, a)| a.retry_at)
                .min()
        };

        let mut timer = self.retry_timer.lock();
        if let Some(handle) = timer.take() {
            handle.abort();
        }
        if let Some(retry_at) = next_retry {
            let registry = Arc::downgrade(self);
            let delay = Duration::from_millis((retry_at - now).max(0) as u64);
            *timer = Some(tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if let Some(registry) = registry.upgrade() {
                    registry.trigger_update();
                }
            }));
        }
    }

    /// Run `op` on every connection concurrently, each bounded by `timeout`.
    ///
    /// Failures are collected per device; one device never blocks the others.
    pub async fn map_devices<F, Fut>(
        &self,
        operation: &'static str,
        timeout: Option<Duration>,
        op: F,
    ) -> Vec<(String, Result<(), DeviceError>)>
    where
        F: Fn(DeviceConnection) -> Fut,
        Fut: Future<Output = Result<(), DeviceError>>,
    {
        let calls = self.connections().into_iter().map(|conn| {
            let device_id = conn.device_id.clone();
            let call = op(conn);
            async move {
                let result = match timeout {
                    Some(limit) => tokio::time::timeout(limit, call).await.unwrap_or(Err(DeviceError::Timeout {
                        operation,
                        timeout_ms: limit.as_millis() as u64,
                    })),
                    None => call.await,
                };
                (device_id, result)
            }
        });
        join_all(calls).await
    }

    /// Terminate all connections
    pub async fn terminate_all(&self) {
        if let Some(handle) = self.retry_timer.lock().take() {
            handle.abort();
        }
        self.desired.write().clear();
        let ids: Vec<String> = self.connections.read().keys().cloned().collect();
        for id in ids {
            self.delete(&id).await;
        }
    }
}

/// Backoff before retry number `failures`: base, doubling, capped
pub fn retry_delay(failures: u32, base: Time, max: Time) -> Time {
    let exponent = failures.saturating_sub(1).min(30);
    base.saturating_mul(1 << exponent).min(max)
}
