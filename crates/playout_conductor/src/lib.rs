// SPDX-License-Identifier: MIT OR Apache-2.0
//! Just-in-time playout scheduler.
//!
//! This crate turns a declarative timeline into device states:
//! - "now" fixups for objects that start when they are played
//! - Resolving through a [`playout_timeline::TimelineResolver`] with a reusable window
//! - Per-device fan-out with a short history for datastore re-fills
//! - Debounced start/stop callbacks
//! - Device connections with retry backoff
//!
//! ## Architecture
//!
//! The [`Conductor`] handle sends actions to a single worker task that owns
//! all scheduler state. Failures during operation are reported as
//! [`ConductorEvent`]s and never stop the loop.

pub mod callbacks;
pub mod clock;
pub mod conductor;
pub mod datastore;
pub mod device;
pub mod device_states;
pub mod error;
pub mod events;
pub mod now_resolver;
pub mod options;
pub mod resolution;
pub mod resolve_window;

pub use callbacks::{ActiveCallback, CallbackDebouncer};
pub use clock::{Clock, TokioClock};
pub use conductor::{calculate_resolve_time, Conductor};
pub use datastore::{fill_state_from_datastore, Datastore, DatastoreEntry};
pub use device::{
    AbstractCommand, AbstractCommandKind, AbstractDevice, AbstractDeviceFactory, Device, DeviceConnection,
    DeviceFactory, DeviceOptions, DeviceRegistry,
};
pub use device_states::{filter_layers_per_device, DeviceHistories, DeviceStateEntry};
pub use error::{ConductorError, DeviceError, Result};
pub use events::{ConductorEvent, EventSink, StatReport, TimelineCallback};
pub use now_resolver::{apply_fixups, fix_now_objects, NowFixOutcome, NowFixup};
pub use options::{ConductorOptions, SchedulerTimings};
pub use resolution::{ResolutionAdapter, ResolveOutput};
pub use resolve_window::ResolveWindow;
