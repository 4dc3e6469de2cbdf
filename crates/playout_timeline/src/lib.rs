// SPDX-License-Identifier: MIT OR Apache-2.0
//! Timeline model for the playout conductor.
//!
//! This crate provides the declarative side of playout:
//! - Timeline objects with absolute, relative and "now" timing
//! - Layer to device mappings
//! - Resolved timelines and per-time state slices
//! - The resolver seam and a built-in resolver
//!
//! ## Architecture
//!
//! The conductor never interprets timing expressions itself. It hands the
//! timeline to a [`TimelineResolver`] and works with the resulting
//! [`ResolvedTimeline`] and [`TimelineState`] values.

pub mod mapping;
pub mod object;
pub mod resolver;
pub mod simple;
pub mod state;

pub use mapping::{mappings_for_device, Mapping, Mappings};
pub use object::{
    timeline_size, DatastoreReference, DeviceType, Enable, EnableSpec, Time, TimeExpr, TimelineContent,
    TimelineKeyframe, TimelineObject, NOW,
};
pub use resolver::{ResolveCache, ResolveError, ResolveErrorKind, ResolveOptions, TimelineResolver};
pub use simple::SimpleResolver;
pub use state::{
    EventKind, NextEvent, ResolveStatistics, ResolvedInstance, ResolvedObject, ResolvedTimeline,
    TimelineObjectInstance, TimelineState,
};
