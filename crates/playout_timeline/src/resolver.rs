// SPDX-License-Identifier: MIT OR Apache-2.0
//! The resolver seam.
//!
//! Resolving turns symbolic timing into concrete instances. The conductor
//! only depends on [`TimelineResolver`]; [`crate::SimpleResolver`] is the
//! implementation shipped with this crate.

use crate::object::{Time, TimelineObject};
use crate::state::{ResolvedTimeline, TimelineObjectInstance, TimelineState};
use std::collections::HashMap;
use std::fmt;

/// Options for a resolve call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolveOptions {
    /// Time to resolve at
    pub time: Time,
    /// Expand repeating objects up to this time
    pub limit_time: Option<Time>,
    /// Maximum instances per object
    pub limit_count: Option<usize>,
    /// Collect a trace of the resolve steps
    pub trace_resolving: bool,
}

impl ResolveOptions {
    /// Options resolving at `time` with no limits
    pub fn at(time: Time) -> Self {
        Self {
            time,
            limit_time: None,
            limit_count: None,
            trace_resolving: false,
        }
    }

    /// Set the expansion limits
    pub fn with_limits(mut self, limit_time: Time, limit_count: usize) -> Self {
        self.limit_time = Some(limit_time);
        self.limit_count = Some(limit_count);
        self
    }

    /// Enable tracing
    pub fn with_trace(mut self, trace: bool) -> Self {
        self.trace_resolving = trace;
        self
    }
}

/// Cache reused between resolve calls.
///
/// Its contents are private to the resolver implementation.
#[derive(Debug, Clone, Default)]
pub struct ResolveCache {
    pub(crate) objects: HashMap<String, CachedInstances>,
}

#[derive(Debug, Clone)]
pub(crate) struct CachedInstances {
    pub(crate) fingerprint: u64,
    pub(crate) instances: Vec<TimelineObjectInstance>,
}

impl ResolveCache {
    /// Create an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of cached objects
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// Whether the cache is empty
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Drop all cached data
    pub fn clear(&mut self) {
        self.objects.clear();
    }
}

/// What went wrong while resolving
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolveErrorKind {
    /// Timing references form a loop
    CircularReference(String),
    /// A reference points at a missing object
    UnknownReference {
        /// Referring object
        object: String,
        /// Missing object
        reference: String,
    },
    /// An expression could not be parsed
    InvalidExpression {
        /// Object carrying the expression
        object: String,
        /// The expression
        expression: String,
    },
    /// The same ID appears twice
    DuplicateId(String),
    /// The enable uses a form this resolver does not handle
    Unsupported {
        /// Object carrying the enable
        object: String,
        /// What is unsupported
        reason: String,
    },
}

impl fmt::Display for ResolveErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CircularReference(id) => write!(f, "Circular reference involving object \"{id}\""),
            Self::UnknownReference { object, reference } => {
                write!(f, "Object \"{object}\" references unknown object \"{reference}\"")
            }
            Self::InvalidExpression { object, expression } => {
                write!(f, "Invalid expression {expression:?} on object \"{object}\"")
            }
            Self::DuplicateId(id) => write!(f, "Duplicate object id \"{id}\""),
            Self::Unsupported { object, reason } => {
                write!(f, "Unsupported enable on object \"{object}\": {reason}")
            }
        }
    }
}

/// Resolve failure with the trace collected up to the failure
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}")]
pub struct ResolveError {
    /// What went wrong
    pub kind: ResolveErrorKind,
    /// Trace lines, empty unless tracing was enabled
    pub trace: Vec<String>,
}

impl ResolveError {
    /// Create an error without trace
    pub fn new(kind: ResolveErrorKind) -> Self {
        Self {
            kind,
            trace: Vec::new(),
        }
    }

    /// The trace joined into one string
    pub fn trace_text(&self) -> String {
        self.trace.join("\n")
    }
}

/// Resolves timelines and computes state slices
pub trait TimelineResolver: Send + Sync {
    /// Resolve a timeline into concrete instances
    fn resolve_timeline(
        &self,
        timeline: &[TimelineObject],
        options: &ResolveOptions,
        cache: Option<&mut ResolveCache>,
    ) -> Result<ResolvedTimeline, ResolveError>;

    /// The state of all layers at `time`
    fn resolved_state(&self, resolved: &ResolvedTimeline, time: Time) -> TimelineState;
}
