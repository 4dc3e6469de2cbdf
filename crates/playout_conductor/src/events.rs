// SPDX-License-Identifier: MIT OR Apache-2.0
//! Notifications from the conductor to the host application.
//!
//! Events are pushed onto an unbounded channel the host drains at its own
//! pace. Every event is also logged through `tracing`.

use crate::now_resolver::NowFixup;
use playout_timeline::Time;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;

/// Timing report for a measured resolve, in ms since the measurement began
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatReport {
    /// Why the measurement was started
    pub reason: String,
    /// When the resolve started
    pub timeline_start_resolve: Option<i64>,
    /// When the resolve finished
    pub timeline_resolved: Option<i64>,
    /// When all devices were handed their state
    pub state_handled: Option<i64>,
    /// When the tick finished
    pub done: i64,
}

/// A timeline callback to deliver to the host
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineCallback {
    /// Time the start or stop happened
    pub time: Time,
    /// Timeline object ID
    pub instance_id: String,
    /// Callback name
    pub callback: String,
    /// Callback payload
    pub callback_data: Option<Value>,
}

/// Event emitted by the conductor
#[derive(Debug, Clone, PartialEq)]
pub enum ConductorEvent {
    /// Something failed; the conductor keeps running
    Error {
        /// Where it failed
        context: String,
        /// What failed
        message: String,
    },
    /// Something looks off
    Warning(String),
    /// Informational message
    Info(String),
    /// Debug message
    Debug(String),
    /// "now" objects were fixed to these times
    SetTimelineTriggerTime(Vec<NowFixup>),
    /// A start or stop callback fired
    TimelineCallback(TimelineCallback),
    /// A resolve tick completed
    ResolveDone {
        /// Hash of the timeline set by the host
        timeline_hash: Option<String>,
        /// Duration of the tick
        duration_ms: u64,
    },
    /// Timing report of a measured tick
    StatReport(StatReport),
    /// A device connection was created
    ConnectionAdded(String),
    /// A device connection was removed
    ConnectionRemoved(String),
}

/// Cloneable sender for [`ConductorEvent`]s
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<ConductorEvent>,
}

impl EventSink {
    /// Create a sink and the receiver the host drains
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ConductorEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Send an event; a closed receiver is ignored
    pub fn emit(&self, event: ConductorEvent) {
        let _ = self.tx.send(event);
    }

    /// Report an error
    pub fn error(&self, context: impl Into<String>, error: impl std::fmt::Display) {
        let context = context.into();
        let message = error.to_string();
        tracing::error!(%context, "{message}");
        self.emit(ConductorEvent::Error { context, message });
    }

    /// Report a warning
    pub fn warning(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::warn!("{message}");
        self.emit(ConductorEvent::Warning(message));
    }

    /// Report an informational message
    pub fn info(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::info!("{message}");
        self.emit(ConductorEvent::Info(message));
    }

    /// Report a debug message
    pub fn debug(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::debug!("{message}");
        self.emit(ConductorEvent::Debug(message));
    }
}
