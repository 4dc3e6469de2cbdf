// SPDX-License-Identifier: MIT OR Apache-2.0
//! Conductor configuration.

use playout_timeline::Time;
use serde::{Deserialize, Serialize};

/// Scheduling constants, all in milliseconds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerTimings {
    /// How far ahead of need a resolve may happen
    pub lookahead_time: Time,
    /// Margin before a window expires or an event fires to resolve again
    pub prepare_time: Time,
    /// Shortest timer the loop arms
    pub min_trigger_time: Time,
    /// Length of a resolved window
    pub resolve_limit_time: Time,
    /// Maximum instances per object in a resolve
    pub resolve_limit_count: usize,
    /// Debounce window for start/stop callbacks
    pub callback_wait_time: Time,
    /// Hard timeout on device make-ready/stand-down
    pub device_operation_timeout: Time,
    /// First connection retry delay
    pub connection_retry_base_delay: Time,
    /// Longest connection retry delay
    pub connection_retry_max_delay: Time,
    /// Iteration cap of the "now" fixup loop
    pub now_fix_max_iterations: usize,
}

impl Default for SchedulerTimings {
    fn default() -> Self {
        Self {
            lookahead_time: 5000,
            prepare_time: 2000,
            min_trigger_time: 10,
            resolve_limit_time: 10_000,
            resolve_limit_count: 10,
            callback_wait_time: 50,
            device_operation_timeout: 10_000,
            connection_retry_base_delay: 1000,
            connection_retry_max_delay: 60_000,
            now_fix_max_iterations: 10,
        }
    }
}

/// Options recognized by the conductor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConductorOptions {
    /// Run resolves on the blocking thread pool
    pub multi_threaded_resolver: bool,
    /// Reuse the resolver cache between resolves
    pub use_cache_when_resolving: bool,
    /// Skip dispatching to devices that do nothing
    pub optimize_for_production: bool,
    /// Resolve ahead by an estimate of the resolve duration
    pub proactive_resolve: bool,
    /// Scales the resolve duration estimate
    pub estimate_resolve_time_multiplier: f64,
    /// Scheduling constants
    pub timings: SchedulerTimings,
}

impl Default for ConductorOptions {
    fn default() -> Self {
        Self {
            multi_threaded_resolver: false,
            use_cache_when_resolving: false,
            optimize_for_production: false,
            proactive_resolve: false,
            estimate_resolve_time_multiplier: 1.0,
            timings: SchedulerTimings::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_options_use_defaults() {
        let options: ConductorOptions = serde_json::from_str(
            r#"{ "proactive_resolve": true, "timings": { "prepare_time": 1500 } }"#,
        )
        .unwrap();
        assert!(options.proactive_resolve);
        assert_eq!(options.timings.prepare_time, 1500);
        assert_eq!(options.timings.lookahead_time, 5000);
        assert_eq!(options.estimate_resolve_time_multiplier, 1.0);
    }
}
