// SPDX-License-Identifier: MIT OR Apache-2.0
//! Time source for the scheduler.

use playout_timeline::Time;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::time::Instant;

/// Provides the current time in milliseconds
pub trait Clock: Send + Sync {
    /// Current time
    fn now(&self) -> Time;
}

/// Wall clock anchored to the tokio timer.
///
/// Advances together with `tokio::time`, so paused-time tests drive it.
#[derive(Debug, Clone, Copy)]
pub struct TokioClock {
    origin: Instant,
    origin_ms: Time,
}

impl TokioClock {
    /// Anchor to the current wall clock time
    pub fn new() -> Self {
        let origin_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as Time)
            .unwrap_or_default();
        Self::starting_at(origin_ms)
    }

    /// Anchor so that "now" reads `origin_ms`
    pub fn starting_at(origin_ms: Time) -> Self {
        Self {
            origin: Instant::now(),
            origin_ms,
        }
    }
}

impl Default for TokioClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TokioClock {
    fn now(&self) -> Time {
        self.origin_ms + self.origin.elapsed().as_millis() as Time
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_follows_tokio_time() {
        let clock = TokioClock::starting_at(10_000);
        assert_eq!(clock.now(), 10_000);
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(clock.now(), 11_500);
    }
}
