// SPDX-License-Identifier: MIT OR Apache-2.0
//! Cache of the last resolved timeline and the window it is valid for.

use playout_timeline::{ResolvedTimeline, Time};
use std::sync::Arc;

/// Last resolve result and its validity window `[resolve_time, valid_to)`
#[derive(Debug, Clone, Default)]
pub struct ResolveWindow {
    resolved: Option<Arc<ResolvedTimeline>>,
    resolve_time: Time,
    valid_to: Time,
}

impl ResolveWindow {
    /// An empty window
    pub fn new() -> Self {
        Self::default()
    }

    /// The cached timeline, if it can serve `resolve_time`.
    ///
    /// Stops serving `prepare_time` before the window ends so the next
    /// resolve has time to finish.
    pub fn reusable(&self, resolve_time: Time, prepare_time: Time) -> Option<Arc<ResolvedTimeline>> {
        let resolved = self.resolved.as_ref()?;
        (resolve_time >= self.resolve_time && resolve_time < self.valid_to - prepare_time)
            .then(|| Arc::clone(resolved))
    }

    /// Store a fresh resolve valid for `limit_time` from `resolve_time`
    pub fn store(&mut self, resolved: Arc<ResolvedTimeline>, resolve_time: Time, limit_time: Time) {
        self.resolved = Some(resolved);
        self.resolve_time = resolve_time;
        self.valid_to = resolve_time + limit_time;
    }

    /// Forget the cached timeline
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// End of the window
    pub fn valid_to(&self) -> Time {
        self.valid_to
    }

    /// Start of the window
    pub fn resolve_time(&self) -> Time {
        self.resolve_time
    }

    /// Whether a timeline is cached
    pub fn is_empty(&self) -> bool {
        self.resolved.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indexmap::IndexMap;
    use playout_timeline::ResolveStatistics;

    fn resolved() -> Arc<ResolvedTimeline> {
        Arc::new(ResolvedTimeline {
            time: 1000,
            limit_time: 11_000,
            objects: IndexMap::new(),
            statistics: ResolveStatistics::default(),
        })
    }

    #[test]
    fn test_validity_window_boundaries() {
        let mut window = ResolveWindow::new();
        window.store(resolved(), 1000, 10_000);
        assert_eq!(window.valid_to(), 11_000);

        assert!(window.reusable(8999, 2000).is_some());
        assert!(window.reusable(9001, 2000).is_none());
        assert!(window.reusable(999, 2000).is_none());
    }

    #[test]
    fn test_reset_empties_window() {
        let mut window = ResolveWindow::new();
        window.store(resolved(), 1000, 10_000);
        window.reset();
        assert!(window.is_empty());
        assert_eq!((window.resolve_time(), window.valid_to()), (0, 0));
        assert!(window.reusable(1000, 2000).is_none());
    }
}
