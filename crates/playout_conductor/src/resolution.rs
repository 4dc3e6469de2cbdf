// SPDX-License-Identifier: MIT OR Apache-2.0
//! Adapter around the timeline resolver.
//!
//! Owns the resolver cache, fixes "now" objects before resolving and retries a
//! failed resolve once with tracing enabled to capture diagnostics.

use crate::error::{ConductorError, Result};
use crate::events::{ConductorEvent, EventSink};
use crate::now_resolver::{fix_now_objects, NowFixOutcome, NowFixup};
use playout_timeline::{
    ResolveCache, ResolveError, ResolveOptions, ResolvedTimeline, Time, TimelineObject, TimelineResolver,
};
use std::sync::Arc;

/// Result of a resolve
#[derive(Debug, Clone)]
pub struct ResolveOutput {
    /// The resolved timeline
    pub resolved: Arc<ResolvedTimeline>,
    /// "now" fixes to apply to the live timeline
    pub fixups: Vec<NowFixup>,
}

/// Resolve with a traced retry on failure
pub fn resolve_with_retry(
    resolver: &dyn TimelineResolver,
    timeline: &[TimelineObject],
    options: &ResolveOptions,
    cache: Option<&mut ResolveCache>,
    events: &EventSink,
) -> std::result::Result<ResolvedTimeline, ResolveError> {
    let first = match resolver.resolve_timeline(timeline, options, cache) {
        Ok(resolved) => return Ok(resolved),
        Err(err) => err,
    };

    if options.trace_resolving {
        events.error("resolveTimeline", format!("{first}\n{}", first.trace_text()));
        return Err(first);
    }

    let traced = options.clone().with_trace(true);
    match resolver.resolve_timeline(timeline, &traced, None) {
        Ok(resolved) => {
            events.error(
                "resolveTimeline",
                format!("Resolve failed on the first try but the second try succeeded: {first}"),
            );
            Ok(resolved)
        }
        Err(second) => {
            events.error("resolveTimeline", format!("{second}\n{}", second.trace_text()));
            Err(second)
        }
    }
}

struct Job {
    resolver: Arc<dyn TimelineResolver>,
    timeline: Vec<TimelineObject>,
    options: ResolveOptions,
    cache: Option<ResolveCache>,
    max_iterations: usize,
    events: EventSink,
}

type JobResult = (
    std::result::Result<(ResolvedTimeline, NowFixOutcome), ResolveError>,
    Option<ResolveCache>,
);

impl Job {
    fn run(mut self) -> JobResult {
        let result = fix_now_objects(
            self.resolver.as_ref(),
            &mut self.timeline,
            self.options.time,
            self.max_iterations,
        )
        .and_then(|outcome| {
            let resolved = resolve_with_retry(
                self.resolver.as_ref(),
                &self.timeline,
                &self.options,
                self.cache.as_mut(),
                &self.events,
            )?;
            Ok((resolved, outcome))
        });
        (result, self.cache)
    }
}

/// Resolves timelines for the scheduling loop
pub struct ResolutionAdapter {
    resolver: Arc<dyn TimelineResolver>,
    cache: Option<ResolveCache>,
    multi_threaded: bool,
    limit_count: usize,
    max_now_iterations: usize,
    events: EventSink,
}

impl ResolutionAdapter {
    /// Create an adapter
    pub fn new(
        resolver: Arc<dyn TimelineResolver>,
        multi_threaded: bool,
        limit_count: usize,
        max_now_iterations: usize,
        events: EventSink,
    ) -> Self {
        Self {
            resolver,
            cache: None,
            multi_threaded,
            limit_count,
            max_now_iterations,
            events,
        }
    }

    /// The wrapped resolver
    pub fn resolver(&self) -> &Arc<dyn TimelineResolver> {
        &self.resolver
    }

    /// Drop the resolver cache
    pub fn reset(&mut self) {
        self.cache = None;
    }

    /// Fix "now" objects on a copy of `timeline` and resolve it.
    ///
    /// The returned fixups have not been applied to `timeline`.
    pub async fn resolve_timeline(
        &mut self,
        resolve_time: Time,
        timeline: &[TimelineObject],
        limit_time: Time,
        use_cache: bool,
    ) -> Result<ResolveOutput> {
        let cache = if use_cache {
            Some(self.cache.take().unwrap_or_default())
        } else {
            None
        };
        let job = Job {
            resolver: Arc::clone(&self.resolver),
            timeline: timeline.to_vec(),
            options: ResolveOptions::at(resolve_time).with_limits(limit_time, self.limit_count),
            cache,
            max_iterations: self.max_now_iterations,
            events: self.events.clone(),
        };

        let (result, cache) = if self.multi_threaded {
            tokio::task::spawn_blocking(move || job.run())
                .await
                .map_err(|e| ConductorError::ResolverTask(e.to_string()))?
        } else {
            job.run()
        };
        if cache.is_some() {
            self.cache = cache;
        }

        let (resolved, outcome) = result?;
        if !outcome.unresolved.is_empty() {
            self.events.warning(format!(
                "Could not fix \"now\" start of {} after {} iterations",
                outcome.unresolved.join(", "),
                outcome.iterations
            ));
        }
        if !outcome.fixups.is_empty() {
            self.events
                .emit(ConductorEvent::SetTimelineTriggerTime(outcome.fixups.clone()));
        }

        Ok(ResolveOutput {
            resolved: Arc::new(resolved),
            fixups: outcome.fixups,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use playout_timeline::{Enable, ResolveErrorKind, SimpleResolver, TimelineContent, TimelineState};
    use tokio::sync::mpsc::UnboundedReceiver;

    /// Fails every call until `failures` runs out
    struct FlakyResolver {
        failures: Mutex<usize>,
        calls: Mutex<Vec<bool>>,
    }

    impl TimelineResolver for FlakyResolver {
        fn resolve_timeline(
            &self,
            timeline: &[TimelineObject],
            options: &ResolveOptions,
            cache: Option<&mut ResolveCache>,
        ) -> std::result::Result<ResolvedTimeline, ResolveError> {
            self.calls.lock().push(options.trace_resolving);
            let mut failures = self.failures.lock();
            if *failures > 0 {
                *failures -= 1;
                let mut err = ResolveError::new(ResolveErrorKind::CircularReference("x".to_string()));
                if options.trace_resolving {
                    err.trace.push("resolving \"x\"".to_string());
                }
                return Err(err);
            }
            SimpleResolver.resolve_timeline(timeline, options, cache)
        }

        fn resolved_state(&self, resolved: &ResolvedTimeline, time: Time) -> TimelineState {
            SimpleResolver.resolved_state(resolved, time)
        }
    }

    fn errors(rx: &mut UnboundedReceiver<ConductorEvent>) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let ConductorEvent::Error { message, .. } = event {
                out.push(message);
            }
        }
        out
    }

    fn timeline() -> Vec<TimelineObject> {
        vec![TimelineObject::new("L", Enable::now(), TimelineContent::default()).with_id("a")]
    }

    #[test]
    fn test_double_failure_reports_trace_and_fails() {
        let resolver = FlakyResolver {
            failures: Mutex::new(2),
            calls: Mutex::new(Vec::new()),
        };
        let (events, mut rx) = EventSink::channel();
        let err = resolve_with_retry(&resolver, &timeline(), &ResolveOptions::at(0), None, &events).unwrap_err();

        assert_eq!(*resolver.calls.lock(), vec![false, true]);
        assert_eq!(err.trace.len(), 1);
        let errors = errors(&mut rx);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("resolving \"x\""));
    }

    #[test]
    fn test_second_try_success_is_reported() {
        let resolver = FlakyResolver {
            failures: Mutex::new(1),
            calls: Mutex::new(Vec::new()),
        };
        let (events, mut rx) = EventSink::channel();
        let resolved = resolve_with_retry(&resolver, &timeline(), &ResolveOptions::at(0), None, &events);

        assert!(resolved.is_ok());
        assert!(errors(&mut rx)[0].contains("second try succeeded"));
    }

    #[tokio::test]
    async fn test_adapter_returns_fixups_without_touching_input() {
        let (events, mut rx) = EventSink::channel();
        let mut adapter = ResolutionAdapter::new(Arc::new(SimpleResolver), false, 10, 10, events);
        let timeline = timeline();
        let output = adapter.resolve_timeline(4000, &timeline, 14_000, true).await.unwrap();

        assert_eq!(output.fixups, vec![NowFixup { id: "a".to_string(), time: 4000 }]);
        assert!(timeline[0].enable.single().unwrap().starts_now());
        assert_eq!(output.resolved.objects["a"].instances[0].start, 4000);
        assert!(matches!(rx.try_recv(), Ok(ConductorEvent::SetTimelineTriggerTime(f)) if f.len() == 1));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_multi_threaded_resolve_keeps_cache() {
        let (events, _rx) = EventSink::channel();
        let mut adapter = ResolutionAdapter::new(Arc::new(SimpleResolver), true, 10, 10, events);
        let timeline = vec![TimelineObject::new("L", Enable::at(0), TimelineContent::default()).with_id("s")];

        adapter.resolve_timeline(0, &timeline, 10_000, true).await.unwrap();
        let second = adapter.resolve_timeline(100, &timeline, 10_100, true).await.unwrap();
        assert_eq!(second.resolved.statistics.cached_object_count, 1);

        adapter.reset();
        let third = adapter.resolve_timeline(200, &timeline, 10_200, true).await.unwrap();
        assert_eq!(third.resolved.statistics.cached_object_count, 0);
    }
}
