// SPDX-License-Identifier: MIT OR Apache-2.0
//! Fixes `start: "now"` objects to concrete times.
//!
//! Top level objects are set to `now` directly. Objects inside groups are set
//! relative to their parent's resolved start, which needs the timeline to be
//! resolved, so those are fixed in a loop that stops once a pass changes
//! nothing or the iteration cap is reached.

use playout_timeline::{
    ResolveError, ResolveOptions, ResolvedTimeline, Time, TimeExpr, TimelineObject, TimelineResolver,
};
use serde::Serialize;
use std::collections::HashSet;

/// A "now" object and the start it was fixed to
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NowFixup {
    /// Object ID
    pub id: String,
    /// Fixed start, group-relative for children
    pub time: Time,
}

/// Result of fixing a timeline
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NowFixOutcome {
    /// Fixes applied, in order
    pub fixups: Vec<NowFixup>,
    /// Objects still starting "now" after the iteration cap
    pub unresolved: Vec<String>,
    /// Number of resolve passes used
    pub iterations: usize,
}

#[derive(Default)]
struct Pass {
    changed: bool,
    retry: bool,
    fixed: HashSet<String>,
}

fn set_start(object: &mut TimelineObject, time: Time, fixups: &mut Vec<NowFixup>) {
    if let Some(enable) = object.enable.single_mut() {
        enable.start = Some(TimeExpr::Absolute(time));
        fixups.push(NowFixup {
            id: object.id.clone(),
            time,
        });
    }
}

fn starts_now(object: &TimelineObject) -> bool {
    object.enable.single().is_some_and(|e| e.starts_now())
}

fn any_now(objects: &[TimelineObject]) -> bool {
    objects
        .iter()
        .any(|o| starts_now(o) || any_now(&o.children))
}

fn collect_now(objects: &[TimelineObject], out: &mut Vec<String>) {
    for object in objects {
        if starts_now(object) {
            out.push(object.id.clone());
        }
        collect_now(&object.children, out);
    }
}

fn fix_pass(
    objects: &mut [TimelineObject],
    parent: Option<&str>,
    resolved: &ResolvedTimeline,
    now: Time,
    pass: &mut Pass,
    fixups: &mut Vec<NowFixup>,
) {
    for object in objects.iter_mut() {
        if starts_now(object) {
            match parent {
                None => {
                    set_start(object, now, fixups);
                    pass.changed = true;
                    pass.fixed.insert(object.id.clone());
                }
                Some(parent_id) => {
                    let parent_instance = if pass.fixed.contains(parent_id) {
                        None
                    } else {
                        resolved.objects.get(parent_id).and_then(|p| {
                            p.instance_at(now)
                                .or_else(|| p.instances.iter().rev().find(|i| i.start <= now))
                                .or_else(|| p.instances.first())
                        })
                    };
                    match parent_instance {
                        Some(instance) => {
                            set_start(object, now - instance.original_start_or_start(), fixups);
                            pass.changed = true;
                            pass.fixed.insert(object.id.clone());
                        }
                        None => pass.retry = true,
                    }
                }
            }
        }
        fix_pass(&mut object.children, Some(&object.id), resolved, now, pass, fixups);
    }
}

/// Fix all "now" starts in `timeline` in place.
///
/// Resolves happen without cache. Only objects whose start is still the
/// literal `"now"` are touched, so fixing twice is a no-op.
pub fn fix_now_objects(
    resolver: &dyn TimelineResolver,
    timeline: &mut [TimelineObject],
    now: Time,
    max_iterations: usize,
) -> Result<NowFixOutcome, ResolveError> {
    let mut outcome = NowFixOutcome::default();

    // Top level objects need no resolve
    for object in timeline.iter_mut() {
        if starts_now(object) {
            set_start(object, now, &mut outcome.fixups);
        }
    }

    while outcome.iterations < max_iterations && any_now(timeline) {
        outcome.iterations += 1;
        let resolved = resolver.resolve_timeline(timeline, &ResolveOptions::at(now), None)?;

        let mut pass = Pass::default();
        fix_pass(timeline, None, &resolved, now, &mut pass, &mut outcome.fixups);
        if !pass.changed && !pass.retry {
            break;
        }
    }

    collect_now(timeline, &mut outcome.unresolved);
    Ok(outcome)
}

/// Apply fixups computed on a copy to the live timeline
pub fn apply_fixups(timeline: &mut [TimelineObject], fixups: &[NowFixup]) {
    if fixups.is_empty() {
        return;
    }
    for object in timeline.iter_mut() {
        object.visit_mut(&mut |o| {
            if let Some(fix) = fixups.iter().find(|f| f.id == o.id) {
                if let Some(enable) = o.enable.single_mut() {
                    if enable.starts_now() {
                        enable.start = Some(TimeExpr::Absolute(fix.time));
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use playout_timeline::{Enable, SimpleResolver, TimelineContent};

    fn obj(id: &str, enable: Enable) -> TimelineObject {
        TimelineObject::new(format!("layer_{id}"), enable, TimelineContent::default()).with_id(id)
    }

    fn start_of(timeline: &[TimelineObject], id: &str) -> Option<TimeExpr> {
        let mut found = None;
        for object in timeline {
            object.visit(None, &mut |o, _| {
                if o.id == id {
                    found = o.start().cloned();
                }
            });
        }
        found
    }

    #[test]
    fn test_top_level_now_needs_no_resolve() {
        let mut timeline = vec![obj("a", Enable::now()), obj("b", Enable::at(100))];
        let outcome = fix_now_objects(&SimpleResolver, &mut timeline, 5000, 10).unwrap();

        assert_eq!(outcome.iterations, 0);
        assert_eq!(outcome.fixups, vec![NowFixup { id: "a".to_string(), time: 5000 }]);
        assert_eq!(start_of(&timeline, "a"), Some(TimeExpr::Absolute(5000)));
    }

    #[test]
    fn test_child_is_fixed_relative_to_parent() {
        for now in [1500, 4000, 12_345] {
            let group = TimelineObject::group(Enable::at(1000), vec![obj("c", Enable::now())]).with_id("g");
            let mut timeline = vec![group];
            fix_now_objects(&SimpleResolver, &mut timeline, now, 10).unwrap();

            assert_eq!(start_of(&timeline, "c"), Some(TimeExpr::Absolute(now - 1000)));

            let resolved = SimpleResolver
                .resolve_timeline(&timeline, &ResolveOptions::at(now), None)
                .unwrap();
            assert_eq!(resolved.objects["c"].instances[0].start, now);
        }
    }

    #[test]
    fn test_fixing_twice_is_idempotent() {
        let group = TimelineObject::group(Enable::at(1000), vec![obj("c", Enable::now())]).with_id("g");
        let mut timeline = vec![group, obj("a", Enable::now())];
        fix_now_objects(&SimpleResolver, &mut timeline, 3000, 10).unwrap();
        let again = fix_now_objects(&SimpleResolver, &mut timeline, 9000, 10).unwrap();

        assert!(again.fixups.is_empty());
        assert_eq!(start_of(&timeline, "a"), Some(TimeExpr::Absolute(3000)));
        assert_eq!(start_of(&timeline, "c"), Some(TimeExpr::Absolute(2000)));
    }

    #[test]
    fn test_nested_now_groups_take_extra_passes() {
        let inner = TimelineObject::group(Enable::now(), vec![obj("leaf", Enable::now())]).with_id("inner");
        let outer = TimelineObject::group(Enable::now(), vec![inner]).with_id("outer");
        let mut timeline = vec![outer];
        let outcome = fix_now_objects(&SimpleResolver, &mut timeline, 2000, 10).unwrap();

        assert!(outcome.unresolved.is_empty());
        assert!(outcome.iterations >= 2);
        assert_eq!(start_of(&timeline, "outer"), Some(TimeExpr::Absolute(2000)));
        assert_eq!(start_of(&timeline, "inner"), Some(TimeExpr::Absolute(0)));
        assert_eq!(start_of(&timeline, "leaf"), Some(TimeExpr::Absolute(0)));
    }

    #[test]
    fn test_gives_up_after_cap() {
        let open = obj("open", Enable::at(0));
        let group = TimelineObject::group(Enable::at_expr("#open.end"), vec![obj("c", Enable::now())]).with_id("g");
        let mut timeline = vec![open, group];
        let outcome = fix_now_objects(&SimpleResolver, &mut timeline, 1000, 10).unwrap();

        assert_eq!(outcome.iterations, 10);
        assert_eq!(outcome.unresolved, vec!["c".to_string()]);
        assert!(start_of(&timeline, "c").is_some_and(|s| s.is_now()));
    }

    #[test]
    fn test_apply_fixups_only_touches_now() {
        let group = TimelineObject::group(Enable::at(0), vec![obj("c", Enable::now())]).with_id("g");
        let mut timeline = vec![group, obj("a", Enable::at(10))];
        apply_fixups(
            &mut timeline,
            &[
                NowFixup { id: "c".to_string(), time: 70 },
                NowFixup { id: "a".to_string(), time: 99 },
            ],
        );
        assert_eq!(start_of(&timeline, "c"), Some(TimeExpr::Absolute(70)));
        assert_eq!(start_of(&timeline, "a"), Some(TimeExpr::Absolute(10)));
    }
}
