// SPDX-License-Identifier: MIT OR Apache-2.0
//! Reference implementation of [`TimelineResolver`].
//!
//! Supports absolute and group relative starts, `"now"`, `#id.start` /
//! `#id.end` references with offsets, `end`/`duration`, `repeating`,
//! `while: 1`, keyframe overlays and priority based layer conflicts.

use crate::object::{Enable, Time, TimeExpr, TimelineObject};
use crate::resolver::{
    CachedInstances, ResolveCache, ResolveError, ResolveErrorKind, ResolveOptions, TimelineResolver,
};
use crate::state::{
    EventKind, NextEvent, ResolveStatistics, ResolvedInstance, ResolvedObject, ResolvedTimeline,
    TimelineObjectInstance, TimelineState,
};
use indexmap::IndexMap;
use std::collections::HashMap;
use std::hash::{DefaultHasher, Hash, Hasher};

/// Upper bound on instances of a repeating object when no limit is given
const DEFAULT_REPEAT_LIMIT: usize = 100;

/// Which edge of a referenced instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Edge {
    Start,
    End,
}

/// Parsed time expression
#[derive(Debug, Clone, PartialEq, Eq)]
enum Expr {
    /// Relative to the parent start
    Number(Time),
    /// The resolve time
    Now,
    /// Edge of another object, plus an offset
    Reference { id: String, edge: Edge, offset: Time },
}

fn parse_expr(text: &str) -> Option<Expr> {
    let text = text.trim();
    if text == crate::object::NOW {
        return Some(Expr::Now);
    }
    if let Ok(number) = text.parse::<Time>() {
        return Some(Expr::Number(number));
    }

    let body = text.strip_prefix('#')?;
    let (id, rest, edge) = if let Some(pos) = body.find(".start") {
        (&body[..pos], &body[pos + ".start".len()..], Edge::Start)
    } else if let Some(pos) = body.find(".end") {
        (&body[..pos], &body[pos + ".end".len()..], Edge::End)
    } else {
        return None;
    };
    if id.is_empty() {
        return None;
    }

    let rest = rest.trim();
    let offset = if rest.is_empty() {
        0
    } else {
        let (sign, number) = rest.split_at(1);
        let number: Time = number.trim().parse().ok()?;
        match sign {
            "+" => number,
            "-" => -number,
            _ => return None,
        }
    };

    Some(Expr::Reference {
        id: id.to_string(),
        edge,
        offset,
    })
}

fn to_expr(object: &str, value: &TimeExpr) -> Result<Expr, ResolveErrorKind> {
    match value {
        TimeExpr::Absolute(t) => Ok(Expr::Number(*t)),
        TimeExpr::Expression(text) => parse_expr(text).ok_or_else(|| ResolveErrorKind::InvalidExpression {
            object: object.to_string(),
            expression: text.clone(),
        }),
    }
}

/// Whether an enable's timing depends only on its own numbers
fn is_static(enable: &Enable) -> bool {
    let static_expr = |e: &Option<TimeExpr>| match e {
        None | Some(TimeExpr::Absolute(_)) => true,
        Some(TimeExpr::Expression(text)) => text.trim().parse::<Time>().is_ok(),
    };
    enable.repeating.is_none()
        && enable.while_.is_none()
        && static_expr(&enable.start)
        && static_expr(&enable.end)
        && static_expr(&enable.duration)
}

struct Node<'a> {
    object: &'a TimelineObject,
    parent: Option<usize>,
    depth: usize,
}

#[derive(Default)]
struct Tracer {
    enabled: bool,
    lines: Vec<String>,
}

impl Tracer {
    fn log(&mut self, line: impl FnOnce() -> String) {
        if self.enabled {
            self.lines.push(line());
        }
    }
}

/// Scope an enable is evaluated in
#[derive(Clone, Copy)]
struct ParentSpan {
    origin: Time,
    start: Time,
    end: Option<Time>,
}

struct Resolution<'a, 'c> {
    nodes: Vec<Node<'a>>,
    index: HashMap<&'a str, usize>,
    options: &'a ResolveOptions,
    results: Vec<Option<Vec<TimelineObjectInstance>>>,
    visiting: Vec<bool>,
    tracer: Tracer,
    cache: Option<&'c mut ResolveCache>,
    statistics: ResolveStatistics,
}

impl<'a, 'c> Resolution<'a, 'c> {
    fn new(
        timeline: &'a [TimelineObject],
        options: &'a ResolveOptions,
        cache: Option<&'c mut ResolveCache>,
    ) -> Result<Self, ResolveErrorKind> {
        let mut flat: Vec<Node<'a>> = Vec::new();
        fn push<'a>(flat: &mut Vec<Node<'a>>, object: &'a TimelineObject, parent: Option<usize>, depth: usize) {
            let index = flat.len();
            flat.push(Node { object, parent, depth });
            for child in &object.children {
                push(flat, child, Some(index), depth + 1);
            }
        }
        for object in timeline {
            push(&mut flat, object, None, 0);
        }

        let mut index = HashMap::with_capacity(flat.len());
        for (i, node) in flat.iter().enumerate() {
            if index.insert(node.object.id.as_str(), i).is_some() {
                return Err(ResolveErrorKind::DuplicateId(node.object.id.clone()));
            }
        }

        let count = flat.len();
        Ok(Self {
            nodes: flat,
            index,
            options,
            results: vec![None; count],
            visiting: vec![false; count],
            tracer: Tracer {
                enabled: options.trace_resolving,
                lines: Vec::new(),
            },
            cache,
            statistics: ResolveStatistics::default(),
        })
    }

    fn resolve_all(&mut self) -> Result<(), ResolveErrorKind> {
        for i in 0..self.nodes.len() {
            self.resolve_node(i)?;
        }
        Ok(())
    }

    fn resolve_node(&mut self, i: usize) -> Result<(), ResolveErrorKind> {
        if self.results[i].is_some() {
            return Ok(());
        }
        let object = self.nodes[i].object;
        if self.visiting[i] {
            return Err(ResolveErrorKind::CircularReference(object.id.clone()));
        }
        self.visiting[i] = true;
        self.tracer.log(|| format!("resolving \"{}\"", object.id));

        let spans: Vec<ParentSpan> = match self.nodes[i].parent {
            Some(parent) => {
                self.resolve_node(parent)?;
                self.results[parent]
                    .as_deref()
                    .unwrap_or_default()
                    .iter()
                    .map(|p| ParentSpan {
                        origin: p.original_start_or_start(),
                        start: p.start,
                        end: p.end,
                    })
                    .collect()
            }
            None => vec![ParentSpan {
                origin: 0,
                start: Time::MIN,
                end: None,
            }],
        };

        let fingerprint = self.fingerprint(object, &spans);
        let cached = fingerprint.and_then(|fingerprint| {
            let cached = self.cache.as_deref()?.objects.get(&object.id)?;
            (cached.fingerprint == fingerprint).then(|| cached.instances.clone())
        });
        if let Some(instances) = cached {
            self.tracer.log(|| format!("\"{}\" served from cache", object.id));
            self.statistics.cached_object_count += 1;
            self.finish(i, instances);
            return Ok(());
        }

        let mut instances = Vec::new();
        for span in &spans {
            for enable in object.enable.iter() {
                self.instances_for(object, enable, *span, &mut instances)?;
            }
        }
        instances.sort_by_key(|inst| inst.start);
        if let Some(limit) = self.options.limit_count {
            instances.truncate(limit.max(1));
        }
        for (n, instance) in instances.iter_mut().enumerate() {
            instance.id = format!("@{}_{}", object.id, n);
        }

        if let (Some(fingerprint), Some(cache)) = (fingerprint, self.cache.as_deref_mut()) {
            cache.objects.insert(
                object.id.clone(),
                CachedInstances {
                    fingerprint,
                    instances: instances.clone(),
                },
            );
        }
        self.finish(i, instances);
        Ok(())
    }

    fn finish(&mut self, i: usize, instances: Vec<TimelineObjectInstance>) {
        let object = self.nodes[i].object;
        self.tracer.log(|| format!("\"{}\" resolved to {} instance(s)", object.id, instances.len()));
        self.statistics.resolved_object_count += 1;
        self.statistics.resolved_instance_count += instances.len();
        self.results[i] = Some(instances);
        self.visiting[i] = false;
    }

    fn fingerprint(&self, object: &TimelineObject, spans: &[ParentSpan]) -> Option<u64> {
        if !object.enable.iter().all(is_static) {
            return None;
        }
        let mut hasher = DefaultHasher::new();
        serde_json::to_string(&object.enable).ok()?.hash(&mut hasher);
        for span in spans {
            (span.origin, span.start, span.end).hash(&mut hasher);
        }
        self.options.limit_count.hash(&mut hasher);
        Some(hasher.finish())
    }

    /// Absolute time of an expression, `None` if the referenced edge does not exist
    fn evaluate(
        &mut self,
        object: &TimelineObject,
        expr: &Expr,
        span: ParentSpan,
        references: &mut Vec<String>,
    ) -> Result<Option<Time>, ResolveErrorKind> {
        match expr {
            Expr::Number(n) => Ok(Some(span.origin + n)),
            Expr::Now => Ok(Some(self.options.time)),
            Expr::Reference { id, edge, offset } => {
                let target = *self.index.get(id.as_str()).ok_or_else(|| ResolveErrorKind::UnknownReference {
                    object: object.id.clone(),
                    reference: id.clone(),
                })?;
                self.resolve_node(target)?;
                if !references.contains(id) {
                    references.push(id.clone());
                }
                let time = self.options.time;
                let instances = self.results[target].as_deref().unwrap_or_default();
                let chosen = instances
                    .iter()
                    .rev()
                    .find(|inst| inst.start <= time)
                    .or_else(|| instances.first());
                let value = chosen.and_then(|inst| match edge {
                    Edge::Start => Some(inst.start),
                    Edge::End => inst.end,
                });
                self.tracer.log(|| format!("\"{}\" -> #{id}: {value:?}", object.id));
                Ok(value.map(|v| v + offset))
            }
        }
    }

    fn instances_for(
        &mut self,
        object: &TimelineObject,
        enable: &Enable,
        span: ParentSpan,
        out: &mut Vec<TimelineObjectInstance>,
    ) -> Result<(), ResolveErrorKind> {
        let mut references = Vec::new();

        let (start, end) = if enable.is_always() {
            (span.start.max(span.origin), None)
        } else if enable.while_.is_some() {
            return Err(ResolveErrorKind::Unsupported {
                object: object.id.clone(),
                reason: "only `while: 1` is supported".to_string(),
            });
        } else {
            let start_expr = enable.start.as_ref().ok_or_else(|| ResolveErrorKind::Unsupported {
                object: object.id.clone(),
                reason: "missing start".to_string(),
            })?;
            let start_expr = to_expr(&object.id, start_expr)?;
            let Some(start) = self.evaluate(object, &start_expr, span, &mut references)? else {
                return Ok(());
            };

            let end = if let Some(end) = &enable.end {
                let end_expr = to_expr(&object.id, end)?;
                match self.evaluate(object, &end_expr, span, &mut references)? {
                    Some(end) => Some(end),
                    None => return Ok(()),
                }
            } else if let Some(duration) = &enable.duration {
                match to_expr(&object.id, duration)? {
                    Expr::Number(d) => Some(start + d),
                    _ => {
                        return Err(ResolveErrorKind::Unsupported {
                            object: object.id.clone(),
                            reason: "duration must be a number".to_string(),
                        })
                    }
                }
            } else {
                None
            };
            (start, end)
        };

        let mut push = |start: Time, end: Option<Time>| {
            let clipped_start = start.max(span.start);
            let clipped_end = match (end, span.end) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
            if clipped_end.is_some_and(|e| e <= clipped_start) {
                return;
            }
            out.push(TimelineObjectInstance {
                id: String::new(),
                start: clipped_start,
                end: clipped_end,
                original_start: Some(start),
                original_end: end,
                references: references.clone(),
            });
        };

        match enable.repeating {
            Some(interval) if interval > 0 => {
                let limit_time = self.options.limit_time;
                let limit_count = self.options.limit_count.unwrap_or(DEFAULT_REPEAT_LIMIT);
                let length = end.map(|e| (e - start).clamp(0, interval)).unwrap_or(interval);
                let mut k = if self.options.time > start {
                    (self.options.time - start) / interval
                } else {
                    0
                };
                let mut produced = 0;
                while produced < limit_count {
                    let repeat_start = start + k * interval;
                    if produced > 0 && limit_time.is_some_and(|limit| repeat_start > limit) {
                        break;
                    }
                    push(repeat_start, Some(repeat_start + length));
                    produced += 1;
                    k += 1;
                }
            }
            _ => push(start, end),
        }
        Ok(())
    }
}

/// Keyframe window relative to an instance
fn keyframe_span(base: Time, enable: &Enable) -> Option<(Time, Option<Time>)> {
    let number = |e: &TimeExpr| match e {
        TimeExpr::Absolute(t) => Some(*t),
        TimeExpr::Expression(text) => text.trim().parse::<Time>().ok(),
    };
    if enable.is_always() {
        return Some((base, None));
    }
    let start = base + number(enable.start.as_ref()?)?;
    let end = match (&enable.end, &enable.duration) {
        (Some(end), _) => Some(base + number(end)?),
        (None, Some(duration)) => Some(start + number(duration)?),
        (None, None) => None,
    };
    Some((start, end))
}

/// Built-in timeline resolver
#[derive(Debug, Clone, Copy, Default)]
pub struct SimpleResolver;

impl SimpleResolver {
    /// Create a resolver
    pub fn new() -> Self {
        Self
    }
}

impl TimelineResolver for SimpleResolver {
    fn resolve_timeline(
        &self,
        timeline: &[TimelineObject],
        options: &ResolveOptions,
        cache: Option<&mut ResolveCache>,
    ) -> Result<ResolvedTimeline, ResolveError> {
        let mut resolution = Resolution::new(timeline, options, cache).map_err(ResolveError::new)?;
        if let Err(kind) = resolution.resolve_all() {
            return Err(ResolveError {
                kind,
                trace: std::mem::take(&mut resolution.tracer.lines),
            });
        }

        let mut objects = IndexMap::with_capacity(resolution.nodes.len());
        for (node, instances) in resolution.nodes.iter().zip(resolution.results) {
            let mut object = node.object.clone();
            object.children.clear();
            objects.insert(
                object.id.clone(),
                ResolvedObject {
                    object,
                    parent_id: node.parent.map(|p| resolution.nodes[p].object.id.clone()),
                    depth: node.depth,
                    instances: instances.unwrap_or_default(),
                },
            );
        }

        tracing::trace!(
            objects = resolution.statistics.resolved_object_count,
            instances = resolution.statistics.resolved_instance_count,
            "timeline resolved"
        );

        Ok(ResolvedTimeline {
            time: options.time,
            limit_time: options.limit_time.unwrap_or(options.time),
            objects,
            statistics: resolution.statistics,
        })
    }

    fn resolved_state(&self, resolved: &ResolvedTimeline, time: Time) -> TimelineState {
        let mut state = TimelineState::empty(time);

        for resolved_object in resolved.objects.values() {
            let object = &resolved_object.object;

            for instance in &resolved_object.instances {
                if instance.start > time {
                    state.next_events.push(NextEvent {
                        kind: EventKind::Start,
                        time: instance.start,
                        obj_id: object.id.clone(),
                    });
                }
                if let Some(end) = instance.end.filter(|end| *end > time) {
                    state.next_events.push(NextEvent {
                        kind: EventKind::End,
                        time: end,
                        obj_id: object.id.clone(),
                    });
                }
                if !object.disable_keyframes {
                    let base = instance.original_start_or_start();
                    for keyframe in object.keyframes.iter().filter(|k| !k.disabled) {
                        let Some((start, end)) = keyframe_span(base, &keyframe.enable) else {
                            continue;
                        };
                        for edge in [Some(start), end].into_iter().flatten() {
                            let inside = edge > instance.start && instance.end.map_or(true, |e| edge < e);
                            if edge > time && inside {
                                state.next_events.push(NextEvent {
                                    kind: EventKind::Keyframe,
                                    time: edge,
                                    obj_id: object.id.clone(),
                                });
                            }
                        }
                    }
                }
            }

            if object.layer.is_empty() {
                continue;
            }
            let Some(instance) = resolved_object.instance_at(time) else {
                continue;
            };

            let wins = match state.layers.get(&object.layer) {
                None => true,
                Some(current) => {
                    (object.priority, instance.start) >= (current.object.priority, current.instance.start)
                }
            };
            if !wins {
                continue;
            }

            let mut object = object.clone();
            if !object.disable_keyframes {
                let base = instance.original_start_or_start();
                let keyframes = std::mem::take(&mut object.keyframes);
                for keyframe in keyframes.iter().filter(|k| !k.disabled) {
                    let active = keyframe_span(base, &keyframe.enable)
                        .is_some_and(|(start, end)| start <= time && end.map_or(true, |e| e > time));
                    if active {
                        object.content.merge_overlay(&keyframe.content);
                    }
                }
                object.keyframes = keyframes;
            }

            state.layers.insert(
                object.layer.clone(),
                ResolvedInstance {
                    object,
                    instance: instance.clone(),
                    parent_id: resolved_object.parent_id.clone(),
                },
            );
        }

        state.next_events.sort_by_key(|e| e.time);
        state
    }
}
