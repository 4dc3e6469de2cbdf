// SPDX-License-Identifier: MIT OR Apache-2.0

use super::*;
use crate::datastore::DatastoreEntry;
use crate::device::{AbstractCommandKind, AbstractDeviceFactory};
use playout_timeline::{
    DatastoreReference, DeviceType, Enable, Mapping, ResolveCache, ResolveError, ResolveOptions, ResolvedTimeline,
    SimpleResolver, TimelineContent, TimelineKeyframe, TimelineState,
};
use serde_json::{json, Map};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;

#[derive(Default)]
struct CountingResolver {
    calls: AtomicUsize,
}

impl TimelineResolver for CountingResolver {
    fn resolve_timeline(
        &self,
        timeline: &[TimelineObject],
        options: &ResolveOptions,
        cache: Option<&mut ResolveCache>,
    ) -> std::result::Result<ResolvedTimeline, ResolveError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        SimpleResolver.resolve_timeline(timeline, options, cache)
    }

    fn resolved_state(&self, resolved: &ResolvedTimeline, time: Time) -> TimelineState {
        SimpleResolver.resolved_state(resolved, time)
    }
}

struct Harness {
    conductor: Conductor,
    events: UnboundedReceiver<ConductorEvent>,
    factory: Arc<AbstractDeviceFactory>,
    resolver: Arc<CountingResolver>,
    clock: Arc<TokioClock>,
}

impl Harness {
    async fn start(options: ConductorOptions, devices: &[&str]) -> Self {
        let clock = Arc::new(TokioClock::starting_at(100_000));
        let factory = Arc::new(AbstractDeviceFactory::new(clock.clone()));
        let resolver = Arc::new(CountingResolver::default());
        let (conductor, events) = Conductor::with_clock(options, resolver.clone(), factory.clone(), clock.clone());
        for device_id in devices {
            conductor.add_device(*device_id, DeviceOptions::new(DeviceType::Casparcg));
        }
        conductor.init().await.unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;
        Self {
            conductor,
            events,
            factory,
            resolver,
            clock,
        }
    }

    fn drain(&mut self) -> Vec<ConductorEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }

    fn handled(&self, device_id: &str) -> Vec<TimelineState> {
        self.factory.device(device_id).unwrap().handled_states()
    }
}

fn clip(layer: &str, id: &str, enable: Enable, name: &str) -> TimelineObject {
    TimelineObject::new(layer, enable, TimelineContent::default().with_field("clip", name)).with_id(id)
}

fn mappings(pairs: &[(&str, &str)]) -> Mappings {
    pairs
        .iter()
        .map(|(layer, device)| (layer.to_string(), Mapping::new(DeviceType::Casparcg, *device)))
        .collect()
}

#[test]
fn test_resolve_time_estimate_is_bounded_and_monotonic() {
    let counts = [0, 1, 10, 100, 250, 1000, 10_000, 1_000_000];
    let estimates: Vec<Time> = counts.iter().map(|n| calculate_resolve_time(*n, 1.0)).collect();

    assert!(estimates.windows(2).all(|w| w[0] <= w[1]));
    assert!(estimates.iter().all(|e| (20..=200).contains(e)));
    assert_eq!(estimates[0], 20);
    assert_eq!(calculate_resolve_time(250, 1.0), 125);
    assert_eq!(estimates[7], 200);
}

#[test]
fn test_timeline_size_counts_nested_objects() {
    let (conductor, _events) = Conductor::new(
        ConductorOptions::default(),
        Arc::new(SimpleResolver),
        Arc::new(AbstractDeviceFactory::new(Arc::new(TokioClock::starting_at(0)))),
    );
    assert_eq!(conductor.timeline_size(), 0);

    let child = clip("L", "c", Enable::at(0), "x").with_keyframe(TimelineKeyframe::new("kf", Enable::at(10), Map::new()));
    let group = TimelineObject::group(Enable::at(0), vec![child, clip("L2", "d", Enable::at(0), "y")]);
    conductor.set_timeline_and_mappings(vec![group], None).unwrap();
    assert_eq!(conductor.timeline_size(), 4);
    assert_eq!(conductor.timeline_size(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_init_twice_fails() {
    let h = Harness::start(ConductorOptions::default(), &[]).await;
    assert!(matches!(h.conductor.init().await, Err(ConductorError::AlreadyInitialized)));
}

#[tokio::test(start_paused = true)]
async fn test_plays_out_two_clips_back_to_back() {
    let h = Harness::start(ConductorOptions::default(), &["deviceD"]).await;
    let now = h.clock.now();
    let timeline = vec![
        clip("L", "a", Enable::at(now - 1000).with_duration(2000), "X"),
        clip("L", "b", Enable::at_expr("#a.end").with_duration(1000), "Y"),
    ];
    h.conductor
        .set_timeline_and_mappings(timeline, Some(mappings(&[("L", "deviceD")])))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(3000)).await;

    let commands = h.factory.device("deviceD").unwrap().sent_commands();
    let summary: Vec<_> = commands
        .iter()
        .map(|c| {
            let clip = c.content.as_ref().and_then(|content| content.payload.get("clip").cloned());
            (c.time - now, c.kind, clip)
        })
        .collect();
    assert_eq!(
        summary,
        vec![
            (0, AbstractCommandKind::Added, Some(json!("X"))),
            (1000, AbstractCommandKind::Changed, Some(json!("Y"))),
            (2000, AbstractCommandKind::Removed, None),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_device_states_are_dispatched_in_time_order() {
    let h = Harness::start(ConductorOptions::default(), &["deviceD"]).await;
    let now = h.clock.now();
    let timeline = vec![
        clip("L", "loop", Enable::at(now).with_duration(500).with_repeating(2000), "X"),
        clip("L2", "tail", Enable::at(now + 7000).with_duration(3000), "Y"),
    ];
    h.conductor
        .set_timeline_and_mappings(timeline, Some(mappings(&[("L", "deviceD"), ("L2", "deviceD")])))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(30_000)).await;

    let times: Vec<Time> = h.handled("deviceD").iter().map(|s| s.time).collect();
    assert!(times.len() > 10);
    assert!(times.windows(2).all(|w| w[0] <= w[1]), "{times:?}");
}

#[tokio::test(start_paused = true)]
async fn test_future_is_cleared_once_timeline_runs_out() {
    let h = Harness::start(ConductorOptions::default(), &["deviceD"]).await;
    let now = h.clock.now();
    h.conductor
        .set_timeline_and_mappings(
            vec![clip("L", "short", Enable::at(now).with_duration(500), "X")],
            Some(mappings(&[("L", "deviceD")])),
        )
        .unwrap();
    tokio::time::sleep(Duration::from_millis(12_000)).await;

    let device = h.factory.device("deviceD").unwrap();
    let cleared = device.cleared_futures();
    assert!(cleared.iter().any(|t| *t >= now + 500), "{cleared:?}");
    assert!(device.queued_commands().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_callbacks_fire_stop_before_start() {
    let mut h = Harness::start(ConductorOptions::default(), &[]).await;
    let now = h.clock.now();
    let callback_object = |id: &str, enable: Enable| {
        let content = TimelineContent::default().with_callbacks(Some("started"), Some("stopped"), Some(json!(id)));
        TimelineObject::new("L", enable, content).with_id(id)
    };
    let timeline = vec![
        callback_object("a", Enable::at(now).with_duration(1000)),
        callback_object("b", Enable::at(now + 1000)),
    ];
    h.conductor.set_timeline_and_mappings(timeline, None).unwrap();
    tokio::time::sleep(Duration::from_millis(2000)).await;

    let callbacks: Vec<_> = h
        .drain()
        .into_iter()
        .filter_map(|event| match event {
            ConductorEvent::TimelineCallback(cb) => Some((cb.instance_id, cb.callback, cb.time - now)),
            _ => None,
        })
        .collect();
    assert_eq!(
        callbacks,
        vec![
            ("a".to_string(), "started".to_string(), 0),
            ("a".to_string(), "stopped".to_string(), 1000),
            ("b".to_string(), "started".to_string(), 1000),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_datastore_change_refills_only_dependent_device() {
    let h = Harness::start(ConductorOptions::default(), &["gfx", "audio"]).await;
    let now = h.clock.now();
    let title = TimelineContent::default()
        .with_field("text", "")
        .with_reference("text", DatastoreReference::new("title"));
    let timeline = vec![
        TimelineObject::new("G", Enable::at(now + 3000), title).with_id("lower_third"),
        clip("A", "bed", Enable::at(now), "music"),
    ];
    h.conductor
        .set_timeline_and_mappings(timeline, Some(mappings(&[("G", "gfx"), ("A", "audio")])))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(1500)).await;

    let gfx_before = h.handled("gfx").len();
    let audio_before = h.handled("audio").len();
    let resolves_before = h.resolver.calls.load(Ordering::SeqCst);

    let datastore = Datastore::from([("title".to_string(), DatastoreEntry::new("Hello", now + 1500))]);
    h.conductor.set_datastore(datastore).unwrap();
    h.conductor.flush().await.unwrap();

    let gfx = h.handled("gfx");
    assert_eq!(gfx.len(), gfx_before + 2);
    let refilled = gfx.last().unwrap();
    assert_eq!(refilled.time, now + 3000);
    assert_eq!(refilled.layers["G"].object.content.get_path("text"), Some(&json!("Hello")));
    assert_eq!(h.handled("audio").len(), audio_before);
    assert_eq!(h.resolver.calls.load(Ordering::SeqCst), resolves_before);
}

#[tokio::test(start_paused = true)]
async fn test_resolve_errors_keep_the_loop_running() {
    let mut h = Harness::start(ConductorOptions::default(), &[]).await;
    let timeline = vec![
        clip("L1", "a", Enable::at_expr("#b.start"), "x"),
        clip("L2", "b", Enable::at_expr("#a.start"), "y"),
    ];
    h.conductor.set_timeline_and_mappings(timeline, None).unwrap();

    let count_errors = |events: Vec<ConductorEvent>| {
        events
            .iter()
            .filter(|e| matches!(e, ConductorEvent::Error { context, .. } if context == "resolveTimeline"))
            .count()
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    let first = count_errors(h.drain());
    assert!(first > 0);

    tokio::time::sleep(Duration::from_millis(5000)).await;
    assert!(count_errors(h.drain()) > 0);
    h.conductor.flush().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_measurement_and_hash_are_reported() {
    let mut h = Harness::start(ConductorOptions::default(), &[]).await;
    h.conductor.set_timeline_hash(Some("rev-7".to_string())).unwrap();
    h.conductor.stat_start_measure("take").unwrap();
    let now = h.clock.now();
    h.conductor
        .set_timeline_and_mappings(vec![clip("L", "a", Enable::at(now), "x")], None)
        .unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;

    let events = h.drain();
    let report = events
        .iter()
        .find_map(|e| match e {
            ConductorEvent::StatReport(report) => Some(report.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(report.reason, "take");
    assert!(report.timeline_resolved.is_some());
    assert!(report.state_handled.is_some());
    assert!(events.iter().any(|e| matches!(
        e,
        ConductorEvent::ResolveDone { timeline_hash: Some(hash), .. } if hash == "rev-7"
    )));
}

#[tokio::test(start_paused = true)]
async fn test_make_ready_resolves_again() {
    let h = Harness::start(ConductorOptions::default(), &["deviceD"]).await;
    let now = h.clock.now();
    h.conductor
        .set_timeline_and_mappings(
            vec![clip("L", "a", Enable::at(now), "x")],
            Some(mappings(&[("L", "deviceD")])),
        )
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    let before = h.handled("deviceD").len();

    h.conductor.devices_make_ready(true, Some("activation".to_string())).await.unwrap();
    tokio::time::sleep(Duration::from_millis(1)).await;
    assert!(h.handled("deviceD").len() > before);

    h.conductor.devices_stand_down(false).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_production_mode_skips_abstract_devices() {
    let options = ConductorOptions {
        optimize_for_production: true,
        ..Default::default()
    };
    let h = Harness::start(options, &["deviceD"]).await;
    let now = h.clock.now();
    h.conductor
        .set_timeline_and_mappings(
            vec![clip("L", "a", Enable::at(now), "x")],
            Some(mappings(&[("L", "deviceD")])),
        )
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(h.handled("deviceD").is_empty());
}
