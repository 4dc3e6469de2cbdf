// SPDX-License-Identifier: MIT OR Apache-2.0
//! Playout runner
//!
//! Loads a show file, connects its devices and plays the timeline through
//! the conductor until stopped.

mod error;
mod show;

use clap::{Parser, Subcommand};
use error::{Result, RunnerError};
use playout_conductor::{
    fix_now_objects, AbstractDeviceFactory, Clock, Conductor, ConductorEvent, TokioClock,
};
use playout_timeline::{ResolveOptions, SimpleResolver, TimelineResolver};
use show::ShowFile;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

/// Playout conductor runner
#[derive(Parser)]
#[command(name = "playout")]
#[command(about = "Play timeline show files on broadcast devices", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Play a show
    Run {
        /// Show file (.ron or .json)
        show: PathBuf,

        /// Stop after this many seconds instead of waiting for ctrl-c
        #[arg(short, long)]
        duration: Option<u64>,

        /// Skip preparing devices before going on air
        #[arg(long)]
        no_make_ready: bool,
    },
    /// Resolve a show once and print the state of every layer
    Check {
        /// Show file (.ron or .json)
        show: PathBuf,

        /// Offset from now to print the state at, in ms
        #[arg(short, long, default_value_t = 0)]
        at: i64,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,playout_conductor=debug")))
        .with(fmt::layer())
        .init();

    tracing::info!("Starting playout v{}", env!("CARGO_PKG_VERSION"));

    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Run {
            show,
            duration,
            no_make_ready,
        } => run(show, duration.map(Duration::from_secs), !no_make_ready).await,
        Commands::Check { show, at } => check(show, at),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!("{err}");
            ExitCode::FAILURE
        }
    }
}

async fn run(path: PathBuf, duration: Option<Duration>, make_ready: bool) -> Result<()> {
    let show = ShowFile::load(&path)?;
    show.validate()?;

    let clock: Arc<dyn Clock> = Arc::new(TokioClock::new());
    let factory = Arc::new(AbstractDeviceFactory::new(Arc::clone(&clock)));
    let (conductor, mut events) =
        Conductor::with_clock(show.options.clone(), Arc::new(SimpleResolver::new()), factory, clock);

    conductor.init().await?;
    conductor.set_device_configs(show.devices);
    let connect_timeout = Duration::from_millis(show.options.timings.device_operation_timeout.max(0) as u64);
    let connected = tokio::time::timeout(connect_timeout, conductor.device_registry().wait_until_connected()).await;
    if connected.is_err() {
        tracing::warn!("not all devices connected after {} ms, continuing", connect_timeout.as_millis());
    }
    conductor.set_datastore(show.datastore)?;
    conductor.set_timeline_and_mappings(show.timeline, Some(show.mappings))?;
    tracing::info!(objects = conductor.timeline_size(), "timeline set");

    if make_ready {
        let activation_id = Uuid::new_v4().to_string();
        conductor.devices_make_ready(true, Some(activation_id)).await?;
    }

    let shutdown = async {
        match duration {
            Some(duration) => {
                tokio::time::sleep(duration).await;
                Ok(())
            }
            None => tokio::signal::ctrl_c().await,
        }
    };
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => log_event(&event),
                None => break,
            },
            signal = &mut shutdown => {
                signal.map_err(RunnerError::Signal)?;
                break;
            }
        }
    }

    tracing::info!("stopping");
    conductor.devices_stand_down(false).await?;
    conductor.terminate().await;
    Ok(())
}

/// Events not already logged by the conductor itself
fn log_event(event: &ConductorEvent) {
    match event {
        ConductorEvent::TimelineCallback(callback) => {
            let data = callback.callback_data.as_ref().map(ToString::to_string).unwrap_or_default();
            tracing::info!(
                time = callback.time,
                instance = %callback.instance_id,
                "callback {} {data}",
                callback.callback
            );
        }
        ConductorEvent::SetTimelineTriggerTime(fixups) => {
            for fixup in fixups {
                tracing::info!(id = %fixup.id, time = fixup.time, "object started now");
            }
        }
        ConductorEvent::ResolveDone {
            timeline_hash,
            duration_ms,
        } => tracing::trace!(?timeline_hash, duration_ms, "resolve done"),
        ConductorEvent::StatReport(report) => tracing::info!(?report, "stats"),
        ConductorEvent::ConnectionAdded(device_id) => tracing::info!(%device_id, "device connected"),
        ConductorEvent::ConnectionRemoved(device_id) => tracing::info!(%device_id, "device disconnected"),
        ConductorEvent::Error { .. }
        | ConductorEvent::Warning(_)
        | ConductorEvent::Info(_)
        | ConductorEvent::Debug(_) => {}
    }
}

fn check(path: PathBuf, at: i64) -> Result<()> {
    let show = ShowFile::load(&path)?;
    show.validate()?;

    let resolver = SimpleResolver::new();
    let now = TokioClock::new().now();
    let mut timeline = show.timeline.clone();
    let outcome = fix_now_objects(&resolver, &mut timeline, now, show.options.timings.now_fix_max_iterations)?;
    if !outcome.unresolved.is_empty() {
        tracing::warn!(objects = ?outcome.unresolved, "objects still starting now");
    }

    let options = ResolveOptions::at(now);
    let resolved = resolver.resolve_timeline(&timeline, &options, None)?;
    let state = resolver.resolved_state(&resolved, now + at);

    println!(
        "{} objects, {} resolved, state at +{at} ms:",
        show.size(),
        resolved.statistics.resolved_object_count
    );
    for (layer, entry) in &state.layers {
        let device = show
            .mappings
            .get(layer)
            .map(|m| m.device_id.as_str())
            .unwrap_or("-");
        println!(
            "  {layer:<20} {device:<12} {} ({}..{})",
            entry.object.id,
            entry.instance.start,
            entry.instance.end.map(|t| t.to_string()).unwrap_or_default()
        );
    }
    for event in &state.next_events {
        println!("  next: {:?} {} at {}", event.kind, event.obj_id, event.time);
    }
    Ok(())
}
