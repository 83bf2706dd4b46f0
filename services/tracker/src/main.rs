//! Location tracker service binary.
//!
//! ```text
//! location-tracker [run]                 start tracking until a signal arrives
//! location-tracker boot [ACTION]         boot recovery (default BOOT_COMPLETED)
//! location-tracker stop                  clear the persisted running flag
//! location-tracker status                print persisted flags as JSON
//! location-tracker auto-start <on|off>   set the auto-start preference
//! ```
//!
//! Ctrl+C stops tracking cleanly. SIGTERM exits without touching the persisted
//! flags, so the next `boot` restores tracking.

use anyhow::{bail, Context, Result};
use location_tracker::{
    BootSignal, Config, EnrichmentPipeline, FileStateStore, GazetteerGeocoder, JsonlSink,
    LocalSessionProvider, ReplaySampleSource, RetryingSink, ServiceState, StateKey, StateStore,
    StaticDeviceStatus, Telemetry, TrackerService,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Clone, PartialEq)]
enum Mode {
    Run,
    Boot(String),
    Stop,
    Status,
    AutoStart(bool),
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Shutdown {
    Interrupt,
    Terminate,
}

fn parse_mode(args: &[String]) -> Result<Mode> {
    match args.first().map(String::as_str) {
        None | Some("run") => Ok(Mode::Run),
        Some("boot") => Ok(Mode::Boot(
            args.get(1)
                .cloned()
                .unwrap_or_else(|| "BOOT_COMPLETED".to_string()),
        )),
        Some("stop") => Ok(Mode::Stop),
        Some("status") => Ok(Mode::Status),
        Some("auto-start") => match args.get(1).map(String::as_str) {
            Some("on") => Ok(Mode::AutoStart(true)),
            Some("off") => Ok(Mode::AutoStart(false)),
            other => bail!("auto-start expects on or off, got {:?}", other),
        },
        Some(other) => bail!("unknown command: {}", other),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let mode = parse_mode(&args)?;

    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level, &config.service.log_format)?;

    info!(
        service = %config.service.name,
        version = env!("CARGO_PKG_VERSION"),
        mode = ?mode,
        "Starting location tracker"
    );

    let store: Arc<dyn StateStore> = Arc::new(
        FileStateStore::open(&config.store.path).context("Failed to open state store")?,
    );

    match mode {
        Mode::Status => {
            let status: BTreeMap<&str, bool> = [StateKey::ServiceRunning, StateKey::AutoStartEnabled]
                .into_iter()
                .map(|key| (key.as_str(), store.get(key, false)))
                .collect();
            println!("{}", serde_json::to_string_pretty(&status)?);
            return Ok(());
        }
        Mode::Stop => {
            store
                .set(StateKey::ServiceRunning, false)
                .context("Failed to clear running flag")?;
            info!("Tracking flag cleared");
            return Ok(());
        }
        Mode::AutoStart(enabled) => {
            store
                .set(StateKey::AutoStartEnabled, enabled)
                .context("Failed to store auto-start preference")?;
            info!(enabled = enabled, "Auto-start preference updated");
            return Ok(());
        }
        Mode::Run | Mode::Boot(_) => {}
    }

    // Initialize metrics
    if let Some(port) = config.service.metrics_port {
        init_metrics(port)?;
    }

    let service = build_service(&config, store)?;

    match mode {
        Mode::Boot(action) => {
            let Some(signal) = BootSignal::from_action(&action) else {
                warn!(action = %action, "Ignoring unrecognised boot action");
                return Ok(());
            };
            let state = service
                .recover(signal)
                .context("Failed to restore tracking")?;
            if state != ServiceState::Running {
                info!("Nothing to restore");
                return Ok(());
            }
        }
        _ => service.start().context("Failed to start tracking")?,
    }

    info!(filter = ?service.filter_config(), "Tracking started");

    // Wait for shutdown signal
    match shutdown_signal().await {
        Shutdown::Interrupt => {
            service.stop().context("Failed to stop tracking")?;
        }
        Shutdown::Terminate => {
            warn!("Exiting without clearing the running flag");
        }
    }

    let stats = service.stats();
    info!(
        received = stats.samples_received,
        accepted = stats.samples_accepted,
        rejected = stats.samples_rejected(),
        stored = stats.records_stored,
        failed = stats.records_failed,
        "Location tracker stopped"
    );

    Ok(())
}

/// Wire collaborators from configuration. Must run inside the runtime.
fn build_service(config: &Config, store: Arc<dyn StateStore>) -> Result<TrackerService> {
    let filter_config = config
        .filter
        .resolve()
        .context("Invalid filter configuration")?;

    let telemetry = Arc::new(Telemetry::new());
    let device = Arc::new(StaticDeviceStatus::new(config.device.clone()));
    let sink = Arc::new(RetryingSink::new(
        JsonlSink::new(&config.remote.output_path),
        config.remote.retry.clone(),
    ));

    let mut builder = EnrichmentPipeline::builder(
        Arc::new(LocalSessionProvider::new()),
        device.clone(),
        sink,
    )
    .function_name(&config.remote.function_name)
    .collection(&config.remote.collection)
    .telemetry(telemetry.clone());

    if !config.geocoder.places.is_empty() {
        builder = builder.geocoder(Arc::new(GazetteerGeocoder::new(
            config.geocoder.places.clone(),
        )));
    }
    if let Some(device_id) = &config.remote.device_id {
        builder = builder.device_id(device_id);
    }

    let source = Arc::new(ReplaySampleSource::new(
        &config.source.replay_path,
        config.source.pace(),
    ));

    Ok(TrackerService::new(
        filter_config,
        source,
        builder.spawn(),
        store,
        device,
        telemetry,
    ))
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str, log_format: &str) -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(log_level))?;

    let subscriber = tracing_subscriber::registry().with(env_filter);

    if log_format == "pretty" {
        subscriber.with(fmt::layer().pretty()).init();
    } else {
        subscriber.with(fmt::layer().json()).init();
    }

    Ok(())
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();

    builder
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() -> Shutdown {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
            Shutdown::Interrupt
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
            Shutdown::Terminate
        }
    }
}
