//! Crossing monitor - proximity-triggered crossing status live session
//!
//! Watches the device position, keeps a cached directory of rail crossings
//! and draw-bridges, and keeps a single live session showing the ETA to the
//! nearest one while it is within the proximity gate.
//!
//! Module structure:
//! - `domain/` - Core types (CrossingRecord, Position, ProximityDecision, LiveSession)
//! - `io/` - External interfaces (crossing API, session hosts, GPS, Prometheus)
//! - `services/` - Monitoring logic (directory, evaluator, publisher, orchestrator)
//! - `infra/` - Infrastructure (Config, Metrics)

use clap::Parser;
use crossing_monitor::infra::{Config, Metrics, SessionHostKind};
use crossing_monitor::io::{
    HttpCrossingService, LogSessionHost, MqttSessionHost, NmeaSerialSource, PositionSource,
    SessionHost,
};
use crossing_monitor::services::{CrossingDirectory, LiveSessionPublisher, MonitorOrchestrator};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

/// Crossing monitor - live ETA to the nearest monitored crossing
#[derive(Parser, Debug)]
#[command(name = "crossing-monitor", version, about)]
struct Args {
    /// Path to TOML configuration file (default: $CONFIG_FILE or config/dev.toml)
    #[arg(short, long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Default: INFO, use RUST_LOG=debug for per-cycle visibility
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        git_hash = env!("GIT_HASH"),
        "crossing-monitor starting"
    );

    let args = Args::parse();
    let config_path = Config::resolve_config_path(args.config);
    let config = Config::load_from_path(&config_path);

    let host_kind = match config.session_host() {
        SessionHostKind::Log => "log",
        SessionHostKind::Mqtt => "mqtt",
    };
    info!(
        config_file = %config.config_file(),
        service_base_url = %config.service_base_url(),
        poll_interval_secs = config.poll_interval().as_secs(),
        freshness_secs = config.freshness().as_secs(),
        gate_threshold_m = config.gate_threshold_m(),
        nominal_speed_mps = config.nominal_speed_mps(),
        grace_cycles = config.grace_cycles(),
        session_host = host_kind,
        gps_device = %config.gps_device(),
        http_port = config.http_port(),
        "config_loaded"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let metrics = Arc::new(Metrics::new());

    let service = Arc::new(HttpCrossingService::new(
        config.service_base_url(),
        config.service_timeout(),
    )?);
    info!(url = %service.crossings_url(), "crossing_service_configured");

    let host: Arc<dyn SessionHost> = match config.session_host() {
        SessionHostKind::Log => Arc::new(LogSessionHost::new()),
        SessionHostKind::Mqtt => Arc::new(MqttSessionHost::new(&config)),
    };

    // GPS receiver feeds the position watch channel
    let gps = NmeaSerialSource::new(&config);
    let positions: Arc<dyn PositionSource> = gps.feed();
    let gps_shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        gps.run(gps_shutdown).await;
    });

    let directory = Arc::new(CrossingDirectory::new(service, &config, metrics.clone()));
    let publisher = Arc::new(LiveSessionPublisher::new(host, &config, metrics.clone()));
    let (orchestrator, commands) =
        MonitorOrchestrator::new(&config, positions, directory, publisher, metrics.clone());

    // Start Prometheus metrics HTTP server (if port > 0)
    let http_port = config.http_port();
    if http_port > 0 {
        let prom_metrics = metrics.clone();
        let prom_commands = commands.clone();
        let prom_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = crossing_monitor::io::prometheus::start_metrics_server(
                http_port,
                prom_metrics,
                prom_commands,
                prom_shutdown,
            )
            .await
            {
                tracing::error!(error = %e, "Prometheus metrics server error");
            }
        });
    }

    // Periodic metrics summary in the log
    let metrics_clone = metrics.clone();
    let metrics_interval = config.metrics_interval_secs();
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(std::time::Duration::from_secs(metrics_interval.max(1)));
        loop {
            interval.tick().await;
            metrics_clone.report().log();
        }
    });

    // Handle shutdown on Ctrl+C
    let shutdown_signal = shutdown_tx;
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("shutdown_signal_received");
        let _ = shutdown_signal.send(true);
    });

    // Run the monitor until shutdown; ends the live session on the way out
    orchestrator.run(shutdown_rx).await;

    info!("crossing-monitor shutdown complete");
    Ok(())
}
