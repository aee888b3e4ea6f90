//! SmartBus tracking agent - on-board location reporting for bus fleets
//!
//! Samples the bus position from a local GPS receiver and delivers every
//! sample to the fleet backend (REST) and to live viewers (MQTT push).
//!
//! Module structure:
//! - `domain/` - Core types (fixes, samples, identities, wire payloads)
//! - `io/` - External interfaces (backend, MQTT, gpsd, NMEA, status HTTP)
//! - `services/` - Business logic (sampler, tracking session supervisor)
//! - `infra/` - Infrastructure (Config, Metrics)

use clap::{Parser, Subcommand, ValueEnum};
use smartbus_agent::domain::TrackingIdentity;
use smartbus_agent::infra::{Config, GpsSourceKind, Metrics};
use smartbus_agent::io::{
    BackendClient, GpsdSource, LoopbackConnector, MqttConnector, NmeaSerialSource, PushConnector,
};
use smartbus_agent::services::geolocation::GeolocationSource;
use smartbus_agent::services::{
    SessionDeps, SessionEvent, SessionSettings, StopOutcome, TrackingSession,
};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

/// SmartBus tracking agent
#[derive(Parser, Debug)]
#[command(name = "smartbus-agent", version, about)]
struct Args {
    /// Path to TOML configuration file
    #[arg(short, long, env = "CONFIG_FILE", default_value = "config/dev.toml")]
    config: String,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List registered drivers
    Drivers,
    /// List buses available for assignment
    Buses,
    /// Show the backend's active session for a driver
    Session {
        driver_id: String,
    },
    /// Track a bus until SIGINT (Ctrl+C) or SIGTERM
    Track {
        #[arg(long)]
        driver: String,
        #[arg(long)]
        bus: String,
        /// Keep live pushes in-process instead of publishing to the broker
        #[arg(long)]
        dry_run: bool,
    },
}

/// Termination signals that end a tracking run with a clean session stop
struct ShutdownSignals {
    #[cfg(unix)]
    terminate: tokio::signal::unix::Signal,
}

impl ShutdownSignals {
    /// Handlers are installed here, before the session starts
    fn new() -> std::io::Result<Self> {
        Ok(Self {
            #[cfg(unix)]
            terminate: tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?,
        })
    }

    /// Wait for the next signal; returns its name
    async fn recv(&mut self) -> &'static str {
        #[cfg(unix)]
        {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => "SIGINT",
                _ = self.terminate.recv() => "SIGTERM",
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
            "SIGINT"
        }
    }
}

fn init_logging(format: LogFormat) {
    // Default: INFO, use RUST_LOG=debug for per-sample visibility
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.log_format);

    info!(git_hash = env!("GIT_HASH"), "smartbus-agent starting");

    let config = Config::load_from_path(&args.config);
    info!(
        config_file = %config.config_file(),
        agent_id = %config.agent_id(),
        backend_url = %config.backend_url(),
        live_host = %config.live_host(),
        live_port = %config.live_port(),
        gps_source = %config.gps_source().as_str(),
        interval_ms = %config.sample_interval().as_millis(),
        metrics_http_port = %config.metrics_http_port(),
        "config_loaded"
    );

    let backend = Arc::new(BackendClient::new(&config)?);

    match args.command {
        Command::Drivers => {
            for driver in backend.list_drivers().await? {
                println!("{}\t{}", driver.driver_id, driver.driver_name.unwrap_or_default());
            }
        }
        Command::Buses => {
            for bus in backend.available_buses().await? {
                let capacity = bus.capacity.map(|c| c.to_string()).unwrap_or_default();
                println!("{}\t{}\t{}", bus.bus_id, bus.bus_number.unwrap_or_default(), capacity);
            }
        }
        Command::Session { driver_id } => match backend.current_session(&driver_id).await? {
            Some(session) => println!("{}", serde_json::to_string_pretty(&session)?),
            None => println!("no active session for {}", driver_id),
        },
        Command::Track { driver, bus, dry_run } => {
            track(config, backend, TrackingIdentity::new(driver, bus), dry_run).await?;
        }
    }

    Ok(())
}

async fn track(
    config: Config,
    backend: Arc<BackendClient>,
    identity: TrackingIdentity,
    dry_run: bool,
) -> anyhow::Result<()> {
    let mut signals = ShutdownSignals::new()?;
    backend.start_tracking(&identity).await?;

    let source: Arc<dyn GeolocationSource> = match config.gps_source() {
        GpsSourceKind::Gpsd => Arc::new(GpsdSource::new(&config)),
        GpsSourceKind::Nmea => Arc::new(NmeaSerialSource::new(&config)),
    };
    let connector: Arc<dyn PushConnector> = if dry_run {
        Arc::new(LoopbackConnector::new())
    } else {
        Arc::new(MqttConnector::new(&config))
    };
    info!(endpoint = %connector.endpoint(), source = %source.name(), "live_transport_selected");

    let metrics = Arc::new(Metrics::new());
    let deps = SessionDeps { source, durable: backend, connector, metrics: metrics.clone() };
    let session = TrackingSession::start(identity, deps, SessionSettings::from_config(&config)).await;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Status/metrics HTTP server (if port > 0)
    let http_port = config.metrics_http_port();
    if http_port > 0 {
        let server_metrics = metrics.clone();
        let agent_id = config.agent_id().to_string();
        let status = session.status_watch();
        let server_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = smartbus_agent::io::status_server::start_status_server(
                http_port,
                server_metrics,
                agent_id,
                Some(status),
                server_shutdown,
            )
            .await
            {
                error!(error = %e, "status_server_error");
            }
        });
    }

    // Periodic metrics report
    let report_metrics = metrics.clone();
    let metrics_interval = config.metrics_interval_secs();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(metrics_interval));
        interval.tick().await;
        loop {
            interval.tick().await;
            report_metrics.report().log();
        }
    });

    // Sensor alerts: the sampler keeps restarting on its own; an
    // unattended agent has nobody to ask, so alerts are only logged
    let mut events = session.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(SessionEvent::SensorAlert(e)) => warn!(error = %e, "sensor_alert"),
                Ok(SessionEvent::Connectivity(state)) => {
                    info!(state = %state.as_str(), "live_connectivity")
                }
                Ok(SessionEvent::Sample(_)) => {}
                Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            }
        }
    });

    let signal = signals.recv().await;
    info!(signal = %signal, "shutdown_signal_received");

    let outcome = session.stop().await;
    let _ = shutdown_tx.send(true);
    metrics.report().log();

    match outcome {
        StopOutcome::Ended => println!("session ended"),
        StopOutcome::EndedWithWarning(reason) => {
            println!("session ended locally; backend did not confirm: {}", reason)
        }
    }

    info!("smartbus-agent shutdown complete");
    Ok(())
}
