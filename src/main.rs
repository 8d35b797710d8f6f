//! Queue client CLI
//!
//! Drives the queue client core against an estimation service. The device
//! sensor is simulated from the `[simulation]` config section.
//!
//! Module structure:
//! - `domain/` - Core types (PositionSample, QueueSession, SpatialMarker, geo)
//! - `io/` - External interfaces (location provider, estimation client)
//! - `services/` - Business logic (LocationAcquirer, SessionManager, JoinFlow)
//! - `infra/` - Infrastructure (Config, Metrics)

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use queue_client::domain::types::{QueueOutcome, QueueType};
use queue_client::infra::{Config, Metrics};
use queue_client::io::{
    DeviceLocationProvider, EstimationClient, HttpEstimationClient, ScriptedLocationProvider,
    WatchConfig,
};
use queue_client::services::{JoinFlow, JoinStep, LocationAcquirer, MarkerCatalog, SessionManager};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

/// Queue client - join a venue queue with a validated GPS fix
#[derive(Parser, Debug)]
#[command(name = "queue-client", version, about)]
struct Args {
    /// Path to TOML configuration file
    #[arg(short, long, default_value = "config/dev.toml")]
    config: String,

    /// Override the estimation service base URL
    #[arg(long)]
    api: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show the venue's queue phase and event schedule
    Status,
    /// List check-in landmarks for a queue
    Markers {
        #[arg(short, long, default_value = "main")]
        queue: QueueType,
        /// Include parse-only markers
        #[arg(long)]
        all: bool,
    },
    /// Show the active session
    Session,
    /// Acquire a fix and join a queue
    Join {
        #[arg(short, long, default_value = "main")]
        queue: QueueType,
        /// Join without a fix when acquisition fails and policy allows it
        #[arg(long)]
        without_location: bool,
    },
    /// Confirm passing a landmark
    Checkpoint {
        /// Marker name, e.g. "Kiosk"
        marker: String,
    },
    /// Report the queue outcome
    Result { outcome: QueueOutcome },
    /// Leave the queue
    Leave,
    /// Join and keep reporting positions until Ctrl+C
    Run {
        #[arg(short, long, default_value = "main")]
        queue: QueueType,
    },
}

struct Client {
    config: Config,
    metrics: Arc<Metrics>,
    api: Arc<dyn EstimationClient>,
    provider: Arc<dyn DeviceLocationProvider>,
    sessions: SessionManager,
}

impl Client {
    fn new(config: Config) -> anyhow::Result<Self> {
        let metrics = Arc::new(Metrics::new());
        let api: Arc<dyn EstimationClient> = Arc::new(
            HttpEstimationClient::new(&config, metrics.clone())
                .context("failed to create API client")?,
        );
        let provider: Arc<dyn DeviceLocationProvider> =
            Arc::new(ScriptedLocationProvider::from_config(&config));
        let acquisition = config.acquisition();
        let watch_config = WatchConfig {
            accuracy_tier: acquisition.accuracy_tier,
            sample_interval: acquisition.sample_interval,
        };
        let sessions = SessionManager::new(
            api.clone(),
            provider.clone(),
            config.session(),
            watch_config,
            metrics.clone(),
        );
        Ok(Self { config, metrics, api, provider, sessions })
    }

    fn join_flow(&self) -> JoinFlow {
        let acquirer = Arc::new(LocationAcquirer::new(
            self.provider.clone(),
            self.config.acquisition(),
            self.metrics.clone(),
        ));
        JoinFlow::new(acquirer, self.sessions.clone(), self.config.join_policy())
    }

    fn catalog(&self) -> MarkerCatalog {
        MarkerCatalog::new(self.api.clone(), self.config.club_slug())
    }

    /// Load the server's session into the local mirror
    async fn sync(&self) -> anyhow::Result<()> {
        if self.sessions.fetch_session().await?.is_none() {
            bail!("not in a queue");
        }
        Ok(())
    }

    async fn join(&self, queue: QueueType, without_location: bool) -> anyhow::Result<()> {
        let flow = self.join_flow();
        let session = match flow.start(queue).await {
            JoinStep::Joined(session) => session,
            JoinStep::LocationRequired { error, can_join_without_location } => {
                if !(without_location && can_join_without_location) {
                    bail!("location required: {error}");
                }
                info!(error = %error, "location_unavailable_joining_anyway");
                flow.join_without_location(queue).await?
            }
            JoinStep::Failed(e) => return Err(e).context("join failed"),
        };
        print_json(&session)
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize structured logging with configurable level via RUST_LOG env var
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let mut config = Config::load_from_path(&args.config);
    if let Some(url) = &args.api {
        config = config.with_api_base_url(url);
    }
    info!(
        config_file = %config.config_file(),
        api = %config.api_base_url(),
        club = %config.club_slug(),
        geofence = %config.geofence_enabled(),
        join_policy = ?config.join_policy(),
        "config_loaded"
    );

    let client = Client::new(config)?;

    match args.command {
        Command::Status => match client.api.club_status(client.config.club_slug()).await? {
            Some(status) => print_json(&status)?,
            None => println!("no status available for {}", client.config.club_slug()),
        },
        Command::Markers { queue, all } => {
            let catalog = client.catalog();
            let markers = if all { catalog.all().await? } else { catalog.for_queue(queue).await? };
            for marker in markers {
                let wait = marker.typical_wait_minutes.map_or("-".to_string(), |w| format!("~{w} min"));
                println!("{:>3}  {:<24} {}", marker.display_order, marker.name, wait);
            }
        }
        Command::Session => match client.sessions.fetch_session().await? {
            Some(session) => print_json(&session)?,
            None => println!("not in a queue"),
        },
        Command::Join { queue, without_location } => client.join(queue, without_location).await?,
        Command::Checkpoint { marker } => {
            client.sync().await?;
            let queue = client
                .sessions
                .current()
                .map(|s| s.queue_type)
                .context("session vanished during sync")?;
            let found = client
                .catalog()
                .find(queue, &marker)
                .await?
                .with_context(|| format!("no marker '{marker}' in the {queue} queue"))?;
            match client.sessions.submit_checkpoint(found.id).await? {
                Some(ack) => print_json(&ack)?,
                None => bail!("not in a queue"),
            }
        }
        Command::Result { outcome } => {
            client.sync().await?;
            print_json(&client.sessions.submit_result(outcome).await?)?;
        }
        Command::Leave => {
            client.sessions.fetch_session().await?;
            client.sessions.leave().await?;
            println!("left the queue");
        }
        Command::Run { queue } => {
            client.join(queue, false).await?;
            run_until_interrupted(&client).await;
        }
    }

    client.sessions.shutdown();
    Ok(())
}

/// Keep the reporter alive, logging metrics until Ctrl+C or the session ends
async fn run_until_interrupted(client: &Client) {
    let mut metrics_timer =
        tokio::time::interval(Duration::from_secs(client.config.metrics_interval_secs().max(1)));
    metrics_timer.tick().await;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown_signal_received");
                break;
            }
            _ = metrics_timer.tick() => {
                client.metrics.report().log();
                if !client.sessions.is_reporting() {
                    info!("session_ended");
                    break;
                }
            }
        }
    }
}
