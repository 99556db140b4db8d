//! pulsefeed-api: Live activity push API
//!
//! Polls the configured backend data sources, enriches their activity into
//! anonymized geo-annotated events and pushes them to dashboard clients over
//! websockets.

mod supervisor;

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pulsefeed_config::Environment;
use pulsefeed_refdata::{Alerter, LogAlerter};

use crate::supervisor::Supervisor;

#[derive(Parser, Debug)]
#[command(name = "pulsefeed-api")]
#[command(about = "Live activity push API for dashboard clients")]
struct Args {
    /// Path to environment configuration file
    #[arg(short, long)]
    env: PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    info!("Launching application ...");
    let (environment, clamped) = Environment::load(&args.env)?.validated();
    for field in &clamped {
        warn!(field = %field, "Configuration value out of range, clamped");
    }
    info!(
        services = environment.services.len(),
        "Loaded environment configuration"
    );

    // mail delivery is handled by an external relay; alerts go to the log
    // stream alongside it
    let alerter: Arc<dyn Alerter> = Arc::new(LogAlerter);

    let mut supervisor = Supervisor::start(environment, alerter).await;
    info!("Application successfully started");

    wait_for_shutdown_signal().await;
    info!("Received shutdown signal");

    supervisor.stop();
    info!("Application stopped");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            warn!(error = %e, "Could not install SIGTERM handler, falling back to Ctrl+C");
            tokio::signal::ctrl_c().await.ok();
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    tokio::signal::ctrl_c().await.ok();
}
