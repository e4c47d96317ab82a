//! Paddock timing proxy binary.
//!
//! Wires the state feed, the failover mode selector and the HTTP boundary
//! together and runs until `Ctrl-C`.
//!
//! # Startup Sequence
//!
//! 1. Load `.env`, then initialize structured logging
//! 2. Load `paddock.yaml` (defaults when absent) with environment overrides
//! 3. Install the TLS crypto provider and build the shared HTTP client
//! 4. Build the failover plan and the mode selector
//! 5. Spawn the HTTP boundary and the keepalive loop
//! 6. Run the selector until shutdown

mod error;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use paddock_core::LiveFeed;
use paddock_core::config::ProxyConfig;
use paddock_observer::server::ServerConfig;
use paddock_observer::state::{AppState, SourceAvailability};
use paddock_sources::{DefaultFactory, FailoverPlan, ModeSelector};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use crate::error::EngineError;

/// Configuration file read from the working directory.
const CONFIG_PATH: &str = "paddock.yaml";

/// Upper bound on establishing an upstream connection. Streamed bodies are
/// long-lived, so there is no whole-request timeout.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Application entry point.
///
/// # Errors
///
/// Returns an error if configuration is invalid or the listener cannot
/// bind. Source failures never end the process.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // A missing .env is normal.
    let dotenv = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    if let Ok(path) = dotenv {
        debug!(path = %path.display(), "loaded environment file");
    }
    info!("paddock-engine starting");

    run().await?;

    info!("paddock-engine shutdown complete");
    Ok(())
}

async fn run() -> Result<(), EngineError> {
    let config = ProxyConfig::load(Path::new(CONFIG_PATH))?;
    info!(
        host = %config.server.host,
        port = config.server.port,
        mode = %config.mode,
        relay = config.relay.url().as_deref().unwrap_or("-"),
        pubsub_credentials = config.openf1.credentials().is_some(),
        "configuration loaded"
    );

    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        debug!("TLS crypto provider already installed");
    }
    let client = reqwest::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .build()?;

    let plan = FailoverPlan::from_config(&config)?;
    info!(order = ?plan.order(), forced = ?plan.forced(), "failover plan");

    let feed = LiveFeed::new();
    let shutdown = CancellationToken::new();
    let server_config = ServerConfig::from_section(&config.server);
    let heartbeat = config.server.heartbeat();
    let sources = SourceAvailability::from_config(&config);

    let selector = ModeSelector::new(
        &plan,
        Box::new(DefaultFactory::new(config, client)),
        feed.clone(),
    );
    let state = Arc::new(AppState::new(
        feed,
        selector.subscribe(),
        sources,
        shutdown.clone(),
    ));

    let observer = paddock_observer::spawn_observer(&server_config, state, heartbeat).await?;
    info!(addr = %observer.addr, "HTTP boundary started");

    let selector_task = tokio::spawn(selector.run(shutdown.clone()));

    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for Ctrl-C; shutting down");
    }
    info!("shutdown requested");
    shutdown.cancel();

    if let Err(e) = selector_task.await {
        warn!(error = %e, "mode selector task failed");
    }
    if let Err(e) = observer.handle.await {
        warn!(error = %e, "HTTP task failed");
    }
    Ok(())
}
