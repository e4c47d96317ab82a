//! Launch the HTTP boundary next to the mode selector.
//!
//! [`spawn_observer`] binds eagerly so a taken port fails startup instead
//! of a background task, then runs the server and the hub keepalive on one
//! task that ends when the shutdown token is cancelled.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::server::{self, ServerConfig, ServerError};
use crate::state::AppState;

/// Errors from spawning the HTTP boundary.
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    /// The server failed to bind.
    #[error("server start error: {0}")]
    Server(#[from] ServerError),
}

/// A running HTTP boundary.
#[derive(Debug)]
pub struct Observer {
    /// Address actually bound.
    pub addr: SocketAddr,
    /// Completes after shutdown once the server has drained.
    pub handle: JoinHandle<()>,
}

/// Bind and spawn the server plus the keepalive loop.
///
/// # Errors
///
/// [`StartupError::Server`] when the address is invalid or already taken.
pub async fn spawn_observer(
    config: &ServerConfig,
    state: Arc<AppState>,
    heartbeat: Duration,
) -> Result<Observer, StartupError> {
    let listener = server::bind(config).await?;
    let addr = listener
        .local_addr()
        .map_err(|e| ServerError::Bind(format!("no local address: {e}")))?;

    let feed = state.feed.clone();
    let token = state.shutdown.clone();
    let handle = tokio::spawn(async move {
        let keepalive = feed.hub().run_heartbeat(heartbeat, token);
        let serving = async {
            if let Err(e) = server::serve(listener, state).await {
                tracing::error!(error = %e, "server exited with error");
            }
        };
        tokio::join!(keepalive, serving);
    });

    tracing::info!(%addr, heartbeat_secs = heartbeat.as_secs(), "proxy listening");
    Ok(Observer { addr, handle })
}
