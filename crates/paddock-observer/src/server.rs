//! HTTP server lifecycle.
//!
//! [`start_server`] binds, then serves until the state's shutdown token is
//! cancelled. Open event streams end on the same token, so graceful
//! shutdown does not wait on them.

use std::net::SocketAddr;
use std::sync::Arc;

use paddock_core::config::ServerSection;
use tokio::net::TcpListener;
use tracing::info;

use crate::router::build_router;
use crate::state::AppState;

/// Listener address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Host to bind (e.g. `0.0.0.0`).
    pub host: String,
    /// TCP port. `0` picks an ephemeral port.
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: String::from("0.0.0.0"),
            port: 4000,
        }
    }
}

impl ServerConfig {
    /// Take host and port from the `server` configuration section.
    pub fn from_section(section: &ServerSection) -> Self {
        Self {
            host: section.host.clone(),
            port: section.port,
        }
    }

    /// Parse the configured address.
    ///
    /// # Errors
    ///
    /// [`ServerError::Bind`] when host and port do not form a socket address.
    pub fn addr(&self) -> Result<SocketAddr, ServerError> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|e| ServerError::Bind(format!("invalid address: {e}")))
    }
}

/// Bind the listener without serving yet.
///
/// # Errors
///
/// [`ServerError::Bind`] on an invalid address or a failed bind.
pub async fn bind(config: &ServerConfig) -> Result<TcpListener, ServerError> {
    let addr = config.addr()?;
    TcpListener::bind(addr)
        .await
        .map_err(|e| ServerError::Bind(format!("bind failed on {addr}: {e}")))
}

/// Serve on an already bound listener until shutdown.
///
/// # Errors
///
/// [`ServerError::Serve`] on a fatal I/O error.
pub async fn serve(listener: TcpListener, state: Arc<AppState>) -> Result<(), ServerError> {
    let shutdown = state.shutdown.clone();
    let router = build_router(state);
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| ServerError::Serve(format!("serve error: {e}")))
}

/// Bind and serve until the shutdown token is cancelled.
///
/// # Errors
///
/// Returns an error if the listener cannot bind or serving fails.
pub async fn start_server(config: &ServerConfig, state: Arc<AppState>) -> Result<(), ServerError> {
    let listener = bind(config).await?;
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "proxy listening");
    }
    serve(listener, state).await
}

/// Errors from starting or running the server.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Failed to bind the address.
    #[error("bind error: {0}")]
    Bind(String),

    /// Fatal error while serving.
    #[error("serve error: {0}")]
    Serve(String),
}
