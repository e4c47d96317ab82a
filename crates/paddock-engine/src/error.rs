//! Error types for the proxy binary.

/// Top-level startup error propagated out of `main`.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Configuration loading or validation failed.
    #[error("config error: {source}")]
    Config {
        /// The underlying config error.
        #[from]
        source: paddock_core::config::ConfigError,
    },

    /// The shared HTTP client could not be built.
    #[error("http client error: {source}")]
    Client {
        /// The underlying reqwest error.
        #[from]
        source: reqwest::Error,
    },

    /// The HTTP boundary failed to start.
    #[error("observer error: {source}")]
    Observer {
        /// The underlying startup error.
        #[from]
        source: paddock_observer::startup::StartupError,
    },
}
