//! HTTP boundary for the Paddock timing proxy.
//!
//! Serves the live state to dashboards:
//!
//! - **`GET /api/sse`** streams an `initial` snapshot followed by `update`
//!   partials and keepalive comments.
//! - **`GET /api/state`** and **`GET /api/state/{domain}`** return the
//!   document or one domain.
//! - **`GET /health`** reports the active mode, connected clients and
//!   which sources are still usable.
//!
//! Handlers only read from the [`LiveFeed`] and the selector's watch
//! channel; they never block a source.
//!
//! [`LiveFeed`]: paddock_core::LiveFeed

pub mod error;
pub mod handlers;
pub mod router;
pub mod server;
pub mod sse;
pub mod startup;
pub mod state;

pub use router::build_router;
pub use server::{ServerConfig, ServerError, start_server};
pub use startup::{Observer, spawn_observer};
pub use state::{AppState, SourceAvailability};
