//! HTTP wrapper around a single stdio MCP server.
//!
//! The wrapped server is launched lazily and kept behind one protocol session
//! ([`session::SessionManager`]). All session work runs on one background
//! execution context ([`bridge::RequestBridge`]), and [`http::router`] exposes
//! it as a small JSON API.

pub mod bridge;
pub mod config;
pub mod error;
pub mod http;
pub mod session;

pub use bridge::{RequestBridge, DEFAULT_WAIT_TIMEOUT};
pub use config::{load_config, ServerConfig, WrapperConfig};
pub use error::WrapperError;
pub use http::{router, AppState};
pub use session::{SessionManager, StdioConnector};
