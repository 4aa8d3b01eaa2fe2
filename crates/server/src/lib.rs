//! OpenAI-compatible HTTP surface for higgs-core.
//!
//! The engine itself is supplied by the embedding process; this crate binds
//! it to a router, persists server configuration and sets up logging.

pub mod api;
pub mod config;
pub mod logging;

pub use api::{create_router, AppState};
pub use config::{ConfigError, ServerConfig};
