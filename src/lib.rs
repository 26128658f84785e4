//! pushrelay - SimplePush notification relay
//!
//! User agents connect over a WebSocket (or XHR polling), say `hello` and
//! register channels. Application servers then PUT `version=<n>` to a
//! channel's push endpoint and the relay forwards a `notification` to the
//! agent, resending it until the agent acknowledges it. Agents that stay idle
//! past the reaper timeout lose their registrations.
//!
//! # Architecture
//!
//! - **protocol**: Wire messages, endpoint tokens, version parsing
//! - **store**: Persistence port (in-memory, SQLite)
//! - **session**: Delivery sessions and the session registry
//! - **relay**: Protocol engine, frame dispatch, retry scheduler, idle reaper
//! - **server**: axum HTTP/WebSocket front end
//! - **config**: YAML configuration and validation
//! - **metrics**: Prometheus counters

pub mod config;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod protocol;
pub mod relay;
pub mod server;
pub mod session;
pub mod store;

// Re-exports
pub use error::{RelayError, Result};
