//! Configuration system
//!
//! Loads ~/.config/pushrelay/config.yaml. Keys mirror the server's tuning
//! knobs: bind address, server secret, endpoint and transport prefixes,
//! reaper timeout, ack interval and datastore backend.

mod relay_config;
pub mod validation;

pub use relay_config::{
    DataStoreConfig, RelayConfig, DEFAULT_ACK_INTERVAL_MS, DEFAULT_PASSWORD,
    DEFAULT_REAPER_TIMEOUT_MS, REAPER_DISABLED,
};
pub use validation::{validate_config, validate_config_result, ValidationError};
