//! Persistence port
//!
//! The [`DataStore`] trait is the only way the engine touches storage.
//! Implementations must make `save_channel` (create-if-absent) and
//! `update_version` (check-then-set) atomic per channel id.
//!
//! Two implementations ship with the crate:
//! - [`MemoryStore`]: process-local maps behind one mutex
//! - [`SqliteStore`]: rusqlite-backed, survives restarts

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::config::DataStoreConfig;
use crate::protocol::{Uaid, Update};
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;

/// Store error types
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("channel not found: {0}")]
    NotFound(String),

    #[error("version conflict on {channel_id}: {attempted} is not newer than {current}")]
    VersionConflict {
        channel_id: String,
        current: u64,
        attempted: u64,
    },

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt record: {0}")]
    Corrupt(String),
}

/// Result type for store operations
pub type Result<T> = std::result::Result<T, StoreError>;

/// A registered channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Channel {
    pub uaid: Uaid,
    pub channel_id: String,
    pub version: u64,
    pub endpoint_token: String,
}

impl Channel {
    /// A fresh channel at version 0
    pub fn new(uaid: Uaid, channel_id: impl Into<String>, endpoint_token: impl Into<String>) -> Self {
        Self {
            uaid,
            channel_id: channel_id.into(),
            version: 0,
            endpoint_token: endpoint_token.into(),
        }
    }
}

/// Storage backend for channels and pending (unacknowledged) updates
///
/// Pending updates are keyed by channel id: saving a newer one replaces the
/// old one, and deleting a channel deletes its pending update with it.
pub trait DataStore: Send + Sync {
    /// Insert a channel unless its id is taken. Returns false on conflict.
    fn save_channel(&self, channel: &Channel) -> Result<bool>;

    /// Fetch a channel by id
    fn get_channel(&self, channel_id: &str) -> Result<Channel>;

    /// Delete a channel. Returns false if it did not exist.
    fn remove_channel(&self, channel_id: &str) -> Result<bool>;

    /// Delete every channel and pending update owned by `uaid`
    fn remove_channels(&self, uaid: &Uaid) -> Result<()>;

    /// Delete a set of channels by id. Returns how many existed.
    fn remove_channel_ids(&self, channel_ids: &HashSet<String>) -> Result<usize>;

    /// Ids of every channel owned by `uaid`
    fn get_channel_ids(&self, uaid: &Uaid) -> Result<HashSet<String>>;

    /// Set a channel's version if `version` is strictly greater than the
    /// stored one. Returns the channel id.
    fn update_version(&self, channel_id: &str, version: u64) -> Result<String>;

    /// Record `version` as unacknowledged for the channel. An older pending
    /// update is replaced; a newer one is kept. Returns the owning agent.
    fn save_unacknowledged(&self, channel_id: &str, version: u64) -> Result<Uaid>;

    /// All pending updates for an agent
    fn get_unacknowledged(&self, uaid: &Uaid) -> Result<HashSet<Update>>;

    /// Drop pending updates whose channel id appears in `acked` (versions are
    /// ignored) and return what is still pending.
    fn remove_acknowledged(&self, uaid: &Uaid, acked: &HashSet<Update>) -> Result<HashSet<Update>>;
}

/// Open the configured backend
pub fn open(config: &DataStoreConfig) -> Result<Arc<dyn DataStore>> {
    match config {
        DataStoreConfig::InMemory => {
            tracing::info!("Using in-memory datastore");
            Ok(Arc::new(MemoryStore::new()))
        }
        DataStoreConfig::Sqlite { path } => Ok(Arc::new(SqliteStore::open(path)?)),
    }
}
