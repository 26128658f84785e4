//! In-memory store

use super::{Channel, DataStore, Result, StoreError};
use crate::protocol::{Uaid, Update};
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Default)]
struct Tables {
    channels: HashMap<String, Channel>,
    /// channel id -> pending version
    pending: HashMap<String, u64>,
}

/// Process-local [`DataStore`]
///
/// Both tables sit behind a single mutex, which makes every operation atomic
/// with respect to every other.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl DataStore for MemoryStore {
    fn save_channel(&self, channel: &Channel) -> Result<bool> {
        let mut tables = self.tables();
        if tables.channels.contains_key(&channel.channel_id) {
            return Ok(false);
        }
        tables
            .channels
            .insert(channel.channel_id.clone(), channel.clone());
        Ok(true)
    }

    fn get_channel(&self, channel_id: &str) -> Result<Channel> {
        self.tables()
            .channels
            .get(channel_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(channel_id.to_string()))
    }

    fn remove_channel(&self, channel_id: &str) -> Result<bool> {
        let mut tables = self.tables();
        tables.pending.remove(channel_id);
        Ok(tables.channels.remove(channel_id).is_some())
    }

    fn remove_channels(&self, uaid: &Uaid) -> Result<()> {
        let mut tables = self.tables();
        let owned: Vec<String> = tables
            .channels
            .values()
            .filter(|c| c.uaid == *uaid)
            .map(|c| c.channel_id.clone())
            .collect();

        for channel_id in &owned {
            tables.channels.remove(channel_id);
            tables.pending.remove(channel_id);
        }

        tracing::debug!(uaid = %uaid, removed = owned.len(), "Removed channels for agent");
        Ok(())
    }

    fn remove_channel_ids(&self, channel_ids: &HashSet<String>) -> Result<usize> {
        let mut tables = self.tables();
        let mut removed = 0;
        for channel_id in channel_ids {
            tables.pending.remove(channel_id);
            if tables.channels.remove(channel_id).is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn get_channel_ids(&self, uaid: &Uaid) -> Result<HashSet<String>> {
        Ok(self
            .tables()
            .channels
            .values()
            .filter(|c| c.uaid == *uaid)
            .map(|c| c.channel_id.clone())
            .collect())
    }

    fn update_version(&self, channel_id: &str, version: u64) -> Result<String> {
        let mut tables = self.tables();
        let channel = tables
            .channels
            .get_mut(channel_id)
            .ok_or_else(|| StoreError::NotFound(channel_id.to_string()))?;

        if version <= channel.version {
            return Err(StoreError::VersionConflict {
                channel_id: channel_id.to_string(),
                current: channel.version,
                attempted: version,
            });
        }

        channel.version = version;
        Ok(channel.channel_id.clone())
    }

    fn save_unacknowledged(&self, channel_id: &str, version: u64) -> Result<Uaid> {
        let mut tables = self.tables();
        let uaid = tables
            .channels
            .get(channel_id)
            .map(|c| c.uaid)
            .ok_or_else(|| StoreError::NotFound(channel_id.to_string()))?;
        let pending = tables.pending.entry(channel_id.to_string()).or_insert(version);
        *pending = (*pending).max(version);
        Ok(uaid)
    }

    fn get_unacknowledged(&self, uaid: &Uaid) -> Result<HashSet<Update>> {
        let tables = self.tables();
        Ok(pending_for(&tables, uaid))
    }

    fn remove_acknowledged(&self, uaid: &Uaid, acked: &HashSet<Update>) -> Result<HashSet<Update>> {
        let mut tables = self.tables();
        for update in acked {
            let owned = tables
                .channels
                .get(&update.channel_id)
                .is_some_and(|c| c.uaid == *uaid);
            if owned {
                tables.pending.remove(&update.channel_id);
            }
        }
        Ok(pending_for(&tables, uaid))
    }
}

fn pending_for(tables: &Tables, uaid: &Uaid) -> HashSet<Update> {
    tables
        .pending
        .iter()
        .filter(|(channel_id, _)| {
            tables
                .channels
                .get(channel_id.as_str())
                .is_some_and(|c| c.uaid == *uaid)
        })
        .map(|(channel_id, version)| Update::new(channel_id.clone(), *version))
        .collect()
}
