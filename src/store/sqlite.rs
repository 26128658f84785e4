//! SQLite-backed store

use super::{Channel, DataStore, Result, StoreError};
use crate::protocol::{Uaid, Update};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashSet;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

/// [`DataStore`] persisted in a SQLite database
///
/// A single connection is shared behind a mutex; compound operations run in
/// a transaction on that connection.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore").finish_non_exhaustive()
    }
}

impl SqliteStore {
    /// Open or create a database file
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        tracing::info!(path = %path.display(), "Opening SQLite store");

        let conn = Connection::open(path)?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        tracing::debug!(journal_mode = %mode, "SQLite journal mode set");

        Self::with_connection(conn)
    }

    /// A private in-memory database
    pub fn in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        self.conn().execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS channels (
                channel_id TEXT PRIMARY KEY,
                uaid TEXT NOT NULL,
                version INTEGER NOT NULL DEFAULT 0,
                endpoint_token TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS pending (
                channel_id TEXT PRIMARY KEY,
                uaid TEXT NOT NULL,
                version INTEGER NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_channels_uaid ON channels(uaid);
            CREATE INDEX IF NOT EXISTS idx_pending_uaid ON pending(uaid);
            "#,
        )?;
        Ok(())
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl DataStore for SqliteStore {
    fn save_channel(&self, channel: &Channel) -> Result<bool> {
        let inserted = self.conn().execute(
            "INSERT OR IGNORE INTO channels (channel_id, uaid, version, endpoint_token, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                channel.channel_id,
                channel.uaid.to_string(),
                to_sql(channel.version)?,
                channel.endpoint_token,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(inserted == 1)
    }

    fn get_channel(&self, channel_id: &str) -> Result<Channel> {
        let row = self
            .conn()
            .query_row(
                "SELECT uaid, version, endpoint_token FROM channels WHERE channel_id = ?1",
                params![channel_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()?;

        let (uaid, version, endpoint_token) =
            row.ok_or_else(|| StoreError::NotFound(channel_id.to_string()))?;

        Ok(Channel {
            uaid: parse_uaid(&uaid)?,
            channel_id: channel_id.to_string(),
            version: from_sql(version)?,
            endpoint_token,
        })
    }

    fn remove_channel(&self, channel_id: &str) -> Result<bool> {
        let conn = self.conn();
        let tx = conn.unchecked_transaction()?;
        tx.execute("DELETE FROM pending WHERE channel_id = ?1", params![channel_id])?;
        let removed = tx.execute("DELETE FROM channels WHERE channel_id = ?1", params![channel_id])?;
        tx.commit()?;
        Ok(removed == 1)
    }

    fn remove_channels(&self, uaid: &Uaid) -> Result<()> {
        let uaid_str = uaid.to_string();
        let conn = self.conn();
        let tx = conn.unchecked_transaction()?;
        tx.execute("DELETE FROM pending WHERE uaid = ?1", params![uaid_str])?;
        let removed = tx.execute("DELETE FROM channels WHERE uaid = ?1", params![uaid_str])?;
        tx.commit()?;

        tracing::debug!(uaid = %uaid, removed, "Removed channels for agent");
        Ok(())
    }

    fn remove_channel_ids(&self, channel_ids: &HashSet<String>) -> Result<usize> {
        let conn = self.conn();
        let tx = conn.unchecked_transaction()?;
        let mut removed = 0;
        for channel_id in channel_ids {
            tx.execute("DELETE FROM pending WHERE channel_id = ?1", params![channel_id])?;
            removed += tx.execute("DELETE FROM channels WHERE channel_id = ?1", params![channel_id])?;
        }
        tx.commit()?;
        Ok(removed)
    }

    fn get_channel_ids(&self, uaid: &Uaid) -> Result<HashSet<String>> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT channel_id FROM channels WHERE uaid = ?1")?;
        let ids = stmt
            .query_map(params![uaid.to_string()], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<HashSet<_>, _>>()?;
        Ok(ids)
    }

    fn update_version(&self, channel_id: &str, version: u64) -> Result<String> {
        let conn = self.conn();
        let tx = conn.unchecked_transaction()?;

        let current: Option<i64> = tx
            .query_row(
                "SELECT version FROM channels WHERE channel_id = ?1",
                params![channel_id],
                |row| row.get(0),
            )
            .optional()?;
        let current = match current {
            Some(v) => from_sql(v)?,
            None => return Err(StoreError::NotFound(channel_id.to_string())),
        };

        if version <= current {
            return Err(StoreError::VersionConflict {
                channel_id: channel_id.to_string(),
                current,
                attempted: version,
            });
        }

        tx.execute(
            "UPDATE channels SET version = ?1 WHERE channel_id = ?2",
            params![to_sql(version)?, channel_id],
        )?;
        tx.commit()?;
        Ok(channel_id.to_string())
    }

    fn save_unacknowledged(&self, channel_id: &str, version: u64) -> Result<Uaid> {
        let conn = self.conn();
        let tx = conn.unchecked_transaction()?;

        let uaid: Option<String> = tx
            .query_row(
                "SELECT uaid FROM channels WHERE channel_id = ?1",
                params![channel_id],
                |row| row.get(0),
            )
            .optional()?;
        let uaid = uaid.ok_or_else(|| StoreError::NotFound(channel_id.to_string()))?;

        tx.execute(
            "INSERT INTO pending (channel_id, uaid, version, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(channel_id) DO UPDATE SET
                uaid = excluded.uaid,
                version = excluded.version,
                updated_at = excluded.updated_at
             WHERE excluded.version > pending.version",
            params![channel_id, uaid, to_sql(version)?, Utc::now().to_rfc3339()],
        )?;
        tx.commit()?;

        parse_uaid(&uaid)
    }

    fn get_unacknowledged(&self, uaid: &Uaid) -> Result<HashSet<Update>> {
        let conn = self.conn();
        pending_for(&conn, uaid)
    }

    fn remove_acknowledged(&self, uaid: &Uaid, acked: &HashSet<Update>) -> Result<HashSet<Update>> {
        let conn = self.conn();
        let tx = conn.unchecked_transaction()?;
        let uaid_str = uaid.to_string();
        for update in acked {
            tx.execute(
                "DELETE FROM pending WHERE uaid = ?1 AND channel_id = ?2",
                params![uaid_str, update.channel_id],
            )?;
        }
        let remaining = pending_for(&tx, uaid)?;
        tx.commit()?;
        Ok(remaining)
    }
}

fn pending_for(conn: &Connection, uaid: &Uaid) -> Result<HashSet<Update>> {
    let mut stmt = conn.prepare("SELECT channel_id, version FROM pending WHERE uaid = ?1")?;
    let rows = stmt
        .query_map(params![uaid.to_string()], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    rows.into_iter()
        .map(|(channel_id, version)| Ok(Update::new(channel_id, from_sql(version)?)))
        .collect()
}

fn parse_uaid(s: &str) -> Result<Uaid> {
    Uaid::parse(s).ok_or_else(|| StoreError::Corrupt(format!("invalid uaid '{}'", s)))
}

fn to_sql(version: u64) -> Result<i64> {
    i64::try_from(version).map_err(|_| StoreError::Corrupt(format!("version {} out of range", version)))
}

fn from_sql(version: i64) -> Result<u64> {
    u64::try_from(version).map_err(|_| StoreError::Corrupt(format!("negative version {}", version)))
}
