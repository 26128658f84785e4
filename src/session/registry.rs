//! Session registry
//!
//! Maps each agent to its live [`DeliverySession`] and last-access time.
//! Last access is an atomic per entry so `touch` only takes the read lock.
//! Callers never hold a registry lock across store calls: [`SessionRegistry::snapshot`]
//! hands out a copy for iteration.

use super::DeliverySession;
use crate::metrics;
use crate::protocol::Uaid;
use chrono::{DateTime, TimeZone, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Debug)]
struct RegistryEntry {
    session: Arc<DeliverySession>,
    /// Unix millis
    last_access: AtomicI64,
}

/// Point-in-time view of one registered agent
#[derive(Debug, Clone)]
pub struct AgentEntry {
    pub uaid: Uaid,
    pub session: Arc<DeliverySession>,
    pub last_access: DateTime<Utc>,
}

/// Concurrent map of agent id to delivery session
#[derive(Debug, Default)]
pub struct SessionRegistry {
    entries: RwLock<HashMap<Uaid, Arc<RegistryEntry>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<Uaid, Arc<RegistryEntry>>> {
        self.entries.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<Uaid, Arc<RegistryEntry>>> {
        self.entries.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Bind a session, returning the one it replaced
    pub fn bind(&self, uaid: Uaid, session: Arc<DeliverySession>) -> Option<Arc<DeliverySession>> {
        let entry = Arc::new(RegistryEntry {
            session,
            last_access: AtomicI64::new(now_millis()),
        });

        let (previous, count) = {
            let mut entries = self.write();
            let previous = entries.insert(uaid, entry);
            (previous, entries.len())
        };
        metrics::set_bound_sessions(count);

        tracing::debug!(uaid = %uaid, replaced = previous.is_some(), "Session bound");
        previous.map(|e| e.session.clone())
    }

    pub fn get(&self, uaid: &Uaid) -> Option<Arc<DeliverySession>> {
        self.read().get(uaid).map(|e| e.session.clone())
    }

    pub fn contains(&self, uaid: &Uaid) -> bool {
        self.read().contains_key(uaid)
    }

    /// Refresh last access. Returns false if the agent is not bound.
    pub fn touch(&self, uaid: &Uaid) -> bool {
        match self.read().get(uaid) {
            Some(entry) => {
                entry.last_access.store(now_millis(), Ordering::SeqCst);
                true
            }
            None => false,
        }
    }

    pub fn last_access(&self, uaid: &Uaid) -> Option<DateTime<Utc>> {
        self.read()
            .get(uaid)
            .map(|e| from_millis(e.last_access.load(Ordering::SeqCst)))
    }

    /// Remove whatever session is bound for `uaid`
    pub fn unbind(&self, uaid: &Uaid) -> Option<Arc<DeliverySession>> {
        let (removed, count) = {
            let mut entries = self.write();
            let removed = entries.remove(uaid);
            (removed, entries.len())
        };
        metrics::set_bound_sessions(count);
        removed.map(|e| e.session.clone())
    }

    /// Remove the binding only if `session` is still the one bound
    pub fn unbind_session(&self, uaid: &Uaid, session: &Arc<DeliverySession>) -> bool {
        let (removed, count) = {
            let mut entries = self.write();
            let matches = entries
                .get(uaid)
                .is_some_and(|e| Arc::ptr_eq(&e.session, session));
            if matches {
                entries.remove(uaid);
            }
            (matches, entries.len())
        };
        if removed {
            metrics::set_bound_sessions(count);
        }
        removed
    }

    /// Copy of every entry, for iteration without holding the lock
    pub fn snapshot(&self) -> Vec<AgentEntry> {
        self.read()
            .iter()
            .map(|(uaid, entry)| AgentEntry {
                uaid: *uaid,
                session: entry.session.clone(),
                last_access: from_millis(entry.last_access.load(Ordering::SeqCst)),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn from_millis(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .unwrap_or_else(Utc::now)
}
