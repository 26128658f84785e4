//! Protocol engine
//!
//! The request handlers behind every transport. Each handler runs against
//! the [`DataStore`] only; sessions and retry jobs are the relay's concern.

use crate::protocol::{
    extract_version, EndpointTokenCodec, Reply, Status, Uaid, Update, VersionError,
};
use crate::store::{Channel, DataStore, StoreError};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Why a notification was not accepted
#[derive(Debug, Error)]
pub enum NotificationError {
    #[error("invalid version: {0}")]
    InvalidVersion(#[from] VersionError),

    #[error("channel not found: {0}")]
    ChannelNotFound(String),

    #[error("version conflict on {channel_id}: {attempted} is not newer than {current}")]
    VersionConflict {
        channel_id: String,
        current: u64,
        attempted: u64,
    },

    #[error("store error: {0}")]
    Store(StoreError),
}

impl NotificationError {
    /// Metric label
    pub fn outcome(&self) -> &'static str {
        match self {
            NotificationError::InvalidVersion(_) => "invalid_version",
            NotificationError::ChannelNotFound(_) => "channel_not_found",
            NotificationError::VersionConflict { .. } => "version_conflict",
            NotificationError::Store(_) => "store_error",
        }
    }
}

impl From<StoreError> for NotificationError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => NotificationError::ChannelNotFound(id),
            StoreError::VersionConflict {
                channel_id,
                current,
                attempted,
            } => NotificationError::VersionConflict {
                channel_id,
                current,
                attempted,
            },
            other => NotificationError::Store(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelloResponse {
    pub uaid: Uaid,
}

impl From<HelloResponse> for Reply {
    fn from(resp: HelloResponse) -> Self {
        Reply::Hello { uaid: resp.uaid }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterResponse {
    pub channel_id: String,
    pub status: Status,
    /// Empty when registration failed
    pub push_endpoint: String,
}

impl From<RegisterResponse> for Reply {
    fn from(resp: RegisterResponse) -> Self {
        Reply::Register {
            channel_id: resp.channel_id,
            status: resp.status,
            push_endpoint: resp.push_endpoint,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnregisterResponse {
    pub channel_id: String,
    pub status: Status,
}

impl From<UnregisterResponse> for Reply {
    fn from(resp: UnregisterResponse) -> Self {
        Reply::Unregister {
            channel_id: resp.channel_id,
            status: resp.status,
        }
    }
}

/// An accepted notification, now pending for its agent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub uaid: Uaid,
    pub update: Update,
}

impl Notification {
    pub fn into_reply(self) -> Reply {
        Reply::Notification {
            updates: [self.update].into_iter().collect(),
        }
    }
}

/// Stateless request handlers over a [`DataStore`]
pub struct PushEngine {
    store: Arc<dyn DataStore>,
    tokens: EndpointTokenCodec,
    endpoint_url: String,
}

impl fmt::Debug for PushEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PushEngine")
            .field("endpoint_url", &self.endpoint_url)
            .finish_non_exhaustive()
    }
}

impl PushEngine {
    /// `endpoint_url` is the full prefix push endpoints are built on,
    /// e.g. `https://push.example.com/update`
    pub fn new(
        store: Arc<dyn DataStore>,
        tokens: EndpointTokenCodec,
        endpoint_url: impl Into<String>,
    ) -> Self {
        Self {
            store,
            tokens,
            endpoint_url: endpoint_url.into(),
        }
    }

    /// Push endpoint URL for a token
    pub fn endpoint_for(&self, token: &str) -> String {
        format!("{}/{}", self.endpoint_url.trim_end_matches('/'), token)
    }

    /// Establish (or re-establish) an agent and make `channel_ids` its
    /// entire channel set
    pub fn handle_handshake(
        &self,
        supplied_uaid: Option<&str>,
        channel_ids: &HashSet<String>,
    ) -> crate::Result<HelloResponse> {
        let uaid = match supplied_uaid.and_then(Uaid::parse) {
            Some(uaid) => uaid,
            None => {
                let uaid = Uaid::new();
                tracing::debug!(uaid = %uaid, supplied = ?supplied_uaid, "Assigned new agent id");
                uaid
            }
        };

        let owned = self.store.get_channel_ids(&uaid)?;

        let stale: HashSet<String> = owned.difference(channel_ids).cloned().collect();
        if !stale.is_empty() {
            let removed = self.store.remove_channel_ids(&stale)?;
            tracing::debug!(uaid = %uaid, removed, "Dropped channels missing from handshake");
        }

        for channel_id in channel_ids.difference(&owned) {
            let token = self.tokens.encode(&uaid, channel_id)?;
            if !self
                .store
                .save_channel(&Channel::new(uaid, channel_id.clone(), token))?
            {
                tracing::warn!(
                    uaid = %uaid,
                    channel_id = %channel_id,
                    "Channel already owned by another agent, skipping"
                );
            }
        }

        tracing::info!(uaid = %uaid, channels = channel_ids.len(), "Handshake complete");
        Ok(HelloResponse { uaid })
    }

    pub fn handle_register(&self, channel_id: &str, uaid: &Uaid) -> RegisterResponse {
        let failed = || RegisterResponse {
            channel_id: channel_id.to_string(),
            status: Status::ServerError,
            push_endpoint: String::new(),
        };

        let token = match self.tokens.encode(uaid, channel_id) {
            Ok(token) => token,
            Err(e) => {
                tracing::error!(uaid = %uaid, channel_id, error = %e, "Token encoding failed");
                return failed();
            }
        };

        match self
            .store
            .save_channel(&Channel::new(*uaid, channel_id, token.clone()))
        {
            Ok(true) => {
                tracing::debug!(uaid = %uaid, channel_id, "Channel registered");
                RegisterResponse {
                    channel_id: channel_id.to_string(),
                    status: Status::Ok,
                    push_endpoint: self.endpoint_for(&token),
                }
            }
            Ok(false) => match self.store.get_channel(channel_id) {
                Ok(existing) => {
                    tracing::debug!(uaid = %uaid, channel_id, "Channel already registered");
                    RegisterResponse {
                        channel_id: channel_id.to_string(),
                        status: Status::Conflict,
                        push_endpoint: self.endpoint_for(&existing.endpoint_token),
                    }
                }
                Err(e) => {
                    tracing::error!(uaid = %uaid, channel_id, error = %e, "Lookup after conflict failed");
                    failed()
                }
            },
            Err(e) => {
                tracing::error!(uaid = %uaid, channel_id, error = %e, "Channel registration failed");
                failed()
            }
        }
    }

    pub fn handle_unregister(&self, channel_id: &str, uaid: &Uaid) -> UnregisterResponse {
        let status = match self.remove_owned(channel_id, uaid) {
            Ok(()) => Status::Ok,
            Err(e) => {
                tracing::error!(uaid = %uaid, channel_id, error = %e, "Unregister failed");
                Status::ServerError
            }
        };
        UnregisterResponse {
            channel_id: channel_id.to_string(),
            status,
        }
    }

    fn remove_owned(&self, channel_id: &str, uaid: &Uaid) -> Result<(), StoreError> {
        match self.store.get_channel(channel_id) {
            Ok(channel) if channel.uaid == *uaid => {
                self.store.remove_channel(channel_id)?;
                tracing::debug!(uaid = %uaid, channel_id, "Channel unregistered");
                Ok(())
            }
            Ok(_) => {
                tracing::debug!(uaid = %uaid, channel_id, "Ignoring unregister of foreign channel");
                Ok(())
            }
            Err(StoreError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Accept a `version=<n>` update posted to an endpoint token
    pub fn handle_notification(
        &self,
        endpoint_token: &str,
        body: &str,
    ) -> Result<Notification, NotificationError> {
        let version = extract_version(body)?;

        let (uaid, channel_id) = self.tokens.decode(endpoint_token).map_err(|e| {
            tracing::debug!(error = %e, "Rejected endpoint token");
            NotificationError::ChannelNotFound(endpoint_token.to_string())
        })?;

        let channel = self.store.get_channel(&channel_id)?;
        if channel.uaid != uaid {
            return Err(NotificationError::ChannelNotFound(channel_id));
        }

        let channel_id = self.store.update_version(&channel_id, version)?;
        self.store.save_unacknowledged(&channel_id, version)?;

        tracing::debug!(uaid = %uaid, channel_id = %channel_id, version, "Notification accepted");
        Ok(Notification {
            uaid,
            update: Update::new(channel_id, version),
        })
    }

    /// Drop acknowledged updates and return what is still pending
    pub fn handle_acknowledgement(
        &self,
        uaid: &Uaid,
        acked: &HashSet<Update>,
    ) -> crate::Result<HashSet<Update>> {
        let remaining = self.store.remove_acknowledged(uaid, acked)?;
        tracing::debug!(
            uaid = %uaid,
            acked = acked.len(),
            remaining = remaining.len(),
            "Acknowledgement processed"
        );
        Ok(remaining)
    }

    pub fn unacknowledged(&self, uaid: &Uaid) -> crate::Result<HashSet<Update>> {
        Ok(self.store.get_unacknowledged(uaid)?)
    }

    /// Delete every channel and pending update of an agent
    pub fn remove_agent(&self, uaid: &Uaid) -> crate::Result<()> {
        self.store.remove_channels(uaid)?;
        Ok(())
    }

    pub fn channel_ids(&self, uaid: &Uaid) -> crate::Result<HashSet<String>> {
        Ok(self.store.get_channel_ids(uaid)?)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::store::MemoryStore;

    pub const SECRET: &str = "test-secret";
    pub const ENDPOINT_URL: &str = "http://push.test/update";

    pub fn engine() -> PushEngine {
        engine_with(Arc::new(MemoryStore::new()))
    }

    pub fn engine_with(store: Arc<dyn DataStore>) -> PushEngine {
        PushEngine::new(store, EndpointTokenCodec::new(SECRET), ENDPOINT_URL)
    }

    pub fn ids(ids: &[&str]) -> HashSet<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    /// Token at the end of a push endpoint URL
    pub fn token_of(push_endpoint: &str) -> &str {
        push_endpoint.rsplit('/').next().unwrap_or_default()
    }

    /// Store whose every call fails
    pub struct BrokenStore;

    fn broken<T>() -> crate::store::Result<T> {
        Err(StoreError::Corrupt("disk on fire".to_string()))
    }

    impl DataStore for BrokenStore {
        fn save_channel(&self, _: &Channel) -> crate::store::Result<bool> {
            broken()
        }
        fn get_channel(&self, _: &str) -> crate::store::Result<Channel> {
            broken()
        }
        fn remove_channel(&self, _: &str) -> crate::store::Result<bool> {
            broken()
        }
        fn remove_channels(&self, _: &Uaid) -> crate::store::Result<()> {
            broken()
        }
        fn remove_channel_ids(&self, _: &HashSet<String>) -> crate::store::Result<usize> {
            broken()
        }
        fn get_channel_ids(&self, _: &Uaid) -> crate::store::Result<HashSet<String>> {
            broken()
        }
        fn update_version(&self, _: &str, _: u64) -> crate::store::Result<String> {
            broken()
        }
        fn save_unacknowledged(&self, _: &str, _: u64) -> crate::store::Result<Uaid> {
            broken()
        }
        fn get_unacknowledged(&self, _: &Uaid) -> crate::store::Result<HashSet<Update>> {
            broken()
        }
        fn remove_acknowledged(
            &self,
            _: &Uaid,
            _: &HashSet<Update>,
        ) -> crate::store::Result<HashSet<Update>> {
            broken()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::store::MemoryStore;
    use proptest::prelude::*;

    #[test]
    fn test_handshake_without_uaid_assigns_one() {
        let engine = engine();
        let a = engine.handle_handshake(None, &ids(&[])).unwrap();
        let b = engine.handle_handshake(Some("not-a-uuid"), &ids(&[])).unwrap();
        let c = engine.handle_handshake(Some(""), &ids(&[])).unwrap();
        assert_ne!(a.uaid, b.uaid);
        assert_ne!(b.uaid, c.uaid);
    }

    #[test]
    fn test_handshake_keeps_supplied_uaid() {
        let engine = engine();
        let uaid = Uaid::new();
        let resp = engine
            .handle_handshake(Some(&uaid.to_string()), &ids(&["c1"]))
            .unwrap();
        assert_eq!(resp.uaid, uaid);
        assert_eq!(engine.channel_ids(&uaid).unwrap(), ids(&["c1"]));
    }

    #[test]
    fn test_handshake_replaces_channel_set() {
        let engine = engine();
        let uaid = engine.handle_handshake(None, &ids(&["a", "b"])).unwrap().uaid;
        let reg = engine.handle_register("b2", &uaid);
        engine
            .handle_notification(token_of(&reg.push_endpoint), "version=1")
            .unwrap();

        let again = engine
            .handle_handshake(Some(&uaid.to_string()), &ids(&["a", "c"]))
            .unwrap();
        assert_eq!(again.uaid, uaid);
        assert_eq!(engine.channel_ids(&uaid).unwrap(), ids(&["a", "c"]));
        // pending update of the dropped channel went with it
        assert!(engine.unacknowledged(&uaid).unwrap().is_empty());
    }

    #[test]
    fn test_handshake_with_empty_set_clears_channels() {
        let engine = engine();
        let uaid = engine.handle_handshake(None, &ids(&["a"])).unwrap().uaid;
        engine
            .handle_handshake(Some(&uaid.to_string()), &ids(&[]))
            .unwrap();
        assert!(engine.channel_ids(&uaid).unwrap().is_empty());
    }

    #[test]
    fn test_handshake_skips_foreign_channel() {
        let engine = engine();
        let owner = engine.handle_handshake(None, &ids(&["shared"])).unwrap().uaid;
        let other = engine
            .handle_handshake(None, &ids(&["shared", "mine"]))
            .unwrap()
            .uaid;

        assert_eq!(engine.channel_ids(&owner).unwrap(), ids(&["shared"]));
        assert_eq!(engine.channel_ids(&other).unwrap(), ids(&["mine"]));
    }

    #[test]
    fn test_handshake_store_failure_propagates() {
        let engine = engine_with(Arc::new(BrokenStore));
        let err = engine.handle_handshake(None, &ids(&["a"])).unwrap_err();
        assert!(err.is_persistence());
    }

    #[test]
    fn test_register_and_conflict() {
        let engine = engine();
        let uaid = Uaid::new();

        let first = engine.handle_register("c1", &uaid);
        assert_eq!(first.status, Status::Ok);
        assert!(first.push_endpoint.starts_with("http://push.test/update/"));

        let again = engine.handle_register("c1", &Uaid::new());
        assert_eq!(again.status, Status::Conflict);
        assert_eq!(again.push_endpoint, first.push_endpoint);
    }

    #[test]
    fn test_register_store_failure_is_500() {
        let engine = engine_with(Arc::new(BrokenStore));
        let resp = engine.handle_register("c1", &Uaid::new());
        assert_eq!(resp.status, Status::ServerError);
        assert!(resp.push_endpoint.is_empty());
    }

    #[test]
    fn test_unregister_only_removes_owned() {
        let engine = engine();
        let owner = Uaid::new();
        engine.handle_register("c1", &owner);

        let foreign = engine.handle_unregister("c1", &Uaid::new());
        assert_eq!(foreign.status, Status::Ok);
        assert_eq!(engine.channel_ids(&owner).unwrap(), ids(&["c1"]));

        assert_eq!(engine.handle_unregister("c1", &owner).status, Status::Ok);
        assert!(engine.channel_ids(&owner).unwrap().is_empty());

        assert_eq!(engine.handle_unregister("nope", &owner).status, Status::Ok);
    }

    #[test]
    fn test_unregister_store_failure_is_500() {
        let engine = engine_with(Arc::new(BrokenStore));
        let resp = engine.handle_unregister("c1", &Uaid::new());
        assert_eq!(resp.status, Status::ServerError);
    }

    #[test]
    fn test_notification_accepted_and_pending() {
        let engine = engine();
        let uaid = Uaid::new();
        let reg = engine.handle_register("c1", &uaid);
        let token = token_of(&reg.push_endpoint);

        let n = engine.handle_notification(token, "version=3").unwrap();
        assert_eq!(n.uaid, uaid);
        assert_eq!(n.update, Update::new("c1", 3));

        engine.handle_notification(token, " version = 9 ").unwrap();
        let pending = engine.unacknowledged(&uaid).unwrap();
        assert_eq!(pending, [Update::new("c1", 9)].into_iter().collect());
    }

    /// Memory store whose pending write for one version stalls
    struct StallingStore {
        inner: MemoryStore,
        stalled_version: u64,
        stall: std::time::Duration,
    }

    impl DataStore for StallingStore {
        fn save_channel(&self, channel: &Channel) -> crate::store::Result<bool> {
            self.inner.save_channel(channel)
        }
        fn get_channel(&self, channel_id: &str) -> crate::store::Result<Channel> {
            self.inner.get_channel(channel_id)
        }
        fn remove_channel(&self, channel_id: &str) -> crate::store::Result<bool> {
            self.inner.remove_channel(channel_id)
        }
        fn remove_channels(&self, uaid: &Uaid) -> crate::store::Result<()> {
            self.inner.remove_channels(uaid)
        }
        fn remove_channel_ids(&self, ids: &HashSet<String>) -> crate::store::Result<usize> {
            self.inner.remove_channel_ids(ids)
        }
        fn get_channel_ids(&self, uaid: &Uaid) -> crate::store::Result<HashSet<String>> {
            self.inner.get_channel_ids(uaid)
        }
        fn update_version(&self, channel_id: &str, version: u64) -> crate::store::Result<String> {
            self.inner.update_version(channel_id, version)
        }
        fn save_unacknowledged(&self, channel_id: &str, version: u64) -> crate::store::Result<Uaid> {
            if version == self.stalled_version {
                std::thread::sleep(self.stall);
            }
            self.inner.save_unacknowledged(channel_id, version)
        }
        fn get_unacknowledged(&self, uaid: &Uaid) -> crate::store::Result<HashSet<Update>> {
            self.inner.get_unacknowledged(uaid)
        }
        fn remove_acknowledged(
            &self,
            uaid: &Uaid,
            acked: &HashSet<Update>,
        ) -> crate::store::Result<HashSet<Update>> {
            self.inner.remove_acknowledged(uaid, acked)
        }
    }

    #[test]
    fn test_concurrent_notifications_leave_newest_pending() {
        let engine = engine_with(Arc::new(StallingStore {
            inner: MemoryStore::new(),
            stalled_version: 5,
            stall: std::time::Duration::from_millis(300),
        }));
        let uaid = Uaid::new();
        let reg = engine.handle_register("c1", &uaid);
        let token = token_of(&reg.push_endpoint);

        std::thread::scope(|scope| {
            let older = scope.spawn(|| engine.handle_notification(token, "version=5"));
            std::thread::sleep(std::time::Duration::from_millis(50));
            engine.handle_notification(token, "version=6").unwrap();
            older.join().unwrap().unwrap();
        });

        assert_eq!(engine.store.get_channel("c1").unwrap().version, 6);
        assert_eq!(
            engine.unacknowledged(&uaid).unwrap(),
            [Update::new("c1", 6)].into_iter().collect()
        );
    }

    #[test]
    fn test_concurrent_notifications_on_one_channel() {
        let engine = engine();
        let uaid = Uaid::new();
        let reg = engine.handle_register("c1", &uaid);
        let token = token_of(&reg.push_endpoint);

        std::thread::scope(|scope| {
            for v in 1..=40u64 {
                let engine = &engine;
                scope.spawn(move || {
                    let _ = engine.handle_notification(token, &format!("version={}", v));
                });
            }
        });

        assert_eq!(
            engine.unacknowledged(&uaid).unwrap(),
            [Update::new("c1", 40)].into_iter().collect()
        );
    }

    #[test]
    fn test_notification_rejections() {
        let engine = engine();
        let uaid = Uaid::new();
        let reg = engine.handle_register("c1", &uaid);
        let token = token_of(&reg.push_endpoint);

        assert!(matches!(
            engine.handle_notification(token, "nope"),
            Err(NotificationError::InvalidVersion(VersionError::Missing))
        ));
        assert!(matches!(
            engine.handle_notification("garbage", "version=1"),
            Err(NotificationError::ChannelNotFound(_))
        ));

        engine.handle_notification(token, "version=5").unwrap();
        match engine.handle_notification(token, "version=5") {
            Err(NotificationError::VersionConflict {
                current, attempted, ..
            }) => {
                assert_eq!(current, 5);
                assert_eq!(attempted, 5);
            }
            other => panic!("expected conflict, got {:?}", other),
        }
    }

    #[test]
    fn test_notification_after_unregister_is_not_found() {
        let engine = engine();
        let uaid = Uaid::new();
        let reg = engine.handle_register("c1", &uaid);
        engine.handle_unregister("c1", &uaid);

        let err = engine
            .handle_notification(token_of(&reg.push_endpoint), "version=1")
            .unwrap_err();
        assert_eq!(err.outcome(), "channel_not_found");
    }

    #[test]
    fn test_stale_token_for_reused_channel_id_is_not_found() {
        let engine = engine();
        let first = Uaid::new();
        let old = engine.handle_register("c1", &first);
        engine.handle_unregister("c1", &first);
        engine.handle_register("c1", &Uaid::new());

        assert!(matches!(
            engine.handle_notification(token_of(&old.push_endpoint), "version=1"),
            Err(NotificationError::ChannelNotFound(_))
        ));
    }

    #[test]
    fn test_acknowledgement() {
        let engine = engine();
        let uaid = Uaid::new();
        let t1 = engine.handle_register("c1", &uaid).push_endpoint;
        let t2 = engine.handle_register("c2", &uaid).push_endpoint;
        engine.handle_notification(token_of(&t1), "version=1").unwrap();
        engine.handle_notification(token_of(&t2), "version=2").unwrap();

        let acked: HashSet<Update> = [Update::new("c1", 0)].into_iter().collect();
        let remaining = engine.handle_acknowledgement(&uaid, &acked).unwrap();
        assert_eq!(remaining, [Update::new("c2", 2)].into_iter().collect());
    }

    #[test]
    fn test_remove_agent() {
        let engine = engine();
        let uaid = engine.handle_handshake(None, &ids(&["a", "b"])).unwrap().uaid;
        engine.remove_agent(&uaid).unwrap();
        assert!(engine.channel_ids(&uaid).unwrap().is_empty());
    }

    #[test]
    fn test_replies() {
        let uaid = Uaid::new();
        let reply: Reply = HelloResponse { uaid }.into();
        assert_eq!(reply, Reply::Hello { uaid });

        let n = Notification {
            uaid,
            update: Update::new("c1", 4),
        };
        assert_eq!(
            n.into_reply(),
            Reply::Notification {
                updates: [Update::new("c1", 4)].into_iter().collect()
            }
        );
    }

    proptest! {
        #[test]
        fn prop_versions_only_increase(versions in proptest::collection::vec(0u64..1000, 1..40)) {
            let engine = engine();
            let uaid = Uaid::new();
            let reg = engine.handle_register("c1", &uaid);
            let token = token_of(&reg.push_endpoint).to_string();

            let mut current = 0u64;
            for v in versions {
                let result = engine.handle_notification(&token, &format!("version={}", v));
                if v > current {
                    prop_assert!(result.is_ok());
                    current = v;
                } else {
                    let is_conflict = matches!(result, Err(NotificationError::VersionConflict { .. }));
                    prop_assert!(is_conflict);
                }
            }

            let pending = engine.unacknowledged(&uaid).unwrap();
            if current > 0 {
                prop_assert_eq!(pending, [Update::new("c1", current)].into_iter().collect());
            } else {
                prop_assert!(pending.is_empty());
            }
        }
    }
}
