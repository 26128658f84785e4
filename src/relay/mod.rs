//! Relay
//!
//! The transport-facing dispatcher. Transports hand raw text frames to
//! [`Relay::handle_frame`] together with an [`AgentContext`] describing how
//! the agent is connected; the relay decodes them, runs the engine, binds
//! delivery sessions and drives retry jobs. Application servers reach the
//! relay through [`Relay::notify`].
//!
//! Every frame but `hello` is ignored until the context has completed a
//! handshake whose agent is still registered.

pub mod engine;
pub mod reaper;
pub mod retry;

pub use engine::{
    HelloResponse, Notification, NotificationError, PushEngine, RegisterResponse,
    UnregisterResponse,
};
pub use reaper::{IdleReaper, ReaperCommand, ReaperEvent, ReaperHandle, SweepReport};
pub use retry::RetryScheduler;

use crate::config::RelayConfig;
use crate::metrics;
use crate::protocol::{EndpointTokenCodec, Reply, Request, Uaid, Update};
use crate::session::{Connection, Delivery, DeliverySession, FrameKind, SessionRegistry};
use crate::store::DataStore;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

/// How an agent's transport is attached
#[derive(Debug, Clone)]
pub enum Binding {
    /// Persistent connection; frames are written as they arrive
    Stream(Arc<dyn Connection>),
    /// Upload/poll exchanges; frames wait for the next poll
    Poll,
}

/// Per-transport state of one agent connection
#[derive(Debug, Clone)]
pub struct AgentContext {
    pub uaid: Option<Uaid>,
    pub binding: Binding,
}

impl AgentContext {
    pub fn streaming(connection: Arc<dyn Connection>) -> Self {
        Self {
            uaid: None,
            binding: Binding::Stream(connection),
        }
    }

    /// A poll context, resumed with the agent a previous upload established
    pub fn polling(uaid: Option<Uaid>) -> Self {
        Self {
            uaid,
            binding: Binding::Poll,
        }
    }
}

/// Where an accepted notification went
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyOutcome {
    /// Written to an open transport
    Delivered,
    /// Queued on the agent's session for its next poll or reconnect
    Queued,
    /// No live session; the update waits in the store
    Stored,
}

impl NotifyOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotifyOutcome::Delivered => "delivered",
            NotifyOutcome::Queued => "queued",
            NotifyOutcome::Stored => "stored",
        }
    }
}

#[derive(Debug)]
pub struct Relay {
    engine: Arc<PushEngine>,
    registry: Arc<SessionRegistry>,
    scheduler: RetryScheduler,
}

impl Relay {
    pub fn new(engine: Arc<PushEngine>, registry: Arc<SessionRegistry>, ack_interval: Duration) -> Self {
        Self {
            scheduler: RetryScheduler::new(Arc::clone(&engine), ack_interval),
            engine,
            registry,
        }
    }

    /// Build the engine and an empty registry from configuration
    pub fn from_config(config: &RelayConfig, store: Arc<dyn DataStore>) -> Self {
        let engine = PushEngine::new(
            store,
            EndpointTokenCodec::new(&config.password),
            config.notification_url(),
        );
        Self::new(
            Arc::new(engine),
            Arc::new(SessionRegistry::new()),
            config.ack_interval(),
        )
    }

    pub fn engine(&self) -> &Arc<PushEngine> {
        &self.engine
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// An idle reaper over this relay's engine and registry
    pub fn reaper(&self, timeout: Duration) -> IdleReaper {
        IdleReaper::new(Arc::clone(&self.engine), Arc::clone(&self.registry), timeout)
    }

    /// Handle one inbound protocol frame.
    ///
    /// Codec errors and persistence failures are returned; the transport
    /// decides whether to drop the frame or the connection.
    pub fn handle_frame(&self, ctx: &mut AgentContext, raw: &str) -> crate::Result<()> {
        let request = Request::decode(raw)?;
        metrics::record_frame(request.message_type().as_str());

        match request {
            Request::Hello { uaid, channel_ids } => {
                self.hello(ctx, uaid.as_deref(), &channel_ids)?;
            }
            Request::Register { channel_id } => {
                if let Some((uaid, session)) = self.bound(ctx) {
                    let reply: Reply = self.engine.handle_register(&channel_id, &uaid).into();
                    session.deliver(reply.encode());
                }
            }
            Request::Unregister { channel_id } => {
                if let Some((uaid, session)) = self.bound(ctx) {
                    let reply: Reply = self.engine.handle_unregister(&channel_id, &uaid).into();
                    session.deliver(reply.encode());
                }
            }
            Request::Ack { updates } => {
                if let Some((uaid, session)) = self.bound(ctx) {
                    self.ack(&uaid, &session, &updates)?;
                }
            }
            Request::Ping => {
                if let Some((_, session)) = self.bound(ctx) {
                    session.deliver(Reply::Ping.encode());
                }
            }
        }

        if let Some(uaid) = ctx.uaid {
            self.registry.touch(&uaid);
        }
        Ok(())
    }

    /// The context's agent and session, if its handshake still stands
    fn bound(&self, ctx: &mut AgentContext) -> Option<(Uaid, Arc<DeliverySession>)> {
        let Some(uaid) = ctx.uaid else {
            tracing::debug!("Ignoring frame before handshake");
            return None;
        };
        match self.registry.get(&uaid) {
            Some(session) => Some((uaid, session)),
            None => {
                tracing::debug!(uaid = %uaid, "Agent no longer registered, handshake required");
                ctx.uaid = None;
                None
            }
        }
    }

    fn hello(
        &self,
        ctx: &mut AgentContext,
        supplied: Option<&str>,
        channel_ids: &HashSet<String>,
    ) -> crate::Result<()> {
        let response = self.engine.handle_handshake(supplied, channel_ids)?;
        let uaid = response.uaid;

        let session = Arc::new(match &ctx.binding {
            Binding::Stream(conn) => DeliverySession::streaming(uaid, Arc::clone(conn)),
            Binding::Poll => DeliverySession::sending(uaid),
        });

        // a second hello on one connection under a different agent id
        if let Some(old) = ctx.uaid.filter(|old| *old != uaid) {
            if let Some(previous) = self.registry.get(&old) {
                if previous.shares_connection(&session) {
                    self.registry.unbind_session(&old, &previous);
                    previous.on_close();
                }
            }
        }

        let mut carried = Vec::new();
        if let Some(previous) = self.registry.bind(uaid, Arc::clone(&session)) {
            // replies the old transport never wrote; resends are rebuilt below
            carried = previous.take_queued();
            carried.retain(|frame| frame.kind == FrameKind::Message);
            if previous.shares_connection(&session) {
                previous.on_close();
            } else {
                tracing::debug!(uaid = %uaid, "Superseding existing session");
                previous.on_server_initiated_close(&self.registry);
            }
        }
        ctx.uaid = Some(uaid);

        session.deliver(Reply::from(response).encode());
        for frame in carried {
            session.deliver(frame.payload);
        }
        session.on_open();

        let pending = self.engine.unacknowledged(&uaid)?;
        if !pending.is_empty() {
            tracing::debug!(uaid = %uaid, pending = pending.len(), "Delivering pending updates");
            session.deliver(Reply::Notification { updates: pending }.encode());
            self.scheduler.start(&session, self.scheduler.interval());
        }
        Ok(())
    }

    fn ack(
        &self,
        uaid: &Uaid,
        session: &Arc<DeliverySession>,
        updates: &HashSet<Update>,
    ) -> crate::Result<()> {
        metrics::record_acks(updates.len());
        let remaining = self.engine.handle_acknowledgement(uaid, updates)?;
        if remaining.is_empty() {
            self.scheduler.cancel(session);
        } else {
            self.scheduler.start(session, self.scheduler.interval());
        }
        Ok(())
    }

    /// Accept an application server update and push it to the agent
    pub fn notify(&self, token: &str, body: &str) -> Result<NotifyOutcome, NotificationError> {
        let notification = match self.engine.handle_notification(token, body) {
            Ok(n) => n,
            Err(e) => {
                tracing::debug!(error = %e, "Notification rejected");
                metrics::record_notification(e.outcome());
                return Err(e);
            }
        };

        let uaid = notification.uaid;
        let outcome = match self.registry.get(&uaid) {
            Some(session) => {
                let delivery = session.deliver(notification.into_reply().encode());
                match delivery {
                    Delivery::Sent | Delivery::Queued => {
                        self.scheduler.start(&session, self.scheduler.interval());
                    }
                    Delivery::Dropped => {}
                }
                match delivery {
                    Delivery::Sent => NotifyOutcome::Delivered,
                    Delivery::Queued => NotifyOutcome::Queued,
                    Delivery::Dropped => NotifyOutcome::Stored,
                }
            }
            None => NotifyOutcome::Stored,
        };

        tracing::debug!(uaid = %uaid, outcome = outcome.as_str(), "Notification handled");
        metrics::record_notification(outcome.as_str());
        Ok(outcome)
    }

    /// Answer a poll exchange for `uaid` with whatever is queued.
    ///
    /// Returns false if the agent has no session that polls.
    pub fn open_poll(&self, uaid: &Uaid, connection: Arc<dyn Connection>) -> bool {
        let Some(session) = self.registry.get(uaid) else {
            return false;
        };
        if session.is_closed() || session.is_streaming() {
            return false;
        }
        session.attach_poll(connection);
        self.registry.touch(uaid);
        true
    }

    /// Mark the agent's session as in an upload exchange
    pub fn enter_sending(&self, uaid: &Uaid) {
        if let Some(session) = self.registry.get(uaid) {
            session.begin_send();
        }
    }

    /// Return frames the transport could not write to the agent's queue,
    /// oldest first. The next hello for the agent flushes them.
    pub fn requeue(&self, ctx: &AgentContext, payloads: Vec<String>) {
        if payloads.is_empty() {
            return;
        }
        if let Some(session) = ctx.uaid.and_then(|uaid| self.registry.get(&uaid)) {
            session.requeue(payloads);
        }
    }

    /// Client closed its transport
    pub fn disconnect(&self, ctx: &AgentContext) {
        let (Some(uaid), Binding::Stream(conn)) = (ctx.uaid, &ctx.binding) else {
            return;
        };
        if let Some(session) = self.registry.get(&uaid) {
            if session.is_bound_to(conn) {
                session.on_close();
            }
        }
    }
}
