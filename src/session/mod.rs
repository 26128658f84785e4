//! Delivery sessions
//!
//! A [`DeliverySession`] is the live binding between an agent and whatever
//! transport can currently reach it. It owns an outbound queue so frames
//! survive between polls and across failed writes, and it holds the agent's
//! retry job so closing the session stops resends.
//!
//! # States
//!
//! - **Sending**: an upload exchange (`xhr_send`). Never carries outbound
//!   data; everything delivered is queued for the next poll.
//! - **Polling**: a one-shot poll. Opening flushes the queue as the response
//!   (or a heartbeat when empty) and ends the exchange.
//! - **Streaming**: a persistent connection (WebSocket). Opening flushes the
//!   queue; later frames are written as they arrive.
//!
//! Lock order is always `state` then `queue`. Transport writes happen while
//! `state` is held, which serializes writers on one connection.

mod registry;

pub use registry::{AgentEntry, SessionRegistry};

use crate::metrics;
use crate::protocol::Uaid;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use thiserror::Error;
use tokio::task::AbortHandle;

/// Transport write failure
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("connection closed")]
    Closed,

    #[error("write failed: {0}")]
    Write(String),
}

/// Write capability of a transport connection
///
/// `send` with an empty list is a heartbeat: the transport should answer
/// with an empty message batch.
pub trait Connection: Send + Sync + fmt::Debug {
    fn send(&self, frames: Vec<String>) -> Result<(), DeliveryError>;

    /// Write a batch flushed from a session queue.
    ///
    /// A transport that finishes the write later may keep the batch until
    /// then. Dropping a batch that was never completed returns its frames
    /// to the session.
    fn send_batch(&self, batch: Batch) -> Result<(), DeliveryError> {
        self.send(batch.payloads())?;
        batch.complete();
        Ok(())
    }

    fn is_active(&self) -> bool;

    fn close(&self);
}

/// Why a frame is queued
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// Protocol replies and fresh notifications
    Message,
    /// Pending-set resend from a retry job; a newer one replaces any queued one
    Resend,
}

/// An encoded outbound frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub payload: String,
    pub kind: FrameKind,
}

impl Frame {
    pub fn message(payload: impl Into<String>) -> Self {
        Self {
            payload: payload.into(),
            kind: FrameKind::Message,
        }
    }

    pub fn resend(payload: impl Into<String>) -> Self {
        Self {
            payload: payload.into(),
            kind: FrameKind::Resend,
        }
    }
}

type Queue = Mutex<VecDeque<Frame>>;

/// Frames drained from a session queue and handed to a transport
pub struct Batch {
    uaid: Uaid,
    frames: Vec<Frame>,
    queue: Weak<Queue>,
}

impl fmt::Debug for Batch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Batch")
            .field("uaid", &self.uaid)
            .field("frames", &self.frames.len())
            .finish()
    }
}

impl Batch {
    /// A batch with no queue behind it; nothing is returned on drop
    pub fn detached(uaid: Uaid, payloads: Vec<String>) -> Self {
        Self {
            uaid,
            frames: payloads.into_iter().map(Frame::message).collect(),
            queue: Weak::new(),
        }
    }

    pub fn payloads(&self) -> Vec<String> {
        payloads(&self.frames)
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// The transport wrote every frame
    pub fn complete(mut self) {
        self.frames.clear();
    }
}

impl Drop for Batch {
    fn drop(&mut self) {
        if self.frames.is_empty() {
            return;
        }
        if let Some(queue) = self.queue.upgrade() {
            tracing::debug!(uaid = %self.uaid, frames = self.frames.len(), "Batch not written, requeueing");
            requeue_front(&queue, std::mem::take(&mut self.frames));
        }
    }
}

/// What happened to a delivered frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    Queued,
    /// Session closed, or a resend aimed at a Sending session
    Dropped,
}

/// Handle to an agent's retry job
#[derive(Debug)]
pub struct RetryJob {
    id: u64,
    handle: AbortHandle,
}

impl RetryJob {
    pub fn new(id: u64, handle: AbortHandle) -> Self {
        Self { id, handle }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub fn abort(&self) {
        self.handle.abort();
    }
}

#[derive(Debug)]
enum SessionState {
    Sending,
    Polling {
        connection: Option<Arc<dyn Connection>>,
    },
    Streaming {
        connection: Arc<dyn Connection>,
    },
}

impl SessionState {
    fn name(&self) -> &'static str {
        match self {
            SessionState::Sending => "sending",
            SessionState::Polling { .. } => "polling",
            SessionState::Streaming { .. } => "streaming",
        }
    }

    /// The connection outbound writes should target right now
    fn sending_context(&self) -> Option<&Arc<dyn Connection>> {
        match self {
            SessionState::Sending => None,
            SessionState::Polling { connection } => {
                connection.as_ref().filter(|c| c.is_active())
            }
            SessionState::Streaming { connection } => Some(connection).filter(|c| c.is_active()),
        }
    }

    fn is_in_use(&self) -> bool {
        match self {
            SessionState::Sending => false,
            SessionState::Polling { connection } => {
                connection.as_ref().is_some_and(|c| c.is_active())
            }
            SessionState::Streaming { connection } => connection.is_active(),
        }
    }

    fn connection(&self) -> Option<&Arc<dyn Connection>> {
        match self {
            SessionState::Sending => None,
            SessionState::Polling { connection } => connection.as_ref(),
            SessionState::Streaming { connection } => Some(connection),
        }
    }
}

/// Live binding between an agent and its transport
pub struct DeliverySession {
    uaid: Uaid,
    state: Mutex<SessionState>,
    queue: Arc<Queue>,
    retry: Mutex<Option<RetryJob>>,
    closed: AtomicBool,
}

impl fmt::Debug for DeliverySession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeliverySession")
            .field("uaid", &self.uaid)
            .field("state", &self.state_name())
            .field("queued", &self.queued_len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl DeliverySession {
    fn with_state(uaid: Uaid, state: SessionState) -> Self {
        Self {
            uaid,
            state: Mutex::new(state),
            queue: Arc::new(Mutex::new(VecDeque::new())),
            retry: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    /// A session created by an upload exchange
    pub fn sending(uaid: Uaid) -> Self {
        Self::with_state(uaid, SessionState::Sending)
    }

    /// A session over a persistent connection
    pub fn streaming(uaid: Uaid, connection: Arc<dyn Connection>) -> Self {
        Self::with_state(uaid, SessionState::Streaming { connection })
    }

    pub fn uaid(&self) -> &Uaid {
        &self.uaid
    }

    pub fn state_name(&self) -> &'static str {
        lock(&self.state).name()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn is_streaming(&self) -> bool {
        matches!(*lock(&self.state), SessionState::Streaming { .. })
    }

    /// Whether a transport connection is currently open for this agent
    pub fn is_in_use(&self) -> bool {
        !self.is_closed() && lock(&self.state).is_in_use()
    }

    /// The connection outbound frames would be written to, if any
    pub fn sending_context(&self) -> Option<Arc<dyn Connection>> {
        lock(&self.state).sending_context().cloned()
    }

    /// Whether this session writes to `connection`
    pub fn is_bound_to(&self, connection: &Arc<dyn Connection>) -> bool {
        lock(&self.state)
            .connection()
            .is_some_and(|c| Arc::ptr_eq(c, connection))
    }

    /// Whether both sessions write to the same connection
    pub fn shares_connection(&self, other: &DeliverySession) -> bool {
        let theirs = lock(&other.state).connection().cloned();
        theirs.is_some_and(|c| self.is_bound_to(&c))
    }

    /// Switch to Sending for an upload exchange
    pub fn begin_send(&self) {
        let mut state = lock(&self.state);
        if matches!(*state, SessionState::Streaming { .. }) {
            return;
        }
        *state = SessionState::Sending;
    }

    /// Switch to Polling with a fresh exchange and flush
    pub fn attach_poll(&self, connection: Arc<dyn Connection>) {
        {
            let mut state = lock(&self.state);
            *state = SessionState::Polling {
                connection: Some(connection),
            };
        }
        self.on_open();
    }

    /// Flush queued frames to a newly opened exchange
    pub fn on_open(&self) {
        let mut state = lock(&self.state);
        match &mut *state {
            SessionState::Sending => {}
            SessionState::Polling { connection } => {
                let Some(conn) = connection.take() else {
                    return;
                };
                let batch = self.batch();
                let count = batch.len();
                if let Err(e) = conn.send_batch(batch) {
                    tracing::debug!(uaid = %self.uaid, error = %e, "Poll flush failed");
                }
                tracing::trace!(uaid = %self.uaid, frames = count, "Poll exchange answered");
                conn.close();
            }
            SessionState::Streaming { connection } => {
                if !connection.is_active() {
                    return;
                }
                let batch = self.batch();
                if batch.is_empty() {
                    return;
                }
                if let Err(e) = connection.send_batch(batch) {
                    tracing::debug!(uaid = %self.uaid, error = %e, "Stream flush failed");
                }
            }
        }
    }

    /// Deliver a protocol reply or notification
    pub fn deliver(&self, payload: impl Into<String>) -> Delivery {
        self.push(Frame::message(payload))
    }

    /// Deliver a retry resend. Sending sessions are never targeted.
    pub fn resend(&self, payload: impl Into<String>) -> Delivery {
        self.push(Frame::resend(payload))
    }

    fn push(&self, frame: Frame) -> Delivery {
        if self.is_closed() {
            return Delivery::Dropped;
        }

        let state = lock(&self.state);
        if frame.kind == FrameKind::Resend && matches!(*state, SessionState::Sending) {
            return Delivery::Dropped;
        }

        if let Some(conn) = state.sending_context() {
            match conn.send(vec![frame.payload.clone()]) {
                Ok(()) => return Delivery::Sent,
                Err(e) => {
                    tracing::debug!(uaid = %self.uaid, error = %e, "Write failed, queueing frame");
                    metrics::record_requeue(1);
                }
            }
        }

        let mut queue = lock(&self.queue);
        if frame.kind == FrameKind::Resend {
            queue.retain(|f| f.kind != FrameKind::Resend);
        }
        queue.push_back(frame);
        Delivery::Queued
    }

    /// Put frames the transport failed to write back at the head of the
    /// queue, oldest first
    pub fn requeue(&self, payloads: Vec<String>) {
        if self.is_closed() {
            return;
        }
        requeue_front(&self.queue, payloads.into_iter().map(Frame::message).collect());
    }

    /// Close initiated by the server (reaping, superseded session)
    ///
    /// Closes the transport, stops the retry job and removes this session
    /// from the registry if it is still the one bound.
    pub fn on_server_initiated_close(self: &Arc<Self>, registry: &SessionRegistry) {
        self.closed.store(true, Ordering::SeqCst);
        self.cancel_retry();

        let connection = lock(&self.state).connection().cloned();
        if let Some(conn) = connection {
            conn.close();
        }

        registry.unbind_session(&self.uaid, self);
        tracing::debug!(uaid = %self.uaid, "Session closed by server");
    }

    /// Close initiated by the client. Local cleanup only.
    pub fn on_close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.cancel_retry();
        tracing::debug!(uaid = %self.uaid, "Session closed by client");
    }

    /// Remove and return everything queued
    pub fn take_queued(&self) -> Vec<Frame> {
        self.drain()
    }

    pub fn queued_len(&self) -> usize {
        lock(&self.queue).len()
    }

    /// Exclusive access to the retry slot
    pub fn retry_slot(&self) -> MutexGuard<'_, Option<RetryJob>> {
        lock(&self.retry)
    }

    /// Abort the retry job, if any. Returns whether one was running.
    pub fn cancel_retry(&self) -> bool {
        match lock(&self.retry).take() {
            Some(job) => {
                job.abort();
                true
            }
            None => false,
        }
    }

    /// Clear the retry slot if it still holds job `id`
    pub fn clear_retry(&self, id: u64) {
        let mut slot = lock(&self.retry);
        if slot.as_ref().is_some_and(|job| job.id() == id) {
            *slot = None;
        }
    }

    pub fn has_retry_job(&self) -> bool {
        lock(&self.retry)
            .as_ref()
            .is_some_and(|job| !job.is_finished())
    }

    fn drain(&self) -> Vec<Frame> {
        lock(&self.queue).drain(..).collect()
    }

    /// Drain the queue into a batch that finds its way back if unwritten
    fn batch(&self) -> Batch {
        Batch {
            uaid: self.uaid,
            frames: self.drain(),
            queue: Arc::downgrade(&self.queue),
        }
    }
}

fn requeue_front(queue: &Queue, frames: Vec<Frame>) {
    if frames.is_empty() {
        return;
    }
    metrics::record_requeue(frames.len());
    let mut queue = lock(queue);
    for frame in frames.into_iter().rev() {
        queue.push_front(frame);
    }
}

fn payloads(frames: &[Frame]) -> Vec<String> {
    frames.iter().map(|f| f.payload.clone()).collect()
}


#[cfg(test)]
mod tests {
    use super::testing::RecordingConnection;
    use super::*;

    fn as_conn(conn: &Arc<RecordingConnection>) -> Arc<dyn Connection> {
        conn.clone()
    }

    #[test]
    fn test_sending_queues_and_is_never_in_use() {
        let session = DeliverySession::sending(Uaid::new());
        assert!(!session.is_in_use());
        assert!(session.sending_context().is_none());

        assert_eq!(session.deliver("a"), Delivery::Queued);
        assert_eq!(session.resend("r"), Delivery::Dropped);
        assert_eq!(session.queued_len(), 1);
    }

    #[test]
    fn test_poll_with_empty_queue_gets_heartbeat_and_closes() {
        let session = DeliverySession::sending(Uaid::new());
        let conn = RecordingConnection::new();

        session.attach_poll(as_conn(&conn));

        assert_eq!(conn.batches(), vec![Vec::<String>::new()]);
        assert!(conn.is_closed());
        assert!(!session.is_in_use());
    }

    #[test]
    fn test_poll_flushes_queue_then_later_frames_wait_for_next_poll() {
        let session = DeliverySession::sending(Uaid::new());
        session.deliver("one");
        session.deliver("two");

        let first = RecordingConnection::new();
        session.attach_poll(as_conn(&first));
        assert_eq!(first.batches(), vec![vec!["one".to_string(), "two".to_string()]]);

        // exchange is over; nothing may be pushed into it
        assert_eq!(session.deliver("three"), Delivery::Queued);
        assert_eq!(first.frames().len(), 2);

        let second = RecordingConnection::new();
        session.attach_poll(as_conn(&second));
        assert_eq!(second.frames(), vec!["three".to_string()]);
    }

    #[test]
    fn test_poll_flush_failure_requeues_in_order() {
        let session = DeliverySession::sending(Uaid::new());
        session.deliver("one");
        session.deliver("two");

        session.attach_poll(as_conn(&RecordingConnection::failing()));

        let queued: Vec<String> = session.take_queued().into_iter().map(|f| f.payload).collect();
        assert_eq!(queued, vec!["one".to_string(), "two".to_string()]);
    }

    #[test]
    fn test_streaming_writes_immediately() {
        let conn = RecordingConnection::new();
        let session = DeliverySession::streaming(Uaid::new(), as_conn(&conn));

        assert!(session.is_in_use());
        assert_eq!(session.deliver("hello"), Delivery::Sent);
        assert_eq!(session.resend("again"), Delivery::Sent);
        assert_eq!(conn.frames(), vec!["hello".to_string(), "again".to_string()]);
    }

    #[test]
    fn test_streaming_write_failure_requeues_and_flushes_on_open() {
        let conn = RecordingConnection::new();
        let session = DeliverySession::streaming(Uaid::new(), as_conn(&conn));

        conn.fail_writes.store(true, Ordering::SeqCst);
        assert_eq!(session.deliver("lost?"), Delivery::Queued);

        conn.fail_writes.store(false, Ordering::SeqCst);
        session.on_open();
        assert_eq!(conn.frames(), vec!["lost?".to_string()]);
        assert_eq!(session.queued_len(), 0);
    }

    #[test]
    fn test_streaming_not_in_use_once_connection_closes() {
        let conn = RecordingConnection::new();
        let session = DeliverySession::streaming(Uaid::new(), as_conn(&conn));
        conn.close();
        assert!(!session.is_in_use());
        assert_eq!(session.deliver("x"), Delivery::Queued);
    }

    #[test]
    fn test_resend_replaces_queued_resend() {
        let session = DeliverySession::sending(Uaid::new());
        session.attach_poll(as_conn(&RecordingConnection::new()));

        session.deliver("reply");
        session.resend("pending v1");
        session.resend("pending v2");

        let queued: Vec<String> = session.take_queued().into_iter().map(|f| f.payload).collect();
        assert_eq!(queued, vec!["reply".to_string(), "pending v2".to_string()]);
    }

    #[test]
    fn test_begin_send_leaves_streaming_alone() {
        let conn = RecordingConnection::new();
        let session = DeliverySession::streaming(Uaid::new(), as_conn(&conn));
        session.begin_send();
        assert_eq!(session.state_name(), "streaming");

        let polled = DeliverySession::sending(Uaid::new());
        polled.attach_poll(as_conn(&RecordingConnection::new()));
        assert_eq!(polled.state_name(), "polling");
        polled.begin_send();
        assert_eq!(polled.state_name(), "sending");
    }

    #[test]
    fn test_closed_session_drops_frames() {
        let session = DeliverySession::sending(Uaid::new());
        session.on_close();
        assert!(session.is_closed());
        assert_eq!(session.deliver("late"), Delivery::Dropped);
        assert_eq!(session.queued_len(), 0);
    }

    #[test]
    fn test_server_close_closes_connection_and_unbinds() {
        let registry = SessionRegistry::new();
        let conn = RecordingConnection::new();
        let uaid = Uaid::new();
        let session = Arc::new(DeliverySession::streaming(uaid, as_conn(&conn)));
        registry.bind(uaid, session.clone());

        session.on_server_initiated_close(&registry);

        assert!(conn.is_closed());
        assert!(registry.get(&uaid).is_none());
    }

    #[test]
    fn test_client_close_keeps_registration() {
        let registry = SessionRegistry::new();
        let uaid = Uaid::new();
        let session = Arc::new(DeliverySession::sending(uaid));
        registry.bind(uaid, session.clone());

        session.on_close();

        assert!(registry.get(&uaid).is_some());
    }

    #[test]
    fn test_shares_connection() {
        let conn = RecordingConnection::new();
        let a = DeliverySession::streaming(Uaid::new(), as_conn(&conn));
        let b = DeliverySession::streaming(Uaid::new(), as_conn(&conn));
        let c = DeliverySession::streaming(Uaid::new(), as_conn(&RecordingConnection::new()));
        assert!(a.shares_connection(&b));
        assert!(!a.shares_connection(&c));
        assert!(!a.shares_connection(&DeliverySession::sending(Uaid::new())));
    }

    #[tokio::test]
    async fn test_cancel_retry_is_idempotent() {
        let session = DeliverySession::sending(Uaid::new());
        let handle = tokio::spawn(std::future::pending::<()>());
        *session.retry_slot() = Some(RetryJob::new(1, handle.abort_handle()));

        assert!(session.has_retry_job());
        assert!(session.cancel_retry());
        assert!(!session.cancel_retry());
        assert!(handle.await.unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn test_clear_retry_only_matching_job() {
        let session = DeliverySession::sending(Uaid::new());
        let handle = tokio::spawn(std::future::pending::<()>());
        *session.retry_slot() = Some(RetryJob::new(7, handle.abort_handle()));

        session.clear_retry(3);
        assert!(session.retry_slot().is_some());
        session.clear_retry(7);
        assert!(session.retry_slot().is_none());
        handle.abort();
    }
}
