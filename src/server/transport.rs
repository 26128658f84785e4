//! Transport connections
//!
//! [`Connection`] implementations for the two ways an agent can be attached:
//! a WebSocket stream whose writer task drains an unbounded channel, and a
//! single poll exchange answered through a oneshot.
//!
//! A poll hands over the session's [`Batch`] itself, so frames stay owned
//! until the HTTP response body has been taken by the server.

use crate::protocol::Uaid;
use crate::session::{Batch, Connection, DeliveryError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};

/// Instruction to a stream's writer task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Frame(String),
    Close,
}

/// Write side of a WebSocket, fed through a channel so one task owns the sink
#[derive(Debug)]
pub struct StreamConnection {
    tx: mpsc::UnboundedSender<Outbound>,
    active: AtomicBool,
}

impl StreamConnection {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = Arc::new(Self {
            tx,
            active: AtomicBool::new(true),
        });
        (conn, rx)
    }

    /// Called by the writer task once the socket is gone
    pub fn mark_closed(&self) {
        self.active.store(false, Ordering::SeqCst);
    }
}

impl Connection for StreamConnection {
    fn send(&self, frames: Vec<String>) -> Result<(), DeliveryError> {
        if !self.is_active() {
            return Err(DeliveryError::Closed);
        }
        for frame in frames {
            self.tx
                .send(Outbound::Frame(frame))
                .map_err(|_| DeliveryError::Closed)?;
        }
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst) && !self.tx.is_closed()
    }

    fn close(&self) {
        if self.active.swap(false, Ordering::SeqCst) {
            let _ = self.tx.send(Outbound::Close);
        }
    }
}

/// One poll request waiting for its response body
#[derive(Debug)]
pub struct PollConnection {
    uaid: Uaid,
    reply: Mutex<Option<oneshot::Sender<Batch>>>,
}

impl PollConnection {
    pub fn new(uaid: Uaid) -> (Arc<Self>, oneshot::Receiver<Batch>) {
        let (tx, rx) = oneshot::channel();
        let conn = Arc::new(Self {
            uaid,
            reply: Mutex::new(Some(tx)),
        });
        (conn, rx)
    }

    fn take(&self) -> Option<oneshot::Sender<Batch>> {
        self.reply.lock().unwrap_or_else(|e| e.into_inner()).take()
    }
}

impl Connection for PollConnection {
    fn send(&self, frames: Vec<String>) -> Result<(), DeliveryError> {
        self.send_batch(Batch::detached(self.uaid, frames))
    }

    /// Answers the poll; a second send fails. If the requester is already
    /// gone the batch is dropped here and its frames requeued.
    fn send_batch(&self, batch: Batch) -> Result<(), DeliveryError> {
        let reply = self.take().ok_or(DeliveryError::Closed)?;
        reply.send(batch).map_err(|_| DeliveryError::Closed)
    }

    fn is_active(&self) -> bool {
        self.reply
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|tx| !tx.is_closed())
    }

    fn close(&self) {
        drop(self.take());
    }
}

/// Render frames as a poll response body
pub fn frames_body(frames: &[String]) -> String {
    format!("[{}]", frames.join(","))
}
