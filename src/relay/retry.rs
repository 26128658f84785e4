//! Retry scheduler
//!
//! One tokio task per agent resends the pending update set until the agent
//! acknowledges everything. The job handle lives in the session's retry slot,
//! so closing the session aborts it.

use super::engine::PushEngine;
use crate::metrics;
use crate::protocol::Reply;
use crate::session::{Delivery, DeliverySession, RetryJob};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::MissedTickBehavior;

/// Shortest resend interval
const MIN_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug)]
pub struct RetryScheduler {
    engine: Arc<PushEngine>,
    interval: Duration,
    next_id: AtomicU64,
}

impl RetryScheduler {
    /// `interval` is raised to one millisecond if shorter
    pub fn new(engine: Arc<PushEngine>, interval: Duration) -> Self {
        if interval < MIN_INTERVAL {
            tracing::warn!(
                interval_ms = interval.as_millis() as u64,
                "Ack interval too short, using 1ms"
            );
        }
        Self {
            engine,
            interval: interval.max(MIN_INTERVAL),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Start the session's retry job unless one is already live.
    ///
    /// Returns true if a new job was spawned. Must be called inside a tokio
    /// runtime.
    pub fn start(&self, session: &Arc<DeliverySession>, initial_delay: Duration) -> bool {
        let mut slot = session.retry_slot();
        if session.is_closed() {
            return false;
        }
        if slot.as_ref().is_some_and(|job| !job.is_finished()) {
            return false;
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let task = tokio::spawn(run_job(
            id,
            Arc::downgrade(session),
            Arc::clone(&self.engine),
            initial_delay,
            self.interval,
        ));
        *slot = Some(RetryJob::new(id, task.abort_handle()));

        tracing::debug!(
            uaid = %session.uaid(),
            job = id,
            delay_ms = initial_delay.as_millis() as u64,
            "Retry job started"
        );
        true
    }

    /// Abort the session's retry job. Safe to call when none is running.
    pub fn cancel(&self, session: &DeliverySession) -> bool {
        let cancelled = session.cancel_retry();
        if cancelled {
            tracing::debug!(uaid = %session.uaid(), "Retry job cancelled");
        }
        cancelled
    }
}

async fn run_job(
    id: u64,
    session: Weak<DeliverySession>,
    engine: Arc<PushEngine>,
    initial_delay: Duration,
    interval: Duration,
) {
    tokio::time::sleep(initial_delay).await;

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        let Some(session) = session.upgrade() else {
            return;
        };
        if session.is_closed() {
            session.clear_retry(id);
            return;
        }

        let uaid = *session.uaid();
        match engine.unacknowledged(&uaid) {
            Ok(pending) if pending.is_empty() => {
                tracing::debug!(uaid = %uaid, job = id, "Nothing pending, retry job done");
                session.clear_retry(id);
                return;
            }
            Ok(pending) => {
                let count = pending.len();
                let frame = Reply::Notification { updates: pending }.encode();
                if session.resend(frame) != Delivery::Dropped {
                    metrics::record_resend();
                    tracing::trace!(uaid = %uaid, updates = count, "Resent pending updates");
                }
            }
            Err(e) => {
                tracing::warn!(uaid = %uaid, error = %e, "Could not load pending updates");
            }
        }
    }
}
