//! Prometheus metrics
//!
//! Counters and gauges for the relay, served as text at `/metrics`.

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_int_counter, register_int_gauge, CounterVec, Encoder,
    IntCounter, IntGauge, TextEncoder,
};

lazy_static! {
    /// Counter: inbound frames by message type
    pub static ref FRAMES: CounterVec = register_counter_vec!(
        "pushrelay_frames_total",
        "Inbound protocol frames by message type",
        &["message_type"]
    )
    .expect("Failed to create frames metric");

    /// Counter: notification requests by outcome
    pub static ref NOTIFICATIONS: CounterVec = register_counter_vec!(
        "pushrelay_notifications_total",
        "Notification requests by outcome",
        &["outcome"]
    )
    .expect("Failed to create notifications metric");

    /// Counter: updates acknowledged by agents
    pub static ref ACKS: IntCounter = register_int_counter!(
        "pushrelay_acks_total",
        "Updates acknowledged by user agents"
    )
    .expect("Failed to create acks metric");

    /// Counter: resend frames produced by retry jobs
    pub static ref RESENDS: IntCounter = register_int_counter!(
        "pushrelay_resends_total",
        "Pending update sets resent by retry jobs"
    )
    .expect("Failed to create resends metric");

    /// Counter: frames returned to a session queue after a failed write
    pub static ref REQUEUES: IntCounter = register_int_counter!(
        "pushrelay_delivery_requeues_total",
        "Frames requeued after a failed transport write"
    )
    .expect("Failed to create requeues metric");

    /// Counter: agents evicted by the idle reaper
    pub static ref REAPED: IntCounter = register_int_counter!(
        "pushrelay_reaped_agents_total",
        "User agents evicted by the idle reaper"
    )
    .expect("Failed to create reaped metric");

    /// Gauge: sessions currently bound in the registry
    pub static ref BOUND_SESSIONS: IntGauge = register_int_gauge!(
        "pushrelay_bound_sessions",
        "Delivery sessions currently bound"
    )
    .expect("Failed to create bound_sessions metric");
}

/// Record an inbound frame
pub fn record_frame(message_type: &str) {
    FRAMES.with_label_values(&[message_type]).inc();
}

/// Record the outcome of a notification request
pub fn record_notification(outcome: &str) {
    NOTIFICATIONS.with_label_values(&[outcome]).inc();
}

/// Record acknowledged updates
pub fn record_acks(count: usize) {
    ACKS.inc_by(count as u64);
}

pub fn record_resend() {
    RESENDS.inc();
}

/// Record frames put back on a session queue
pub fn record_requeue(count: usize) {
    REQUEUES.inc_by(count as u64);
}

pub fn record_reaped(count: usize) {
    REAPED.inc_by(count as u64);
}

/// Set the number of bound sessions
pub fn set_bound_sessions(count: usize) {
    BOUND_SESSIONS.set(count as i64);
}

/// Encode all metrics as Prometheus text format
pub fn encode_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::warn!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
