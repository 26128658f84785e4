//! Idle reaper
//!
//! A daemon loop that periodically evicts agents with no open transport
//! whose last access is older than the timeout. Evicted agents lose their
//! channels and pending updates.
//!
//! The loop is driven like the other background daemons here: an interval
//! tick and a command channel under `tokio::select!`, with events published
//! on a broadcast channel.

use super::engine::PushEngine;
use crate::metrics;
use crate::session::SessionRegistry;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Event broadcast capacity
const EVENT_CAPACITY: usize = 64;

/// Shortest period between periodic sweeps
const MIN_SWEEP_PERIOD: Duration = Duration::from_millis(1);

/// Outcome of one sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Agents looked at
    pub examined: usize,
    /// Agents evicted with their channels
    pub reaped: usize,
    /// Agents evicted whose channels could not be deleted
    pub failed: usize,
}

/// Commands accepted by a running reaper
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaperCommand {
    /// Sweep immediately
    SweepNow,
    /// Stop the loop
    Shutdown,
}

/// Events emitted by a running reaper
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReaperEvent {
    Started,
    SweepCompleted(SweepReport),
    Stopped,
}

pub struct IdleReaper {
    engine: Arc<PushEngine>,
    registry: Arc<SessionRegistry>,
    timeout: Duration,
    event_tx: broadcast::Sender<ReaperEvent>,
}

impl std::fmt::Debug for IdleReaper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdleReaper")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl IdleReaper {
    pub fn new(engine: Arc<PushEngine>, registry: Arc<SessionRegistry>, timeout: Duration) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            engine,
            registry,
            timeout,
            event_tx,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Get an event subscriber
    pub fn subscribe(&self) -> broadcast::Receiver<ReaperEvent> {
        self.event_tx.subscribe()
    }

    fn send_event(&self, event: ReaperEvent) {
        // no subscribers is fine
        let _ = self.event_tx.send(event);
    }

    pub fn sweep(&self) -> SweepReport {
        self.sweep_at(Utc::now())
    }

    /// Evict every idle agent as of `now` and publish the report
    pub fn sweep_at(&self, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport::default();
        let Ok(timeout) = chrono::Duration::from_std(self.timeout) else {
            return report;
        };

        for entry in self.registry.snapshot() {
            report.examined += 1;

            if entry.session.is_in_use() {
                continue;
            }
            match entry.last_access.checked_add_signed(timeout) {
                Some(deadline) if deadline < now => {}
                _ => continue,
            }

            // rebound since the snapshot
            if !self.registry.unbind_session(&entry.uaid, &entry.session) {
                continue;
            }

            match self.engine.remove_agent(&entry.uaid) {
                Ok(()) => {
                    report.reaped += 1;
                    tracing::info!(
                        uaid = %entry.uaid,
                        last_access = %entry.last_access,
                        "Reaped idle agent"
                    );
                }
                Err(e) => {
                    report.failed += 1;
                    tracing::warn!(uaid = %entry.uaid, error = %e, "Failed to delete channels of idle agent");
                }
            }

            entry.session.on_server_initiated_close(&self.registry);
        }

        metrics::record_reaped(report.reaped);
        if report.reaped > 0 || report.failed > 0 {
            tracing::info!(
                examined = report.examined,
                reaped = report.reaped,
                failed = report.failed,
                "Reaper sweep complete"
            );
        } else {
            tracing::debug!(examined = report.examined, "Reaper sweep complete");
        }
        self.send_event(ReaperEvent::SweepCompleted(report));
        report
    }

    /// Run the sweep loop on the current runtime, once per timeout period
    pub fn spawn(self) -> ReaperHandle {
        let (command_tx, mut command_rx) = mpsc::channel(10);

        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.timeout.max(MIN_SWEEP_PERIOD));
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // first tick completes immediately
            interval.tick().await;

            tracing::info!(timeout_ms = self.timeout.as_millis() as u64, "Idle reaper started");
            self.send_event(ReaperEvent::Started);

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        self.sweep();
                    }
                    cmd = command_rx.recv() => match cmd {
                        Some(ReaperCommand::SweepNow) => {
                            self.sweep();
                        }
                        Some(ReaperCommand::Shutdown) | None => {
                            tracing::info!("Idle reaper stopping");
                            break;
                        }
                    }
                }
            }

            self.send_event(ReaperEvent::Stopped);
        });

        ReaperHandle { command_tx, task }
    }
}

/// Control handle for a spawned [`IdleReaper`]
#[derive(Debug)]
pub struct ReaperHandle {
    command_tx: mpsc::Sender<ReaperCommand>,
    task: JoinHandle<()>,
}

impl ReaperHandle {
    pub async fn sweep_now(&self) -> crate::Result<()> {
        self.command_tx
            .send(ReaperCommand::SweepNow)
            .await
            .map_err(|e| crate::RelayError::Other(format!("Reaper is not running: {}", e)))
    }

    /// Stop the loop and wait for it to finish
    pub async fn shutdown(self) -> crate::Result<()> {
        // already stopped if the send fails
        let _ = self.command_tx.send(ReaperCommand::Shutdown).await;
        self.task
            .await
            .map_err(|e| crate::RelayError::Other(format!("Reaper task failed: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Uaid;
    use crate::relay::engine::testing::{engine, engine_with, ids, BrokenStore};
    use crate::session::testing::RecordingConnection;
    use crate::session::{Connection, DeliverySession};

    const TIMEOUT: Duration = Duration::from_secs(60);

    fn reaper_with(engine: PushEngine) -> (IdleReaper, Arc<PushEngine>, Arc<SessionRegistry>) {
        let engine = Arc::new(engine);
        let registry = Arc::new(SessionRegistry::new());
        let reaper = IdleReaper::new(Arc::clone(&engine), Arc::clone(&registry), TIMEOUT);
        (reaper, engine, registry)
    }

    fn later() -> DateTime<Utc> {
        Utc::now() + chrono::Duration::seconds(120)
    }

    fn bind_idle(engine: &PushEngine, registry: &SessionRegistry) -> (Uaid, Arc<DeliverySession>) {
        let uaid = engine.handle_handshake(None, &ids(&["c1", "c2"])).unwrap().uaid;
        let session = Arc::new(DeliverySession::sending(uaid));
        registry.bind(uaid, Arc::clone(&session));
        (uaid, session)
    }

    #[test]
    fn test_reaps_idle_agent() {
        let (reaper, engine, registry) = reaper_with(engine());
        let (uaid, session) = bind_idle(&engine, &registry);

        let report = reaper.sweep_at(later());

        assert_eq!(
            report,
            SweepReport {
                examined: 1,
                reaped: 1,
                failed: 0
            }
        );
        assert!(!registry.contains(&uaid));
        assert!(session.is_closed());
        assert!(engine.channel_ids(&uaid).unwrap().is_empty());
    }

    #[test]
    fn test_recent_agent_survives() {
        let (reaper, engine, registry) = reaper_with(engine());
        let (uaid, _session) = bind_idle(&engine, &registry);

        let report = reaper.sweep_at(Utc::now());

        assert_eq!(report.reaped, 0);
        assert!(registry.contains(&uaid));
        assert_eq!(engine.channel_ids(&uaid).unwrap().len(), 2);
    }

    #[test]
    fn test_in_use_agent_survives() {
        let (reaper, engine, registry) = reaper_with(engine());
        let uaid = engine.handle_handshake(None, &ids(&["c1"])).unwrap().uaid;
        let conn: Arc<dyn Connection> = RecordingConnection::new();
        registry.bind(uaid, Arc::new(DeliverySession::streaming(uaid, conn)));

        let report = reaper.sweep_at(later());

        assert_eq!(report.examined, 1);
        assert_eq!(report.reaped, 0);
        assert!(registry.contains(&uaid));
    }

    #[test]
    fn test_store_failure_counted_and_sweep_continues() {
        let (reaper, _engine, registry) = reaper_with(engine_with(Arc::new(BrokenStore)));
        for _ in 0..3 {
            let uaid = Uaid::new();
            registry.bind(uaid, Arc::new(DeliverySession::sending(uaid)));
        }

        let report = reaper.sweep_at(later());

        assert_eq!(report.examined, 3);
        assert_eq!(report.failed, 3);
        assert_eq!(report.reaped, 0);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_handle_sweep_now_and_shutdown() {
        let (reaper, _engine, _registry) = reaper_with(engine());
        let mut events = reaper.subscribe();
        let handle = reaper.spawn();

        assert_eq!(events.recv().await.unwrap(), ReaperEvent::Started);

        handle.sweep_now().await.unwrap();
        assert_eq!(
            events.recv().await.unwrap(),
            ReaperEvent::SweepCompleted(SweepReport::default())
        );

        handle.shutdown().await.unwrap();
        assert_eq!(events.recv().await.unwrap(), ReaperEvent::Stopped);
    }

    #[test]
    fn test_direct_sweep_publishes_report() {
        let (reaper, engine, registry) = reaper_with(engine());
        bind_idle(&engine, &registry);
        let mut events = reaper.subscribe();

        let report = reaper.sweep_at(later());

        assert_eq!(events.try_recv().unwrap(), ReaperEvent::SweepCompleted(report));
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_timeout_does_not_stall_loop() {
        let registry = Arc::new(SessionRegistry::new());
        let reaper = IdleReaper::new(Arc::new(engine()), registry, Duration::ZERO);
        let mut events = reaper.subscribe();
        let handle = reaper.spawn();

        assert_eq!(events.recv().await.unwrap(), ReaperEvent::Started);
        assert!(matches!(
            events.recv().await.unwrap(),
            ReaperEvent::SweepCompleted(_)
        ));
        handle.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_sweep() {
        let (reaper, engine, registry) = reaper_with(engine());
        let (uaid, _session) = bind_idle(&engine, &registry);
        let mut events = reaper.subscribe();
        let handle = reaper.spawn();

        assert_eq!(events.recv().await.unwrap(), ReaperEvent::Started);
        // tokio time is paused but last_access uses the wall clock, so the
        // agent is still fresh at the first tick
        match events.recv().await.unwrap() {
            ReaperEvent::SweepCompleted(report) => assert_eq!(report.examined, 1),
            other => panic!("unexpected event {:?}", other),
        }
        assert!(registry.contains(&uaid));

        handle.shutdown().await.unwrap();
    }
}
