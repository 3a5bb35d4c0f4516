//! Host-daemon health monitor.
//!
//! Periodic heartbeat (an object-manager dump) with exponential back-off
//! while the daemon is failing. Publishes `Stalled`, `Restarted` and
//! `AvailableChanged` events on a broadcast channel; the pairing agent and
//! recovery pipeline subscribe to re-arm themselves after a daemon restart.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use crate::metrics::MetricsCollector;
use crate::timeout::{with_timeout, OpClass};
use crate::transport::{BusTransport, BLUEZ_SERVICE};

const MAX_BACKOFF_FACTOR: u32 = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthEvent {
    Stalled,
    Restarted,
    AvailableChanged(bool),
}

pub struct HealthMonitor {
    bus: Arc<dyn BusTransport>,
    interval: Duration,
    events: broadcast::Sender<HealthEvent>,
    stop: watch::Sender<bool>,
    metrics: Arc<MetricsCollector>,
}

impl HealthMonitor {
    pub fn new(
        bus: Arc<dyn BusTransport>,
        interval: Duration,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        let (stop, _) = watch::channel(false);
        Self {
            bus,
            interval,
            events,
            stop,
            metrics,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HealthEvent> {
        self.events.subscribe()
    }

    /// One heartbeat probe; true when the daemon answered.
    pub async fn heartbeat(&self) -> bool {
        with_timeout(
            OpClass::GetProperty,
            "health.heartbeat",
            &self.metrics,
            self.bus.get_managed_objects(BLUEZ_SERVICE),
        )
        .await
        .is_ok()
    }

    /// Spawn the heartbeat loop. Call [`HealthMonitor::stop`] to end it.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let monitor = self.clone();
        let mut stop_rx = self.stop.subscribe();
        tokio::spawn(async move {
            let mut available = true;
            let mut backoff_factor: u32 = 1;
            loop {
                let sleep_for = monitor.interval * backoff_factor;
                tokio::select! {
                    _ = tokio::time::sleep(sleep_for) => {}
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                }

                let healthy = monitor.heartbeat().await;
                if healthy && !available {
                    tracing::info!(target: "bleep::bus", "host daemon restarted");
                    available = true;
                    backoff_factor = 1;
                    let _ = monitor.events.send(HealthEvent::Restarted);
                    let _ = monitor.events.send(HealthEvent::AvailableChanged(true));
                } else if !healthy {
                    if available {
                        tracing::warn!(target: "bleep::bus", "host daemon heartbeat stalled");
                        available = false;
                        let _ = monitor.events.send(HealthEvent::Stalled);
                        let _ = monitor.events.send(HealthEvent::AvailableChanged(false));
                    }
                    backoff_factor = (backoff_factor * 2).min(MAX_BACKOFF_FACTOR);
                    monitor.metrics.increment_counter("health.failed_heartbeats");
                }
            }
        })
    }

    pub fn stop(&self) {
        let _ = self.stop.send(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockBus;

    #[tokio::test]
    async fn heartbeat_reflects_daemon_health() {
        let mock = Arc::new(MockBus::new());
        let metrics = Arc::new(MetricsCollector::new());
        let monitor = Arc::new(HealthMonitor::new(
            mock.clone(),
            Duration::from_millis(10),
            metrics,
        ));
        assert!(monitor.heartbeat().await);
        mock.set_healthy(false);
        assert!(!monitor.heartbeat().await);
    }

    #[tokio::test]
    async fn monitor_emits_stall_and_restart() {
        let mock = Arc::new(MockBus::new());
        let metrics = Arc::new(MetricsCollector::new());
        let monitor = Arc::new(HealthMonitor::new(
            mock.clone(),
            Duration::from_millis(5),
            metrics,
        ));
        let mut events = monitor.subscribe();
        let handle = monitor.start();

        mock.set_healthy(false);
        let mut saw_stall = false;
        for _ in 0..4 {
            if let Ok(Ok(event)) =
                tokio::time::timeout(Duration::from_secs(2), events.recv()).await
            {
                if event == HealthEvent::Stalled {
                    saw_stall = true;
                    break;
                }
            }
        }
        assert!(saw_stall);

        mock.set_healthy(true);
        let mut saw_restart = false;
        for _ in 0..8 {
            if let Ok(Ok(event)) =
                tokio::time::timeout(Duration::from_secs(2), events.recv()).await
            {
                if event == HealthEvent::Restarted {
                    saw_restart = true;
                    break;
                }
            }
        }
        assert!(saw_restart);

        monitor.stop();
        let _ = handle.await;
    }
}
