//! Staged device recovery pipeline.
//!
//! On a recoverable transport failure the pipeline escalates through five
//! stages, each with its own attempt cap and back-off window. The concrete
//! actions (reconnect, proxy rebuild, adapter bounce, controller reset,
//! daemon restart) live behind [`RecoveryOps`] so the device layer supplies
//! them and caller state survives across stages.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::{BusError, BusResult};
use crate::metrics::MetricsCollector;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RecoveryStage {
    DisconnectReconnect,
    RecreateProxy,
    AdapterPowerCycle,
    ControllerReset,
    DaemonRestart,
}

impl RecoveryStage {
    const ALL: [RecoveryStage; 5] = [
        RecoveryStage::DisconnectReconnect,
        RecoveryStage::RecreateProxy,
        RecoveryStage::AdapterPowerCycle,
        RecoveryStage::ControllerReset,
        RecoveryStage::DaemonRestart,
    ];

    fn max_attempts(self) -> u32 {
        match self {
            RecoveryStage::DisconnectReconnect => 3,
            RecoveryStage::RecreateProxy => 2,
            _ => 1,
        }
    }

    fn backoff(self) -> Duration {
        match self {
            RecoveryStage::DisconnectReconnect => Duration::from_secs(60),
            RecoveryStage::RecreateProxy => Duration::from_secs(300),
            RecoveryStage::AdapterPowerCycle => Duration::from_secs(900),
            RecoveryStage::ControllerReset => Duration::from_secs(1800),
            RecoveryStage::DaemonRestart => Duration::from_secs(3600),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            RecoveryStage::DisconnectReconnect => "disconnect_reconnect",
            RecoveryStage::RecreateProxy => "recreate_proxy",
            RecoveryStage::AdapterPowerCycle => "adapter_power_cycle",
            RecoveryStage::ControllerReset => "controller_reset",
            RecoveryStage::DaemonRestart => "daemon_restart",
        }
    }
}

/// Concrete recovery actions, supplied by the device layer.
#[async_trait]
pub trait RecoveryOps: Send + Sync {
    async fn disconnect_reconnect(&self) -> BusResult<()>;
    async fn recreate_proxy(&self) -> BusResult<()>;
    async fn adapter_power_cycle(&self) -> BusResult<()>;
    async fn controller_reset(&self) -> BusResult<()>;
    async fn daemon_restart(&self) -> BusResult<()>;

    /// Re-apply caller intent (notification subscriptions, trusted flag)
    /// after a stage succeeded.
    async fn restore_state(&self) -> BusResult<()>;
}

#[derive(Default)]
struct StageState {
    attempts: u32,
    last_attempt: Option<Instant>,
}

/// Tracks per-device recovery attempts and drives the staged escalation.
pub struct RecoveryManager {
    devices: Mutex<HashMap<String, HashMap<RecoveryStage, StageState>>>,
    metrics: Arc<MetricsCollector>,
}

impl RecoveryManager {
    pub fn new(metrics: Arc<MetricsCollector>) -> Self {
        Self {
            devices: Mutex::new(HashMap::new()),
            metrics,
        }
    }

    fn eligible(&self, device: &str, stage: RecoveryStage) -> bool {
        let mut devices = self.devices.lock();
        let stages = devices.entry(device.to_string()).or_default();
        let state = stages.entry(stage).or_default();
        if state.attempts < stage.max_attempts() {
            return true;
        }
        match state.last_attempt {
            Some(last) if last.elapsed() > stage.backoff() => {
                state.attempts = 0;
                true
            }
            _ => false,
        }
    }

    fn record_attempt(&self, device: &str, stage: RecoveryStage) {
        let mut devices = self.devices.lock();
        let state = devices
            .entry(device.to_string())
            .or_default()
            .entry(stage)
            .or_default();
        state.attempts += 1;
        state.last_attempt = Some(Instant::now());
    }

    /// Forget recovery history for a device (daemon restarted, device gone).
    pub fn clear(&self, device: &str) {
        self.devices.lock().remove(device);
    }

    /// Escalate through the stages until one succeeds.
    ///
    /// Returns the stage that recovered the device. When every eligible
    /// stage fails the device is reported unreachable.
    pub async fn recover(
        &self,
        device: &str,
        ops: &dyn RecoveryOps,
    ) -> BusResult<RecoveryStage> {
        for stage in RecoveryStage::ALL {
            if !self.eligible(device, stage) {
                continue;
            }
            self.record_attempt(device, stage);
            self.metrics
                .increment_counter(&format!("recovery.{}", stage.name()));
            tracing::info!(
                target: "bleep::recovery",
                device,
                stage = stage.name(),
                "attempting recovery stage"
            );

            let outcome = match stage {
                RecoveryStage::DisconnectReconnect => ops.disconnect_reconnect().await,
                RecoveryStage::RecreateProxy => ops.recreate_proxy().await,
                RecoveryStage::AdapterPowerCycle => ops.adapter_power_cycle().await,
                RecoveryStage::ControllerReset => ops.controller_reset().await,
                RecoveryStage::DaemonRestart => ops.daemon_restart().await,
            };

            match outcome {
                Ok(()) => {
                    if let Err(err) = ops.restore_state().await {
                        tracing::warn!(
                            target: "bleep::recovery",
                            device,
                            error = %err,
                            "state restoration after recovery failed"
                        );
                    }
                    return Ok(stage);
                }
                Err(err) => {
                    tracing::warn!(
                        target: "bleep::recovery",
                        device,
                        stage = stage.name(),
                        error = %err,
                        "recovery stage failed"
                    );
                }
            }
        }
        Err(BusError::DeviceUnreachable(format!(
            "all recovery stages exhausted for {device}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Default)]
    struct ScriptedOps {
        reconnect_failures: AtomicU32,
        reconnects: AtomicU32,
        proxy_rebuilds: AtomicU32,
        restores: AtomicU32,
    }

    #[async_trait]
    impl RecoveryOps for ScriptedOps {
        async fn disconnect_reconnect(&self) -> BusResult<()> {
            self.reconnects.fetch_add(1, Ordering::SeqCst);
            if self.reconnect_failures.load(Ordering::SeqCst) > 0 {
                self.reconnect_failures.fetch_sub(1, Ordering::SeqCst);
                Err(BusError::NoReply("still down".into()))
            } else {
                Ok(())
            }
        }

        async fn recreate_proxy(&self) -> BusResult<()> {
            self.proxy_rebuilds.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn adapter_power_cycle(&self) -> BusResult<()> {
            Err(BusError::NotSupported("no adapter in test".into()))
        }

        async fn controller_reset(&self) -> BusResult<()> {
            Err(BusError::NotSupported("no controller in test".into()))
        }

        async fn daemon_restart(&self) -> BusResult<()> {
            Err(BusError::NotSupported("no daemon in test".into()))
        }

        async fn restore_state(&self) -> BusResult<()> {
            self.restores.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn first_stage_recovers_and_restores_state() {
        let manager = RecoveryManager::new(Arc::new(MetricsCollector::new()));
        let ops = ScriptedOps::default();
        let stage = manager.recover("aa:bb:cc:dd:ee:01", &ops).await.unwrap();
        assert_eq!(stage, RecoveryStage::DisconnectReconnect);
        assert_eq!(ops.restores.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn escalates_past_exhausted_stage() {
        let manager = RecoveryManager::new(Arc::new(MetricsCollector::new()));
        let ops = ScriptedOps::default();
        // Enough scripted failures to exhaust the reconnect stage cap in
        // one call plus the escalation into proxy recreation.
        ops.reconnect_failures.store(10, Ordering::SeqCst);
        let stage = manager.recover("aa:bb:cc:dd:ee:02", &ops).await.unwrap();
        assert_eq!(stage, RecoveryStage::RecreateProxy);
        assert_eq!(ops.reconnects.load(Ordering::SeqCst), 1);

        // A second round skips straight past remaining reconnect attempts
        // once the cap is hit.
        let _ = manager.recover("aa:bb:cc:dd:ee:02", &ops).await.unwrap();
        let _ = manager.recover("aa:bb:cc:dd:ee:02", &ops).await.unwrap();
        assert!(ops.reconnects.load(Ordering::SeqCst) <= 3);
    }
}
