//! Device lifecycle.
//!
//! State machine: `New → Connecting → Connected → ServicesResolving →
//! ServicesResolved → (Enumerating | Idle) → Disconnecting → New`.
//! Notification intent is tracked on the device so recovery can restore
//! subscriptions after a reconnect.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lib_bus::{
    device_path, BusError, BusResult, IpcValue, OpClass, Proxy, RecoveryOps, RecoveryStage,
    BLUEZ_SERVICE, DEVICE_IFACE,
};
use parking_lot::Mutex;
use rand::Rng;
use tracing::{debug, info, warn};

use crate::adapter::Adapter;
use crate::context::Context;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    New,
    Connecting,
    Connected,
    ServicesResolving,
    ServicesResolved,
    Enumerating,
    Idle,
    Disconnecting,
}

pub struct Device {
    pub(crate) ctx: Arc<Context>,
    mac: String,
    path: String,
    state: Mutex<DeviceState>,
    /// Characteristic UUIDs with active notify intent; preserved across
    /// disconnects so recovery can re-subscribe.
    subscriptions: Mutex<BTreeSet<String>>,
}

impl Device {
    pub fn new(ctx: Arc<Context>, mac: &str) -> Arc<Self> {
        let mac = mac.trim().to_ascii_lowercase();
        let path = device_path(&ctx.config.adapter, &mac);
        Arc::new(Self {
            ctx,
            mac,
            path,
            state: Mutex::new(DeviceState::New),
            subscriptions: Mutex::new(BTreeSet::new()),
        })
    }

    pub fn mac(&self) -> &str {
        &self.mac
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn state(&self) -> DeviceState {
        *self.state.lock()
    }

    pub(crate) fn set_state(&self, state: DeviceState) {
        *self.state.lock() = state;
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.subscriptions.lock().iter().cloned().collect()
    }

    pub(crate) fn note_subscription(&self, char_uuid: &str, active: bool) {
        let mut subs = self.subscriptions.lock();
        if active {
            subs.insert(char_uuid.to_ascii_lowercase());
        } else {
            subs.remove(&char_uuid.to_ascii_lowercase());
        }
    }

    pub(crate) async fn proxy(&self) -> BusResult<Arc<Proxy>> {
        self.ctx
            .pool
            .get_proxy(BLUEZ_SERVICE, &self.path, DEVICE_IFACE)
            .await
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Connect with bounded retries and exponential back-off.
    ///
    /// On success the device sits in `Connected`; the caller decides when
    /// to wait for service resolution.
    pub async fn connect(&self, retries: u32) -> BusResult<()> {
        let proxy = self.proxy().await?;
        self.set_state(DeviceState::Connecting);
        let mut attempt = 0u32;
        loop {
            match proxy.call_as(OpClass::Connect, "Connect", vec![]).await {
                Ok(_) => {
                    self.set_state(DeviceState::Connected);
                    debug!(target: "bleep::device", mac = %self.mac, "connected");
                    return Ok(());
                }
                Err(BusError::InProgress) => {
                    // The stack is already connecting; give it a moment and
                    // retry without burning an attempt.
                    tokio::time::sleep(Duration::from_millis(500)).await;
                }
                Err(err) if attempt < retries => {
                    attempt += 1;
                    let jitter = rand::thread_rng().gen_range(0..250);
                    let backoff = Duration::from_millis(
                        (500u64 * 2u64.saturating_pow(attempt - 1) + jitter).min(5_000),
                    );
                    warn!(
                        target: "bleep::device",
                        mac = %self.mac,
                        attempt,
                        retries,
                        error = %err,
                        "connect failed; backing off"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(err) => {
                    self.set_state(DeviceState::New);
                    return Err(err);
                }
            }
        }
    }

    /// Wait for the `ServicesResolved` flip, up to `cap`.
    pub async fn wait_services_resolved(&self, cap: Duration) -> BusResult<bool> {
        self.set_state(DeviceState::ServicesResolving);
        let deadline = tokio::time::Instant::now() + cap;
        loop {
            if self.is_services_resolved().await.unwrap_or(false) {
                self.set_state(DeviceState::ServicesResolved);
                return Ok(true);
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
    }

    /// Disconnect from any state. Subscription intent survives for
    /// recovery.
    pub async fn disconnect(&self) -> BusResult<()> {
        let proxy = self.proxy().await?;
        self.set_state(DeviceState::Disconnecting);
        let result = proxy
            .call_as(OpClass::Disconnect, "Disconnect", vec![])
            .await;
        self.set_state(DeviceState::New);
        result.map(|_| ())
    }

    /// Initiate pairing; the registered agent answers any prompts.
    pub async fn pair(&self) -> BusResult<()> {
        let proxy = self.proxy().await?;
        proxy
            .call_as(OpClass::Pair, "Pair", vec![])
            .await
            .map(|_| ())
            .map_err(|err| match err {
                BusError::AuthenticationFailed(msg) => BusError::PairingFailed(msg),
                other => other,
            })
    }

    // ------------------------------------------------------------------
    // Properties
    // ------------------------------------------------------------------

    pub async fn is_connected(&self) -> BusResult<bool> {
        let proxy = self.proxy().await?;
        Ok(proxy.get("Connected").await?.as_bool().unwrap_or(false))
    }

    pub async fn is_paired(&self) -> BusResult<bool> {
        let proxy = self.proxy().await?;
        Ok(proxy.get("Paired").await?.as_bool().unwrap_or(false))
    }

    pub async fn is_services_resolved(&self) -> BusResult<bool> {
        let proxy = self.proxy().await?;
        Ok(proxy
            .get("ServicesResolved")
            .await?
            .as_bool()
            .unwrap_or(false))
    }

    pub async fn name(&self) -> Option<String> {
        let proxy = self.proxy().await.ok()?;
        proxy
            .get_optional("Name")
            .await
            .and_then(|v| v.as_str().map(str::to_string))
    }

    pub async fn address_type(&self) -> Option<String> {
        let proxy = self.proxy().await.ok()?;
        proxy
            .get_optional("AddressType")
            .await
            .and_then(|v| v.as_str().map(str::to_string))
    }

    pub async fn device_class(&self) -> Option<u32> {
        let proxy = self.proxy().await.ok()?;
        proxy.get_optional("Class").await.and_then(|v| v.as_u32())
    }

    pub async fn appearance(&self) -> Option<u16> {
        let proxy = self.proxy().await.ok()?;
        proxy
            .get_optional("Appearance")
            .await
            .and_then(|v| v.as_u16())
    }

    pub async fn rssi(&self) -> Option<i16> {
        let proxy = self.proxy().await.ok()?;
        proxy.get_optional("RSSI").await.and_then(|v| v.as_i16())
    }

    pub async fn uuids(&self) -> Vec<String> {
        let Ok(proxy) = self.proxy().await else {
            return Vec::new();
        };
        proxy
            .get_optional("UUIDs")
            .await
            .and_then(|v| v.to_string_vec())
            .unwrap_or_default()
    }

    pub async fn set_trusted(&self, trusted: bool) -> BusResult<()> {
        let proxy = self.proxy().await?;
        proxy.set("Trusted", IpcValue::Bool(trusted)).await
    }

    /// Run the staged recovery pipeline for this device. Serialised with
    /// evidence collection on the per-device lock.
    pub async fn recover(self: &Arc<Self>) -> BusResult<RecoveryStage> {
        let lock = self.ctx.device_lock(&self.mac);
        let _device_guard = lock.lock().await;
        let ops = DeviceRecovery {
            device: self.clone(),
        };
        let stage = self.ctx.recovery.recover(&self.mac, &ops).await?;
        info!(
            target: "bleep::device",
            mac = %self.mac,
            stage = stage.name(),
            "device recovered"
        );
        Ok(stage)
    }
}

// ---------------------------------------------------------------------------
// Recovery pipeline wiring
// ---------------------------------------------------------------------------

struct DeviceRecovery {
    device: Arc<Device>,
}

async fn run_system_command(program: &str, args: &[&str]) -> BusResult<()> {
    let output = tokio::process::Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|e| BusError::NotSupported(format!("{program}: {e}")))?;
    if output.status.success() {
        Ok(())
    } else {
        Err(BusError::Failed(format!(
            "{program} exited with {}",
            output.status
        )))
    }
}

#[async_trait]
impl RecoveryOps for DeviceRecovery {
    async fn disconnect_reconnect(&self) -> BusResult<()> {
        let _ = self.device.disconnect().await;
        self.device.connect(1).await
    }

    async fn recreate_proxy(&self) -> BusResult<()> {
        self.device.ctx.pool.invalidate_path(self.device.path());
        self.device.connect(1).await
    }

    async fn adapter_power_cycle(&self) -> BusResult<()> {
        let adapter = Adapter::new(self.device.ctx.clone());
        adapter.power_cycle(Duration::from_millis(500)).await?;
        adapter.wait_ready(Duration::from_secs(5)).await?;
        self.device.connect(1).await
    }

    async fn controller_reset(&self) -> BusResult<()> {
        let adapter = self.device.ctx.config.adapter.clone();
        run_system_command("hciconfig", &[&adapter, "reset"]).await?;
        tokio::time::sleep(Duration::from_secs(1)).await;
        self.device.connect(1).await
    }

    async fn daemon_restart(&self) -> BusResult<()> {
        run_system_command("systemctl", &["restart", "bluetooth"]).await?;
        tokio::time::sleep(Duration::from_secs(2)).await;
        self.device.connect(1).await
    }

    async fn restore_state(&self) -> BusResult<()> {
        let subscriptions = self.device.subscriptions();
        if subscriptions.is_empty() {
            return Ok(());
        }
        if !self.device.wait_services_resolved(Duration::from_secs(10)).await? {
            return Err(BusError::NotResolved);
        }
        let mapping = crate::gatt::resolve_gatt(&self.device).await?;
        for uuid in subscriptions {
            if let Some((svc_idx, chr_idx)) = mapping.find_characteristic(&uuid) {
                let chr = &mapping.services[svc_idx].characteristics[chr_idx];
                if let Err(err) = crate::gatt::start_notify_raw(&self.device, chr).await {
                    warn!(
                        target: "bleep::device",
                        mac = %self.device.mac(),
                        uuid = %uuid,
                        error = %err,
                        "failed to restore notification subscription"
                    );
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoreConfig;
    use lib_bus::mock::{MockBus, MockCharacteristic, MockPeripheral, MockService};

    async fn ctx_with_peripheral(mac: &str) -> (Arc<Context>, Arc<MockBus>) {
        let bus = Arc::new(MockBus::new());
        bus.add_peripheral(
            MockPeripheral::new(mac).with_service(
                MockService::new("0000180f-0000-1000-8000-00805f9b34fb").with_characteristic(
                    MockCharacteristic::new(
                        "00002a19-0000-1000-8000-00805f9b34fb",
                        0x002a,
                        &["read"],
                    ),
                ),
            ),
        );
        let config = CoreConfig::rooted_at(tempfile::tempdir().unwrap().path());
        let ctx = Context::start_in_memory(config, bus.clone()).await.unwrap();
        (ctx, bus)
    }

    #[tokio::test]
    async fn connect_walks_the_state_machine() {
        let (ctx, _bus) = ctx_with_peripheral("aa:bb:cc:dd:ee:40").await;
        let device = Device::new(ctx, "AA:BB:CC:DD:EE:40");
        assert_eq!(device.state(), DeviceState::New);

        device.connect(0).await.unwrap();
        assert_eq!(device.state(), DeviceState::Connected);
        assert!(device.is_connected().await.unwrap());

        assert!(device
            .wait_services_resolved(Duration::from_secs(2))
            .await
            .unwrap());
        assert_eq!(device.state(), DeviceState::ServicesResolved);

        device.disconnect().await.unwrap();
        assert_eq!(device.state(), DeviceState::New);
        assert!(!device.is_connected().await.unwrap());
    }

    #[tokio::test]
    async fn failed_connect_returns_to_new_with_reason() {
        let bus = Arc::new(MockBus::new());
        bus.add_peripheral(
            MockPeripheral::new("aa:bb:cc:dd:ee:41")
                .with_connect_error("org.bluez.Error.ConnectionAttemptFailed"),
        );
        let config = CoreConfig::rooted_at(tempfile::tempdir().unwrap().path());
        let ctx = Context::start_in_memory(config, bus).await.unwrap();
        let device = Device::new(ctx, "aa:bb:cc:dd:ee:41");
        let err = device.connect(0).await.unwrap_err();
        assert!(matches!(err, BusError::DeviceUnreachable(_)));
        assert_eq!(device.state(), DeviceState::New);
    }

    #[tokio::test]
    async fn recovery_reconnects_after_no_reply() {
        let (ctx, bus) = ctx_with_peripheral("aa:bb:cc:dd:ee:42").await;
        let device = Device::new(ctx, "aa:bb:cc:dd:ee:42");
        device.connect(0).await.unwrap();
        bus.fail_next_calls(1);
        // A no-reply style failure triggers the pipeline; the first stage
        // (disconnect + reconnect) heals it.
        let stage = device.recover().await.unwrap();
        assert_eq!(stage, RecoveryStage::DisconnectReconnect);
        assert!(device.is_connected().await.unwrap());
    }
}
