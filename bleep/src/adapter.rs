//! Adapter control.
//!
//! Thin typed wrapper over the host adapter interface: power, discovery,
//! discoverability, discovery filters and device removal. The adapter is a
//! singleton resource; discovery variants serialise on the context's
//! adapter lock.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use lib_bus::{BusResult, IpcValue, Proxy, ADAPTER_IFACE, BLUEZ_SERVICE};
use serde::{Deserialize, Serialize};

use crate::context::Context;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    #[default]
    Auto,
    Le,
    Bredr,
}

impl Transport {
    pub fn wire_name(self) -> &'static str {
        match self {
            Transport::Auto => "auto",
            Transport::Le => "le",
            Transport::Bredr => "bredr",
        }
    }
}

/// Discovery filter handed to the host stack.
#[derive(Debug, Clone, Default)]
pub struct DiscoveryFilter {
    pub uuids: Vec<String>,
    pub rssi: Option<i16>,
    pub pathloss: Option<u16>,
    pub transport: Transport,
    pub duplicate_data: Option<bool>,
    /// Restrict advertisement processing to one address (pokey mode).
    pub address: Option<String>,
}

impl DiscoveryFilter {
    fn to_dict(&self) -> IpcValue {
        let mut dict = BTreeMap::new();
        if !self.uuids.is_empty() {
            dict.insert(
                "UUIDs".to_string(),
                IpcValue::Array(self.uuids.iter().cloned().map(IpcValue::Str).collect()),
            );
        }
        if let Some(rssi) = self.rssi {
            dict.insert("RSSI".to_string(), IpcValue::I16(rssi));
        }
        if let Some(pathloss) = self.pathloss {
            dict.insert("Pathloss".to_string(), IpcValue::U16(pathloss));
        }
        if self.transport != Transport::Auto {
            dict.insert(
                "Transport".to_string(),
                IpcValue::Str(self.transport.wire_name().to_string()),
            );
        }
        if let Some(duplicate_data) = self.duplicate_data {
            dict.insert("DuplicateData".to_string(), IpcValue::Bool(duplicate_data));
        }
        if let Some(address) = &self.address {
            dict.insert(
                "Address".to_string(),
                IpcValue::Str(address.to_ascii_uppercase()),
            );
        }
        IpcValue::Dict(dict)
    }
}

/// Snapshot of the adapter's externally visible state.
#[derive(Debug, Clone, Serialize)]
pub struct AdapterState {
    pub powered: bool,
    pub discovering: bool,
    pub discoverable: bool,
    pub pairable: bool,
}

pub struct Adapter {
    ctx: Arc<Context>,
    path: String,
}

impl Adapter {
    pub fn new(ctx: Arc<Context>) -> Self {
        let path = ctx.adapter_path();
        Self { ctx, path }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    async fn proxy(&self) -> BusResult<Arc<Proxy>> {
        self.ctx
            .pool
            .get_proxy(BLUEZ_SERVICE, &self.path, ADAPTER_IFACE)
            .await
    }

    pub async fn state(&self) -> BusResult<AdapterState> {
        let proxy = self.proxy().await?;
        let props = proxy.get_all().await?;
        let flag = |name: &str| {
            props
                .get(name)
                .and_then(IpcValue::as_bool)
                .unwrap_or(false)
        };
        Ok(AdapterState {
            powered: flag("Powered"),
            discovering: flag("Discovering"),
            discoverable: flag("Discoverable"),
            pairable: flag("Pairable"),
        })
    }

    pub async fn is_powered(&self) -> BusResult<bool> {
        let proxy = self.proxy().await?;
        Ok(proxy.get("Powered").await?.as_bool().unwrap_or(false))
    }

    pub async fn set_powered(&self, powered: bool) -> BusResult<()> {
        let proxy = self.proxy().await?;
        proxy.set("Powered", IpcValue::Bool(powered)).await
    }

    pub async fn is_discovering(&self) -> BusResult<bool> {
        let proxy = self.proxy().await?;
        Ok(proxy.get("Discovering").await?.as_bool().unwrap_or(false))
    }

    pub async fn set_discoverable(&self, discoverable: bool) -> BusResult<()> {
        let proxy = self.proxy().await?;
        proxy.set("Discoverable", IpcValue::Bool(discoverable)).await
    }

    pub async fn set_pairable(&self, pairable: bool) -> BusResult<()> {
        let proxy = self.proxy().await?;
        proxy.set("Pairable", IpcValue::Bool(pairable)).await
    }

    /// Adapter readiness gate used before every scan.
    pub async fn is_ready(&self) -> bool {
        self.is_powered().await.unwrap_or(false)
    }

    pub async fn set_discovery_filter(&self, filter: &DiscoveryFilter) -> BusResult<()> {
        let proxy = self.proxy().await?;
        proxy
            .call("SetDiscoveryFilter", vec![filter.to_dict()])
            .await
            .map(|_| ())
    }

    pub async fn start_discovery(&self) -> BusResult<()> {
        let proxy = self.proxy().await?;
        proxy.call("StartDiscovery", vec![]).await.map(|_| ())
    }

    pub async fn stop_discovery(&self) -> BusResult<()> {
        let proxy = self.proxy().await?;
        proxy.call("StopDiscovery", vec![]).await.map(|_| ())
    }

    pub async fn remove_device(&self, device_path: &str) -> BusResult<()> {
        let proxy = self.proxy().await?;
        proxy
            .call(
                "RemoveDevice",
                vec![IpcValue::ObjectPath(device_path.to_string())],
            )
            .await
            .map(|_| ())
    }

    /// Bounce adapter power; stage three of the recovery pipeline.
    pub async fn power_cycle(&self, off_delay: Duration) -> BusResult<()> {
        self.set_powered(false).await?;
        tokio::time::sleep(off_delay).await;
        self.set_powered(true).await
    }

    /// Wait until the adapter reports powered, up to `timeout`.
    pub async fn wait_ready(&self, timeout: Duration) -> BusResult<bool> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.is_powered().await? {
                return Ok(true);
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoreConfig;
    use lib_bus::mock::MockBus;

    async fn adapter_over_mock() -> (Adapter, Arc<MockBus>) {
        let bus = Arc::new(MockBus::new());
        let config = CoreConfig::rooted_at(tempfile::tempdir().unwrap().path());
        let ctx = Context::start_in_memory(config, bus.clone()).await.unwrap();
        (Adapter::new(ctx), bus)
    }

    #[tokio::test]
    async fn state_reflects_power_and_discovery() {
        let (adapter, _bus) = adapter_over_mock().await;
        assert!(adapter.is_ready().await);
        adapter.start_discovery().await.unwrap();
        let state = adapter.state().await.unwrap();
        assert!(state.powered);
        assert!(state.discovering);
        adapter.stop_discovery().await.unwrap();
        assert!(!adapter.is_discovering().await.unwrap());
    }

    #[tokio::test]
    async fn filter_dict_carries_only_set_fields() {
        let (adapter, bus) = adapter_over_mock().await;
        let filter = DiscoveryFilter {
            transport: Transport::Le,
            duplicate_data: Some(false),
            address: Some("aa:bb:cc:dd:ee:02".into()),
            ..Default::default()
        };
        adapter.set_discovery_filter(&filter).await.unwrap();
        let stored = bus.discovery_filter().unwrap();
        assert_eq!(stored.get("Transport").and_then(IpcValue::as_str), Some("le"));
        assert_eq!(stored.get("DuplicateData").and_then(IpcValue::as_bool), Some(false));
        assert_eq!(
            stored.get("Address").and_then(IpcValue::as_str),
            Some("AA:BB:CC:DD:EE:02")
        );
        assert!(stored.get("RSSI").is_none());
    }

    #[tokio::test]
    async fn power_cycle_round_trips() {
        let (adapter, _bus) = adapter_over_mock().await;
        adapter.power_cycle(Duration::from_millis(5)).await.unwrap();
        assert!(adapter.is_powered().await.unwrap());
    }
}
