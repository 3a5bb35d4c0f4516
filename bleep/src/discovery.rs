//! Scan variants and advertisement ingestion.
//!
//! Four variants over the one discovery primitive:
//!
//! | variant | duplicate policy      | cadence                            |
//! |---------|-----------------------|------------------------------------|
//! | passive | stack deduplicates    | one shot, stop after timeout       |
//! | naggy   | every advertisement   | one shot                           |
//! | pokey   | every advertisement   | 1 s on/off cycles until timeout    |
//! | brute   | every advertisement   | BR/EDR phase + LE phase, half each |
//!
//! The stack only flushes its advertisement cache on discovery stop, so the
//! pokey cycle forces repeated flushes; its address filter keeps controller
//! time on one target. Every advertisement event updates the in-memory
//! device, persists an adv-report row and folds RSSI extrema.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use lib_bus::{BusSignal, BusTransport, IpcValue, PropertyMap, DEVICE_IFACE};
use serde::Serialize;
use tracing::{debug, info};

use crate::adapter::{Adapter, DiscoveryFilter, Transport};
use crate::context::Context;

/// Live view of a device accumulated during a scan window.
#[derive(Debug, Clone, Serialize)]
pub struct DiscoveredDevice {
    pub mac: String,
    pub name: Option<String>,
    pub addr_type: Option<String>,
    pub rssi_last: Option<i64>,
    pub rssi_min: Option<i64>,
    pub rssi_max: Option<i64>,
    pub device_class: Option<i64>,
    pub appearance: Option<i64>,
    pub uuids: Vec<String>,
    pub manufacturer_id: Option<i64>,
    pub adv_count: u64,
}

impl DiscoveredDevice {
    fn new(mac: &str) -> Self {
        Self {
            mac: mac.to_string(),
            name: None,
            addr_type: None,
            rssi_last: None,
            rssi_min: None,
            rssi_max: None,
            device_class: None,
            appearance: None,
            uuids: Vec::new(),
            manufacturer_id: None,
            adv_count: 0,
        }
    }

    fn fold_rssi(&mut self, rssi: i64) {
        self.rssi_last = Some(rssi);
        self.rssi_min = Some(self.rssi_min.map_or(rssi, |v| v.min(rssi)));
        self.rssi_max = Some(self.rssi_max.map_or(rssi, |v| v.max(rssi)));
    }
}

#[derive(Debug, Clone)]
pub struct ScanOptions {
    pub timeout: Duration,
    pub transport: Transport,
    /// When set, only this address is ingested (and pokey filters on it).
    pub target: Option<String>,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            transport: Transport::Auto,
            target: None,
        }
    }
}

/// Outcome of one scan invocation.
#[derive(Debug, Clone, Serialize)]
pub struct ScanReport {
    pub devices: Vec<DiscoveredDevice>,
    pub cycles: u32,
}

fn parse_device_event(props: &PropertyMap) -> (Option<i64>, serde_json::Value) {
    let rssi = props.get("RSSI").and_then(IpcValue::as_i16).map(i64::from);
    let mut decoded = serde_json::Map::new();
    for key in ["Name", "Alias", "AddressType"] {
        if let Some(value) = props.get(key).and_then(IpcValue::as_str) {
            decoded.insert(key.to_string(), serde_json::json!(value));
        }
    }
    if let Some(class) = props.get("Class").and_then(IpcValue::as_u32) {
        decoded.insert("Class".to_string(), serde_json::json!(class));
    }
    if let Some(uuids) = props.get("UUIDs").and_then(IpcValue::to_string_vec) {
        decoded.insert("UUIDs".to_string(), serde_json::json!(uuids));
    }
    if let Some(rssi) = rssi {
        decoded.insert("RSSI".to_string(), serde_json::json!(rssi));
    }
    (rssi, serde_json::Value::Object(decoded))
}

fn manufacturer_from_props(props: &PropertyMap) -> (Option<i64>, Option<Vec<u8>>) {
    let Some(dict) = props.get("ManufacturerData").and_then(IpcValue::as_dict) else {
        return (None, None);
    };
    for (key, value) in dict {
        let id = key
            .parse::<i64>()
            .ok()
            .or_else(|| i64::from_str_radix(key.trim_start_matches("0x"), 16).ok());
        if let Some(id) = id {
            return (Some(id), value.to_byte_vec());
        }
    }
    (None, None)
}

async fn ingest_device(
    ctx: &Arc<Context>,
    registry: &mut BTreeMap<String, DiscoveredDevice>,
    mac: &str,
    props: &PropertyMap,
) {
    let entry = registry
        .entry(mac.to_string())
        .or_insert_with(|| DiscoveredDevice::new(mac));
    if let Some(name) = props.get("Name").and_then(IpcValue::as_str) {
        entry.name = Some(name.to_string());
    }
    if let Some(addr_type) = props.get("AddressType").and_then(IpcValue::as_str) {
        entry.addr_type = Some(addr_type.to_string());
    }
    if let Some(class) = props.get("Class").and_then(IpcValue::as_u32) {
        entry.device_class = Some(class as i64);
    }
    if let Some(appearance) = props.get("Appearance").and_then(IpcValue::as_u16) {
        entry.appearance = Some(appearance as i64);
    }
    if let Some(uuids) = props.get("UUIDs").and_then(IpcValue::to_string_vec) {
        entry.uuids = uuids;
    }
    let (manufacturer_id, manufacturer_data) = manufacturer_from_props(props);
    if let Some(id) = manufacturer_id {
        entry.manufacturer_id = Some(id);
    }

    let (rssi, decoded) = parse_device_event(props);
    if let Some(rssi) = rssi {
        entry.fold_rssi(rssi);
    }
    entry.adv_count += 1;

    let ts = chrono::Utc::now().timestamp_millis();
    let attrs = lib_observations::DeviceAttrs {
        addr_type: entry.addr_type.clone(),
        name: entry.name.clone(),
        appearance: entry.appearance,
        device_class: entry.device_class,
        manufacturer_id,
        manufacturer_data,
        rssi,
        notes: None,
        device_type: None,
    };
    if let Err(err) = ctx.store.upsert_device(mac, attrs).await {
        debug!(target: "bleep::scan", mac, error = %err, "device upsert failed");
    }
    if let Err(err) = ctx.store.insert_adv(mac, ts, rssi, &[], &decoded).await {
        debug!(target: "bleep::scan", mac, error = %err, "adv insert failed");
    }
}

/// Run one discovery window, ingesting advertisement traffic until the
/// deadline. The signal subscription opens before discovery starts so no
/// early event is missed.
async fn discovery_window(
    ctx: &Arc<Context>,
    adapter: &Adapter,
    registry: &mut BTreeMap<String, DiscoveredDevice>,
    window: Duration,
    target: Option<&str>,
) -> Result<()> {
    let mut rx = ctx.bus.subscribe();
    adapter.start_discovery().await.context("start discovery")?;
    let deadline = tokio::time::Instant::now() + window;

    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            break;
        }
        let signal = tokio::select! {
            received = rx.recv() => received,
            _ = tokio::time::sleep(remaining) => break,
        };
        let Ok(signal) = signal else { continue };
        match signal {
            BusSignal::InterfacesAdded { path, interfaces } => {
                let Some(mac) = lib_bus::mac_from_path(&path) else {
                    continue;
                };
                if let Some(wanted) = target {
                    if !wanted.eq_ignore_ascii_case(&mac) {
                        continue;
                    }
                }
                if let Some(props) = interfaces.get(DEVICE_IFACE) {
                    ingest_device(ctx, registry, &mac, props).await;
                }
            }
            BusSignal::PropertiesChanged {
                path,
                interface,
                changed,
                ..
            } if interface == DEVICE_IFACE && changed.contains_key("RSSI") => {
                let Some(mac) = lib_bus::mac_from_path(&path) else {
                    continue;
                };
                if let Some(wanted) = target {
                    if !wanted.eq_ignore_ascii_case(&mac) {
                        continue;
                    }
                }
                ingest_device(ctx, registry, &mac, &changed).await;
            }
            _ => {}
        }
    }

    adapter.stop_discovery().await.context("stop discovery")?;
    Ok(())
}

async fn checked_adapter(ctx: &Arc<Context>) -> Result<Adapter> {
    let adapter = Adapter::new(ctx.clone());
    if !adapter.is_ready().await {
        anyhow::bail!("adapter {} is not powered", adapter.path());
    }
    Ok(adapter)
}

/// Stack-default scan: duplicates suppressed, one shot.
pub async fn passive_scan(ctx: &Arc<Context>, opts: &ScanOptions) -> Result<ScanReport> {
    let _adapter_guard = ctx.adapter_lock.lock().await;
    let adapter = checked_adapter(ctx).await?;
    adapter
        .set_discovery_filter(&DiscoveryFilter {
            transport: opts.transport,
            ..Default::default()
        })
        .await?;
    let mut registry = BTreeMap::new();
    discovery_window(ctx, &adapter, &mut registry, opts.timeout, opts.target.as_deref()).await?;
    info!(target: "bleep::scan", devices = registry.len(), "passive scan complete");
    Ok(ScanReport {
        devices: registry.into_values().collect(),
        cycles: 1,
    })
}

/// Same window as passive but every advertisement is forwarded.
pub async fn naggy_scan(ctx: &Arc<Context>, opts: &ScanOptions) -> Result<ScanReport> {
    let _adapter_guard = ctx.adapter_lock.lock().await;
    let adapter = checked_adapter(ctx).await?;
    adapter
        .set_discovery_filter(&DiscoveryFilter {
            transport: opts.transport,
            duplicate_data: Some(false),
            ..Default::default()
        })
        .await?;
    let mut registry = BTreeMap::new();
    discovery_window(ctx, &adapter, &mut registry, opts.timeout, opts.target.as_deref()).await?;
    Ok(ScanReport {
        devices: registry.into_values().collect(),
        cycles: 1,
    })
}

/// Rapid-fire discovery cycling. The stack flushes its advertisement cache
/// only at StopDiscovery; cycling forces repeated flushes and pokes
/// transient advertisers into view.
pub async fn pokey_scan(ctx: &Arc<Context>, opts: &ScanOptions) -> Result<ScanReport> {
    let _adapter_guard = ctx.adapter_lock.lock().await;
    let adapter = checked_adapter(ctx).await?;
    adapter
        .set_discovery_filter(&DiscoveryFilter {
            transport: opts.transport,
            duplicate_data: Some(false),
            address: opts.target.clone(),
            ..Default::default()
        })
        .await?;

    let deadline = tokio::time::Instant::now() + opts.timeout;
    let mut registry = BTreeMap::new();
    let mut cycles = 0u32;
    while tokio::time::Instant::now() < deadline {
        cycles += 1;
        debug!(target: "bleep::scan", cycle = cycles, "pokey discovery cycle");
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        let window = remaining.min(Duration::from_secs(1));
        discovery_window(ctx, &adapter, &mut registry, window, opts.target.as_deref()).await?;
    }
    info!(target: "bleep::scan", cycles, devices = registry.len(), "pokey scan complete");
    Ok(ScanReport {
        devices: registry.into_values().collect(),
        cycles,
    })
}

/// Loudest sweep: a BR/EDR inquiry phase, then an LE phase, half the budget
/// each.
pub async fn brute_scan(ctx: &Arc<Context>, opts: &ScanOptions) -> Result<ScanReport> {
    let _adapter_guard = ctx.adapter_lock.lock().await;
    let adapter = checked_adapter(ctx).await?;
    let half = (opts.timeout / 2).max(Duration::from_secs(1));
    let mut registry = BTreeMap::new();

    info!(target: "bleep::scan", "brute scan: BR/EDR inquiry phase");
    adapter
        .set_discovery_filter(&DiscoveryFilter {
            transport: Transport::Bredr,
            duplicate_data: Some(false),
            ..Default::default()
        })
        .await?;
    discovery_window(ctx, &adapter, &mut registry, half, opts.target.as_deref()).await?;

    info!(target: "bleep::scan", "brute scan: LE phase");
    adapter
        .set_discovery_filter(&DiscoveryFilter {
            transport: Transport::Le,
            duplicate_data: Some(false),
            ..Default::default()
        })
        .await?;
    discovery_window(ctx, &adapter, &mut registry, half, opts.target.as_deref()).await?;

    Ok(ScanReport {
        devices: registry.into_values().collect(),
        cycles: 2,
    })
}

/// Scan until a target becomes visible or attempts run out.
pub async fn scan_until_visible(
    ctx: &Arc<Context>,
    target: &str,
    max_attempts: u32,
    window: Duration,
    transport: Transport,
) -> Result<bool> {
    let target = target.to_ascii_lowercase();
    for attempt in 1..=max_attempts {
        debug!(
            target: "bleep::scan",
            attempt,
            max_attempts,
            mac = %target,
            "scanning for target"
        );
        let report = passive_scan(
            ctx,
            &ScanOptions {
                timeout: window,
                transport,
                target: Some(target.clone()),
            },
        )
        .await?;
        if report.devices.iter().any(|d| d.mac == target) {
            return Ok(true);
        }
    }
    Ok(false)
}
