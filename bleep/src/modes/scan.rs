//! Scan-mode orchestration.
//!
//! Drives the discovery variants and runs passive-tier classification over
//! everything that surfaced.

use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::classify::{ClassificationResult, ClassifyContext, DeviceTypeClassifier};
use crate::context::Context;
use crate::discovery::{self, DiscoveredDevice, ScanOptions, ScanReport};

/// The four reconnaissance tiers. Identical kernel, escalating policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanMode {
    Passive,
    Naggy,
    Pokey,
    Brute,
}

impl ScanMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ScanMode::Passive => "passive",
            ScanMode::Naggy => "naggy",
            ScanMode::Pokey => "pokey",
            ScanMode::Brute => "brute",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s.trim().to_ascii_lowercase().as_str() {
            "passive" => ScanMode::Passive,
            "naggy" => ScanMode::Naggy,
            "pokey" => ScanMode::Pokey,
            "brute" | "bruteforce" => ScanMode::Brute,
            _ => return None,
        })
    }
}

/// One scanned device plus its passive classification.
#[derive(Debug, Clone, Serialize)]
pub struct ScanSummary {
    pub device: DiscoveredDevice,
    pub classification: ClassificationResult,
}

fn classify_context_for(device: &DiscoveredDevice) -> ClassifyContext {
    ClassifyContext {
        device_class: device.device_class.map(|c| c as u32),
        address_type: device.addr_type.clone(),
        uuids: device.uuids.clone(),
        has_advertising_data: device.adv_count > 0,
        connected: false,
        gatt_service_count: None,
        sdp_record_count: None,
    }
}

/// Run one scan mode and classify the results from advertisement-tier
/// evidence.
pub async fn scan_with_mode(
    ctx: &Arc<Context>,
    mode: ScanMode,
    opts: &ScanOptions,
) -> Result<Vec<ScanSummary>> {
    info!(target: "bleep::modes", mode = mode.as_str(), "scan starting");
    let report: ScanReport = match mode {
        ScanMode::Passive => discovery::passive_scan(ctx, opts).await?,
        ScanMode::Naggy => discovery::naggy_scan(ctx, opts).await?,
        ScanMode::Pokey => discovery::pokey_scan(ctx, opts).await?,
        ScanMode::Brute => discovery::brute_scan(ctx, opts).await?,
    };

    let classifier = DeviceTypeClassifier::new();
    let mut summaries = Vec::new();
    for device in report.devices {
        let context = classify_context_for(&device);
        let classification = classifier
            .classify_with_mode(ctx, &device.mac, &context, mode, true)
            .await;
        summaries.push(ScanSummary {
            device,
            classification,
        });
    }
    info!(
        target: "bleep::modes",
        mode = mode.as_str(),
        devices = summaries.len(),
        "scan finished"
    );
    Ok(summaries)
}
