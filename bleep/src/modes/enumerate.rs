//! Connect-and-enumerate orchestration.
//!
//! Joins the scan, connect, GATT enumeration and classification stages
//! under one per-variant policy: scan persistence, connect retries and the
//! service-resolution cap all escalate with the variant.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use tracing::{info, warn};

use crate::adapter::Transport;
use crate::classify::{ClassificationResult, ClassifyContext, DeviceTypeClassifier};
use crate::context::Context;
use crate::device::Device;
use crate::discovery::scan_until_visible;
use crate::gatt::{enumerate, EnumOptions, EnumVariant, EnumerationReport, PayloadSpec};
use crate::modes::scan::ScanMode;

struct VariantPolicy {
    scan_attempts: u32,
    scan_window: Duration,
    connect_retries: u32,
    resolve_cap: Duration,
}

fn policy_for(variant: EnumVariant) -> VariantPolicy {
    match variant {
        EnumVariant::Passive => VariantPolicy {
            scan_attempts: 1,
            scan_window: Duration::from_secs(5),
            connect_retries: 0,
            resolve_cap: Duration::from_secs(10),
        },
        EnumVariant::Naggy => VariantPolicy {
            scan_attempts: 5,
            scan_window: Duration::from_secs(8),
            connect_retries: 9,
            resolve_cap: Duration::from_secs(20),
        },
        EnumVariant::Pokey | EnumVariant::Brute => VariantPolicy {
            scan_attempts: 3,
            scan_window: Duration::from_secs(10),
            connect_retries: 5,
            resolve_cap: Duration::from_secs(30),
        },
    }
}

fn scan_mode_of(variant: EnumVariant) -> ScanMode {
    match variant {
        EnumVariant::Passive => ScanMode::Passive,
        EnumVariant::Naggy => ScanMode::Naggy,
        EnumVariant::Pokey => ScanMode::Pokey,
        EnumVariant::Brute => ScanMode::Brute,
    }
}

/// The §4.6 contract: locate, connect, resolve, enumerate, classify.
///
/// Returns the live device handle together with the enumeration report
/// (mapping, landmine map, permission map) and the classification derived
/// from the pass.
pub async fn connect_and_enumerate(
    ctx: &Arc<Context>,
    mac: &str,
    variant: EnumVariant,
    opts: &EnumOptions,
) -> Result<(Arc<Device>, EnumerationReport, ClassificationResult)> {
    let mac = mac.trim().to_ascii_lowercase();
    let policy = policy_for(variant);

    let visible = scan_until_visible(
        ctx,
        &mac,
        policy.scan_attempts,
        policy.scan_window,
        Transport::Auto,
    )
    .await?;
    if !visible {
        anyhow::bail!("device {mac} not found during discovery");
    }

    let device = Device::new(ctx.clone(), &mac);
    if let Err(err) = device.connect(policy.connect_retries).await {
        // A recoverable transport failure gets one trip through the staged
        // pipeline before the orchestrator gives up.
        if err.is_recoverable() {
            warn!(target: "bleep::modes", mac = %mac, error = %err, "connect failed; running recovery");
            device
                .recover()
                .await
                .with_context(|| format!("recovery after failed connect to {mac}"))?;
        } else {
            return Err(err).with_context(|| format!("connect to {mac}"));
        }
    }

    if !device.wait_services_resolved(policy.resolve_cap).await? {
        anyhow::bail!("services did not resolve for {mac} within {:?}", policy.resolve_cap);
    }

    let report = enumerate(&device, variant, opts).await?;

    let classify_context = ClassifyContext {
        device_class: device.device_class().await,
        address_type: device.address_type().await,
        uuids: device.uuids().await,
        has_advertising_data: false,
        connected: device.is_connected().await.unwrap_or(false),
        gatt_service_count: Some(report.mapping.services.len()),
        sdp_record_count: None,
    };
    let classification = DeviceTypeClassifier::new()
        .classify_with_mode(ctx, &mac, &classify_context, scan_mode_of(variant), true)
        .await;

    info!(
        target: "bleep::modes",
        mac = %mac,
        variant = variant.as_str(),
        services = report.mapping.services.len(),
        device_type = classification.device_type.as_str(),
        "connect-and-enumerate finished"
    );
    Ok((device, report, classification))
}

/// Passive tier: structure and one read of every readable.
pub async fn passive_enum(
    ctx: &Arc<Context>,
    mac: &str,
) -> Result<(Arc<Device>, EnumerationReport, ClassificationResult)> {
    connect_and_enumerate(ctx, mac, EnumVariant::Passive, &EnumOptions::default()).await
}

/// Naggy tier: multi-round reads with per-round diffs.
pub async fn naggy_enum(
    ctx: &Arc<Context>,
    mac: &str,
    rounds: u32,
) -> Result<(Arc<Device>, EnumerationReport, ClassificationResult)> {
    let opts = EnumOptions {
        rounds,
        ..Default::default()
    };
    connect_and_enumerate(ctx, mac, EnumVariant::Naggy, &opts).await
}

/// Pokey tier: hint-free reads plus 0x00/0x01 write probes.
pub async fn pokey_enum(
    ctx: &Arc<Context>,
    mac: &str,
    verify: bool,
) -> Result<(Arc<Device>, EnumerationReport, ClassificationResult)> {
    let opts = EnumOptions {
        verify,
        deep: true,
        ..Default::default()
    };
    connect_and_enumerate(ctx, mac, EnumVariant::Pokey, &opts).await
}

/// Brute tier: payload iteration over one characteristic or every
/// writable.
#[allow(clippy::too_many_arguments)]
pub async fn brute_enum(
    ctx: &Arc<Context>,
    mac: &str,
    write_target: &str,
    payload_spec: &PayloadSpec,
    verify: bool,
    force: bool,
    deep: bool,
) -> Result<(Arc<Device>, EnumerationReport, ClassificationResult)> {
    let opts = EnumOptions {
        deep,
        force,
        verify,
        write_target: Some(write_target.to_string()),
        payloads: crate::gatt::build_payload_iterator(payload_spec),
        ..Default::default()
    };
    connect_and_enumerate(ctx, mac, EnumVariant::Brute, &opts).await
}
