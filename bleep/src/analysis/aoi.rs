//! Asset-of-Interest analysis.
//!
//! Aggregates everything the store knows about one device into a
//! security-oriented report: concerns, unusual characteristics, notable
//! services and recommendations. Snapshots land under the AoI directory
//! and in the store's analysis table.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use chrono::Utc;
use serde::Serialize;
use tracing::info;

use crate::context::Context;

#[derive(Debug, Clone, Serialize)]
pub struct AoiReport {
    pub mac: String,
    pub timestamp: i64,
    pub device_type: String,
    pub security_concerns: Vec<String>,
    pub unusual_characteristics: Vec<String>,
    pub notable_services: Vec<String>,
    pub recommendations: Vec<String>,
}

fn note_service(short: &str, name: &str) -> Option<String> {
    match short {
        "1812" => Some(format!("{name}: HID surface, input injection candidate")),
        "1101" => Some(format!("{name}: raw serial channel exposed")),
        "180f" => Some(format!("{name}: battery telemetry readable")),
        "1826" | "1816" | "180d" => Some(format!("{name}: fitness/health telemetry")),
        "112f" | "1130" => Some(format!("{name}: phonebook access server")),
        "1132" => Some(format!("{name}: message access server")),
        _ => None,
    }
}

/// Analyse one device from the observation store.
pub async fn analyse_device(ctx: &Arc<Context>, mac: &str) -> Result<AoiReport> {
    let detail = ctx
        .store
        .get_device_detail(mac)
        .await?
        .with_context(|| format!("{mac} has no observations to analyse"))?;

    let mut security_concerns = Vec::new();
    let mut unusual_characteristics = Vec::new();
    let mut notable_services = Vec::new();
    let mut recommendations = Vec::new();

    // Service-level notes from both stacks.
    for service in &detail.services {
        if let Some(identity) = lib_ref::identify_uuid(&service.uuid) {
            if let Some(note) = note_service(&identity.short_form, &identity.name) {
                notable_services.push(note);
            }
        }
    }
    for classic in &detail.classic_services {
        if let Some(identity) = lib_ref::identify_uuid(&classic.uuid) {
            if let Some(note) = note_service(&identity.short_form, &identity.name) {
                notable_services.push(note);
            }
        }
    }

    // Characteristic-level heuristics.
    let mut auth_walls = 0usize;
    for chr in &detail.characteristics {
        let flags: Vec<&str> = chr
            .properties
            .as_deref()
            .map(|p| p.split(',').collect())
            .unwrap_or_default();
        let permission_map: BTreeMap<String, String> = chr
            .permission_map
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or_default();

        let writable = flags
            .iter()
            .any(|f| matches!(*f, "write" | "write-without-response"));
        let write_walled = permission_map
            .get("write")
            .map(|kind| kind.starts_with("Not"))
            .unwrap_or(false);
        if writable && !write_walled {
            security_concerns.push(format!(
                "{} accepts writes without an observed authorisation wall",
                chr.uuid
            ));
        }
        auth_walls += permission_map
            .values()
            .filter(|kind| kind.as_str() == "NotAuthorized" || kind.as_str() == "NotPermitted")
            .count();

        if flags.is_empty() {
            unusual_characteristics.push(format!("{} advertises no property flags", chr.uuid));
        }
        if lib_ref::translate_uuid(&chr.uuid)
            .ok()
            .map(|t| t.short_form.is_none())
            .unwrap_or(false)
            && flags.iter().any(|f| *f == "notify")
        {
            unusual_characteristics.push(format!(
                "{} vendor-specific characteristic with notifications",
                chr.uuid
            ));
        }
    }

    if detail.device.device_type == "dual" {
        notable_services
            .push("dual-mode device: both Classic and LE attack surfaces present".to_string());
    }

    // Recommendations follow from what was observed.
    if auth_walls > 0 {
        recommendations.push(format!(
            "{auth_walls} authorisation wall(s) observed: pair/bond before the next pass"
        ));
    }
    if security_concerns.iter().any(|c| c.contains("accepts writes")) {
        recommendations
            .push("exercise writable characteristics with the brute tier and verify reads".to_string());
    }
    if !detail.classic_services.is_empty() && detail.pbap_metadata.is_empty() {
        recommendations
            .push("classic services present: attempt a PBAP pull for contact exposure".to_string());
    }
    if recommendations.is_empty() {
        recommendations.push("no immediate follow-up indicated".to_string());
    }

    let report = AoiReport {
        mac: detail.device.mac.clone(),
        timestamp: Utc::now().timestamp_millis(),
        device_type: detail.device.device_type.clone(),
        security_concerns,
        unusual_characteristics,
        notable_services,
        recommendations,
    };

    // Persist: store row and a JSON snapshot under the AoI directory.
    ctx.store
        .store_aoi_analysis(
            mac,
            &serde_json::to_value(&report.security_concerns)?,
            &serde_json::to_value(&report.unusual_characteristics)?,
            &serde_json::to_value(&report.notable_services)?,
            &serde_json::to_value(&report.recommendations)?,
        )
        .await?;
    let aoi_dir = ctx.config.aoi_dir();
    std::fs::create_dir_all(&aoi_dir)?;
    let snapshot = aoi_dir.join(format!("{}.json", report.mac.replace(':', "")));
    std::fs::write(&snapshot, serde_json::to_string_pretty(&report)?)?;
    info!(
        target: "bleep::aoi",
        mac = %report.mac,
        concerns = report.security_concerns.len(),
        snapshot = %snapshot.display(),
        "AoI analysis stored"
    );
    Ok(report)
}
