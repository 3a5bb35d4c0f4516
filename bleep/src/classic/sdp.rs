//! SDP service discovery.
//!
//! Two flavours: full discovery through the device's service-record call,
//! and connectionless discovery that runs a reachability pre-check first
//! (SDP itself does not need a full connection). When the native record
//! call produces nothing, the textual output of the external SDP tool is
//! parsed instead.

use std::sync::Arc;

use lib_bus::{BusError, BusResult, IpcValue, OpClass};
use lib_observations::ClassicServiceInput;
use regex::Regex;
use serde::Serialize;
use tracing::{debug, info};

use crate::classic::tools::ClassicTools;
use crate::device::Device;

/// One parsed SDP record.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SdpRecord {
    pub uuid: Option<String>,
    pub name: Option<String>,
    pub channel: Option<u8>,
    pub handle: Option<u32>,
    pub profiles: Vec<(String, u16)>,
    pub version: Option<u16>,
    pub description: Option<String>,
    /// Source block for reference when parsed from tool output.
    pub raw: Option<String>,
}

fn record_from_dict(dict: &std::collections::BTreeMap<String, IpcValue>) -> SdpRecord {
    let profiles = dict
        .get("Profiles")
        .and_then(IpcValue::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| {
                    let profile = item.as_dict()?;
                    let uuid = profile.get("Uuid")?.as_str()?.to_ascii_lowercase();
                    let version = profile.get("Version")?.as_u16()?;
                    Some((uuid, version))
                })
                .collect()
        })
        .unwrap_or_default();
    SdpRecord {
        uuid: dict
            .get("Uuid")
            .and_then(IpcValue::as_str)
            .map(|s| s.to_ascii_lowercase()),
        name: dict.get("Name").and_then(IpcValue::as_str).map(str::to_string),
        channel: dict.get("Channel").and_then(|v| match v {
            IpcValue::U8(c) => Some(*c),
            other => other.as_u16().map(|c| c as u8),
        }),
        handle: dict.get("Handle").and_then(IpcValue::as_u32),
        profiles,
        version: dict.get("Version").and_then(IpcValue::as_u16),
        description: dict
            .get("Description")
            .and_then(IpcValue::as_str)
            .map(str::to_string),
        raw: None,
    }
}

/// Full SDP through the device's service-record call, with textual
/// fallback through `tools` when it yields nothing.
pub async fn discover_services_sdp(
    device: &Arc<Device>,
    tools: &dyn ClassicTools,
) -> BusResult<Vec<SdpRecord>> {
    let proxy = device.proxy().await?;
    let native = match proxy
        .call_as(OpClass::Default, "GetServiceRecords", vec![])
        .await
    {
        Ok(reply) => reply
            .as_array()
            .map(|records| {
                records
                    .iter()
                    .filter_map(IpcValue::as_dict)
                    .map(record_from_dict)
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default(),
        Err(BusError::NotSupported(_)) | Err(BusError::UnknownObject(_)) => Vec::new(),
        Err(err) => {
            debug!(target: "bleep::classic", mac = %device.mac(), error = %err, "native SDP failed");
            Vec::new()
        }
    };
    if !native.is_empty() {
        info!(
            target: "bleep::classic",
            mac = %device.mac(),
            records = native.len(),
            "native SDP records"
        );
        persist_records(device, &native).await;
        return Ok(native);
    }

    // Fallback: parse the external tool's output.
    let text = tools
        .sdp_browse(device.mac(), 30)
        .await
        .map_err(BusError::Failed)?;
    let parsed = parse_sdp_tool_output(&text);
    if parsed.is_empty() {
        return Err(BusError::Failed("no SDP records discovered".to_string()));
    }
    persist_records(device, &parsed).await;
    Ok(parsed)
}

/// Connectionless SDP: reachability ping first (default 3 probes inside a
/// 13 s cap), then discovery. A ping failure aborts early with a clearer
/// error than the SDP layer would produce.
pub async fn discover_services_sdp_connectionless(
    device: &Arc<Device>,
    tools: &dyn ClassicTools,
) -> BusResult<Vec<SdpRecord>> {
    match tools.l2ping(device.mac(), 3, 13).await {
        Ok(stats) => {
            debug!(
                target: "bleep::classic",
                mac = %device.mac(),
                rtt_ms = stats.rtt_avg_ms,
                "target reachable"
            );
        }
        Err(cause) => {
            return Err(BusError::DeviceUnreachable(format!(
                "{} did not answer the reachability ping: {cause}",
                device.mac()
            )));
        }
    }
    discover_services_sdp(device, tools).await
}

async fn persist_records(device: &Arc<Device>, records: &[SdpRecord]) {
    let inputs: Vec<ClassicServiceInput> = records
        .iter()
        .filter_map(|record| {
            record.uuid.as_ref().map(|uuid| ClassicServiceInput {
                uuid: uuid.clone(),
                channel: record.channel.map(i64::from),
                name: record.name.clone(),
                handle: record.handle.map(i64::from),
                profiles: record.profiles.clone(),
                version: record.version.map(i64::from),
                description: record.description.clone(),
            })
        })
        .collect();
    if inputs.is_empty() {
        return;
    }
    if let Err(err) = device
        .ctx
        .store
        .upsert_classic_services(device.mac(), &inputs)
        .await
    {
        debug!(target: "bleep::classic", error = %err, "classic service persist failed");
        device.ctx.metrics.increment_counter("store.write_failures");
    }
}

// ---------------------------------------------------------------------------
// Tool-output parsing
// ---------------------------------------------------------------------------

/// Parse the block-structured text an SDP browse emits. Blocks are split on
/// blank lines; each yields at most one record.
pub fn parse_sdp_tool_output(output: &str) -> Vec<SdpRecord> {
    let name_rx = Regex::new(r"(?m)^Service Name:\s*(.*)$").expect("static regex");
    let uuid128_rx = Regex::new(r"UUID.*?([0-9a-fA-F-]{36})").expect("static regex");
    let uuid16_rx = Regex::new(r"\(0x([0-9A-Fa-f]{4})\)").expect("static regex");
    let channel_rx =
        Regex::new(r"Channel(?:/Port)?[^:]*:\s*(0x[0-9A-Fa-f]+|\d+)").expect("static regex");
    let handle_rx =
        Regex::new(r"Service RecHandle:\s*0x([0-9A-Fa-f]+)").expect("static regex");
    let profile_rx = Regex::new(r#""([^"]+)"\s*\(0x([0-9A-Fa-f]{4})\)[\s\S]{0,80}?Version:\s*0x([0-9A-Fa-f]{4})"#)
        .expect("static regex");

    let mut records = Vec::new();
    for block in output.split("\n\n") {
        if block.trim().is_empty() {
            continue;
        }
        let uuid = uuid128_rx
            .captures(block)
            .map(|c| c[1].to_ascii_lowercase())
            .or_else(|| {
                uuid16_rx
                    .captures(block)
                    .map(|c| format!("0x{}", c[1].to_ascii_lowercase()))
            });
        let channel = channel_rx.captures(block).and_then(|c| {
            let raw = &c[1];
            if let Some(hex) = raw.strip_prefix("0x") {
                u8::from_str_radix(hex, 16).ok()
            } else {
                raw.parse().ok()
            }
        });
        if uuid.is_none() && channel.is_none() {
            continue;
        }
        let profiles: Vec<(String, u16)> = profile_rx
            .captures_iter(block)
            .filter_map(|caps| {
                let uuid = format!("0x{}", caps[2].to_ascii_lowercase());
                u16::from_str_radix(&caps[3], 16).ok().map(|v| (uuid, v))
            })
            .collect();
        records.push(SdpRecord {
            uuid,
            name: name_rx.captures(block).map(|c| c[1].trim().to_string()),
            channel,
            handle: handle_rx
                .captures(block)
                .and_then(|c| u32::from_str_radix(&c[1], 16).ok()),
            version: profiles.first().map(|(_, v)| *v),
            profiles,
            description: None,
            raw: Some(block.trim().to_string()),
        });
    }
    records
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"Service Name: Phonebook Access PSE
Service RecHandle: 0x1000b
Service Class ID List:
  "Phonebook Access - PSE" (0x112f)
Protocol Descriptor List:
  "L2CAP" (0x0100)
  "RFCOMM" (0x0003)
    Channel: 19
Profile Descriptor List:
  "Phonebook Access" (0x1130)
    Version: 0x0102

Service Name: Headset Gateway
Service RecHandle: 0x10020
Service Class ID List:
  "Headset Audio Gateway" (0x1112)
Protocol Descriptor List:
  "RFCOMM" (0x0003)
    Channel/Port (Integer) : 0x2
Profile Descriptor List:
  "Headset" (0x1108)
    Version: 0x0102
"#;

    #[test]
    fn parses_name_uuid_channel_and_profiles() {
        let records = parse_sdp_tool_output(SAMPLE);
        assert_eq!(records.len(), 2);

        let pbap = &records[0];
        assert_eq!(pbap.name.as_deref(), Some("Phonebook Access PSE"));
        assert_eq!(pbap.uuid.as_deref(), Some("0x112f"));
        assert_eq!(pbap.channel, Some(19));
        assert_eq!(pbap.handle, Some(0x1000b));
        assert!(pbap.profiles.iter().any(|(u, v)| u == "0x1130" && *v == 0x0102));

        let hsp = &records[1];
        assert_eq!(hsp.channel, Some(2));
        assert_eq!(hsp.uuid.as_deref(), Some("0x1112"));
    }

    #[test]
    fn empty_output_yields_no_records() {
        assert!(parse_sdp_tool_output("\n\n").is_empty());
        assert!(parse_sdp_tool_output("Failed to connect").is_empty());
    }
}
