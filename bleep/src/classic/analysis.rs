//! SDP record analysis.
//!
//! Derives the protocol set, a profile-version histogram, an inferred core
//! spec version with confidence, anomalies (for example a far newer profile
//! on an otherwise old device) and service relationship groups.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use crate::classic::sdp::SdpRecord;
use crate::classic::version::map_profile_version_to_spec;

#[derive(Debug, Clone, Serialize)]
pub struct SdpAnalysis {
    pub protocols: BTreeSet<String>,
    /// Profile UUID -> observed versions.
    pub profile_versions: BTreeMap<String, Vec<u16>>,
    pub inferred_spec: Option<String>,
    pub confidence: f64,
    pub anomalies: Vec<String>,
    /// Functional group -> member service names/UUIDs.
    pub groups: BTreeMap<String, Vec<String>>,
}

fn short_uuid(uuid: &str) -> Option<String> {
    if let Some(short) = uuid.strip_prefix("0x") {
        return Some(short.to_ascii_lowercase());
    }
    lib_ref::translate_uuid(uuid).ok().and_then(|t| t.short_form)
}

fn group_for(short: &str) -> Option<&'static str> {
    match short {
        "110a" | "110b" | "110c" | "110d" | "110e" | "110f" | "1203" => Some("audio"),
        "1108" | "1112" | "111e" | "111f" | "1109" | "1204" => Some("telephony"),
        "1105" | "1106" | "112e" | "112f" | "1130" | "1132" | "1133" | "1134" | "1104" => {
            Some("object-exchange")
        }
        "1115" | "1116" | "1117" | "1102" | "1103" => Some("networking"),
        "1124" | "1101" => Some("input-serial"),
        "1200" => Some("device-info"),
        _ => None,
    }
}

/// Profile version words older than this are treated as the 2.x era for
/// anomaly detection.
const MODERN_PROFILE_VERSION: u16 = 0x0104;

pub fn analyze_sdp_records(records: &[SdpRecord]) -> SdpAnalysis {
    let mut protocols = BTreeSet::new();
    let mut profile_versions: BTreeMap<String, Vec<u16>> = BTreeMap::new();
    let mut groups: BTreeMap<String, Vec<String>> = BTreeMap::new();

    for record in records {
        if record.channel.is_some() {
            protocols.insert("RFCOMM".to_string());
            protocols.insert("L2CAP".to_string());
        }
        if let Some(raw) = &record.raw {
            for proto in ["L2CAP", "RFCOMM", "OBEX", "BNEP", "AVDTP", "AVCTP", "ATT"] {
                if raw.contains(proto) {
                    protocols.insert(proto.to_string());
                }
            }
        }
        for (uuid, version) in &record.profiles {
            profile_versions
                .entry(uuid.clone())
                .or_default()
                .push(*version);
        }
        if let Some(uuid) = &record.uuid {
            if let Some(short) = short_uuid(uuid) {
                if let Some(group) = group_for(&short) {
                    let label = record
                        .name
                        .clone()
                        .unwrap_or_else(|| uuid.clone());
                    groups.entry(group.to_string()).or_default().push(label);
                }
            }
        }
    }

    // Inference: the newest profile version seen, weighted by how many
    // records agree.
    let all_versions: Vec<u16> = profile_versions.values().flatten().copied().collect();
    let (inferred_spec, confidence) = if all_versions.is_empty() {
        (None, 0.0)
    } else {
        let newest = *all_versions.iter().max().expect("non-empty");
        let agreeing = all_versions.iter().filter(|v| **v == newest).count();
        let confidence = (agreeing as f64 / all_versions.len() as f64).min(1.0);
        (map_profile_version_to_spec(Some(newest)), confidence)
    };

    // Anomalies: a single record far ahead of the rest of the device.
    let mut anomalies = Vec::new();
    if all_versions.len() >= 2 {
        let newest = *all_versions.iter().max().expect("non-empty");
        let oldest = *all_versions.iter().min().expect("non-empty");
        if newest >= MODERN_PROFILE_VERSION && oldest < 0x0102 {
            anomalies.push(format!(
                "profile version spread {}..{} suggests a retrofitted or spoofed record",
                map_profile_version_to_spec(Some(oldest)).unwrap_or_default(),
                map_profile_version_to_spec(Some(newest)).unwrap_or_default(),
            ));
        }
    }
    for record in records {
        if record.uuid.is_some() && record.channel.is_none() && record.name.is_none() {
            anomalies.push(format!(
                "record {} exposes neither a name nor an RFCOMM channel",
                record.uuid.as_deref().unwrap_or("?")
            ));
        }
    }

    SdpAnalysis {
        protocols,
        profile_versions,
        inferred_spec,
        confidence,
        anomalies,
        groups,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(uuid: &str, name: &str, channel: Option<u8>, profile: Option<(&str, u16)>) -> SdpRecord {
        SdpRecord {
            uuid: Some(uuid.to_string()),
            name: Some(name.to_string()),
            channel,
            profiles: profile.map(|(u, v)| vec![(u.to_string(), v)]).unwrap_or_default(),
            ..Default::default()
        }
    }

    #[test]
    fn groups_and_protocols_derived() {
        let records = vec![
            record("0x112f", "Phonebook Access PSE", Some(19), Some(("0x1130", 0x0102))),
            record("0x111f", "Handsfree AG", Some(3), Some(("0x111e", 0x0106))),
            record("0x110b", "Audio Sink", None, Some(("0x110d", 0x0103))),
        ];
        let analysis = analyze_sdp_records(&records);
        assert!(analysis.protocols.contains("RFCOMM"));
        assert!(analysis.groups["object-exchange"].contains(&"Phonebook Access PSE".to_string()));
        assert!(analysis.groups["telephony"].contains(&"Handsfree AG".to_string()));
        assert!(analysis.groups["audio"].contains(&"Audio Sink".to_string()));
    }

    #[test]
    fn version_inference_uses_newest_with_confidence() {
        let records = vec![
            record("0x112f", "PBAP", Some(19), Some(("0x1130", 0x0102))),
            record("0x111f", "HFP", Some(3), Some(("0x111e", 0x0102))),
        ];
        let analysis = analyze_sdp_records(&records);
        assert_eq!(analysis.inferred_spec.as_deref(), Some("1.2"));
        assert!((analysis.confidence - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn version_spread_is_an_anomaly() {
        let records = vec![
            record("0x1108", "Headset", Some(1), Some(("0x1108", 0x0100))),
            record("0x111f", "HFP AG", Some(3), Some(("0x111e", 0x0108))),
        ];
        let analysis = analyze_sdp_records(&records);
        assert!(!analysis.anomalies.is_empty());
    }

    #[test]
    fn empty_records_produce_empty_analysis() {
        let analysis = analyze_sdp_records(&[]);
        assert!(analysis.inferred_spec.is_none());
        assert!(analysis.protocols.is_empty());
        assert_eq!(analysis.confidence, 0.0);
    }
}
