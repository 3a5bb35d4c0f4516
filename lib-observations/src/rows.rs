//! Typed rows and write inputs for the observation store.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Classification cached on the device row. Derived data, never a source of
/// classification evidence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Unknown,
    Classic,
    Le,
    Dual,
}

impl DeviceType {
    pub fn as_str(self) -> &'static str {
        match self {
            DeviceType::Unknown => "unknown",
            DeviceType::Classic => "classic",
            DeviceType::Le => "le",
            DeviceType::Dual => "dual",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "classic" => DeviceType::Classic,
            "le" => DeviceType::Le,
            "dual" => DeviceType::Dual,
            _ => DeviceType::Unknown,
        }
    }

    /// Evidence strength ordering used by the stronger-evidence-only rule.
    pub fn rank(self) -> u8 {
        match self {
            DeviceType::Unknown => 0,
            DeviceType::Classic | DeviceType::Le => 1,
            DeviceType::Dual => 2,
        }
    }
}

/// Where a characteristic history value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistorySource {
    Read,
    Write,
    Notification,
    Unknown,
}

impl HistorySource {
    pub fn as_str(self) -> &'static str {
        match self {
            HistorySource::Read => "read",
            HistorySource::Write => "write",
            HistorySource::Notification => "notification",
            HistorySource::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "read" => HistorySource::Read,
            "write" => HistorySource::Write,
            "notification" => HistorySource::Notification,
            _ => HistorySource::Unknown,
        }
    }
}

/// Evidence weight stored alongside each classification signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvidenceWeight {
    Conclusive,
    Strong,
    Weak,
    Inconclusive,
}

impl EvidenceWeight {
    pub fn as_str(self) -> &'static str {
        match self {
            EvidenceWeight::Conclusive => "conclusive",
            EvidenceWeight::Strong => "strong",
            EvidenceWeight::Weak => "weak",
            EvidenceWeight::Inconclusive => "inconclusive",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "conclusive" => EvidenceWeight::Conclusive,
            "strong" => EvidenceWeight::Strong,
            "weak" => EvidenceWeight::Weak,
            _ => EvidenceWeight::Inconclusive,
        }
    }
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct DeviceRow {
    pub mac: String,
    pub addr_type: Option<String>,
    pub name: Option<String>,
    pub appearance: Option<i64>,
    pub device_class: Option<i64>,
    pub manufacturer_id: Option<i64>,
    pub manufacturer_data: Option<Vec<u8>>,
    pub rssi_last: Option<i64>,
    pub rssi_min: Option<i64>,
    pub rssi_max: Option<i64>,
    pub first_seen: i64,
    pub last_seen: i64,
    pub notes: Option<String>,
    pub device_type: String,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct AdvReportRow {
    pub id: i64,
    pub mac: String,
    pub ts: i64,
    pub rssi: Option<i64>,
    pub data: Option<Vec<u8>>,
    pub decoded: Option<String>,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct ServiceRow {
    pub id: i64,
    pub mac: String,
    pub uuid: String,
    pub handle_start: Option<i64>,
    pub handle_end: Option<i64>,
    pub name: Option<String>,
    pub first_seen: i64,
    pub last_seen: i64,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct CharacteristicRow {
    pub id: i64,
    pub service_id: i64,
    pub uuid: String,
    pub handle: Option<i64>,
    pub properties: Option<String>,
    pub value: Option<Vec<u8>>,
    pub last_read: Option<i64>,
    pub permission_map: Option<String>,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct DescriptorRow {
    pub id: i64,
    pub characteristic_id: i64,
    pub uuid: String,
    pub value: Option<Vec<u8>>,
    pub ts: i64,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct CharHistoryRow {
    pub id: i64,
    pub mac: String,
    pub service_uuid: String,
    pub char_uuid: String,
    pub ts: i64,
    pub value: Option<Vec<u8>>,
    pub source: String,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct ClassicServiceRow {
    pub id: i64,
    pub mac: String,
    pub uuid: String,
    pub channel: Option<i64>,
    pub name: Option<String>,
    pub handle: Option<i64>,
    pub profiles: Option<String>,
    pub version: Option<i64>,
    pub description: Option<String>,
    pub ts: i64,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct PbapMetadataRow {
    pub id: i64,
    pub mac: String,
    pub repo: String,
    pub entries: i64,
    pub hash: String,
    pub ts: i64,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct EvidenceRow {
    pub id: i64,
    pub mac: String,
    pub evidence_type: String,
    pub weight: String,
    pub source: String,
    pub value: Option<String>,
    pub metadata: Option<String>,
    pub ts: i64,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct AoiAnalysisRow {
    pub mac: String,
    pub analysis_timestamp: i64,
    pub security_concerns: Option<String>,
    pub unusual_characteristics: Option<String>,
    pub notable_services: Option<String>,
    pub recommendations: Option<String>,
}

// ---------------------------------------------------------------------------
// Write inputs
// ---------------------------------------------------------------------------

/// Partial device attributes for an upsert; absent fields keep their stored
/// values.
#[derive(Debug, Clone, Default)]
pub struct DeviceAttrs {
    pub addr_type: Option<String>,
    pub name: Option<String>,
    pub appearance: Option<i64>,
    pub device_class: Option<i64>,
    pub manufacturer_id: Option<i64>,
    pub manufacturer_data: Option<Vec<u8>>,
    pub rssi: Option<i64>,
    pub notes: Option<String>,
    pub device_type: Option<DeviceType>,
}

/// Handle input accepted in both shapes the enumerator produces.
#[derive(Debug, Clone)]
pub enum HandleInput {
    Int(i64),
    Hex(String),
}

impl HandleInput {
    pub fn to_int(&self) -> Option<i64> {
        match self {
            HandleInput::Int(v) => Some(*v),
            HandleInput::Hex(s) => {
                let trimmed = s.trim().trim_start_matches("0x").trim_start_matches("0X");
                i64::from_str_radix(trimmed, 16).ok()
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServiceInput {
    pub uuid: String,
    pub handle_start: Option<HandleInput>,
    pub handle_end: Option<HandleInput>,
    pub name: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CharacteristicInput {
    pub uuid: String,
    pub handle: Option<HandleInput>,
    pub properties: Vec<String>,
    pub value: Option<Vec<u8>>,
    pub permission_map: Option<serde_json::Value>,
}

#[derive(Debug, Clone)]
pub struct DescriptorInput {
    pub uuid: String,
    pub value: Option<Vec<u8>>,
}

#[derive(Debug, Clone)]
pub struct ClassicServiceInput {
    pub uuid: String,
    pub channel: Option<i64>,
    pub name: Option<String>,
    pub handle: Option<i64>,
    pub profiles: Vec<(String, u16)>,
    pub version: Option<i64>,
    pub description: Option<String>,
}

#[derive(Debug, Clone)]
pub struct EvidenceInput {
    pub evidence_type: String,
    pub weight: EvidenceWeight,
    pub source: String,
    pub value: Option<serde_json::Value>,
    pub metadata: Option<serde_json::Value>,
}

/// Aggregated per-device view for exports and the AoI analyser.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceDetail {
    pub device: DeviceRow,
    pub services: Vec<ServiceRow>,
    pub characteristics: Vec<CharacteristicRow>,
    pub classic_services: Vec<ClassicServiceRow>,
    pub pbap_metadata: Vec<PbapMetadataRow>,
    pub evidence: Vec<EvidenceRow>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_input_accepts_hex_and_int() {
        assert_eq!(HandleInput::Int(0x2a).to_int(), Some(42));
        assert_eq!(HandleInput::Hex("0x2a".into()).to_int(), Some(42));
        assert_eq!(HandleInput::Hex("002A".into()).to_int(), Some(42));
        assert_eq!(HandleInput::Hex("not-hex".into()).to_int(), None);
    }

    #[test]
    fn device_type_rank_ordering() {
        assert!(DeviceType::Dual.rank() > DeviceType::Le.rank());
        assert_eq!(DeviceType::Classic.rank(), DeviceType::Le.rank());
        assert!(DeviceType::Unknown.rank() < DeviceType::Classic.rank());
    }
}
