//! Signal-capture configuration: filters, actions, routes.
//!
//! Configurations are persistent JSON documents under the signals directory;
//! a named config can be loaded, stored, renamed and deleted.

use std::path::{Path, PathBuf};

use lib_bus::IpcValue;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::signals::SignalEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalType {
    Notification,
    Indication,
    PropertyChange,
    Read,
    Write,
    Any,
}

impl SignalType {
    pub fn as_str(self) -> &'static str {
        match self {
            SignalType::Notification => "notification",
            SignalType::Indication => "indication",
            SignalType::PropertyChange => "property_change",
            SignalType::Read => "read",
            SignalType::Write => "write",
            SignalType::Any => "any",
        }
    }
}

/// All filter fields are optional and ANDed together.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SignalFilter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal_type: Option<SignalType>,
    /// Device MAC set; empty means any.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub device: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_uuid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub char_uuid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path_pattern: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub property_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value_pattern: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_value_length: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_value_length: Option<usize>,
}

fn value_len(value: &IpcValue) -> Option<usize> {
    match value {
        IpcValue::Bytes(b) => Some(b.len()),
        IpcValue::Str(s) => Some(s.len()),
        IpcValue::Array(items) => IpcValue::Array(items.clone()).to_byte_vec().map(|b| b.len()),
        _ => None,
    }
}

fn value_text(value: &IpcValue) -> String {
    match value {
        IpcValue::Bytes(b) => hex::encode(b),
        IpcValue::Str(s) => s.clone(),
        other => match other.to_byte_vec() {
            Some(bytes) => hex::encode(bytes),
            None => format!("{other:?}"),
        },
    }
}

impl SignalFilter {
    pub fn matches(&self, event: &SignalEvent) -> bool {
        if let Some(wanted) = self.signal_type {
            if wanted != SignalType::Any && wanted != event.signal_type {
                return false;
            }
        }
        if !self.device.is_empty() {
            match &event.device_mac {
                Some(mac) => {
                    if !self.device.iter().any(|d| d.eq_ignore_ascii_case(mac)) {
                        return false;
                    }
                }
                None => return false,
            }
        }
        if let Some(filter_uuid) = &self.service_uuid {
            match &event.service_uuid {
                Some(uuid) if uuids_equal(filter_uuid, uuid) => {}
                _ => return false,
            }
        }
        if let Some(filter_uuid) = &self.char_uuid {
            match &event.char_uuid {
                Some(uuid) if uuids_equal(filter_uuid, uuid) => {}
                _ => return false,
            }
        }
        if let Some(pattern) = &self.path_pattern {
            match Regex::new(pattern) {
                Ok(rx) if rx.is_match(&event.path) => {}
                _ => return false,
            }
        }
        if let Some(name) = &self.property_name {
            if event.property_name.as_deref() != Some(name.as_str()) {
                return false;
            }
        }
        if let Some(value) = &event.value {
            if let Some(pattern) = &self.value_pattern {
                match Regex::new(pattern) {
                    Ok(rx) if rx.is_match(&value_text(value)) => {}
                    _ => return false,
                }
            }
            if let Some(min) = self.min_value_length {
                if value_len(value).map(|len| len < min).unwrap_or(true) {
                    return false;
                }
            }
            if let Some(max) = self.max_value_length {
                if value_len(value).map(|len| len > max).unwrap_or(true) {
                    return false;
                }
            }
        } else if self.value_pattern.is_some()
            || self.min_value_length.is_some()
            || self.max_value_length.is_some()
        {
            return false;
        }
        true
    }
}

/// Short forms and full 128-bit forms compare equal.
fn uuids_equal(a: &str, b: &str) -> bool {
    if a.eq_ignore_ascii_case(b) {
        return true;
    }
    match (lib_ref::translate_uuid(a), lib_ref::translate_uuid(b)) {
        (Ok(ta), Ok(tb)) => ta.normalized_128 == tb.normalized_128,
        _ => false,
    }
}

/// One action to run when a route matches.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalAction {
    Log {
        #[serde(default = "default_log_level")]
        level: String,
    },
    Save {
        path: String,
        #[serde(default = "default_save_format")]
        format: SaveFormat,
    },
    Callback {
        name: String,
    },
    StoreInObservation,
    Forward {
        target: String,
    },
    Transform {
        name: String,
    },
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_save_format() -> SaveFormat {
    SaveFormat::Csv
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SaveFormat {
    Csv,
    Json,
}

impl SignalAction {
    /// Persistent actions are never dropped silently under back-pressure.
    pub fn is_persistent(&self) -> bool {
        matches!(
            self,
            SignalAction::StoreInObservation | SignalAction::Callback { .. }
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalRoute {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub filter: SignalFilter,
    pub actions: Vec<SignalAction>,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalCaptureConfig {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub routes: Vec<SignalRoute>,
}

impl SignalCaptureConfig {
    pub fn new(name: &str, description: &str) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            routes: Vec::new(),
        }
    }

    pub fn route(&self, name: &str) -> Option<&SignalRoute> {
        self.routes.iter().find(|r| r.name == name)
    }

    pub fn set_enabled(&mut self, name: &str, enabled: bool) -> bool {
        match self.routes.iter_mut().find(|r| r.name == name) {
            Some(route) => {
                route.enabled = enabled;
                true
            }
            None => false,
        }
    }

    pub fn remove_route(&mut self, name: &str) -> bool {
        let before = self.routes.len();
        self.routes.retain(|r| r.name != name);
        self.routes.len() < before
    }
}

/// Routes installed when the process starts: log all notifications, store
/// every read/write/notification, store device connection-state changes.
pub fn default_config() -> SignalCaptureConfig {
    SignalCaptureConfig {
        name: "default".to_string(),
        description: "Default capture routes".to_string(),
        routes: vec![
            SignalRoute {
                name: "log_all_notifications".to_string(),
                description: "Log every notification".to_string(),
                enabled: true,
                filter: SignalFilter {
                    signal_type: Some(SignalType::Notification),
                    ..Default::default()
                },
                actions: vec![SignalAction::Log {
                    level: "info".to_string(),
                }],
            },
            SignalRoute {
                name: "store_notifications".to_string(),
                description: "Persist notification values".to_string(),
                enabled: true,
                filter: SignalFilter {
                    signal_type: Some(SignalType::Notification),
                    ..Default::default()
                },
                actions: vec![SignalAction::StoreInObservation],
            },
            SignalRoute {
                name: "store_reads".to_string(),
                description: "Persist read values".to_string(),
                enabled: true,
                filter: SignalFilter {
                    signal_type: Some(SignalType::Read),
                    ..Default::default()
                },
                actions: vec![SignalAction::StoreInObservation],
            },
            SignalRoute {
                name: "store_writes".to_string(),
                description: "Persist written values".to_string(),
                enabled: true,
                filter: SignalFilter {
                    signal_type: Some(SignalType::Write),
                    ..Default::default()
                },
                actions: vec![SignalAction::StoreInObservation],
            },
            SignalRoute {
                name: "store_connection_state".to_string(),
                description: "Track device connection state".to_string(),
                enabled: true,
                filter: SignalFilter {
                    signal_type: Some(SignalType::PropertyChange),
                    property_name: Some("Connected".to_string()),
                    ..Default::default()
                },
                actions: vec![SignalAction::StoreInObservation],
            },
        ],
    }
}

// ---------------------------------------------------------------------------
// Persistence
// ---------------------------------------------------------------------------

fn config_path(dir: &Path, name: &str) -> PathBuf {
    let safe: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect();
    dir.join(format!("{safe}.json"))
}

pub fn save_config(dir: &Path, config: &SignalCaptureConfig) -> anyhow::Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let path = config_path(dir, &config.name);
    std::fs::write(&path, serde_json::to_string_pretty(config)?)?;
    Ok(path)
}

pub fn load_config(dir: &Path, name: &str) -> anyhow::Result<SignalCaptureConfig> {
    let path = config_path(dir, name);
    let raw = std::fs::read_to_string(&path)
        .map_err(|e| anyhow::anyhow!("signal config {}: {e}", path.display()))?;
    Ok(serde_json::from_str(&raw)?)
}

pub fn list_configs(dir: &Path) -> Vec<String> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut names: Vec<String> = entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            let name = entry.file_name().to_string_lossy().to_string();
            name.strip_suffix(".json").map(str::to_string)
        })
        .collect();
    names.sort();
    names
}

pub fn rename_config(dir: &Path, old: &str, new: &str) -> anyhow::Result<()> {
    let mut config = load_config(dir, old)?;
    config.name = new.to_string();
    save_config(dir, &config)?;
    std::fs::remove_file(config_path(dir, old))?;
    Ok(())
}

pub fn delete_config(dir: &Path, name: &str) -> anyhow::Result<()> {
    std::fs::remove_file(config_path(dir, name))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signals::SignalEvent;

    fn notification_event(mac: &str, value: Vec<u8>) -> SignalEvent {
        SignalEvent {
            signal_type: SignalType::Notification,
            path: format!(
                "/org/bluez/hci0/dev_{}/service0028/char002a",
                mac.to_uppercase().replace(':', "_")
            ),
            interface: None,
            property_name: None,
            value: Some(IpcValue::Bytes(value)),
            device_mac: Some(mac.to_string()),
            service_uuid: Some("0000180f-0000-1000-8000-00805f9b34fb".to_string()),
            char_uuid: Some("00002a19-0000-1000-8000-00805f9b34fb".to_string()),
            timestamp_ms: 0,
        }
    }

    #[test]
    fn filter_fields_are_anded() {
        let filter = SignalFilter {
            signal_type: Some(SignalType::Notification),
            device: vec!["AA:BB:CC:DD:EE:01".to_string()],
            service_uuid: Some("180f".to_string()),
            min_value_length: Some(1),
            ..Default::default()
        };
        let event = notification_event("aa:bb:cc:dd:ee:01", vec![0x64]);
        assert!(filter.matches(&event));

        let other = notification_event("aa:bb:cc:dd:ee:02", vec![0x64]);
        assert!(!filter.matches(&other));

        let empty = notification_event("aa:bb:cc:dd:ee:01", vec![]);
        assert!(!filter.matches(&empty));
    }

    #[test]
    fn value_regex_matches_hex_text() {
        let filter = SignalFilter {
            value_pattern: Some("^dead".to_string()),
            ..Default::default()
        };
        assert!(filter.matches(&notification_event("aa:bb:cc:dd:ee:01", vec![0xde, 0xad])));
        assert!(!filter.matches(&notification_event("aa:bb:cc:dd:ee:01", vec![0xbe, 0xef])));
    }

    #[test]
    fn config_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = default_config();
        config.name = "capture one".to_string();
        let path = save_config(dir.path(), &config).unwrap();
        assert!(path.ends_with("capture_one.json"));

        let loaded = load_config(dir.path(), "capture one").unwrap();
        assert_eq!(loaded.routes.len(), config.routes.len());
        assert!(list_configs(dir.path()).contains(&"capture_one".to_string()));

        rename_config(dir.path(), "capture one", "renamed").unwrap();
        assert!(load_config(dir.path(), "capture one").is_err());
        assert_eq!(load_config(dir.path(), "renamed").unwrap().name, "renamed");

        delete_config(dir.path(), "renamed").unwrap();
        assert!(list_configs(dir.path()).is_empty());
    }

    #[test]
    fn action_json_shape_matches_documented_format() {
        let action: SignalAction =
            serde_json::from_str(r#"{"type":"save","path":"out.csv","format":"csv"}"#).unwrap();
        assert_eq!(
            action,
            SignalAction::Save {
                path: "out.csv".to_string(),
                format: SaveFormat::Csv
            }
        );
        let action: SignalAction = serde_json::from_str(r#"{"type":"store_in_observation"}"#).unwrap();
        assert!(action.is_persistent());
    }
}
