//! Signal capture and routing.
//!
//! Property-change and notification traffic from the bus, plus read/write
//! events from the GATT engine, all flow through one router: filters select,
//! actions log, persist, forward or transform.

pub mod config;
pub mod integration;
pub mod router;

pub use config::{
    default_config, delete_config, list_configs, load_config, rename_config, save_config,
    SaveFormat, SignalAction, SignalCaptureConfig, SignalFilter, SignalRoute, SignalType,
};
pub use integration::attach_router;
pub use router::SignalRouter;

use lib_bus::IpcValue;

/// One routable event.
#[derive(Debug, Clone)]
pub struct SignalEvent {
    pub signal_type: SignalType,
    pub path: String,
    pub interface: Option<String>,
    pub property_name: Option<String>,
    pub value: Option<IpcValue>,
    pub device_mac: Option<String>,
    pub service_uuid: Option<String>,
    pub char_uuid: Option<String>,
    pub timestamp_ms: i64,
}

impl SignalEvent {
    pub fn new(signal_type: SignalType, path: &str) -> Self {
        Self {
            signal_type,
            path: path.to_string(),
            interface: None,
            property_name: None,
            value: None,
            device_mac: lib_bus::mac_from_path(path),
            service_uuid: None,
            char_uuid: None,
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn with_value(mut self, value: IpcValue) -> Self {
        self.value = Some(value);
        self
    }

    pub fn with_identity(mut self, mac: &str, service_uuid: &str, char_uuid: &str) -> Self {
        self.device_mac = Some(mac.to_ascii_lowercase());
        self.service_uuid = Some(service_uuid.to_ascii_lowercase());
        self.char_uuid = Some(char_uuid.to_ascii_lowercase());
        self
    }
}
