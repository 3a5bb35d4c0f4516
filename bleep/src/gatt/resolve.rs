//! GATT tree resolution.
//!
//! Walks the object tree under a device path and classifies children by
//! declared interface into tagged node kinds. The result is an arena:
//! services own characteristics by value, characteristics own descriptors,
//! children refer to parents by index only.

use std::collections::HashMap;

use lib_bus::{
    BusError, BusResult, BusTransport, InterfaceMap, IpcValue, BLUEZ_SERVICE,
    GATT_CHARACTERISTIC_IFACE, GATT_DESCRIPTOR_IFACE, GATT_SERVICE_IFACE, MEDIA_PLAYER_IFACE,
    MEDIA_TRANSPORT_IFACE,
};
use serde::Serialize;

use crate::device::Device;

/// Node classification by declared interface set, not nominal type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Adapter,
    Device,
    Service,
    Characteristic,
    Descriptor,
    MediaPlayer,
    MediaTransport,
    Unknown,
}

pub fn classify_node(interfaces: &InterfaceMap) -> NodeKind {
    if interfaces.contains_key(GATT_SERVICE_IFACE) {
        NodeKind::Service
    } else if interfaces.contains_key(GATT_CHARACTERISTIC_IFACE) {
        NodeKind::Characteristic
    } else if interfaces.contains_key(GATT_DESCRIPTOR_IFACE) {
        NodeKind::Descriptor
    } else if interfaces.contains_key(lib_bus::transport::DEVICE_IFACE) {
        NodeKind::Device
    } else if interfaces.contains_key(lib_bus::transport::ADAPTER_IFACE) {
        NodeKind::Adapter
    } else if interfaces.contains_key(MEDIA_PLAYER_IFACE) {
        NodeKind::MediaPlayer
    } else if interfaces.contains_key(MEDIA_TRANSPORT_IFACE) {
        NodeKind::MediaTransport
    } else {
        NodeKind::Unknown
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ResolvedDescriptor {
    pub uuid: String,
    pub path: String,
    /// Index of the owning characteristic within its service.
    pub characteristic_index: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResolvedCharacteristic {
    pub uuid: String,
    pub path: String,
    pub handle: Option<u16>,
    pub flags: Vec<String>,
    /// Index of the owning service in the mapping arena.
    pub service_index: usize,
    pub descriptors: Vec<ResolvedDescriptor>,
}

impl ResolvedCharacteristic {
    pub fn is_readable(&self) -> bool {
        self.flags.iter().any(|f| {
            matches!(
                f.as_str(),
                "read" | "encrypt-read" | "encrypt-authenticated-read" | "secure-read"
            )
        })
    }

    pub fn is_writable(&self) -> bool {
        self.flags.iter().any(|f| {
            matches!(
                f.as_str(),
                "write"
                    | "write-without-response"
                    | "encrypt-write"
                    | "encrypt-authenticated-write"
                    | "secure-write"
                    | "authenticated-signed-writes"
            )
        })
    }

    pub fn supports_notifications(&self) -> bool {
        self.flags
            .iter()
            .any(|f| matches!(f.as_str(), "notify" | "indicate"))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ResolvedService {
    pub uuid: String,
    pub path: String,
    pub primary: bool,
    pub handle: Option<u16>,
    pub name: Option<String>,
    pub characteristics: Vec<ResolvedCharacteristic>,
}

/// The resolved GATT arena for one device.
#[derive(Debug, Clone, Default, Serialize)]
pub struct GattMapping {
    pub services: Vec<ResolvedService>,
    #[serde(skip)]
    by_char_uuid: HashMap<String, (usize, usize)>,
    #[serde(skip)]
    by_handle: HashMap<u16, (usize, usize)>,
}

impl GattMapping {
    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    pub fn service_uuids(&self) -> Vec<String> {
        self.services.iter().map(|s| s.uuid.clone()).collect()
    }

    pub fn characteristic_count(&self) -> usize {
        self.services.iter().map(|s| s.characteristics.len()).sum()
    }

    /// Locate a characteristic by UUID (short or full form accepted).
    pub fn find_characteristic(&self, uuid: &str) -> Option<(usize, usize)> {
        let key = match lib_ref::translate_uuid(uuid) {
            Ok(t) => t.normalized_128,
            Err(_) => uuid.to_ascii_lowercase(),
        };
        self.by_char_uuid.get(&key).copied()
    }

    pub fn find_by_handle(&self, handle: u16) -> Option<(usize, usize)> {
        self.by_handle.get(&handle).copied()
    }

    pub fn characteristic(&self, index: (usize, usize)) -> &ResolvedCharacteristic {
        &self.services[index.0].characteristics[index.1]
    }

    /// Characteristics in deterministic order (service path, then handle).
    pub fn characteristics(&self) -> impl Iterator<Item = &ResolvedCharacteristic> {
        self.services.iter().flat_map(|s| s.characteristics.iter())
    }

    fn rebuild_index(&mut self) {
        self.by_char_uuid.clear();
        self.by_handle.clear();
        for (svc_idx, service) in self.services.iter().enumerate() {
            for (chr_idx, chr) in service.characteristics.iter().enumerate() {
                self.by_char_uuid
                    .insert(chr.uuid.clone(), (svc_idx, chr_idx));
                if let Some(handle) = chr.handle {
                    self.by_handle.insert(handle, (svc_idx, chr_idx));
                }
            }
        }
    }
}

fn handle_from_path(path: &str) -> Option<u16> {
    let segment = path.rsplit('/').next()?;
    let hex = segment
        .trim_start_matches("char")
        .trim_start_matches("service")
        .trim_start_matches("desc");
    u16::from_str_radix(hex, 16).ok()
}

/// Resolve the GATT tree under a device path into an arena mapping.
pub async fn resolve_gatt(device: &Device) -> BusResult<GattMapping> {
    let tree = {
        let guard = device.ctx.pool.with_bus().await?;
        guard.get_managed_objects(BLUEZ_SERVICE).await?
    };
    let prefix = format!("{}/", device.path());

    let mut mapping = GattMapping::default();
    let mut service_index_by_path: HashMap<String, usize> = HashMap::new();

    // First pass: services. The tree is path-ordered, so parents precede
    // children.
    for (path, interfaces) in tree.iter().filter(|(p, _)| p.starts_with(&prefix)) {
        if classify_node(interfaces) != NodeKind::Service {
            continue;
        }
        let props = &interfaces[GATT_SERVICE_IFACE];
        let uuid = props
            .get("UUID")
            .and_then(IpcValue::as_str)
            .ok_or_else(|| BusError::Failed(format!("service {path} has no UUID")))?
            .to_ascii_lowercase();
        let name = lib_ref::identify_uuid(&uuid).map(|id| id.name);
        service_index_by_path.insert(path.clone(), mapping.services.len());
        mapping.services.push(ResolvedService {
            uuid,
            path: path.clone(),
            primary: props
                .get("Primary")
                .and_then(IpcValue::as_bool)
                .unwrap_or(true),
            handle: props
                .get("Handle")
                .and_then(IpcValue::as_u16)
                .or_else(|| handle_from_path(path)),
            name,
            characteristics: Vec::new(),
        });
    }

    // Second pass: characteristics linked to their service by path.
    let mut char_index_by_path: HashMap<String, (usize, usize)> = HashMap::new();
    for (path, interfaces) in tree.iter().filter(|(p, _)| p.starts_with(&prefix)) {
        if classify_node(interfaces) != NodeKind::Characteristic {
            continue;
        }
        let props = &interfaces[GATT_CHARACTERISTIC_IFACE];
        let Some(service_path) = props.get("Service").and_then(IpcValue::as_str) else {
            continue;
        };
        let Some(&service_index) = service_index_by_path.get(service_path) else {
            continue;
        };
        let uuid = props
            .get("UUID")
            .and_then(IpcValue::as_str)
            .unwrap_or_default()
            .to_ascii_lowercase();
        let chr = ResolvedCharacteristic {
            uuid,
            path: path.clone(),
            handle: props
                .get("Handle")
                .and_then(IpcValue::as_u16)
                .or_else(|| handle_from_path(path)),
            flags: props
                .get("Flags")
                .and_then(IpcValue::to_string_vec)
                .unwrap_or_default(),
            service_index,
            descriptors: Vec::new(),
        };
        let chr_index = mapping.services[service_index].characteristics.len();
        char_index_by_path.insert(path.clone(), (service_index, chr_index));
        mapping.services[service_index].characteristics.push(chr);
    }

    // Third pass: descriptors.
    for (path, interfaces) in tree.iter().filter(|(p, _)| p.starts_with(&prefix)) {
        if classify_node(interfaces) != NodeKind::Descriptor {
            continue;
        }
        let props = &interfaces[GATT_DESCRIPTOR_IFACE];
        let Some(char_path) = props.get("Characteristic").and_then(IpcValue::as_str) else {
            continue;
        };
        let Some(&(service_index, chr_index)) = char_index_by_path.get(char_path) else {
            continue;
        };
        let uuid = props
            .get("UUID")
            .and_then(IpcValue::as_str)
            .unwrap_or_default()
            .to_ascii_lowercase();
        mapping.services[service_index].characteristics[chr_index]
            .descriptors
            .push(ResolvedDescriptor {
                uuid,
                path: path.clone(),
                characteristic_index: chr_index,
            });
    }

    mapping.rebuild_index();
    Ok(mapping)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoreConfig;
    use crate::context::Context;
    use lib_bus::mock::{MockBus, MockCharacteristic, MockPeripheral, MockService};
    use std::sync::Arc;

    #[tokio::test]
    async fn resolves_tree_with_parent_indices() {
        let bus = Arc::new(MockBus::new());
        bus.add_peripheral(
            MockPeripheral::new("aa:bb:cc:dd:ee:50")
                .with_service(
                    MockService::new("0000180f-0000-1000-8000-00805f9b34fb").with_characteristic(
                        MockCharacteristic::new(
                            "00002a19-0000-1000-8000-00805f9b34fb",
                            0x002a,
                            &["read", "notify"],
                        )
                        .with_descriptor("00002902-0000-1000-8000-00805f9b34fb", vec![0, 0]),
                    ),
                )
                .with_service(
                    MockService::new("0000ffe0-0000-1000-8000-00805f9b34fb").with_characteristic(
                        MockCharacteristic::new(
                            "0000ffe1-0000-1000-8000-00805f9b34fb",
                            0x0040,
                            &["write", "write-without-response"],
                        ),
                    ),
                ),
        );
        let config = CoreConfig::rooted_at(tempfile::tempdir().unwrap().path());
        let ctx = Context::start_in_memory(config, bus).await.unwrap();
        let device = crate::device::Device::new(ctx, "aa:bb:cc:dd:ee:50");
        device.connect(0).await.unwrap();

        let mapping = resolve_gatt(&device).await.unwrap();
        assert_eq!(mapping.services.len(), 2);
        assert_eq!(mapping.characteristic_count(), 2);

        let (svc_idx, chr_idx) = mapping.find_characteristic("2a19").unwrap();
        let chr = mapping.characteristic((svc_idx, chr_idx));
        assert!(chr.is_readable());
        assert!(chr.supports_notifications());
        assert!(!chr.is_writable());
        assert_eq!(chr.service_index, svc_idx);
        assert_eq!(chr.descriptors.len(), 1);
        assert_eq!(chr.descriptors[0].characteristic_index, chr_idx);

        let (_, _) = mapping
            .find_characteristic("0000ffe1-0000-1000-8000-00805f9b34fb")
            .unwrap();
        assert!(mapping.find_by_handle(0x002a).is_some());
        // Battery service resolves a human name from reference data.
        assert_eq!(mapping.services[0].name.as_deref(), Some("Battery"));
    }

    #[test]
    fn classify_prefers_most_specific_interface() {
        let mut interfaces = InterfaceMap::new();
        interfaces.insert(GATT_CHARACTERISTIC_IFACE.into(), Default::default());
        assert_eq!(classify_node(&interfaces), NodeKind::Characteristic);
        let mut unknown = InterfaceMap::new();
        unknown.insert("org.example.Nothing".into(), Default::default());
        assert_eq!(classify_node(&unknown), NodeKind::Unknown);
    }
}
