//! In-memory bus transport for tests and headless environments.
//!
//! Hosts a programmable object tree speaking the same interface vocabulary
//! as the real daemon: peripherals with GATT trees, discovery with staged
//! advertisements, a pairing-agent dispatch path and an OBEX client with
//! transfer lifecycle. Error replies use wire error names so the mapping in
//! [`crate::error`] is exercised end to end.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::error::{BusError, BusResult};
use crate::transport::{
    device_path, AgentCallbacks, AgentCapability, BusSignal, BusTransport, ADAPTER_IFACE,
    BLUEZ_SERVICE, DEVICE_IFACE, GATT_CHARACTERISTIC_IFACE, GATT_DESCRIPTOR_IFACE,
    GATT_SERVICE_IFACE, OBEX_PBAP_IFACE, OBEX_SERVICE, OBEX_SESSION_IFACE, OBEX_TRANSFER_IFACE,
};
use crate::value::{InterfaceMap, IpcValue, ManagedObjects, PropertyMap};

pub const MOCK_ADAPTER_PATH: &str = "/org/bluez/hci0";

/// What a characteristic read returns.
#[derive(Debug, Clone)]
pub enum ReadBehavior {
    /// Always the same value.
    Value(Vec<u8>),
    /// One value per read, repeating the last once exhausted.
    Sequence(Vec<Vec<u8>>),
    /// Reply with a wire error name.
    Error(String),
    /// No reply at all; the caller's timeout budget decides.
    Stall,
}

/// What a characteristic write does.
#[derive(Debug, Clone)]
pub enum WriteBehavior {
    /// Accept and store so a verify-read returns the written payload.
    Echo,
    /// Accept without changing the readable value.
    Accept,
    /// Reply with a wire error name.
    Error(String),
}

/// How the peripheral behaves during `Pair`.
#[derive(Debug, Clone)]
pub enum PairingKind {
    JustWorks,
    ConfirmPasskey(u32),
    RequestPin,
    RequestPasskey,
}

#[derive(Debug, Clone)]
pub struct MockDescriptor {
    pub uuid: String,
    pub value: Vec<u8>,
}

#[derive(Clone)]
pub struct MockCharacteristic {
    pub uuid: String,
    pub handle: u16,
    pub flags: Vec<String>,
    pub read: ReadBehavior,
    pub write: WriteBehavior,
    pub descriptors: Vec<MockDescriptor>,
    stored_value: Option<Vec<u8>>,
    reads_done: usize,
    notifying: bool,
}

impl MockCharacteristic {
    pub fn new(uuid: &str, handle: u16, flags: &[&str]) -> Self {
        Self {
            uuid: uuid.to_ascii_lowercase(),
            handle,
            flags: flags.iter().map(|f| f.to_string()).collect(),
            read: ReadBehavior::Value(Vec::new()),
            write: WriteBehavior::Echo,
            descriptors: Vec::new(),
            stored_value: None,
            reads_done: 0,
            notifying: false,
        }
    }

    pub fn with_read(mut self, read: ReadBehavior) -> Self {
        self.read = read;
        self
    }

    pub fn with_write(mut self, write: WriteBehavior) -> Self {
        self.write = write;
        self
    }

    pub fn with_descriptor(mut self, uuid: &str, value: Vec<u8>) -> Self {
        self.descriptors.push(MockDescriptor {
            uuid: uuid.to_ascii_lowercase(),
            value,
        });
        self
    }
}

#[derive(Clone)]
pub struct MockService {
    pub uuid: String,
    pub primary: bool,
    pub characteristics: Vec<MockCharacteristic>,
}

impl MockService {
    pub fn new(uuid: &str) -> Self {
        Self {
            uuid: uuid.to_ascii_lowercase(),
            primary: true,
            characteristics: Vec::new(),
        }
    }

    pub fn with_characteristic(mut self, chr: MockCharacteristic) -> Self {
        self.characteristics.push(chr);
        self
    }
}

/// Typed SDP record as returned through the service-record call.
#[derive(Debug, Clone)]
pub struct MockSdpRecord {
    pub uuid: String,
    pub name: Option<String>,
    pub channel: Option<u8>,
    pub handle: u32,
    pub profiles: Vec<(String, u16)>,
    pub version: Option<u16>,
    pub description: Option<String>,
}

/// A device the mock bus can discover, connect and enumerate.
#[derive(Clone)]
pub struct MockPeripheral {
    pub mac: String,
    pub name: Option<String>,
    pub address_type: String,
    pub device_class: Option<u32>,
    pub appearance: Option<u16>,
    pub uuids: Vec<String>,
    pub rssi: i16,
    pub connect_error: Option<String>,
    pub pairing: PairingKind,
    pub services: Vec<MockService>,
    pub sdp_records: Vec<MockSdpRecord>,
    connected: bool,
    paired: bool,
}

impl MockPeripheral {
    pub fn new(mac: &str) -> Self {
        Self {
            mac: mac.to_ascii_lowercase(),
            name: None,
            address_type: "public".to_string(),
            device_class: None,
            appearance: None,
            uuids: Vec::new(),
            rssi: -50,
            connect_error: None,
            pairing: PairingKind::JustWorks,
            services: Vec::new(),
            sdp_records: Vec::new(),
            connected: false,
            paired: false,
        }
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    pub fn with_address_type(mut self, address_type: &str) -> Self {
        self.address_type = address_type.to_string();
        self
    }

    pub fn with_device_class(mut self, class: u32) -> Self {
        self.device_class = Some(class);
        self
    }

    pub fn with_uuids(mut self, uuids: &[&str]) -> Self {
        self.uuids = uuids.iter().map(|u| u.to_ascii_lowercase()).collect();
        self
    }

    pub fn with_service(mut self, service: MockService) -> Self {
        self.services.push(service);
        self
    }

    pub fn with_sdp_record(mut self, record: MockSdpRecord) -> Self {
        self.sdp_records.push(record);
        self
    }

    pub fn with_connect_error(mut self, wire_name: &str) -> Self {
        self.connect_error = Some(wire_name.to_string());
        self
    }

    pub fn with_pairing(mut self, pairing: PairingKind) -> Self {
        self.pairing = pairing;
        self
    }

    fn device_properties(&self) -> PropertyMap {
        let mut props = PropertyMap::new();
        props.insert(
            "Address".into(),
            IpcValue::Str(self.mac.to_ascii_uppercase()),
        );
        props.insert(
            "AddressType".into(),
            IpcValue::Str(self.address_type.clone()),
        );
        if let Some(name) = &self.name {
            props.insert("Name".into(), IpcValue::Str(name.clone()));
            props.insert("Alias".into(), IpcValue::Str(name.clone()));
        }
        if let Some(class) = self.device_class {
            props.insert("Class".into(), IpcValue::U32(class));
        }
        if let Some(appearance) = self.appearance {
            props.insert("Appearance".into(), IpcValue::U16(appearance));
        }
        if !self.uuids.is_empty() {
            props.insert(
                "UUIDs".into(),
                IpcValue::Array(self.uuids.iter().cloned().map(IpcValue::Str).collect()),
            );
        }
        props.insert("RSSI".into(), IpcValue::I16(self.rssi));
        props.insert("Connected".into(), IpcValue::Bool(self.connected));
        props.insert("Paired".into(), IpcValue::Bool(self.paired));
        props.insert("Trusted".into(), IpcValue::Bool(false));
        props.insert("Blocked".into(), IpcValue::Bool(false));
        props.insert("ServicesResolved".into(), IpcValue::Bool(false));
        props.insert(
            "Adapter".into(),
            IpcValue::ObjectPath(MOCK_ADAPTER_PATH.into()),
        );
        props
    }
}

/// One method invocation, recorded for assertions.
#[derive(Debug, Clone)]
pub struct CallRecord {
    pub path: String,
    pub interface: String,
    pub method: String,
}

struct ObexTransfer {
    session_path: String,
    filename: PathBuf,
    payload: Vec<u8>,
}

struct MockState {
    objects: ManagedObjects,
    obex_objects: ManagedObjects,
    peripherals: HashMap<String, MockPeripheral>,
    // object path of a characteristic/descriptor -> (mac, service idx, char idx, desc idx)
    gatt_index: HashMap<String, (String, usize, usize, Option<usize>)>,
    staged_advertisements: Vec<(String, i16)>,
    discovery_filter: Option<PropertyMap>,
    call_log: Vec<CallRecord>,
    agent: Option<(String, AgentCapability, Arc<dyn AgentCallbacks>)>,
    phonebooks: HashMap<String, BTreeMap<String, Vec<u8>>>,
    selected_repo: HashMap<String, String>,
    stall_transfers: bool,
    next_session: u32,
    next_transfer: u32,
    healthy: bool,
    fail_next_calls: u32,
}

/// Programmable in-memory transport.
pub struct MockBus {
    state: Arc<Mutex<MockState>>,
    signals: broadcast::Sender<BusSignal>,
}

impl Default for MockBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBus {
    pub fn new() -> Self {
        let mut objects = ManagedObjects::new();
        let mut adapter_props = PropertyMap::new();
        adapter_props.insert("Address".into(), IpcValue::Str("00:1A:7D:DA:71:13".into()));
        adapter_props.insert("Powered".into(), IpcValue::Bool(true));
        adapter_props.insert("Discovering".into(), IpcValue::Bool(false));
        adapter_props.insert("Discoverable".into(), IpcValue::Bool(false));
        adapter_props.insert("Pairable".into(), IpcValue::Bool(false));
        let mut adapter_ifaces = InterfaceMap::new();
        adapter_ifaces.insert(ADAPTER_IFACE.into(), adapter_props);
        objects.insert(MOCK_ADAPTER_PATH.into(), adapter_ifaces);

        let (signals, _) = broadcast::channel(2048);
        Self {
            state: Arc::new(Mutex::new(MockState {
                objects,
                obex_objects: ManagedObjects::new(),
                peripherals: HashMap::new(),
                gatt_index: HashMap::new(),
                staged_advertisements: Vec::new(),
                discovery_filter: None,
                call_log: Vec::new(),
                agent: None,
                phonebooks: HashMap::new(),
                selected_repo: HashMap::new(),
                stall_transfers: false,
                next_session: 0,
                next_transfer: 0,
                healthy: true,
                fail_next_calls: 0,
            })),
            signals,
        }
    }

    pub fn add_peripheral(&self, peripheral: MockPeripheral) {
        let mut state = self.state.lock();
        state
            .peripherals
            .insert(peripheral.mac.clone(), peripheral);
    }

    /// Queue an advertisement to be delivered on the next discovery start.
    pub fn stage_advertisement(&self, mac: &str, rssi: i16) {
        let mut state = self.state.lock();
        state
            .staged_advertisements
            .push((mac.to_ascii_lowercase(), rssi));
    }

    /// Deliver an advertisement immediately (device appears in the tree on
    /// first sighting, later sightings become RSSI property changes).
    pub fn emit_advertisement(&self, mac: &str, rssi: i16) {
        let signals = {
            let mut state = self.state.lock();
            self.deliver_advertisement(&mut state, &mac.to_ascii_lowercase(), rssi)
        };
        self.send_all(signals);
    }

    /// Push a notification for a characteristic currently notifying.
    pub fn emit_notification(&self, mac: &str, char_uuid: &str, value: &[u8]) {
        let mac = mac.to_ascii_lowercase();
        let char_uuid = char_uuid.to_ascii_lowercase();
        let signal = {
            let mut state = self.state.lock();
            let path = state.gatt_index.iter().find_map(|(path, entry)| {
                let (entry_mac, svc, chr, desc) = entry;
                if desc.is_none() && *entry_mac == mac {
                    let peripheral = state.peripherals.get(entry_mac)?;
                    if peripheral.services[*svc].characteristics[*chr].uuid == char_uuid {
                        return Some(path.clone());
                    }
                }
                None
            });
            path.map(|path| {
                if let Some(ifaces) = state.objects.get_mut(&path) {
                    if let Some(props) = ifaces.get_mut(GATT_CHARACTERISTIC_IFACE) {
                        props.insert("Value".into(), IpcValue::Bytes(value.to_vec()));
                    }
                }
                let mut changed = PropertyMap::new();
                changed.insert("Value".into(), IpcValue::Bytes(value.to_vec()));
                BusSignal::PropertiesChanged {
                    path,
                    interface: GATT_CHARACTERISTIC_IFACE.into(),
                    changed,
                    invalidated: Vec::new(),
                }
            })
        };
        if let Some(signal) = signal {
            let _ = self.signals.send(signal);
        }
    }

    /// Provide the phonebook payload served for one repository of a device.
    pub fn set_phonebook(&self, mac: &str, repo: &str, vcf: &[u8]) {
        let mut state = self.state.lock();
        state
            .phonebooks
            .entry(mac.to_ascii_lowercase())
            .or_default()
            .insert(repo.to_string(), vcf.to_vec());
    }

    /// Freeze every OBEX transfer in the queued state (watchdog tests).
    pub fn stall_transfers(&self, stall: bool) {
        self.state.lock().stall_transfers = stall;
    }

    /// Force the next `n` method calls to fail with a no-reply error.
    pub fn fail_next_calls(&self, n: u32) {
        self.state.lock().fail_next_calls = n;
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.state.lock().healthy = healthy;
    }

    pub fn call_log(&self) -> Vec<CallRecord> {
        self.state.lock().call_log.clone()
    }

    pub fn calls_matching(&self, interface: &str, method: &str) -> usize {
        self.state
            .lock()
            .call_log
            .iter()
            .filter(|rec| rec.interface == interface && rec.method == method)
            .count()
    }

    pub fn discovery_filter(&self) -> Option<PropertyMap> {
        self.state.lock().discovery_filter.clone()
    }

    pub fn is_paired(&self, mac: &str) -> bool {
        self.state
            .lock()
            .peripherals
            .get(&mac.to_ascii_lowercase())
            .map(|p| p.paired)
            .unwrap_or(false)
    }

    fn send_all(&self, signals: Vec<BusSignal>) {
        for signal in signals {
            let _ = self.signals.send(signal);
        }
    }

    fn deliver_advertisement(
        &self,
        state: &mut MockState,
        mac: &str,
        rssi: i16,
    ) -> Vec<BusSignal> {
        // Address-filtered discovery drops advertisements from other devices.
        if let Some(filter) = &state.discovery_filter {
            if let Some(wanted) = filter.get("Address").and_then(IpcValue::as_str) {
                if !wanted.eq_ignore_ascii_case(mac) {
                    return Vec::new();
                }
            }
        }
        let Some(peripheral) = state.peripherals.get_mut(mac) else {
            return Vec::new();
        };
        peripheral.rssi = rssi;
        let path = device_path("hci0", mac);
        if let Some(ifaces) = state.objects.get_mut(&path) {
            if let Some(props) = ifaces.get_mut(DEVICE_IFACE) {
                props.insert("RSSI".into(), IpcValue::I16(rssi));
            }
            let mut changed = PropertyMap::new();
            changed.insert("RSSI".into(), IpcValue::I16(rssi));
            vec![BusSignal::PropertiesChanged {
                path,
                interface: DEVICE_IFACE.into(),
                changed,
                invalidated: Vec::new(),
            }]
        } else {
            let props = state.peripherals.get(mac).unwrap().device_properties();
            let mut ifaces = InterfaceMap::new();
            ifaces.insert(DEVICE_IFACE.into(), props);
            state.objects.insert(path.clone(), ifaces.clone());
            vec![BusSignal::InterfacesAdded {
                path,
                interfaces: ifaces,
            }]
        }
    }

    fn resolve_gatt_tree(&self, state: &mut MockState, mac: &str) -> Vec<BusSignal> {
        let dev_path = device_path("hci0", mac);
        let peripheral = state.peripherals.get(mac).cloned();
        let Some(peripheral) = peripheral else {
            return Vec::new();
        };
        let mut signals = Vec::new();
        for (svc_idx, service) in peripheral.services.iter().enumerate() {
            let svc_path = format!("{}/service{:04x}", dev_path, 0x0028 + svc_idx as u16 * 0x10);
            let mut svc_props = PropertyMap::new();
            svc_props.insert("UUID".into(), IpcValue::Str(service.uuid.clone()));
            svc_props.insert("Primary".into(), IpcValue::Bool(service.primary));
            svc_props.insert("Device".into(), IpcValue::ObjectPath(dev_path.clone()));
            let mut svc_ifaces = InterfaceMap::new();
            svc_ifaces.insert(GATT_SERVICE_IFACE.into(), svc_props);
            state.objects.insert(svc_path.clone(), svc_ifaces.clone());
            signals.push(BusSignal::InterfacesAdded {
                path: svc_path.clone(),
                interfaces: svc_ifaces,
            });

            for (chr_idx, chr) in service.characteristics.iter().enumerate() {
                let chr_path = format!("{}/char{:04x}", svc_path, chr.handle);
                let mut chr_props = PropertyMap::new();
                chr_props.insert("UUID".into(), IpcValue::Str(chr.uuid.clone()));
                chr_props.insert("Service".into(), IpcValue::ObjectPath(svc_path.clone()));
                chr_props.insert("Handle".into(), IpcValue::U16(chr.handle));
                chr_props.insert(
                    "Flags".into(),
                    IpcValue::Array(chr.flags.iter().cloned().map(IpcValue::Str).collect()),
                );
                chr_props.insert("Notifying".into(), IpcValue::Bool(false));
                let mut chr_ifaces = InterfaceMap::new();
                chr_ifaces.insert(GATT_CHARACTERISTIC_IFACE.into(), chr_props);
                state.objects.insert(chr_path.clone(), chr_ifaces.clone());
                state.gatt_index.insert(
                    chr_path.clone(),
                    (mac.to_string(), svc_idx, chr_idx, None),
                );
                signals.push(BusSignal::InterfacesAdded {
                    path: chr_path.clone(),
                    interfaces: chr_ifaces,
                });

                for (desc_idx, desc) in chr.descriptors.iter().enumerate() {
                    let desc_path = format!("{}/desc{:04x}", chr_path, desc_idx as u16 + 1);
                    let mut desc_props = PropertyMap::new();
                    desc_props.insert("UUID".into(), IpcValue::Str(desc.uuid.clone()));
                    desc_props.insert(
                        "Characteristic".into(),
                        IpcValue::ObjectPath(chr_path.clone()),
                    );
                    let mut desc_ifaces = InterfaceMap::new();
                    desc_ifaces.insert(GATT_DESCRIPTOR_IFACE.into(), desc_props);
                    state.objects.insert(desc_path.clone(), desc_ifaces.clone());
                    state.gatt_index.insert(
                        desc_path.clone(),
                        (mac.to_string(), svc_idx, chr_idx, Some(desc_idx)),
                    );
                    signals.push(BusSignal::InterfacesAdded {
                        path: desc_path,
                        interfaces: desc_ifaces,
                    });
                }
            }
        }
        signals
    }

    fn set_device_property(
        &self,
        state: &mut MockState,
        mac: &str,
        name: &str,
        value: IpcValue,
    ) -> Option<BusSignal> {
        let path = device_path("hci0", mac);
        let ifaces = state.objects.get_mut(&path)?;
        let props = ifaces.get_mut(DEVICE_IFACE)?;
        props.insert(name.to_string(), value.clone());
        let mut changed = PropertyMap::new();
        changed.insert(name.to_string(), value);
        Some(BusSignal::PropertiesChanged {
            path,
            interface: DEVICE_IFACE.into(),
            changed,
            invalidated: Vec::new(),
        })
    }

    fn sdp_records_value(records: &[MockSdpRecord]) -> IpcValue {
        IpcValue::Array(
            records
                .iter()
                .map(|rec| {
                    let mut dict = BTreeMap::new();
                    dict.insert("Uuid".to_string(), IpcValue::Str(rec.uuid.clone()));
                    dict.insert("Handle".to_string(), IpcValue::U32(rec.handle));
                    if let Some(name) = &rec.name {
                        dict.insert("Name".to_string(), IpcValue::Str(name.clone()));
                    }
                    if let Some(channel) = rec.channel {
                        dict.insert("Channel".to_string(), IpcValue::U8(channel));
                    }
                    if let Some(version) = rec.version {
                        dict.insert("Version".to_string(), IpcValue::U16(version));
                    }
                    if let Some(desc) = &rec.description {
                        dict.insert("Description".to_string(), IpcValue::Str(desc.clone()));
                    }
                    if !rec.profiles.is_empty() {
                        dict.insert(
                            "Profiles".to_string(),
                            IpcValue::Array(
                                rec.profiles
                                    .iter()
                                    .map(|(uuid, version)| {
                                        let mut profile = BTreeMap::new();
                                        profile.insert(
                                            "Uuid".to_string(),
                                            IpcValue::Str(uuid.clone()),
                                        );
                                        profile.insert(
                                            "Version".to_string(),
                                            IpcValue::U16(*version),
                                        );
                                        IpcValue::Dict(profile)
                                    })
                                    .collect(),
                            ),
                        );
                    }
                    IpcValue::Dict(dict)
                })
                .collect(),
        )
    }

    fn handle_adapter_call(
        &self,
        method: &str,
        args: Vec<IpcValue>,
    ) -> BusResult<(IpcValue, Vec<BusSignal>)> {
        let mut state = self.state.lock();
        match method {
            "SetDiscoveryFilter" => {
                let filter = args
                    .first()
                    .and_then(IpcValue::as_dict)
                    .map(|dict| dict.iter().map(|(k, v)| (k.clone(), v.clone())).collect());
                state.discovery_filter = filter;
                Ok((IpcValue::Bool(true), Vec::new()))
            }
            "StartDiscovery" => {
                let mut signals = Vec::new();
                if let Some(ifaces) = state.objects.get_mut(MOCK_ADAPTER_PATH) {
                    if let Some(props) = ifaces.get_mut(ADAPTER_IFACE) {
                        props.insert("Discovering".into(), IpcValue::Bool(true));
                    }
                }
                let mut changed = PropertyMap::new();
                changed.insert("Discovering".into(), IpcValue::Bool(true));
                signals.push(BusSignal::PropertiesChanged {
                    path: MOCK_ADAPTER_PATH.into(),
                    interface: ADAPTER_IFACE.into(),
                    changed,
                    invalidated: Vec::new(),
                });
                let staged = std::mem::take(&mut state.staged_advertisements);
                for (mac, rssi) in staged {
                    signals.extend(self.deliver_advertisement(&mut state, &mac, rssi));
                }
                Ok((IpcValue::Bool(true), signals))
            }
            "StopDiscovery" => {
                if let Some(ifaces) = state.objects.get_mut(MOCK_ADAPTER_PATH) {
                    if let Some(props) = ifaces.get_mut(ADAPTER_IFACE) {
                        props.insert("Discovering".into(), IpcValue::Bool(false));
                    }
                }
                let mut changed = PropertyMap::new();
                changed.insert("Discovering".into(), IpcValue::Bool(false));
                Ok((
                    IpcValue::Bool(true),
                    vec![BusSignal::PropertiesChanged {
                        path: MOCK_ADAPTER_PATH.into(),
                        interface: ADAPTER_IFACE.into(),
                        changed,
                        invalidated: Vec::new(),
                    }],
                ))
            }
            "RemoveDevice" => {
                let target = args
                    .first()
                    .and_then(IpcValue::as_str)
                    .ok_or_else(|| BusError::InvalidArgs("RemoveDevice needs a path".into()))?
                    .to_string();
                let removed = state.objects.remove(&target);
                match removed {
                    Some(ifaces) => Ok((
                        IpcValue::Bool(true),
                        vec![BusSignal::InterfacesRemoved {
                            path: target,
                            interfaces: ifaces.keys().cloned().collect(),
                        }],
                    )),
                    None => Err(BusError::from_wire("org.bluez.Error.DoesNotExist", &target)),
                }
            }
            other => Err(BusError::from_wire("org.bluez.Error.NotSupported", other)),
        }
    }

    async fn handle_device_call(
        &self,
        path: &str,
        method: &str,
    ) -> BusResult<(IpcValue, Vec<BusSignal>)> {
        let mac = crate::transport::mac_from_path(path)
            .ok_or_else(|| BusError::UnknownObject(path.to_string()))?;
        match method {
            "Connect" => {
                let mut state = self.state.lock();
                let peripheral = state
                    .peripherals
                    .get_mut(&mac)
                    .ok_or_else(|| BusError::from_wire("org.bluez.Error.DoesNotExist", &mac))?;
                if let Some(wire) = peripheral.connect_error.clone() {
                    return Err(BusError::from_wire(&wire, "connect refused"));
                }
                peripheral.connected = true;
                let mut signals = Vec::new();
                if !state.objects.contains_key(path) {
                    let props = state.peripherals.get(&mac).unwrap().device_properties();
                    let mut ifaces = InterfaceMap::new();
                    ifaces.insert(DEVICE_IFACE.into(), props);
                    state.objects.insert(path.to_string(), ifaces.clone());
                    signals.push(BusSignal::InterfacesAdded {
                        path: path.to_string(),
                        interfaces: ifaces,
                    });
                }
                signals.extend(self.set_device_property(
                    &mut state,
                    &mac,
                    "Connected",
                    IpcValue::Bool(true),
                ));
                signals.extend(self.resolve_gatt_tree(&mut state, &mac));
                signals.extend(self.set_device_property(
                    &mut state,
                    &mac,
                    "ServicesResolved",
                    IpcValue::Bool(true),
                ));
                Ok((IpcValue::Bool(true), signals))
            }
            "Disconnect" => {
                let mut state = self.state.lock();
                if let Some(peripheral) = state.peripherals.get_mut(&mac) {
                    peripheral.connected = false;
                }
                let mut signals = Vec::new();
                let children: Vec<String> = state
                    .objects
                    .keys()
                    .filter(|p| p.starts_with(path) && p.len() > path.len())
                    .cloned()
                    .collect();
                for child in children {
                    if let Some(ifaces) = state.objects.remove(&child) {
                        state.gatt_index.remove(&child);
                        signals.push(BusSignal::InterfacesRemoved {
                            path: child,
                            interfaces: ifaces.keys().cloned().collect(),
                        });
                    }
                }
                signals.extend(self.set_device_property(
                    &mut state,
                    &mac,
                    "ServicesResolved",
                    IpcValue::Bool(false),
                ));
                signals.extend(self.set_device_property(
                    &mut state,
                    &mac,
                    "Connected",
                    IpcValue::Bool(false),
                ));
                Ok((IpcValue::Bool(true), signals))
            }
            "Pair" => {
                let (agent, pairing) = {
                    let state = self.state.lock();
                    let peripheral = state
                        .peripherals
                        .get(&mac)
                        .ok_or_else(|| BusError::from_wire("org.bluez.Error.DoesNotExist", &mac))?;
                    (state.agent.clone(), peripheral.pairing.clone())
                };
                if let Some((_, _, callbacks)) = agent {
                    let outcome = match pairing {
                        PairingKind::JustWorks => Ok(()),
                        PairingKind::ConfirmPasskey(passkey) => {
                            callbacks.request_confirmation(path, passkey).await
                        }
                        PairingKind::RequestPin => {
                            callbacks.request_pin_code(path).await.map(|_| ())
                        }
                        PairingKind::RequestPasskey => {
                            callbacks.request_passkey(path).await.map(|_| ())
                        }
                    };
                    if let Err(err) = outcome {
                        return Err(BusError::from_wire(
                            "org.bluez.Error.AuthenticationFailed",
                            &err.to_string(),
                        ));
                    }
                }
                let mut state = self.state.lock();
                if let Some(peripheral) = state.peripherals.get_mut(&mac) {
                    peripheral.paired = true;
                }
                let signal = self.set_device_property(&mut state, &mac, "Paired", IpcValue::Bool(true));
                Ok((IpcValue::Bool(true), signal.into_iter().collect()))
            }
            "GetServiceRecords" => {
                let state = self.state.lock();
                let peripheral = state
                    .peripherals
                    .get(&mac)
                    .ok_or_else(|| BusError::from_wire("org.bluez.Error.DoesNotExist", &mac))?;
                Ok((Self::sdp_records_value(&peripheral.sdp_records), Vec::new()))
            }
            other => Err(BusError::from_wire("org.bluez.Error.NotSupported", other)),
        }
    }

    fn handle_gatt_call(
        &self,
        path: &str,
        method: &str,
        args: Vec<IpcValue>,
    ) -> BusResult<(IpcValue, Vec<BusSignal>, bool)> {
        let mut state = self.state.lock();
        let (mac, svc_idx, chr_idx, desc_idx) = state
            .gatt_index
            .get(path)
            .cloned()
            .ok_or_else(|| BusError::UnknownObject(path.to_string()))?;
        let peripheral = state
            .peripherals
            .get_mut(&mac)
            .ok_or_else(|| BusError::UnknownObject(mac.clone()))?;

        if let Some(desc_idx) = desc_idx {
            let desc = &peripheral.services[svc_idx].characteristics[chr_idx].descriptors[desc_idx];
            return match method {
                "ReadValue" => Ok((IpcValue::Bytes(desc.value.clone()), Vec::new(), false)),
                "WriteValue" => Ok((IpcValue::Bool(true), Vec::new(), false)),
                other => Err(BusError::from_wire("org.bluez.Error.NotSupported", other)),
            };
        }

        let chr = &mut peripheral.services[svc_idx].characteristics[chr_idx];
        match method {
            "ReadValue" => {
                if let Some(value) = &chr.stored_value {
                    return Ok((IpcValue::Bytes(value.clone()), Vec::new(), false));
                }
                match chr.read.clone() {
                    ReadBehavior::Value(value) => Ok((IpcValue::Bytes(value), Vec::new(), false)),
                    ReadBehavior::Sequence(values) => {
                        let idx = chr.reads_done.min(values.len().saturating_sub(1));
                        chr.reads_done += 1;
                        Ok((IpcValue::Bytes(values[idx].clone()), Vec::new(), false))
                    }
                    ReadBehavior::Error(wire) => Err(BusError::from_wire(&wire, "read rejected")),
                    ReadBehavior::Stall => Ok((IpcValue::Bool(false), Vec::new(), true)),
                }
            }
            "WriteValue" => {
                let payload = args
                    .first()
                    .and_then(IpcValue::to_byte_vec)
                    .ok_or_else(|| BusError::InvalidArgs("WriteValue needs bytes".into()))?;
                match chr.write.clone() {
                    WriteBehavior::Echo => {
                        chr.stored_value = Some(payload);
                        Ok((IpcValue::Bool(true), Vec::new(), false))
                    }
                    WriteBehavior::Accept => Ok((IpcValue::Bool(true), Vec::new(), false)),
                    WriteBehavior::Error(wire) => Err(BusError::from_wire(&wire, "write rejected")),
                }
            }
            "StartNotify" => {
                chr.notifying = true;
                let mut changed = PropertyMap::new();
                changed.insert("Notifying".into(), IpcValue::Bool(true));
                Ok((
                    IpcValue::Bool(true),
                    vec![BusSignal::PropertiesChanged {
                        path: path.to_string(),
                        interface: GATT_CHARACTERISTIC_IFACE.into(),
                        changed,
                        invalidated: Vec::new(),
                    }],
                    false,
                ))
            }
            "StopNotify" => {
                chr.notifying = false;
                Ok((IpcValue::Bool(true), Vec::new(), false))
            }
            other => Err(BusError::from_wire("org.bluez.Error.NotSupported", other)),
        }
    }

    fn handle_obex_call(
        &self,
        path: &str,
        interface: &str,
        method: &str,
        args: Vec<IpcValue>,
    ) -> BusResult<(IpcValue, Vec<BusSignal>, Option<ObexTransfer>)> {
        let mut state = self.state.lock();
        match (interface, method) {
            (crate::transport::OBEX_CLIENT_IFACE, "CreateSession") => {
                let dest = args
                    .first()
                    .and_then(IpcValue::as_str)
                    .ok_or_else(|| BusError::InvalidArgs("CreateSession needs destination".into()))?
                    .to_ascii_lowercase();
                state.next_session += 1;
                let session_path = format!("/org/bluez/obex/client/session{}", state.next_session);
                let mut session_props = PropertyMap::new();
                session_props.insert("Destination".into(), IpcValue::Str(dest.clone()));
                session_props.insert("Target".into(), IpcValue::Str("PBAP".into()));
                let mut ifaces = InterfaceMap::new();
                ifaces.insert(OBEX_SESSION_IFACE.into(), session_props);
                ifaces.insert(OBEX_PBAP_IFACE.into(), PropertyMap::new());
                state.obex_objects.insert(session_path.clone(), ifaces);
                Ok((IpcValue::ObjectPath(session_path), Vec::new(), None))
            }
            (crate::transport::OBEX_CLIENT_IFACE, "RemoveSession") => {
                let target = args
                    .first()
                    .and_then(IpcValue::as_str)
                    .unwrap_or_default()
                    .to_string();
                state.obex_objects.remove(&target);
                state.selected_repo.remove(&target);
                Ok((IpcValue::Bool(true), Vec::new(), None))
            }
            (OBEX_PBAP_IFACE, "Select") => {
                let repo = args
                    .get(1)
                    .and_then(IpcValue::as_str)
                    .ok_or_else(|| BusError::InvalidArgs("Select needs a repository".into()))?
                    .to_string();
                let dest = state
                    .obex_objects
                    .get(path)
                    .and_then(|ifaces| ifaces.get(OBEX_SESSION_IFACE))
                    .and_then(|props| props.get("Destination"))
                    .and_then(IpcValue::as_str)
                    .unwrap_or_default()
                    .to_string();
                let has_repo = state
                    .phonebooks
                    .get(&dest)
                    .map(|repos| repos.contains_key(&repo))
                    .unwrap_or(false);
                if !has_repo {
                    return Err(BusError::from_wire("org.bluez.Error.DoesNotExist", &repo));
                }
                state.selected_repo.insert(path.to_string(), repo);
                Ok((IpcValue::Bool(true), Vec::new(), None))
            }
            (OBEX_PBAP_IFACE, "PullAll") => {
                let dest = state
                    .obex_objects
                    .get(path)
                    .and_then(|ifaces| ifaces.get(OBEX_SESSION_IFACE))
                    .and_then(|props| props.get("Destination"))
                    .and_then(IpcValue::as_str)
                    .unwrap_or_default()
                    .to_string();
                let repo = state
                    .selected_repo
                    .get(path)
                    .cloned()
                    .unwrap_or_else(|| "PB".to_string());
                let payload = state
                    .phonebooks
                    .get(&dest)
                    .and_then(|repos| repos.get(&repo))
                    .cloned()
                    .unwrap_or_default();

                state.next_transfer += 1;
                let transfer_path =
                    format!("/org/bluez/obex/client/transfer{}", state.next_transfer);
                let filename = std::env::temp_dir()
                    .join(format!("bleep-mock-transfer-{}.vcf", state.next_transfer));
                let mut transfer_props = PropertyMap::new();
                transfer_props.insert("Status".into(), IpcValue::Str("queued".into()));
                transfer_props.insert(
                    "Filename".into(),
                    IpcValue::Str(filename.display().to_string()),
                );
                transfer_props.insert("Session".into(), IpcValue::ObjectPath(path.to_string()));
                let mut ifaces = InterfaceMap::new();
                ifaces.insert(OBEX_TRANSFER_IFACE.into(), transfer_props.clone());
                state.obex_objects.insert(transfer_path.clone(), ifaces);

                let job = if state.stall_transfers {
                    None
                } else {
                    Some(ObexTransfer {
                        session_path: transfer_path.clone(),
                        filename: filename.clone(),
                        payload,
                    })
                };

                let mut reply = BTreeMap::new();
                reply.insert(
                    "Transfer".to_string(),
                    IpcValue::ObjectPath(transfer_path.clone()),
                );
                reply.insert(
                    "Filename".to_string(),
                    IpcValue::Str(filename.display().to_string()),
                );
                Ok((IpcValue::Dict(reply), Vec::new(), job))
            }
            (_, other) => Err(BusError::from_wire("org.bluez.Error.NotSupported", other)),
        }
    }

    fn complete_transfer_later(&self, job: ObexTransfer) {
        let state = self.state.clone();
        let signals = self.signals.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            let _ = std::fs::write(&job.filename, &job.payload);
            {
                let mut state = state.lock();
                if let Some(ifaces) = state.obex_objects.get_mut(&job.session_path) {
                    if let Some(props) = ifaces.get_mut(OBEX_TRANSFER_IFACE) {
                        props.insert("Status".into(), IpcValue::Str("complete".into()));
                    }
                }
            }
            let mut changed = PropertyMap::new();
            changed.insert("Status".into(), IpcValue::Str("complete".into()));
            let _ = signals.send(BusSignal::PropertiesChanged {
                path: job.session_path,
                interface: OBEX_TRANSFER_IFACE.into(),
                changed,
                invalidated: Vec::new(),
            });
        });
    }
}

#[async_trait]
impl BusTransport for MockBus {
    async fn get_managed_objects(&self, service: &str) -> BusResult<ManagedObjects> {
        let state = self.state.lock();
        if !state.healthy {
            return Err(BusError::IpcUnavailable("mock bus marked unhealthy".into()));
        }
        match service {
            OBEX_SERVICE => Ok(state.obex_objects.clone()),
            _ => Ok(state.objects.clone()),
        }
    }

    async fn call(
        &self,
        service: &str,
        path: &str,
        interface: &str,
        method: &str,
        args: Vec<IpcValue>,
    ) -> BusResult<IpcValue> {
        {
            let mut state = self.state.lock();
            state.call_log.push(CallRecord {
                path: path.to_string(),
                interface: interface.to_string(),
                method: method.to_string(),
            });
            if state.fail_next_calls > 0 {
                state.fail_next_calls -= 1;
                return Err(BusError::NoReply(format!("{interface}.{method}")));
            }
        }

        if service == OBEX_SERVICE {
            let (reply, signals, job) = self.handle_obex_call(path, interface, method, args)?;
            self.send_all(signals);
            if let Some(job) = job {
                self.complete_transfer_later(job);
            }
            return Ok(reply);
        }

        match interface {
            ADAPTER_IFACE => {
                let (reply, signals) = self.handle_adapter_call(method, args)?;
                self.send_all(signals);
                Ok(reply)
            }
            DEVICE_IFACE => {
                let (reply, signals) = self.handle_device_call(path, method).await?;
                self.send_all(signals);
                Ok(reply)
            }
            GATT_CHARACTERISTIC_IFACE | GATT_DESCRIPTOR_IFACE => {
                let (reply, signals, stall) = self.handle_gatt_call(path, method, args)?;
                self.send_all(signals);
                if stall {
                    // Never reply; the per-operation timeout fires instead.
                    futures::future::pending::<()>().await;
                }
                Ok(reply)
            }
            other => Err(BusError::from_wire("org.bluez.Error.NotSupported", other)),
        }
    }

    async fn get_property(
        &self,
        service: &str,
        path: &str,
        interface: &str,
        name: &str,
    ) -> BusResult<IpcValue> {
        let state = self.state.lock();
        let tree = if service == OBEX_SERVICE {
            &state.obex_objects
        } else {
            &state.objects
        };
        tree.get(path)
            .and_then(|ifaces| ifaces.get(interface))
            .and_then(|props| props.get(name))
            .cloned()
            .ok_or_else(|| BusError::UnknownObject(format!("{path} {interface}.{name}")))
    }

    async fn set_property(
        &self,
        service: &str,
        path: &str,
        interface: &str,
        name: &str,
        value: IpcValue,
    ) -> BusResult<()> {
        let signal = {
            let mut state = self.state.lock();
            let tree = if service == OBEX_SERVICE {
                &mut state.obex_objects
            } else {
                &mut state.objects
            };
            let props = tree
                .get_mut(path)
                .and_then(|ifaces| ifaces.get_mut(interface))
                .ok_or_else(|| BusError::UnknownObject(format!("{path} {interface}")))?;
            props.insert(name.to_string(), value.clone());
            let mut changed = PropertyMap::new();
            changed.insert(name.to_string(), value);
            BusSignal::PropertiesChanged {
                path: path.to_string(),
                interface: interface.to_string(),
                changed,
                invalidated: Vec::new(),
            }
        };
        let _ = self.signals.send(signal);
        Ok(())
    }

    async fn get_all_properties(
        &self,
        service: &str,
        path: &str,
        interface: &str,
    ) -> BusResult<PropertyMap> {
        let state = self.state.lock();
        let tree = if service == OBEX_SERVICE {
            &state.obex_objects
        } else {
            &state.objects
        };
        tree.get(path)
            .and_then(|ifaces| ifaces.get(interface))
            .cloned()
            .ok_or_else(|| BusError::UnknownObject(format!("{path} {interface}")))
    }

    async fn introspect(&self, service: &str, path: &str) -> BusResult<Vec<String>> {
        let state = self.state.lock();
        let tree = if service == OBEX_SERVICE {
            &state.obex_objects
        } else {
            &state.objects
        };
        let names: Vec<String> = tree
            .get(path)
            .map(|ifaces| ifaces.keys().cloned().collect())
            .unwrap_or_default();
        if names.is_empty() {
            Err(BusError::IntrospectionFailed {
                path: path.to_string(),
            })
        } else {
            Ok(names)
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<BusSignal> {
        self.signals.subscribe()
    }

    async fn register_agent(
        &self,
        path: &str,
        capability: AgentCapability,
        callbacks: Arc<dyn AgentCallbacks>,
    ) -> BusResult<()> {
        let mut state = self.state.lock();
        if let Some((existing, _, _)) = &state.agent {
            if existing != path {
                return Err(BusError::AlreadyExists(existing.clone()));
            }
        }
        state.agent = Some((path.to_string(), capability, callbacks));
        Ok(())
    }

    async fn unregister_agent(&self, path: &str) -> BusResult<()> {
        let mut state = self.state.lock();
        match &state.agent {
            Some((existing, _, _)) if existing == path => {
                state.agent = None;
                Ok(())
            }
            _ => Err(BusError::UnknownObject(path.to_string())),
        }
    }

    async fn request_default_agent(&self, path: &str) -> BusResult<()> {
        let state = self.state.lock();
        match &state.agent {
            Some((existing, _, _)) if existing == path => Ok(()),
            _ => Err(BusError::UnknownObject(path.to_string())),
        }
    }

    async fn is_healthy(&self) -> bool {
        self.state.lock().healthy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn battery_peripheral(mac: &str) -> MockPeripheral {
        MockPeripheral::new(mac)
            .with_name("mock-battery")
            .with_service(
                MockService::new("0000180f-0000-1000-8000-00805f9b34fb").with_characteristic(
                    MockCharacteristic::new(
                        "00002a19-0000-1000-8000-00805f9b34fb",
                        0x002a,
                        &["read", "notify"],
                    )
                    .with_read(ReadBehavior::Value(vec![0x64])),
                ),
            )
    }

    #[tokio::test]
    async fn discovery_emits_added_then_rssi_changes() {
        let bus = MockBus::new();
        bus.add_peripheral(battery_peripheral("aa:bb:cc:dd:ee:01"));
        bus.stage_advertisement("AA:BB:CC:DD:EE:01", -40);
        bus.stage_advertisement("AA:BB:CC:DD:EE:01", -42);
        let mut rx = bus.subscribe();

        bus.call(BLUEZ_SERVICE, MOCK_ADAPTER_PATH, ADAPTER_IFACE, "StartDiscovery", vec![])
            .await
            .unwrap();

        // discovering flip, then InterfacesAdded, then RSSI change
        let mut added = 0;
        let mut rssi_changes = 0;
        for _ in 0..3 {
            match rx.recv().await.unwrap() {
                BusSignal::InterfacesAdded { .. } => added += 1,
                BusSignal::PropertiesChanged { changed, .. } => {
                    if changed.contains_key("RSSI") {
                        rssi_changes += 1;
                    }
                }
                _ => {}
            }
        }
        assert_eq!(added, 1);
        assert_eq!(rssi_changes, 1);
    }

    #[tokio::test]
    async fn connect_resolves_gatt_children() {
        let bus = MockBus::new();
        bus.add_peripheral(battery_peripheral("aa:bb:cc:dd:ee:02"));
        let path = device_path("hci0", "aa:bb:cc:dd:ee:02");
        bus.call(BLUEZ_SERVICE, &path, DEVICE_IFACE, "Connect", vec![])
            .await
            .unwrap();

        let tree = bus.get_managed_objects(BLUEZ_SERVICE).await.unwrap();
        let service_paths: Vec<_> = tree
            .keys()
            .filter(|p| p.contains("/service"))
            .cloned()
            .collect();
        assert_eq!(service_paths.len(), 2); // service + characteristic
        let resolved = bus
            .get_property(BLUEZ_SERVICE, &path, DEVICE_IFACE, "ServicesResolved")
            .await
            .unwrap();
        assert_eq!(resolved.as_bool(), Some(true));
    }

    #[tokio::test]
    async fn write_echo_round_trips() {
        let bus = MockBus::new();
        let peripheral = MockPeripheral::new("aa:bb:cc:dd:ee:03").with_service(
            MockService::new("0000ffe0-0000-1000-8000-00805f9b34fb").with_characteristic(
                MockCharacteristic::new(
                    "0000ffe1-0000-1000-8000-00805f9b34fb",
                    0x0010,
                    &["read", "write"],
                ),
            ),
        );
        bus.add_peripheral(peripheral);
        let dev = device_path("hci0", "aa:bb:cc:dd:ee:03");
        bus.call(BLUEZ_SERVICE, &dev, DEVICE_IFACE, "Connect", vec![])
            .await
            .unwrap();
        let chr_path = format!("{dev}/service0028/char0010");
        bus.call(
            BLUEZ_SERVICE,
            &chr_path,
            GATT_CHARACTERISTIC_IFACE,
            "WriteValue",
            vec![IpcValue::Bytes(vec![0x42]), crate::transport::empty_options()],
        )
        .await
        .unwrap();
        let value = bus
            .call(
                BLUEZ_SERVICE,
                &chr_path,
                GATT_CHARACTERISTIC_IFACE,
                "ReadValue",
                vec![crate::transport::empty_options()],
            )
            .await
            .unwrap();
        assert_eq!(value.to_byte_vec(), Some(vec![0x42]));
    }
}
