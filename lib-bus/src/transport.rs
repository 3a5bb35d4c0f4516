//! Typed object-bus transport contract.
//!
//! The host Bluetooth daemon is an external collaborator that exposes an
//! object tree with property-change and interface lifecycle signals. This
//! module pins the contract the rest of the engine is written against:
//! implementations speak whatever wire protocol the host offers, the engine
//! only ever sees [`BusTransport`].

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::error::BusResult;
use crate::value::{InterfaceMap, IpcValue, ManagedObjects, PropertyMap};

// Well-known service and interface names, inherited unchanged from the host
// stack's vocabulary.
pub const BLUEZ_SERVICE: &str = "org.bluez";
pub const OBEX_SERVICE: &str = "org.bluez.obex";
pub const BLUEZ_ROOT_PATH: &str = "/org/bluez";
pub const OBEX_ROOT_PATH: &str = "/org/bluez/obex";

pub const ADAPTER_IFACE: &str = "org.bluez.Adapter1";
pub const DEVICE_IFACE: &str = "org.bluez.Device1";
pub const GATT_SERVICE_IFACE: &str = "org.bluez.GattService1";
pub const GATT_CHARACTERISTIC_IFACE: &str = "org.bluez.GattCharacteristic1";
pub const GATT_DESCRIPTOR_IFACE: &str = "org.bluez.GattDescriptor1";
pub const AGENT_MANAGER_IFACE: &str = "org.bluez.AgentManager1";
pub const MEDIA_PLAYER_IFACE: &str = "org.bluez.MediaPlayer1";
pub const MEDIA_TRANSPORT_IFACE: &str = "org.bluez.MediaTransport1";
pub const OBEX_CLIENT_IFACE: &str = "org.bluez.obex.Client1";
pub const OBEX_SESSION_IFACE: &str = "org.bluez.obex.Session1";
pub const OBEX_PBAP_IFACE: &str = "org.bluez.obex.PhonebookAccess1";
pub const OBEX_TRANSFER_IFACE: &str = "org.bluez.obex.Transfer1";

/// A signal received from the bus. Deserialisation happens on the dispatch
/// task; consumers only ever see typed values.
#[derive(Debug, Clone)]
pub enum BusSignal {
    InterfacesAdded {
        path: String,
        interfaces: InterfaceMap,
    },
    InterfacesRemoved {
        path: String,
        interfaces: Vec<String>,
    },
    PropertiesChanged {
        path: String,
        interface: String,
        changed: PropertyMap,
        invalidated: Vec<String>,
    },
}

impl BusSignal {
    pub fn path(&self) -> &str {
        match self {
            BusSignal::InterfacesAdded { path, .. }
            | BusSignal::InterfacesRemoved { path, .. }
            | BusSignal::PropertiesChanged { path, .. } => path,
        }
    }
}

/// Agent capability profile announced at registration time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentCapability {
    NoInputNoOutput,
    DisplayOnly,
    DisplayYesNo,
    KeyboardOnly,
    KeyboardDisplay,
}

impl AgentCapability {
    pub fn wire_name(self) -> &'static str {
        match self {
            AgentCapability::NoInputNoOutput => "NoInputNoOutput",
            AgentCapability::DisplayOnly => "DisplayOnly",
            AgentCapability::DisplayYesNo => "DisplayYesNo",
            AgentCapability::KeyboardOnly => "KeyboardOnly",
            AgentCapability::KeyboardDisplay => "KeyboardDisplay",
        }
    }

    /// Whether a completed pairing under this profile produces a bond worth
    /// persisting.
    pub fn is_bondable(self) -> bool {
        !matches!(self, AgentCapability::NoInputNoOutput)
    }
}

/// Callbacks the host stack invokes on a registered pairing agent.
///
/// Every request may be interrupted by `cancel` at any time.
#[async_trait]
pub trait AgentCallbacks: Send + Sync {
    async fn release(&self);
    async fn request_pin_code(&self, device_path: &str) -> BusResult<String>;
    async fn display_pin_code(&self, device_path: &str, pin: &str) -> BusResult<()>;
    async fn request_passkey(&self, device_path: &str) -> BusResult<u32>;
    async fn display_passkey(&self, device_path: &str, passkey: u32, entered: u16);
    async fn request_confirmation(&self, device_path: &str, passkey: u32) -> BusResult<()>;
    async fn request_authorization(&self, device_path: &str) -> BusResult<()>;
    async fn authorize_service(&self, device_path: &str, uuid: &str) -> BusResult<()>;
    async fn cancel(&self);
}

/// The transport contract.
///
/// `service` arguments select between the Bluetooth daemon and its OBEX
/// sibling; `path`/`interface` address one interface of one object.
#[async_trait]
pub trait BusTransport: Send + Sync {
    /// Object-manager dump of the whole tree for `service`.
    async fn get_managed_objects(&self, service: &str) -> BusResult<ManagedObjects>;

    /// Invoke a method. `args` are marshalled in order; the reply is the
    /// method's (possibly empty) return tuple collapsed to a single value.
    async fn call(
        &self,
        service: &str,
        path: &str,
        interface: &str,
        method: &str,
        args: Vec<IpcValue>,
    ) -> BusResult<IpcValue>;

    async fn get_property(
        &self,
        service: &str,
        path: &str,
        interface: &str,
        name: &str,
    ) -> BusResult<IpcValue>;

    async fn set_property(
        &self,
        service: &str,
        path: &str,
        interface: &str,
        name: &str,
        value: IpcValue,
    ) -> BusResult<()>;

    async fn get_all_properties(
        &self,
        service: &str,
        path: &str,
        interface: &str,
    ) -> BusResult<PropertyMap>;

    /// Interface names exposed at `path`. Fails with `IntrospectionFailed`
    /// when the path yields none.
    async fn introspect(&self, service: &str, path: &str) -> BusResult<Vec<String>>;

    /// Subscribe to the raw signal stream. Receipt order is preserved per
    /// sender.
    fn subscribe(&self) -> broadcast::Receiver<BusSignal>;

    /// Register a pairing agent object with the host stack.
    async fn register_agent(
        &self,
        path: &str,
        capability: AgentCapability,
        callbacks: Arc<dyn AgentCallbacks>,
    ) -> BusResult<()>;

    async fn unregister_agent(&self, path: &str) -> BusResult<()>;

    async fn request_default_agent(&self, path: &str) -> BusResult<()>;

    /// Cheap liveness probe used by the pool before reusing a member.
    async fn is_healthy(&self) -> bool;
}

/// Extract the device MAC from a host object path
/// (`/org/bluez/hci0/dev_AA_BB_CC_DD_EE_FF/...`), normalised lowercase.
pub fn mac_from_path(path: &str) -> Option<String> {
    let segment = path.split('/').find(|seg| seg.starts_with("dev_"))?;
    let mac = segment.trim_start_matches("dev_").replace('_', ":");
    if mac.len() == 17 {
        Some(mac.to_ascii_lowercase())
    } else {
        None
    }
}

/// Build the host object path for a device MAC on an adapter.
pub fn device_path(adapter: &str, mac: &str) -> String {
    format!(
        "/org/bluez/{}/dev_{}",
        adapter,
        mac.to_ascii_uppercase().replace(':', "_")
    )
}

/// Option dictionaries are the host's catch-all extension point; an empty
/// dictionary is the canonical retry signature for peers that reject the
/// richer form.
pub fn empty_options() -> IpcValue {
    IpcValue::Dict(BTreeMap::new())
}
