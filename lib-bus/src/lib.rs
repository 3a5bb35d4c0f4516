//! BLEEP IPC transport and reliability layer.
//!
//! The engine above this crate never talks to the host Bluetooth daemon
//! directly: it goes through the [`transport::BusTransport`] contract, the
//! pooled acquisition in [`pool`], and the reliability primitives here
//! (per-operation timeouts, health heartbeat, staged recovery, rolling
//! metrics). An in-memory [`mock::MockBus`] implements the full contract for
//! tests and headless environments.

pub mod cancel;
pub mod error;
pub mod health;
pub mod metrics;
pub mod mock;
pub mod pool;
pub mod recovery;
pub mod timeout;
pub mod transport;
pub mod value;

pub use cancel::CancelToken;
pub use error::{BusError, BusResult};
pub use health::{HealthEvent, HealthMonitor};
pub use metrics::{IssueThresholds, LatencyStats, MetricIssue, MetricsCollector};
pub use pool::{BusFactory, BusGuard, BusPool, Proxy};
pub use recovery::{RecoveryManager, RecoveryOps, RecoveryStage};
pub use timeout::{with_budget, with_timeout, OpClass};
pub use transport::{
    device_path, empty_options, mac_from_path, AgentCallbacks, AgentCapability, BusSignal,
    BusTransport, ADAPTER_IFACE, AGENT_MANAGER_IFACE, BLUEZ_ROOT_PATH, BLUEZ_SERVICE,
    DEVICE_IFACE, GATT_CHARACTERISTIC_IFACE, GATT_DESCRIPTOR_IFACE, GATT_SERVICE_IFACE,
    MEDIA_PLAYER_IFACE, MEDIA_TRANSPORT_IFACE, OBEX_CLIENT_IFACE, OBEX_PBAP_IFACE,
    OBEX_ROOT_PATH, OBEX_SERVICE, OBEX_SESSION_IFACE, OBEX_TRANSFER_IFACE,
};
pub use value::{InterfaceMap, IpcValue, ManagedObjects, PropertyMap};
