//! BLEEP - Bluetooth Landscape Exploration & Enumeration Platform.
//!
//! The core reconnaissance engine: adapter and discovery state machines,
//! device lifecycle with staged recovery, the GATT enumeration engine with
//! landmine and permission mapping, the classic SDP/OBEX/PBAP stack, signal
//! capture and routing, the pairing agent with its bond store, the
//! evidence-based device-type classifier, AoI analysis and the four mode
//! orchestrators.
//!
//! The engine talks to the host Bluetooth daemon exclusively through the
//! `lib-bus` transport contract and persists observations through
//! `lib-observations`. Interface layers (CLI/TUI, report rendering) live
//! outside this crate.

pub mod adapter;
pub mod analysis;
pub mod agent;
pub mod classic;
pub mod classify;
pub mod config;
pub mod context;
pub mod device;
pub mod discovery;
pub mod gatt;
pub mod modes;
pub mod signals;

pub use adapter::{Adapter, AdapterState, DiscoveryFilter, Transport};
pub use agent::{AgentIo, AutoAcceptIo, BondRecord, BondStore, PairingAgent, PairingState};
pub use analysis::{analyse_device, AoiReport};
pub use classify::{classify, ClassificationResult, ClassifyContext, DeviceTypeClassifier};
pub use config::{init_logging, CoreConfig};
pub use context::Context;
pub use device::{Device, DeviceState};
pub use discovery::{DiscoveredDevice, ScanOptions, ScanReport};
pub use gatt::{
    EnumOptions, EnumVariant, EnumerationReport, GattMapping, LandmineMap, PermissionMap,
};
pub use modes::{connect_and_enumerate, run_ctf, scan_with_mode, ScanMode};

// Re-export the sibling crates the way the workspace's consumers expect.
pub use lib_bus;
pub use lib_observations;
pub use lib_ref;
