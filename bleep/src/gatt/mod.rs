//! GATT engine: resolution, read/write/notify primitives, enumeration
//! variants, landmine and permission bookkeeping.

pub mod enumerate;
pub mod ops;
pub mod payloads;
pub mod resolve;

pub use enumerate::{
    brute_write_range, enumerate, multi_read_all, multi_read_characteristic, multi_write_all,
    small_write_probe, BruteWriteOutcome, EnumOptions, EnumVariant, EnumerationReport, PassState,
    ReadOutcome, WriteStatus,
};
pub use ops::{
    read_characteristic, read_descriptor, start_notify, start_notify_raw, stop_notify,
    write_characteristic, WriteInput, WriteMode,
};
pub use payloads::{build_payload_iterator, PayloadSpec};
pub use resolve::{
    resolve_gatt, GattMapping, NodeKind, ResolvedCharacteristic, ResolvedDescriptor,
    ResolvedService,
};

use std::collections::BTreeMap;

/// Characteristics whose read stalled the device or failed unrecoverably,
/// keyed by characteristic UUID with the observed failure categories.
/// Later passes skip these unless forced.
pub type LandmineMap = BTreeMap<String, Vec<String>>;

/// Per-characteristic map from attempted operation to observed error kind.
pub type PermissionMap = BTreeMap<String, BTreeMap<String, String>>;
