//! Bluetooth assigned-number reference data for BLEEP.
//!
//! Embedded tables (services, characteristics, descriptors, classic service
//! classes, member UUIDs, company identifiers, appearance codes) with a
//! translation API that normalises 16/32/128-bit UUID input and surfaces
//! every table a short form appears in.

pub mod device_class;
pub mod tables;
pub mod translate;

pub use device_class::{decode_device_class, DeviceClass};
pub use tables::{appearance_name, company_name, lookup, UuidCategory};
pub use translate::{
    identify_uuid, is_classic_service_uuid, is_gatt_service_uuid, normalize_uuid, short_form_of,
    translate_uuid, RefError, UuidFormat, UuidIdentity, UuidMatch, UuidTranslation, SIG_BASE_UUID,
};
