//! BLEEP observation store.
//!
//! Canonical cross-subsystem persistence: devices, advertisement reports,
//! GATT trees, characteristic history, classic service records, PBAP
//! metadata, classification evidence and AoI snapshots, all in one
//! schema-versioned embedded SQLite database.

pub mod error;
pub mod query;
pub mod rows;
pub mod store;

pub use error::{StoreError, StoreResult};
pub use query::DeviceFilter;
pub use rows::{
    AdvReportRow, AoiAnalysisRow, CharHistoryRow, CharacteristicInput, CharacteristicRow,
    ClassicServiceInput, ClassicServiceRow, DescriptorInput, DescriptorRow, DeviceAttrs,
    DeviceDetail, DeviceRow, DeviceType, EvidenceInput, EvidenceRow, EvidenceWeight, HandleInput,
    HistorySource, PbapMetadataRow, ServiceInput, ServiceRow,
};
pub use store::{ObservationStore, SCHEMA_VERSION};
