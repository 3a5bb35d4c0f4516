//! Bluetooth Classic: SDP discovery, analysis, version inference, RFCOMM
//! and PBAP phonebook transfer.

pub mod analysis;
pub mod pbap;
pub mod rfcomm;
pub mod sdp;
pub mod tools;
pub mod version;

pub use analysis::{analyze_sdp_records, SdpAnalysis};
pub use pbap::{
    pull_phonebook, PbapOptions, PbapResult, PhonebookPull, VcardFormat, DEFAULT_PBAP_REPOS,
};
pub use rfcomm::{LoopbackRfcommConnector, RfcommConnector, RfcommStream};
pub use sdp::{
    discover_services_sdp, discover_services_sdp_connectionless, parse_sdp_tool_output, SdpRecord,
};
pub use tools::{ClassicTools, PingStats, SystemClassicTools};
pub use version::{map_lmp_version_to_spec, map_profile_version_to_spec, VersionInfo};
