//! Cross-device security analysis.

pub mod aoi;

pub use aoi::{analyse_device, AoiReport};
