//! Bluetooth version inference.
//!
//! Heuristic mapping from LMP versions and profile versions onto core spec
//! versions. Raw values are always preserved alongside the inference so
//! downstream consumers can reinterpret.

use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct VersionInfo {
    pub lmp_version: Option<u8>,
    pub lmp_subversion: Option<u16>,
    pub manufacturer: Option<u16>,
    pub inferred_spec: Option<String>,
}

/// LMP version byte to core-spec version string.
pub fn map_lmp_version_to_spec(lmp_version: Option<u8>) -> Option<&'static str> {
    Some(match lmp_version? {
        0 => "1.0b",
        1 => "1.1",
        2 => "1.2",
        3 => "2.0 + EDR",
        4 => "2.1 + EDR",
        5 => "3.0 + HS",
        6 => "4.0",
        7 => "4.1",
        8 => "4.2",
        9 => "5.0",
        10 => "5.1",
        11 => "5.2",
        12 => "5.3",
        13 => "5.4",
        14 => "6.0",
        _ => return None,
    })
}

/// Profile descriptor version word (major.minor) to a printable form.
pub fn map_profile_version_to_spec(profile_version: Option<u16>) -> Option<String> {
    let version = profile_version?;
    Some(format!("{}.{}", version >> 8, version & 0xff))
}

impl VersionInfo {
    pub fn from_raw(
        lmp_version: Option<u8>,
        lmp_subversion: Option<u16>,
        manufacturer: Option<u16>,
    ) -> Self {
        Self {
            inferred_spec: map_lmp_version_to_spec(lmp_version).map(str::to_string),
            lmp_version,
            lmp_subversion,
            manufacturer,
        }
    }

    /// Parse controller tool output of the shape
    /// `HCI Version: 5.2 (0xb)  LMP Version: 5.2 (0xb)  Manufacturer: ... (2)`.
    pub fn from_controller_output(output: &str) -> Self {
        let rx_lmp = regex::Regex::new(r"LMP Version:[^(]*\(0x([0-9a-fA-F]+)\)")
            .expect("static regex");
        let rx_sub = regex::Regex::new(r"Subversion:?\s*0x([0-9a-fA-F]+)").expect("static regex");
        let rx_mfr = regex::Regex::new(r"Manufacturer:[^(]*\((\d+)\)").expect("static regex");
        let lmp = rx_lmp
            .captures(output)
            .and_then(|c| u8::from_str_radix(&c[1], 16).ok());
        let sub = rx_sub
            .captures(output)
            .and_then(|c| u16::from_str_radix(&c[1], 16).ok());
        let mfr = rx_mfr.captures(output).and_then(|c| c[1].parse().ok());
        Self::from_raw(lmp, sub, mfr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lmp_table_covers_known_versions() {
        assert_eq!(map_lmp_version_to_spec(Some(9)), Some("5.0"));
        assert_eq!(map_lmp_version_to_spec(Some(6)), Some("4.0"));
        assert_eq!(map_lmp_version_to_spec(Some(99)), None);
        assert_eq!(map_lmp_version_to_spec(None), None);
    }

    #[test]
    fn profile_version_words_print_major_minor() {
        assert_eq!(map_profile_version_to_spec(Some(0x0102)).as_deref(), Some("1.2"));
        assert_eq!(map_profile_version_to_spec(Some(0x0104)).as_deref(), Some("1.4"));
    }

    #[test]
    fn controller_output_parses_with_raw_preserved() {
        let output = "\tHCI Version: 5.2 (0xb)  Revision: 0x100\n\tLMP Version: 5.2 (0xb)  Subversion: 0x2103\n\tManufacturer: Intel Corp. (2)\n";
        let info = VersionInfo::from_controller_output(output);
        assert_eq!(info.lmp_version, Some(0x0b));
        assert_eq!(info.lmp_subversion, Some(0x2103));
        assert_eq!(info.manufacturer, Some(2));
        assert_eq!(info.inferred_spec.as_deref(), Some("5.2"));
    }
}
