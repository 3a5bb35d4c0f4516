//! Embedded assigned-number tables.
//!
//! Bundled JSON documents parsed once at startup. Keys are lowercase 16-bit
//! hex short forms (appearance keys are decimal).

use std::collections::HashMap;

use once_cell::sync::Lazy;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct AssignedNumbers {
    pub services: HashMap<String, String>,
    pub characteristics: HashMap<String, String>,
    pub descriptors: HashMap<String, String>,
    pub service_classes: HashMap<String, String>,
    pub members: HashMap<String, String>,
    pub appearance: HashMap<String, String>,
}

pub static ASSIGNED: Lazy<AssignedNumbers> = Lazy::new(|| {
    serde_json::from_str(include_str!("../data/assigned_numbers.json"))
        .expect("bundled assigned-number table is valid JSON")
});

pub static COMPANY_IDS: Lazy<HashMap<String, String>> = Lazy::new(|| {
    serde_json::from_str(include_str!("../data/company_ids.json"))
        .expect("bundled company-id table is valid JSON")
});

/// Table a UUID short form can belong to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UuidCategory {
    Service,
    Characteristic,
    Descriptor,
    ServiceClass,
    Member,
}

impl UuidCategory {
    pub const ALL: [UuidCategory; 5] = [
        UuidCategory::Service,
        UuidCategory::Characteristic,
        UuidCategory::Descriptor,
        UuidCategory::ServiceClass,
        UuidCategory::Member,
    ];

    pub fn name(self) -> &'static str {
        match self {
            UuidCategory::Service => "Service",
            UuidCategory::Characteristic => "Characteristic",
            UuidCategory::Descriptor => "Descriptor",
            UuidCategory::ServiceClass => "Service Class",
            UuidCategory::Member => "Member",
        }
    }

    pub fn table(self) -> &'static HashMap<String, String> {
        match self {
            UuidCategory::Service => &ASSIGNED.services,
            UuidCategory::Characteristic => &ASSIGNED.characteristics,
            UuidCategory::Descriptor => &ASSIGNED.descriptors,
            UuidCategory::ServiceClass => &ASSIGNED.service_classes,
            UuidCategory::Member => &ASSIGNED.members,
        }
    }
}

/// Name for a 16-bit short form in one category.
pub fn lookup(category: UuidCategory, short_form: &str) -> Option<&'static str> {
    category
        .table()
        .get(&short_form.to_ascii_lowercase())
        .map(String::as_str)
}

/// Manufacturer name for a company identifier.
pub fn company_name(company_id: u16) -> Option<&'static str> {
    COMPANY_IDS
        .get(&format!("{company_id:04x}"))
        .map(String::as_str)
}

/// Human name for an appearance code.
pub fn appearance_name(appearance: u16) -> Option<&'static str> {
    ASSIGNED
        .appearance
        .get(&appearance.to_string())
        .map(String::as_str)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tables_parse_and_contain_well_known_entries() {
        assert_eq!(lookup(UuidCategory::Service, "180F"), Some("Battery"));
        assert_eq!(
            lookup(UuidCategory::Characteristic, "2a19"),
            Some("Battery Level")
        );
        assert_eq!(
            lookup(UuidCategory::Descriptor, "2902"),
            Some("Client Characteristic Configuration")
        );
        assert_eq!(
            lookup(UuidCategory::ServiceClass, "112f"),
            Some("Phonebook Access Server")
        );
    }

    #[test]
    fn company_and_appearance_lookups() {
        assert_eq!(company_name(0x004c), Some("Apple, Inc."));
        assert_eq!(appearance_name(961), Some("Keyboard"));
        assert!(company_name(0xfff0).is_none());
    }
}
