//! UUID normalisation and translation.
//!
//! Accepts 16-bit, 32-bit and 128-bit input in the common spellings
//! (`180f`, `0x180F`, dashed, undashed) and resolves names against every
//! table, because a 16-bit value can legitimately appear in more than one.

use serde::Serialize;
use thiserror::Error;

use crate::tables::{lookup, UuidCategory};

/// Canonical Bluetooth SIG base UUID.
pub const SIG_BASE_UUID: &str = "00000000-0000-1000-8000-00805f9b34fb";
const SIG_BASE_SUFFIX: &str = "-0000-1000-8000-00805f9b34fb";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RefError {
    #[error("invalid UUID input: {0}")]
    InvalidUuid(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum UuidFormat {
    #[serde(rename = "16-bit")]
    Short16,
    #[serde(rename = "32-bit")]
    Medium32,
    #[serde(rename = "128-bit")]
    Full128,
}

/// One table hit for a translated UUID.
#[derive(Debug, Clone, Serialize)]
pub struct UuidMatch {
    pub category: String,
    pub name: String,
    pub source: String,
}

/// Result of [`translate_uuid`].
#[derive(Debug, Clone, Serialize)]
pub struct UuidTranslation {
    pub normalized_128: String,
    pub format: UuidFormat,
    pub short_form: Option<String>,
    pub matches: Vec<UuidMatch>,
}

/// Single best identity for a UUID, for display contexts that want one line.
#[derive(Debug, Clone, Serialize)]
pub struct UuidIdentity {
    pub category: String,
    pub short_form: String,
    pub name: String,
}

fn strip_input(input: &str) -> String {
    let trimmed = input.trim();
    let trimmed = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    trimmed.to_ascii_lowercase()
}

fn is_hex(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_hexdigit())
}

fn dashed(hex32: &str) -> String {
    format!(
        "{}-{}-{}-{}-{}",
        &hex32[0..8],
        &hex32[8..12],
        &hex32[12..16],
        &hex32[16..20],
        &hex32[20..32]
    )
}

/// Normalise any accepted form to the dashed lowercase 128-bit form.
pub fn normalize_uuid(input: &str) -> Result<String, RefError> {
    Ok(translate_uuid(input)?.normalized_128)
}

/// Short form of a 128-bit UUID when it sits on the SIG base, else `None`.
pub fn short_form_of(normalized_128: &str) -> Option<String> {
    if !normalized_128.ends_with(SIG_BASE_SUFFIX) {
        return None;
    }
    let head = &normalized_128[..8];
    if let Some(short) = head.strip_prefix("0000") {
        Some(short.to_string())
    } else {
        Some(head.to_string())
    }
}

/// Translate a UUID in any accepted form.
///
/// The `matches` list covers every table the short form appears in; callers
/// that need a single answer use [`identify_uuid`].
pub fn translate_uuid(input: &str) -> Result<UuidTranslation, RefError> {
    let cleaned = strip_input(input);

    let (normalized_128, format) = if cleaned.len() == 4 && is_hex(&cleaned) {
        (
            format!("0000{}{}", cleaned, SIG_BASE_SUFFIX),
            UuidFormat::Short16,
        )
    } else if cleaned.len() == 8 && is_hex(&cleaned) {
        (
            format!("{}{}", cleaned, SIG_BASE_SUFFIX),
            UuidFormat::Medium32,
        )
    } else if cleaned.len() == 32 && is_hex(&cleaned) {
        (dashed(&cleaned), UuidFormat::Full128)
    } else if cleaned.len() == 36 {
        let undashed: String = cleaned.chars().filter(|c| *c != '-').collect();
        if undashed.len() != 32 || !is_hex(&undashed) {
            return Err(RefError::InvalidUuid(input.to_string()));
        }
        // uuid::Uuid validates dash placement
        uuid::Uuid::parse_str(&cleaned)
            .map_err(|_| RefError::InvalidUuid(input.to_string()))?;
        (dashed(&undashed), UuidFormat::Full128)
    } else {
        return Err(RefError::InvalidUuid(input.to_string()));
    };

    let short_form = short_form_of(&normalized_128);
    let mut matches = Vec::new();
    if let Some(short) = short_form.as_deref() {
        if short.len() == 4 {
            for category in UuidCategory::ALL {
                if let Some(name) = lookup(category, short) {
                    matches.push(UuidMatch {
                        category: category.name().to_string(),
                        name: name.to_string(),
                        source: format!("assigned_numbers.{}", category.name().to_lowercase()),
                    });
                }
            }
        }
    }

    Ok(UuidTranslation {
        normalized_128,
        format,
        short_form,
        matches,
    })
}

/// Best single identity for a UUID, preferring the more specific tables.
pub fn identify_uuid(input: &str) -> Option<UuidIdentity> {
    let translation = translate_uuid(input).ok()?;
    let short_form = translation.short_form.clone()?;
    let first = translation.matches.first()?;
    Some(UuidIdentity {
        category: first.category.clone(),
        short_form,
        name: first.name.clone(),
    })
}

/// Whether the UUID resolves to a GATT service assigned number.
pub fn is_gatt_service_uuid(input: &str) -> bool {
    matches_category(input, UuidCategory::Service)
}

/// Whether the UUID resolves to a Classic profile / service-class number.
pub fn is_classic_service_uuid(input: &str) -> bool {
    matches_category(input, UuidCategory::ServiceClass)
}

fn matches_category(input: &str, category: UuidCategory) -> bool {
    translate_uuid(input)
        .ok()
        .and_then(|t| t.short_form)
        .map(|short| lookup(category, &short).is_some())
        .unwrap_or(false)
}
