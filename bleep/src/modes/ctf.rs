//! BLE-CTF flow.
//!
//! Target comes from `BLE_CTF_MAC`. The flow enumerates the scoreboard
//! device, reads the score, sweeps every readable characteristic for
//! flag-looking values and submits candidates above the confidence
//! threshold to the flag characteristic.

use std::sync::Arc;

use anyhow::Result;
use serde::Serialize;
use tracing::{debug, info};

use crate::context::Context;
use crate::gatt::{
    read_characteristic, write_characteristic, EnumOptions, EnumVariant, ReadOutcome, WriteInput,
    WriteMode,
};
use crate::modes::enumerate::connect_and_enumerate;

/// Scoreboard service and well-known characteristics of the BLE CTF image.
pub const CTF_SERVICE_UUID: &str = "000000ff-0000-1000-8000-00805f9b34fb";
pub const CTF_SCORE_UUID: &str = "0000ff01-0000-1000-8000-00805f9b34fb";
pub const CTF_FLAG_SUBMIT_UUID: &str = "0000ff02-0000-1000-8000-00805f9b34fb";

/// Candidates below this confidence are reported but not submitted.
/// Empirically chosen; the scoring is documented in DESIGN.md.
const SUBMIT_THRESHOLD: f64 = 0.6;

#[derive(Debug, Clone, Serialize)]
pub struct FlagCandidate {
    pub char_uuid: String,
    pub flag: String,
    pub confidence: f64,
    pub submitted: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct CtfReport {
    pub mac: String,
    pub score_before: Option<String>,
    pub score_after: Option<String>,
    pub candidates: Vec<FlagCandidate>,
}

/// Heuristic flag extraction with confidence scoring.
///
/// CTF flags are MD5-style hex strings or short printable tokens; score
/// accordingly and let the threshold decide.
pub fn extract_flag_candidate(value: &[u8]) -> Option<(String, f64)> {
    if value.is_empty() || value.len() > 64 {
        return None;
    }
    let text = std::str::from_utf8(value).ok()?.trim().to_string();
    if text.is_empty() || !text.chars().all(|c| c.is_ascii_graphic() || c == ' ') {
        return None;
    }
    let hexish = text.chars().all(|c| c.is_ascii_hexdigit());
    let mut confidence: f64 = 0.0;
    if hexish && text.len() == 32 {
        // Classic md5sum-shaped flag.
        confidence = 0.9;
    } else if hexish && text.len() >= 16 {
        confidence = 0.7;
    } else if text.len() >= 12 {
        confidence = 0.5;
    } else if text.len() >= 6 {
        confidence = 0.3;
    }
    if confidence == 0.0 {
        None
    } else {
        Some((text, confidence))
    }
}

/// Run the CTF flow against the configured target.
pub async fn run_ctf(ctx: &Arc<Context>) -> Result<CtfReport> {
    let Some(mac) = ctx.config.ctf_mac.clone() else {
        anyhow::bail!("no CTF target configured; set BLE_CTF_MAC");
    };
    info!(target: "bleep::ctf", mac = %mac, "CTF flow starting");

    let opts = EnumOptions {
        rounds: 1,
        ..Default::default()
    };
    let (device, report, _classification) =
        connect_and_enumerate(ctx, &mac, EnumVariant::Naggy, &opts).await?;

    let read_score = |tag: &str| {
        let device = device.clone();
        let mapping = report.mapping.clone();
        let tag = tag.to_string();
        async move {
            let index = mapping.find_characteristic(CTF_SCORE_UUID)?;
            let chr = mapping.characteristic(index).clone();
            let service_uuid = mapping.services[index.0].uuid.clone();
            match read_characteristic(&device, &chr, &service_uuid, false).await {
                Ok(bytes) => {
                    let score = String::from_utf8_lossy(&bytes).trim().to_string();
                    debug!(target: "bleep::ctf", %tag, %score, "scoreboard read");
                    Some(score)
                }
                Err(_) => None,
            }
        }
    };

    let score_before = read_score("before").await;

    // Sweep the first-round read outcomes for flag-shaped values.
    let mut candidates = Vec::new();
    if let Some(round) = report.rounds.get(&1) {
        for (char_uuid, outcome) in round {
            // Never resubmit the scoreboard or submission characteristics.
            if char_uuid == CTF_SCORE_UUID || char_uuid == CTF_FLAG_SUBMIT_UUID {
                continue;
            }
            let ReadOutcome::Value(value) = outcome else {
                continue;
            };
            let Some((flag, confidence)) = extract_flag_candidate(value) else {
                continue;
            };
            candidates.push(FlagCandidate {
                char_uuid: char_uuid.clone(),
                flag,
                confidence,
                submitted: false,
            });
        }
    }
    candidates.sort_by(|a, b| b.confidence.partial_cmp(&a.confidence).unwrap_or(std::cmp::Ordering::Equal));

    // Submit everything above the threshold.
    if let Some(index) = report.mapping.find_characteristic(CTF_FLAG_SUBMIT_UUID) {
        let submit_chr = report.mapping.characteristic(index).clone();
        let service_uuid = report.mapping.services[index.0].uuid.clone();
        for candidate in &mut candidates {
            if candidate.confidence < SUBMIT_THRESHOLD {
                continue;
            }
            match write_characteristic(
                &device,
                &submit_chr,
                &service_uuid,
                &WriteInput::Ascii(candidate.flag.clone()),
                WriteMode::Auto,
            )
            .await
            {
                Ok(()) => {
                    candidate.submitted = true;
                    info!(
                        target: "bleep::ctf",
                        flag = %candidate.flag,
                        confidence = candidate.confidence,
                        "flag submitted"
                    );
                }
                Err(err) => {
                    debug!(target: "bleep::ctf", error = %err, "flag submission failed");
                }
            }
        }
    }

    let score_after = read_score("after").await;
    device.ctx.router.flush().await;

    Ok(CtfReport {
        mac,
        score_before,
        score_after,
        candidates,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn md5_shaped_values_score_highest() {
        let (flag, confidence) =
            extract_flag_candidate(b"d205303e099ceff44835d51af11d1c72").unwrap();
        assert_eq!(flag.len(), 32);
        assert!(confidence >= 0.9);
    }

    #[test]
    fn short_printable_values_score_low() {
        let (_, confidence) = extract_flag_candidate(b"hello!").unwrap();
        assert!(confidence < SUBMIT_THRESHOLD);
    }

    #[test]
    fn binary_and_oversized_values_are_rejected() {
        assert!(extract_flag_candidate(&[0x00, 0x01, 0x02]).is_none());
        assert!(extract_flag_candidate(&[b'a'; 80]).is_none());
        assert!(extract_flag_candidate(b"").is_none());
    }
}
