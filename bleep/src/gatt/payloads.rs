//! Payload iterator for brute-write passes.
//!
//! Supports byte ranges plus named patterns: `ascii`, `inc`
//! (length-prefixed incrementing), `alt` (alternating 0x55/0xAA),
//! `repeat:<byte>:<len>` and `hex:<string>`. Duplicates are removed while
//! preserving order.

use std::collections::HashSet;

/// Declarative payload selection.
#[derive(Debug, Clone, Default)]
pub struct PayloadSpec {
    /// Inclusive single-byte range.
    pub range: Option<(u8, u8)>,
    /// Named patterns, evaluated in order.
    pub patterns: Vec<String>,
    /// Literal payload appended last (file contents, crafted frame).
    pub literal: Option<Vec<u8>>,
}

impl PayloadSpec {
    pub fn full_byte_range() -> Self {
        Self {
            range: Some((0x00, 0xff)),
            ..Default::default()
        }
    }
}

fn ascii_patterns(out: &mut Vec<Vec<u8>>) {
    for byte in b'A'..=b'Z' {
        out.push(vec![byte]);
    }
    for byte in b'a'..=b'z' {
        out.push(vec![byte]);
    }
    for byte in b'0'..=b'9' {
        out.push(vec![byte]);
    }
}

fn increment_patterns(out: &mut Vec<Vec<u8>>, max_len: usize) {
    let mut seq = vec![0u8];
    while seq.len() <= max_len {
        out.push(seq.clone());
        let next = (seq.len() & 0xff) as u8;
        seq.push(next);
    }
}

/// Expand a payload spec into the ordered, de-duplicated payload list.
pub fn build_payload_iterator(spec: &PayloadSpec) -> Vec<Vec<u8>> {
    let mut payloads: Vec<Vec<u8>> = Vec::new();
    if let Some((start, end)) = spec.range {
        for value in start..=end {
            payloads.push(vec![value]);
        }
    }
    for pattern in &spec.patterns {
        match pattern.as_str() {
            "ascii" => ascii_patterns(&mut payloads),
            "inc" | "increment" => increment_patterns(&mut payloads, 4),
            "alt" => {
                payloads.push(vec![0xaa]);
                payloads.push(vec![0x55]);
            }
            other if other.starts_with("repeat:") => {
                // repeat:<byte>:<len> -> e.g. repeat:ff:4
                let mut parts = other.splitn(3, ':');
                let _ = parts.next();
                let byte = parts.next().and_then(|b| u8::from_str_radix(b, 16).ok());
                let len = parts.next().and_then(|l| {
                    let l = l.trim();
                    if let Some(hex) = l.strip_prefix("0x") {
                        usize::from_str_radix(hex, 16).ok()
                    } else {
                        l.parse::<usize>().ok()
                    }
                });
                if let (Some(byte), Some(len)) = (byte, len) {
                    payloads.push(vec![byte; len]);
                }
                // malformed pattern is ignored
            }
            other if other.starts_with("hex:") => {
                if let Ok(bytes) = hex::decode(&other[4..]) {
                    payloads.push(bytes);
                }
            }
            other => {
                tracing::debug!(target: "bleep::gatt", pattern = other, "unknown payload pattern");
            }
        }
    }
    if let Some(literal) = &spec.literal {
        payloads.push(literal.clone());
    }

    let mut seen: HashSet<Vec<u8>> = HashSet::new();
    payloads.retain(|payload| seen.insert(payload.clone()));
    payloads
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_expands_inclusively() {
        let payloads = build_payload_iterator(&PayloadSpec {
            range: Some((0x00, 0x02)),
            ..Default::default()
        });
        assert_eq!(payloads, vec![vec![0x00], vec![0x01], vec![0x02]]);
    }

    #[test]
    fn named_patterns_expand() {
        let payloads = build_payload_iterator(&PayloadSpec {
            patterns: vec![
                "alt".into(),
                "repeat:ff:4".into(),
                "hex:deadbeef".into(),
                "repeat:broken".into(),
            ],
            ..Default::default()
        });
        assert!(payloads.contains(&vec![0xaa]));
        assert!(payloads.contains(&vec![0x55]));
        assert!(payloads.contains(&vec![0xff; 4]));
        assert!(payloads.contains(&vec![0xde, 0xad, 0xbe, 0xef]));
        assert_eq!(payloads.len(), 4); // malformed repeat dropped
    }

    #[test]
    fn increment_is_length_prefixed() {
        let payloads = build_payload_iterator(&PayloadSpec {
            patterns: vec!["inc".into()],
            ..Default::default()
        });
        assert_eq!(payloads[0], vec![0x00]);
        assert_eq!(payloads[1], vec![0x00, 0x01]);
        assert_eq!(payloads[2], vec![0x00, 0x01, 0x02]);
    }

    #[test]
    fn duplicates_removed_in_order() {
        let payloads = build_payload_iterator(&PayloadSpec {
            range: Some((0x55, 0x55)),
            patterns: vec!["alt".into()],
            ..Default::default()
        });
        assert_eq!(payloads, vec![vec![0x55], vec![0xaa]]);
    }

    #[test]
    fn ascii_covers_alphanumerics() {
        let payloads = build_payload_iterator(&PayloadSpec {
            patterns: vec!["ascii".into()],
            ..Default::default()
        });
        assert_eq!(payloads.len(), 26 + 26 + 10);
        assert!(payloads.contains(&vec![b'A']));
        assert!(payloads.contains(&vec![b'9']));
    }
}
