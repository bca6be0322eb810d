//! Recovery of cardholder data from whatever the records actually contain.
//!
//! Issuer layouts vary wildly: some cards put everything in one neat 0x70
//! template, some scatter fields across SFIs, some return blobs no strict
//! parser will swallow. Recovery therefore runs three strategies in order,
//! each one only filling fields the previous ones left empty:
//!
//! 1. decode the concatenation of every record strictly and pull known tags;
//! 2. scavenge each record individually for byte signatures;
//! 3. derive PAN and expiry from Track 2 Equivalent Data, if present.

use crate::session::RecordMap;
use crate::{ber, scavenge};
use tracing::debug;

/// What the card was willing to say about its holder. Any field may be
/// missing; a value that fails its plausibility check is dropped, not fixed.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CardholderRecord {
    /// 0x5A, BCD digits.
    pub pan: Option<String>,
    /// The PAN with the middle digits starred out.
    pub pan_masked: Option<String>,
    /// 0x5F24, rendered `20YY-MM-DD`.
    pub expiry_date: Option<String>,
    /// 0x5F20, printable ASCII.
    pub cardholder_name: Option<String>,
    /// 0x57, hex-rendered as-is.
    pub track2: Option<String>,
    /// PAN recovered from track 2 (the part before the 'D' separator).
    pub track2_pan: Option<String>,
    /// Expiry recovered from track 2, rendered `20YY-MM`.
    pub track2_expiry: Option<String>,
    /// 0x5F30, BCD.
    pub service_code: Option<String>,
}

const TAG_PAN: u16 = 0x5A;
const TAG_TRACK2: u16 = 0x57;
const TAG_NAME: u16 = 0x5F20;
const TAG_EXPIRY: u16 = 0x5F24;
const TAG_SERVICE_CODE: u16 = 0x5F30;

/// Runs the full recovery pipeline over a session's records.
pub fn recover(records: &RecordMap) -> CardholderRecord {
    let mut card = CardholderRecord::default();

    // Strategy 1: strict TLV over the concatenated records.
    let mut all = Vec::new();
    for sfi in records.values() {
        for data in sfi.values() {
            all.extend_from_slice(data);
        }
    }
    let (nodes, _) = ber::decode(&all);
    for tag in [TAG_PAN, TAG_TRACK2, TAG_NAME, TAG_EXPIRY, TAG_SERVICE_CODE] {
        for value in ber::find_all(&nodes, tag) {
            card.absorb(tag, value);
        }
    }

    // Strategy 2: per-record signature scan for anything still missing.
    if !card.complete() {
        for (sfi, sfi_records) in records {
            for (num, data) in sfi_records {
                let found = scavenge::scavenge(data, scavenge::CARDHOLDER);
                if !found.is_empty() {
                    debug!(sfi, num, tags = found.len(), "scavenged record");
                }
                for (tag, value) in found {
                    card.absorb(tag, value);
                }
            }
        }
    }

    // Strategy 3: track 2 fills whatever the primary tags didn't provide.
    card.derive_from_track2();
    card
}

impl CardholderRecord {
    /// Feeds one tag's value through the plausibility checks. Existing fields
    /// are never overwritten; the first plausible value wins.
    pub fn absorb(&mut self, tag: u16, value: &[u8]) {
        match tag {
            TAG_PAN if self.pan.is_none() => {
                if let Some(pan) = plausible_pan(value) {
                    self.pan_masked = Some(mask_pan(&pan));
                    self.pan = Some(pan);
                }
            }
            TAG_EXPIRY if self.expiry_date.is_none() => {
                self.expiry_date = render_expiry(value);
            }
            TAG_NAME if self.cardholder_name.is_none() => {
                self.cardholder_name = sanitize_name(value);
            }
            TAG_TRACK2 if self.track2.is_none() && !value.is_empty() => {
                self.track2 = Some(render_bcd(value));
            }
            TAG_SERVICE_CODE if self.service_code.is_none() && !value.is_empty() => {
                self.service_code = Some(render_bcd(value));
            }
            _ => {}
        }
    }

    fn complete(&self) -> bool {
        self.pan.is_some()
            && self.expiry_date.is_some()
            && self.cardholder_name.is_some()
            && self.track2.is_some()
            && self.service_code.is_some()
    }

    /// Splits track 2 on its 'D' separator: PAN before, YYMM expiry after.
    /// Derived values fill the primary fields only where those are missing;
    /// the card's own 0x5A and 0x5F24 always win.
    fn derive_from_track2(&mut self) {
        let Some(track2) = self.track2.as_deref() else {
            return;
        };
        let Some((pan_part, rest)) = track2.split_once('D') else {
            return;
        };

        let pan_part = pan_part.trim_end_matches('F');
        if pan_part.len() >= 8 && pan_part.bytes().all(|b| b.is_ascii_digit()) {
            self.track2_pan = Some(pan_part.to_string());
            if self.pan.is_none() {
                self.pan = Some(pan_part.to_string());
                self.pan_masked = Some(mask_pan(pan_part));
            }
        }

        if rest.len() >= 4 && rest[..4].bytes().all(|b| b.is_ascii_digit()) {
            let expiry = format!("20{}-{}", &rest[..2], &rest[2..4]);
            if self.expiry_date.is_none() {
                self.expiry_date = Some(expiry.clone());
            }
            self.track2_expiry = Some(expiry);
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Renders BCD bytes as their hex digit string, eg. `[0x47, 0x61]` → "4761".
pub fn render_bcd(bytes: &[u8]) -> String {
    hex::encode_upper(bytes)
}

/// BCD-renders a candidate PAN and applies the plausibility rules: trailing
/// 'F' padding stripped, at least 8 digits, nothing but digits.
pub fn plausible_pan(value: &[u8]) -> Option<String> {
    let rendered = render_bcd(value);
    let pan = rendered.trim_end_matches('F');
    if pan.len() >= 8 && pan.bytes().all(|b| b.is_ascii_digit()) {
        Some(pan.to_string())
    } else {
        None
    }
}

/// `<first 6>…<last 4>` with the middle starred out. The masked form has the
/// same length as the input.
pub fn mask_pan(pan: &str) -> String {
    if pan.len() < 10 {
        return "*".repeat(pan.len());
    }
    format!(
        "{}{}{}",
        &pan[..6],
        "*".repeat(pan.len() - 10),
        &pan[pan.len() - 4..]
    )
}

/// Printable ASCII only, trimmed; a single character is not a name.
fn sanitize_name(bytes: &[u8]) -> Option<String> {
    let name: String = bytes
        .iter()
        .filter(|b| (0x20..=0x7E).contains(*b))
        .map(|&b| b as char)
        .collect();
    let name = name.trim().to_string();
    if name.len() > 1 {
        Some(name)
    } else {
        None
    }
}

/// Three BCD bytes YY MM DD → `20YY-MM-DD`. The card is the authority on its
/// own dates; out-of-range months and days are kept as they came.
fn render_expiry(value: &[u8]) -> Option<String> {
    if value.len() < 3 {
        return None;
    }
    Some(format!(
        "20{:02X}-{:02X}-{:02X}",
        value[0], value[1], value[2]
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn record_map(records: &[(u8, u8, &[u8])]) -> RecordMap {
        let mut map = RecordMap::new();
        for (sfi, num, data) in records {
            map.entry(*sfi).or_insert_with(BTreeMap::new).insert(*num, data.to_vec());
        }
        map
    }

    #[test]
    fn test_recover_pan_and_expiry() {
        let map = record_map(&[(
            1,
            1,
            &[
                0x70, 0x13, 0x5A, 0x08, 0x47, 0x61, 0x73, 0x90, 0x01, 0x01, 0x00, 0x10, 0x5F,
                0x24, 0x03, 0x25, 0x12, 0x31,
            ],
        )]);
        let card = recover(&map);
        assert_eq!(card.pan.as_deref(), Some("4761739001010010"));
        assert_eq!(card.pan_masked.as_deref(), Some("476173******0010"));
        assert_eq!(card.expiry_date.as_deref(), Some("2025-12-31"));
    }

    #[test]
    fn test_recover_track2_only() {
        let map = record_map(&[(
            1,
            1,
            &[
                0x57, 0x0D, 0x47, 0x61, 0x73, 0x90, 0x01, 0x01, 0x00, 0x10, 0xD2, 0x51, 0x22,
                0x01, 0x23, 0x45, 0x6F,
            ],
        )]);
        let card = recover(&map);
        assert_eq!(card.track2_pan.as_deref(), Some("4761739001010010"));
        assert_eq!(card.track2_expiry.as_deref(), Some("2025-12"));
        // No 0x5A anywhere, so track 2 supplies the primary PAN too.
        assert_eq!(card.pan.as_deref(), Some("4761739001010010"));
        assert_eq!(card.pan_masked.as_deref(), Some("476173******0010"));
    }

    #[test]
    fn test_track2_never_overrides_primary_tags() {
        // 0x5A and a track 2 that disagrees with it.
        let map = record_map(&[(
            1,
            1,
            &[
                0x70, 0x17, 0x5A, 0x08, 0x47, 0x61, 0x73, 0x90, 0x01, 0x01, 0x00, 0x10, 0x57,
                0x0B, 0x51, 0x11, 0x11, 0x11, 0x11, 0x11, 0x11, 0x11, 0xD3, 0x00, 0x1F,
            ],
        )]);
        let card = recover(&map);
        assert_eq!(card.pan.as_deref(), Some("4761739001010010"));
        assert_eq!(card.track2_pan.as_deref(), Some("5111111111111111"));
        assert_eq!(card.track2_expiry.as_deref(), Some("2030-01"));
    }

    #[test]
    fn test_recover_scavenges_unparseable_records() {
        // A record that isn't TLV: strategy 1 gets nothing, strategy 2 finds
        // the name signature.
        let map = record_map(&[(
            2,
            1,
            &[
                0xFF, 0x00, 0x5F, 0x20, 0x0A, 0x44, 0x4F, 0x45, 0x2F, 0x4A, 0x4F, 0x48, 0x4E,
                0x20, 0x20,
            ],
        )]);
        let card = recover(&map);
        assert_eq!(card.cardholder_name.as_deref(), Some("DOE/JOHN"));
    }

    #[test]
    fn test_recover_truncated_record_yields_nothing() {
        let map = record_map(&[(1, 1, &[0x70, 0x05, 0x5A, 0x08, 0x47, 0x61])]);
        let card = recover(&map);
        assert_eq!(card.pan, None);
        assert_eq!(card.pan_masked, None);
    }

    #[test]
    fn test_plausible_pan() {
        assert_eq!(
            plausible_pan(&[0x47, 0x61, 0x73, 0x90, 0x01, 0x01, 0x00, 0x10]).as_deref(),
            Some("4761739001010010")
        );
        // Odd-length PAN padded with an F nibble.
        assert_eq!(
            plausible_pan(&[0x12, 0x34, 0x56, 0x78, 0x90, 0x12, 0x34, 0x5F]).as_deref(),
            Some("123456789012345")
        );
        // Too short once padding goes.
        assert_eq!(plausible_pan(&[0x47, 0x61]), None);
        // Not BCD digits.
        assert_eq!(plausible_pan(&[0xAB, 0xCD, 0xEF, 0x12, 0x34, 0x56]), None);
    }

    #[test]
    fn test_mask_pan_shape() {
        for pan in ["4761739001010010", "5111111111111111111", "1234567890"] {
            let masked = mask_pan(pan);
            assert_eq!(masked.len(), pan.len());
            assert_eq!(&masked[..6], &pan[..6]);
            assert_eq!(&masked[pan.len() - 4..], &pan[pan.len() - 4..]);
            assert!(masked[6..pan.len() - 4].bytes().all(|b| b == b'*'));
        }
        assert_eq!(mask_pan("12345678"), "********");
    }

    #[test]
    fn test_sanitize_name() {
        assert_eq!(
            sanitize_name(b"  DOE/JANE \x00\x01").as_deref(),
            Some("DOE/JANE")
        );
        assert_eq!(sanitize_name(b"X"), None);
        assert_eq!(sanitize_name(b"\x00\x01\x02"), None);
    }

    #[test]
    fn test_render_expiry_keeps_odd_dates() {
        assert_eq!(
            render_expiry(&[0x25, 0x12, 0x31]).as_deref(),
            Some("2025-12-31")
        );
        // Month 13 is the card's problem, not ours to rewrite.
        assert_eq!(
            render_expiry(&[0x26, 0x13, 0x00]).as_deref(),
            Some("2026-13-00")
        );
        assert_eq!(render_expiry(&[0x25, 0x12]), None);
    }
}
