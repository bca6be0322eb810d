//! Byte-signature scanning for cards that don't play by the rules.
//!
//! Some issuers return cardholder data outside any recognizable template, or
//! inside structures mangled badly enough that strict decoding comes back
//! empty. When that happens we fall back to scanning the raw bytes for known
//! tag signatures: the tag's own bytes, followed by a single plausible length
//! byte, followed by that many bytes of value.

use std::collections::BTreeMap;

/// A tag to hunt for, with the length range a real value would have.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Signature {
    pub tag: u16,
    pub min: usize,
    pub max: usize,
}

impl Signature {
    pub const fn new(tag: u16, min: usize, max: usize) -> Self {
        Self { tag, min, max }
    }
}

/// Cardholder tags worth scavenging out of record bodies.
pub const CARDHOLDER: &[Signature] = &[
    Signature::new(0x5A, 4, 12),    // PAN: 8-24 BCD digits
    Signature::new(0x57, 9, 19),    // Track 2 Equivalent Data
    Signature::new(0x5F20, 2, 26),  // Cardholder Name
    Signature::new(0x5F24, 3, 3),   // Application Expiration Date
    Signature::new(0x5F30, 2, 2),   // Service Code
];

/// Application metadata tags worth scavenging out of an FCI.
pub const FCI: &[Signature] = &[
    Signature::new(0x84, 5, 16),   // DF Name (the AID)
    Signature::new(0x50, 1, 16),   // Application Label
    Signature::new(0x9F12, 1, 16), // Application Preferred Name
    Signature::new(0x5F2D, 2, 8),  // Language Preference
    Signature::new(0x9F6E, 2, 16), // Application version / form factor blob
];

/// Scans `data` for the given signatures. The first match per tag wins.
///
/// A position matches a signature when the tag bytes appear literally, the
/// next byte is a length within the signature's range, and that many bytes of
/// value actually follow.
pub fn scavenge<'a>(data: &'a [u8], signatures: &[Signature]) -> BTreeMap<u16, &'a [u8]> {
    let mut found = BTreeMap::new();
    for sig in signatures {
        if found.contains_key(&sig.tag) {
            continue;
        }
        let tag_bytes: &[u8] = &if sig.tag > 0xFF {
            vec![(sig.tag >> 8) as u8, sig.tag as u8]
        } else {
            vec![sig.tag as u8]
        };
        for i in 0..data.len().saturating_sub(tag_bytes.len() + 1) {
            if &data[i..i + tag_bytes.len()] != tag_bytes {
                continue;
            }
            let len = data[i + tag_bytes.len()] as usize;
            if len < sig.min || len > sig.max {
                continue;
            }
            let start = i + tag_bytes.len() + 1;
            if start + len > data.len() {
                continue;
            }
            found.insert(sig.tag, &data[start..start + len]);
            break;
        }
    }
    found
}
