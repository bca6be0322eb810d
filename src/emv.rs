//! EMV payment system knowledge: directories, AIDs, and the FCI.
//!
//! The EMV specifications can be downloaded freely from EMVCo's website, and
//! also contain a recap of ISO 7816. Data elements are defined in Book 1,
//! Annex B.

use crate::{ber, scavenge};
use tracing::debug;

/// Contact Payment System Environment, selected over ISO 7816.
pub const CONTACT_DIRECTORY: &[u8] = b"1PAY.SYS.DDF01";

/// Proximity Payment System Environment, selected over ISO 14443.
pub const CONTACTLESS_DIRECTORY: &[u8] = b"2PAY.SYS.DDF01";

/// Scheme AIDs to try directly when directory discovery yields nothing.
/// Order matters: first 9000 wins.
pub const FALLBACK_AIDS: [&[u8]; 5] = [
    &[0xA0, 0x00, 0x00, 0x00, 0x03, 0x10, 0x10], // Visa credit/debit
    &[0xA0, 0x00, 0x00, 0x00, 0x04, 0x10, 0x10], // Mastercard credit/debit
    &[0xA0, 0x00, 0x00, 0x00, 0x04, 0x01],       // Mastercard (alternate)
    &[0xA0, 0x00, 0x00, 0x00, 0x03, 0x80, 0x02], // Visa (alternate)
    &[0xA0, 0x00, 0x00, 0x00, 0x65, 0x10, 0x10], // JCB / FNB-class
];

/// Collects candidate AIDs from a PSE/PPSE selection response.
///
/// Every primitive 0x4F at any depth counts, deduplicated in first-seen order.
/// Running this twice on the same response yields the same sequence.
pub fn enumerate_aids(response: &[u8]) -> Vec<Vec<u8>> {
    let (nodes, summary) = ber::decode(response);
    if let Some(stop) = summary.stop {
        debug!(?stop, consumed = summary.consumed, "directory decode stopped early");
    }
    let mut aids: Vec<Vec<u8>> = Vec::new();
    for aid in ber::find_all(&nodes, 0x4F) {
        // An AID is 5 to 16 bytes; anything else is issuer noise.
        if aid.len() < 5 || aid.len() > 16 {
            debug!(aid = %hex::encode_upper(aid), "skipping implausible AID");
            continue;
        }
        if !aids.iter().any(|seen| seen == aid) {
            aids.push(aid.to_vec());
        }
    }
    aids
}

/// Application metadata pulled out of a SELECT response's FCI.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FciRecord {
    /// 0x84: DF Name, the AID as the card spells it.
    pub application_id: Option<Vec<u8>>,
    /// 0x50: Application Label. (ans, 1-16 bytes)
    pub application_label: Option<String>,
    /// 0x9F12: Application Preferred Name.
    pub preferred_name: Option<String>,
    /// 0x5F2D: Language Preference, 2-character codes, eg. "enfr".
    pub language: Option<String>,
    /// 0x9F6E: first two bytes rendered as `HH.HH`.
    pub app_version: Option<String>,
}

impl FciRecord {
    /// Parses an FCI. Strict decoding first; if that surfaces nothing useful,
    /// the raw bytes are scavenged for tag signatures instead.
    pub fn parse(data: &[u8]) -> Self {
        let mut fci = Self::default();
        let (nodes, _) = ber::decode(data);
        fci.absorb(&nodes);
        if fci.is_empty() {
            debug!("FCI decode found nothing, scavenging");
            for (tag, value) in scavenge::scavenge(data, scavenge::FCI) {
                fci.absorb_value(tag, value);
            }
        }
        fci
    }

    /// Fills fields from a decoded tree; existing values are kept.
    pub fn absorb(&mut self, nodes: &[ber::Node<'_>]) {
        for tag in [0x84, 0x50, 0x9F12, 0x5F2D, 0x9F6E] {
            if let Some(value) = ber::find_first(nodes, tag) {
                self.absorb_value(tag, value);
            }
        }
    }

    fn absorb_value(&mut self, tag: u16, value: &[u8]) {
        match tag {
            0x84 if self.application_id.is_none() && !value.is_empty() => {
                self.application_id = Some(value.to_vec());
            }
            0x50 if self.application_label.is_none() => {
                self.application_label = printable(value);
            }
            0x9F12 if self.preferred_name.is_none() => {
                self.preferred_name = printable(value);
            }
            0x5F2D if self.language.is_none() => {
                self.language = printable(value).map(|s| s.to_lowercase());
            }
            0x9F6E if self.app_version.is_none() && value.len() >= 2 => {
                self.app_version = Some(format!("{:02X}.{:02X}", value[0], value[1]));
            }
            _ => {}
        }
    }

    pub fn is_empty(&self) -> bool {
        self.application_id.is_none()
            && self.application_label.is_none()
            && self.preferred_name.is_none()
            && self.language.is_none()
            && self.app_version.is_none()
    }
}

/// Keeps printable ASCII, trims whitespace, rejects the degenerate leftovers.
fn printable(bytes: &[u8]) -> Option<String> {
    let s: String = bytes
        .iter()
        .filter(|b| (0x20..=0x7E).contains(*b))
        .map(|&b| b as char)
        .collect();
    let s = s.trim().to_string();
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}
