//! The in-memory result of one discovery session.

use crate::cardholder::CardholderRecord;
use crate::emv::FciRecord;
use chrono::{DateTime, Local};
use std::collections::BTreeMap;

/// SFI → record number → raw record payload. Sparse: a missing entry means
/// the card refused that record or reported end-of-file.
pub type RecordMap = BTreeMap<u8, BTreeMap<u8, Vec<u8>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Request,
    Response,
}

/// One line of the APDU trace. Append-only, in wall-clock order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub at: DateTime<Local>,
    pub direction: Direction,
    pub bytes: Vec<u8>,
    /// SW1/SW2, present on responses only.
    pub sw: Option<(u8, u8)>,
}

impl LogEntry {
    pub fn request(bytes: &[u8]) -> Self {
        Self {
            at: Local::now(),
            direction: Direction::Request,
            bytes: bytes.to_vec(),
            sw: None,
        }
    }

    pub fn response(bytes: &[u8], sw1: u8, sw2: u8) -> Self {
        Self {
            at: Local::now(),
            direction: Direction::Response,
            bytes: bytes.to_vec(),
            sw: Some((sw1, sw2)),
        }
    }

    /// Renders the entry as one trace line:
    /// `HH:MM:SS.mmm > <hex>` or `HH:MM:SS.mmm < <hex> SW1=0xNN SW2=0xNN`.
    pub fn trace_line(&self) -> String {
        let stamp = self.at.format("%H:%M:%S%.3f");
        let body = hex::encode_upper(&self.bytes);
        match (self.direction, self.sw) {
            (Direction::Request, _) => format!("{} > {}", stamp, body),
            (Direction::Response, Some((sw1, sw2))) => {
                format!("{} < {} SW1=0x{:02X} SW2=0x{:02X}", stamp, body, sw1, sw2)
            }
            (Direction::Response, None) => format!("{} < {}", stamp, body),
        }
    }
}

/// Everything one discovery run produced. Finalized once by the driver, then
/// read-only to downstream emitters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub started_at: DateTime<Local>,
    /// Display name of the reader, captured once at session start.
    pub reader: String,
    /// The AID that was actually selected.
    pub aid: Option<Vec<u8>>,
    pub fci: FciRecord,
    pub records: RecordMap,
    pub cardholder: CardholderRecord,
    pub log: Vec<LogEntry>,
}

impl Session {
    pub fn new(reader: String) -> Self {
        Self {
            started_at: Local::now(),
            reader,
            aid: None,
            fci: FciRecord::default(),
            records: RecordMap::new(),
            cardholder: CardholderRecord::default(),
            log: Vec::new(),
        }
    }

    /// Every record payload, in SFI then record-number order, as one slice.
    pub fn concatenated_records(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for records in self.records.values() {
            for data in records.values() {
                out.extend_from_slice(data);
            }
        }
        out
    }

    pub fn record_count(&self) -> usize {
        self.records.values().map(|r| r.len()).sum()
    }

    pub fn total_record_bytes(&self) -> usize {
        self.records
            .values()
            .flat_map(|r| r.values())
            .map(|d| d.len())
            .sum()
    }
}
