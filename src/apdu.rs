//! APDU command encoding and status words, per ISO 7816-4.

use num_enum::{FromPrimitive, IntoPrimitive};
use std::fmt;

/// A command APDU. Only the short (1-byte Lc/Le) form; EMV discovery never
/// needs extended lengths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub cla: u8,
    pub ins: u8,
    pub p1: u8,
    pub p2: u8,
    pub data: Vec<u8>,
    pub le: Option<u8>,
}

impl Command {
    /// SELECT by name, first occurrence, Le=0x00.
    pub fn select_name(name: &[u8]) -> Self {
        Self {
            cla: 0x00,
            ins: 0xA4,
            p1: 0x04, // by DF name
            p2: 0x00, // first or only occurrence
            data: name.to_vec(),
            le: Some(0x00),
        }
    }

    /// READ RECORD by record number within an SFI.
    pub fn read_record(sfi: u8, num: u8) -> Self {
        Self {
            cla: 0x00,
            ins: 0xB2,
            p1: num,
            p2: (sfi << 3) | 0x04, // P1 is a record number
            data: vec![],
            le: Some(0x00),
        }
    }

    /// GET RESPONSE, fetching `le` bytes left over from the previous command.
    pub fn get_response(le: u8) -> Self {
        Self {
            cla: 0x00,
            ins: 0xC0,
            p1: 0x00,
            p2: 0x00,
            data: vec![],
            le: Some(le),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(6 + self.data.len());
        out.extend_from_slice(&[self.cla, self.ins, self.p1, self.p2]);
        if !self.data.is_empty() {
            out.push(self.data.len() as u8);
            out.extend_from_slice(&self.data);
        }
        if let Some(le) = self.le {
            out.push(le);
        }
        out
    }
}

/// A normalized SW1/SW2 pair.
///
/// The 61xx and 6Cxx families never reach this type; the channel consumes them
/// during transmission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, FromPrimitive)]
#[repr(u16)]
pub enum Status {
    Ok = 0x9000,
    /// 6A82: the named file or application doesn't exist.
    FileNotFound = 0x6A82,
    /// 6A83: no record with that number; end of file during a sweep.
    RecordNotFound = 0x6A83,
    /// 6985: conditions of use not satisfied; the card refuses access.
    ConditionsNotSatisfied = 0x6985,
    /// 6A86: incorrect P1/P2, usually an SFI the application doesn't have.
    IncorrectParameters = 0x6A86,
    #[num_enum(catch_all)]
    Other(u16),
}

impl Status {
    pub fn from_pair(sw1: u8, sw2: u8) -> Self {
        ((sw1 as u16) << 8 | sw2 as u16).into()
    }

    pub fn sw1(self) -> u8 {
        (u16::from(self) >> 8) as u8
    }

    pub fn sw2(self) -> u8 {
        u16::from(self) as u8
    }

    pub fn is_ok(self) -> bool {
        self == Status::Ok
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sw = u16::from(*self);
        match self {
            Status::Ok => write!(f, "SW {:04X} (ok)", sw),
            Status::FileNotFound => write!(f, "SW {:04X} (file not found)", sw),
            Status::RecordNotFound => write!(f, "SW {:04X} (record not found)", sw),
            Status::ConditionsNotSatisfied => {
                write!(f, "SW {:04X} (conditions not satisfied)", sw)
            }
            Status::IncorrectParameters => write!(f, "SW {:04X} (incorrect parameters)", sw),
            Status::Other(_) => write!(f, "SW {:04X}", sw),
        }
    }
}
