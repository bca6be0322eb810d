//! The APDU engine: transport plus protocol-level retries plus the trace log.
//!
//! Two status-word families are handled here so nothing above this layer ever
//! sees them: 61xx ("response data available", fetched with GET RESPONSE) and
//! 6Cxx ("wrong Le", the command is reissued with the Le the card asked for).
//! Both come from T=0 cards and both are routine, not errors.

use crate::apdu::{Command, Status};
use crate::session::LogEntry;
use crate::transport::Transport;
use crate::{Error, Result};
use tracing::{trace, trace_span, warn};

/// Outcome of a READ RECORD, normalized per the status-word policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    Record(Vec<u8>),
    /// 6A82/6A83: no such record; the sweep of this SFI is over.
    EndOfFile,
    /// 6985: the card refuses to hand this file over without authentication.
    AccessDenied,
    /// Anything else: log it, count it, move on to the next record.
    Refused(Status),
}

pub struct Channel<T: Transport> {
    transport: T,
    log: Vec<LogEntry>,
}

impl<T: Transport> Channel<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            log: Vec::new(),
        }
    }

    /// Consumes the channel, yielding the accumulated APDU trace.
    pub fn into_log(self) -> Vec<LogEntry> {
        self.log
    }

    /// One raw exchange, logged on both directions.
    fn exchange(&mut self, apdu: &[u8]) -> Result<(Vec<u8>, u8, u8)> {
        self.log.push(LogEntry::request(apdu));
        trace!(req = %hex::encode_upper(apdu), ">> TX");
        let (data, sw1, sw2) = self.transport.transmit(apdu)?;
        trace!(rsp = %hex::encode_upper(&data), sw1, sw2, "<< RX");
        self.log.push(LogEntry::response(&data, sw1, sw2));
        Ok((data, sw1, sw2))
    }

    /// Transmits a command, transparently absorbing 61xx and 6Cxx.
    ///
    /// On 6Cxx the original command is reissued with its last byte (the Le)
    /// replaced by SW2. On 61xx a GET RESPONSE with Le=SW2 fetches the rest;
    /// chained continuations are accumulated into one response body.
    pub fn transmit(&mut self, apdu: &[u8]) -> Result<(Vec<u8>, u8, u8)> {
        let span = trace_span!("transmit");
        let _enter = span.enter();

        let (mut data, mut sw1, mut sw2) = self.exchange(apdu)?;

        if sw1 == 0x6C {
            let mut fixed = apdu.to_vec();
            if let Some(le) = fixed.last_mut() {
                *le = sw2;
            }
            (data, sw1, sw2) = self.exchange(&fixed)?;
        }

        while sw1 == 0x61 {
            let (more, next1, next2) = self.exchange(&Command::get_response(sw2).encode())?;
            data.extend_from_slice(&more);
            (sw1, sw2) = (next1, next2);
        }

        Ok((data, sw1, sw2))
    }

    /// SELECT by name. Returns the FCI bytes on 9000, the status otherwise.
    pub fn select_name(&mut self, name: &[u8]) -> Result<Vec<u8>> {
        let (data, sw1, sw2) = self.transmit(&Command::select_name(name).encode())?;
        match Status::from_pair(sw1, sw2) {
            Status::Ok => Ok(data),
            status => Err(Error::Status(status)),
        }
    }

    /// READ RECORD, with protocol refusals folded into [`ReadOutcome`] rather
    /// than raised; only transport failures propagate.
    pub fn read_record(&mut self, sfi: u8, num: u8) -> Result<ReadOutcome> {
        let (data, sw1, sw2) = self.transmit(&Command::read_record(sfi, num).encode())?;
        match Status::from_pair(sw1, sw2) {
            Status::Ok => Ok(ReadOutcome::Record(data)),
            Status::FileNotFound | Status::RecordNotFound => Ok(ReadOutcome::EndOfFile),
            Status::ConditionsNotSatisfied => Ok(ReadOutcome::AccessDenied),
            status => {
                warn!(sfi, num, %status, "record refused");
                Ok(ReadOutcome::Refused(status))
            }
        }
    }
}
