//! Read-only discovery of EMV payment applications over PC/SC.
//!
//! tapdump talks to a contact (ISO 7816) or contactless (ISO 14443) card through
//! any PC/SC reader, walks the payment system directory, reads every record the
//! card will hand over, and captures the result as a session artifact on disk.
//! It never authenticates, never runs a transaction, and never writes to the card.

pub mod apdu;
pub mod ber;
pub mod cardholder;
pub mod channel;
pub mod emv;
pub mod pcsc;
pub mod probe;
pub mod report;
pub mod scavenge;
pub mod session;
pub mod transport;

pub use crate::apdu::Status;
pub use crate::probe::{probe, CancelToken, Config};
pub use crate::session::Session;
pub use crate::transport::Transport;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no usable reader: {0}")]
    NoReader(String),

    #[error("no card present: {0}")]
    CardAbsent(String),

    #[error("transport failure: {0}")]
    Transport(String),

    /// The card answered, but with a status word we can't work with here.
    #[error("card returned {0}")]
    Status(Status),

    #[error("payment system directory unavailable: {0}")]
    DirectoryUnavailable(String),

    #[error("no application could be selected: {0}")]
    NoApplicationSelectable(String),

    #[error("no records readable: {0}")]
    NoRecordsReadable(String),

    #[error("discovery cancelled")]
    Cancelled,

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("couldn't serialize session: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
