//! PC/SC transport: the one place in the crate that knows about real readers.

use crate::transport::Transport;
use crate::{Error, Result};
use tracing::{debug, trace, trace_span, warn};

/// Vendor setup for ACR122U-class contactless front ends, as pseudo-APDUs:
/// buzzer off, antenna power on, ISO 14443 Type A polling. Readers that don't
/// speak this dialect just refuse each one, which is harmless.
pub const ACR122U_INIT: [&[u8]; 3] = [
    &[0xFF, 0x00, 0x52, 0x00, 0x00],
    &[0xFF, 0x00, 0x00, 0x00, 0x04, 0xD4, 0x32, 0x01, 0x01],
    &[0xFF, 0x00, 0x00, 0x00, 0x05, 0xD4, 0x32, 0x02, 0x02, 0x00],
];

/// A connected card behind a PC/SC reader.
pub struct Pcsc {
    card: pcsc::Card,
    /// Display name of the reader this card sits in.
    pub reader: String,
}

impl Pcsc {
    /// Lists the names of every connected reader.
    pub fn list() -> Result<Vec<String>> {
        let ctx = pcsc::Context::establish(pcsc::Scope::User)?;
        let mut buf = vec![0; ctx.list_readers_len()?];
        Ok(ctx
            .list_readers(&mut buf)?
            .map(|name| name.to_string_lossy().into_owned())
            .collect())
    }

    /// Connects to the reader at `index`, or to the first reader with a card
    /// present when no index is given.
    pub fn connect(index: Option<usize>) -> Result<Self> {
        let span = trace_span!("pcsc_connect");
        let _enter = span.enter();

        debug!("Connecting to PCSC...");
        let ctx = pcsc::Context::establish(pcsc::Scope::User)?;
        let mut buf = vec![0; ctx.list_readers_len()?];
        let readers: Vec<_> = ctx.list_readers(&mut buf)?.collect();
        if readers.is_empty() {
            return Err(Error::NoReader("no readers connected".into()));
        }

        if let Some(i) = index {
            let name = readers
                .get(i)
                .ok_or_else(|| Error::NoReader(format!("reader index {} out of range", i)))?;
            let card = ctx.connect(name, pcsc::ShareMode::Shared, pcsc::Protocols::ANY)?;
            return Ok(Self {
                reader: name.to_string_lossy().into_owned(),
                card,
            });
        }

        for name in &readers {
            match ctx.connect(name, pcsc::ShareMode::Shared, pcsc::Protocols::ANY) {
                Ok(card) => {
                    return Ok(Self {
                        reader: name.to_string_lossy().into_owned(),
                        card,
                    })
                }
                Err(pcsc::Error::NoSmartcard) => {
                    warn!("Reader has no card inserted: {}", name.to_string_lossy());
                }
                Err(err) => return Err(err.into()),
            }
        }
        Err(Error::CardAbsent("no reader has a card present".into()))
    }
}

impl Transport for Pcsc {
    fn transmit(&mut self, apdu: &[u8]) -> Result<(Vec<u8>, u8, u8)> {
        let mut rbuf = [0; pcsc::MAX_BUFFER_SIZE];
        trace!(req = %hex::encode_upper(apdu), "pcsc transmit");
        let rsp = self.card.transmit(apdu, &mut rbuf)?;
        if rsp.len() < 2 {
            return Err(Error::Transport(format!(
                "response too short: {} byte(s)",
                rsp.len()
            )));
        }
        let (data, sw) = rsp.split_at(rsp.len() - 2);
        Ok((data.to_vec(), sw[0], sw[1]))
    }
}

impl From<pcsc::Error> for Error {
    fn from(err: pcsc::Error) -> Self {
        match err {
            pcsc::Error::NoSmartcard | pcsc::Error::RemovedCard | pcsc::Error::ResetCard => {
                Error::CardAbsent(err.to_string())
            }
            pcsc::Error::NoReadersAvailable
            | pcsc::Error::ReaderUnavailable
            | pcsc::Error::UnknownReader => Error::NoReader(err.to_string()),
            _ => Error::Transport(err.to_string()),
        }
    }
}
