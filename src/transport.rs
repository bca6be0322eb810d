//! The transport seam between the discovery engine and a physical reader.

use crate::Result;

/// One request-response exchange with a card.
///
/// Implementations own whatever connection state the reader needs. The rest of
/// the crate knows nothing about the reader beyond this method: it hands over
/// a raw command APDU and gets back the response body plus the SW1/SW2 pair.
/// Physical failures (reader unplugged, card pulled off the field) surface as
/// errors and abort discovery.
pub trait Transport {
    fn transmit(&mut self, apdu: &[u8]) -> Result<(Vec<u8>, u8, u8)>;
}
