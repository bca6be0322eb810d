//! The discovery driver: directory, application, records, extraction.
//!
//! One driver covers contact and contactless cards; which directory is tried
//! first, which AIDs to fall back on, and which vendor setup the reader wants
//! are all [`Config`] concerns. The walk itself is fixed:
//!
//! ```text
//! INIT → SELECT_DIR → ENUMERATE_AIDS → SELECT_APP → PARSE_FCI
//!             ↓ (nothing found)           ↓ (rejected)
//!        FALLBACK_AIDS ───────────────────┘
//!                                 → READ_RECORDS → EXTRACT → DONE
//! ```
//!
//! Commands go out strictly in this order; the APDU log in the returned
//! session is a faithful serialization of the exchange.

use crate::channel::{Channel, ReadOutcome};
use crate::session::Session;
use crate::transport::Transport;
use crate::{cardholder, emv, scavenge};
use crate::{ber, Error, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tap::TapFallible;
use tracing::{debug, info, trace_span, warn};

/// Give up on an SFI after this many consecutive refusals that are neither
/// end-of-file nor access-denied. Records aren't guaranteed contiguous, so a
/// single gap can't end the sweep, but five in a row means nobody's home.
const MAX_CONSECUTIVE_MISSES: u32 = 5;

/// Cooperative cancellation. Checked between state transitions; an in-flight
/// exchange always runs to completion first, since abandoning a command
/// mid-exchange would wedge the card.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// What to try, in what order. The driver itself has no opinions about
/// interfaces or card brands.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory names to SELECT, in priority order.
    pub directories: Vec<Vec<u8>>,
    /// AIDs to try directly when the directories yield nothing.
    pub fallback_aids: Vec<Vec<u8>>,
    /// SFIs to sweep. Most cards keep cardholder data in 1-4; a full sweep
    /// may go to 31.
    pub sfis: Vec<u8>,
    /// Vendor setup APDUs for the reader's front end, sent before discovery.
    /// Refusals are logged and ignored; plenty of readers need none of this.
    pub reader_init: Vec<Vec<u8>>,
    pub cancel: CancelToken,
}

impl Default for Config {
    /// Contactless-first: try the PPSE, then the contact PSE.
    fn default() -> Self {
        Self {
            directories: vec![
                emv::CONTACTLESS_DIRECTORY.to_vec(),
                emv::CONTACT_DIRECTORY.to_vec(),
            ],
            fallback_aids: emv::FALLBACK_AIDS.iter().map(|a| a.to_vec()).collect(),
            sfis: (1..=4).collect(),
            reader_init: Vec::new(),
            cancel: CancelToken::new(),
        }
    }
}

impl Config {
    pub fn contactless() -> Self {
        Self {
            directories: vec![emv::CONTACTLESS_DIRECTORY.to_vec()],
            ..Self::default()
        }
    }

    pub fn contact() -> Self {
        Self {
            directories: vec![emv::CONTACT_DIRECTORY.to_vec()],
            ..Self::default()
        }
    }

    /// Extends the record sweep to SFIs 1..=n.
    pub fn with_sfi_limit(mut self, limit: u8) -> Self {
        self.sfis = (1..=limit.min(31)).collect();
        self
    }
}

/// Runs one full discovery session against a card.
///
/// The transport is owned for the duration and dropped on every exit path,
/// which is what releases the reader. The session comes back partially
/// populated when the card only gave up some of its data; it's an error only
/// when there was nothing to collect at all.
pub fn probe<T: Transport>(transport: T, reader: &str, config: &Config) -> Result<Session> {
    let span = trace_span!("probe", reader);
    let _enter = span.enter();

    let mut session = Session::new(reader.to_string());
    let mut channel = Channel::new(transport);

    let result = run(&mut channel, &mut session, config);
    session.log = channel.into_log();
    result.map(|()| session)
}

fn run<T: Transport>(
    channel: &mut Channel<T>,
    session: &mut Session,
    config: &Config,
) -> Result<()> {
    reader_init(channel, config);

    // SELECT_DIR / ENUMERATE_AIDS.
    config.cancel.check()?;
    let enumerated = select_directory(channel, config)?;
    if enumerated.is_empty() && config.fallback_aids.is_empty() {
        return Err(Error::DirectoryUnavailable(
            "no payment system directory and no fallback AIDs configured".into(),
        ));
    }

    // SELECT_APP, with FALLBACK_AIDS behind it. The fallback list is entered
    // both when the directory listed nothing and when everything it listed
    // gets rejected on SELECT; only exhausting the fallback list fails.
    config.cancel.check()?;
    let (aid, fci_bytes) = if enumerated.is_empty() {
        warn!("directory unavailable, walking the fallback AID list");
        select_application(channel, config, &config.fallback_aids)?
    } else {
        match select_application(channel, config, &enumerated) {
            Err(Error::NoApplicationSelectable(_)) if !config.fallback_aids.is_empty() => {
                warn!("every directory application rejected, walking the fallback AID list");
                select_application(channel, config, &config.fallback_aids)?
            }
            other => other?,
        }
    };
    info!(aid = %hex::encode_upper(&aid), "application selected");
    session.aid = Some(aid);

    // PARSE_FCI.
    session.fci = emv::FciRecord::parse(&fci_bytes);

    // READ_RECORDS.
    for &sfi in &config.sfis {
        config.cancel.check()?;
        sweep_sfi(channel, session, sfi)?;
    }
    if session.records.is_empty() {
        warn!("card returned no readable records");
    }

    // EXTRACT.
    config.cancel.check()?;
    session.cardholder = cardholder::recover(&session.records);
    let concatenated = session.concatenated_records();
    absorb_record_metadata(&mut session.fci, &concatenated);

    if session.records.is_empty() && session.fci.is_empty() {
        return Err(Error::NoRecordsReadable(
            "no records and no application metadata recovered".into(),
        ));
    }
    Ok(())
}

/// Sends the reader's vendor setup sequence. Always best-effort.
fn reader_init<T: Transport>(channel: &mut Channel<T>, config: &Config) {
    for apdu in &config.reader_init {
        let _ = channel
            .transmit(apdu)
            .tap_err(|err| warn!(apdu = %hex::encode_upper(apdu), %err, "reader init refused"));
    }
}

/// Tries each configured directory; first one that yields AIDs wins.
fn select_directory<T: Transport>(
    channel: &mut Channel<T>,
    config: &Config,
) -> Result<Vec<Vec<u8>>> {
    for name in &config.directories {
        config.cancel.check()?;
        debug!(directory = %String::from_utf8_lossy(name), "SELECT directory");
        match channel.select_name(name) {
            Ok(response) => {
                let aids = emv::enumerate_aids(&response);
                if aids.is_empty() {
                    debug!("directory selected but no AIDs in response");
                } else {
                    return Ok(aids);
                }
            }
            Err(Error::Status(status)) => {
                debug!(%status, "directory rejected");
            }
            Err(err) => return Err(err),
        }
    }
    Ok(Vec::new())
}

/// Tries candidates in order until one SELECTs cleanly.
fn select_application<T: Transport>(
    channel: &mut Channel<T>,
    config: &Config,
    candidates: &[Vec<u8>],
) -> Result<(Vec<u8>, Vec<u8>)> {
    for aid in candidates {
        config.cancel.check()?;
        match channel.select_name(aid) {
            Ok(fci) => return Ok((aid.clone(), fci)),
            Err(Error::Status(status)) => {
                debug!(aid = %hex::encode_upper(aid), %status, "application rejected");
            }
            Err(err) => return Err(err),
        }
    }
    Err(Error::NoApplicationSelectable(format!(
        "{} candidate(s) all rejected",
        candidates.len()
    )))
}

/// Reads records 1, 2, … from one SFI until the card says stop.
fn sweep_sfi<T: Transport>(
    channel: &mut Channel<T>,
    session: &mut Session,
    sfi: u8,
) -> Result<()> {
    let mut misses = 0;
    for num in 1..=u8::MAX {
        match channel.read_record(sfi, num)? {
            ReadOutcome::Record(data) => {
                misses = 0;
                if data.is_empty() {
                    continue;
                }
                debug!(sfi, num, len = data.len(), "record read");
                session.records.entry(sfi).or_default().insert(num, data);
            }
            ReadOutcome::EndOfFile => {
                debug!(sfi, num, "end of file");
                break;
            }
            ReadOutcome::AccessDenied => {
                // This SFI wants authentication we don't do; others may not.
                debug!(sfi, num, "access denied");
                break;
            }
            ReadOutcome::Refused(_) => {
                misses += 1;
                if misses >= MAX_CONSECUTIVE_MISSES {
                    debug!(sfi, "giving up after {} consecutive refusals", misses);
                    break;
                }
            }
        }
    }
    Ok(())
}

/// Records sometimes carry application metadata the FCI didn't. Fill gaps
/// from the swept data, primary tags first, signatures as a last resort.
fn absorb_record_metadata(fci: &mut emv::FciRecord, concatenated: &[u8]) {
    if !fci.is_empty() && fci.app_version.is_some() {
        return;
    }
    let (nodes, _) = ber::decode(concatenated);
    fci.absorb(&nodes);
    if fci.app_version.is_none() {
        if let Some(value) = scavenge::scavenge(concatenated, scavenge::FCI).get(&0x9F6E) {
            if value.len() >= 2 {
                fci.app_version = Some(format!("{:02X}.{:02X}", value[0], value[1]));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Direction;
    use crate::transport::scripted::Scripted;

    const OK: (u8, u8) = (0x90, 0x00);

    fn rsp(data: &[u8], sw: (u8, u8)) -> (Vec<u8>, u8, u8) {
        (data.to_vec(), sw.0, sw.1)
    }

    fn config_ppse_sfi1() -> Config {
        Config {
            sfis: vec![1],
            ..Config::contactless()
        }
    }

    // The six-step happy path: PPSE with one AID, app select, one record.
    #[test]
    fn test_probe_happy_path() {
        let ppse = [
            0x6F, 0x23, 0x84, 0x0E, 0x32, 0x50, 0x41, 0x59, 0x2E, 0x53, 0x59, 0x53, 0x2E, 0x44,
            0x44, 0x46, 0x30, 0x31, 0xA5, 0x11, 0xBF, 0x0C, 0x0E, 0x61, 0x0C, 0x4F, 0x07, 0xA0,
            0x00, 0x00, 0x00, 0x03, 0x10, 0x10, 0x87, 0x01, 0x01,
        ];
        let fci = [
            0x6F, 0x17, 0x84, 0x07, 0xA0, 0x00, 0x00, 0x00, 0x03, 0x10, 0x10, 0xA5, 0x0C, 0x50,
            0x04, 0x56, 0x49, 0x53, 0x41, 0x87, 0x01, 0x01,
        ];
        let record = [
            0x70, 0x10, 0x5A, 0x08, 0x47, 0x61, 0x73, 0x90, 0x01, 0x01, 0x00, 0x10, 0x5F, 0x24,
            0x03, 0x25, 0x12, 0x31,
        ];
        let card = Scripted::new([
            rsp(&ppse, OK),
            rsp(&fci, OK),
            rsp(&record, OK),
            rsp(&[], (0x6A, 0x83)), // end of SFI 1
        ]);

        let session = probe(card, "Test Reader", &config_ppse_sfi1()).unwrap();
        assert_eq!(session.reader, "Test Reader");
        assert_eq!(
            session.aid.as_deref(),
            Some(&[0xA0, 0x00, 0x00, 0x00, 0x03, 0x10, 0x10][..])
        );
        assert_eq!(session.fci.application_label.as_deref(), Some("VISA"));
        assert_eq!(session.record_count(), 1);
        assert_eq!(session.cardholder.pan.as_deref(), Some("4761739001010010"));
        assert_eq!(
            session.cardholder.pan_masked.as_deref(),
            Some("476173******0010")
        );
        assert_eq!(session.cardholder.expiry_date.as_deref(), Some("2025-12-31"));
        // 4 exchanges, a request and a response each.
        assert_eq!(session.log.len(), 8);
    }

    // Scenario: the PPSE answers `6F 00`. Directory is useless, fallback list
    // is entered, and the first AID that SELECTs wins.
    #[test]
    fn test_probe_empty_directory_enters_fallback() {
        let fci = [
            0x6F, 0x11, 0x84, 0x07, 0xA0, 0x00, 0x00, 0x00, 0x04, 0x10, 0x10, 0xA5, 0x06, 0x50,
            0x04, 0x44, 0x45, 0x42, 0x54,
        ];
        let record = [0x70, 0x05, 0x5F, 0x30, 0x02, 0x02, 0x01];
        let card = Scripted::new([
            rsp(&[0x6F, 0x00], OK),    // PPSE: an empty directory
            rsp(&[], (0x6A, 0x82)),    // fallback 1 (Visa) rejected
            rsp(&fci, OK),             // fallback 2 (Mastercard) accepted
            rsp(&record, OK),
            rsp(&[], (0x6A, 0x83)),
        ]);

        let session = probe(card, "r", &config_ppse_sfi1()).unwrap();
        assert_eq!(
            session.aid.as_deref(),
            Some(&emv::FALLBACK_AIDS[1][..]),
            "second fallback AID should have been selected"
        );
        // The second request on the wire must be the Visa fallback SELECT.
        let requests: Vec<_> = session
            .log
            .iter()
            .filter(|e| e.direction == Direction::Request)
            .collect();
        assert_eq!(requests[1].bytes[5..12], emv::FALLBACK_AIDS[0][..]);
    }

    #[test]
    fn test_probe_fallbacks_exhausted() {
        // PPSE fails and every fallback AID is rejected.
        let mut script = vec![rsp(&[], (0x6A, 0x82))];
        script.extend((0..emv::FALLBACK_AIDS.len()).map(|_| rsp(&[], (0x6A, 0x82))));
        let card = Scripted::new(script);

        match probe(card, "r", &config_ppse_sfi1()) {
            Err(Error::NoApplicationSelectable(_)) => {}
            other => panic!("expected NoApplicationSelectable, got {:?}", other),
        }
    }

    // The directory lists an application, but the card then rejects it on
    // SELECT: the fallback list still gets its turn.
    #[test]
    fn test_probe_enumerated_aids_exhausted_falls_back() {
        let ppse = [
            0x6F, 0x23, 0x84, 0x0E, 0x32, 0x50, 0x41, 0x59, 0x2E, 0x53, 0x59, 0x53, 0x2E, 0x44,
            0x44, 0x46, 0x30, 0x31, 0xA5, 0x11, 0xBF, 0x0C, 0x0E, 0x61, 0x0C, 0x4F, 0x07, 0xA0,
            0x00, 0x00, 0x00, 0x03, 0x10, 0x10, 0x87, 0x01, 0x01,
        ];
        let fci = [
            0x6F, 0x11, 0x84, 0x07, 0xA0, 0x00, 0x00, 0x00, 0x04, 0x10, 0x10, 0xA5, 0x06, 0x50,
            0x04, 0x44, 0x45, 0x42, 0x54,
        ];
        let record = [0x70, 0x05, 0x5F, 0x30, 0x02, 0x02, 0x01];
        let card = Scripted::new([
            rsp(&ppse, OK),         // PPSE lists the Visa AID
            rsp(&[], (0x6A, 0x82)), // enumerated Visa rejected
            rsp(&[], (0x6A, 0x82)), // fallback 1 (Visa again) rejected
            rsp(&fci, OK),          // fallback 2 (Mastercard) accepted
            rsp(&record, OK),
            rsp(&[], (0x6A, 0x83)),
        ]);

        let session = probe(card, "r", &config_ppse_sfi1()).unwrap();
        assert_eq!(session.aid.as_deref(), Some(&emv::FALLBACK_AIDS[1][..]));
        let requests: Vec<_> = session
            .log
            .iter()
            .filter(|e| e.direction == Direction::Request)
            .collect();
        // PPSE, enumerated Visa, fallback Visa, fallback Mastercard, 2 reads.
        assert_eq!(requests.len(), 6);
        assert_eq!(requests[2].bytes[5..12], emv::FALLBACK_AIDS[0][..]);
        assert_eq!(requests[3].bytes[5..12], emv::FALLBACK_AIDS[1][..]);
    }

    #[test]
    fn test_probe_no_fallbacks_configured() {
        let card = Scripted::new([rsp(&[], (0x6A, 0x82))]);
        let config = Config {
            fallback_aids: vec![],
            ..config_ppse_sfi1()
        };
        match probe(card, "r", &config) {
            Err(Error::DirectoryUnavailable(_)) => {}
            other => panic!("expected DirectoryUnavailable, got {:?}", other),
        }
    }

    // Scenario: a record carries 9F6E; the version lands in the FCI even
    // though the SELECT response never mentioned it.
    #[test]
    fn test_probe_app_version_from_record() {
        let fci = [
            0x6F, 0x0F, 0x84, 0x07, 0xA0, 0x00, 0x00, 0x00, 0x03, 0x10, 0x10, 0xA5, 0x04, 0x50,
            0x02, 0x56, 0x31,
        ];
        let record = [0x70, 0x05, 0x9F, 0x6E, 0x02, 0x01, 0x03];
        let card = Scripted::new([
            rsp(&[], (0x6A, 0x82)),    // PPSE rejected
            rsp(&fci, OK),             // Visa fallback accepted
            rsp(&record, OK),
            rsp(&[], (0x6A, 0x83)),
        ]);

        let session = probe(card, "r", &config_ppse_sfi1()).unwrap();
        assert_eq!(session.fci.app_version.as_deref(), Some("01.03"));
    }

    #[test]
    fn test_probe_sweep_stops_after_consecutive_misses() {
        let record = [0x70, 0x04, 0x5A, 0x08, 0x47, 0x61]; // truncated, kept raw
        let mut script = vec![
            rsp(&[], (0x6A, 0x82)), // PPSE rejected
            rsp(
                &[0x6F, 0x09, 0x84, 0x07, 0xA0, 0x00, 0x00, 0x00, 0x03, 0x10, 0x10],
                OK,
            ),
            rsp(&record, OK),
        ];
        // Five refusals in a row end the sweep; the script has nothing after.
        script.extend((0..5).map(|_| rsp(&[], (0x6F, 0x00))));
        let card = Scripted::new(script);

        let session = probe(card, "r", &config_ppse_sfi1()).unwrap();
        assert_eq!(session.record_count(), 1);
    }

    #[test]
    fn test_probe_access_denied_does_not_stop_other_sfis() {
        let record = [0x70, 0x06, 0x5F, 0x20, 0x03, 0x4A, 0x4F, 0x45];
        let card = Scripted::new([
            rsp(&[], (0x6A, 0x82)), // PPSE rejected
            rsp(
                &[0x6F, 0x09, 0x84, 0x07, 0xA0, 0x00, 0x00, 0x00, 0x03, 0x10, 0x10],
                OK,
            ),
            rsp(&[], (0x69, 0x85)), // SFI 1: access denied immediately
            rsp(&record, OK),       // SFI 2 record 1
            rsp(&[], (0x6A, 0x83)), // SFI 2 done
        ]);
        let config = Config {
            sfis: vec![1, 2],
            ..Config::contactless()
        };

        let session = probe(card, "r", &config).unwrap();
        assert_eq!(session.record_count(), 1);
        assert_eq!(session.cardholder.cardholder_name.as_deref(), Some("JOE"));
    }

    #[test]
    fn test_probe_reader_init_failures_ignored() {
        let fci = [
            0x6F, 0x09, 0x84, 0x07, 0xA0, 0x00, 0x00, 0x00, 0x03, 0x10, 0x10,
        ];
        let record = [0x70, 0x05, 0x5F, 0x30, 0x02, 0x02, 0x01];
        let card = Scripted::new([
            rsp(&[], (0x63, 0x00)), // buzzer command refused
            rsp(&[], (0x6A, 0x82)), // PPSE rejected
            rsp(&fci, OK),
            rsp(&record, OK),
            rsp(&[], (0x6A, 0x83)),
        ]);
        let config = Config {
            reader_init: vec![vec![0xFF, 0x00, 0x52, 0x00, 0x00]],
            ..config_ppse_sfi1()
        };

        let session = probe(card, "r", &config).unwrap();
        assert_eq!(session.record_count(), 1);
        assert_eq!(
            session.log[0].bytes,
            vec![0xFF, 0x00, 0x52, 0x00, 0x00],
            "init APDU should be first on the wire and in the log"
        );
    }

    #[test]
    fn test_probe_cancelled_before_start() {
        let card = Scripted::new([]);
        let config = config_ppse_sfi1();
        config.cancel.cancel();
        match probe(card, "r", &config) {
            Err(Error::Cancelled) => {}
            other => panic!("expected Cancelled, got {:?}", other),
        }
    }

    #[test]
    fn test_probe_nothing_recovered_is_an_error() {
        // Application selects but the FCI is garbage and no record is
        // readable: the session would be vacuous.
        let card = Scripted::new([
            rsp(&[], (0x6A, 0x82)),          // PPSE rejected
            rsp(&[0x00, 0x00], OK),          // fallback selects, useless FCI
            rsp(&[], (0x6A, 0x83)),          // SFI 1 empty
        ]);
        match probe(card, "r", &config_ppse_sfi1()) {
            Err(Error::NoRecordsReadable(_)) => {}
            other => panic!("expected NoRecordsReadable, got {:?}", other),
        }
    }
}
