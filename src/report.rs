//! Session artifact emission: one directory per session, three files.
//!
//! `card_summary.json` is the structured result, `apdu_log.txt` the wire
//! trace for audit replay, `raw_records.txt` the undigested record dumps.
//! The emitter only reads the finalized session; placeholders for missing
//! fields are its job, not the driver's.

use crate::session::Session;
use crate::Result;
use serde::Serialize;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::info;

const NOT_FOUND: &str = "not found";

#[derive(Debug, Serialize)]
struct Summary {
    session: SessionInfo,
    application: ApplicationInfo,
    cardholder: CardholderInfo,
    technical: TechnicalInfo,
}

#[derive(Debug, Serialize)]
struct SessionInfo {
    timestamp: String,
    reader: String,
    session_id: String,
}

#[derive(Debug, Serialize)]
struct ApplicationInfo {
    aid: String,
    label: String,
    preferred_name: String,
    language: String,
    version: String,
}

#[derive(Debug, Serialize)]
struct CardholderInfo {
    name: String,
    pan_masked: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pan: Option<String>,
    expiry_date: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    track2_pan_masked: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    track2_expiry: Option<String>,
    service_code: String,
}

#[derive(Debug, Serialize)]
struct TechnicalInfo {
    records_read: usize,
    total_bytes_read: usize,
    apdu_exchanges: usize,
}

fn or_not_found(value: &Option<String>) -> String {
    value.clone().unwrap_or_else(|| NOT_FOUND.to_string())
}

/// The session's identity on disk: AID prefix plus start time.
fn session_id(session: &Session) -> String {
    session.started_at.format("%Y%m%d_%H%M%S").to_string()
}

fn summarize(session: &Session, unmask: bool) -> Summary {
    Summary {
        session: SessionInfo {
            timestamp: session.started_at.to_rfc3339(),
            reader: session.reader.clone(),
            session_id: session_id(session),
        },
        application: ApplicationInfo {
            aid: session
                .aid
                .as_deref()
                .map(hex::encode_upper)
                .unwrap_or_else(|| NOT_FOUND.to_string()),
            label: or_not_found(&session.fci.application_label),
            preferred_name: or_not_found(&session.fci.preferred_name),
            language: or_not_found(&session.fci.language),
            version: or_not_found(&session.fci.app_version),
        },
        cardholder: CardholderInfo {
            name: or_not_found(&session.cardholder.cardholder_name),
            pan_masked: or_not_found(&session.cardholder.pan_masked),
            // Unmasked PAN is emitted only on explicit request.
            pan: if unmask {
                session.cardholder.pan.clone()
            } else {
                None
            },
            expiry_date: or_not_found(&session.cardholder.expiry_date),
            track2_pan_masked: session
                .cardholder
                .track2_pan
                .as_deref()
                .map(crate::cardholder::mask_pan),
            track2_expiry: session.cardholder.track2_expiry.clone(),
            service_code: or_not_found(&session.cardholder.service_code),
        },
        technical: TechnicalInfo {
            records_read: session.record_count(),
            total_bytes_read: session.total_record_bytes(),
            apdu_exchanges: session.log.len() / 2,
        },
    }
}

/// Writes the full artifact under `out_dir`, returning the session directory.
pub fn write_session(session: &Session, out_dir: &Path, unmask: bool) -> Result<PathBuf> {
    let prefix = session
        .aid
        .as_deref()
        .map(|aid| hex::encode_upper(&aid[..aid.len().min(4)]))
        .unwrap_or_else(|| "NOAID".to_string());
    let dir = out_dir.join(format!("{}_{}", prefix, session_id(session)));
    fs::create_dir_all(&dir)?;

    let summary = summarize(session, unmask);
    fs::write(
        dir.join("card_summary.json"),
        serde_json::to_string_pretty(&summary)?,
    )?;
    write_apdu_log(session, &dir.join("apdu_log.txt"))?;
    write_raw_records(session, &dir.join("raw_records.txt"))?;

    info!(dir = %dir.display(), "session artifact written");
    Ok(dir)
}

fn write_apdu_log(session: &Session, path: &Path) -> Result<()> {
    let mut f = fs::File::create(path)?;
    writeln!(f, "EMV discovery session log")?;
    writeln!(f, "Started: {}", session.started_at.to_rfc3339())?;
    writeln!(f, "Reader:  {}", session.reader)?;
    writeln!(f, "APDU exchanges: {}", session.log.len() / 2)?;
    writeln!(f)?;
    for entry in &session.log {
        writeln!(f, "{}", entry.trace_line())?;
    }
    writeln!(f)?;
    writeln!(
        f,
        "Application: {}",
        session
            .fci
            .application_label
            .as_deref()
            .unwrap_or(NOT_FOUND)
    )?;
    writeln!(
        f,
        "PAN:         {}",
        session.cardholder.pan_masked.as_deref().unwrap_or(NOT_FOUND)
    )?;
    writeln!(
        f,
        "Expires:     {}",
        session.cardholder.expiry_date.as_deref().unwrap_or(NOT_FOUND)
    )?;
    Ok(())
}

fn write_raw_records(session: &Session, path: &Path) -> Result<()> {
    let mut f = fs::File::create(path)?;
    writeln!(f, "Raw record dump")?;
    writeln!(f, "Session: {}", session_id(session))?;
    writeln!(f, "Total bytes: {}", session.total_record_bytes())?;
    for (sfi, records) in &session.records {
        writeln!(f)?;
        writeln!(f, "[SFI {}]", sfi)?;
        for (num, data) in records {
            writeln!(f, "record {:2}: {}", num, hex::encode_upper(data))?;
        }
    }
    writeln!(f)?;
    writeln!(f, "[CONCATENATED TLV]")?;
    writeln!(f, "{}", hex::encode_upper(session.concatenated_records()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::LogEntry;

    fn test_session() -> Session {
        let mut session = Session::new("ACS ACR122U 00 00".into());
        session.aid = Some(vec![0xA0, 0x00, 0x00, 0x00, 0x03, 0x10, 0x10]);
        session.fci.application_label = Some("VISA".into());
        session.records.entry(1).or_default().insert(
            1,
            vec![0x5A, 0x08, 0x47, 0x61, 0x73, 0x90, 0x01, 0x01, 0x00, 0x10],
        );
        session.cardholder.pan = Some("4761739001010010".into());
        session.cardholder.pan_masked = Some("476173******0010".into());
        session.log.push(LogEntry::request(&[0x00, 0xA4, 0x04, 0x00]));
        session
            .log
            .push(LogEntry::response(&[0x6F, 0x00], 0x90, 0x00));
        session
    }

    #[test]
    fn test_summary_masks_by_default() {
        let summary = summarize(&test_session(), false);
        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["cardholder"]["pan_masked"], "476173******0010");
        assert!(json["cardholder"].get("pan").is_none());
        assert_eq!(json["application"]["aid"], "A0000000031010");
        assert_eq!(json["application"]["label"], "VISA");
        assert_eq!(json["cardholder"]["name"], "not found");
    }

    #[test]
    fn test_summary_unmasks_on_request() {
        let summary = summarize(&test_session(), true);
        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["cardholder"]["pan"], "4761739001010010");
    }

    #[test]
    fn test_summary_counters() {
        let summary = summarize(&test_session(), false);
        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["technical"]["records_read"], 1);
        assert_eq!(json["technical"]["total_bytes_read"], 10);
        assert_eq!(json["technical"]["apdu_exchanges"], 1);
    }

    #[test]
    fn test_write_session_files() {
        let out = std::env::temp_dir().join(format!("tapdump-test-{}", std::process::id()));
        let dir = write_session(&test_session(), &out, false).unwrap();
        assert!(dir.file_name().unwrap().to_string_lossy().starts_with("A0000000_"));
        assert!(dir.join("card_summary.json").is_file());
        assert!(dir.join("apdu_log.txt").is_file());
        assert!(dir.join("raw_records.txt").is_file());
        let trace = fs::read_to_string(dir.join("apdu_log.txt")).unwrap();
        assert!(trace.contains("> 00A40400"));
        assert!(trace.contains("< 6F00 SW1=0x90 SW2=0x00"));
        fs::remove_dir_all(&out).unwrap();
    }
}
