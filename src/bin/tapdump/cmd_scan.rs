use anyhow::Result;
use owo_colors::OwoColorize;
use std::path::PathBuf;
use tapdump::pcsc::{Pcsc, ACR122U_INIT};
use tapdump::{probe, report, Config};
use tracing::debug;

#[derive(Debug, clap::Args)]
pub struct Args {
    /// Zero-indexed reader number, if you have multiple.
    #[arg(short, long)]
    reader: Option<usize>,

    /// Only try the contact PSE (1PAY.SYS.DDF01).
    #[arg(long, conflicts_with = "contactless")]
    contact: bool,

    /// Only try the contactless PPSE (2PAY.SYS.DDF01).
    #[arg(long)]
    contactless: bool,

    /// Sweep SFIs 1..=N. Most cards keep everything in 1..=4.
    #[arg(long, default_value_t = 4, value_parser = clap::value_parser!(u8).range(1..=31))]
    sfi_limit: u8,

    /// Send the ACR122U front-end setup sequence (buzzer, antenna, polling)
    /// before discovery.
    #[arg(long)]
    acr122u: bool,

    /// Include the unmasked PAN in the JSON summary.
    #[arg(long)]
    unmask: bool,

    /// Directory session artifacts are written under.
    #[arg(short, long, default_value = "emv_sessions")]
    out: PathBuf,
}

pub fn run(args: &Args) -> Result<()> {
    let card = Pcsc::connect(args.reader)?;
    let reader = card.reader.clone();
    debug!(%reader, "connected");

    let mut config = if args.contact {
        Config::contact()
    } else if args.contactless {
        Config::contactless()
    } else {
        Config::default()
    }
    .with_sfi_limit(args.sfi_limit);
    if args.acr122u {
        config.reader_init = ACR122U_INIT.iter().map(|apdu| apdu.to_vec()).collect();
    }

    let session = probe(card, &reader, &config)?;
    let dir = report::write_session(&session, &args.out, args.unmask)?;

    let missing = "-".to_string();
    println!(
        "{:13}{}",
        "Application:",
        session
            .fci
            .application_label
            .as_ref()
            .unwrap_or(&missing)
            .green()
    );
    println!(
        "{:13}{}",
        "AID:",
        session
            .aid
            .as_deref()
            .map(hex::encode_upper)
            .unwrap_or_else(|| missing.clone())
    );
    println!(
        "{:13}{}",
        "Number:",
        session
            .cardholder
            .pan_masked
            .as_ref()
            .unwrap_or(&missing)
            .bold()
    );
    println!(
        "{:13}{}",
        "Expires:",
        session.cardholder.expiry_date.as_ref().unwrap_or(&missing)
    );
    println!(
        "{:13}{}",
        "Cardholder:",
        session
            .cardholder
            .cardholder_name
            .as_ref()
            .unwrap_or(&missing)
    );
    println!(
        "{:13}{} record(s), {} byte(s)",
        "Read:",
        session.record_count(),
        session.total_record_bytes()
    );
    println!("{:13}{}", "Saved to:", dir.display().cyan());
    Ok(())
}
