mod cmd_scan;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tapdump::pcsc::Pcsc;

#[derive(Debug, Parser)]
#[command(name = "tapdump", about = "Reads EMV payment cards and dumps what they'll tell you")]
struct Opt {
    /// Every time you -v, it gets noisier (up to -vvv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List all connected readers.
    Readers,
    /// Run a discovery session against a card and write the artifact.
    Scan(cmd_scan::Args),
}

fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        2 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();
}

fn cmd_readers() -> Result<()> {
    let readers = Pcsc::list()?;
    if readers.is_empty() {
        println!("no readers connected");
    }
    for (i, name) in readers.iter().enumerate() {
        println!("{:3} {}", i, name);
    }
    Ok(())
}

fn main() -> Result<()> {
    let opt = Opt::parse();
    init_logging(opt.verbose);
    match &opt.cmd {
        Command::Readers => cmd_readers(),
        Command::Scan(args) => cmd_scan::run(args),
    }
}
