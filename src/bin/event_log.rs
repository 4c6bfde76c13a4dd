//! event_log - print presence transitions recorded by watchpostd

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;

use watchpost::events::{DEFAULT_ABSENT_TEXT, DEFAULT_EVENT_LOG, DEFAULT_PRESENT_TEXT};
use watchpost::{EventLog, PresenceState};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Path to the event log.
    #[arg(long, env = "WATCHPOST_EVENT_LOG", default_value = DEFAULT_EVENT_LOG)]
    path: PathBuf,
    /// Only show transitions into this state (present|absent).
    #[arg(long)]
    state: Option<PresenceState>,
    /// Text the log uses for PRESENT.
    #[arg(long, default_value = DEFAULT_PRESENT_TEXT)]
    present_text: String,
    /// Text the log uses for ABSENT.
    #[arg(long, default_value = DEFAULT_ABSENT_TEXT)]
    absent_text: String,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let args = Args::parse();
    let log = EventLog::with_texts(&args.path, &args.present_text, &args.absent_text);
    let entries = log.read_entries()?;

    let mut shown = 0usize;
    for entry in entries
        .iter()
        .filter(|entry| args.state.map_or(true, |state| entry.state == state))
    {
        println!("{}  {}", entry.timestamp.format("%Y-%m-%d %H:%M"), entry.state);
        shown += 1;
    }
    eprintln!(
        "{} of {} transition(s) from {}",
        shown,
        entries.len(),
        log.path().display()
    );
    Ok(())
}
