//! Append-only presence event log.
//!
//! One line per presence transition: `DD.MM.YY HH:MM - <text>\r\n`, local time.
//! Every write opens the file in append mode, writes one line and closes it,
//! so a crash loses at most the line being written.

use anyhow::{Context, Result};
use chrono::{DateTime, Local, NaiveDateTime};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use crate::presence::PresenceState;

pub const DEFAULT_EVENT_LOG: &str = "log.txt";
pub const DEFAULT_PRESENT_TEXT: &str = "present";
pub const DEFAULT_ABSENT_TEXT: &str = "absent";

const TIMESTAMP_FORMAT: &str = "%d.%m.%y %H:%M";
const SEPARATOR: &str = " - ";
const LINE_END: &str = "\r\n";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EventLogEntry {
    pub timestamp: NaiveDateTime,
    pub state: PresenceState,
}

#[derive(Clone, Debug)]
pub struct EventLog {
    path: PathBuf,
    present_text: String,
    absent_text: String,
}

impl EventLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_texts(path, DEFAULT_PRESENT_TEXT, DEFAULT_ABSENT_TEXT)
    }

    /// Use localized texts for the two states.
    pub fn with_texts(path: impl Into<PathBuf>, present: &str, absent: &str) -> Self {
        Self {
            path: path.into(),
            present_text: present.to_string(),
            absent_text: absent.to_string(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn text(&self, state: PresenceState) -> &str {
        match state {
            PresenceState::Present => &self.present_text,
            PresenceState::Absent => &self.absent_text,
        }
    }

    /// Append a transition stamped with `at`, the time of the deciding cycle.
    pub fn append_at(&self, state: PresenceState, at: DateTime<Local>) -> Result<()> {
        let line = format!(
            "{}{}{}{}",
            at.format(TIMESTAMP_FORMAT),
            SEPARATOR,
            self.text(state),
            LINE_END
        );
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("open event log {}", self.path.display()))?;
        file.write_all(line.as_bytes())
            .with_context(|| format!("append to event log {}", self.path.display()))?;
        Ok(())
    }

    /// Parse every well-formed line. A missing file reads as empty.
    pub fn read_entries(&self) -> Result<Vec<EventLogEntry>> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err).with_context(|| format!("read event log {}", self.path.display()))
            }
        };

        let mut entries = Vec::new();
        for (lineno, line) in raw.lines().enumerate() {
            let line = line.trim_end_matches('\r');
            if line.is_empty() {
                continue;
            }
            match self.parse_line(line) {
                Some(entry) => entries.push(entry),
                None => log::warn!(
                    "{}:{}: skipping malformed event line",
                    self.path.display(),
                    lineno + 1
                ),
            }
        }
        Ok(entries)
    }

    fn parse_line(&self, line: &str) -> Option<EventLogEntry> {
        let (stamp, text) = line.split_once(SEPARATOR)?;
        let timestamp = NaiveDateTime::parse_from_str(stamp, TIMESTAMP_FORMAT).ok()?;
        let state = if text == self.present_text {
            PresenceState::Present
        } else if text == self.absent_text {
            PresenceState::Absent
        } else {
            return None;
        };
        Some(EventLogEntry { timestamp, state })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32) -> DateTime<Local> {
        Local
            .with_ymd_and_hms(2024, 3, 7, h, m, 0)
            .single()
            .unwrap()
    }

    #[test]
    fn writes_crlf_lines_in_log_format() {
        let dir = tempfile::tempdir().unwrap();
        let log = EventLog::new(dir.path().join("log.txt"));
        log.append_at(PresenceState::Present, at(9, 5)).unwrap();
        log.append_at(PresenceState::Absent, at(9, 15)).unwrap();

        let raw = fs::read_to_string(log.path()).unwrap();
        assert_eq!(raw, "07.03.24 09:05 - present\r\n07.03.24 09:15 - absent\r\n");
    }

    #[test]
    fn reads_back_entries_with_localized_text() {
        let dir = tempfile::tempdir().unwrap();
        let log = EventLog::with_texts(dir.path().join("log.txt"), "anwesend", "abwesend");
        log.append_at(PresenceState::Present, at(22, 0)).unwrap();
        fs::OpenOptions::new()
            .append(true)
            .open(log.path())
            .unwrap()
            .write_all(b"garbage\r\n")
            .unwrap();
        log.append_at(PresenceState::Absent, at(22, 10)).unwrap();

        let entries = log.read_entries().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].state, PresenceState::Present);
        assert_eq!(entries[1].state, PresenceState::Absent);
        assert_eq!(entries[1].timestamp, at(22, 10).naive_local());
    }

    #[test]
    fn missing_file_reads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let log = EventLog::new(dir.path().join("none.txt"));
        assert!(log.read_entries().unwrap().is_empty());
    }
}
