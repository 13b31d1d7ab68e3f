use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub type EventPayload = Map<String, Value>;

pub const EVENTS_FILE: &str = "events.jsonl";

/// Header keys owned by the log. Payload entries with these names are dropped.
const HEADER_FIELDS: [&str; 4] = ["type", "session_id", "seq", "ts"];

/// One line of `events.jsonl`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionEvent {
    #[serde(rename = "type")]
    pub kind: String,
    pub session_id: String,
    /// Position within the session, starting at 0.
    pub seq: u64,
    pub ts: String,
    #[serde(flatten)]
    pub payload: EventPayload,
}

/// Append-only event log for one session. The file is opened on the first
/// write and kept open after that.
#[derive(Debug)]
pub struct EventLog {
    path: PathBuf,
    session_id: String,
    next_seq: u64,
    file: Option<File>,
}

impl EventLog {
    pub fn new(data_dir: &Path, session_id: impl Into<String>) -> Self {
        Self {
            path: data_dir.join(EVENTS_FILE),
            session_id: session_id.into(),
            next_seq: 0,
            file: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn record(&mut self, kind: &str, mut payload: EventPayload) -> Result<SessionEvent> {
        payload.retain(|key, _| !HEADER_FIELDS.contains(&key.as_str()));
        let event = SessionEvent {
            kind: kind.to_string(),
            session_id: self.session_id.clone(),
            seq: self.next_seq,
            ts: Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false),
            payload,
        };
        let mut line = serde_json::to_string(&event)?;
        line.push('\n');

        let file = self.file_handle()?;
        file.write_all(line.as_bytes())
            .with_context(|| format!("failed to append to {}", self.path.display()))?;
        // A failed write does not consume a sequence number.
        self.next_seq += 1;
        Ok(event)
    }

    fn file_handle(&mut self) -> Result<&mut File> {
        if self.file.is_none() {
            if let Some(parent) = self.path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .with_context(|| format!("failed to open {}", self.path.display()))?;
            self.file = Some(file);
        }
        self.file
            .as_mut()
            .context("event log file handle missing after open")
    }
}

/// Reads every well-formed event in `path`. Lines that fail to parse are skipped.
pub fn read_events(path: &Path) -> Result<Vec<SessionEvent>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    Ok(raw
        .lines()
        .filter_map(|line| serde_json::from_str::<SessionEvent>(line).ok())
        .collect())
}
