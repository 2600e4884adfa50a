//! Append-only JSONL turn log under `<log_dir>/session-YYYY-MM-DD.log`.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::core::types::TurnRecord;

pub const TURN_LOG_SCHEMA_VERSION: u32 = 1;

/// Sink for per-turn records. Failures are reported, never fatal to a run.
pub trait TurnLogger {
    fn record(&self, turn: &TurnRecord) -> Result<()>;
}

#[derive(Debug, Serialize)]
struct TurnLine<'a> {
    schema_version: u32,
    timestamp: String,
    #[serde(flatten)]
    turn: &'a TurnRecord,
}

/// Writes one JSON line per turn into a daily file.
#[derive(Debug, Clone)]
pub struct JsonlTurnLog {
    dir: PathBuf,
}

impl JsonlTurnLog {
    /// The directory is created lazily on first write.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, at: DateTime<Utc>) -> PathBuf {
        self.dir
            .join(format!("session-{}.log", at.format("%Y-%m-%d")))
    }

    pub fn record_at(&self, turn: &TurnRecord, at: DateTime<Utc>) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("create log dir {}", self.dir.display()))?;
        let path = self.path_for(at);
        let line = TurnLine {
            schema_version: TURN_LOG_SCHEMA_VERSION,
            timestamp: at.to_rfc3339(),
            turn,
        };
        let mut buf = serde_json::to_string(&line).context("serialize turn record")?;
        buf.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("open turn log {}", path.display()))?;
        file.write_all(buf.as_bytes())
            .with_context(|| format!("append turn log {}", path.display()))?;
        Ok(path)
    }
}

impl TurnLogger for JsonlTurnLog {
    fn record(&self, turn: &TurnRecord) -> Result<()> {
        self.record_at(turn, Utc::now()).map(|_| ())
    }
}
