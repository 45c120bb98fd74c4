//! Append-only run log.
//!
//! One line per stage event:
//! `<ts> run=<uuid> stage=<name> outcome=<started|ok|failed|skipped> [detail="..."]`.
//! Lines are synced as they are written so a crash leaves every finished
//! stage on record.

use super::state::Stage;
use chrono::{DateTime, SecondsFormat, Utc};
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Started,
    Ok,
    Failed,
    Skipped,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Outcome::Started => "started",
            Outcome::Ok => "ok",
            Outcome::Failed => "failed",
            Outcome::Skipped => "skipped",
        })
    }
}

#[derive(Debug)]
pub struct RunLog {
    file: File,
    path: PathBuf,
    run_id: Uuid,
}

impl RunLog {
    pub fn open(path: &Path, run_id: Uuid) -> io::Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
            run_id,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record(&mut self, stage: Stage, outcome: Outcome, detail: Option<&str>) -> io::Result<()> {
        let line = format_line(Utc::now(), self.run_id, stage, outcome, detail);
        self.file.write_all(line.as_bytes())?;
        self.file.sync_data()
    }
}

/// Render one log line, newline included. `detail` is quoted and escaped so
/// every event stays on a single line.
pub fn format_line(
    at: DateTime<Utc>,
    run_id: Uuid,
    stage: Stage,
    outcome: Outcome,
    detail: Option<&str>,
) -> String {
    let mut line = format!(
        "{} run={} stage={} outcome={}",
        at.to_rfc3339_opts(SecondsFormat::Millis, true),
        run_id,
        stage,
        outcome
    );
    if let Some(detail) = detail {
        line.push_str(" detail=\"");
        for c in detail.chars() {
            match c {
                '"' => line.push_str("\\\""),
                '\\' => line.push_str("\\\\"),
                '\n' => line.push_str("\\n"),
                '\r' => line.push_str("\\r"),
                '\t' => line.push_str("\\t"),
                c if c.is_control() => line.push_str(&format!("\\u{{{:04x}}}", c as u32)),
                c => line.push(c),
            }
        }
        line.push('"');
    }
    line.push('\n');
    line
}
