//! Archive backend driving the `restic` command line client.

use super::{ArchiveBackend, RepositoryState, Snapshot, SnapshotId, VerifyReport};
use crate::utils::errors::BackendError;
use crate::utils::tail_text;
use async_trait::async_trait;
use chrono::{DateTime, Local, Utc};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info};

/// `restic cat config` exits with this code when no repository exists.
const EXIT_REPOSITORY_MISSING: i32 = 10;

/// Length of a full restic snapshot id in hex.
const FULL_ID_LEN: usize = 64;

/// Keep error messages readable when restic is chatty.
const STDERR_TAIL_BYTES: usize = 2048;

#[derive(Debug, Clone)]
pub struct ResticBackend {
    binary: String,
    repository: String,
    password_file: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct ResticSnapshot {
    id: String,
    time: DateTime<Utc>,
    #[serde(default)]
    hostname: String,
    #[serde(default)]
    tags: Option<Vec<String>>,
    #[serde(default)]
    summary: Option<ResticSnapshotSummary>,
}

#[derive(Debug, Deserialize)]
struct ResticSnapshotSummary {
    #[serde(default)]
    total_bytes_processed: u64,
}

#[derive(Debug, Deserialize)]
struct BackupMessage {
    message_type: String,
    #[serde(default)]
    snapshot_id: Option<String>,
    #[serde(default)]
    total_bytes_processed: u64,
}

#[derive(Debug, Deserialize)]
struct RawDataStats {
    #[serde(default)]
    total_size: u64,
}

struct CommandOutput {
    status: Option<i32>,
    success: bool,
    stdout: Vec<u8>,
    stderr: String,
}

impl ResticBackend {
    pub fn new(binary: &str, repository: &str, password_file: Option<PathBuf>) -> Self {
        Self {
            binary: binary.to_string(),
            repository: repository.to_string(),
            password_file,
        }
    }

    fn command(&self, args: &[&str]) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.args(args)
            .env("RESTIC_REPOSITORY", &self.repository)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(password_file) = &self.password_file {
            cmd.env("RESTIC_PASSWORD_FILE", password_file);
        }
        cmd
    }

    async fn output(&self, mut cmd: Command) -> Result<CommandOutput, BackendError> {
        let output = cmd.output().await?;
        Ok(CommandOutput {
            status: output.status.code(),
            success: output.status.success(),
            stdout: output.stdout,
            stderr: tail_text(&String::from_utf8_lossy(&output.stderr), STDERR_TAIL_BYTES),
        })
    }

    /// Run restic and return stdout, failing on a non-zero exit.
    async fn run(&self, args: &[&str]) -> Result<Vec<u8>, BackendError> {
        debug!(binary = %self.binary, ?args, "Running restic");
        let output = self.output(self.command(args)).await?;
        if output.success {
            Ok(output.stdout)
        } else {
            Err(self.command_error(&output))
        }
    }

    fn command_error(&self, output: &CommandOutput) -> BackendError {
        BackendError::Command {
            program: self.binary.clone(),
            status: output
                .status
                .map(|c| format!("exit code {}", c))
                .unwrap_or_else(|| "signal".to_string()),
            stderr: output.stderr.clone(),
        }
    }
}

#[async_trait]
impl ArchiveBackend for ResticBackend {
    fn location(&self) -> &str {
        &self.repository
    }

    async fn probe(&self) -> Result<RepositoryState, BackendError> {
        let output = self.output(self.command(&["cat", "config"])).await?;
        match output.status {
            Some(0) => Ok(RepositoryState::Exists),
            Some(EXIT_REPOSITORY_MISSING) => Ok(RepositoryState::Missing),
            _ => Err(self.command_error(&output)),
        }
    }

    async fn init(&self) -> Result<(), BackendError> {
        self.run(&["init"]).await?;
        info!(location = %self.repository, "Initialized restic repository");
        Ok(())
    }

    async fn snapshots(&self) -> Result<Vec<Snapshot>, BackendError> {
        let stdout = self.run(&["snapshots", "--json"]).await?;
        parse_snapshots(&stdout)
    }

    async fn commit(
        &self,
        source: &Path,
        tags: &BTreeSet<String>,
        time: DateTime<Utc>,
    ) -> Result<Snapshot, BackendError> {
        let hostname = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown".to_string());
        // restic reads --time in the local time zone
        let time_arg = time.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string();

        let mut args = vec!["backup", "--json", "--host", hostname.as_str(), "--time", time_arg.as_str()];
        for tag in tags {
            args.push("--tag");
            args.push(tag.as_str());
        }
        args.push(".");

        let mut cmd = self.command(&args);
        cmd.current_dir(source);
        let output = self.output(cmd).await?;
        if !output.success {
            return Err(self.command_error(&output));
        }

        let (mut id, total_bytes) = parse_backup_summary(&output.stdout)?;
        if id.0.len() < FULL_ID_LEN {
            // Older restic releases report the short id in the summary.
            let listed = self.run(&["snapshots", "--json", id.0.as_str()]).await?;
            id = resolve_full_id(&id, &parse_snapshots(&listed)?)?;
            debug!(snapshot_id = %id, "Resolved full snapshot id");
        }
        Ok(Snapshot {
            id,
            time,
            hostname,
            tags: tags.clone(),
            total_bytes,
        })
    }

    async fn forget(&self, ids: &[SnapshotId]) -> Result<(), BackendError> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut args = vec!["forget", "--prune"];
        args.extend(ids.iter().map(|id| id.0.as_str()));
        self.run(&args).await?;
        Ok(())
    }

    async fn check(&self, sample_fraction: f64) -> Result<VerifyReport, BackendError> {
        let subset = format!("--read-data-subset={}", subset_percent(sample_fraction));
        let output = self.output(self.command(&["check", subset.as_str()])).await?;

        let stats = self.run(&["stats", "--mode", "raw-data", "--json"]).await?;
        let stats: RawDataStats = serde_json::from_slice(&stats)?;

        let mut report = VerifyReport {
            checked_blocks: 0,
            checked_bytes: (stats.total_size as f64 * sample_fraction.clamp(0.0, 1.0)) as u64,
            errors: Vec::new(),
        };
        if !output.success {
            report.errors.push(self.command_error(&output).to_string());
        }
        Ok(report)
    }
}

fn parse_snapshots(stdout: &[u8]) -> Result<Vec<Snapshot>, BackendError> {
    let raw: Vec<ResticSnapshot> = serde_json::from_slice(stdout)?;
    let mut snapshots: Vec<Snapshot> = raw
        .into_iter()
        .map(|s| Snapshot {
            id: SnapshotId(s.id),
            time: s.time,
            hostname: s.hostname,
            tags: s.tags.unwrap_or_default().into_iter().collect(),
            total_bytes: s.summary.map(|m| m.total_bytes_processed).unwrap_or(0),
        })
        .collect();
    snapshots.sort_by(|a, b| a.time.cmp(&b.time).then_with(|| a.id.cmp(&b.id)));
    Ok(snapshots)
}

/// `backup --json` prints one status object per line and a final summary.
fn parse_backup_summary(stdout: &[u8]) -> Result<(SnapshotId, u64), BackendError> {
    for line in String::from_utf8_lossy(stdout).lines().rev() {
        let Ok(message) = serde_json::from_str::<BackupMessage>(line) else {
            continue;
        };
        if message.message_type == "summary" {
            if let Some(id) = message.snapshot_id {
                return Ok((SnapshotId(id), message.total_bytes_processed));
            }
        }
    }
    Err(BackendError::Corrupt("restic backup reported no snapshot id".into()))
}

/// Match a short snapshot id against listed snapshots. Ambiguous or unknown
/// prefixes are errors.
fn resolve_full_id(short: &SnapshotId, listed: &[Snapshot]) -> Result<SnapshotId, BackendError> {
    let mut matches = listed.iter().filter(|s| s.id.0.starts_with(short.0.as_str()));
    match (matches.next(), matches.next()) {
        (Some(snapshot), None) => Ok(snapshot.id.clone()),
        (Some(_), Some(_)) => Err(BackendError::Corrupt(format!(
            "snapshot id {} is ambiguous",
            short.0
        ))),
        (None, _) => Err(BackendError::UnknownSnapshot(short.0.clone())),
    }
}

/// restic rejects a 0% subset, so the smallest request is 0.01%.
fn subset_percent(sample_fraction: f64) -> String {
    let percent = (sample_fraction.clamp(0.0, 1.0) * 100.0).max(0.01);
    let formatted = format!("{:.2}", percent);
    let trimmed = formatted.trim_end_matches('0').trim_end_matches('.');
    format!("{}%", trimmed)
}
