//! Archive backends.
//!
//! The pipeline only talks to the repository through [`ArchiveBackend`], so
//! stages can be exercised against [`LocalArchive`] in tests and against
//! restic in production.

pub mod local;
pub mod restic;

use crate::config::{BackendKind, Config};
use crate::utils::errors::BackendError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

pub use local::LocalArchive;
pub use restic::ResticBackend;

/// Opaque snapshot identifier as reported by the backend.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SnapshotId(pub String);

impl SnapshotId {
    /// First 8 characters, for log lines.
    pub fn short(&self) -> &str {
        let end = self.0.char_indices().nth(8).map(|(i, _)| i).unwrap_or(self.0.len());
        &self.0[..end]
    }
}

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A committed snapshot as seen in a repository listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: SnapshotId,
    pub time: DateTime<Utc>,
    pub hostname: String,
    pub tags: BTreeSet<String>,
    pub total_bytes: u64,
}

/// Result of probing a repository location.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepositoryState {
    Exists,
    Missing,
}

/// What a sampled read-back found.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VerifyReport {
    pub checked_blocks: u64,
    pub checked_bytes: u64,
    pub errors: Vec<String>,
}

impl VerifyReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

#[async_trait]
pub trait ArchiveBackend: Send + Sync {
    /// Human-readable repository location.
    fn location(&self) -> &str;

    /// Report whether a repository exists at the location.
    ///
    /// `Missing` is only returned when the repository structure is absent;
    /// anything else that prevents probing is an error.
    async fn probe(&self) -> Result<RepositoryState, BackendError>;

    /// Create the repository structure. Never overwrites an existing repository.
    async fn init(&self) -> Result<(), BackendError>;

    /// List committed snapshots. Interrupted commits never appear here.
    async fn snapshots(&self) -> Result<Vec<Snapshot>, BackendError>;

    /// Store every file under `source` as one snapshot.
    async fn commit(
        &self,
        source: &Path,
        tags: &BTreeSet<String>,
        time: DateTime<Utc>,
    ) -> Result<Snapshot, BackendError>;

    /// Remove the given snapshots and any data only they referenced.
    async fn forget(&self, ids: &[SnapshotId]) -> Result<(), BackendError>;

    /// Read back a `sample_fraction` share of stored blocks and check their digests.
    async fn check(&self, sample_fraction: f64) -> Result<VerifyReport, BackendError>;
}

/// Build the backend selected in the configuration.
pub fn from_config(config: &Config) -> Arc<dyn ArchiveBackend> {
    match config.backend {
        BackendKind::Local => Arc::new(LocalArchive::new(
            &config.repository_location,
            config.chunk_size,
        )),
        BackendKind::Restic => Arc::new(ResticBackend::new(
            &config.restic.binary,
            &config.repository_location,
            config.restic.password_file.clone(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_id_short() {
        let id = SnapshotId("0123456789abcdef".to_string());
        assert_eq!(id.short(), "01234567");
        assert_eq!(SnapshotId("abc".to_string()).short(), "abc");
    }

    #[test]
    fn test_from_config_selects_backend() {
        let config = Config {
            repository_location: "/srv/repo".to_string(),
            ..Config::default()
        };
        assert_eq!(from_config(&config).location(), "/srv/repo");
    }
}
