//! Archival stage: commit the sealed staging area as one tagged snapshot.

use crate::backend::{ArchiveBackend, Snapshot};
use crate::manifest::Manifest;
use crate::utils::errors::{PipelineError, Result};
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::BTreeSet;
use std::path::Path;
use tracing::info;

pub const DATABASE_TAG: &str = "database";
pub const SECRETS_EXCLUDED_TAG: &str = "secrets-excluded";

/// Content-category tags plus the `date-YYYY-MM-DD` tag of the run.
pub fn snapshot_tags(date: NaiveDate, extra_tags: &[String]) -> BTreeSet<String> {
    let mut tags = BTreeSet::from([DATABASE_TAG.to_string(), SECRETS_EXCLUDED_TAG.to_string()]);
    tags.extend(extra_tags.iter().cloned());
    tags.insert(format!("date-{}", date.format("%Y-%m-%d")));
    tags
}

/// Commit `staging_dir` to the repository.
///
/// The manifest must still describe the staging area exactly; anything that
/// appeared, vanished or changed size since it was built aborts the commit.
pub async fn archive(
    backend: &dyn ArchiveBackend,
    staging_dir: &Path,
    manifest: &Manifest,
    tags: &BTreeSet<String>,
    time: DateTime<Utc>,
) -> Result<Snapshot> {
    let dir = staging_dir.to_path_buf();
    let sealed = manifest.clone();
    let problems = tokio::task::spawn_blocking(move || sealed.coverage_problems(&dir))
        .await
        .map_err(|e| PipelineError::ArchivalFailed(format!("coverage check task failed: {}", e)))?
        .map_err(|e| PipelineError::ArchivalFailed(format!("cannot re-read staging area: {}", e)))?;
    if !problems.is_empty() {
        return Err(PipelineError::ArchivalFailed(format!(
            "staging area no longer matches its manifest: {}",
            problems.join("; ")
        )));
    }

    let snapshot = backend
        .commit(staging_dir, tags, time)
        .await
        .map_err(|e| PipelineError::ArchivalFailed(e.to_string()))?;

    info!(
        snapshot_id = %snapshot.id.short(),
        tags = ?snapshot.tags,
        total_bytes = snapshot.total_bytes,
        "Snapshot archived"
    );
    Ok(snapshot)
}
