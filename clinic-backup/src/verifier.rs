//! Integrity verification of stored archive data.

use crate::backend::{ArchiveBackend, VerifyReport};
use crate::utils::errors::{PipelineError, Result};
use tracing::{error, info};

/// Read back `sample_fraction` of the stored blocks.
///
/// `0.0` checks nothing and does not touch the backend.
pub async fn verify(backend: &dyn ArchiveBackend, sample_fraction: f64) -> Result<VerifyReport> {
    if !sample_fraction.is_finite() || !(0.0..=1.0).contains(&sample_fraction) {
        return Err(PipelineError::VerificationFailed(format!(
            "sample fraction {} is outside 0.0..=1.0",
            sample_fraction
        )));
    }
    if sample_fraction == 0.0 {
        info!("Verification sample fraction is 0; nothing checked");
        return Ok(VerifyReport::default());
    }

    let report = backend
        .check(sample_fraction)
        .await
        .map_err(|e| PipelineError::VerificationFailed(e.to_string()))?;

    if !report.is_clean() {
        for problem in &report.errors {
            error!(repository = %backend.location(), problem = %problem, "Archive corruption detected");
        }
        return Err(PipelineError::VerificationFailed(format!(
            "{} problem(s) in {} checked block(s), first: {}",
            report.errors.len(),
            report.checked_blocks,
            report.errors[0]
        )));
    }

    info!(
        checked_blocks = report.checked_blocks,
        checked_bytes = report.checked_bytes,
        sample_fraction,
        "Archive verified"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::LocalArchive;
    use crate::fs::walker::{walk_files, WalkOptions};
    use chrono::Utc;
    use std::collections::BTreeSet;
    use std::fs;
    use tempfile::TempDir;

    async fn repository(temp_dir: &TempDir) -> LocalArchive {
        let location = temp_dir.path().join("repo");
        let repo = LocalArchive::new(location.to_str().unwrap(), 8);
        repo.init().await.unwrap();

        let staging = temp_dir.path().join("staging");
        fs::create_dir_all(&staging).unwrap();
        fs::write(staging.join("database.sql.zst"), b"0123456789abcdefghijklmnopqrstuv").unwrap();
        let tags = BTreeSet::from(["database".to_string()]);
        repo.commit(&staging, &tags, Utc::now()).await.unwrap();
        repo
    }

    fn corrupt_one_block(repo: &LocalArchive) {
        let blocks = walk_files(&repo.root().join("blocks"), &WalkOptions::default()).unwrap();
        fs::write(&blocks[0].path, b"XXXXXXXX").unwrap();
    }

    #[tokio::test]
    async fn test_full_check_of_clean_repository() {
        let temp_dir = TempDir::new().unwrap();
        let repo = repository(&temp_dir).await;

        let report = verify(&repo, 1.0).await.unwrap();
        assert_eq!(report.checked_blocks, 4);
        assert_eq!(report.checked_bytes, 32);
    }

    #[tokio::test]
    async fn test_corruption_always_found_at_full_fraction() {
        let temp_dir = TempDir::new().unwrap();
        let repo = repository(&temp_dir).await;
        corrupt_one_block(&repo);

        for _ in 0..5 {
            let result = verify(&repo, 1.0).await;
            assert!(matches!(result, Err(PipelineError::VerificationFailed(_))));
        }
    }

    #[tokio::test]
    async fn test_zero_fraction_checks_nothing() {
        let temp_dir = TempDir::new().unwrap();
        let repo = repository(&temp_dir).await;
        corrupt_one_block(&repo);

        let report = verify(&repo, 0.0).await.unwrap();
        assert_eq!(report, VerifyReport::default());
    }

    #[tokio::test]
    async fn test_out_of_range_fraction() {
        let temp_dir = TempDir::new().unwrap();
        let repo = repository(&temp_dir).await;
        assert!(verify(&repo, 1.5).await.is_err());
        assert!(verify(&repo, f64::NAN).await.is_err());
    }
}
