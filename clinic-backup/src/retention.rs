//! Retention enforcement.
//!
//! Each tier counts distinct calendar buckets (UTC day, ISO week, month) and
//! keeps the newest snapshot of each bucket it retains. The union of the tiers
//! is kept; everything else in the repository is forgotten.

use crate::backend::{ArchiveBackend, Snapshot, SnapshotId};
use crate::utils::errors::{PipelineError, Result};
use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    #[serde(default = "default_keep_daily")]
    pub keep_daily: u32,

    #[serde(default = "default_keep_weekly")]
    pub keep_weekly: u32,

    #[serde(default = "default_keep_monthly")]
    pub keep_monthly: u32,
}

fn default_keep_daily() -> u32 {
    7
}

fn default_keep_weekly() -> u32 {
    4
}

fn default_keep_monthly() -> u32 {
    6
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            keep_daily: default_keep_daily(),
            keep_weekly: default_keep_weekly(),
            keep_monthly: default_keep_monthly(),
        }
    }
}

impl RetentionPolicy {
    /// A policy with every tier at zero would prune the whole repository.
    pub fn keeps_nothing(&self) -> bool {
        self.keep_daily == 0 && self.keep_weekly == 0 && self.keep_monthly == 0
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PruneReport {
    pub kept: Vec<SnapshotId>,
    pub removed: Vec<SnapshotId>,
}

fn day_bucket(time: &DateTime<Utc>) -> (i32, u32) {
    (time.year(), time.ordinal())
}

fn week_bucket(time: &DateTime<Utc>) -> (i32, u32) {
    let week = time.iso_week();
    (week.year(), week.week())
}

fn month_bucket(time: &DateTime<Utc>) -> (i32, u32) {
    (time.year(), time.month())
}

/// Snapshot ids the policy retains.
///
/// Snapshots are walked newest first; equal timestamps are ordered by id so
/// the outcome does not depend on listing order.
pub fn select_keep(snapshots: &[Snapshot], policy: &RetentionPolicy) -> BTreeSet<SnapshotId> {
    let mut ordered: Vec<&Snapshot> = snapshots.iter().collect();
    ordered.sort_by(|a, b| b.time.cmp(&a.time).then_with(|| b.id.cmp(&a.id)));

    let tiers: [(u32, fn(&DateTime<Utc>) -> (i32, u32)); 3] = [
        (policy.keep_daily, day_bucket),
        (policy.keep_weekly, week_bucket),
        (policy.keep_monthly, month_bucket),
    ];

    let mut keep = BTreeSet::new();
    for (count, bucket_of) in tiers {
        let mut used = 0u32;
        let mut last_bucket = None;
        for snapshot in &ordered {
            if used == count {
                break;
            }
            let bucket = bucket_of(&snapshot.time);
            if last_bucket != Some(bucket) {
                keep.insert(snapshot.id.clone());
                last_bucket = Some(bucket);
                used += 1;
            }
        }
    }

    keep
}

/// Apply `policy` to the repository. `current` is the snapshot committed by
/// this run and is never removed.
pub async fn enforce(
    backend: &dyn ArchiveBackend,
    policy: &RetentionPolicy,
    current: &SnapshotId,
) -> Result<PruneReport> {
    if policy.keeps_nothing() {
        return Err(PipelineError::Retention(
            "policy keeps no snapshots; refusing to prune the whole repository".to_string(),
        ));
    }

    let snapshots = backend
        .snapshots()
        .await
        .map_err(|e| PipelineError::Retention(format!("cannot list snapshots: {}", e)))?;

    if !snapshots.iter().any(|s| &s.id == current) {
        return Err(PipelineError::Retention(format!(
            "snapshot {} from this run is not in the repository listing",
            current.short()
        )));
    }

    let mut keep = select_keep(&snapshots, policy);
    if keep.insert(current.clone()) {
        warn!(
            snapshot_id = %current.short(),
            "Snapshot from this run is outside the policy window; keeping it anyway"
        );
    }

    let (kept, removed): (Vec<&Snapshot>, Vec<&Snapshot>) =
        snapshots.iter().partition(|s| keep.contains(&s.id));
    let report = PruneReport {
        kept: kept.into_iter().map(|s| s.id.clone()).collect(),
        removed: removed.into_iter().map(|s| s.id.clone()).collect(),
    };

    if !report.removed.is_empty() {
        backend
            .forget(&report.removed)
            .await
            .map_err(|e| PipelineError::Retention(format!("prune failed: {}", e)))?;
    }

    info!(
        kept = report.kept.len(),
        removed = report.removed.len(),
        keep_daily = policy.keep_daily,
        keep_weekly = policy.keep_weekly,
        keep_monthly = policy.keep_monthly,
        "Retention policy applied"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::LocalArchive;
    use chrono::{Duration, TimeZone};
    use std::fs;
    use tempfile::TempDir;

    fn snapshot(id: &str, time: DateTime<Utc>) -> Snapshot {
        Snapshot {
            id: SnapshotId(id.to_string()),
            time,
            hostname: "clinic-db".to_string(),
            tags: BTreeSet::new(),
            total_bytes: 0,
        }
    }

    fn policy(keep_daily: u32, keep_weekly: u32, keep_monthly: u32) -> RetentionPolicy {
        RetentionPolicy {
            keep_daily,
            keep_weekly,
            keep_monthly,
        }
    }

    fn at(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, 0, 0).unwrap()
    }

    #[test]
    fn test_forty_daily_snapshots() {
        let start = at(2026, 1, 1, 2);
        let snapshots: Vec<Snapshot> = (0..40)
            .map(|i| snapshot(&format!("{:02}", i), start + Duration::days(i)))
            .collect();

        // 2026-01-01 is a Thursday; day 39 is Monday 2026-02-09 (ISO week 7).
        // Weekly adds the Sundays closing weeks 6, 5 and 4 (days 38, 31, 24).
        let keep = select_keep(&snapshots, &policy(7, 4, 0));
        let expected: BTreeSet<SnapshotId> = [24, 31, 33, 34, 35, 36, 37, 38, 39]
            .iter()
            .map(|i| SnapshotId(format!("{:02}", i)))
            .collect();
        assert_eq!(keep, expected);
    }

    #[test]
    fn test_newest_in_bucket_wins() {
        let snapshots = vec![
            snapshot("a", at(2026, 3, 2, 1)),
            snapshot("b", at(2026, 3, 2, 23)),
            snapshot("c", at(2026, 3, 1, 12)),
        ];
        let keep = select_keep(&snapshots, &policy(1, 0, 0));
        assert_eq!(keep, BTreeSet::from([SnapshotId("b".to_string())]));
    }

    #[test]
    fn test_equal_timestamps_ordered_by_id() {
        let time = at(2026, 3, 2, 1);
        let forward = vec![snapshot("a", time), snapshot("b", time)];
        let reversed = vec![snapshot("b", time), snapshot("a", time)];

        let keep = select_keep(&forward, &policy(1, 0, 0));
        assert_eq!(keep, select_keep(&reversed, &policy(1, 0, 0)));
        assert!(keep.contains(&SnapshotId("b".to_string())));
    }

    #[test]
    fn test_monthly_tier() {
        let snapshots = vec![
            snapshot("jan", at(2026, 1, 20, 2)),
            snapshot("feb-early", at(2026, 2, 3, 2)),
            snapshot("feb-late", at(2026, 2, 27, 2)),
            snapshot("mar", at(2026, 3, 1, 2)),
        ];
        let keep = select_keep(&snapshots, &policy(0, 0, 2));
        assert_eq!(
            keep,
            BTreeSet::from([SnapshotId("mar".to_string()), SnapshotId("feb-late".to_string())])
        );
    }

    #[test]
    fn test_iso_week_spans_year_boundary() {
        // 2025-12-29 and 2026-01-02 are both in ISO week 2026-W01
        let snapshots = vec![
            snapshot("mon", at(2025, 12, 29, 2)),
            snapshot("fri", at(2026, 1, 2, 2)),
            snapshot("prev", at(2025, 12, 26, 2)),
        ];
        let keep = select_keep(&snapshots, &policy(0, 1, 0));
        assert_eq!(keep, BTreeSet::from([SnapshotId("fri".to_string())]));
    }

    #[test]
    fn test_default_policy() {
        assert_eq!(RetentionPolicy::default(), policy(7, 4, 6));
        assert!(policy(0, 0, 0).keeps_nothing());
        assert!(!policy(0, 0, 1).keeps_nothing());
    }

    async fn repository_with_days(temp_dir: &TempDir, days: &[u32]) -> (LocalArchive, Vec<Snapshot>) {
        let location = temp_dir.path().join("repo");
        let repo = LocalArchive::new(location.to_str().unwrap(), 1024);
        repo.init().await.unwrap();

        let mut committed = Vec::new();
        for day in days {
            let source = temp_dir.path().join(format!("staging-{}", day));
            fs::create_dir_all(&source).unwrap();
            fs::write(source.join("database.sql.zst"), format!("dump of day {}", day)).unwrap();
            let tags = BTreeSet::from(["database".to_string()]);
            committed.push(repo.commit(&source, &tags, at(2026, 4, *day, 2)).await.unwrap());
        }
        (repo, committed)
    }

    #[tokio::test]
    async fn test_enforce_prunes_outside_policy() {
        let temp_dir = TempDir::new().unwrap();
        let (repo, committed) = repository_with_days(&temp_dir, &[1, 2, 3]).await;
        let current = committed[2].id.clone();

        let report = enforce(&repo, &policy(1, 0, 0), &current).await.unwrap();
        assert_eq!(report.kept, vec![current.clone()]);
        assert_eq!(report.removed.len(), 2);

        let remaining = repo.snapshots().await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, current);
    }

    #[tokio::test]
    async fn test_enforce_keeps_current_outside_window() {
        let temp_dir = TempDir::new().unwrap();
        let (repo, committed) = repository_with_days(&temp_dir, &[5, 1]).await;
        // Current run carries an older timestamp than an existing snapshot
        let current = committed[1].id.clone();

        let report = enforce(&repo, &policy(1, 0, 0), &current).await.unwrap();
        assert_eq!(report.kept.len(), 2);
        assert!(report.removed.is_empty());
    }

    #[tokio::test]
    async fn test_enforce_rejects_empty_policy() {
        let temp_dir = TempDir::new().unwrap();
        let (repo, committed) = repository_with_days(&temp_dir, &[1, 2]).await;

        let result = enforce(&repo, &policy(0, 0, 0), &committed[1].id).await;
        assert!(matches!(result, Err(PipelineError::Retention(_))));
        assert_eq!(repo.snapshots().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_enforce_requires_current_snapshot() {
        let temp_dir = TempDir::new().unwrap();
        let (repo, _) = repository_with_days(&temp_dir, &[1]).await;

        let missing = SnapshotId("ab".repeat(32));
        let result = enforce(&repo, &policy(7, 0, 0), &missing).await;
        assert!(matches!(result, Err(PipelineError::Retention(_))));
        assert_eq!(repo.snapshots().await.unwrap().len(), 1);
    }
}
