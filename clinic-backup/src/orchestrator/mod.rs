//! Orchestrator: runs the stages in order under the repository lock and
//! guarantees staging cleanup on every exit path.
//!
//! Fatal stage errors abort the rest of the pipeline. Once a snapshot has
//! been archived, retention and verification are both attempted and their
//! failures are reported as degraded.

pub mod context;
pub mod lock;
pub mod run_log;
pub mod state;

use crate::archival;
use crate::backend::{ArchiveBackend, Snapshot, VerifyReport};
use crate::config::Config;
use crate::dumper::{self, Dumper};
use crate::fs::staging::{self, StagingArea};
use crate::manifest;
use crate::repository;
use crate::retention::{self, PruneReport};
use crate::secrets;
use crate::utils::errors::{PipelineError, Result};
use crate::verifier;
use chrono::{DateTime, SubsecRound, Utc};
use context::RunContext;
use lock::RepositoryLock;
use run_log::{Outcome, RunLog};
use state::Stage;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

/// What a finished run produced.
#[derive(Debug)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub snapshot: Option<Snapshot>,
    pub prune: Option<PruneReport>,
    pub verify: Option<VerifyReport>,
    pub errors: Vec<PipelineError>,
}

impl RunReport {
    fn new(run_id: Uuid, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id,
            started_at,
            snapshot: None,
            prune: None,
            verify: None,
            errors: Vec::new(),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.errors.is_empty()
    }

    /// The first fatal error decides the code; otherwise degraded failures
    /// combine (retention 8, verification 9, both 10).
    pub fn exit_code(&self) -> u8 {
        if let Some(fatal) = self.errors.iter().find(|e| !e.is_degraded()) {
            return fatal.exit_code();
        }
        let retention = self.errors.iter().any(|e| matches!(e, PipelineError::Retention(_)));
        let verification = self
            .errors
            .iter()
            .any(|e| matches!(e, PipelineError::VerificationFailed(_)));
        match (retention, verification) {
            (true, true) => 10,
            (true, false) => 8,
            (false, true) => 9,
            (false, false) => 0,
        }
    }
}

#[derive(Debug)]
pub enum RunOutcome {
    Completed(RunReport),
    /// Another run held the repository lock.
    Skipped,
}

impl RunOutcome {
    pub fn exit_code(&self) -> u8 {
        match self {
            RunOutcome::Completed(report) => report.exit_code(),
            RunOutcome::Skipped => 0,
        }
    }
}

pub struct Pipeline {
    config: Config,
    backend: Arc<dyn ArchiveBackend>,
    dumper: Arc<dyn Dumper>,
}

impl Pipeline {
    pub fn new(config: Config, backend: Arc<dyn ArchiveBackend>, dumper: Arc<dyn Dumper>) -> Self {
        Self {
            config,
            backend,
            dumper,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn backend(&self) -> &dyn ArchiveBackend {
        self.backend.as_ref()
    }

    pub async fn run(&self, cancel: CancellationToken) -> Result<RunOutcome> {
        self.run_at(Utc::now(), cancel).await
    }

    /// Run the pipeline as if it started at `started_at`.
    ///
    /// Errors returned here happen before any stage runs (lock, run log);
    /// stage failures are carried in the [`RunReport`].
    pub async fn run_at(&self, started_at: DateTime<Utc>, cancel: CancellationToken) -> Result<RunOutcome> {
        let run_id = Uuid::new_v4();
        let started_at = started_at.trunc_subsecs(0);
        let lock_path = self.config.lock_path();

        let Some(lock) = RepositoryLock::try_acquire(&lock_path)? else {
            info!(
                run_id = %run_id,
                lock = %lock_path.display(),
                "Another run holds the repository lock; skipping"
            );
            match RunLog::open(&self.config.run_log, run_id) {
                Ok(mut log) => {
                    if let Err(e) = log.record(Stage::Idle, Outcome::Skipped, Some("repository lock held")) {
                        warn!(error = %e, "Failed to write run log");
                    }
                }
                Err(e) => warn!(error = %e, "Failed to open run log"),
            }
            return Ok(RunOutcome::Skipped);
        };

        let run_log = RunLog::open(&self.config.run_log, run_id)?;
        let mut ctx = RunContext::new(run_id, started_at, run_log, cancel);

        let span = info_span!("run", run_id = %run_id);
        let report = self.execute(&mut ctx).instrument(span).await;
        drop(lock);

        Ok(RunOutcome::Completed(report))
    }

    async fn execute(&self, ctx: &mut RunContext) -> RunReport {
        let mut report = RunReport::new(ctx.run_id, ctx.started_at);
        info!(
            repository = %self.backend.location(),
            started_at = %ctx.started_at,
            "Backup run started"
        );
        ctx.record(Stage::Idle, Outcome::Started, None);

        match staging::sweep_stale(&self.config.staging_parent()) {
            Ok(swept) if !swept.is_empty() => {
                warn!(count = swept.len(), "Removed staging areas left by an earlier run")
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Could not sweep stale staging areas"),
        }

        let mut staging_area = None;
        if let Err(e) = self.stages(ctx, &mut staging_area, &mut report).await {
            report.errors.push(e);
        }

        self.cleanup(ctx, staging_area, &mut report);

        let terminal = if report.succeeded() { Stage::Succeeded } else { Stage::Failed };
        let detail = format!("exit_code={}", report.exit_code());
        if let Err(e) = ctx.finish(terminal, &detail) {
            report.errors.push(e);
        }

        info!(
            exit_code = report.exit_code(),
            snapshot_id = report.snapshot.as_ref().map(|s| s.id.short()).unwrap_or("-"),
            "Backup run finished"
        );
        report
    }

    async fn stages(
        &self,
        ctx: &mut RunContext,
        staging_area: &mut Option<StagingArea>,
        report: &mut RunReport,
    ) -> Result<()> {
        let timeouts = &self.config.timeouts;

        let credential = match secrets::load_credential(&self.config.credential_path) {
            Ok(credential) => credential,
            Err(e) => {
                ctx.fail(Stage::Idle, &e);
                return Err(e);
            }
        };

        let outcome = ctx
            .run_stage(
                Stage::Initializing,
                Some(timeouts.init()),
                repository::ensure_repository(self.backend.as_ref()),
            )
            .await?;
        ctx.complete(Stage::Initializing, Some(&format!("{:?}", outcome)));

        let run_id = ctx.run_id;
        let started_at = ctx.started_at;
        let config = &self.config;
        let staging_parent = config.staging_parent();
        let (staging_dir, dumped, extra_tags) = ctx
            .run_stage(Stage::Dumping, Some(timeouts.dump()), async {
                let area = StagingArea::create(&staging_parent, &run_id)
                    .map_err(|e| PipelineError::DumpFailed(format!("cannot create staging area: {}", e)))?;
                let dir = staging_area.insert(area).path().to_path_buf();
                let dumped = dumper::dump(self.dumper.as_ref(), &credential, &dir).await?;
                let extra_tags = dumper::collect_extra_sources(&dir, &config.extra_sources).await?;
                Ok::<_, PipelineError>((dir, dumped, extra_tags))
            })
            .await?;
        drop(credential);
        ctx.complete(
            Stage::Dumping,
            Some(&format!("files={} bytes={}", dumped.files.len(), dumped.total_bytes)),
        );

        let dir = staging_dir.clone();
        let sealed = ctx
            .run_stage(Stage::ManifestBuilding, None, async move {
                let run_id = run_id.to_string();
                tokio::task::spawn_blocking(move || manifest::build_manifest(&dir, &run_id, started_at))
                    .await
                    .map_err(|e| PipelineError::ManifestBuild(format!("manifest task failed: {}", e)))?
            })
            .await?;
        ctx.complete(
            Stage::ManifestBuilding,
            Some(&format!("files={} bytes={}", sealed.total_files, sealed.total_bytes)),
        );

        let tags = archival::snapshot_tags(started_at.date_naive(), &extra_tags);
        let snapshot = ctx
            .run_stage(
                Stage::Archiving,
                Some(timeouts.archive()),
                archival::archive(self.backend.as_ref(), &staging_dir, &sealed, &tags, started_at),
            )
            .await?;
        ctx.complete(Stage::Archiving, Some(&format!("snapshot={}", snapshot.id)));
        let current = snapshot.id.clone();
        report.snapshot = Some(snapshot);

        // From here on the snapshot is safe; failures are degraded.
        match ctx
            .run_stage(
                Stage::Retaining,
                Some(timeouts.prune()),
                retention::enforce(self.backend.as_ref(), &self.config.retention, &current),
            )
            .await
        {
            Ok(pruned) => {
                ctx.complete(
                    Stage::Retaining,
                    Some(&format!("kept={} removed={}", pruned.kept.len(), pruned.removed.len())),
                );
                report.prune = Some(pruned);
            }
            Err(e) if e.is_degraded() => report.errors.push(e),
            Err(e) => return Err(e),
        }

        if ctx.cancel.is_cancelled() {
            ctx.skip(Stage::Verifying, "run cancelled");
            return Ok(());
        }
        match ctx
            .run_stage(
                Stage::Verifying,
                Some(timeouts.verify()),
                verifier::verify(self.backend.as_ref(), self.config.sample_fraction),
            )
            .await
        {
            Ok(verified) => {
                ctx.complete(
                    Stage::Verifying,
                    Some(&format!(
                        "blocks={} bytes={}",
                        verified.checked_blocks, verified.checked_bytes
                    )),
                );
                report.verify = Some(verified);
            }
            Err(e) if e.is_degraded() => report.errors.push(e),
            Err(e) => return Err(e),
        }

        Ok(())
    }

    fn cleanup(&self, ctx: &mut RunContext, staging_area: Option<StagingArea>, report: &mut RunReport) {
        if let Err(e) = ctx.enter(Stage::Cleanup) {
            report.errors.push(e);
        }

        let Some(area) = staging_area else {
            ctx.complete(Stage::Cleanup, Some("no staging area"));
            return;
        };
        let path = area.path().to_path_buf();
        match area.cleanup() {
            Ok(()) => ctx.complete(Stage::Cleanup, Some(&format!("removed {}", path.display()))),
            Err(e) => {
                let e = PipelineError::Io(e);
                ctx.fail(Stage::Cleanup, &e);
                report.errors.push(e);
            }
        }
    }

    /// Run the verifier alone under the repository lock. `None` when another run holds it.
    pub async fn verify_only(&self, sample_fraction: f64) -> Result<Option<VerifyReport>> {
        let Some(_lock) = RepositoryLock::try_acquire(&self.config.lock_path())? else {
            info!("Another run holds the repository lock; skipping verification");
            return Ok(None);
        };
        verifier::verify(self.backend.as_ref(), sample_fraction).await.map(Some)
    }
}
