//! Per-run state handed through the pipeline.

use super::run_log::{Outcome, RunLog};
use super::state::{Stage, StateMachine};
use crate::utils::errors::{PipelineError, Result};
use chrono::{DateTime, Utc};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

pub struct RunContext {
    pub run_id: Uuid,
    /// Run start, UTC, whole seconds. Used as the snapshot time.
    pub started_at: DateTime<Utc>,
    pub cancel: CancellationToken,
    state: StateMachine,
    run_log: RunLog,
}

impl RunContext {
    pub fn new(run_id: Uuid, started_at: DateTime<Utc>, run_log: RunLog, cancel: CancellationToken) -> Self {
        Self {
            run_id,
            started_at,
            cancel,
            state: StateMachine::new(),
            run_log,
        }
    }

    pub fn stage(&self) -> Stage {
        self.state.current()
    }

    /// Append to the run log. A failed write is reported but never stops the run.
    pub fn record(&mut self, stage: Stage, outcome: Outcome, detail: Option<&str>) {
        if let Err(e) = self.run_log.record(stage, outcome, detail) {
            warn!(
                run_log = %self.run_log.path().display(),
                stage = %stage,
                error = %e,
                "Failed to write run log"
            );
        }
    }

    /// Move to `stage` and log its start.
    pub fn enter(&mut self, stage: Stage) -> Result<()> {
        self.state.advance(stage)?;
        info!(stage = %stage, "Stage started");
        self.record(stage, Outcome::Started, None);
        Ok(())
    }

    pub fn complete(&mut self, stage: Stage, detail: Option<&str>) {
        info!(stage = %stage, detail = detail.unwrap_or(""), "Stage finished");
        self.record(stage, Outcome::Ok, detail);
    }

    pub fn fail(&mut self, stage: Stage, err: &PipelineError) {
        error!(stage = %stage, error = %err, "Stage failed");
        self.record(stage, Outcome::Failed, Some(&err.to_string()));
    }

    /// Move to a terminal stage; its outcome line carries `detail`.
    pub fn finish(&mut self, terminal: Stage, detail: &str) -> Result<()> {
        self.state.advance(terminal)?;
        let outcome = if terminal == Stage::Succeeded { Outcome::Ok } else { Outcome::Failed };
        self.record(terminal, outcome, Some(detail));
        Ok(())
    }

    pub fn skip(&mut self, stage: Stage, reason: &str) {
        info!(stage = %stage, reason, "Stage skipped");
        self.record(stage, Outcome::Skipped, Some(reason));
    }

    /// Enter `stage` and drive `work`, bounded by `limit` and by cancellation.
    ///
    /// Timeouts and cancellation take the stage's failure path. Failures are
    /// logged here; success is left to the caller so it can add detail.
    pub async fn run_stage<T, F>(&mut self, stage: Stage, limit: Option<Duration>, work: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.enter(stage)?;

        let cancel = self.cancel.clone();
        let bounded = async {
            match limit {
                Some(limit) => match tokio::time::timeout(limit, work).await {
                    Ok(result) => result,
                    Err(_) => Err(stage.failure(format!("timed out after {:?}", limit))),
                },
                None => work.await,
            }
        };

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(stage.failure("run cancelled")),
            result = bounded => result,
        };

        if let Err(e) = &result {
            self.fail(stage, e);
        }
        result
    }
}
