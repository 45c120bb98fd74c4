//! Repository initialization.

use crate::backend::{ArchiveBackend, RepositoryState};
use crate::utils::errors::{PipelineError, Result};
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitOutcome {
    Created,
    AlreadyExists,
}

/// Make sure the archive repository exists. Safe to call on every run.
pub async fn ensure_repository(backend: &dyn ArchiveBackend) -> Result<InitOutcome> {
    let failed = |what: &str, e: &dyn std::fmt::Display| {
        PipelineError::RepositoryInit(format!("{} {}: {}", what, backend.location(), e))
    };

    match backend.probe().await.map_err(|e| failed("cannot probe", &e))? {
        RepositoryState::Exists => {
            info!(repository = %backend.location(), "Repository already initialized");
            Ok(InitOutcome::AlreadyExists)
        }
        RepositoryState::Missing => {
            backend.init().await.map_err(|e| failed("cannot initialize", &e))?;
            info!(repository = %backend.location(), "Repository created");
            Ok(InitOutcome::Created)
        }
    }
}
