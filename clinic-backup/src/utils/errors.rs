//! Custom error types for the backup pipeline.

use crate::orchestrator::state::Stage;
use std::path::PathBuf;
use thiserror::Error;

/// Stage-level failures. The variant decides the process exit code.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Credential unavailable at {}: {reason}", path.display())]
    CredentialUnavailable { path: PathBuf, reason: String },

    #[error("Repository initialization failed: {0}")]
    RepositoryInit(String),

    #[error("Database dump failed: {0}")]
    DumpFailed(String),

    #[error("Manifest build failed: {0}")]
    ManifestBuild(String),

    #[error("Archival failed: {0}")]
    ArchivalFailed(String),

    #[error("Retention enforcement failed: {0}")]
    Retention(String),

    #[error("Verification failed: {0}")]
    VerificationFailed(String),

    #[error("Repository lock error: {0}")]
    Lock(String),

    #[error("Illegal stage transition: {from} -> {to}")]
    IllegalTransition { from: Stage, to: Stage },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    /// Degraded failures leave the new snapshot in place; everything else aborts the run.
    pub fn is_degraded(&self) -> bool {
        matches!(self, PipelineError::Retention(_) | PipelineError::VerificationFailed(_))
    }

    pub fn exit_code(&self) -> u8 {
        match self {
            PipelineError::Lock(_) | PipelineError::IllegalTransition { .. } | PipelineError::Io(_) => 1,
            PipelineError::Config(_) => 2,
            PipelineError::CredentialUnavailable { .. } => 3,
            PipelineError::RepositoryInit(_) => 4,
            PipelineError::DumpFailed(_) => 5,
            PipelineError::ManifestBuild(_) => 6,
            PipelineError::ArchivalFailed(_) => 7,
            PipelineError::Retention(_) => 8,
            PipelineError::VerificationFailed(_) => 9,
        }
    }
}

/// Errors reported by an archive backend.
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("No repository at {0}")]
    NotFound(String),

    #[error("{program} exited with {status}: {stderr}")]
    Command {
        program: String,
        status: String,
        stderr: String,
    },

    #[error("Corrupt repository data: {0}")]
    Corrupt(String),

    #[error("Unknown snapshot: {0}")]
    UnknownSnapshot(String),
}

/// Errors reported by a database dumper.
#[derive(Error, Debug)]
pub enum DumpError {
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} exited with {status}: {stderr}")]
    Exit {
        program: String,
        status: String,
        stderr: String,
    },

    #[error("I/O error while writing dump: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes_distinguish_stages() {
        let errors = [
            PipelineError::CredentialUnavailable {
                path: PathBuf::from("/run/secrets/db"),
                reason: "missing".to_string(),
            },
            PipelineError::RepositoryInit("x".into()),
            PipelineError::DumpFailed("x".into()),
            PipelineError::ManifestBuild("x".into()),
            PipelineError::ArchivalFailed("x".into()),
            PipelineError::Retention("x".into()),
            PipelineError::VerificationFailed("x".into()),
        ];
        let mut codes: Vec<u8> = errors.iter().map(|e| e.exit_code()).collect();
        assert!(codes.iter().all(|c| *c != 0));
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
    }

    #[test]
    fn test_degraded_classification() {
        assert!(PipelineError::Retention("x".into()).is_degraded());
        assert!(PipelineError::VerificationFailed("x".into()).is_degraded());
        assert!(!PipelineError::ArchivalFailed("x".into()).is_degraded());
        assert!(!PipelineError::DumpFailed("x".into()).is_degraded());
    }
}
