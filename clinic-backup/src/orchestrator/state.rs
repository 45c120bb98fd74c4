//! Run stages and the legal transitions between them.

use crate::utils::errors::{PipelineError, Result};
use std::fmt;
use std::io;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Idle,
    Initializing,
    Dumping,
    ManifestBuilding,
    Archiving,
    Retaining,
    Verifying,
    Cleanup,
    Succeeded,
    Failed,
}

impl Stage {
    pub fn name(self) -> &'static str {
        match self {
            Stage::Idle => "idle",
            Stage::Initializing => "initializing",
            Stage::Dumping => "dumping",
            Stage::ManifestBuilding => "manifest_building",
            Stage::Archiving => "archiving",
            Stage::Retaining => "retaining",
            Stage::Verifying => "verifying",
            Stage::Cleanup => "cleanup",
            Stage::Succeeded => "succeeded",
            Stage::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Stage::Succeeded | Stage::Failed)
    }

    /// Stages run strictly in order. Any running stage may bail out to
    /// `Cleanup`, and only `Cleanup` leads to a terminal state.
    pub fn can_advance_to(self, next: Stage) -> bool {
        use Stage::*;
        match (self, next) {
            (Idle, Initializing)
            | (Initializing, Dumping)
            | (Dumping, ManifestBuilding)
            | (ManifestBuilding, Archiving)
            | (Archiving, Retaining)
            | (Retaining, Verifying)
            | (Cleanup, Succeeded)
            | (Cleanup, Failed) => true,
            (from, Cleanup) => !from.is_terminal() && from != Cleanup,
            _ => false,
        }
    }

    /// The error a stage reports when it is cut short (timeout, cancellation).
    pub fn failure(self, detail: impl Into<String>) -> PipelineError {
        let detail = detail.into();
        match self {
            Stage::Initializing => PipelineError::RepositoryInit(detail),
            Stage::Dumping => PipelineError::DumpFailed(detail),
            Stage::ManifestBuilding => PipelineError::ManifestBuild(detail),
            Stage::Archiving => PipelineError::ArchivalFailed(detail),
            Stage::Retaining => PipelineError::Retention(detail),
            Stage::Verifying => PipelineError::VerificationFailed(detail),
            _ => PipelineError::Io(io::Error::other(detail)),
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug)]
pub struct StateMachine {
    current: Stage,
    visited: Vec<Stage>,
}

impl StateMachine {
    pub fn new() -> Self {
        Self {
            current: Stage::Idle,
            visited: vec![Stage::Idle],
        }
    }

    pub fn current(&self) -> Stage {
        self.current
    }

    /// Every stage entered so far, in order.
    pub fn visited(&self) -> &[Stage] {
        &self.visited
    }

    pub fn advance(&mut self, next: Stage) -> Result<()> {
        if !self.current.can_advance_to(next) {
            return Err(PipelineError::IllegalTransition {
                from: self.current,
                to: next,
            });
        }
        self.current = next;
        self.visited.push(next);
        Ok(())
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_sequence() {
        let mut machine = StateMachine::new();
        for stage in [
            Stage::Initializing,
            Stage::Dumping,
            Stage::ManifestBuilding,
            Stage::Archiving,
            Stage::Retaining,
            Stage::Verifying,
            Stage::Cleanup,
            Stage::Succeeded,
        ] {
            machine.advance(stage).unwrap();
        }
        assert_eq!(machine.current(), Stage::Succeeded);
        assert_eq!(machine.visited().len(), 9);
    }

    #[test]
    fn test_rejects_skipping_ahead() {
        let mut machine = StateMachine::new();
        machine.advance(Stage::Initializing).unwrap();
        machine.advance(Stage::Dumping).unwrap();

        let err = machine.advance(Stage::Retaining).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::IllegalTransition {
                from: Stage::Dumping,
                to: Stage::Retaining
            }
        ));
        assert_eq!(machine.current(), Stage::Dumping);
        assert_eq!(err.exit_code(), 1);
    }

    #[test]
    fn test_cleanup_reachable_from_any_running_stage() {
        for stage in [
            Stage::Idle,
            Stage::Initializing,
            Stage::Dumping,
            Stage::ManifestBuilding,
            Stage::Archiving,
            Stage::Retaining,
            Stage::Verifying,
        ] {
            assert!(stage.can_advance_to(Stage::Cleanup), "{}", stage);
            assert!(!stage.can_advance_to(Stage::Succeeded), "{}", stage);
        }
        assert!(!Stage::Cleanup.can_advance_to(Stage::Cleanup));
        assert!(!Stage::Failed.can_advance_to(Stage::Cleanup));
    }

    #[test]
    fn test_retaining_only_after_archiving() {
        assert!(Stage::Archiving.can_advance_to(Stage::Retaining));
        assert!(!Stage::ManifestBuilding.can_advance_to(Stage::Retaining));
        assert!(!Stage::Archiving.can_advance_to(Stage::Verifying));
    }

    #[test]
    fn test_stage_names() {
        assert_eq!(Stage::ManifestBuilding.to_string(), "manifest_building");
        assert!(matches!(
            Stage::Dumping.failure("timed out"),
            PipelineError::DumpFailed(_)
        ));
    }
}
