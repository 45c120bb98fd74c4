//! Clinic Backup Library
//!
//! Backup and disaster-recovery pipeline for the clinic database: dump,
//! integrity manifest, content-addressed archival, retention and sampled
//! verification.

pub mod archival;
pub mod backend;
pub mod config;
pub mod dumper;
pub mod fs;
pub mod manifest;
pub mod orchestrator;
pub mod repository;
pub mod retention;
pub mod secrets;
pub mod shutdown;
pub mod utils;
pub mod verifier;

// Re-export commonly used types
pub use config::Config;
pub use orchestrator::{Pipeline, RunOutcome, RunReport};
pub use utils::errors::PipelineError;
pub type Result<T> = std::result::Result<T, PipelineError>;
