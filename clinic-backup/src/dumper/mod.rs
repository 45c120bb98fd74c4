//! Dump stage: database export plus any extra sources into the staging area.

pub mod command;

pub use command::CommandDumper;

use crate::config::ExtraSource;
use crate::fs::walker::{walk_files, WalkOptions};
use crate::secrets::Credential;
use crate::utils::errors::{DumpError, PipelineError, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Clone, Default)]
pub struct DumpResult {
    pub files: Vec<PathBuf>,
    pub total_bytes: u64,
}

/// Produces a compressed, self-consistent export of the whole database.
#[async_trait]
pub trait Dumper: Send + Sync {
    async fn dump(&self, credential: &Credential, destination: &Path) -> Result<DumpResult, DumpError>;
}

/// Run `dumper` into `destination`. Every failure is `DumpFailed`; there is no retry.
pub async fn dump(dumper: &dyn Dumper, credential: &Credential, destination: &Path) -> Result<DumpResult> {
    let result = dumper
        .dump(credential, destination)
        .await
        .map_err(|e| PipelineError::DumpFailed(e.to_string()))?;

    if result.files.is_empty() {
        return Err(PipelineError::DumpFailed("export produced no files".to_string()));
    }

    info!(
        files = result.files.len(),
        total_bytes = result.total_bytes,
        "Dump stage complete"
    );
    Ok(result)
}

/// Copy extra sources into `<staging>/<tag>/` and return their tags.
///
/// A source may be a single file or a directory; symlinks are not followed.
pub async fn collect_extra_sources(staging: &Path, sources: &[ExtraSource]) -> Result<Vec<String>> {
    if sources.is_empty() {
        return Ok(Vec::new());
    }

    let staging = staging.to_path_buf();
    let sources = sources.to_vec();
    tokio::task::spawn_blocking(move || copy_sources(&staging, &sources))
        .await
        .map_err(|e| PipelineError::DumpFailed(format!("extra source copy task failed: {}", e)))?
}

fn copy_sources(staging: &Path, sources: &[ExtraSource]) -> Result<Vec<String>> {
    let failed = |source: &ExtraSource, e: std::io::Error| {
        PipelineError::DumpFailed(format!("cannot copy {} ({}): {}", source.path.display(), source.tag, e))
    };

    let mut tags = Vec::with_capacity(sources.len());
    for source in sources {
        let target_root = staging.join(&source.tag);
        std::fs::create_dir_all(&target_root).map_err(|e| failed(source, e))?;

        let metadata = std::fs::symlink_metadata(&source.path).map_err(|e| failed(source, e))?;
        let (files, bytes) = if metadata.is_file() {
            let name = source.path.file_name().unwrap_or(source.path.as_os_str());
            let bytes = std::fs::copy(&source.path, target_root.join(name)).map_err(|e| failed(source, e))?;
            (1, bytes)
        } else {
            let mut files = 0usize;
            let mut bytes = 0u64;
            for file in walk_files(&source.path, &WalkOptions::default()).map_err(|e| failed(source, e))? {
                let target = target_root.join(&file.relative_path);
                if let Some(parent) = target.parent() {
                    std::fs::create_dir_all(parent).map_err(|e| failed(source, e))?;
                }
                bytes += std::fs::copy(&file.path, &target).map_err(|e| failed(source, e))?;
                files += 1;
            }
            (files, bytes)
        };

        info!(tag = %source.tag, files, bytes, "Collected extra source");
        tags.push(source.tag.clone());
    }

    Ok(tags)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    struct EmptyDumper;

    #[async_trait]
    impl Dumper for EmptyDumper {
        async fn dump(&self, _: &Credential, _: &Path) -> Result<DumpResult, DumpError> {
            Ok(DumpResult::default())
        }
    }

    #[tokio::test]
    async fn test_empty_export_is_a_failure() {
        let temp_dir = TempDir::new().unwrap();
        let result = dump(&EmptyDumper, &Credential::new("x"), temp_dir.path()).await;
        assert!(matches!(result, Err(PipelineError::DumpFailed(_))));
    }

    #[tokio::test]
    async fn test_collect_extra_sources() {
        let sources_dir = TempDir::new().unwrap();
        let staging = TempDir::new().unwrap();

        let logs = sources_dir.path().join("logs");
        fs::create_dir_all(logs.join("2026")).unwrap();
        fs::write(logs.join("app.log"), b"started").unwrap();
        fs::write(logs.join("2026/old.log"), b"older").unwrap();
        let settings = sources_dir.path().join("settings.toml");
        fs::write(&settings, b"clinic = \"north\"").unwrap();

        let tags = collect_extra_sources(
            staging.path(),
            &[
                ExtraSource {
                    path: logs,
                    tag: "logs".to_string(),
                },
                ExtraSource {
                    path: settings,
                    tag: "config".to_string(),
                },
            ],
        )
        .await
        .unwrap();

        assert_eq!(tags, vec!["logs".to_string(), "config".to_string()]);
        assert_eq!(fs::read(staging.path().join("logs/app.log")).unwrap(), b"started");
        assert_eq!(fs::read(staging.path().join("logs/2026/old.log")).unwrap(), b"older");
        assert!(staging.path().join("config/settings.toml").is_file());
    }

    #[tokio::test]
    async fn test_missing_extra_source_fails_dump() {
        let staging = TempDir::new().unwrap();
        let result = collect_extra_sources(
            staging.path(),
            &[ExtraSource {
                path: staging.path().join("absent"),
                tag: "logs".to_string(),
            }],
        )
        .await;
        assert!(matches!(result, Err(PipelineError::DumpFailed(_))));
    }
}
