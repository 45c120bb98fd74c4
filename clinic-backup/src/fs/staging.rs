//! Per-run staging area.
//!
//! Each run gets a fresh `run-<uuid>` directory under its repository's
//! staging parent (see `Config::staging_parent`). It is removed by
//! [`StagingArea::cleanup`] on every orchestrator exit path, and again on
//! drop if cleanup never ran (panic, early return).

use std::fs;
use std::io;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use uuid::Uuid;

const RUN_DIR_PREFIX: &str = "run-";

#[derive(Debug)]
pub struct StagingArea {
    path: PathBuf,
    removed: bool,
}

impl StagingArea {
    /// Create `<parent>/run-<run_id>`. Fails if it already exists.
    pub fn create(parent: &Path, run_id: &Uuid) -> io::Result<Self> {
        fs::create_dir_all(parent)?;
        let path = parent.join(format!("{}{}", RUN_DIR_PREFIX, run_id));
        fs::DirBuilder::new().mode(0o700).create(&path)?;
        Ok(Self {
            path,
            removed: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the staging directory and everything in it.
    pub fn cleanup(mut self) -> io::Result<()> {
        match fs::remove_dir_all(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        self.removed = true;
        Ok(())
    }
}

impl Drop for StagingArea {
    fn drop(&mut self) {
        if !self.removed {
            if let Err(e) = fs::remove_dir_all(&self.path) {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!(path = %self.path.display(), error = %e, "Failed to remove staging area");
                }
            }
        }
    }
}

/// Remove staging directories left behind by runs that crashed.
///
/// Only call this while holding the repository lock.
pub fn sweep_stale(parent: &Path) -> io::Result<Vec<PathBuf>> {
    let entries = match fs::read_dir(parent) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut removed = Vec::new();
    for entry in entries {
        let entry = entry?;
        let is_run_dir = entry.file_type()?.is_dir()
            && entry.file_name().to_string_lossy().starts_with(RUN_DIR_PREFIX);
        if is_run_dir {
            fs::remove_dir_all(entry.path())?;
            info!(path = %entry.path().display(), "Removed stale staging area");
            removed.push(entry.path());
        }
    }

    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    #[test]
    fn test_create_and_cleanup() {
        let temp_dir = TempDir::new().unwrap();
        let staging = StagingArea::create(temp_dir.path(), &Uuid::new_v4()).unwrap();
        let path = staging.path().to_path_buf();

        fs::write(path.join("database.sql.zst"), b"dump").unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);

        staging.cleanup().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_drop_removes_directory() {
        let temp_dir = TempDir::new().unwrap();
        let path = {
            let staging = StagingArea::create(temp_dir.path(), &Uuid::new_v4()).unwrap();
            fs::create_dir(staging.path().join("logs")).unwrap();
            staging.path().to_path_buf()
        };
        assert!(!path.exists());
    }

    #[test]
    fn test_create_is_exclusive() {
        let temp_dir = TempDir::new().unwrap();
        let run_id = Uuid::new_v4();
        let _first = StagingArea::create(temp_dir.path(), &run_id).unwrap();
        assert!(StagingArea::create(temp_dir.path(), &run_id).is_err());
    }

    #[test]
    fn test_sweep_stale_only_touches_run_dirs() {
        let temp_dir = TempDir::new().unwrap();
        fs::create_dir(temp_dir.path().join("run-crashed")).unwrap();
        fs::write(temp_dir.path().join("run-crashed/partial.sql.zst"), b"x").unwrap();
        fs::create_dir(temp_dir.path().join("keep-me")).unwrap();

        let removed = sweep_stale(temp_dir.path()).unwrap();
        assert_eq!(removed.len(), 1);
        assert!(!temp_dir.path().join("run-crashed").exists());
        assert!(temp_dir.path().join("keep-me").exists());

        assert!(sweep_stale(&temp_dir.path().join("missing")).unwrap().is_empty());
    }
}
