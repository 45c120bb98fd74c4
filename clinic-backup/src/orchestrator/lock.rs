//! Repository-scoped mutual exclusion through `flock(2)`.

use crate::utils::errors::{PipelineError, Result};
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Held for the whole run; released when dropped or when the process dies.
#[derive(Debug)]
pub struct RepositoryLock {
    _file: Flock<File>,
    path: PathBuf,
}

impl RepositoryLock {
    /// Take the lock without waiting. `Ok(None)` means another run holds it.
    pub fn try_acquire(path: &Path) -> Result<Option<Self>> {
        let failed = |what: &str, e: &dyn std::fmt::Display| {
            PipelineError::Lock(format!("{} {}: {}", what, path.display(), e))
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| failed("cannot create lock directory for", &e))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)
            .map_err(|e| failed("cannot open", &e))?;

        let mut locked = match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(locked) => locked,
            Err((_, errno)) if errno == Errno::EWOULDBLOCK => return Ok(None),
            Err((_, errno)) => return Err(failed("cannot lock", &errno)),
        };

        // Holder pid, informational only
        locked.set_len(0).map_err(|e| failed("cannot write", &e))?;
        writeln!(locked, "{}", std::process::id()).map_err(|e| failed("cannot write", &e))?;

        debug!(lock = %path.display(), "Acquired repository lock");
        Ok(Some(Self {
            _file: locked,
            path: path.to_path_buf(),
        }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
