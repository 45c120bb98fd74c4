//! Database credential loading.
//!
//! The connection string is read from a secret file once per run and only
//! leaves this type through [`Credential::expose`].

use crate::utils::errors::{PipelineError, Result};
use std::fmt;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use tracing::{debug, warn};

pub struct Credential(String);

impl Credential {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(<redacted>)")
    }
}

/// Read the credential file. Missing, unreadable or empty files are `CredentialUnavailable`.
pub fn load_credential(path: &Path) -> Result<Credential> {
    let unavailable = |reason: String| PipelineError::CredentialUnavailable {
        path: path.to_path_buf(),
        reason,
    };

    let metadata = fs::metadata(path).map_err(|e| unavailable(e.to_string()))?;
    if !metadata.is_file() {
        return Err(unavailable("not a regular file".to_string()));
    }
    if metadata.permissions().mode() & 0o077 != 0 {
        warn!(path = %path.display(), "Credential file is readable by group or others");
    }

    let content = fs::read_to_string(path).map_err(|e| unavailable(e.to_string()))?;
    let secret = content
        .strip_suffix('\n')
        .map(|s| s.strip_suffix('\r').unwrap_or(s))
        .unwrap_or(&content);
    if secret.trim().is_empty() {
        return Err(unavailable("file is empty".to_string()));
    }

    debug!(path = %path.display(), "Loaded database credential");
    Ok(Credential(secret.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_load_trims_single_trailing_newline() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("db-url");
        fs::write(&path, "postgres://clinic:s3cret@db/clinic\n").unwrap();

        let credential = load_credential(&path).unwrap();
        assert_eq!(credential.expose(), "postgres://clinic:s3cret@db/clinic");
    }

    #[test]
    fn test_missing_file_is_unavailable() {
        let temp_dir = TempDir::new().unwrap();
        let result = load_credential(&temp_dir.path().join("absent"));
        assert!(matches!(result, Err(PipelineError::CredentialUnavailable { .. })));
    }

    #[test]
    fn test_empty_file_is_unavailable() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("db-url");
        fs::write(&path, "\n").unwrap();

        assert!(matches!(
            load_credential(&path),
            Err(PipelineError::CredentialUnavailable { .. })
        ));
    }

    #[test]
    fn test_directory_is_unavailable() {
        let temp_dir = TempDir::new().unwrap();
        assert!(load_credential(temp_dir.path()).is_err());
    }

    #[test]
    fn test_debug_is_redacted() {
        let credential = Credential::new("postgres://clinic:s3cret@db/clinic");
        let rendered = format!("{:?}", credential);
        assert!(!rendered.contains("s3cret"));
    }
}
