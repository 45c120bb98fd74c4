//! Configuration management for the backup pipeline.
//!
//! Built-in defaults, then an optional TOML file, then `CLINIC_BACKUP_*`
//! environment variables (`__` separates nested keys, e.g.
//! `CLINIC_BACKUP_RETENTION__KEEP_DAILY=7`).

use crate::manifest::MANIFEST_FILE;
use crate::retention::RetentionPolicy;
use crate::utils::errors::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Read when no `--config` is given and the file exists.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/clinic-backup/config.toml";

pub const ENV_PREFIX: &str = "CLINIC_BACKUP";

/// Tags the pipeline sets itself; extra sources may not reuse them.
const RESERVED_TAGS: &[&str] = &["database", "secrets-excluded"];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Archive repository location (directory for `local`, any restic URL for `restic`)
    #[serde(default = "default_repository_location")]
    pub repository_location: String,

    /// Which archive backend drives the repository
    #[serde(default)]
    pub backend: BackendKind,

    /// Parent directory for per-run staging areas
    #[serde(default = "default_dump_destination")]
    pub dump_destination: PathBuf,

    /// Read-only secret file holding the database connection string
    #[serde(default = "default_credential_path")]
    pub credential_path: PathBuf,

    /// Append-only run log, outside the staging area
    #[serde(default = "default_run_log")]
    pub run_log: PathBuf,

    /// Directory holding the per-repository lock files
    #[serde(default = "default_lock_dir")]
    pub lock_dir: PathBuf,

    /// Fraction of stored blocks read back by the verifier (0.0 - 1.0)
    #[serde(default = "default_sample_fraction")]
    pub sample_fraction: f64,

    /// Block size used by the local archive (default: 1MB)
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    #[serde(default)]
    pub retention: RetentionPolicy,

    #[serde(default)]
    pub dump: DumpConfig,

    #[serde(default)]
    pub restic: ResticConfig,

    #[serde(default)]
    pub timeouts: TimeoutConfig,

    #[serde(default)]
    pub log: LogConfig,

    /// Additional content categories archived next to the dump
    #[serde(default)]
    pub extra_sources: Vec<ExtraSource>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Local,
    Restic,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DumpConfig {
    /// Export program
    #[serde(default = "default_dump_program")]
    pub program: String,

    /// Arguments; the export must be written to stdout
    #[serde(default = "default_dump_args")]
    pub args: Vec<String>,

    /// Environment variable carrying the credential into the export program
    #[serde(default = "default_credential_env")]
    pub credential_env: String,

    /// Name of the compressed dump inside the staging area
    #[serde(default = "default_dump_file_name")]
    pub file_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResticConfig {
    #[serde(default = "default_restic_binary")]
    pub binary: String,

    /// Repository password file (required for the restic backend)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_init_secs")]
    pub init_secs: u64,

    #[serde(default = "default_dump_secs")]
    pub dump_secs: u64,

    #[serde(default = "default_archive_secs")]
    pub archive_secs: u64,

    #[serde(default = "default_prune_secs")]
    pub prune_secs: u64,

    #[serde(default = "default_verify_secs")]
    pub verify_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

/// A directory archived under its own tag, e.g. application logs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtraSource {
    pub path: PathBuf,
    pub tag: String,
}

// Default values
fn default_repository_location() -> String {
    "/var/backups/clinic/repo".to_string()
}

fn default_dump_destination() -> PathBuf {
    PathBuf::from("/var/lib/clinic-backup/staging")
}

fn default_credential_path() -> PathBuf {
    PathBuf::from("/run/secrets/clinic-db-url")
}

fn default_run_log() -> PathBuf {
    PathBuf::from("/var/log/clinic-backup/runs.log")
}

fn default_lock_dir() -> PathBuf {
    PathBuf::from("/run/lock")
}

fn default_sample_fraction() -> f64 {
    0.1
}

fn default_chunk_size() -> usize {
    1024 * 1024 // 1MB
}

fn default_dump_program() -> String {
    "sh".to_string()
}

fn default_dump_args() -> Vec<String> {
    vec![
        "-c".to_string(),
        "exec pg_dump --no-owner --no-privileges --dbname=\"$DATABASE_URL\"".to_string(),
    ]
}

fn default_credential_env() -> String {
    "DATABASE_URL".to_string()
}

fn default_dump_file_name() -> String {
    "database.sql.zst".to_string()
}

fn default_restic_binary() -> String {
    "restic".to_string()
}

fn default_init_secs() -> u64 {
    60
}

fn default_dump_secs() -> u64 {
    3600
}

fn default_archive_secs() -> u64 {
    3600
}

fn default_prune_secs() -> u64 {
    1800
}

fn default_verify_secs() -> u64 {
    1800
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for DumpConfig {
    fn default() -> Self {
        Self {
            program: default_dump_program(),
            args: default_dump_args(),
            credential_env: default_credential_env(),
            file_name: default_dump_file_name(),
        }
    }
}

impl Default for ResticConfig {
    fn default() -> Self {
        Self {
            binary: default_restic_binary(),
            password_file: None,
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            init_secs: default_init_secs(),
            dump_secs: default_dump_secs(),
            archive_secs: default_archive_secs(),
            prune_secs: default_prune_secs(),
            verify_secs: default_verify_secs(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            repository_location: default_repository_location(),
            backend: BackendKind::default(),
            dump_destination: default_dump_destination(),
            credential_path: default_credential_path(),
            run_log: default_run_log(),
            lock_dir: default_lock_dir(),
            sample_fraction: default_sample_fraction(),
            chunk_size: default_chunk_size(),
            retention: RetentionPolicy::default(),
            dump: DumpConfig::default(),
            restic: ResticConfig::default(),
            timeouts: TimeoutConfig::default(),
            log: LogConfig::default(),
            extra_sources: Vec::new(),
        }
    }
}

impl TimeoutConfig {
    pub fn init(&self) -> Duration {
        Duration::from_secs(self.init_secs)
    }

    pub fn dump(&self) -> Duration {
        Duration::from_secs(self.dump_secs)
    }

    pub fn archive(&self) -> Duration {
        Duration::from_secs(self.archive_secs)
    }

    pub fn prune(&self) -> Duration {
        Duration::from_secs(self.prune_secs)
    }

    pub fn verify(&self) -> Duration {
        Duration::from_secs(self.verify_secs)
    }
}

/// A single path component that cannot escape the staging area or
/// collide with the manifest written into its root.
fn is_staging_entry_name(name: &str) -> bool {
    !name.is_empty()
        && !name.contains('/')
        && name != "."
        && name != ".."
        && name != MANIFEST_FILE
}

impl Config {
    /// Load configuration from defaults, an optional file and the process environment.
    ///
    /// An explicit `path` must exist; otherwise [`DEFAULT_CONFIG_PATH`] is read if present.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let _ = dotenvy::dotenv();
        Self::from_sources(path, config::Environment::with_prefix(ENV_PREFIX))
    }

    fn from_sources(path: Option<&Path>, env: config::Environment) -> Result<Self> {
        let (file, required) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => (PathBuf::from(DEFAULT_CONFIG_PATH), false),
        };

        let settings = config::Config::builder()
            .add_source(
                config::File::new(&file.to_string_lossy(), config::FileFormat::Toml)
                    .required(required),
            )
            .add_source(
                env.prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| PipelineError::Config(e.to_string()))?;

        let config: Config = settings
            .try_deserialize()
            .map_err(|e| PipelineError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.repository_location.trim().is_empty() {
            return Err(PipelineError::Config("repository_location is empty".into()));
        }
        if !self.sample_fraction.is_finite() || !(0.0..=1.0).contains(&self.sample_fraction) {
            return Err(PipelineError::Config(format!(
                "sample_fraction must be within 0.0..=1.0, got {}",
                self.sample_fraction
            )));
        }
        if self.chunk_size == 0 {
            return Err(PipelineError::Config("chunk_size must be greater than zero".into()));
        }
        if self.dump.program.is_empty() {
            return Err(PipelineError::Config("dump.program is empty".into()));
        }
        if !is_staging_entry_name(&self.dump.file_name) {
            return Err(PipelineError::Config(format!(
                "dump.file_name must be a plain file name, got {:?}",
                self.dump.file_name
            )));
        }
        if self.backend == BackendKind::Restic && self.restic.password_file.is_none() {
            return Err(PipelineError::Config(
                "restic.password_file is required for the restic backend".into(),
            ));
        }

        let mut seen = HashSet::new();
        for source in &self.extra_sources {
            let tag = source.tag.as_str();
            let malformed = !is_staging_entry_name(tag)
                || tag.contains(',')
                || tag.chars().any(char::is_whitespace);
            if malformed || RESERVED_TAGS.contains(&tag) || tag.starts_with("date-") {
                return Err(PipelineError::Config(format!(
                    "extra source {} has an unusable tag {:?}",
                    source.path.display(),
                    tag
                )));
            }
            if tag == self.dump.file_name {
                return Err(PipelineError::Config(format!(
                    "extra source tag {:?} collides with the dump file name",
                    tag
                )));
            }
            if !seen.insert(tag) {
                return Err(PipelineError::Config(format!(
                    "extra source tag {:?} is used more than once",
                    tag
                )));
            }
        }

        Ok(())
    }

    /// Lock file guarding this repository against concurrent runs.
    pub fn lock_path(&self) -> PathBuf {
        self.lock_dir
            .join(format!("clinic-backup-{}.lock", self.repository_digest()))
    }

    /// Parent of this repository's `run-*` staging areas.
    ///
    /// Scoped by repository so the stale sweep, which runs under the
    /// repository lock, never reaches another repository's live run.
    pub fn staging_parent(&self) -> PathBuf {
        self.dump_destination
            .join(format!("repo-{}", self.repository_digest()))
    }

    fn repository_digest(&self) -> String {
        let digest = hex::encode(Sha256::digest(self.repository_location.as_bytes()));
        digest[..16].to_string()
    }

    /// Render the effective configuration for `clinic-backup config`.
    pub fn to_toml(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn env(vars: &[(&str, &str)]) -> config::Environment {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        config::Environment::with_prefix(ENV_PREFIX).source(Some(map))
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.backend, BackendKind::Local);
        assert_eq!(config.retention.keep_daily, 7);
    }

    #[test]
    fn test_file_then_env_override() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
repository_location = "/srv/repo"
sample_fraction = 0.5

[retention]
keep_daily = 3
keep_weekly = 2

[[extra_sources]]
path = "/var/log/clinic"
tag = "logs"
"#,
        )
        .unwrap();

        let config = Config::from_sources(
            Some(&path),
            env(&[
                ("CLINIC_BACKUP_RETENTION__KEEP_DAILY", "10"),
                ("CLINIC_BACKUP_DUMP_DESTINATION", "/tmp/staging"),
            ]),
        )
        .unwrap();

        assert_eq!(config.repository_location, "/srv/repo");
        assert_eq!(config.retention.keep_daily, 10);
        assert_eq!(config.retention.keep_weekly, 2);
        assert_eq!(config.retention.keep_monthly, 6);
        assert_eq!(config.dump_destination, PathBuf::from("/tmp/staging"));
        assert!((config.sample_fraction - 0.5).abs() < f64::EPSILON);
        assert_eq!(config.extra_sources.len(), 1);
        assert_eq!(config.extra_sources[0].tag, "logs");
    }

    #[test]
    fn test_missing_explicit_file_is_error() {
        let result = Config::from_sources(Some(Path::new("/nonexistent/clinic.toml")), env(&[]));
        assert!(matches!(result, Err(PipelineError::Config(_))));
    }

    #[test]
    fn test_rejects_out_of_range_sample_fraction() {
        let config = Config {
            sample_fraction: 1.5,
            ..Config::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            sample_fraction: f64::NAN,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_reserved_extra_tag() {
        let config = Config {
            extra_sources: vec![ExtraSource {
                path: PathBuf::from("/etc/clinic"),
                tag: "database".to_string(),
            }],
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    fn with_tags(tags: &[&str]) -> Config {
        Config {
            extra_sources: tags
                .iter()
                .map(|tag| ExtraSource {
                    path: PathBuf::from("/var/log/clinic"),
                    tag: tag.to_string(),
                })
                .collect(),
            ..Config::default()
        }
    }

    #[test]
    fn test_rejects_dump_file_name_outside_staging_root() {
        for name in ["", ".", "..", "dir/database.sql.zst", MANIFEST_FILE] {
            let config = Config {
                dump: DumpConfig {
                    file_name: name.to_string(),
                    ..DumpConfig::default()
                },
                ..Config::default()
            };
            assert!(config.validate().is_err(), "accepted dump.file_name {:?}", name);
        }
    }

    #[test]
    fn test_rejects_extra_tags_that_escape_staging() {
        for tag in [".", "..", MANIFEST_FILE] {
            assert!(with_tags(&[tag]).validate().is_err(), "accepted tag {:?}", tag);
        }
        assert!(with_tags(&["logs", "uploads"]).validate().is_ok());
    }

    #[test]
    fn test_rejects_duplicate_extra_tags() {
        let err = with_tags(&["logs", "logs"]).validate().unwrap_err();
        assert!(err.to_string().contains("more than once"));
    }

    #[test]
    fn test_staging_parent_depends_on_repository() {
        let a = Config::default();
        let b = Config {
            repository_location: "/srv/other".to_string(),
            ..Config::default()
        };
        assert_ne!(a.staging_parent(), b.staging_parent());
        assert!(a.staging_parent().starts_with(&a.dump_destination));
        assert_eq!(a.staging_parent().parent(), Some(a.dump_destination.as_path()));
    }

    #[test]
    fn test_restic_requires_password_file() {
        let config = Config {
            backend: BackendKind::Restic,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_lock_path_depends_on_repository() {
        let a = Config::default();
        let b = Config {
            repository_location: "/srv/other".to_string(),
            ..Config::default()
        };
        assert_ne!(a.lock_path(), b.lock_path());
        assert_eq!(a.lock_path(), Config::default().lock_path());
    }
}
