//! Content-addressed repository on a local or mounted filesystem.
//!
//! Layout under the repository root:
//! - `config`: repository metadata (JSON)
//! - `blocks/<2 hex>/<sha256 hex>`: file content split into `chunk_size` blocks
//! - `snapshots/<id>.json`: one record per committed snapshot
//! - `tmp/`: in-flight writes
//!
//! A snapshot becomes visible only when its record is renamed into
//! `snapshots/`; blocks written before that point are garbage-collected by the
//! next `forget` if the commit never completes.

use super::{ArchiveBackend, RepositoryState, Snapshot, SnapshotId, VerifyReport};
use crate::fs::walker::{walk_files, WalkOptions};
use crate::utils::errors::BackendError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashSet};
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Component, Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

const REPO_VERSION: u32 = 1;
const CONFIG_FILE: &str = "config";
const BLOCKS_DIR: &str = "blocks";
const SNAPSHOTS_DIR: &str = "snapshots";
const TMP_DIR: &str = "tmp";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RepoConfig {
    version: u32,
    id: String,
    chunk_size: usize,
    created: DateTime<Utc>,
}

/// Snapshot record persisted at `snapshots/<id>.json`. The id is the SHA-256
/// of the record bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub time: DateTime<Utc>,
    pub hostname: String,
    pub tags: BTreeSet<String>,
    pub files: Vec<FileRecord>,
    pub total_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    /// Path relative to the committed directory, `/`-separated
    pub path: String,
    pub size: u64,
    /// Block digests in file order
    pub blocks: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct LocalArchive {
    root: PathBuf,
    location: String,
    chunk_size: usize,
}

impl LocalArchive {
    /// `chunk_size` only applies when this handle initializes the repository;
    /// afterwards the value recorded in the repository config is used.
    pub fn new(location: &str, chunk_size: usize) -> Self {
        Self {
            root: PathBuf::from(location),
            location: location.to_string(),
            chunk_size,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Write a snapshot's files under `target`, checking every block digest on the way.
    pub async fn restore(&self, id: &SnapshotId, target: &Path) -> Result<u64, BackendError> {
        let repo = self.clone();
        let id = id.clone();
        let target = target.to_path_buf();
        blocking(move || repo.restore_blocking(&id, &target)).await
    }

    /// Blocks live under a two-character fan-out directory. Anything but a
    /// SHA-256 hex digest is rejected before it becomes a path.
    fn block_path(&self, digest: &str) -> Result<PathBuf, BackendError> {
        if digest.len() != 64 || !digest.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(BackendError::Corrupt(format!("malformed block digest {:?}", digest)));
        }
        Ok(self.root.join(BLOCKS_DIR).join(&digest[..2]).join(digest))
    }

    fn snapshot_path(&self, id: &SnapshotId) -> Result<PathBuf, BackendError> {
        if id.0.is_empty() || !id.0.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(BackendError::UnknownSnapshot(id.0.clone()));
        }
        Ok(self.root.join(SNAPSHOTS_DIR).join(format!("{}.json", id.0)))
    }

    fn tmp_path(&self, name: &str) -> PathBuf {
        self.root.join(TMP_DIR).join(format!("{}.{}", name, Uuid::new_v4()))
    }

    fn read_config(&self) -> Result<RepoConfig, BackendError> {
        let data = match fs::read(self.root.join(CONFIG_FILE)) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(BackendError::NotFound(self.location.clone()));
            }
            Err(e) => return Err(e.into()),
        };
        let config: RepoConfig = serde_json::from_slice(&data)?;
        if config.version != REPO_VERSION {
            return Err(BackendError::Corrupt(format!(
                "unsupported repository version {}",
                config.version
            )));
        }
        if config.chunk_size == 0 {
            return Err(BackendError::Corrupt("repository chunk size is zero".into()));
        }
        Ok(config)
    }

    fn probe_blocking(&self) -> Result<RepositoryState, BackendError> {
        match fs::metadata(&self.root) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(RepositoryState::Missing),
            Err(e) => return Err(e.into()),
            Ok(meta) if !meta.is_dir() => {
                return Err(BackendError::Corrupt(format!(
                    "{} is not a directory",
                    self.root.display()
                )));
            }
            Ok(_) => {}
        }

        if self.root.join(CONFIG_FILE).exists() {
            self.read_config()?;
            return Ok(RepositoryState::Exists);
        }

        if fs::read_dir(&self.root)?.next().is_none() {
            Ok(RepositoryState::Missing)
        } else {
            Err(BackendError::Corrupt(format!(
                "{} is not empty and holds no repository",
                self.root.display()
            )))
        }
    }

    fn init_blocking(&self) -> Result<(), BackendError> {
        for dir in [BLOCKS_DIR, SNAPSHOTS_DIR, TMP_DIR] {
            fs::create_dir_all(self.root.join(dir))?;
        }

        let config = RepoConfig {
            version: REPO_VERSION,
            id: Uuid::new_v4().to_string(),
            chunk_size: self.chunk_size,
            created: Utc::now(),
        };
        let tmp = self.tmp_path(CONFIG_FILE);
        write_synced(&tmp, &serde_json::to_vec_pretty(&config)?)?;

        // hard_link refuses to replace an existing config
        let linked = fs::hard_link(&tmp, self.root.join(CONFIG_FILE));
        let _ = fs::remove_file(&tmp);
        linked?;
        sync_dir(&self.root)?;

        info!(location = %self.location, repo_id = %config.id, "Initialized local archive");
        Ok(())
    }

    fn load_records(&self) -> Result<Vec<(SnapshotId, Vec<u8>)>, BackendError> {
        self.read_config()?;
        let mut records = Vec::new();
        for entry in fs::read_dir(self.root.join(SNAPSHOTS_DIR))? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            records.push((SnapshotId(stem.to_string()), fs::read(&path)?));
        }
        Ok(records)
    }

    fn snapshots_blocking(&self) -> Result<Vec<Snapshot>, BackendError> {
        let mut snapshots = Vec::new();
        for (id, body) in self.load_records()? {
            let record: SnapshotRecord = serde_json::from_slice(&body)?;
            snapshots.push(Snapshot {
                id,
                time: record.time,
                hostname: record.hostname,
                tags: record.tags,
                total_bytes: record.total_bytes,
            });
        }
        snapshots.sort_by(|a, b| a.time.cmp(&b.time).then_with(|| a.id.cmp(&b.id)));
        Ok(snapshots)
    }

    fn commit_blocking(
        &self,
        source: &Path,
        tags: &BTreeSet<String>,
        time: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<Snapshot, BackendError> {
        let config = self.read_config()?;
        let files = walk_files(source, &WalkOptions::default())?;

        let mut records = Vec::with_capacity(files.len());
        let mut total_bytes = 0u64;
        for file in &files {
            if cancel.is_cancelled() {
                return Err(interrupted());
            }
            let blocks = self.store_file(&file.path, config.chunk_size)?;
            records.push(FileRecord {
                path: file.relative_path.to_string_lossy().to_string(),
                size: file.size,
                blocks,
            });
            total_bytes += file.size;
        }
        records.sort_by(|a, b| a.path.cmp(&b.path));

        let record = SnapshotRecord {
            time,
            hostname: local_hostname(),
            tags: tags.clone(),
            files: records,
            total_bytes,
        };
        let body = serde_json::to_vec_pretty(&record)?;
        let id = SnapshotId(hex::encode(Sha256::digest(&body)));

        let tmp = self.tmp_path("snapshot");
        write_synced(&tmp, &body)?;
        if cancel.is_cancelled() {
            let _ = fs::remove_file(&tmp);
            return Err(interrupted());
        }

        // Commit point
        fs::rename(&tmp, self.snapshot_path(&id)?)?;
        sync_dir(&self.root.join(SNAPSHOTS_DIR))?;

        info!(
            snapshot_id = %id.short(),
            files = record.files.len(),
            total_bytes,
            "Committed snapshot"
        );

        Ok(Snapshot {
            id,
            time: record.time,
            hostname: record.hostname,
            tags: record.tags,
            total_bytes,
        })
    }

    fn store_file(&self, path: &Path, chunk_size: usize) -> Result<Vec<String>, BackendError> {
        let mut file = File::open(path)?;
        let mut buf = vec![0u8; chunk_size];
        let mut blocks = Vec::new();

        loop {
            let n = read_full(&mut file, &mut buf)?;
            if n == 0 {
                break;
            }
            let data = &buf[..n];
            let digest = hex::encode(Sha256::digest(data));
            self.store_block(&digest, data)?;
            blocks.push(digest);
            if n < chunk_size {
                break;
            }
        }

        Ok(blocks)
    }

    fn store_block(&self, digest: &str, data: &[u8]) -> Result<(), BackendError> {
        let path = self.block_path(digest)?;
        if path.exists() {
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.tmp_path("block");
        write_synced(&tmp, data)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn forget_blocking(&self, ids: &[SnapshotId]) -> Result<(), BackendError> {
        self.read_config()?;
        for id in ids {
            match fs::remove_file(self.snapshot_path(id)?) {
                Ok(()) => debug!(snapshot_id = %id.short(), "Removed snapshot record"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    return Err(BackendError::UnknownSnapshot(id.0.clone()));
                }
                Err(e) => return Err(e.into()),
            }
        }
        sync_dir(&self.root.join(SNAPSHOTS_DIR))?;

        let removed = self.collect_garbage()?;
        info!(snapshots = ids.len(), blocks = removed, "Pruned repository");
        Ok(())
    }

    /// Delete blocks no snapshot references and leftovers in `tmp/`.
    fn collect_garbage(&self) -> Result<usize, BackendError> {
        let mut referenced = HashSet::new();
        for (_, body) in self.load_records()? {
            let record: SnapshotRecord = serde_json::from_slice(&body)?;
            for file in record.files {
                referenced.extend(file.blocks);
            }
        }

        let mut removed = 0usize;
        for block in walk_files(&self.root.join(BLOCKS_DIR), &WalkOptions::default())? {
            let name = block.path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
            if !referenced.contains(name) {
                fs::remove_file(&block.path)?;
                removed += 1;
            }
        }

        for entry in fs::read_dir(self.root.join(TMP_DIR))? {
            let path = entry?.path();
            if let Err(e) = fs::remove_file(&path) {
                warn!(path = %path.display(), error = %e, "Failed to remove temporary file");
            }
        }

        Ok(removed)
    }

    fn check_blocking(&self, sample_fraction: f64) -> Result<VerifyReport, BackendError> {
        let mut report = VerifyReport::default();
        let mut referenced = BTreeSet::new();

        for (id, body) in self.load_records()? {
            let digest = hex::encode(Sha256::digest(&body));
            if digest != id.0 {
                report.errors.push(format!("snapshot record {} does not match its digest", id.short()));
                continue;
            }
            let record: SnapshotRecord = serde_json::from_slice(&body)?;
            for file in record.files {
                referenced.extend(file.blocks);
            }
        }

        let mut present = Vec::with_capacity(referenced.len());
        for digest in referenced {
            match self.block_path(&digest) {
                Ok(path) if path.is_file() => present.push((digest, path)),
                Ok(_) => report.errors.push(format!("block {} is referenced but missing", digest)),
                Err(e) => report.errors.push(e.to_string()),
            }
        }

        let fraction = sample_fraction.clamp(0.0, 1.0);
        let amount = ((present.len() as f64 * fraction).ceil() as usize).min(present.len());
        let mut rng = rand::thread_rng();

        for index in rand::seq::index::sample(&mut rng, present.len(), amount) {
            let (digest, path) = &present[index];
            match fs::read(path) {
                Ok(data) => {
                    report.checked_blocks += 1;
                    report.checked_bytes += data.len() as u64;
                    if hex::encode(Sha256::digest(&data)) != *digest {
                        report.errors.push(format!("block {} does not match its digest", digest));
                    }
                }
                Err(e) => report.errors.push(format!("block {} unreadable: {}", digest, e)),
            }
        }

        debug!(
            checked_blocks = report.checked_blocks,
            total_blocks = present.len(),
            errors = report.errors.len(),
            "Sampled repository blocks"
        );
        Ok(report)
    }

    fn restore_blocking(&self, id: &SnapshotId, target: &Path) -> Result<u64, BackendError> {
        let body = match fs::read(self.snapshot_path(id)?) {
            Ok(body) => body,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(BackendError::UnknownSnapshot(id.0.clone()));
            }
            Err(e) => return Err(e.into()),
        };
        if hex::encode(Sha256::digest(&body)) != id.0 {
            return Err(BackendError::Corrupt(format!(
                "snapshot record {} does not match its digest",
                id.short()
            )));
        }
        let record: SnapshotRecord = serde_json::from_slice(&body)?;

        let mut restored = 0u64;
        for file in &record.files {
            let relative = Path::new(&file.path);
            if relative.components().any(|c| !matches!(c, Component::Normal(_))) {
                return Err(BackendError::Corrupt(format!("unsafe path in snapshot: {}", file.path)));
            }
            let dest = target.join(relative);
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)?;
            }
            let mut out = File::create(&dest)?;
            for digest in &file.blocks {
                let data = fs::read(self.block_path(digest)?)?;
                if hex::encode(Sha256::digest(&data)) != *digest {
                    return Err(BackendError::Corrupt(format!("block {} does not match its digest", digest)));
                }
                out.write_all(&data)?;
                restored += data.len() as u64;
            }
            out.sync_all()?;
        }

        Ok(restored)
    }
}

#[async_trait]
impl ArchiveBackend for LocalArchive {
    fn location(&self) -> &str {
        &self.location
    }

    async fn probe(&self) -> Result<RepositoryState, BackendError> {
        let repo = self.clone();
        blocking(move || repo.probe_blocking()).await
    }

    async fn init(&self) -> Result<(), BackendError> {
        let repo = self.clone();
        blocking(move || repo.init_blocking()).await
    }

    async fn snapshots(&self) -> Result<Vec<Snapshot>, BackendError> {
        let repo = self.clone();
        blocking(move || repo.snapshots_blocking()).await
    }

    async fn commit(
        &self,
        source: &Path,
        tags: &BTreeSet<String>,
        time: DateTime<Utc>,
    ) -> Result<Snapshot, BackendError> {
        let repo = self.clone();
        let source = source.to_path_buf();
        let tags = tags.clone();

        // Dropping this future (timeout, cancellation) stops the blocking
        // commit before its commit point.
        let cancel = CancellationToken::new();
        let _guard = cancel.clone().drop_guard();
        blocking(move || repo.commit_blocking(&source, &tags, time, &cancel)).await
    }

    async fn forget(&self, ids: &[SnapshotId]) -> Result<(), BackendError> {
        let repo = self.clone();
        let ids = ids.to_vec();
        blocking(move || repo.forget_blocking(&ids)).await
    }

    async fn check(&self, sample_fraction: f64) -> Result<VerifyReport, BackendError> {
        let repo = self.clone();
        blocking(move || repo.check_blocking(sample_fraction)).await
    }
}

async fn blocking<T, F>(f: F) -> Result<T, BackendError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, BackendError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| BackendError::Io(io::Error::other(e)))?
}

fn interrupted() -> BackendError {
    BackendError::Io(io::Error::new(io::ErrorKind::Interrupted, "commit interrupted"))
}

fn local_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Fill `buf` unless EOF comes first; returns the number of bytes read.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

fn write_synced(path: &Path, data: &[u8]) -> io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(data)?;
    file.sync_all()
}

fn sync_dir(path: &Path) -> io::Result<()> {
    File::open(path)?.sync_all()
}
