//! Integrity manifest for a staged dump.
//!
//! The manifest records every staged file with its size and SHA-256 digest.
//! It is serialized as `.backup-manifest.json` in the staging root so it is
//! archived inside the same snapshot as the files it describes.

use crate::fs::walker::{walk_files, WalkOptions};
use crate::utils::errors::{PipelineError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;
use tracing::info;

pub const MANIFEST_FILE: &str = ".backup-manifest.json";

const MANIFEST_VERSION: u32 = 1;

const DIGEST_BUFFER_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u32,
    pub run_id: String,
    pub created_at: DateTime<Utc>,
    /// Relative path → entry
    pub files: BTreeMap<String, ManifestEntry>,
    pub total_files: usize,
    pub total_bytes: u64,
}

/// Size and digest of a single staged file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub size: u64,
    pub sha256: String,
}

/// SHA-256 of a file's content, streamed. Returns (size, hex digest).
pub fn digest_file(path: &Path) -> io::Result<(u64, String)> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; DIGEST_BUFFER_SIZE];
    let mut size = 0u64;

    loop {
        let n = match file.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        hasher.update(&buf[..n]);
        size += n as u64;
    }

    Ok((size, hex::encode(hasher.finalize())))
}

fn manifest_walk_options() -> WalkOptions {
    WalkOptions {
        exclude_names: vec![MANIFEST_FILE.to_string()],
    }
}

/// Digest every regular file under `dir` and write the manifest into `dir`.
pub fn build_manifest(dir: &Path, run_id: &str, created_at: DateTime<Utc>) -> Result<Manifest> {
    let failed = |what: String| PipelineError::ManifestBuild(what);

    let files = walk_files(dir, &manifest_walk_options())
        .map_err(|e| failed(format!("cannot enumerate {}: {}", dir.display(), e)))?;

    let mut entries = BTreeMap::new();
    let mut total_bytes = 0u64;
    for file in &files {
        let (size, sha256) = digest_file(&file.path)
            .map_err(|e| failed(format!("cannot read {}: {}", file.path.display(), e)))?;
        total_bytes += size;
        entries.insert(
            file.relative_path.to_string_lossy().to_string(),
            ManifestEntry { size, sha256 },
        );
    }

    let manifest = Manifest {
        version: MANIFEST_VERSION,
        run_id: run_id.to_string(),
        created_at,
        total_files: entries.len(),
        total_bytes,
        files: entries,
    };

    manifest
        .write_to(dir)
        .map_err(|e| failed(format!("cannot write manifest: {}", e)))?;

    info!(
        files = manifest.total_files,
        total_bytes = manifest.total_bytes,
        "Integrity manifest written"
    );
    Ok(manifest)
}

impl Manifest {
    pub fn load(dir: &Path) -> io::Result<Self> {
        let data = std::fs::read(dir.join(MANIFEST_FILE))?;
        serde_json::from_slice(&data).map_err(io::Error::from)
    }

    fn write_to(&self, dir: &Path) -> io::Result<()> {
        let body = serde_json::to_vec_pretty(self)?;
        let mut file = File::create(dir.join(MANIFEST_FILE))?;
        file.write_all(&body)?;
        file.sync_all()
    }

    /// Files in `dir` that are missing from the manifest, absent from disk or
    /// have a different size. Empty when the manifest still covers `dir` exactly.
    pub fn coverage_problems(&self, dir: &Path) -> io::Result<Vec<String>> {
        let mut problems = Vec::new();
        let mut seen = 0usize;

        for file in walk_files(dir, &manifest_walk_options())? {
            let key = file.relative_path.to_string_lossy().to_string();
            match self.files.get(&key) {
                Some(entry) if entry.size == file.size => seen += 1,
                Some(entry) => {
                    seen += 1;
                    problems.push(format!("{} changed size ({} -> {})", key, entry.size, file.size));
                }
                None => problems.push(format!("{} is not in the manifest", key)),
            }
        }

        if seen != self.files.len() {
            problems.push(format!(
                "{} manifest entries are missing from disk",
                self.files.len() - seen
            ));
        }

        Ok(problems)
    }

    /// Recompute every digest under `dir` and list mismatching paths.
    pub fn verify(&self, dir: &Path) -> io::Result<Vec<String>> {
        let mut mismatches = self.coverage_problems(dir)?;
        for (path, entry) in &self.files {
            let full = dir.join(path);
            if !full.is_file() {
                continue;
            }
            let (_, sha256) = digest_file(&full)?;
            if sha256 != entry.sha256 {
                mismatches.push(format!("{} digest mismatch", path));
            }
        }
        Ok(mismatches)
    }
}
