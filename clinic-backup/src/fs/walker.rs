//! Directory traversal for staging and archiving.
//!
//! Only regular files are reported. Symlinks are never followed so a link
//! inside the staging area cannot pull outside content into a snapshot.

use std::io;
use std::path::{Path, PathBuf};
use walkdir::{DirEntry, WalkDir};

/// Options for directory walking
#[derive(Debug, Clone, Default)]
pub struct WalkOptions {
    /// File or directory names to skip, matched exactly
    pub exclude_names: Vec<String>,
}

/// A regular file discovered during walking
#[derive(Debug, Clone)]
pub struct FileInfo {
    /// Full path to the file
    pub path: PathBuf,

    /// Relative path from the root
    pub relative_path: PathBuf,

    /// File size in bytes
    pub size: u64,
}

impl FileInfo {
    fn from_entry(entry: &DirEntry, root: &Path) -> io::Result<Self> {
        let metadata = entry.metadata()?;
        let path = entry.path().to_path_buf();
        let relative_path = path.strip_prefix(root).unwrap_or(&path).to_path_buf();

        Ok(Self {
            path,
            relative_path,
            size: metadata.len(),
        })
    }
}

/// Walk a directory tree and collect every regular file, sorted by relative path.
///
/// # Example
/// ```no_run
/// use clinic_backup::fs::walker::{walk_files, WalkOptions};
/// use std::path::Path;
///
/// let files = walk_files(Path::new("/var/lib/clinic-backup/staging"), &WalkOptions::default()).unwrap();
/// println!("Found {} files", files.len());
/// ```
pub fn walk_files(root: &Path, options: &WalkOptions) -> io::Result<Vec<FileInfo>> {
    let mut files = Vec::new();

    let mut entries = WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter();
    while let Some(entry) = entries.next() {
        let entry = entry.map_err(io::Error::from)?;

        if entry.depth() > 0 && should_exclude(&entry, &options.exclude_names) {
            if entry.file_type().is_dir() {
                entries.skip_current_dir();
            }
            continue;
        }

        if !entry.file_type().is_file() {
            continue;
        }

        files.push(FileInfo::from_entry(&entry, root)?);
    }

    Ok(files)
}

fn should_exclude(entry: &DirEntry, names: &[String]) -> bool {
    let file_name = entry.file_name().to_string_lossy();
    names.iter().any(|name| *name == file_name)
}
