//! Directory traversal for reconciliation.
//!
//! Only the root has to be readable for a walk to start. Failures below the
//! root surface as per-entry errors so the caller can log and skip them.

use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Guard against pathological nesting and symlink loops
pub const DEFAULT_MAX_DEPTH: usize = 10_000;

/// Options for directory walking
#[derive(Debug, Clone)]
pub struct WalkOptions {
    /// Maximum depth below the root
    pub max_depth: usize,
}

impl Default for WalkOptions {
    fn default() -> Self {
        Self {
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }
}

/// Information about a regular file discovered during walking
#[derive(Debug, Clone)]
pub struct FileInfo {
    /// Full path to the file
    pub path: PathBuf,
}

/// Iterator over the regular files below a root.
///
/// Symlinks are not followed and never reported; directories and special
/// files are skipped.
pub struct FileWalk {
    inner: walkdir::IntoIter,
}

impl Iterator for FileWalk {
    type Item = Result<FileInfo, walkdir::Error>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let entry = match self.inner.next()? {
                Ok(entry) => entry,
                Err(e) => return Some(Err(e)),
            };

            if !entry.file_type().is_file() {
                continue;
            }

            return Some(Ok(FileInfo {
                path: entry.into_path(),
            }));
        }
    }
}

/// Start walking the regular files under `root`.
///
/// # Returns
/// * `Ok(FileWalk)` - Iterator yielding each file or a per-entry error
/// * `Err(io::Error)` - If the root itself cannot be read
///
/// # Example
/// ```no_run
/// use cloudsync_agent::fs::walker::{walk_files, WalkOptions};
/// use std::path::Path;
///
/// let files = walk_files(Path::new("/data"), &WalkOptions::default()).unwrap();
/// println!("Found {} files", files.filter_map(Result::ok).count());
/// ```
pub fn walk_files(root: &Path, options: &WalkOptions) -> std::io::Result<FileWalk> {
    fs::read_dir(root)?;

    let inner = WalkDir::new(root)
        .follow_links(false)
        .max_depth(options.max_depth)
        .into_iter();

    Ok(FileWalk { inner })
}
