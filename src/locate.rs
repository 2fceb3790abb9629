//! Finding the most recently modified file in a directory.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use async_trait::async_trait;
use tokio::fs;

use crate::Error;

macro_rules! unwrap_res_or {
    ($res:expr, $or:expr) => {
        if let Ok(val) = $res {
            val
        } else {
            $or;
        }
    };
}

macro_rules! unwrap_res_or_continue {
    ($res:expr) => {
        unwrap_res_or!($res, continue)
    };
}

/// A candidate file together with its modification time at scan time.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LatestFile {
    path: PathBuf,
    modified: SystemTime,
}

impl LatestFile {
    pub fn new(path: impl Into<PathBuf>, modified: SystemTime) -> Self {
        LatestFile {
            path: path.into(),
            modified,
        }
    }

    pub fn path(&self) -> &Path {
        self.path.as_path()
    }

    pub fn modified(&self) -> SystemTime {
        self.modified
    }

    /// Later modification wins; equal times fall back to the smaller path so
    /// the choice does not depend on directory order.
    pub(crate) fn supersedes(&self, other: &LatestFile) -> bool {
        self.modified > other.modified
            || (self.modified == other.modified && self.path < other.path)
    }

    pub fn into_inner(self) -> (PathBuf, SystemTime) {
        (self.path, self.modified)
    }
}

/// Capability for finding the newest file matching a suffix.
#[async_trait]
pub trait Locate: Send + Sync {
    async fn locate(&self, directory: &Path, suffix: &str) -> Result<Option<LatestFile>, Error>;
}

/// Scans `directory` (non-recursively) for regular files whose name ends
/// with `suffix`, returning the one with the greatest modification time.
///
/// Only metadata is read. Entries that vanish between listing and stat are
/// skipped; failure to list the directory itself is
/// [`Error::DirectoryUnavailable`].
pub async fn locate(
    directory: impl AsRef<Path>,
    suffix: &str,
) -> Result<Option<LatestFile>, Error> {
    let directory = directory.as_ref();
    let unavailable = |source| Error::DirectoryUnavailable {
        path: directory.to_path_buf(),
        source,
    };

    let mut entries = fs::read_dir(directory).await.map_err(unavailable)?;
    let mut latest: Option<LatestFile> = None;

    while let Some(entry) = entries.next_entry().await.map_err(unavailable)? {
        if !entry.file_name().to_string_lossy().ends_with(suffix) {
            continue;
        }

        let path = entry.path();
        // Follows symlinks, unlike `DirEntry::metadata`.
        let metadata = unwrap_res_or_continue!(fs::metadata(&path).await);
        if !metadata.is_file() {
            continue;
        }
        let modified = unwrap_res_or_continue!(metadata.modified());

        let candidate = LatestFile::new(path, modified);
        if latest
            .as_ref()
            .map_or(true, |current| candidate.supersedes(current))
        {
            latest = Some(candidate);
        }
    }

    tracing::debug!(
        directory = %directory.display(),
        latest = ?latest.as_ref().map(|f| f.path()),
        "scanned directory"
    );

    Ok(latest)
}

/// The real filesystem, used as both locator and reader.
#[derive(Clone, Copy, Debug, Default)]
pub struct Fs;

#[async_trait]
impl Locate for Fs {
    async fn locate(&self, directory: &Path, suffix: &str) -> Result<Option<LatestFile>, Error> {
        locate(directory, suffix).await
    }
}
