//! The error taxonomy shared by the locator, the tail cursor and startup.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("environment variable {0} is not set")]
    MissingEnv(&'static str),
    #[error("watched directory does not exist: {}", .0.display())]
    MissingDirectory(PathBuf),
    #[error("directory {} is unavailable: {source}", .path.display())]
    DirectoryUnavailable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("file {} no longer exists", .0.display())]
    FileNotFound(PathBuf),
    #[error("file {} shrank to {len} bytes, below read offset {offset}", .path.display())]
    Truncated { path: PathBuf, offset: u64, len: u64 },
    #[error("failed to read {}: {source}", .path.display())]
    ReadFailure {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl Error {
    /// Returns `true` for conditions that must stop the process before the
    /// watch loop is entered.
    pub fn is_startup_fatal(&self) -> bool {
        matches!(self, Error::MissingEnv(_) | Error::MissingDirectory(_))
    }

    /// Maps an I/O error on `path` to `FileNotFound` or `ReadFailure`.
    pub(crate) fn from_read(path: impl Into<PathBuf>, source: io::Error) -> Self {
        let path = path.into();
        if source.kind() == io::ErrorKind::NotFound {
            Error::FileNotFound(path)
        } else {
            Error::ReadFailure { path, source }
        }
    }
}
