//! Where to look, and how often.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::Error;

/// Environment variable naming the base directory.
pub const BASE_DIR_ENV: &str = "LOCALAPPDATA";

/// Subdirectory of the base directory that holds the logs.
pub const SUBDIRECTORY: &str = "Arma 3";

/// File name suffix of the logs being followed.
pub const SUFFIX: &str = ".rpt";

/// Delay between locate attempts while no matching file exists.
pub const IDLE_INTERVAL: Duration = Duration::from_secs(2);

/// Delay between reads while following a file.
pub const TAIL_INTERVAL: Duration = Duration::from_millis(500);

/// The directory to scan and the suffix filter applied to its entries.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct WatchTarget {
    directory: PathBuf,
    suffix: String,
}

impl WatchTarget {
    pub fn new(directory: impl Into<PathBuf>, suffix: impl Into<String>) -> Self {
        WatchTarget {
            directory: directory.into(),
            suffix: suffix.into(),
        }
    }

    /// Builds the target from [`BASE_DIR_ENV`].
    pub fn from_env() -> Result<Self, Error> {
        Self::resolve(std::env::var_os(BASE_DIR_ENV))
    }

    /// Builds the target from an already-read base directory value, failing
    /// if it is absent or the resulting directory does not exist.
    pub fn resolve(base: Option<OsString>) -> Result<Self, Error> {
        let base = match base {
            Some(base) if !base.is_empty() => PathBuf::from(base),
            _ => return Err(Error::MissingEnv(BASE_DIR_ENV)),
        };

        let directory = base.join(SUBDIRECTORY);
        if !directory.is_dir() {
            return Err(Error::MissingDirectory(directory));
        }

        Ok(WatchTarget::new(directory, SUFFIX))
    }

    pub fn directory(&self) -> &Path {
        self.directory.as_path()
    }

    pub fn suffix(&self) -> &str {
        &self.suffix
    }
}
