//! Everything related to reading the bytes appended to a file since a given
//! offset.

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::locate::Fs;
use crate::Error;

/// Bytes read from a given source path, starting at a byte offset.
///
/// The cursor itself is not kept here: callers own the offset and advance it
/// to [`Chunk::end`] after consuming the bytes.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Chunk {
    /// The path from where the bytes were read.
    source: PathBuf,
    /// Offset of the first byte.
    start: u64,
    bytes: Vec<u8>,
}

impl Chunk {
    pub fn new(source: impl Into<PathBuf>, start: u64, bytes: Vec<u8>) -> Self {
        Chunk {
            source: source.into(),
            start,
            bytes,
        }
    }

    /// Returns a reference to the file from where the bytes were read.
    pub fn source(&self) -> &Path {
        self.source.as_path()
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    /// The offset to resume from on the next read.
    pub fn end(&self) -> u64 {
        self.start + self.bytes.len() as u64
    }

    pub fn bytes(&self) -> &[u8] {
        self.bytes.as_slice()
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Returns `true` if nothing was appended since `start`.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Returns the internal components that make up a `Chunk`.
    pub fn into_inner(self) -> (PathBuf, u64, Vec<u8>) {
        let Chunk {
            source,
            start,
            bytes,
        } = self;

        (source, start, bytes)
    }
}

impl IntoIterator for Chunk {
    type Item = u8;
    type IntoIter = std::vec::IntoIter<Self::Item>;

    fn into_iter(self) -> Self::IntoIter {
        self.bytes.into_iter()
    }
}

/// Capability for reading whatever was appended to a file past an offset.
#[async_trait]
pub trait ReadNew: Send + Sync {
    async fn read_new(&self, path: &Path, offset: u64) -> Result<Chunk, Error>;
}

/// Reads everything available in `path` past `offset`.
///
/// Returns an empty chunk ending at `offset` when nothing was appended.
/// A missing file is [`Error::FileNotFound`]; a file now shorter than
/// `offset` is [`Error::Truncated`]; anything else is [`Error::ReadFailure`].
pub async fn read_new(path: impl AsRef<Path>, offset: u64) -> Result<Chunk, Error> {
    let path = path.as_ref();
    let failed = |e: io::Error| Error::from_read(path, e);

    let mut file = File::open(path).await.map_err(failed)?;
    let len = file.metadata().await.map_err(failed)?.len();
    if len < offset {
        return Err(Error::Truncated {
            path: path.to_path_buf(),
            offset,
            len,
        });
    }

    file.seek(io::SeekFrom::Start(offset)).await.map_err(failed)?;

    // The writer may still be appending; take whatever is there by now.
    let mut bytes = Vec::with_capacity((len - offset) as usize);
    file.read_to_end(&mut bytes).await.map_err(failed)?;

    Ok(Chunk::new(path, offset, bytes))
}

#[async_trait]
impl ReadNew for Fs {
    async fn read_new(&self, path: &Path, offset: u64) -> Result<Chunk, Error> {
        read_new(path, offset).await
    }
}
