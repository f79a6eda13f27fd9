//! Chunk sources: where outbound file bytes come from.

use crate::core::config::MAX_CHUNK_SIZE;
use bytes::Bytes;
use std::io;
use std::path::Path;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, SeekFrom};

/// A readable file image sliced into chunks of at most
/// [`MAX_CHUNK_SIZE`] bytes.
#[derive(Debug)]
pub enum ChunkSource {
    /// Backed by a file on disk, read slice-by-slice.
    File { file: File, len: u64 },
    /// Fully in memory. Used by tests and small payloads.
    Memory(Bytes),
}

impl ChunkSource {
    /// Open a file-backed source.
    pub async fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = File::open(path.as_ref()).await?;
        let len = file.metadata().await?.len();
        Ok(Self::File { file, len })
    }

    /// Wrap an in-memory byte image.
    pub fn from_bytes(data: impl Into<Bytes>) -> Self {
        Self::Memory(data.into())
    }

    /// Total length in bytes.
    pub fn len(&self) -> u64 {
        match self {
            Self::File { len, .. } => *len,
            Self::Memory(data) => data.len() as u64,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read the chunk starting at `offset`: `min(MAX_CHUNK_SIZE, len - offset)`
    /// bytes. Returns an empty chunk at or past the end.
    pub async fn read_at(&mut self, offset: u64) -> io::Result<Bytes> {
        let len = self.len();
        let take = (len.saturating_sub(offset) as usize).min(MAX_CHUNK_SIZE);
        match self {
            Self::File { file, .. } => {
                file.seek(SeekFrom::Start(offset)).await?;
                let mut buf = vec![0u8; take];
                file.read_exact(&mut buf).await?;
                Ok(Bytes::from(buf))
            }
            Self::Memory(data) => {
                let start = (offset as usize).min(data.len());
                Ok(data.slice(start..start + take))
            }
        }
    }
}
