//! Blob store capability consumed by the replication core.
//!
//! A store maps opaque string keys to byte content. The core only needs to
//! list keys, open a sequential reader, and open a sink whose content becomes
//! visible atomically on [`BlobSink::commit`].

pub mod fs;
pub mod memory;

pub use fs::FsBlobStore;
pub use memory::MemoryBlobStore;

use async_trait::async_trait;
use std::io;
use tokio::io::{AsyncRead, AsyncWrite};

/// Sequential reader over one blob's content.
pub type BlobReader = Box<dyn AsyncRead + Send + Unpin>;

/// One entry of a store listing.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct BlobMeta {
    pub key: String,
    pub size: u64,
}

impl BlobMeta {
    pub fn new(key: impl Into<String>, size: u64) -> Self {
        Self {
            key: key.into(),
            size,
        }
    }
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Enumerate every blob currently visible in the store.
    async fn list(&self) -> io::Result<Vec<BlobMeta>>;

    async fn exists(&self, key: &str) -> io::Result<bool>;

    async fn open_read(&self, key: &str) -> io::Result<BlobReader>;

    /// Open a sink for `key`. Nothing is visible until `commit` succeeds;
    /// dropping the sink without committing discards what was written.
    async fn open_write(&self, key: &str) -> io::Result<Box<dyn BlobSink>>;
}

/// Write half of a blob being received.
#[async_trait]
pub trait BlobSink: AsyncWrite + Send + Unpin {
    /// Flush and publish the blob under its key.
    async fn commit(&mut self) -> io::Result<()>;
}
