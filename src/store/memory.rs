//! In-memory blob store.

use super::{BlobMeta, BlobReader, BlobSink, BlobStore};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use tokio::io::AsyncWrite;

/// Cloneable handle to a shared in-memory map of blobs.
#[derive(Debug, Clone, Default)]
pub struct MemoryBlobStore {
    blobs: Arc<Mutex<BTreeMap<String, Bytes>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a blob directly, bypassing the sink.
    pub fn insert(&self, key: impl Into<String>, content: impl Into<Bytes>) {
        self.lock().insert(key.into(), content.into());
    }

    pub fn get(&self, key: &str) -> Option<Bytes> {
        self.lock().get(key).cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, Bytes>> {
        self.blobs.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn list(&self) -> io::Result<Vec<BlobMeta>> {
        Ok(self
            .lock()
            .iter()
            .map(|(key, content)| BlobMeta::new(key.clone(), content.len() as u64))
            .collect())
    }

    async fn exists(&self, key: &str) -> io::Result<bool> {
        Ok(self.lock().contains_key(key))
    }

    async fn open_read(&self, key: &str) -> io::Result<BlobReader> {
        let content = self.get(key).ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("no blob named '{}'", key))
        })?;
        Ok(Box::new(io::Cursor::new(content)))
    }

    async fn open_write(&self, key: &str) -> io::Result<Box<dyn BlobSink>> {
        Ok(Box::new(MemorySink {
            key: key.to_string(),
            buf: Vec::new(),
            store: self.clone(),
        }))
    }
}

struct MemorySink {
    key: String,
    buf: Vec<u8>,
    store: MemoryBlobStore,
}

impl AsyncWrite for MemorySink {
    fn poll_write(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.buf.extend_from_slice(data);
        Poll::Ready(Ok(data.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

#[async_trait]
impl BlobSink for MemorySink {
    async fn commit(&mut self) -> io::Result<()> {
        let content = Bytes::from(std::mem::take(&mut self.buf));
        self.store.insert(self.key.clone(), content);
        Ok(())
    }
}
