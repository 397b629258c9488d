//! Sender task for blob replication.
//!
//! Walks the outbox, reads each blob from the store one chunk at a time and
//! queues OFFER / CHUNK / END frames for the wire writer. Finishes the
//! direction with DONE.

use crate::error::{Result, SyncError};
use crate::replicate::channel::{FrameSender, TransferStats};
use crate::replicate::progress::ProgressTracker;
use crate::replicate::protocol::{Chunk, Done, End, Offer};
use crate::store::BlobStore;
use bytes::Bytes;
use std::io;
use std::sync::Arc;
use tokio::io::AsyncReadExt;

/// Sender configuration
pub struct SenderConfig {
    /// Largest CHUNK payload
    pub chunk_size: usize,
}

/// One blob to send: key plus the size advertised in OFFER
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundBlob {
    pub key: String,
    pub size: u64,
}

/// Sender state
pub struct Sender {
    config: SenderConfig,
    store: Arc<dyn BlobStore>,
    tracker: Arc<ProgressTracker>,
}

impl Sender {
    pub fn new(
        config: SenderConfig,
        store: Arc<dyn BlobStore>,
        tracker: Arc<ProgressTracker>,
    ) -> Self {
        Self {
            config,
            store,
            tracker,
        }
    }

    /// Stream every blob in `outbox`, then DONE. The queue is dropped on
    /// return, which lets the wire writer finish.
    pub async fn run(self, outbox: Vec<OutboundBlob>, tx: FrameSender) -> Result<TransferStats> {
        let mut stats = TransferStats::default();

        for blob in outbox {
            let bytes = self.send_blob(&blob, &tx).await?;
            stats.blobs += 1;
            stats.bytes += bytes;

            let progress = self.tracker.advance();
            tracing::debug!(
                "Sent {} ({} bytes) [{}/{}]",
                blob.key,
                bytes,
                progress.sofar,
                progress.total
            );
        }

        let done = Done {
            blobs: stats.blobs,
            bytes: stats.bytes,
        };
        queue(&tx, done.encode()).await?;
        Ok(stats)
    }

    async fn send_blob(&self, blob: &OutboundBlob, tx: &FrameSender) -> Result<u64> {
        let mut reader = self
            .store
            .open_read(&blob.key)
            .await
            .map_err(|e| SyncError::store_read(&blob.key, e))?;

        let offer = Offer {
            key: blob.key.clone(),
            size: blob.size,
        };
        queue(tx, offer.encode()).await?;

        let mut sent = 0u64;
        let mut buf = vec![0u8; self.config.chunk_size.max(1)];
        loop {
            let n = reader
                .read(&mut buf)
                .await
                .map_err(|e| SyncError::store_read(&blob.key, e))?;
            if n == 0 {
                break;
            }

            sent += n as u64;
            if sent > blob.size {
                return Err(changed_underneath(&blob.key, blob.size, sent));
            }

            let chunk = Chunk {
                data: Bytes::copy_from_slice(&buf[..n]),
            };
            queue(tx, chunk.encode()).await?;
        }

        if sent != blob.size {
            return Err(changed_underneath(&blob.key, blob.size, sent));
        }

        queue(tx, End.encode()).await?;
        Ok(sent)
    }
}

async fn queue(tx: &FrameSender, frame: Bytes) -> Result<()> {
    tx.send(frame).await.map_err(|_| SyncError::ChannelClosed)
}

fn changed_underneath(key: &str, listed: u64, read: u64) -> SyncError {
    SyncError::store_read(
        key,
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!(
                "blob changed during transfer: listed {} bytes, read {}",
                listed, read
            ),
        ),
    )
}
