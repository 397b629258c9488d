//! Receiver task for blob replication.
//!
//! Consumes OFFER / CHUNK / END frames forwarded by the wire reader and
//! writes each blob through a store sink, committing it on END. Blobs are
//! strictly sequential: an OFFER is only accepted once the previous blob
//! was closed.

use crate::error::{Result, SyncError};
use crate::replicate::channel::{InboundFrame, InboundReceiver, TransferStats};
use crate::replicate::progress::ProgressTracker;
use crate::store::{BlobSink, BlobStore};
use bytes::Bytes;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;

/// Receiver state
pub struct Receiver {
    store: Arc<dyn BlobStore>,
    tracker: Arc<ProgressTracker>,
    /// Keys still expected from the peer
    pending_keys: BTreeSet<String>,
    current: Option<PendingBlob>,
    stats: TransferStats,
}

struct PendingBlob {
    key: String,
    size: u64,
    sink: Box<dyn BlobSink>,
    bytes_written: u64,
}

impl Receiver {
    pub fn new(
        store: Arc<dyn BlobStore>,
        tracker: Arc<ProgressTracker>,
        inbox: BTreeSet<String>,
    ) -> Self {
        Self {
            store,
            tracker,
            pending_keys: inbox,
            current: None,
            stats: TransferStats::default(),
        }
    }

    /// Drain the inbound queue until the wire reader closes it.
    pub async fn run(mut self, mut rx: InboundReceiver) -> Result<TransferStats> {
        while let Some(frame) = rx.recv().await {
            self.handle_frame(frame).await?;
        }

        if let Some(pending) = self.current.take() {
            // Dropping the sink discards the partial blob.
            tracing::warn!(
                "Stream ended inside blob {} after {} of {} bytes",
                pending.key,
                pending.bytes_written,
                pending.size
            );
            return Err(SyncError::ChannelClosed);
        }

        Ok(self.stats)
    }

    /// Process one inbound frame.
    pub async fn handle_frame(&mut self, frame: InboundFrame) -> Result<()> {
        match frame {
            InboundFrame::Offer { key, size } => self.handle_offer(key, size).await,
            InboundFrame::Chunk(data) => self.handle_chunk(data).await,
            InboundFrame::End => self.handle_end().await,
        }
    }

    async fn handle_offer(&mut self, key: String, size: u64) -> Result<()> {
        if let Some(open) = &self.current {
            return Err(SyncError::Protocol(format!(
                "OFFER for '{}' while '{}' is still open",
                key, open.key
            )));
        }
        if !self.pending_keys.remove(&key) {
            return Err(SyncError::Protocol(format!(
                "unexpected OFFER for '{}'",
                key
            )));
        }

        let sink = self
            .store
            .open_write(&key)
            .await
            .map_err(|e| SyncError::store_write(&key, e))?;

        self.current = Some(PendingBlob {
            key,
            size,
            sink,
            bytes_written: 0,
        });
        Ok(())
    }

    async fn handle_chunk(&mut self, data: Bytes) -> Result<()> {
        let pending = self
            .current
            .as_mut()
            .ok_or_else(|| SyncError::Protocol("CHUNK outside of a blob".into()))?;

        let written = pending.bytes_written + data.len() as u64;
        if written > pending.size {
            return Err(SyncError::Protocol(format!(
                "blob '{}' overran its offered size of {} bytes",
                pending.key, pending.size
            )));
        }

        pending
            .sink
            .write_all(&data)
            .await
            .map_err(|e| SyncError::store_write(&pending.key, e))?;
        pending.bytes_written = written;
        Ok(())
    }

    async fn handle_end(&mut self) -> Result<()> {
        let mut pending = self
            .current
            .take()
            .ok_or_else(|| SyncError::Protocol("END outside of a blob".into()))?;

        if pending.bytes_written != pending.size {
            return Err(SyncError::Protocol(format!(
                "blob '{}' ended after {} of {} bytes",
                pending.key, pending.bytes_written, pending.size
            )));
        }

        pending
            .sink
            .commit()
            .await
            .map_err(|e| SyncError::store_write(&pending.key, e))?;

        self.stats.blobs += 1;
        self.stats.bytes += pending.bytes_written;

        let progress = self.tracker.advance();
        tracing::debug!(
            "Received {} ({} bytes) [{}/{}]",
            pending.key,
            pending.bytes_written,
            progress.sofar,
            progress.total
        );
        Ok(())
    }

    pub fn stats(&self) -> &TransferStats {
        &self.stats
    }
}
