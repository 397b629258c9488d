//! Queue types connecting the session's pump tasks.
//!
//! ```text
//! Sender --[FrameQueue]--> wire writer ==channel==> wire reader --[InboundQueue]--> Receiver
//! ```
//!
//! Both queues are bounded; a full queue suspends its producer, which is how
//! a slow channel or a slow store pushes back on the other end.

use bytes::Bytes;
use serde::Serialize;
use tokio::sync::mpsc;

/// Default CHUNK payload size
pub const DATA_CHUNK_SIZE: usize = 64 * 1024; // 64KB

/// Default capacity of each pump queue, in frames
pub const QUEUE_DEPTH: usize = 16;

// =============================================================================
// Outbound
// =============================================================================

/// Encoded frames waiting for the wire writer
pub type FrameSender = mpsc::Sender<Bytes>;
pub type FrameReceiver = mpsc::Receiver<Bytes>;

pub fn frame_queue(depth: usize) -> (FrameSender, FrameReceiver) {
    mpsc::channel(depth.max(1))
}

// =============================================================================
// Inbound
// =============================================================================

/// Blob frames forwarded from the wire reader to the Receiver
#[derive(Debug)]
pub enum InboundFrame {
    Offer { key: String, size: u64 },
    Chunk(Bytes),
    End,
}

pub type InboundSender = mpsc::Sender<InboundFrame>;
pub type InboundReceiver = mpsc::Receiver<InboundFrame>;

pub fn inbound_queue(depth: usize) -> (InboundSender, InboundReceiver) {
    mpsc::channel(depth.max(1))
}

/// How the peer's direction of the channel ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerEnd {
    /// DONE received with the peer's own send counts
    Done { blobs: u64, bytes: u64 },
    /// End of stream without DONE
    Closed,
}

// =============================================================================
// Statistics
// =============================================================================

/// Per-direction counters for one session.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TransferStats {
    pub blobs: u64,
    pub bytes: u64,
}

/// Outcome of a successful session.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    /// Blobs this side planned to send plus blobs it planned to receive
    pub total: u64,
    pub sent: TransferStats,
    pub received: TransferStats,
    /// Keys advertised by this side after filtering
    pub local_keys: usize,
    /// Keys advertised by the peer
    pub peer_keys: usize,
}

impl SyncReport {
    pub fn transferred(&self) -> u64 {
        self.sent.blobs + self.received.blobs
    }
}
