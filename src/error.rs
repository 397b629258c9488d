//! Error types for replication sessions.

use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, SyncError>;

/// Phase of a session in which a failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Handshake,
    Transfer,
}

#[derive(Debug, Error)]
pub enum SyncError {
    /// The channel closed, timed out or carried garbage before both
    /// inventories were exchanged.
    #[error("handshake incomplete: {0}")]
    HandshakeIncomplete(String),

    #[error("failed to list blob store: {0}")]
    StoreList(#[source] io::Error),

    #[error("failed to read blob '{key}': {source}")]
    StoreRead {
        key: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to write blob '{key}': {source}")]
    StoreWrite {
        key: String,
        #[source]
        source: io::Error,
    },

    /// Malformed or truncated frame on the wire.
    #[error("malformed frame: {0}")]
    FrameDecode(String),

    /// Well-formed frames that arrived out of order or contradict the plan.
    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("channel closed unexpectedly")]
    ChannelClosed,

    #[error("peer failed (code {code}): {message}")]
    Remote { code: u16, message: String },

    #[error("timed out during {0:?}")]
    Timeout(Phase),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

impl SyncError {
    pub fn store_read(key: impl Into<String>, source: io::Error) -> Self {
        Self::StoreRead {
            key: key.into(),
            source,
        }
    }

    pub fn store_write(key: impl Into<String>, source: io::Error) -> Self {
        Self::StoreWrite {
            key: key.into(),
            source,
        }
    }

    /// Which phase of the session produced this error.
    pub fn phase(&self) -> Phase {
        match self {
            SyncError::HandshakeIncomplete(_) | SyncError::StoreList(_) => Phase::Handshake,
            SyncError::Timeout(phase) => *phase,
            _ => Phase::Transfer,
        }
    }

    /// Key of the blob involved, if the failure is tied to one.
    pub fn key(&self) -> Option<&str> {
        match self {
            SyncError::StoreRead { key, .. } | SyncError::StoreWrite { key, .. } => Some(key),
            _ => None,
        }
    }

    /// Wire code sent to the peer in a FATAL frame.
    pub fn code(&self) -> u16 {
        match self {
            SyncError::HandshakeIncomplete(_) => 1,
            SyncError::StoreList(_) => 2,
            SyncError::StoreRead { .. } => 3,
            SyncError::StoreWrite { .. } => 4,
            SyncError::FrameDecode(_) => 5,
            SyncError::Protocol(_) => 6,
            SyncError::ChannelClosed => 7,
            SyncError::Remote { .. } => 8,
            SyncError::Timeout(_) => 9,
            SyncError::Io(_) => 10,
            SyncError::Config(_) => 11,
        }
    }
}
