//! Byte channels a session can run over.
//!
//! A replication session only needs one readable and one writable half. This
//! module opens those halves over TCP, over the process's own stdin/stdout, or
//! over the stdin/stdout of a child process (e.g. `ssh host blobsync DIR stdio`).

pub mod process;
pub mod tcp;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::Child;

pub type BoxReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Read and write halves of a connection to the peer.
pub struct Duplex {
    reader: BoxReader,
    writer: BoxWriter,
    /// Process carrying the channel, if any
    child: Option<Child>,
    peer: String,
}

impl Duplex {
    pub fn new<R, W>(reader: R, writer: W, peer: impl Into<String>) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
            child: None,
            peer: peer.into(),
        }
    }

    /// Talk to whoever is on the other end of our stdin/stdout.
    pub fn stdio() -> Self {
        Self::new(tokio::io::stdin(), tokio::io::stdout(), "stdio")
    }

    pub(crate) fn with_child(mut self, child: Child) -> Self {
        self.child = Some(child);
        self
    }

    /// Human-readable description of the other end
    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn into_parts(self) -> (BoxReader, BoxWriter, Option<Child>) {
        (self.reader, self.writer, self.child)
    }

    pub fn split(self) -> (BoxReader, BoxWriter) {
        (self.reader, self.writer)
    }
}

impl std::fmt::Debug for Duplex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Duplex")
            .field("peer", &self.peer)
            .field("child", &self.child.as_ref().and_then(|c| c.id()))
            .finish()
    }
}
