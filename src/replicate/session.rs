//! One replication run for one local agent.
//!
//! The same `Session` runs on both ends of the channel. It exchanges HELLOs,
//! plans the transfer, then joins four pumps until both directions are done:
//!
//! ```text
//! Sender --> write_loop ==> peer          peer ==> read_loop --> Receiver
//! ```

use crate::config::SessionConfig;
use crate::error::{Phase, Result, SyncError};
use crate::replicate::channel::{
    frame_queue, inbound_queue, FrameReceiver, InboundFrame, InboundSender, PeerEnd, SyncReport,
};
use crate::replicate::inventory::{Capability, Inventory};
use crate::replicate::planner::TransferSet;
use crate::replicate::progress::{Progress, ProgressFn, ProgressTracker};
use crate::replicate::protocol::{
    read_frame, write_frame, Chunk, Done, End, Fatal, Hello, MessageType, Offer, PROTOCOL_VERSION,
};
use crate::replicate::receiver::Receiver;
use crate::replicate::sender::{OutboundBlob, Sender, SenderConfig};
use crate::store::BlobStore;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tracing::{debug, info, warn};

/// Upper bound on telling the peer why we are giving up
const ABORT_GRACE: Duration = Duration::from_secs(2);

pub struct Session {
    store: Arc<dyn BlobStore>,
    capability: Capability,
    config: SessionConfig,
    on_progress: Option<ProgressFn>,
}

impl Session {
    pub fn new(store: impl BlobStore + 'static, capability: Capability) -> Self {
        Self::with_store(Arc::new(store), capability)
    }

    pub fn with_store(store: Arc<dyn BlobStore>, capability: Capability) -> Self {
        Self {
            store,
            capability,
            config: SessionConfig::default(),
            on_progress: None,
        }
    }

    pub fn with_config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Register a listener called with `(sofar, total)` after every blob.
    pub fn on_progress<F>(mut self, f: F) -> Self
    where
        F: Fn(Progress) + Send + Sync + 'static,
    {
        self.on_progress = Some(Arc::new(f));
        self
    }

    /// Run over a single bidirectional stream.
    pub async fn run_stream<S>(self, stream: S) -> Result<SyncReport>
    where
        S: AsyncRead + AsyncWrite,
    {
        let (reader, writer) = tokio::io::split(stream);
        self.run(reader, writer).await
    }

    /// Run over separate read and write halves of the channel. The write half
    /// is shut down when the session ends, successfully or not.
    pub async fn run<R, W>(self, reader: R, writer: W) -> Result<SyncReport>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        self.config.validate()?;

        let mut reader = BufReader::new(reader);
        let mut writer = BufWriter::new(writer);
        let mut mid_frame = false;

        match self.replicate(&mut reader, &mut writer, &mut mid_frame).await {
            Ok(report) => {
                // Everything was flushed already; the peer may have hung up first.
                if let Err(e) = writer.shutdown().await {
                    debug!("Shutdown after completion failed: {}", e);
                }
                info!(
                    "Replication complete: sent {} blobs ({} bytes), received {} blobs ({} bytes)",
                    report.sent.blobs,
                    report.sent.bytes,
                    report.received.blobs,
                    report.received.bytes
                );
                Ok(report)
            }
            Err(err) => {
                warn!("Replication failed during {:?}: {}", err.phase(), err);
                abort(&mut writer, &err, mid_frame).await;
                Err(err)
            }
        }
    }

    async fn replicate<R, W>(
        &self,
        reader: &mut R,
        writer: &mut W,
        mid_frame: &mut bool,
    ) -> Result<SyncReport>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        // 1. Inventory exchange
        let local = Inventory::build(self.store.as_ref(), &self.capability.filter).await?;
        let hello = Hello::new(self.capability.flags(), local.to_keys());
        let peer_hello = with_timeout(
            self.config.handshake_timeout(),
            Phase::Handshake,
            handshake(reader, writer, &hello),
        )
        .await?;
        let peer = Inventory::from_keys(peer_hello.keys);

        // 2. Plan
        let plan = TransferSet::plan(&local, &self.capability, &peer, peer_hello.flags);
        info!(
            "Plan: send {} and receive {} blobs (local {} keys, peer {} keys)",
            plan.outbox.len(),
            plan.inbox.len(),
            local.len(),
            peer.len()
        );

        let mut report = SyncReport {
            total: plan.total(),
            local_keys: local.len(),
            peer_keys: peer.len(),
            ..Default::default()
        };
        if plan.is_empty() {
            return Ok(report);
        }

        // 3. Transfer
        let expected = plan.inbox.len() as u64;
        let tracker = Arc::new(ProgressTracker::new(plan.total(), self.on_progress.clone()));
        let outbox: Vec<OutboundBlob> = plan
            .outbox
            .iter()
            .map(|key| OutboundBlob {
                key: key.clone(),
                size: local.size_of(key).unwrap_or_default(),
            })
            .collect();

        let sender = Sender::new(
            SenderConfig {
                chunk_size: self.config.chunk_size,
            },
            self.store.clone(),
            tracker.clone(),
        );
        let receiver = Receiver::new(self.store.clone(), tracker, plan.inbox);
        let (frame_tx, frame_rx) = frame_queue(self.config.queue_depth);
        let (inbound_tx, inbound_rx) = inbound_queue(self.config.queue_depth);

        let (sent, (), peer_end, received) = tokio::try_join!(
            sender.run(outbox, frame_tx),
            write_loop(writer, frame_rx, mid_frame),
            read_loop(reader, inbound_tx, self.config.idle_timeout()),
            receiver.run(inbound_rx),
        )?;

        // 4. Completion
        match peer_end {
            PeerEnd::Done { blobs, .. } if blobs != received.blobs => {
                return Err(SyncError::Protocol(format!(
                    "peer reported {} blobs sent but {} were received",
                    blobs, received.blobs
                )));
            }
            PeerEnd::Closed if received.blobs != expected => {
                return Err(SyncError::ChannelClosed);
            }
            _ => {}
        }
        if received.blobs != expected {
            return Err(SyncError::Protocol(format!(
                "peer finished after {} of {} planned blobs",
                received.blobs, expected
            )));
        }
        if peer_end == PeerEnd::Closed {
            debug!("Peer closed without DONE after all blobs arrived");
        }

        report.sent = sent;
        report.received = received;
        Ok(report)
    }
}

/// Send our HELLO while waiting for the peer's, so neither side can block
/// the other on a full channel.
async fn handshake<R, W>(reader: &mut R, writer: &mut W, hello: &Hello) -> Result<Hello>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let send = async {
        write_frame(writer, &hello.encode()).await?;
        writer.flush().await?;
        debug!("Sent HELLO with {} keys", hello.keys.len());
        Ok::<_, SyncError>(())
    };

    let recv = async {
        match read_frame(reader).await? {
            Some((MessageType::Hello, payload)) => Hello::decode(payload),
            Some((MessageType::Fatal, payload)) => {
                let fatal = Fatal::decode(payload)?;
                Err(SyncError::Remote {
                    code: fatal.code,
                    message: fatal.message,
                })
            }
            Some((other, _)) => Err(SyncError::HandshakeIncomplete(format!(
                "expected HELLO, got {:?}",
                other
            ))),
            None => Err(SyncError::HandshakeIncomplete(
                "channel closed before the peer's inventory arrived".into(),
            )),
        }
    };

    let ((), peer) = tokio::try_join!(send, recv).map_err(|e| match e {
        SyncError::Remote { .. } | SyncError::HandshakeIncomplete(_) => e,
        other => SyncError::HandshakeIncomplete(other.to_string()),
    })?;

    if peer.version != PROTOCOL_VERSION {
        return Err(SyncError::HandshakeIncomplete(format!(
            "peer speaks protocol version {}, expected {}",
            peer.version, PROTOCOL_VERSION
        )));
    }
    debug!(
        "Received HELLO with {} keys (push: {}, pull: {})",
        peer.keys.len(),
        peer.flags.push(),
        peer.flags.pull()
    );
    Ok(peer)
}

/// Drain queued frames into the channel. Flushes whenever the queue runs dry
/// so a frame never sits in the buffer while the sender is busy.
async fn write_loop<W>(writer: &mut W, mut rx: FrameReceiver, mid_frame: &mut bool) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = rx.recv().await {
        *mid_frame = true;
        write_frame(writer, &frame).await?;
        *mid_frame = false;

        while let Ok(frame) = rx.try_recv() {
            *mid_frame = true;
            write_frame(writer, &frame).await?;
            *mid_frame = false;
        }
        writer.flush().await?;
    }
    writer.flush().await?;
    Ok(())
}

/// Decode the peer's frames and hand blob frames to the Receiver. Returns once
/// the peer sends DONE or closes its direction.
async fn read_loop<R>(
    reader: &mut R,
    tx: InboundSender,
    idle_timeout: Option<Duration>,
) -> Result<PeerEnd>
where
    R: AsyncRead + Unpin,
{
    loop {
        let frame = with_timeout(idle_timeout, Phase::Transfer, read_frame(reader)).await?;
        let Some((msg_type, payload)) = frame else {
            return Ok(PeerEnd::Closed);
        };

        let inbound = match msg_type {
            MessageType::Offer => {
                let offer = Offer::decode(payload)?;
                InboundFrame::Offer {
                    key: offer.key,
                    size: offer.size,
                }
            }
            MessageType::Chunk => InboundFrame::Chunk(Chunk::decode(payload)?.data),
            MessageType::End => {
                End::decode(payload)?;
                InboundFrame::End
            }
            MessageType::Done => {
                let done = Done::decode(payload)?;
                debug!("Peer DONE: {} blobs, {} bytes", done.blobs, done.bytes);
                return Ok(PeerEnd::Done {
                    blobs: done.blobs,
                    bytes: done.bytes,
                });
            }
            MessageType::Fatal => {
                let fatal = Fatal::decode(payload)?;
                return Err(SyncError::Remote {
                    code: fatal.code,
                    message: fatal.message,
                });
            }
            MessageType::Hello => {
                return Err(SyncError::Protocol("unexpected HELLO after handshake".into()));
            }
        };

        tx.send(inbound)
            .await
            .map_err(|_| SyncError::ChannelClosed)?;
    }
}

async fn with_timeout<T, F>(limit: Option<Duration>, phase: Phase, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| SyncError::Timeout(phase))?,
        None => fut.await,
    }
}

/// Best effort: tell the peer why we stopped, then close our direction.
async fn abort<W>(writer: &mut W, err: &SyncError, mid_frame: bool)
where
    W: AsyncWrite + Unpin,
{
    let notify = !mid_frame
        && !matches!(
            err,
            SyncError::Remote { .. } | SyncError::ChannelClosed | SyncError::Io(_)
        );

    let close = async {
        if notify {
            let _ = write_frame(writer, &Fatal::from_error(err).encode()).await;
        }
        let _ = writer.shutdown().await;
    };
    if tokio::time::timeout(ABORT_GRACE, close).await.is_err() {
        debug!("Peer did not accept the abort notice in time");
    }
}
