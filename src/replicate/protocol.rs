//! Wire messages for blob replication.
//!
//! Both directions of the channel carry the same self-delimiting frame stream.
//! A session opens with one HELLO per side (capabilities plus the filtered
//! inventory), then each side streams OFFER / CHUNK* / END per blob and
//! closes its direction with DONE.

use crate::error::{Result, SyncError};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Protocol revision carried in HELLO
pub const PROTOCOL_VERSION: u16 = 1;

/// Wire format: all multi-byte integers are big-endian
/// Strings are length-prefixed (u16 len + UTF-8)
/// Frame format: len:u32 | type:u8 | payload
pub const FRAME_HEADER_LEN: usize = 5;

/// Maximum frame size (64MB) for everything except HELLO
pub const MAX_FRAME_SIZE: u32 = 64 * 1024 * 1024;

/// Payload bytes reserved up front when reading a frame
const PREALLOC_LIMIT: usize = 64 * 1024;

/// Longest key the wire can carry
pub const MAX_KEY_LEN: usize = u16::MAX as usize;

// =============================================================================
// Message Types
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Hello = 0x01,
    Offer = 0x02,
    Chunk = 0x03,
    End = 0x04,
    Done = 0x05,
    Fatal = 0x06,
}

impl MessageType {
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(Self::Hello),
            0x02 => Some(Self::Offer),
            0x03 => Some(Self::Chunk),
            0x04 => Some(Self::End),
            0x05 => Some(Self::Done),
            0x06 => Some(Self::Fatal),
            _ => None,
        }
    }
}

// =============================================================================
// Capability Flags
// =============================================================================

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CapabilityFlags: u32 {
        const PUSH = 1 << 0;
        const PULL = 1 << 1;
    }
}

impl CapabilityFlags {
    pub fn push(&self) -> bool {
        self.contains(Self::PUSH)
    }

    pub fn pull(&self) -> bool {
        self.contains(Self::PULL)
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn header(buf: &mut BytesMut, msg_type: MessageType, payload_len: usize) {
    buf.put_u32(payload_len as u32);
    buf.put_u8(msg_type as u8);
}

fn put_string(buf: &mut BytesMut, s: &str) {
    buf.put_u16(s.len() as u16);
    buf.put_slice(s.as_bytes());
}

fn expect_consumed(payload: &Bytes, what: &str) -> Result<()> {
    if payload.has_remaining() {
        return Err(SyncError::FrameDecode(format!(
            "{} has {} trailing bytes",
            what,
            payload.remaining()
        )));
    }
    Ok(())
}

fn get_string(payload: &mut Bytes, what: &str) -> Result<String> {
    if payload.remaining() < 2 {
        return Err(SyncError::FrameDecode(format!("{} length truncated", what)));
    }
    let len = payload.get_u16() as usize;
    if payload.remaining() < len {
        return Err(SyncError::FrameDecode(format!(
            "{} truncated: expected {} bytes, got {}",
            what,
            len,
            payload.remaining()
        )));
    }
    String::from_utf8(payload.copy_to_bytes(len).to_vec())
        .map_err(|_| SyncError::FrameDecode(format!("invalid UTF-8 in {}", what)))
}

// =============================================================================
// HELLO (0x01)
// =============================================================================

/// Handshake: capability flags plus the sender's filtered inventory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hello {
    pub version: u16,
    pub flags: CapabilityFlags,
    pub keys: Vec<String>,
}

impl Hello {
    pub fn new(flags: CapabilityFlags, keys: Vec<String>) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            flags,
            keys,
        }
    }

    pub fn encode(&self) -> Bytes {
        let keys_len: usize = self.keys.iter().map(|k| 2 + k.len()).sum();
        let payload_len = 2 + 4 + 4 + keys_len;
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + payload_len);

        header(&mut buf, MessageType::Hello, payload_len);
        buf.put_u16(self.version);
        buf.put_u32(self.flags.bits());
        buf.put_u32(self.keys.len() as u32);
        for key in &self.keys {
            put_string(&mut buf, key);
        }

        buf.freeze()
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        if payload.remaining() < 10 {
            return Err(SyncError::FrameDecode("Hello payload too short".into()));
        }
        let version = payload.get_u16();
        let flags = CapabilityFlags::from_bits_truncate(payload.get_u32());
        let count = payload.get_u32() as usize;

        // Every key costs at least its length prefix; bound the allocation by
        // what the payload can actually hold.
        let mut keys = Vec::with_capacity(count.min(payload.remaining() / 2));
        for _ in 0..count {
            keys.push(get_string(&mut payload, "Hello key")?);
        }
        expect_consumed(&payload, "Hello")?;

        Ok(Self {
            version,
            flags,
            keys,
        })
    }
}

// =============================================================================
// OFFER (0x02)
// =============================================================================

/// Announces the blob whose chunks follow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Offer {
    pub key: String,
    pub size: u64,
}

impl Offer {
    pub fn encode(&self) -> Bytes {
        let payload_len = 2 + self.key.len() + 8;
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + payload_len);
        header(&mut buf, MessageType::Offer, payload_len);
        put_string(&mut buf, &self.key);
        buf.put_u64(self.size);
        buf.freeze()
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        let key = get_string(&mut payload, "Offer key")?;
        if payload.remaining() < 8 {
            return Err(SyncError::FrameDecode("Offer size truncated".into()));
        }
        let size = payload.get_u64();
        expect_consumed(&payload, "Offer")?;
        Ok(Self { key, size })
    }
}

// =============================================================================
// CHUNK (0x03)
// =============================================================================

/// One fragment of the blob currently being streamed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub data: Bytes,
}

impl Chunk {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + self.data.len());
        header(&mut buf, MessageType::Chunk, self.data.len());
        buf.put_slice(&self.data);
        buf.freeze()
    }

    pub fn decode(payload: Bytes) -> Result<Self> {
        Ok(Self { data: payload })
    }
}

// =============================================================================
// END (0x04)
// =============================================================================

/// Closes the blob currently being streamed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct End;

impl End {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN);
        header(&mut buf, MessageType::End, 0);
        buf.freeze()
    }

    pub fn decode(payload: Bytes) -> Result<Self> {
        expect_consumed(&payload, "End")?;
        Ok(Self)
    }
}

// =============================================================================
// DONE (0x05)
// =============================================================================

/// Sent once a side has streamed its whole outbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Done {
    pub blobs: u64,
    pub bytes: u64,
}

impl Done {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + 16);
        header(&mut buf, MessageType::Done, 16);
        buf.put_u64(self.blobs);
        buf.put_u64(self.bytes);
        buf.freeze()
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        if payload.remaining() < 16 {
            return Err(SyncError::FrameDecode("Done payload too short".into()));
        }
        let done = Self {
            blobs: payload.get_u64(),
            bytes: payload.get_u64(),
        };
        expect_consumed(&payload, "Done")?;
        Ok(done)
    }
}

// =============================================================================
// FATAL (0x06)
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fatal {
    pub code: u16,
    pub message: String,
}

impl Fatal {
    pub fn from_error(err: &SyncError) -> Self {
        let mut message = err.to_string();
        if message.len() > MAX_KEY_LEN {
            let mut cut = MAX_KEY_LEN;
            while !message.is_char_boundary(cut) {
                cut -= 1;
            }
            message.truncate(cut);
        }
        Self {
            code: err.code(),
            message,
        }
    }

    pub fn encode(&self) -> Bytes {
        let payload_len = 2 + 2 + self.message.len();
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + payload_len);
        header(&mut buf, MessageType::Fatal, payload_len);
        buf.put_u16(self.code);
        put_string(&mut buf, &self.message);
        buf.freeze()
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        if payload.remaining() < 2 {
            return Err(SyncError::FrameDecode("Fatal payload too short".into()));
        }
        let code = payload.get_u16();
        let message = get_string(&mut payload, "Fatal message")?;
        expect_consumed(&payload, "Fatal")?;
        Ok(Self { code, message })
    }
}

// =============================================================================
// Frame reading/writing
// =============================================================================

/// Read a single frame from the stream.
///
/// Returns `Ok(None)` on a clean end of stream at a frame boundary; an end of
/// stream inside a frame is a decode failure.
pub async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> Result<Option<(MessageType, Bytes)>> {
    let mut len_buf = [0u8; 4];
    let mut filled = 0;
    while filled < len_buf.len() {
        let n = r.read(&mut len_buf[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(SyncError::FrameDecode("truncated frame length".into()));
        }
        filled += n;
    }
    let len = u32::from_be_bytes(len_buf);

    let msg_type = r.read_u8().await.map_err(truncated("message type"))?;
    let msg_type = MessageType::from_u8(msg_type)
        .ok_or_else(|| SyncError::FrameDecode(format!("unknown message type 0x{:02x}", msg_type)))?;

    // Validate frame size before allocation
    if msg_type != MessageType::Hello && len > MAX_FRAME_SIZE {
        return Err(SyncError::FrameDecode(format!(
            "Frame size {} exceeds maximum allowed size {}",
            len, MAX_FRAME_SIZE
        )));
    }

    // Grow with the data actually received; the header alone is not trusted.
    let mut payload = Vec::with_capacity((len as usize).min(PREALLOC_LIMIT));
    (&mut *r).take(len as u64).read_to_end(&mut payload).await?;
    if payload.len() != len as usize {
        return Err(SyncError::FrameDecode(format!(
            "truncated frame payload: expected {} bytes, got {}",
            len,
            payload.len()
        )));
    }

    Ok(Some((msg_type, Bytes::from(payload))))
}

fn truncated(what: &'static str) -> impl Fn(io::Error) -> SyncError {
    move |e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            SyncError::FrameDecode(format!("truncated {}", what))
        } else {
            SyncError::Io(e)
        }
    }
}

/// Write a pre-encoded frame to the stream.
pub async fn write_frame<W: AsyncWrite + Unpin>(w: &mut W, frame: &Bytes) -> Result<()> {
    w.write_all(frame).await?;
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
