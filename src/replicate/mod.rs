//! Symmetric blob replication over one duplex channel.
//!
//! Both agents run the same code. Each side advertises its inventory, computes
//! the same plan from the two inventories, then streams blobs in both
//! directions at once.
//!
//! # Architecture
//!
//! ```text
//!            +----------+   frames   +-------------+
//! local  --> |  Sender  | ---------> | wire writer | ==> peer
//! store      +----------+            +-------------+
//!            +----------+   frames   +-------------+
//! local  <-- | Receiver | <--------- | wire reader | <== peer
//! store      +----------+            +-------------+
//! ```
//!
//! # Protocol
//!
//! 1. Inventory exchange: both sides send HELLO (version, push/pull flags,
//!    advertised keys) without waiting for the other.
//! 2. Transfer: OFFER, CHUNK..., END per blob, DONE when the outbox is empty.
//!    FATAL aborts the session on either side.

pub mod channel;
pub mod inventory;
pub mod planner;
pub mod progress;
pub mod protocol;
pub mod receiver;
pub mod sender;
pub mod session;

pub use channel::{SyncReport, TransferStats, DATA_CHUNK_SIZE, QUEUE_DEPTH};
pub use inventory::{Capability, Inventory, KeyFilter, Mode};
pub use planner::TransferSet;
pub use progress::{Progress, ProgressFn, ProgressTracker};
pub use protocol::{read_frame, write_frame, CapabilityFlags, MessageType, PROTOCOL_VERSION};
pub use receiver::Receiver;
pub use sender::{Sender, SenderConfig};
pub use session::Session;
