//! blobsync: replicate two blob stores over a single byte stream.
//!
//! ```no_run
//! use blobsync::{Capability, FsBlobStore, Session};
//!
//! # async fn demo() -> blobsync::Result<()> {
//! let stream = tokio::net::TcpStream::connect("10.0.0.2:7878").await?;
//! let report = Session::new(FsBlobStore::new("/srv/blobs"), Capability::default())
//!     .on_progress(|p| println!("{}/{}", p.sofar, p.total))
//!     .run_stream(stream)
//!     .await?;
//! println!("transferred {} blobs", report.transferred());
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod replicate;
pub mod store;
pub mod transport;

pub use config::{ConfigFile, SessionConfig};
pub use error::{Phase, Result, SyncError};
pub use replicate::{Capability, KeyFilter, Mode, Progress, Session, SyncReport};
pub use store::{BlobMeta, BlobSink, BlobStore, FsBlobStore, MemoryBlobStore};
