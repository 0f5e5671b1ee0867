//! # dog-blobio: File-like handles over remote block blobs
//!
//! `dog-blobio` exposes one remote blob as a byte stream with the familiar
//! `read`/`readline`/`seek`/`write`/`close` surface, so serialization code can
//! stream large payloads to or from object storage without holding them in
//! memory or on local disk.
//!
//! ## Key Features
//!
//! - **Bounded transfers**: Arbitrary-sized calls become ranged downloads and buffered stage uploads
//! - **Concurrent uploads**: Full write buffers are staged in the background while writing continues
//! - **Ordered, atomic commit**: Blocks are committed once, in write order, when the handle closes
//! - **Sticky failures**: The first failed upload poisons the handle; nothing partial is ever committed
//! - **Pluggable transport**: S3 multipart uploads out of the box, in-memory service for tests
//!
//! ## Quick Start
//!
//! ```rust
//! use dog_blobio::prelude::*;
//!
//! # fn main() -> BlobIoResult<()> {
//! let service = MemoryBlobService::new();
//!
//! // 1. Write a blob; nothing is visible until close commits it
//! let mut writer = BlobIo::open_with("mem://models/weights.bin", "wb", &service, OpenOptions::new())?;
//! writer.write(b"header\n")?;
//! writer.write(b"payload")?;
//! writer.close()?;
//!
//! // 2. Read it back line by line
//! let mut reader = BlobIo::open_with("mem://models/weights.bin", "rb", &service, OpenOptions::new())?;
//! assert_eq!(&reader.readline(None)?[..], b"header\n");
//! assert_eq!(&reader.read(None)?[..], b"payload");
//! # Ok(())
//! # }
//! ```
//!
//! Against S3, [`BlobIo::open`] builds the client from the environment
//! (`DOG_BLOBIO_REGION`, `DOG_BLOBIO_ENDPOINT_URL`,
//! `DOG_BLOBIO_FORCE_PATH_STYLE`) and the default AWS credential chain.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────┐
//! │   BlobIo            │  ← Mode guard, position, buffers, fatal latch, commit
//! ├─────────────────────┤
//! │   BlockBlobClient   │  ← size / download / stage / commit
//! ├─────────────────────┤
//! │   S3 or memory      │  ← Transport and upload workers
//! └─────────────────────┘
//! ```
//!
//! Handles are synchronous. Clients own whatever runtime they need and hand
//! back [`StageTask`]s the handle can poll without blocking.

mod buffer;
mod client;
mod commit;
mod config;
mod credential;
mod error;
mod io;
mod memory_client;
mod s3_client;
mod stage;
mod types;

// Re-export main types for clean API
pub use client::{BlockBlobClient, BlockBlobClientFactory};
pub use config::{BlobIoConfig, TransferConfig};
pub use credential::{Credential, ResolvedCredential};
pub use error::{BlobIoError, BlobIoResult, TransferError, TransferResult};
pub use io::{BlobIo, Lines, OpenOptions};
pub use memory_client::{MemoryBlobClient, MemoryBlobService};
pub use s3_client::{S3BlockBlobClient, S3ClientConfig, S3ClientFactory};
pub use stage::{StageCompleter, StageTask, StageTasks};
pub use types::{BlobAddress, BlockId, OpenMode, Whence};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::{
        BlobIo, BlobIoConfig, BlobIoError, BlobIoResult, Credential, MemoryBlobService, OpenMode,
        OpenOptions, Whence,
    };
}
