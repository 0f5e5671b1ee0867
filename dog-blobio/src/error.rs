use std::sync::Arc;

use thiserror::Error;

use crate::BlockId;

/// Result type for handle operations
pub type BlobIoResult<T> = Result<T, BlobIoError>;

/// Result type for transfer client operations
pub type TransferResult<T> = Result<T, TransferError>;

/// Errors surfaced to callers of a [`crate::BlobIo`] handle
#[derive(Error, Debug)]
pub enum BlobIoError {
    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String },

    #[error("Unsupported operation: {operation}")]
    Unsupported { operation: &'static str },

    #[error("I/O operation on closed blob")]
    Closed,

    /// The first stage or commit failure seen by a write handle. Once set it
    /// is returned by every later write, flush and close.
    #[error("Fatal blob write error: {source}")]
    FatalWrite {
        #[source]
        source: Arc<TransferError>,
    },

    #[error("Unexpected duplicate block id {block_id}; not committing blob")]
    DuplicateBlockId { block_id: BlockId },

    #[error("Transfer error: {source}")]
    Transfer {
        #[from]
        source: TransferError,
    },
}

impl BlobIoError {
    /// Create an invalid argument error
    pub fn invalid<S: Into<String>>(message: S) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Create an unsupported operation error
    pub fn unsupported(operation: &'static str) -> Self {
        Self::Unsupported { operation }
    }

    pub(crate) fn fatal_write(source: Arc<TransferError>) -> Self {
        Self::FatalWrite { source }
    }

    /// True for the sticky write failure
    pub fn is_fatal_write(&self) -> bool {
        matches!(self, Self::FatalWrite { .. })
    }
}

impl From<BlobIoError> for std::io::Error {
    fn from(error: BlobIoError) -> Self {
        let kind = match &error {
            BlobIoError::InvalidArgument { .. } => std::io::ErrorKind::InvalidInput,
            BlobIoError::Unsupported { .. } => std::io::ErrorKind::Unsupported,
            BlobIoError::Transfer {
                source: TransferError::NotFound { .. },
            } => std::io::ErrorKind::NotFound,
            _ => std::io::ErrorKind::Other,
        };
        std::io::Error::new(kind, error)
    }
}

/// Errors reported by a block blob transfer client
#[derive(Error, Debug)]
pub enum TransferError {
    #[error("Blob not found: {address}")]
    NotFound { address: String },

    #[error("Invalid blob address: {message}")]
    InvalidAddress { message: String },

    #[error("Stage payload must not be empty")]
    EmptyStage,

    #[error("Unknown block id: {block_id}")]
    UnknownBlock { block_id: BlockId },

    #[error("Stage operation ended without reporting a result")]
    Abandoned,

    #[error("Storage backend error: {source}")]
    Backend {
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl TransferError {
    /// Create a backend error from any error type
    pub fn backend<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Backend {
            source: Box::new(error),
        }
    }

    /// Create a backend error from a plain message
    pub fn backend_message<S: Into<String>>(message: S) -> Self {
        let message: String = message.into();
        Self::Backend {
            source: message.into(),
        }
    }

    /// Create an invalid address error
    pub fn invalid_address<S: Into<String>>(message: S) -> Self {
        Self::InvalidAddress {
            message: message.into(),
        }
    }

    /// Create a not found error
    pub fn not_found<S: Into<String>>(address: S) -> Self {
        Self::NotFound {
            address: address.into(),
        }
    }
}
