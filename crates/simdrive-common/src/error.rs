//! Error types for SimDrive
//!
//! One error type is shared by every layer. Variants fall into four groups:
//! backend I/O, allocation, validation and configuration failures.

use thiserror::Error;

/// Common result type for SimDrive operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for SimDrive
#[derive(Debug, Error)]
pub enum Error {
    // Backend errors
    #[error("backend I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt drive file: {0}")]
    CorruptIndex(String),

    // Allocation errors
    #[error("allocation of {bytes} bytes failed")]
    Allocation { bytes: u64 },

    // Validation errors
    #[error("address {address} is outside drive of {capacity} bytes")]
    OutOfBounds { address: i128, capacity: u64 },

    #[error("drive not found: {0}")]
    DriveNotFound(String),

    #[error("drive already exists: {0}")]
    DriveExists(String),

    #[error("drive table is full ({0} drives)")]
    TableFull(usize),

    #[error("drive file would grow to {projected_mb} MB, limit is {limit_mb} MB")]
    CapacityExceeded { projected_mb: u64, limit_mb: u64 },

    #[error("invalid handle: {0}")]
    InvalidHandle(usize),

    #[error("handle pool is full ({0} handles)")]
    HandlePoolFull(usize),

    #[error("invalid drive identity: {0:?}")]
    InvalidIdentity(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    // Configuration errors
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl Error {
    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create a corrupt index error
    pub fn corrupt(msg: impl Into<String>) -> Self {
        Self::CorruptIndex(msg.into())
    }

    /// Check if this error came from the persistence backend
    #[must_use]
    pub const fn is_backend(&self) -> bool {
        matches!(self, Self::Io(_) | Self::CorruptIndex(_))
    }

    /// Check if this is a not found error
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::DriveNotFound(_) | Self::InvalidHandle(_))
    }
}
