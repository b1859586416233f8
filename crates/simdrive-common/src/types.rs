//! Core type definitions for SimDrive
//!
//! This module defines the identifiers and small enums shared between the
//! store, its persistence backends and the admin tooling.

use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Size of a drive identity key in bytes
pub const DRIVE_IDENTITY_LEN: usize = 32;

/// Maximum number of drives in the directory table
pub const MAX_DRIVES: usize = 256;

/// Average number of concurrent opens per drive (sizes the handle pool)
pub const AVERAGE_OPEN: usize = 4;

/// Fixed-size opaque key naming one simulated drive
///
/// Built from a string that is zero-padded to [`DRIVE_IDENTITY_LEN`] bytes.
/// Two identities are equal when all bytes are equal.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct DriveIdentity([u8; DRIVE_IDENTITY_LEN]);

impl DriveIdentity {
    /// Create an identity from a name (must fit in [`DRIVE_IDENTITY_LEN`] bytes)
    pub fn new(name: &str) -> crate::Result<Self> {
        let bytes = name.as_bytes();
        if bytes.is_empty() || bytes.len() > DRIVE_IDENTITY_LEN {
            return Err(crate::Error::InvalidIdentity(name.to_string()));
        }
        let mut key = [0u8; DRIVE_IDENTITY_LEN];
        key[..bytes.len()].copy_from_slice(bytes);
        Ok(Self(key))
    }

    /// Create from raw key bytes
    #[must_use]
    pub const fn from_bytes(bytes: [u8; DRIVE_IDENTITY_LEN]) -> Self {
        Self(bytes)
    }

    /// Get as bytes
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; DRIVE_IDENTITY_LEN] {
        &self.0
    }

    /// True for the all-zero key held by unused directory slots
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    /// The identity as text, with trailing padding removed
    #[must_use]
    pub fn name(&self) -> String {
        let end = self
            .0
            .iter()
            .position(|b| *b == 0)
            .unwrap_or(DRIVE_IDENTITY_LEN);
        String::from_utf8_lossy(&self.0[..end]).into_owned()
    }
}

impl fmt::Debug for DriveIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DriveIdentity({})", self.name())
    }
}

impl fmt::Display for DriveIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Index of a slot in the handle pool
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display, From, Into)]
#[display("handle#{_0}")]
pub struct HandleId(usize);

impl HandleId {
    /// Slot index within the pool
    #[must_use]
    pub const fn index(self) -> usize {
        self.0
    }
}

/// Where chunk contents live
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendType {
    /// Contents are owned in memory only
    #[default]
    Memory,
    /// Contents and metadata are mirrored to a single backing file
    File,
}

/// Lifetime of the backing file
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperatingMode {
    /// Reuse the backing file across runs
    #[default]
    Permanent,
    /// Start from an empty backing file and remove it when the store is dropped
    Temporary,
}

/// Origin for a seek offset
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SeekWhence {
    /// From address 0
    Begin,
    /// From the cursor's current address
    Current,
    /// From the byte just past the last written chunk
    End,
}

impl TryFrom<u32> for SeekWhence {
    type Error = crate::Error;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Begin),
            1 => Ok(Self::Current),
            2 => Ok(Self::End),
            _ => Err(crate::Error::invalid_argument(format!(
                "invalid seek whence: {value}"
            ))),
        }
    }
}
