//! Backing file layout definitions
//!
//! File Layout:
//! ```text
//! +------------------+  offset 0
//! |   drive_count    |  u64
//! +------------------+  offset 8
//! |  Header slot 0   |  64 bytes: identity, max_lba, block_size,
//! |  Header slot 1   |            data_size, first_chunk_location
//! |       ...        |
//! |  Header slot N-1 |  N = MAX_DRIVES, unused slots zero-filled
//! +------------------+  HEADER_SIZE
//! |  Chunk records   |  appended at end of file, addressed by location
//! +------------------+
//! ```
//!
//! Chunk record:
//! ```text
//! +0   address            u64
//! +8   previous_location  u64 (0 = none)
//! +16  next_location      u64 (0 = none)
//! +24  data_size          u64
//! +32  chunk_size         u64
//! +40  repeat_count       u64
//! +48  content            data_size bytes
//! ```
//!
//! All integers are little-endian.

use bytes::{Buf, BufMut, BytesMut};
use simdrive_common::{DRIVE_IDENTITY_LEN, DriveIdentity, Error, MAX_DRIVES, Result};

/// Size of one header slot
pub const HEADER_SLOT_SIZE: u64 = DRIVE_IDENTITY_LEN as u64 + 4 * 8;

/// Size of the whole header region
pub const HEADER_SIZE: u64 = 8 + MAX_DRIVES as u64 * HEADER_SLOT_SIZE;

/// Offset of the content bytes within a chunk record
pub const CHUNK_CONTENT_OFFSET: u64 = 48;

/// One mebibyte, the unit of the capacity limit
pub const MIB: u64 = 1024 * 1024;

/// Encode an integer field
#[inline]
pub fn encode_u64(value: u64) -> [u8; 8] {
    let mut buf = [0u8; 8];
    (&mut buf[..]).put_u64_le(value);
    buf
}

/// Decode an integer field
#[inline]
pub fn decode_u64(data: &[u8]) -> Result<u64> {
    if data.len() < 8 {
        return Err(Error::corrupt(format!(
            "integer field truncated to {} bytes",
            data.len()
        )));
    }
    let mut buf = data;
    Ok(buf.get_u64_le())
}

/// Fixed-width fields of a chunk record
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChunkField {
    Address,
    Previous,
    Next,
    DataSize,
    ChunkSize,
    RepeatCount,
}

impl ChunkField {
    /// Offset of the field from the start of the record
    #[must_use]
    pub const fn offset(self) -> u64 {
        match self {
            Self::Address => 0,
            Self::Previous => 8,
            Self::Next => 16,
            Self::DataSize => 24,
            Self::ChunkSize => 32,
            Self::RepeatCount => 40,
        }
    }
}

/// Fixed part of a chunk record
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChunkRecord {
    pub address: u64,
    pub previous: u64,
    pub next: u64,
    pub data_size: u64,
    pub chunk_size: u64,
    pub repeat_count: u64,
}

impl ChunkRecord {
    /// Record size in bytes, excluding content
    pub const SIZE: usize = CHUNK_CONTENT_OFFSET as usize;

    /// Serialize to bytes
    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        let mut cursor = &mut buf[..];
        cursor.put_u64_le(self.address);
        cursor.put_u64_le(self.previous);
        cursor.put_u64_le(self.next);
        cursor.put_u64_le(self.data_size);
        cursor.put_u64_le(self.chunk_size);
        cursor.put_u64_le(self.repeat_count);
        buf
    }

    /// Parse from bytes
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            return Err(Error::corrupt("chunk record too small"));
        }
        let mut buf = data;
        let record = Self {
            address: buf.get_u64_le(),
            previous: buf.get_u64_le(),
            next: buf.get_u64_le(),
            data_size: buf.get_u64_le(),
            chunk_size: buf.get_u64_le(),
            repeat_count: buf.get_u64_le(),
        };

        if record.data_size == 0 || record.repeat_count == 0 {
            return Err(Error::corrupt(format!(
                "empty chunk record at address {}",
                record.address
            )));
        }
        if record.data_size.checked_mul(record.repeat_count) != Some(record.chunk_size) {
            return Err(Error::corrupt(format!(
                "chunk at address {} has size {} != {} x {}",
                record.address, record.chunk_size, record.data_size, record.repeat_count
            )));
        }
        Ok(record)
    }
}

/// One drive's record in the header
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HeaderSlot {
    pub identity: DriveIdentity,
    pub max_lba: u64,
    pub block_size: u64,
    pub data_size: u64,
    pub first_chunk_location: u64,
}

impl HeaderSlot {
    /// Serialize to bytes
    #[must_use]
    pub fn to_bytes(&self) -> [u8; HEADER_SLOT_SIZE as usize] {
        let mut buf = [0u8; HEADER_SLOT_SIZE as usize];
        let mut cursor = &mut buf[..];
        cursor.put_slice(self.identity.as_bytes());
        cursor.put_u64_le(self.max_lba);
        cursor.put_u64_le(self.block_size);
        cursor.put_u64_le(self.data_size);
        cursor.put_u64_le(self.first_chunk_location);
        buf
    }

    /// Parse from bytes
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_SLOT_SIZE as usize {
            return Err(Error::corrupt("header slot too small"));
        }
        let mut buf = data;
        let mut identity = [0u8; DRIVE_IDENTITY_LEN];
        buf.copy_to_slice(&mut identity);
        Ok(Self {
            identity: DriveIdentity::from_bytes(identity),
            max_lba: buf.get_u64_le(),
            block_size: buf.get_u64_le(),
            data_size: buf.get_u64_le(),
            first_chunk_location: buf.get_u64_le(),
        })
    }

    /// File offset of slot `index`
    #[must_use]
    pub const fn offset(index: usize) -> u64 {
        8 + index as u64 * HEADER_SLOT_SIZE
    }
}

/// Serialize the full header region
///
/// Slots past `slots.len()` are zero-filled so the region is always
/// [`HEADER_SIZE`] bytes long.
pub fn encode_header(slots: &[HeaderSlot]) -> Result<BytesMut> {
    if slots.len() > MAX_DRIVES {
        return Err(Error::TableFull(MAX_DRIVES));
    }
    let mut buf = BytesMut::with_capacity(HEADER_SIZE as usize);
    buf.put_u64_le(slots.len() as u64);
    for slot in slots {
        buf.put_slice(&slot.to_bytes());
    }
    buf.resize(HEADER_SIZE as usize, 0);
    Ok(buf)
}

/// Parse the header region into its live slots
pub fn decode_header(data: &[u8]) -> Result<Vec<HeaderSlot>> {
    if data.len() < HEADER_SIZE as usize {
        return Err(Error::corrupt(format!(
            "header is {} bytes, expected {HEADER_SIZE}",
            data.len()
        )));
    }
    let count = usize::try_from(decode_u64(data)?)
        .map_err(|_| Error::corrupt("drive count overflow"))?;
    if count > MAX_DRIVES {
        return Err(Error::corrupt(format!(
            "drive count {count} exceeds table size {MAX_DRIVES}"
        )));
    }

    (0..count)
        .map(|index| {
            let start = HeaderSlot::offset(index) as usize;
            HeaderSlot::from_bytes(&data[start..start + HEADER_SLOT_SIZE as usize])
        })
        .collect()
}
