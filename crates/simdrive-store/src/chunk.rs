//! Chunks, the atomic storage unit of a drive
//!
//! A chunk maps the byte range `[drive_address, drive_address + chunk_size)`
//! onto one pattern unit of `data_size` bytes repeated `repeat_count` times.

use simdrive_common::{Error, Result};
use std::fmt;

/// Generational index of a chunk within one drive's arena
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ChunkId {
    pub(crate) index: usize,
    pub(crate) generation: u32,
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "chunk#{}.{}", self.index, self.generation)
    }
}

/// Where a chunk's pattern unit lives
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Content {
    /// Owned by the chunk
    Inline(Vec<u8>),
    /// Stored in the backing file, in the record at `location`
    OnDisk { location: u64 },
}

/// A contiguous, possibly repeated, byte range of a drive
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Chunk {
    pub drive_address: u64,
    pub data_size: u64,
    pub repeat_count: u64,
    pub chunk_size: u64,
    pub previous: Option<ChunkId>,
    pub next: Option<ChunkId>,
    pub content: Content,
}

impl Chunk {
    /// Create an unlinked chunk owning its unit
    #[must_use]
    pub fn inline(drive_address: u64, unit: Vec<u8>, repeat_count: u64) -> Self {
        let data_size = unit.len() as u64;
        Self {
            drive_address,
            data_size,
            repeat_count,
            chunk_size: data_size * repeat_count,
            previous: None,
            next: None,
            content: Content::Inline(unit),
        }
    }

    /// First byte past the chunk
    #[must_use]
    pub const fn end_address(&self) -> u64 {
        self.drive_address + self.chunk_size
    }

    /// Check whether `address` falls inside the chunk
    #[must_use]
    pub const fn contains(&self, address: u64) -> bool {
        address >= self.drive_address && address < self.end_address()
    }

    /// Record location in the backing file, if persisted
    #[must_use]
    pub const fn location(&self) -> Option<u64> {
        match self.content {
            Content::OnDisk { location } => Some(location),
            Content::Inline(_) => None,
        }
    }

    pub fn set_repeat_count(&mut self, repeat_count: u64) {
        self.repeat_count = repeat_count;
        self.chunk_size = self.data_size * repeat_count;
    }
}

/// Allocate a zeroed buffer, reporting failure instead of aborting
pub fn try_alloc(len: u64) -> Result<Vec<u8>> {
    let size = usize::try_from(len).map_err(|_| Error::Allocation { bytes: len })?;
    let mut buf = Vec::new();
    buf.try_reserve_exact(size)
        .map_err(|_| Error::Allocation { bytes: len })?;
    buf.resize(size, 0);
    Ok(buf)
}

/// Copy `unit` repeated `repeat_count` times into a new buffer
pub fn try_repeat(unit: &[u8], repeat_count: u64) -> Result<Vec<u8>> {
    let total = (unit.len() as u64)
        .checked_mul(repeat_count)
        .ok_or(Error::Allocation { bytes: u64::MAX })?;
    let size = usize::try_from(total).map_err(|_| Error::Allocation { bytes: total })?;
    let mut buf = Vec::new();
    buf.try_reserve_exact(size)
        .map_err(|_| Error::Allocation { bytes: total })?;
    for _ in 0..repeat_count {
        buf.extend_from_slice(unit);
    }
    Ok(buf)
}

/// Expand a repeated unit into `out`
///
/// The unit's first repeat starts at drive address `chunk_address`; `out`
/// covers the drive range starting at `from`, which must not precede it.
pub fn expand_into(unit: &[u8], chunk_address: u64, from: u64, out: &mut [u8]) {
    if unit.is_empty() {
        return;
    }
    let unit_len = unit.len();
    let mut phase = ((from - chunk_address) % unit_len as u64) as usize;
    let mut written = 0;
    while written < out.len() {
        let n = (unit_len - phase).min(out.len() - written);
        out[written..written + n].copy_from_slice(&unit[phase..phase + n]);
        written += n;
        phase = 0;
    }
}
