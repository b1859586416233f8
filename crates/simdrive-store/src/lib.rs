//! SimDrive Store - Chunked extent store for simulated block drives
//!
//! This crate stores the contents of many simulated drives as
//! address-ordered chains of chunks. A chunk is a byte range holding one
//! pattern unit, repeated `repeat_count` times, so "write same" requests
//! cost one unit of storage however long they are.
//!
//! # Features
//!
//! - **Memory or file backend**: chunk contents live inline, or in one
//!   backing file that mirrors every metadata change field by field
//! - **Write compositor**: overlapping writes split and merge chunks in place
//! - **Zero pattern reads**: unwritten blocks can read back with 520-byte
//!   sector metadata tags
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │     Caller      │  (open / lseek / read / write / close)
//! └────────┬────────┘
//!          │
//! ┌────────▼────────┐
//! │   DriveStore    │
//! │  - HandlePool   │  cursor per handle
//! │  - Directory    │  drive table, one ChunkList per drive
//! │  - compose()    │  write splits and merges
//! └────────┬────────┘
//!          │
//! ┌────────▼────────┐
//! │     Backend     │  (memory, or header + chunk records in one file)
//! └─────────────────┘
//! ```

pub mod backend;
pub mod chunk;
pub mod compose;
pub mod directory;
pub mod handle;
pub mod layout;
pub mod list;
pub mod store;
pub mod zero;

pub use backend::{Backend, FileBackend};
pub use chunk::{Chunk, ChunkId, Content};
pub use compose::{AffectedChunks, Piece, PieceSource, WRITE_SAME_COMPRESS_THRESHOLD};
pub use directory::{Directory, DriveEntry};
pub use handle::{Cursor, HandlePool};
pub use layout::{CHUNK_CONTENT_OFFSET, ChunkRecord, HEADER_SIZE, HEADER_SLOT_SIZE, HeaderSlot};
pub use list::{ChunkList, Overlap};
pub use store::{ChunkExtent, DriveInfo, DriveStore};
pub use zero::{ZERO_PATTERN_TAG, fill_zero_pattern};
