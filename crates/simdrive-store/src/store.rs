//! Drive store
//!
//! [`DriveStore`] ties the directory, the persistence backend and the handle
//! pool together behind two locks: one for the handle pool and one for the
//! directory, every chunk list and the backend. An operation takes at most
//! one of them at a time.

use crate::backend::{Backend, FileBackend};
use crate::chunk::{expand_into, try_alloc};
use crate::compose::compose;
use crate::directory::{Directory, DriveEntry};
use crate::handle::{Cursor, HandlePool};
use crate::zero::fill_zero_pattern;
use parking_lot::Mutex;
use simdrive_common::{
    BackendType, DriveIdentity, Error, HandleId, Result, SeekWhence, StoreConfig,
};
use tracing::{debug, info, warn};

/// Extent of one chunk, for diagnostics
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChunkExtent {
    pub address: u64,
    pub data_size: u64,
    pub repeat_count: u64,
    pub chunk_size: u64,
}

impl ChunkExtent {
    #[must_use]
    pub const fn end_address(&self) -> u64 {
        self.address + self.chunk_size
    }
}

/// Summary of one configured drive
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DriveInfo {
    pub identity: DriveIdentity,
    pub block_size: u64,
    pub max_lba: u64,
    pub chunk_count: usize,
    pub mapped_bytes: u64,
}

impl From<&DriveEntry> for DriveInfo {
    fn from(entry: &DriveEntry) -> Self {
        Self {
            identity: entry.identity,
            block_size: entry.block_size,
            max_lba: entry.max_lba,
            chunk_count: entry.chunks.len(),
            mapped_bytes: entry.chunks.mapped_bytes(),
        }
    }
}

#[derive(Debug)]
struct StoreState {
    directory: Directory,
    backend: Backend,
}

impl StoreState {
    fn drive_index(&self, identity: &DriveIdentity) -> Result<usize> {
        self.directory.find(identity).ok_or_else(|| {
            warn!("Drive {} not found", identity);
            Error::DriveNotFound(identity.to_string())
        })
    }

    fn entry(&self, identity: &DriveIdentity) -> Result<&DriveEntry> {
        let index = self.drive_index(identity)?;
        self.directory
            .get(index)
            .ok_or_else(|| Error::DriveNotFound(identity.to_string()))
    }

    /// Rewrite the whole header after a structural change
    fn write_header(&mut self) -> Result<()> {
        if let Backend::File(file) = &mut self.backend {
            file.write_header(&self.directory.header_slots())?;
        }
        Ok(())
    }
}

/// A set of simulated drives sharing one backend
#[derive(Debug)]
pub struct DriveStore {
    config: StoreConfig,
    state: Mutex<StoreState>,
    handles: Mutex<HandlePool>,
}

impl DriveStore {
    /// Open a store, loading existing drives from the backing file
    pub fn open(config: StoreConfig) -> Result<Self> {
        config.validate()?;

        let (backend, directory) = match config.backend {
            BackendType::Memory => (Backend::Memory, Directory::new()),
            BackendType::File => {
                let file = FileBackend::open(&config.path, config.mode)?;
                let directory = Directory::load(&file)?;
                (Backend::File(file), directory)
            }
        };

        info!(
            "Opened drive store: backend={:?}, drives={}, capacity={} MB",
            config.backend,
            directory.len(),
            config.total_capacity_mb
        );

        Ok(Self {
            config,
            state: Mutex::new(StoreState { directory, backend }),
            handles: Mutex::new(HandlePool::default()),
        })
    }

    #[must_use]
    pub const fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Add a drive, returning its directory index
    pub fn add_drive(&self, identity: DriveIdentity, block_size: u64, max_lba: u64) -> Result<usize> {
        let mut state = self.state.lock();
        let index = state.directory.add(identity, block_size, max_lba)?;
        state.write_header()?;
        Ok(index)
    }

    /// Directory index of a drive
    #[must_use]
    pub fn find_drive(&self, identity: &DriveIdentity) -> Option<usize> {
        self.state.lock().directory.find(identity)
    }

    /// Summary of every configured drive, in directory order
    #[must_use]
    pub fn drives(&self) -> Vec<DriveInfo> {
        self.state
            .lock()
            .directory
            .iter()
            .map(DriveInfo::from)
            .collect()
    }

    pub fn drive_info(&self, identity: &DriveIdentity) -> Result<DriveInfo> {
        let state = self.state.lock();
        state.entry(identity).map(DriveInfo::from)
    }

    /// Delete a drive and release its chunks
    ///
    /// Handles still open on the drive fail with [`Error::DriveNotFound`].
    pub fn delete_drive(&self, identity: &DriveIdentity) -> Result<()> {
        let mut state = self.state.lock();
        let index = state.drive_index(identity)?;
        state.directory.delete(index)?;
        state.write_header()
    }

    /// Delete every drive; a file backend is truncated to an empty header
    pub fn delete_all_drives(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.directory.delete_all();
        match &mut state.backend {
            Backend::File(file) => file.reset(),
            Backend::Memory => Ok(()),
        }
    }

    /// Open a handle on a drive with its cursor at address 0
    pub fn open_handle(&self, identity: &DriveIdentity) -> Result<HandleId> {
        self.state.lock().drive_index(identity)?;
        self.handles.lock().open(*identity)
    }

    pub fn close_handle(&self, handle: HandleId) -> Result<()> {
        self.handles.lock().close(handle).map(|_| ())
    }

    #[must_use]
    pub fn is_drive_opened(&self, identity: &DriveIdentity) -> bool {
        self.handles.lock().is_drive_opened(identity)
    }

    fn cursor(&self, handle: HandleId) -> Result<Cursor> {
        self.handles.lock().get(handle).inspect_err(|_| {
            warn!("Operation on invalid {}", handle);
        })
    }

    /// Move a handle's cursor by `offset` blocks from `whence`
    ///
    /// Returns the new byte address. A target outside the drive fails and
    /// clears the cursor's chunk reference.
    pub fn lseek(&self, handle: HandleId, offset: i64, whence: SeekWhence) -> Result<u64> {
        let mut cursor = self.cursor(handle)?;

        let result = {
            let state = self.state.lock();
            let entry = state.entry(&cursor.drive)?;
            let base = match whence {
                SeekWhence::Begin => 0,
                SeekWhence::Current => i128::from(cursor.address),
                SeekWhence::End => i128::from(entry.chunks.tail_address()),
            };
            let target = base + i128::from(offset) * i128::from(entry.block_size);
            let capacity = entry.capacity();

            match u64::try_from(target) {
                Ok(address) if address < capacity => {
                    cursor.address = address;
                    cursor.chunk = entry.chunks.locate(address);
                    debug!("Seek {} to {} on drive {}", handle, address, cursor.drive);
                    Ok(address)
                }
                _ => {
                    warn!(
                        "Seek {} to {} is outside drive {} of {} bytes",
                        handle, target, cursor.drive, capacity
                    );
                    cursor.chunk = None;
                    Err(Error::OutOfBounds {
                        address: target,
                        capacity,
                    })
                }
            }
        };

        self.handles.lock().update(handle, cursor)?;
        result
    }

    /// Write `repeat_count` copies of `pattern` at the handle's cursor
    ///
    /// `pattern` must be a non-zero multiple of the drive's block size.
    /// Returns the number of bytes written; the cursor moves past them.
    pub fn write(&self, handle: HandleId, pattern: &[u8], repeat_count: u64) -> Result<u64> {
        let cursor = self.cursor(handle)?;

        let (written, cursor) = {
            let mut guard = self.state.lock();
            let StoreState { directory, backend } = &mut *guard;
            let index = directory
                .find(&cursor.drive)
                .ok_or_else(|| Error::DriveNotFound(cursor.drive.to_string()))?;
            let entry = directory
                .get_mut(index)
                .ok_or_else(|| Error::DriveNotFound(cursor.drive.to_string()))?;

            let unit_len = pattern.len() as u64;
            if unit_len == 0 || unit_len % entry.block_size != 0 || repeat_count == 0 {
                warn!(
                    "Rejected write of {} x {} bytes to drive {} with {}-byte blocks",
                    repeat_count, unit_len, entry.identity, entry.block_size
                );
                return Err(Error::invalid_argument(format!(
                    "write of {repeat_count} x {unit_len} bytes is not a whole number of {}-byte blocks",
                    entry.block_size
                )));
            }

            let capacity = entry.capacity();
            let write_end = unit_len
                .checked_mul(repeat_count)
                .and_then(|len| cursor.address.checked_add(len))
                .filter(|end| *end <= capacity)
                .ok_or_else(|| {
                    warn!(
                        "Write of {} x {} bytes at {} overruns drive {}",
                        repeat_count, unit_len, cursor.address, entry.identity
                    );
                    Error::OutOfBounds {
                        address: i128::from(cursor.address)
                            + i128::from(unit_len) * i128::from(repeat_count),
                        capacity,
                    }
                })?;

            let start = entry.chunks.revalidate(cursor.chunk, cursor.address);
            let overlap = entry
                .chunks
                .classify_overlap(start, cursor.address, write_end)?;
            let written = compose(
                &mut entry.chunks,
                backend,
                &overlap,
                cursor.address,
                pattern,
                repeat_count,
                self.config.total_capacity_mb,
            )
            .inspect_err(|e| warn!("Write to drive {} failed: {}", entry.identity, e))?;

            if entry.chunks.take_header_dirty() {
                if let Backend::File(file) = backend {
                    file.write_header_slot(index, &entry.header_slot())?;
                }
            }

            debug!(
                "Wrote {} bytes at {} on drive {} ({} chunks)",
                written,
                cursor.address,
                entry.identity,
                entry.chunks.len()
            );
            let moved = Cursor {
                drive: cursor.drive,
                address: write_end,
                chunk: entry.chunks.locate(write_end),
            };
            (written, moved)
        };

        self.handles.lock().update(handle, cursor)?;
        Ok(written)
    }

    /// Read `block_count` blocks at the handle's cursor
    ///
    /// Unwritten bytes read as zeros, or as the zero pattern when
    /// `fake_zero_read` is set. The cursor moves past the data read.
    pub fn read(&self, handle: HandleId, block_count: u64) -> Result<Vec<u8>> {
        let cursor = self.cursor(handle)?;

        let (data, cursor) = {
            let state = self.state.lock();
            let entry = state.entry(&cursor.drive)?;
            let capacity = entry.capacity();
            let read_end = block_count
                .checked_mul(entry.block_size)
                .and_then(|len| cursor.address.checked_add(len))
                .filter(|end| *end <= capacity)
                .ok_or_else(|| {
                    warn!(
                        "Read of {} blocks at {} overruns drive {}",
                        block_count, cursor.address, entry.identity
                    );
                    Error::OutOfBounds {
                        address: i128::from(cursor.address)
                            + i128::from(block_count) * i128::from(entry.block_size),
                        capacity,
                    }
                })?;

            let mut data = try_alloc(read_end - cursor.address)?;
            if self.config.fake_zero_read {
                fill_zero_pattern(
                    &mut data,
                    cursor.address / entry.block_size,
                    entry.block_size,
                );
            }

            let first = entry
                .chunks
                .revalidate(cursor.chunk, cursor.address)
                .or_else(|| entry.chunks.head());
            for (_, chunk) in entry.chunks.iter_from(first) {
                if chunk.drive_address >= read_end {
                    break;
                }
                let from = chunk.drive_address.max(cursor.address);
                let to = chunk.end_address().min(read_end);
                if from >= to {
                    continue;
                }
                let unit = state.backend.load_unit(chunk)?;
                expand_into(
                    &unit,
                    chunk.drive_address,
                    from,
                    &mut data[(from - cursor.address) as usize..(to - cursor.address) as usize],
                );
            }

            debug!(
                "Read {} bytes at {} on drive {}",
                data.len(),
                cursor.address,
                entry.identity
            );
            let moved = Cursor {
                drive: cursor.drive,
                address: read_end,
                chunk: entry.chunks.locate(read_end),
            };
            (data, moved)
        };

        self.handles.lock().update(handle, cursor)?;
        Ok(data)
    }

    /// Chunk extents of a drive in address order
    pub fn drive_layout(&self, identity: &DriveIdentity) -> Result<Vec<ChunkExtent>> {
        let state = self.state.lock();
        let entry = state.entry(identity)?;
        Ok(entry
            .chunks
            .iter()
            .map(|(_, chunk)| ChunkExtent {
                address: chunk.drive_address,
                data_size: chunk.data_size,
                repeat_count: chunk.repeat_count,
                chunk_size: chunk.chunk_size,
            })
            .collect())
    }

    /// Flush the backing file
    pub fn sync(&self) -> Result<()> {
        self.state.lock().backend.sync()
    }
}
