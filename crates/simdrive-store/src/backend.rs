//! Persistence backends
//!
//! The memory backend keeps chunk contents inline and has nothing to mirror.
//! The file backend keeps every chunk as a record in one backing file and
//! mirrors each metadata change with a single-field write at its offset.

use crate::chunk::{Chunk, Content};
use crate::layout::{
    CHUNK_CONTENT_OFFSET, ChunkField, ChunkRecord, HEADER_SIZE, HeaderSlot, MIB, decode_header,
    encode_header, encode_u64,
};
use simdrive_common::{Error, OperatingMode, Result};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Chunk storage selected once per store
#[derive(Debug)]
pub enum Backend {
    Memory,
    File(FileBackend),
}

impl Backend {
    #[must_use]
    pub const fn is_file(&self) -> bool {
        matches!(self, Self::File(_))
    }

    /// Mirror one chunk field; no-op for the memory backend or unpersisted chunks
    pub fn write_field(&mut self, location: Option<u64>, field: ChunkField, value: u64) -> Result<()> {
        match (self, location) {
            (Self::File(file), Some(location)) => file.write_field(location, field, value),
            _ => Ok(()),
        }
    }

    /// Read a chunk's pattern unit
    pub fn load_unit(&self, chunk: &Chunk) -> Result<Vec<u8>> {
        match (&chunk.content, self) {
            (Content::Inline(unit), _) => {
                let mut buf = Vec::new();
                buf.try_reserve_exact(unit.len())
                    .map_err(|_| Error::Allocation {
                        bytes: unit.len() as u64,
                    })?;
                buf.extend_from_slice(unit);
                Ok(buf)
            }
            (Content::OnDisk { location }, Self::File(file)) => {
                file.read_content(*location, chunk.data_size)
            }
            (Content::OnDisk { location }, Self::Memory) => Err(Error::corrupt(format!(
                "chunk at {} refers to file location {location} in a memory store",
                chunk.drive_address
            ))),
        }
    }

    pub fn sync(&self) -> Result<()> {
        match self {
            Self::File(file) => file.sync(),
            Self::Memory => Ok(()),
        }
    }
}

/// Single backing file holding the header and every chunk record
#[derive(Debug)]
pub struct FileBackend {
    file: File,
    path: PathBuf,
    len: u64,
    remove_on_drop: bool,
}

impl FileBackend {
    /// Open or create the backing file
    ///
    /// A new (or, in temporary mode, truncated) file gets an empty header.
    pub fn open(path: impl AsRef<Path>, mode: OperatingMode) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let temporary = mode == OperatingMode::Temporary;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(temporary)
            .open(&path)
            .map_err(|e| {
                warn!("Failed to open drive file {:?}: {}", path, e);
                e
            })?;

        let len = file.metadata()?.len();
        let mut backend = Self {
            file,
            path,
            len,
            remove_on_drop: temporary,
        };

        if backend.len == 0 {
            backend.write_header(&[])?;
        } else if backend.len < HEADER_SIZE {
            return Err(Error::corrupt(format!(
                "{:?} is {} bytes, shorter than its header",
                backend.path, backend.len
            )));
        }

        info!(
            "Opened drive file {:?}: size={}, mode={:?}",
            backend.path, backend.len, mode
        );
        Ok(backend)
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current end of file
    #[must_use]
    pub const fn len(&self) -> u64 {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(data).map_err(|e| {
            warn!("Write of {} bytes at {} failed: {}", data.len(), offset, e);
            e
        })?;
        self.len = self.len.max(offset + data.len() as u64);
        Ok(())
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let mut file = &self.file;
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf).map_err(|e| {
            warn!("Read of {} bytes at {} failed: {}", buf.len(), offset, e);
            Error::from(e)
        })
    }

    /// Rewrite the whole header region
    pub fn write_header(&mut self, slots: &[HeaderSlot]) -> Result<()> {
        let header = encode_header(slots)?;
        self.write_at(0, &header)?;
        debug!("Wrote header with {} drives", slots.len());
        Ok(())
    }

    /// Rewrite one drive's header slot
    pub fn write_header_slot(&mut self, index: usize, slot: &HeaderSlot) -> Result<()> {
        self.write_at(HeaderSlot::offset(index), &slot.to_bytes())
    }

    /// Read the live header slots
    pub fn read_header(&self) -> Result<Vec<HeaderSlot>> {
        let mut buf = vec![0u8; HEADER_SIZE as usize];
        self.read_at(0, &mut buf)?;
        decode_header(&buf)
    }

    /// Write one fixed-width field of the record at `location`
    pub fn write_field(&mut self, location: u64, field: ChunkField, value: u64) -> Result<()> {
        self.write_at(location + field.offset(), &encode_u64(value))
    }

    /// Append a chunk record, returning its location
    pub fn append_chunk(&mut self, record: &ChunkRecord, unit: &[u8]) -> Result<u64> {
        let location = self.len;
        let mut buf = Vec::new();
        buf.try_reserve_exact(ChunkRecord::SIZE + unit.len())
            .map_err(|_| Error::Allocation {
                bytes: (ChunkRecord::SIZE + unit.len()) as u64,
            })?;
        buf.extend_from_slice(&record.to_bytes());
        buf.extend_from_slice(unit);
        self.write_at(location, &buf)?;
        Ok(location)
    }

    pub fn read_record(&self, location: u64) -> Result<ChunkRecord> {
        if location < HEADER_SIZE || location + CHUNK_CONTENT_OFFSET > self.len {
            return Err(Error::corrupt(format!(
                "chunk location {location} outside record region"
            )));
        }
        let mut buf = [0u8; ChunkRecord::SIZE];
        self.read_at(location, &mut buf)?;
        ChunkRecord::from_bytes(&buf)
    }

    pub fn read_content(&self, location: u64, data_size: u64) -> Result<Vec<u8>> {
        let mut buf = crate::chunk::try_alloc(data_size)?;
        self.read_at(location + CHUNK_CONTENT_OFFSET, &mut buf)?;
        Ok(buf)
    }

    /// Overwrite content bytes in place, starting `offset` bytes into the unit
    pub fn write_content(&mut self, location: u64, offset: u64, data: &[u8]) -> Result<()> {
        self.write_at(location + CHUNK_CONTENT_OFFSET + offset, data)
    }

    /// Fail if appending `new_bytes` of content in `new_chunks` records would
    /// push the file past `limit_mb`
    pub fn check_capacity(&self, new_bytes: u64, new_chunks: u64, limit_mb: u64) -> Result<()> {
        let projected = self
            .len
            .saturating_add(new_bytes)
            .saturating_add(new_chunks.saturating_mul(CHUNK_CONTENT_OFFSET));
        let projected_mb = projected / MIB;
        if projected_mb > limit_mb {
            warn!(
                "Drive file {:?} would grow to {} bytes, over the {} MB limit",
                self.path, projected, limit_mb
            );
            return Err(Error::CapacityExceeded {
                projected_mb,
                limit_mb,
            });
        }
        Ok(())
    }

    /// Truncate to an empty header
    pub fn reset(&mut self) -> Result<()> {
        self.file.set_len(0)?;
        self.len = 0;
        self.write_header(&[])?;
        info!("Reset drive file {:?}", self.path);
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

impl Drop for FileBackend {
    fn drop(&mut self) {
        if self.remove_on_drop {
            if let Err(e) = std::fs::remove_file(&self.path) {
                warn!("Failed to remove temporary drive file {:?}: {}", self.path, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::decode_u64;
    use simdrive_common::DriveIdentity;
    use tempfile::tempdir;

    #[test]
    fn test_new_file_gets_empty_header() {
        let dir = tempdir().unwrap();
        let backend = FileBackend::open(dir.path().join("drives.dat"), OperatingMode::Permanent)
            .unwrap();
        assert_eq!(backend.len(), HEADER_SIZE);
        assert!(backend.read_header().unwrap().is_empty());
    }

    #[test]
    fn test_field_write_is_single_field() {
        let dir = tempdir().unwrap();
        let mut backend =
            FileBackend::open(dir.path().join("drives.dat"), OperatingMode::Permanent).unwrap();

        let record = ChunkRecord {
            address: 512,
            previous: 0,
            next: 0,
            data_size: 4,
            chunk_size: 4,
            repeat_count: 1,
        };
        let location = backend.append_chunk(&record, &[1, 2, 3, 4]).unwrap();
        assert_eq!(location, HEADER_SIZE);

        backend.write_field(location, ChunkField::Next, 9999).unwrap();
        let reread = backend.read_record(location).unwrap();
        assert_eq!(reread.next, 9999);
        assert_eq!(reread.address, 512);
        assert_eq!(backend.read_content(location, 4).unwrap(), vec![1, 2, 3, 4]);

        backend.write_content(location, 2, &[7]).unwrap();
        assert_eq!(backend.read_content(location, 4).unwrap(), vec![1, 2, 7, 4]);
    }

    #[test]
    fn test_header_slot_update() {
        let dir = tempdir().unwrap();
        let mut backend =
            FileBackend::open(dir.path().join("drives.dat"), OperatingMode::Permanent).unwrap();
        let mut slot = HeaderSlot {
            identity: DriveIdentity::new("d0").unwrap(),
            max_lba: 8,
            block_size: 512,
            ..HeaderSlot::default()
        };
        backend.write_header(std::slice::from_ref(&slot)).unwrap();

        slot.first_chunk_location = 4242;
        backend.write_header_slot(0, &slot).unwrap();
        assert_eq!(backend.read_header().unwrap(), vec![slot]);

        let mut count = [0u8; 8];
        backend.read_at(0, &mut count).unwrap();
        assert_eq!(decode_u64(&count).unwrap(), 1);
    }

    #[test]
    fn test_capacity_limit() {
        let dir = tempdir().unwrap();
        let backend =
            FileBackend::open(dir.path().join("drives.dat"), OperatingMode::Permanent).unwrap();
        assert!(backend.check_capacity(MIB / 2, 1, 1).is_ok());
        assert!(matches!(
            backend.check_capacity(2 * MIB, 1, 1),
            Err(Error::CapacityExceeded { limit_mb: 1, .. })
        ));
    }

    #[test]
    fn test_temporary_file_removed_on_drop() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("scratch.dat");
        std::fs::write(&path, b"stale").unwrap();
        {
            let backend = FileBackend::open(&path, OperatingMode::Temporary).unwrap();
            assert_eq!(backend.len(), HEADER_SIZE);
        }
        assert!(!path.exists());
    }

    #[test]
    fn test_short_file_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("short.dat");
        std::fs::write(&path, b"short").unwrap();
        assert!(matches!(
            FileBackend::open(&path, OperatingMode::Permanent),
            Err(Error::CorruptIndex(_))
        ));
    }
}
