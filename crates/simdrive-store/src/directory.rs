//! Drive directory
//!
//! A fixed table of [`MAX_DRIVES`] slots. Live drives are packed at the
//! front; deleting one shifts the rest down and resets the freed tail slot.

use crate::backend::FileBackend;
use crate::chunk::{Chunk, Content};
use crate::layout::HeaderSlot;
use crate::list::ChunkList;
use simdrive_common::{DriveIdentity, Error, MAX_DRIVES, Result};
use tracing::{debug, info, warn};

/// One configured drive and its chunk list
#[derive(Debug, Default)]
pub struct DriveEntry {
    pub identity: DriveIdentity,
    pub block_size: u64,
    pub max_lba: u64,
    pub chunks: ChunkList,
}

impl DriveEntry {
    /// Drive capacity in bytes; [`Directory::add`] keeps it within `u64`
    #[must_use]
    pub const fn capacity(&self) -> u64 {
        self.max_lba * self.block_size
    }

    /// Header record describing this drive
    #[must_use]
    pub fn header_slot(&self) -> HeaderSlot {
        HeaderSlot {
            identity: self.identity,
            max_lba: self.max_lba,
            block_size: self.block_size,
            data_size: self.chunks.mapped_bytes(),
            first_chunk_location: self.chunks.first_chunk_location(),
        }
    }

    /// True for a vacated or never-used slot
    #[must_use]
    pub fn is_vacant(&self) -> bool {
        self.identity.is_empty() && self.max_lba == 0 && self.chunks.is_empty()
    }
}

/// Catalog of configured drives
#[derive(Debug)]
pub struct Directory {
    slots: Vec<DriveEntry>,
    count: usize,
}

impl Default for Directory {
    fn default() -> Self {
        Self::new()
    }
}

impl Directory {
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: (0..MAX_DRIVES).map(|_| DriveEntry::default()).collect(),
            count: 0,
        }
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.count
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.count == 0
    }

    #[must_use]
    pub const fn is_full(&self) -> bool {
        self.count == MAX_DRIVES
    }

    /// Live entry at `index`
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&DriveEntry> {
        self.slots[..self.count].get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut DriveEntry> {
        self.slots[..self.count].get_mut(index)
    }

    /// Any slot, live or vacant
    #[must_use]
    pub fn slot(&self, index: usize) -> Option<&DriveEntry> {
        self.slots.get(index)
    }

    /// Live entries in table order
    pub fn iter(&self) -> impl Iterator<Item = &DriveEntry> {
        self.slots[..self.count].iter()
    }

    /// Index of the drive with this identity
    #[must_use]
    pub fn find(&self, identity: &DriveIdentity) -> Option<usize> {
        self.iter().position(|entry| entry.identity == *identity)
    }

    /// Add a drive with an empty chunk list, returning its index
    pub fn add(&mut self, identity: DriveIdentity, block_size: u64, max_lba: u64) -> Result<usize> {
        if block_size == 0 || max_lba == 0 {
            warn!(
                "Rejected drive {} with block_size={} max_lba={}",
                identity, block_size, max_lba
            );
            return Err(Error::invalid_argument(format!(
                "drive {identity} needs a non-zero block size and max_lba"
            )));
        }
        if block_size.checked_mul(max_lba).is_none() {
            warn!(
                "Rejected drive {} with block_size={} max_lba={}: capacity overflows",
                identity, block_size, max_lba
            );
            return Err(Error::invalid_argument(format!(
                "drive {identity} capacity of {max_lba} x {block_size} bytes overflows"
            )));
        }
        if self.is_full() {
            warn!("Drive table full, cannot add {}", identity);
            return Err(Error::TableFull(MAX_DRIVES));
        }
        if self.find(&identity).is_some() {
            warn!("Drive {} already exists", identity);
            return Err(Error::DriveExists(identity.to_string()));
        }

        let index = self.count;
        self.slots[index] = DriveEntry {
            identity,
            block_size,
            max_lba,
            chunks: ChunkList::new(),
        };
        self.count += 1;
        info!(
            "Added drive {} at slot {}: block_size={}, max_lba={}",
            identity, index, block_size, max_lba
        );
        Ok(index)
    }

    /// Remove the drive at `index`, releasing its chunks and compacting the table
    pub fn delete(&mut self, index: usize) -> Result<DriveIdentity> {
        if index >= self.count {
            return Err(Error::DriveNotFound(format!("slot {index}")));
        }
        let entry = std::mem::take(&mut self.slots[index]);
        self.slots[index..self.count].rotate_left(1);
        self.count -= 1;
        info!(
            "Deleted drive {} from slot {} ({} chunks released)",
            entry.identity,
            index,
            entry.chunks.len()
        );
        Ok(entry.identity)
    }

    /// Remove every drive
    pub fn delete_all(&mut self) {
        for entry in &mut self.slots[..self.count] {
            *entry = DriveEntry::default();
        }
        info!("Deleted all {} drives", self.count);
        self.count = 0;
    }

    /// Header records for the live drives
    #[must_use]
    pub fn header_slots(&self) -> Vec<HeaderSlot> {
        self.iter().map(DriveEntry::header_slot).collect()
    }

    /// Rebuild the table and every chunk chain from a backing file
    pub fn load(file: &FileBackend) -> Result<Self> {
        let mut directory = Self::new();
        let max_records = file.len() / crate::layout::CHUNK_CONTENT_OFFSET;

        for header in file.read_header()? {
            if directory.find(&header.identity).is_some() {
                return Err(Error::corrupt(format!(
                    "drive {} listed twice",
                    header.identity
                )));
            }
            let index = directory.add(header.identity, header.block_size, header.max_lba)?;
            let chunks = &mut directory.slots[index].chunks;

            let mut location = header.first_chunk_location;
            let mut previous = 0;
            while location != 0 {
                if chunks.len() as u64 >= max_records {
                    return Err(Error::corrupt(format!(
                        "chunk chain of drive {} loops",
                        header.identity
                    )));
                }
                let record = file.read_record(location)?;
                if record.previous != previous {
                    return Err(Error::corrupt(format!(
                        "chunk at {location} links back to {} instead of {previous}",
                        record.previous
                    )));
                }
                chunks.push_loaded(Chunk {
                    drive_address: record.address,
                    data_size: record.data_size,
                    repeat_count: record.repeat_count,
                    chunk_size: record.chunk_size,
                    previous: None,
                    next: None,
                    content: Content::OnDisk { location },
                })?;
                previous = location;
                location = record.next;
            }
            chunks.check_order()?;
            chunks.take_header_dirty();
            debug!(
                "Loaded drive {}: {} chunks, {} bytes mapped",
                header.identity,
                chunks.len(),
                chunks.mapped_bytes()
            );
        }

        info!("Loaded {} drives from {:?}", directory.len(), file.path());
        Ok(directory)
    }
}
