//! Handle pool
//!
//! Each open handle carries a cursor: the drive it refers to, a byte address
//! and the chunk under that address. Handles never own chunks; a cursor's
//! chunk id is only a hint that is checked against the list before use.

use crate::chunk::ChunkId;
use simdrive_common::{AVERAGE_OPEN, DriveIdentity, Error, HandleId, MAX_DRIVES, Result};
use slab::Slab;
use tracing::{debug, warn};

/// Seek position of one handle
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Cursor {
    pub drive: DriveIdentity,
    pub address: u64,
    pub chunk: Option<ChunkId>,
}

impl Cursor {
    #[must_use]
    pub const fn new(drive: DriveIdentity) -> Self {
        Self {
            drive,
            address: 0,
            chunk: None,
        }
    }
}

/// Bounded pool of open handles
#[derive(Debug)]
pub struct HandlePool {
    handles: Slab<Cursor>,
    capacity: usize,
}

impl Default for HandlePool {
    fn default() -> Self {
        Self::new(MAX_DRIVES * AVERAGE_OPEN)
    }
}

impl HandlePool {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            handles: Slab::with_capacity(capacity),
            capacity,
        }
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of open handles
    #[must_use]
    pub fn open_count(&self) -> usize {
        self.handles.len()
    }

    /// Check whether any handle refers to `identity`
    #[must_use]
    pub fn is_drive_opened(&self, identity: &DriveIdentity) -> bool {
        self.handles
            .iter()
            .any(|(_, cursor)| cursor.drive == *identity)
    }

    #[must_use]
    pub fn find_free_slot(&self) -> Option<HandleId> {
        (self.handles.len() < self.capacity).then(|| HandleId::from(self.handles.vacant_key()))
    }

    #[must_use]
    pub fn is_valid(&self, handle: HandleId) -> bool {
        self.handles.contains(handle.index())
    }

    /// Open a handle on `identity` with its cursor at address 0
    pub fn open(&mut self, identity: DriveIdentity) -> Result<HandleId> {
        if self.handles.len() >= self.capacity {
            warn!("Handle pool full, cannot open {}", identity);
            return Err(Error::HandlePoolFull(self.capacity));
        }
        let handle = HandleId::from(self.handles.insert(Cursor::new(identity)));
        debug!("Opened {} on drive {}", handle, identity);
        Ok(handle)
    }

    /// Close a handle, returning its last cursor
    pub fn close(&mut self, handle: HandleId) -> Result<Cursor> {
        let cursor = self
            .handles
            .try_remove(handle.index())
            .ok_or(Error::InvalidHandle(handle.index()))?;
        debug!("Closed {} on drive {}", handle, cursor.drive);
        Ok(cursor)
    }

    pub fn get(&self, handle: HandleId) -> Result<Cursor> {
        self.handles
            .get(handle.index())
            .copied()
            .ok_or(Error::InvalidHandle(handle.index()))
    }

    /// Store a moved cursor back, unless the handle was closed or reopened meanwhile
    pub fn update(&mut self, handle: HandleId, cursor: Cursor) -> Result<()> {
        match self.handles.get_mut(handle.index()) {
            Some(current) if current.drive == cursor.drive => {
                *current = cursor;
                Ok(())
            }
            _ => Err(Error::InvalidHandle(handle.index())),
        }
    }
}
