//! Per-drive chunk list
//!
//! Chunks live in an arena of generational slots and are chained in address
//! order through their `previous`/`next` ids. The list owns its chunks: a
//! chunk is destroyed by removing it from the arena, which also invalidates
//! every id that still refers to it.

use crate::backend::Backend;
use crate::chunk::{Chunk, ChunkId};
use crate::layout::ChunkField;
use simdrive_common::{Error, Result};
use slab::Slab;

#[derive(Debug)]
struct Slot {
    /// Stamped at insert to detect stale ids after slot reuse
    generation: u32,
    chunk: Chunk,
}

/// Chunks touched by a write spanning `[write_start, write_end)`
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Overlap {
    /// Last chunk wholly before the write
    pub previous: Option<ChunkId>,
    /// Chunk containing `write_start`
    pub start: Option<ChunkId>,
    /// Chunk containing the write's last byte and extending past `write_end`
    pub end: Option<ChunkId>,
    /// First chunk wholly after the write
    pub next: Option<ChunkId>,
}

/// Address-ordered chain of one drive's chunks
#[derive(Debug, Default)]
pub struct ChunkList {
    chunks: Slab<Slot>,
    next_generation: u32,
    head: Option<ChunkId>,
    end: Option<ChunkId>,
    header_dirty: bool,
}

impl ChunkList {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    #[must_use]
    pub const fn head(&self) -> Option<ChunkId> {
        self.head
    }

    #[must_use]
    pub const fn end(&self) -> Option<ChunkId> {
        self.end
    }

    #[must_use]
    pub fn get(&self, id: ChunkId) -> Option<&Chunk> {
        self.chunks
            .get(id.index)
            .filter(|slot| slot.generation == id.generation)
            .map(|slot| &slot.chunk)
    }

    pub fn get_mut(&mut self, id: ChunkId) -> Option<&mut Chunk> {
        self.chunks
            .get_mut(id.index)
            .filter(|slot| slot.generation == id.generation)
            .map(|slot| &mut slot.chunk)
    }

    fn chunk(&self, id: ChunkId) -> Result<&Chunk> {
        self.get(id)
            .ok_or_else(|| Error::corrupt(format!("{id} is not a live chunk")))
    }

    fn chunk_mut(&mut self, id: ChunkId) -> Result<&mut Chunk> {
        self.get_mut(id)
            .ok_or_else(|| Error::corrupt(format!("{id} is not a live chunk")))
    }

    /// Make room for `additional` inserts without reallocating
    pub fn reserve(&mut self, additional: usize) {
        self.chunks.reserve(additional);
    }

    /// Add an unlinked chunk to the arena
    pub fn insert(&mut self, chunk: Chunk) -> ChunkId {
        let entry = self.chunks.vacant_entry();
        let index = entry.key();
        let generation = self.next_generation;
        self.next_generation = self.next_generation.wrapping_add(1);
        entry.insert(Slot { generation, chunk });
        ChunkId { index, generation }
    }

    /// Destroy a chunk; its id and every copy of it become stale
    ///
    /// Links of neighbouring chunks are left to the caller.
    pub fn remove(&mut self, id: ChunkId) -> Option<Chunk> {
        if self.get(id).is_none() {
            return None;
        }
        let slot = self.chunks.try_remove(id.index)?;
        if self.head == Some(id) {
            self.set_head(None);
        }
        if self.end == Some(id) {
            self.set_end(None);
        }
        Some(slot.chunk)
    }

    /// Drop every chunk
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// Iterate chunks in address order
    pub fn iter(&self) -> Iter<'_> {
        Iter {
            list: self,
            cursor: self.head,
        }
    }

    /// Iterate chunks in address order starting at `from`
    pub fn iter_from(&self, from: Option<ChunkId>) -> Iter<'_> {
        Iter {
            list: self,
            cursor: from.filter(|id| self.get(*id).is_some()),
        }
    }

    /// Chunk containing `address`, or the nearest chunk before it
    #[must_use]
    pub fn locate(&self, address: u64) -> Option<ChunkId> {
        self.iter()
            .take_while(|(_, chunk)| chunk.drive_address <= address)
            .last()
            .map(|(id, _)| id)
    }

    /// Check a cursor's chunk is still the right one for `address`
    #[must_use]
    pub fn cursor_is_current(&self, cursor: Option<ChunkId>, address: u64) -> bool {
        match cursor {
            None => self
                .head
                .and_then(|id| self.get(id))
                .is_none_or(|head| head.drive_address > address),
            Some(id) => self.get(id).is_some_and(|chunk| {
                chunk.drive_address <= address
                    && chunk
                        .next
                        .and_then(|next| self.get(next))
                        .is_none_or(|next| next.drive_address > address)
            }),
        }
    }

    /// Resolve a possibly stale cursor chunk for `address`
    #[must_use]
    pub fn revalidate(&self, cursor: Option<ChunkId>, address: u64) -> Option<ChunkId> {
        if self.cursor_is_current(cursor, address) {
            cursor
        } else {
            self.locate(address)
        }
    }

    /// Classify the chunks a write over `[write_start, write_end)` touches
    ///
    /// `cursor` must be the chunk [`locate`](Self::locate) returns for
    /// `write_start`. A chunk ending exactly at `write_end` is fully covered;
    /// a chunk starting exactly at `write_end` is `next`.
    pub fn classify_overlap(
        &self,
        cursor: Option<ChunkId>,
        write_start: u64,
        write_end: u64,
    ) -> Result<Overlap> {
        let mut overlap = Overlap::default();

        let mut scan = match cursor {
            None => self.head,
            Some(id) => {
                let chunk = self.chunk(id)?;
                if write_start >= chunk.end_address() {
                    overlap.previous = Some(id);
                    chunk.next
                } else {
                    overlap.start = Some(id);
                    overlap.previous = chunk.previous;
                    if write_end < chunk.end_address() {
                        overlap.end = Some(id);
                        overlap.next = chunk.next;
                        return Ok(overlap);
                    }
                    chunk.next
                }
            }
        };

        while let Some(id) = scan {
            let chunk = self.chunk(id)?;
            if write_end <= chunk.drive_address {
                overlap.next = Some(id);
                break;
            }
            if write_end >= chunk.end_address() {
                scan = chunk.next;
                continue;
            }
            overlap.end = Some(id);
            overlap.next = chunk.next;
            break;
        }
        Ok(overlap)
    }

    /// Ids strictly between `after` (or the head) and `until`
    pub fn span_between(
        &self,
        after: Option<ChunkId>,
        until: Option<ChunkId>,
    ) -> Result<Vec<ChunkId>> {
        let mut span = Vec::new();
        let mut cursor = match after {
            Some(id) => self.chunk(id)?.next,
            None => self.head,
        };
        while let Some(id) = cursor {
            if Some(id) == until {
                break;
            }
            span.push(id);
            cursor = self.chunk(id)?.next;
        }
        Ok(span)
    }

    /// First byte past the last chunk, 0 when empty
    #[must_use]
    pub fn tail_address(&self) -> u64 {
        self.end
            .and_then(|id| self.get(id))
            .map_or(0, Chunk::end_address)
    }

    /// Total bytes mapped by chunks
    #[must_use]
    pub fn mapped_bytes(&self) -> u64 {
        self.iter().map(|(_, chunk)| chunk.chunk_size).sum()
    }

    /// Verify the chain is address-ordered, non-overlapping and consistently linked
    pub fn check_order(&self) -> Result<()> {
        let mut previous: Option<(ChunkId, u64)> = None;
        let mut seen = 0;
        for (id, chunk) in self.iter() {
            seen += 1;
            if seen > self.len() {
                return Err(Error::corrupt("chunk chain has a cycle"));
            }
            if chunk.chunk_size != chunk.data_size * chunk.repeat_count || chunk.chunk_size == 0 {
                return Err(Error::corrupt(format!(
                    "chunk at {} has inconsistent size",
                    chunk.drive_address
                )));
            }
            if chunk.previous != previous.map(|(p, _)| p) {
                return Err(Error::corrupt(format!(
                    "chunk at {} has a broken back link",
                    chunk.drive_address
                )));
            }
            if let Some((_, previous_end)) = previous {
                if chunk.drive_address < previous_end {
                    return Err(Error::corrupt(format!(
                        "chunk at {} overlaps its predecessor ending at {previous_end}",
                        chunk.drive_address
                    )));
                }
            }
            previous = Some((id, chunk.end_address()));
        }
        if seen != self.len() {
            return Err(Error::corrupt(format!(
                "chain reaches {seen} of {} chunks",
                self.len()
            )));
        }
        if self.end != previous.map(|(id, _)| id) {
            return Err(Error::corrupt("end does not match last chunk"));
        }
        Ok(())
    }

    /// Set the first chunk, marking the header for resynchronization on change
    pub fn set_head(&mut self, head: Option<ChunkId>) {
        if self.head != head {
            self.head = head;
            self.header_dirty = true;
        }
    }

    /// Set the last chunk, marking the header for resynchronization on change
    pub fn set_end(&mut self, end: Option<ChunkId>) {
        if self.end != end {
            self.end = end;
            self.header_dirty = true;
        }
    }

    /// Clear and return the header resynchronization mark
    pub fn take_header_dirty(&mut self) -> bool {
        std::mem::take(&mut self.header_dirty)
    }

    /// Backing file location of the head chunk, 0 when empty or unpersisted
    #[must_use]
    pub fn first_chunk_location(&self) -> u64 {
        self.head
            .and_then(|id| self.get(id))
            .and_then(Chunk::location)
            .unwrap_or(0)
    }

    fn location_of(&self, id: Option<ChunkId>) -> u64 {
        id.and_then(|id| self.get(id))
            .and_then(Chunk::location)
            .unwrap_or(0)
    }

    /// Point `id` forward at `next`, mirroring the change
    pub fn set_next(
        &mut self,
        backend: &mut Backend,
        id: ChunkId,
        next: Option<ChunkId>,
    ) -> Result<()> {
        let next_location = self.location_of(next);
        let chunk = self.chunk_mut(id)?;
        if chunk.next != next {
            chunk.next = next;
            let location = chunk.location();
            backend.write_field(location, ChunkField::Next, next_location)?;
        }
        Ok(())
    }

    /// Point `id` back at `previous`, mirroring the change
    pub fn set_previous(
        &mut self,
        backend: &mut Backend,
        id: ChunkId,
        previous: Option<ChunkId>,
    ) -> Result<()> {
        let previous_location = self.location_of(previous);
        let chunk = self.chunk_mut(id)?;
        if chunk.previous != previous {
            chunk.previous = previous;
            let location = chunk.location();
            backend.write_field(location, ChunkField::Previous, previous_location)?;
        }
        Ok(())
    }

    /// Change a chunk's repeat count (and with it its size), mirroring the change
    pub fn set_repeat_count(
        &mut self,
        backend: &mut Backend,
        id: ChunkId,
        repeat_count: u64,
    ) -> Result<()> {
        let chunk = self.chunk_mut(id)?;
        if chunk.repeat_count != repeat_count {
            chunk.set_repeat_count(repeat_count);
            let (location, chunk_size) = (chunk.location(), chunk.chunk_size);
            backend.write_field(location, ChunkField::RepeatCount, repeat_count)?;
            backend.write_field(location, ChunkField::ChunkSize, chunk_size)?;
        }
        Ok(())
    }

    /// Move a chunk to a new drive address, mirroring the change
    pub fn set_drive_address(
        &mut self,
        backend: &mut Backend,
        id: ChunkId,
        address: u64,
    ) -> Result<()> {
        let chunk = self.chunk_mut(id)?;
        if chunk.drive_address != address {
            chunk.drive_address = address;
            let location = chunk.location();
            backend.write_field(location, ChunkField::Address, address)?;
        }
        Ok(())
    }

    /// Link `ids` in order between `left` and `right`, updating head and end
    pub fn link_run(
        &mut self,
        backend: &mut Backend,
        left: Option<ChunkId>,
        ids: &[ChunkId],
        right: Option<ChunkId>,
    ) -> Result<()> {
        let (Some(&first), Some(&last)) = (ids.first(), ids.last()) else {
            return Ok(());
        };

        match left {
            Some(left) => self.set_next(backend, left, Some(first))?,
            None => self.set_head(Some(first)),
        }
        self.set_previous(backend, first, left)?;

        for pair in ids.windows(2) {
            self.set_next(backend, pair[0], Some(pair[1]))?;
            self.set_previous(backend, pair[1], Some(pair[0]))?;
        }

        self.set_next(backend, last, right)?;
        match right {
            Some(right) => self.set_previous(backend, right, Some(last))?,
            None => self.set_end(Some(last)),
        }
        Ok(())
    }

    /// Append a chunk that is already linked on disk, used when loading
    pub(crate) fn push_loaded(&mut self, mut chunk: Chunk) -> Result<ChunkId> {
        chunk.previous = self.end;
        chunk.next = None;
        let id = self.insert(chunk);
        match self.end {
            Some(end) => self.chunk_mut(end)?.next = Some(id),
            None => self.head = Some(id),
        }
        self.end = Some(id);
        Ok(id)
    }
}

/// Address-order iterator over a [`ChunkList`]
pub struct Iter<'a> {
    list: &'a ChunkList,
    cursor: Option<ChunkId>,
}

impl<'a> Iterator for Iter<'a> {
    type Item = (ChunkId, &'a Chunk);

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.cursor?;
        let chunk = self.list.get(id)?;
        self.cursor = chunk.next;
        Some((id, chunk))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a list of chunks at the given (address, unit_len, repeat_count)
    fn build(extents: &[(u64, usize, u64)]) -> (ChunkList, Vec<ChunkId>) {
        let mut list = ChunkList::new();
        let mut backend = Backend::Memory;
        let ids: Vec<_> = extents
            .iter()
            .map(|&(address, unit, repeat)| {
                list.insert(Chunk::inline(address, vec![0xAA; unit], repeat))
            })
            .collect();
        list.link_run(&mut backend, None, &ids, None).unwrap();
        (list, ids)
    }

    #[test]
    fn test_link_and_iterate() {
        let (list, ids) = build(&[(0, 10, 1), (20, 5, 2), (40, 10, 1)]);
        assert_eq!(list.len(), 3);
        assert_eq!(list.head(), Some(ids[0]));
        assert_eq!(list.end(), Some(ids[2]));
        assert_eq!(list.tail_address(), 50);
        assert_eq!(list.mapped_bytes(), 30);
        list.check_order().unwrap();
    }

    #[test]
    fn test_locate() {
        let (list, ids) = build(&[(10, 10, 1), (30, 10, 1)]);
        assert_eq!(list.locate(0), None);
        assert_eq!(list.locate(10), Some(ids[0]));
        assert_eq!(list.locate(19), Some(ids[0]));
        assert_eq!(list.locate(25), Some(ids[0]));
        assert_eq!(list.locate(30), Some(ids[1]));
        assert_eq!(list.locate(1000), Some(ids[1]));
    }

    #[test]
    fn test_stale_id_after_remove() {
        let (mut list, ids) = build(&[(0, 10, 1)]);
        let removed = list.remove(ids[0]).unwrap();
        assert_eq!(removed.drive_address, 0);
        assert!(list.get(ids[0]).is_none());
        assert!(list.head().is_none());

        let reused = list.insert(Chunk::inline(100, vec![1], 1));
        assert_eq!(reused.index, ids[0].index);
        assert_ne!(reused, ids[0]);
        assert!(list.get(ids[0]).is_none());
        assert!(list.remove(ids[0]).is_none());
    }

    #[test]
    fn test_reused_slots_get_fresh_generations() {
        let (mut list, ids) = build(&[(0, 10, 1), (20, 10, 1), (40, 10, 1)]);
        list.remove(ids[2]);
        list.remove(ids[0]);
        assert_eq!(list.len(), 1);

        let a = list.insert(Chunk::inline(100, vec![1], 1));
        let b = list.insert(Chunk::inline(200, vec![2], 1));
        let mut reused = [a.index, b.index];
        reused.sort_unstable();
        assert_eq!(reused, [ids[0].index, ids[2].index]);
        for stale in [ids[0], ids[2]] {
            assert!(list.get(stale).is_none());
        }
        assert_eq!(list.get(a).unwrap().drive_address, 100);
        assert_eq!(list.get(ids[1]).unwrap().drive_address, 20);
        assert_eq!(list.len(), 3);
    }

    #[test]
    fn test_classify_inside_one_chunk() {
        let (list, ids) = build(&[(0, 100, 1), (200, 100, 1), (400, 100, 1)]);
        let cursor = list.locate(220);
        let overlap = list.classify_overlap(cursor, 220, 250).unwrap();
        assert_eq!(
            overlap,
            Overlap {
                previous: Some(ids[0]),
                start: Some(ids[1]),
                end: Some(ids[1]),
                next: Some(ids[2]),
            }
        );
    }

    #[test]
    fn test_classify_gap_to_gap() {
        let (list, ids) = build(&[(0, 100, 1), (200, 100, 1), (400, 100, 1)]);
        let overlap = list.classify_overlap(list.locate(150), 150, 350).unwrap();
        assert_eq!(
            overlap,
            Overlap {
                previous: Some(ids[0]),
                start: None,
                end: None,
                next: Some(ids[2]),
            }
        );
    }

    #[test]
    fn test_classify_exact_end_boundary() {
        let (list, ids) = build(&[(0, 100, 1), (100, 100, 1)]);

        // Ending exactly where a chunk ends covers it fully
        let overlap = list.classify_overlap(list.locate(50), 50, 200).unwrap();
        assert_eq!(overlap.start, Some(ids[0]));
        assert_eq!(overlap.end, None);
        assert_eq!(overlap.next, None);

        // Ending exactly where a chunk starts leaves it as next
        let overlap = list.classify_overlap(list.locate(50), 50, 100).unwrap();
        assert_eq!(overlap.end, None);
        assert_eq!(overlap.next, Some(ids[1]));
    }

    #[test]
    fn test_classify_before_head() {
        let (list, ids) = build(&[(100, 100, 1), (300, 100, 1)]);
        let overlap = list.classify_overlap(list.locate(0), 0, 350).unwrap();
        assert_eq!(
            overlap,
            Overlap {
                previous: None,
                start: None,
                end: Some(ids[1]),
                next: None,
            }
        );
        assert_eq!(list.span_between(None, overlap.end).unwrap(), vec![ids[0]]);
    }

    #[test]
    fn test_cursor_revalidation() {
        let (mut list, ids) = build(&[(0, 10, 1), (20, 10, 1)]);
        assert!(list.cursor_is_current(Some(ids[0]), 15));
        assert!(!list.cursor_is_current(Some(ids[0]), 25));
        assert!(!list.cursor_is_current(None, 5));

        let mut backend = Backend::Memory;
        list.remove(ids[1]);
        list.set_next(&mut backend, ids[0], None).unwrap();
        list.set_end(Some(ids[0]));
        assert_eq!(list.revalidate(Some(ids[1]), 25), Some(ids[0]));
    }

    #[test]
    fn test_check_order_detects_overlap() {
        let (mut list, ids) = build(&[(0, 10, 1), (20, 10, 1)]);
        list.get_mut(ids[1]).unwrap().drive_address = 5;
        assert!(list.check_order().is_err());
    }

    #[test]
    fn test_header_dirty_on_head_change() {
        let (mut list, ids) = build(&[(0, 10, 1)]);
        assert!(list.take_header_dirty());
        assert!(!list.take_header_dirty());
        list.set_head(Some(ids[0]));
        assert!(!list.take_header_dirty());
        list.set_head(None);
        assert!(list.take_header_dirty());
    }
}
