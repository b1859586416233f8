//! Write compositor
//!
//! Turns one write of `repeat_count` copies of a pattern unit into the
//! smallest set of chunk splits and merges, then relinks the drive's list.
//!
//! A write over an existing chunk `C` with unit `u` is broken into up to
//! five pieces, in address order:
//!
//! ```text
//!   C:   |  u  |  u  |  u  |  u  |  u  |
//!   W:            |<---- write ---->|
//!        |leading |lr|    new     |tr|trailing|
//!        |repeats |  |    data    |  |repeats |
//! ```
//!
//! `lr`/`tr` are the partial-unit remainders of `C` cut by the write. When
//! the new data is stored literally, the remainders are folded into it.

use crate::backend::Backend;
use crate::chunk::{Chunk, ChunkId, Content, try_repeat};
use crate::layout::ChunkRecord;
use crate::list::{ChunkList, Overlap};
use simdrive_common::{Error, Result};
use tracing::debug;

/// Writes repeating their pattern at least this often are stored compressed
pub const WRITE_SAME_COMPRESS_THRESHOLD: u64 = 4;

/// Whether a write of `repeat_count` units is kept as one compressed chunk
#[inline]
#[must_use]
pub const fn needs_compression(repeat_count: u64) -> bool {
    repeat_count >= WRITE_SAME_COMPRESS_THRESHOLD
}

/// Where a piece's resulting chunk comes from
#[derive(Debug, PartialEq, Eq)]
pub enum PieceSource {
    /// An existing chunk, trimmed and moved in place
    Reuse(ChunkId),
    /// A new chunk owning this unit
    Buffer(Vec<u8>),
}

/// One run of the post-write layout
#[derive(Debug, PartialEq, Eq)]
pub struct Piece {
    pub address: u64,
    pub unit_len: u64,
    pub repeat_count: u64,
    pub source: PieceSource,
}

impl Piece {
    #[must_use]
    pub const fn len(&self) -> u64 {
        self.unit_len * self.repeat_count
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub const fn end_address(&self) -> u64 {
        self.address + self.len()
    }

    fn new_bytes(&self) -> Option<u64> {
        match self.source {
            PieceSource::Buffer(_) => Some(self.unit_len),
            PieceSource::Reuse(_) => None,
        }
    }
}

/// The pieces one write resolves into
#[derive(Debug)]
pub struct AffectedChunks {
    pub leading_repeats: Option<Piece>,
    pub leading_remainder: Option<Piece>,
    pub new_data: Piece,
    pub trailing_remainder: Option<Piece>,
    pub trailing_repeats: Option<Piece>,
}

impl AffectedChunks {
    /// Pieces in address order
    pub fn pieces(&self) -> impl Iterator<Item = &Piece> {
        self.leading_repeats
            .iter()
            .chain(&self.leading_remainder)
            .chain(std::iter::once(&self.new_data))
            .chain(&self.trailing_remainder)
            .chain(&self.trailing_repeats)
    }

    fn into_pieces(self) -> impl Iterator<Item = Piece> {
        self.leading_repeats
            .into_iter()
            .chain(self.leading_remainder)
            .chain(std::iter::once(self.new_data))
            .chain(self.trailing_remainder)
            .chain(self.trailing_repeats)
    }

    fn reused(&self) -> impl Iterator<Item = ChunkId> + '_ {
        self.pieces().filter_map(|piece| match piece.source {
            PieceSource::Reuse(id) => Some(id),
            PieceSource::Buffer(_) => None,
        })
    }
}

fn slice_to_vec(data: &[u8]) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(data.len())
        .map_err(|_| Error::Allocation {
            bytes: data.len() as u64,
        })?;
    buf.extend_from_slice(data);
    Ok(buf)
}

fn live(list: &ChunkList, id: ChunkId) -> Result<&Chunk> {
    list.get(id)
        .ok_or_else(|| Error::corrupt(format!("{id} vanished during a write")))
}

/// Split the write against the chunks it overlaps
///
/// Nothing is mutated; every buffer is allocated here so a failure leaves
/// the list untouched.
pub fn plan(
    list: &ChunkList,
    backend: &Backend,
    overlap: &Overlap,
    write_start: u64,
    pattern: &[u8],
    repeat_count: u64,
) -> Result<AffectedChunks> {
    let unit_len = pattern.len() as u64;
    let write_len = unit_len * repeat_count;
    let write_end = write_start + write_len;
    let compress = needs_compression(repeat_count);

    let mut affected = AffectedChunks {
        leading_repeats: None,
        leading_remainder: None,
        new_data: if compress {
            Piece {
                address: write_start,
                unit_len,
                repeat_count,
                source: PieceSource::Buffer(slice_to_vec(pattern)?),
            }
        } else {
            Piece {
                address: write_start,
                unit_len: write_len,
                repeat_count: 1,
                source: PieceSource::Buffer(try_repeat(pattern, repeat_count)?),
            }
        },
        trailing_remainder: None,
        trailing_repeats: None,
    };

    let mut cached: Option<(ChunkId, Vec<u8>)> = None;
    let mut unit_of = |id: ChunkId, chunk: &Chunk| -> Result<Vec<u8>> {
        if let Some((cached_id, unit)) = &cached {
            if *cached_id == id {
                return slice_to_vec(unit);
            }
        }
        let unit = backend.load_unit(chunk)?;
        let copy = slice_to_vec(&unit)?;
        cached = Some((id, unit));
        Ok(copy)
    };

    if let Some(start_id) = overlap.start {
        let start = live(list, start_id)?;
        let before = write_start - start.drive_address;
        let start_repeats = before / start.data_size;
        let start_piece = before % start.data_size;

        if start_repeats > 0 {
            affected.leading_repeats = Some(Piece {
                address: start.drive_address,
                unit_len: start.data_size,
                repeat_count: start_repeats,
                source: PieceSource::Reuse(start_id),
            });
        }
        if start_piece > 0 {
            let mut unit = unit_of(start_id, start)?;
            unit.truncate(start_piece as usize);
            affected.leading_remainder = Some(Piece {
                address: start.drive_address + start_repeats * start.data_size,
                unit_len: start_piece,
                repeat_count: 1,
                source: PieceSource::Buffer(unit),
            });
        }
    }

    if let Some(end_id) = overlap.end {
        let end = live(list, end_id)?;
        let tail = end.end_address() - write_end;
        let end_repeats = tail / end.data_size;
        let end_piece = tail % end.data_size;

        if end_piece > 0 {
            let unit = unit_of(end_id, end)?;
            let cut = (end.data_size - end_piece) as usize;
            affected.trailing_remainder = Some(Piece {
                address: write_end,
                unit_len: end_piece,
                repeat_count: 1,
                source: PieceSource::Buffer(slice_to_vec(&unit[cut..])?),
            });
        }
        if end_repeats > 0 {
            // The start chunk keeps the leading repeats, so the trailing ones
            // need a chunk of their own.
            let source = if overlap.start == Some(end_id) {
                PieceSource::Buffer(unit_of(end_id, end)?)
            } else {
                PieceSource::Reuse(end_id)
            };
            affected.trailing_repeats = Some(Piece {
                address: end.end_address() - end_repeats * end.data_size,
                unit_len: end.data_size,
                repeat_count: end_repeats,
                source,
            });
        }
    }

    if !compress && (affected.leading_remainder.is_some() || affected.trailing_remainder.is_some())
    {
        affected = merge_remainders(affected)?;
    }

    Ok(affected)
}

/// Fold the partial-unit remainders into a literal new-data piece
fn merge_remainders(mut affected: AffectedChunks) -> Result<AffectedChunks> {
    let leading = affected.leading_remainder.take();
    let trailing = affected.trailing_remainder.take();
    let parts: Vec<&Piece> = leading
        .iter()
        .chain(std::iter::once(&affected.new_data))
        .chain(trailing.iter())
        .collect();

    let address = parts[0].address;
    let total: u64 = parts.iter().map(|piece| piece.len()).sum();
    let mut merged = Vec::new();
    merged
        .try_reserve_exact(total as usize)
        .map_err(|_| Error::Allocation { bytes: total })?;
    for piece in &parts {
        if let PieceSource::Buffer(unit) = &piece.source {
            merged.extend_from_slice(unit);
        }
    }

    affected.new_data = Piece {
        address,
        unit_len: total,
        repeat_count: 1,
        source: PieceSource::Buffer(merged),
    };
    Ok(affected)
}

/// Overwrite an uncompressed chunk's bytes in place
fn overwrite_in_place(
    list: &mut ChunkList,
    backend: &mut Backend,
    id: ChunkId,
    write_start: u64,
    data: &[u8],
) -> Result<()> {
    let chunk = list
        .get_mut(id)
        .ok_or_else(|| Error::corrupt(format!("{id} vanished during a write")))?;
    let offset = write_start - chunk.drive_address;
    match (&mut chunk.content, backend) {
        (Content::Inline(unit), _) => {
            let offset = offset as usize;
            unit[offset..offset + data.len()].copy_from_slice(data);
            Ok(())
        }
        (Content::OnDisk { location }, Backend::File(file)) => {
            file.write_content(*location, offset, data)
        }
        (Content::OnDisk { .. }, Backend::Memory) => {
            Err(Error::corrupt("on-disk chunk in a memory store"))
        }
    }
}

/// Check whether a write can be applied by rewriting one chunk's bytes
fn fits_in_place(
    list: &ChunkList,
    overlap: &Overlap,
    write_end: u64,
    repeat_count: u64,
) -> Option<ChunkId> {
    let id = overlap.start?;
    if overlap.end.is_some() && overlap.end != Some(id) {
        return None;
    }
    let chunk = list.get(id)?;
    let fits = chunk.repeat_count == 1
        && !needs_compression(repeat_count)
        && write_end <= chunk.end_address();
    fits.then_some(id)
}

/// Apply one write to a drive's chunk list
///
/// `overlap` must come from [`ChunkList::classify_overlap`] for the same
/// range. Returns the number of bytes logically written. `capacity_mb`
/// bounds the backing file when `backend` is file-based.
///
/// A failure before the overlapped chunks are destroyed leaves the list
/// unchanged. A backend failure after that point is not rolled back.
pub fn compose(
    list: &mut ChunkList,
    backend: &mut Backend,
    overlap: &Overlap,
    write_start: u64,
    pattern: &[u8],
    repeat_count: u64,
    capacity_mb: u64,
) -> Result<u64> {
    let written = pattern.len() as u64 * repeat_count;
    let write_end = write_start + written;

    if let Some(id) = fits_in_place(list, overlap, write_end, repeat_count) {
        let data = try_repeat(pattern, repeat_count)?;
        overwrite_in_place(list, backend, id, write_start, &data)?;
        debug!("In-place write of {} bytes at {} into {}", written, write_start, id);
        return Ok(written);
    }

    let affected = plan(list, backend, overlap, write_start, pattern, repeat_count)?;

    let (new_chunks, new_bytes) = affected
        .pieces()
        .filter_map(Piece::new_bytes)
        .fold((0u64, 0u64), |(n, bytes), len| (n + 1, bytes + len));
    if let Backend::File(file) = backend {
        file.check_capacity(new_bytes, new_chunks, capacity_mb)?;
    }
    list.reserve(new_chunks as usize);

    // Everything between the surviving neighbours goes, except reused chunks
    let reused: Vec<ChunkId> = affected.reused().collect();
    for id in list.span_between(overlap.previous, overlap.next)? {
        if !reused.contains(&id) {
            list.remove(id);
        }
    }

    let mut run = Vec::with_capacity(5);
    for piece in affected.into_pieces() {
        let piece_len = piece.len();
        match piece.source {
            PieceSource::Reuse(id) => {
                list.set_repeat_count(backend, id, piece.repeat_count)?;
                list.set_drive_address(backend, id, piece.address)?;
                run.push(id);
            }
            PieceSource::Buffer(unit) => {
                let content = match backend {
                    Backend::File(file) => {
                        let record = ChunkRecord {
                            address: piece.address,
                            previous: 0,
                            next: 0,
                            data_size: piece.unit_len,
                            chunk_size: piece_len,
                            repeat_count: piece.repeat_count,
                        };
                        Content::OnDisk {
                            location: file.append_chunk(&record, &unit)?,
                        }
                    }
                    Backend::Memory => Content::Inline(unit),
                };
                run.push(list.insert(Chunk {
                    drive_address: piece.address,
                    data_size: piece.unit_len,
                    repeat_count: piece.repeat_count,
                    chunk_size: piece_len,
                    previous: None,
                    next: None,
                    content,
                }));
            }
        }
    }

    list.link_run(backend, overlap.previous, &run, overlap.next)?;
    debug!(
        "Composed write of {} bytes at {} into {} chunks ({} new)",
        written,
        write_start,
        run.len(),
        new_chunks
    );
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::FileBackend;
    use crate::chunk::expand_into;
    use rand::Rng;
    use simdrive_common::OperatingMode;
    use tempfile::tempdir;

    fn write(list: &mut ChunkList, backend: &mut Backend, at: u64, pattern: &[u8], rc: u64) {
        let end = at + pattern.len() as u64 * rc;
        let overlap = list
            .classify_overlap(list.locate(at), at, end)
            .unwrap();
        assert_eq!(
            compose(list, backend, &overlap, at, pattern, rc, 1024).unwrap(),
            pattern.len() as u64 * rc
        );
        list.check_order().unwrap();
    }

    fn read(list: &ChunkList, backend: &Backend, at: u64, len: usize) -> Vec<u8> {
        let mut out = vec![0u8; len];
        let end = at + len as u64;
        for (_, chunk) in list.iter() {
            let from = chunk.drive_address.max(at);
            let to = chunk.end_address().min(end);
            if from >= to {
                continue;
            }
            let unit = backend.load_unit(chunk).unwrap();
            expand_into(
                &unit,
                chunk.drive_address,
                from,
                &mut out[(from - at) as usize..(to - at) as usize],
            );
        }
        out
    }

    fn extents(list: &ChunkList) -> Vec<(u64, u64, u64)> {
        list.iter()
            .map(|(_, c)| (c.drive_address, c.end_address(), c.repeat_count))
            .collect()
    }

    fn unit(seed: u8, len: usize) -> Vec<u8> {
        (0..len).map(|i| seed.wrapping_add(i as u8)).collect()
    }

    #[test]
    fn test_write_into_empty_list() {
        let mut list = ChunkList::new();
        let mut backend = Backend::Memory;
        write(&mut list, &mut backend, 100, &unit(1, 50), 1);
        assert_eq!(extents(&list), vec![(100, 150, 1)]);
        assert_eq!(read(&list, &backend, 100, 50), unit(1, 50));
    }

    #[test]
    fn test_threshold_boundary() {
        let mut list = ChunkList::new();
        let mut backend = Backend::Memory;
        let pattern = unit(7, 8);

        write(&mut list, &mut backend, 0, &pattern, WRITE_SAME_COMPRESS_THRESHOLD - 1);
        let (_, below) = list.iter().next().unwrap();
        assert_eq!(below.repeat_count, 1);
        assert_eq!(below.data_size, 8 * (WRITE_SAME_COMPRESS_THRESHOLD - 1));

        write(&mut list, &mut backend, 1000, &pattern, WRITE_SAME_COMPRESS_THRESHOLD);
        let (_, at) = list.iter().nth(1).unwrap();
        assert_eq!(at.repeat_count, WRITE_SAME_COMPRESS_THRESHOLD);
        assert_eq!(at.data_size, 8);
        assert_eq!(at.chunk_size, 8 * WRITE_SAME_COMPRESS_THRESHOLD);
    }

    #[test]
    fn test_split_compressed_chunk() {
        let mut list = ChunkList::new();
        let mut backend = Backend::Memory;
        let base = unit(0, 200);
        write(&mut list, &mut backend, 0, &base, 5);
        assert_eq!(extents(&list), vec![(0, 1000, 5)]);

        let new = vec![0xEE; 50];
        let overlap = list.classify_overlap(list.locate(220), 220, 270).unwrap();
        let affected = plan(&list, &backend, &overlap, 220, &new, 1).unwrap();

        // The remainders are merged into the literal new data
        let ranges: Vec<_> = affected
            .pieces()
            .map(|p| (p.address, p.end_address()))
            .collect();
        assert_eq!(ranges, vec![(0, 200), (200, 400), (400, 1000)]);

        compose(&mut list, &mut backend, &overlap, 220, &new, 1, 1024).unwrap();
        list.check_order().unwrap();
        assert_eq!(
            extents(&list),
            vec![(0, 200, 1), (200, 400, 1), (400, 1000, 3)]
        );

        let data = read(&list, &backend, 0, 1000);
        assert_eq!(&data[0..200], &base[..]);
        assert_eq!(&data[200..220], &base[..20]);
        assert_eq!(&data[220..270], &new[..]);
        assert_eq!(&data[270..400], &base[70..]);
        for repeat in 2..5 {
            assert_eq!(&data[repeat * 200..(repeat + 1) * 200], &base[..]);
        }
    }

    #[test]
    fn test_split_compressed_chunk_with_compressed_write() {
        let mut list = ChunkList::new();
        let mut backend = Backend::Memory;
        write(&mut list, &mut backend, 0, &unit(0, 200), 5);

        let overlap = list.classify_overlap(list.locate(220), 220, 270).unwrap();
        let affected = plan(&list, &backend, &overlap, 220, &[9; 10], 5).unwrap();
        let ranges: Vec<_> = affected
            .pieces()
            .map(|p| (p.address, p.end_address()))
            .collect();
        assert_eq!(
            ranges,
            vec![(0, 200), (200, 220), (220, 270), (270, 400), (400, 1000)]
        );
        assert_eq!(
            affected.leading_repeats.as_ref().unwrap().source,
            PieceSource::Reuse(overlap.start.unwrap())
        );
        assert!(matches!(
            affected.trailing_repeats.as_ref().unwrap().source,
            PieceSource::Buffer(_)
        ));
    }

    #[test]
    fn test_fast_path_keeps_metadata() {
        let mut list = ChunkList::new();
        let mut backend = Backend::Memory;
        write(&mut list, &mut backend, 0, &unit(0, 100), 1);
        let before = list.head();

        write(&mut list, &mut backend, 10, &[0xFF; 5], 2);
        assert_eq!(list.head(), before);
        assert_eq!(extents(&list), vec![(0, 100, 1)]);
        let data = read(&list, &backend, 0, 100);
        assert_eq!(&data[10..20], &[0xFF; 10]);
        assert_eq!(&data[20..], &unit(0, 100)[20..]);
    }

    #[test]
    fn test_write_spanning_several_chunks() {
        let mut list = ChunkList::new();
        let mut backend = Backend::Memory;
        write(&mut list, &mut backend, 0, &unit(1, 100), 1);
        write(&mut list, &mut backend, 150, &unit(2, 100), 1);
        write(&mut list, &mut backend, 300, &unit(3, 10), 10);
        write(&mut list, &mut backend, 500, &unit(4, 100), 1);

        write(&mut list, &mut backend, 50, &[0xAB; 25], 12);
        assert_eq!(
            extents(&list),
            vec![(0, 50, 1), (50, 350, 12), (350, 400, 5), (500, 600, 1)]
        );
        let data = read(&list, &backend, 0, 600);
        assert_eq!(&data[..50], &unit(1, 100)[..50]);
        assert!(data[50..350].iter().all(|b| *b == 0xAB));
        for repeat in 0..5 {
            let at = 350 + repeat * 10;
            assert_eq!(&data[at..at + 10], &unit(3, 10)[..]);
        }
        assert!(data[400..500].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_idempotent_rewrite() {
        for rc in [1, 3, 6] {
            let mut list = ChunkList::new();
            let mut backend = Backend::Memory;
            write(&mut list, &mut backend, 0, &unit(5, 300), 1);
            write(&mut list, &mut backend, 40, &unit(9, 20), rc);
            let shape = extents(&list);
            let data = read(&list, &backend, 0, 300);

            write(&mut list, &mut backend, 40, &unit(9, 20), rc);
            assert_eq!(extents(&list), shape);
            assert_eq!(read(&list, &backend, 0, 300), data);
        }
    }

    #[test]
    fn test_file_backend_mirrors_links() {
        let dir = tempdir().unwrap();
        let mut backend = Backend::File(
            FileBackend::open(dir.path().join("drives.dat"), OperatingMode::Permanent).unwrap(),
        );
        let mut list = ChunkList::new();
        write(&mut list, &mut backend, 0, &unit(1, 64), 1);
        write(&mut list, &mut backend, 128, &unit(2, 64), 1);
        write(&mut list, &mut backend, 32, &unit(3, 64), 1);

        let Backend::File(file) = &backend else {
            unreachable!()
        };
        let mut location = list.first_chunk_location();
        let mut on_disk = Vec::new();
        let mut previous = 0;
        while location != 0 {
            let record = file.read_record(location).unwrap();
            assert_eq!(record.previous, previous);
            on_disk.push((record.address, record.address + record.chunk_size));
            previous = location;
            location = record.next;
        }
        let in_memory: Vec<_> = extents(&list).iter().map(|e| (e.0, e.1)).collect();
        assert_eq!(on_disk, in_memory);
        assert_eq!(read(&list, &backend, 32, 64), unit(3, 64));
    }

    #[test]
    fn test_capacity_rejection_mutates_nothing() {
        let dir = tempdir().unwrap();
        let mut backend = Backend::File(
            FileBackend::open(dir.path().join("drives.dat"), OperatingMode::Permanent).unwrap(),
        );
        let mut list = ChunkList::new();
        write(&mut list, &mut backend, 0, &unit(1, 64), 1);
        let shape = extents(&list);

        let big = vec![1u8; 1 << 20];
        let overlap = list.classify_overlap(list.locate(0), 0, 2 << 20).unwrap();
        let result = compose(&mut list, &mut backend, &overlap, 0, &big, 2, 1);
        assert!(matches!(result, Err(Error::CapacityExceeded { .. })));
        assert_eq!(extents(&list), shape);
        list.check_order().unwrap();
    }

    #[test]
    fn test_random_writes_keep_list_ordered() {
        let mut rng = rand::thread_rng();
        let mut list = ChunkList::new();
        let mut backend = Backend::Memory;
        let mut model = vec![0u8; 4096];

        for round in 0..300 {
            let unit_len = rng.gen_range(1..=64usize);
            let rc = rng.gen_range(1..=8u64);
            let len = unit_len * rc as usize;
            let at = rng.gen_range(0..=model.len() - len);
            let pattern = unit(round as u8, unit_len);

            write(&mut list, &mut backend, at as u64, &pattern, rc);
            for (i, byte) in model[at..at + len].iter_mut().enumerate() {
                *byte = pattern[i % unit_len];
            }
        }
        assert_eq!(read(&list, &backend, 0, model.len()), model);
    }
}
