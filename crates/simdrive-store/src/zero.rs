//! Zero pattern for unwritten regions
//!
//! Drives formatted with 520-byte sectors carry 8 bytes of integrity
//! metadata after every 512 bytes of data. An unwritten region reads back
//! as zeros with a valid "zeroed" tag at each position where that metadata
//! lands inside the block.

/// Metadata tag marking a zeroed sector
pub const ZERO_PATTERN_TAG: u64 = 0x7fff_5eed;

/// Sector stride the tag positions follow
pub const SECTOR_STRIDE: u64 = 520;

/// Fill `buf` with the zero pattern for blocks starting at `lba`
///
/// `buf` is treated as consecutive blocks of `block_size` bytes; a trailing
/// partial block is filled as far as it goes.
pub fn fill_zero_pattern(buf: &mut [u8], lba: u64, block_size: u64) {
    buf.fill(0);
    if block_size == 0 {
        return;
    }
    let tag = ZERO_PATTERN_TAG.to_le_bytes();

    for (i, block) in buf.chunks_mut(block_size as usize).enumerate() {
        let offset_520 = ((lba + i as u64) * block_size) % SECTOR_STRIDE;
        let tag_offset = if offset_520 != 0 {
            match block_size.checked_sub(offset_520) {
                Some(offset) => offset,
                None => continue,
            }
        } else if block_size % SECTOR_STRIDE == 0 {
            SECTOR_STRIDE - 8
        } else {
            continue;
        };

        let start = tag_offset as usize;
        if start >= block.len() {
            continue;
        }
        let n = (block.len() - start).min(tag.len());
        block[start..start + n].copy_from_slice(&tag[..n]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tag_at(buf: &[u8], at: usize) -> bool {
        buf[at..at + 8] == ZERO_PATTERN_TAG.to_le_bytes()
    }

    #[test]
    fn test_520_byte_blocks() {
        let mut buf = vec![0xFFu8; 520 * 3];
        fill_zero_pattern(&mut buf, 0, 520);
        for block in 0..3 {
            let base = block * 520;
            assert!(tag_at(&buf, base + 512));
            assert!(buf[base..base + 512].iter().all(|b| *b == 0));
        }
    }

    #[test]
    fn test_512_byte_blocks() {
        let mut buf = vec![0xFFu8; 512 * 3];
        fill_zero_pattern(&mut buf, 1, 512);

        // lba 1: 512 % 520 = 512, tag at 512 - 512 = 0
        assert!(tag_at(&buf, 0));
        // lba 2: 1024 % 520 = 504, tag at 512 - 504 = 8
        assert!(tag_at(&buf, 512 + 8));
        // lba 3: 1536 % 520 = 496, tag at 16
        assert!(tag_at(&buf, 1024 + 16));
        assert_eq!(buf.iter().filter(|b| **b != 0).count(), 3 * 4);
    }

    #[test]
    fn test_aligned_lba_without_520_multiple() {
        let mut buf = vec![0xFFu8; 512];
        fill_zero_pattern(&mut buf, 0, 512);
        assert!(buf.iter().all(|b| *b == 0));
    }

    #[test]
    fn test_tag_clipped_at_block_end() {
        let mut buf = vec![0xFFu8; 4 * 2];
        fill_zero_pattern(&mut buf, 1, 4);
        // lba 1: offset 4, tag at 0 clipped to 4 bytes
        assert_eq!(&buf[..4], &ZERO_PATTERN_TAG.to_le_bytes()[..4]);
        // lba 2: offset 8 exceeds the block, nothing written
        assert!(buf[4..].iter().all(|b| *b == 0));
    }
}
