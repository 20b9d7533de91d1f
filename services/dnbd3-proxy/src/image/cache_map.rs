//! Bit-per-4KiB-block presence tracking (§3, §4.2).

use super::manifest::HASH_BLOCK_SIZE;
use super::model::BLOCK_SIZE;

/// Blocks per cache-map byte: one bit per block, 8 blocks per byte.
const BLOCKS_PER_BYTE: u64 = 8;
/// Bytes spanned by one cache-map byte: `8 * BLOCK_SIZE`.
const BYTE_SPAN: u64 = BLOCKS_PER_BYTE * BLOCK_SIZE;

/// The 4KiB-block presence bitmap for one image.
///
/// Byte index `y = offset >> 15`, bit index `x = (offset >> 12) & 7` (§3).
/// `15 = 12 + 3`: 12 bits address a block's byte offset, 3 more select
/// which of the 8 blocks-per-byte.
#[derive(Debug, Clone)]
pub struct CacheMap {
    bits: Vec<u8>,
    virtual_size: u64,
    total_blocks: u64,
}

impl CacheMap {
    pub fn new(virtual_size: u64) -> Self {
        let total_blocks = virtual_size.div_ceil(BLOCK_SIZE);
        let len = virtual_size.div_ceil(BYTE_SPAN) as usize;
        Self {
            bits: vec![0u8; len],
            virtual_size,
            total_blocks,
        }
    }

    /// Reconstruct from a `.map` sidecar's raw bytes.
    pub fn from_bytes(virtual_size: u64, bits: Vec<u8>) -> Self {
        let total_blocks = virtual_size.div_ceil(BLOCK_SIZE);
        Self {
            bits,
            virtual_size,
            total_blocks,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }

    fn byte_and_bit(block_idx: u64) -> (usize, u8) {
        ((block_idx / BLOCKS_PER_BYTE) as usize, (block_idx % BLOCKS_PER_BYTE) as u8)
    }

    pub fn is_block_present(&self, block_idx: u64) -> bool {
        if block_idx >= self.total_blocks {
            return false;
        }
        let (byte, bit) = Self::byte_and_bit(block_idx);
        self.bits[byte] & (1 << bit) != 0
    }

    /// Mark `[offset, offset+length)` present or absent.
    ///
    /// Marking present rounds the range *inward* to whole 4KiB blocks — a
    /// partially covered block is never marked present (boundary scenario
    /// 1). Marking absent rounds *outward*, so a partially covered block is
    /// cleared entirely and will be re-fetched.
    ///
    /// Returns the indices of any hash-blocks that became fully present as
    /// a result of this call, for the caller to enqueue onto the integrity
    /// checker.
    pub fn mark(&mut self, offset: u64, length: u64, present: bool) -> Vec<u64> {
        if length == 0 {
            return Vec::new();
        }
        let end = offset + length;

        let (start_block, end_block) = if present {
            (offset.div_ceil(BLOCK_SIZE), end / BLOCK_SIZE)
        } else {
            (offset / BLOCK_SIZE, end.div_ceil(BLOCK_SIZE))
        };

        if start_block >= end_block {
            return Vec::new();
        }

        let mut touched_hash_blocks = std::collections::BTreeSet::new();
        for block_idx in start_block..end_block.min(self.total_blocks) {
            let (byte, bit) = Self::byte_and_bit(block_idx);
            if present {
                self.bits[byte] |= 1 << bit;
            } else {
                self.bits[byte] &= !(1 << bit);
            }
            touched_hash_blocks.insert(block_idx / (HASH_BLOCK_SIZE / BLOCK_SIZE));
        }

        if !present {
            return Vec::new();
        }

        touched_hash_blocks
            .into_iter()
            .filter(|&hb| self.is_hash_block_complete(hb))
            .collect()
    }

    /// `true` iff every block in the hash-block `hash_block_idx` covers is
    /// present, used both by [`mark`](Self::mark)'s completion detection
    /// and by the uplink worker's background-replication round-robin to
    /// find the next still-missing hash-block.
    pub fn is_hash_block_complete(&self, hash_block_idx: u64) -> bool {
        let blocks_per_hash_block = HASH_BLOCK_SIZE / BLOCK_SIZE;
        let start = hash_block_idx * blocks_per_hash_block;
        let end = (start + blocks_per_hash_block).min(self.total_blocks);
        (start..end).all(|b| self.is_block_present(b))
    }

    /// `true` once every tracked block is present. The tail byte's bits
    /// past `total_blocks` are treated as 1 regardless of their stored
    /// value, per §3.
    pub fn is_complete(&self) -> bool {
        if self.bits.is_empty() {
            return true;
        }
        let last_byte_idx = self.bits.len() - 1;
        for byte in &self.bits[..last_byte_idx] {
            if *byte != 0xFF {
                return false;
            }
        }
        let valid_bits_in_last_byte = self.total_blocks - (last_byte_idx as u64) * BLOCKS_PER_BYTE;
        let valid_mask = if valid_bits_in_last_byte >= BLOCKS_PER_BYTE {
            0xFFu8
        } else {
            (1u8 << valid_bits_in_last_byte) - 1
        };
        let unused_mask = !valid_mask;
        (self.bits[last_byte_idx] | unused_mask) == 0xFF
    }

    /// Rough "percent present" estimate for UI consumption: 100 points per
    /// fully-set byte, 50 for a partially-set byte, 0 for an empty one,
    /// averaged over the map (§4.2). This is deliberately a fast
    /// approximation, not a precise block count.
    pub fn completeness_estimate(&self) -> u8 {
        if self.bits.is_empty() {
            return 100;
        }
        let total: u64 = self
            .bits
            .iter()
            .map(|&b| if b == 0xFF { 100 } else if b != 0 { 50 } else { 0 })
            .sum();
        (total / self.bits.len() as u64) as u8
    }

    pub fn virtual_size(&self) -> u64 {
        self.virtual_size
    }

    /// `true` iff every 4KiB block touching `[offset, offset+length)` is
    /// present, i.e. the range can be served straight from the backing
    /// file without going through the uplink. A block only partially
    /// covered by the range still must be fully present, since a present
    /// bit only ever covers a whole block (§4.2).
    pub fn is_range_present(&self, offset: u64, length: u32) -> bool {
        if length == 0 {
            return true;
        }
        let start_block = offset / BLOCK_SIZE;
        let end_block = (offset + length as u64).div_ceil(BLOCK_SIZE);
        (start_block..end_block).all(|b| self.is_block_present(b))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sub_block_write_is_not_marked_present() {
        // Boundary scenario 1: real 9000, virtual 12288, a 3 KiB reply is
        // written to offset 0. Block 0 must stay unset.
        let mut map = CacheMap::new(12288);
        let completed = map.mark(0, 3071, true);
        assert!(completed.is_empty());
        assert!(!map.is_block_present(0));
    }

    #[test]
    fn full_block_write_is_marked_present() {
        let mut map = CacheMap::new(12288);
        map.mark(0, 4096, true);
        assert!(map.is_block_present(0));
        assert!(!map.is_block_present(1));
    }

    #[test]
    fn tail_byte_completeness_treats_unused_high_bits_as_set() {
        // Boundary scenario 2: virtual = 5 blocks = 20480 bytes.
        let mut map = CacheMap::new(5 * 4096);
        for block in 0..5 {
            map.mark(block * 4096, 4096, true);
        }
        assert_eq!(map.as_bytes(), &[0x1F]);
        assert!(map.is_complete());
    }

    #[test]
    fn incomplete_map_is_not_complete() {
        let mut map = CacheMap::new(5 * 4096);
        for block in 0..4 {
            map.mark(block * 4096, 4096, true);
        }
        assert!(!map.is_complete());
    }

    #[test]
    fn clearing_rounds_outward() {
        let mut map = CacheMap::new(3 * 4096);
        map.mark(0, 3 * 4096, true);
        assert!(map.is_complete());

        // Clear a range that only partially overlaps block 1; the whole
        // block must be cleared (outward rounding).
        map.mark(4096 + 10, 100, false);
        assert!(!map.is_block_present(1));
        assert!(map.is_block_present(0));
        assert!(map.is_block_present(2));
    }

    #[test]
    fn marking_present_reports_newly_completed_hash_blocks() {
        let hash_block_blocks = (HASH_BLOCK_SIZE / BLOCK_SIZE) as u64;
        let virtual_size = hash_block_blocks * BLOCK_SIZE;
        let mut map = CacheMap::new(virtual_size);

        for block in 0..hash_block_blocks - 1 {
            let completed = map.mark(block * BLOCK_SIZE, BLOCK_SIZE, true);
            assert!(completed.is_empty());
        }
        let completed = map.mark((hash_block_blocks - 1) * BLOCK_SIZE, BLOCK_SIZE, true);
        assert_eq!(completed, vec![0]);
    }

    #[test]
    fn completeness_estimate_is_bounded() {
        let mut map = CacheMap::new(16 * 4096);
        assert_eq!(map.completeness_estimate(), 0);
        map.mark(0, 16 * 4096, true);
        assert_eq!(map.completeness_estimate(), 100);
    }

    #[test]
    fn range_present_requires_every_touched_block() {
        let mut map = CacheMap::new(3 * 4096);
        map.mark(0, 4096, true);
        assert!(map.is_range_present(0, 4096));
        assert!(!map.is_range_present(0, 8192));
        map.mark(4096, 4096, true);
        assert!(map.is_range_present(0, 8192));
        assert!(!map.is_range_present(2048, 4096));
    }
}
