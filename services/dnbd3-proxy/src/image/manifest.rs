//! CRC-32 manifest: one checksum per hash-block plus a master CRC over the
//! list (§3, §4.2).

use rand::seq::SliceRandom;
use thiserror::Error;

use super::cache_map::CacheMap;
use super::model::BLOCK_SIZE;

/// 16 MiB, the unit of CRC-32 coverage (4096 × 4 KiB blocks).
pub const HASH_BLOCK_SIZE: u64 = 16 * 1024 * 1024;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ManifestError {
    #[error("manifest too short: need at least 4 bytes for the master CRC, got {0}")]
    TooShort(usize),

    #[error("manifest length {0} is not a multiple of 4 bytes")]
    Misaligned(usize),

    #[error("master CRC mismatch: manifest is corrupt and will be discarded")]
    MasterCrcMismatch,
}

/// A loaded, master-CRC-validated list of per-hash-block CRC-32 values.
#[derive(Debug, Clone)]
pub struct CrcManifest {
    master_crc: u32,
    crcs: Vec<u32>,
}

impl CrcManifest {
    /// Parse the raw `.crc` sidecar contents: little-endian master CRC
    /// followed by one little-endian CRC-32 per hash-block. Validates the
    /// master CRC over the remaining words; a mismatch discards the
    /// manifest entirely (the image keeps working, just without manifest
    /// verification) rather than trusting a possibly-corrupt entry list.
    pub fn parse(raw: &[u8]) -> Result<Self, ManifestError> {
        if raw.len() < 4 {
            return Err(ManifestError::TooShort(raw.len()));
        }
        if raw.len() % 4 != 0 {
            return Err(ManifestError::Misaligned(raw.len()));
        }

        let master_crc = u32::from_le_bytes(raw[0..4].try_into().unwrap());
        let body = &raw[4..];

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(body);
        if hasher.finalize() != master_crc {
            return Err(ManifestError::MasterCrcMismatch);
        }

        let crcs = body
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
            .collect();

        Ok(Self { master_crc, crcs })
    }

    /// Serialize back to the on-disk `.crc` sidecar format.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(self.crcs.len() * 4);
        for crc in &self.crcs {
            body.extend_from_slice(&crc.to_le_bytes());
        }

        let mut out = Vec::with_capacity(4 + body.len());
        out.extend_from_slice(&self.master_crc.to_le_bytes());
        out.extend_from_slice(&body);
        out
    }

    pub fn build(crcs: Vec<u32>) -> Self {
        let mut body = Vec::with_capacity(crcs.len() * 4);
        for crc in &crcs {
            body.extend_from_slice(&crc.to_le_bytes());
        }
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&body);
        let master_crc = hasher.finalize();
        Self { master_crc, crcs }
    }

    /// The master CRC-32 over the manifest's CRC list, stored alongside
    /// [`Image::master_crc`](super::model::Image) (§3).
    pub fn master_crc(&self) -> u32 {
        self.master_crc
    }

    pub fn hash_block_count(&self) -> usize {
        self.crcs.len()
    }

    pub fn expected_crc(&self, hash_block_idx: u64) -> Option<u32> {
        self.crcs.get(hash_block_idx as usize).copied()
    }

    /// CRC-32 of `data`, matching what [`check`](Self::check) computes over
    /// a hash-block's bytes (real content, zero-padded to the virtual
    /// tail).
    pub fn crc_of(data: &[u8]) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(data);
        hasher.finalize()
    }

    /// Verify one hash-block's data against the manifest. On mismatch, the
    /// caller is expected to clear the corresponding cache-map bits via
    /// [`CacheMap::mark`] and requeue the range for replication — this
    /// function only reports the verdict.
    pub fn check(&self, hash_block_idx: u64, data: &[u8]) -> Option<bool> {
        self.expected_crc(hash_block_idx)
            .map(|expected| Self::crc_of(data) == expected)
    }

    /// Pick up to 4 hash-block indices for the load-time quick check:
    /// block 0 always, if complete, plus up to 3 more random complete
    /// blocks (§4.2).
    pub fn quick_check_candidates(&self, cache_map: &CacheMap, rng: &mut impl rand::Rng) -> Vec<u64> {
        let blocks_per_hash_block = HASH_BLOCK_SIZE / BLOCK_SIZE;
        let total = self.hash_block_count() as u64;

        let is_hash_block_complete = |hb: u64| {
            let start = hb * blocks_per_hash_block;
            let end = (start + blocks_per_hash_block).min(
                cache_map.virtual_size().div_ceil(BLOCK_SIZE),
            );
            (start..end).all(|b| cache_map.is_block_present(b))
        };

        let mut candidates: Vec<u64> = Vec::new();
        if total > 0 && is_hash_block_complete(0) {
            candidates.push(0);
        }

        let mut rest: Vec<u64> = (1..total).filter(|&hb| is_hash_block_complete(hb)).collect();
        rest.shuffle(rng);
        candidates.extend(rest.into_iter().take(3));

        candidates
    }

    /// Same selection as [`quick_check_candidates`](Self::quick_check_candidates),
    /// for an image whose cache-map is already `null` (i.e. every hash-block
    /// is complete, so there is nothing to filter by presence).
    pub fn quick_check_candidates_when_complete(&self, rng: &mut impl rand::Rng) -> Vec<u64> {
        let total = self.hash_block_count() as u64;
        let mut candidates: Vec<u64> = Vec::new();
        if total > 0 {
            candidates.push(0);
        }

        let mut rest: Vec<u64> = (1..total).collect();
        rest.shuffle(rng);
        candidates.extend(rest.into_iter().take(3));

        candidates
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_manifest() -> CrcManifest {
        CrcManifest::build(vec![0x1111_2222, 0x3333_4444, 0x5555_6666])
    }

    #[test]
    fn round_trips_through_bytes() {
        let manifest = sample_manifest();
        let bytes = manifest.to_bytes();
        let parsed = CrcManifest::parse(&bytes).unwrap();
        assert_eq!(parsed.crcs, manifest.crcs);
    }

    #[test]
    fn rejects_bad_master_crc() {
        let manifest = sample_manifest();
        let mut bytes = manifest.to_bytes();
        // Corrupt the master CRC word.
        bytes[0] ^= 0xFF;
        assert_eq!(
            CrcManifest::parse(&bytes).unwrap_err(),
            ManifestError::MasterCrcMismatch
        );
    }

    #[test]
    fn rejects_misaligned_length() {
        let bytes = vec![0u8; 7];
        assert_eq!(
            CrcManifest::parse(&bytes).unwrap_err(),
            ManifestError::Misaligned(7)
        );
    }

    #[test]
    fn check_reports_mismatch_and_caller_repairs_cache_map() {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(b"hash-block-zero-content");
        let actual_crc = hasher.finalize();

        let manifest = CrcManifest::build(vec![0xDEAD_BEEF]);
        assert_eq!(
            manifest.check(0, b"hash-block-zero-content"),
            Some(false)
        );

        let manifest = CrcManifest::build(vec![actual_crc]);
        assert_eq!(
            manifest.check(0, b"hash-block-zero-content"),
            Some(true)
        );
    }

    #[test]
    fn check_returns_none_for_out_of_range_index() {
        let manifest = sample_manifest();
        assert_eq!(manifest.check(99, b"whatever"), None);
    }

    #[test]
    fn master_crc_round_trips_through_bytes() {
        let manifest = sample_manifest();
        let expected = manifest.master_crc();
        let parsed = CrcManifest::parse(&manifest.to_bytes()).unwrap();
        assert_eq!(parsed.master_crc(), expected);
    }

    #[test]
    fn quick_check_candidates_always_includes_block_zero_when_complete() {
        let blocks_per_hash_block = (HASH_BLOCK_SIZE / BLOCK_SIZE) as u64;
        let manifest = CrcManifest::build(vec![0; 5]);
        let virtual_size = blocks_per_hash_block * BLOCK_SIZE * 5;
        let mut cache_map = CacheMap::new(virtual_size);
        cache_map.mark(0, virtual_size, true);

        let mut rng = rand::rng();
        let candidates = manifest.quick_check_candidates(&cache_map, &mut rng);
        assert!(candidates.contains(&0));
        assert!(candidates.len() <= 4);
    }

    #[test]
    fn quick_check_candidates_skip_incomplete_hash_blocks() {
        let blocks_per_hash_block = (HASH_BLOCK_SIZE / BLOCK_SIZE) as u64;
        let manifest = CrcManifest::build(vec![0; 2]);
        let virtual_size = blocks_per_hash_block * BLOCK_SIZE * 2;
        // Only hash-block 0 is complete; hash-block 1 stays untouched.
        let mut cache_map = CacheMap::new(virtual_size);
        cache_map.mark(0, blocks_per_hash_block * BLOCK_SIZE, true);

        let mut rng = rand::rng();
        let candidates = manifest.quick_check_candidates(&cache_map, &mut rng);
        assert_eq!(candidates, vec![0]);
    }

    #[test]
    fn quick_check_candidates_when_complete_does_not_need_a_cache_map() {
        let manifest = CrcManifest::build(vec![0; 10]);
        let mut rng = rand::rng();
        let candidates = manifest.quick_check_candidates_when_complete(&mut rng);
        assert!(candidates.contains(&0));
        assert!(candidates.len() <= 4);
        assert!(candidates.iter().all(|&hb| hb < 10));
    }
}
