//! The `Image` type: one immutable revision of a named disk image plus the
//! mutable cache state layered on top of it.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::fs::File;
use tokio::sync::RwLock;

use dnbd3_id::ImageId;

use super::cache_map::CacheMap;
use super::manifest::CrcManifest;
use crate::uplink::UplinkHandle;

/// 4 KiB, the unit the cache-map tracks.
pub const BLOCK_SIZE: u64 = 4096;

/// Round a real file size up to the next 4 KiB boundary.
pub fn virtual_size_for(real_size: u64) -> u64 {
    real_size.div_ceil(BLOCK_SIZE) * BLOCK_SIZE
}

/// Mutable state attached to an image: everything that changes after load,
/// guarded by the per-image lock in the lock hierarchy (registry lock →
/// per-image lock → integrity-queue lock → ...).
pub struct ImageState {
    pub is_working: bool,
    pub last_access: Instant,
    pub last_verified: Option<Instant>,
    pub cache_map: Option<CacheMap>,
    pub manifest: Option<CrcManifest>,
    pub fd: Option<File>,
    pub uplink: Option<UplinkHandle>,
    /// Cached completeness-estimate percentage and when it was computed,
    /// refreshed on a jittered 8-40s interval per §4.2.
    pub completeness_cache: Option<(u8, Instant)>,
}

impl ImageState {
    fn new() -> Self {
        Self {
            is_working: true,
            last_access: Instant::now(),
            last_verified: None,
            cache_map: None,
            manifest: None,
            fd: None,
            uplink: None,
            completeness_cache: None,
        }
    }
}

/// One immutable revision of a named disk image.
///
/// The identifying fields (`id`, `name`, `revision`, `real_size`,
/// `virtual_size`, `master_crc`) never change after construction. Everything
/// that does change lives behind [`ImageState`] so the per-image lock
/// protects exactly the fields the spec's invariants talk about.
pub struct Image {
    pub id: ImageId,
    pub name: String,
    pub revision: u16,
    pub real_size: u64,
    pub virtual_size: u64,
    pub master_crc: u32,
    pub path: PathBuf,

    ref_count: AtomicU64,
    /// Fast-path flag mirroring `state.is_working`, readable without the
    /// per-image lock for the registry's `get()` not-working short-circuit.
    is_working_hint: AtomicBool,

    pub state: RwLock<ImageState>,
}

impl Image {
    pub fn new(
        id: ImageId,
        name: String,
        revision: u16,
        real_size: u64,
        master_crc: u32,
        path: PathBuf,
    ) -> Self {
        Self {
            id,
            name,
            revision,
            real_size,
            virtual_size: virtual_size_for(real_size),
            master_crc,
            path,
            ref_count: AtomicU64::new(0),
            is_working_hint: AtomicBool::new(true),
            state: RwLock::new(ImageState::new()),
        }
    }

    /// Acquire a counted reference. Pairs with [`Image::release`].
    pub fn acquire(&self) -> u64 {
        self.ref_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Release a counted reference, returning the new count. A caller
    /// observing `0` and knowing the image is no longer in the registry
    /// slot is responsible for freeing it (closing the fd, dropping the
    /// cache-map and manifest, shutting down the uplink).
    pub fn release(&self) -> u64 {
        self.ref_count.fetch_sub(1, Ordering::AcqRel) - 1
    }

    pub fn ref_count(&self) -> u64 {
        self.ref_count.load(Ordering::Acquire)
    }

    pub fn is_working(&self) -> bool {
        self.is_working_hint.load(Ordering::Acquire)
    }

    pub fn mark_not_working(&self) {
        self.is_working_hint.store(false, Ordering::Release);
    }

    pub fn mark_working(&self) {
        self.is_working_hint.store(true, Ordering::Release);
    }

    /// Number of hash-blocks ([`super::manifest::HASH_BLOCK_SIZE`]-sized
    /// units) this image's virtual size spans.
    pub fn hash_block_count(&self) -> u64 {
        self.virtual_size.div_ceil(super::manifest::HASH_BLOCK_SIZE)
    }

    pub fn file_name(&self) -> String {
        format!("{}.r{}", self.name, self.revision)
    }

    /// Deterministic per-image jitter within `[COMPLETENESS_CACHE_MIN,
    /// COMPLETENESS_CACHE_MAX]`, so that many images don't refresh their
    /// completeness estimate in lockstep (§4.2).
    fn completeness_cache_ttl(&self) -> Duration {
        let mut hasher = DefaultHasher::new();
        self.id.hash(&mut hasher);
        let span_ms = (COMPLETENESS_CACHE_MAX - COMPLETENESS_CACHE_MIN).as_millis() as u64;
        let jitter_ms = hasher.finish() % span_ms.max(1);
        COMPLETENESS_CACHE_MIN + Duration::from_millis(jitter_ms)
    }

    /// Completeness-estimate percentage for status reporting (§4.2),
    /// refreshed at most once per jittered 8-40s window. `100` once the
    /// cache-map has been freed (image fully present).
    pub async fn completeness_percent(&self) -> u8 {
        let mut state = self.state.write().await;
        let Some(cache_map) = state.cache_map.as_ref() else {
            return 100;
        };
        if let Some((value, at)) = state.completeness_cache {
            if at.elapsed() < self.completeness_cache_ttl() {
                return value;
            }
        }
        let value = cache_map.completeness_estimate();
        state.completeness_cache = Some((value, Instant::now()));
        value
    }
}

/// Jitter window for the completeness-estimate cache, per §4.2.
pub const COMPLETENESS_CACHE_MIN: Duration = Duration::from_secs(8);
pub const COMPLETENESS_CACHE_MAX: Duration = Duration::from_secs(40);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn virtual_size_rounds_up_to_block_boundary() {
        assert_eq!(virtual_size_for(9000), 12288);
        assert_eq!(virtual_size_for(4096), 4096);
        assert_eq!(virtual_size_for(4097), 8192);
        assert_eq!(virtual_size_for(0), 0);
    }

    #[test]
    fn ref_counting_round_trips() {
        let image = Image::new(
            ImageId::new(),
            "win10/enterprise".to_string(),
            3,
            9000,
            0,
            PathBuf::from("/tmp/win10.r3"),
        );
        assert_eq!(image.ref_count(), 0);
        assert_eq!(image.acquire(), 1);
        assert_eq!(image.acquire(), 2);
        assert_eq!(image.release(), 1);
        assert_eq!(image.release(), 0);
    }

    #[test]
    fn hash_block_count_matches_virtual_size() {
        let image = Image::new(
            ImageId::new(),
            "big".to_string(),
            1,
            32 * 1024 * 1024,
            0,
            PathBuf::from("/tmp/big.r1"),
        );
        assert_eq!(image.hash_block_count(), 2);
    }

    #[tokio::test]
    async fn completeness_percent_is_100_once_cache_map_is_freed() {
        let image = Image::new(
            ImageId::new(),
            "win10".to_string(),
            1,
            4096,
            0,
            PathBuf::from("/tmp/win10.r1"),
        );
        assert_eq!(image.completeness_percent().await, 100);
    }

    #[tokio::test]
    async fn completeness_percent_reflects_cache_map_and_caches_the_result() {
        use super::super::cache_map::CacheMap;

        let image = Image::new(
            ImageId::new(),
            "win10".to_string(),
            1,
            16384,
            0,
            PathBuf::from("/tmp/win10.r1"),
        );
        {
            let mut state = image.state.write().await;
            let mut cache_map = CacheMap::new(image.virtual_size);
            cache_map.mark(0, image.virtual_size, true);
            state.cache_map = Some(cache_map);
        }

        assert_eq!(image.completeness_percent().await, 100);
        let state = image.state.read().await;
        assert!(state.completeness_cache.is_some());
    }
}
