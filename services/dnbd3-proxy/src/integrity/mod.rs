//! The Integrity Checker (§4.6): a bounded work queue that re-verifies a
//! hash-block's CRC-32 whenever the cache-map marks it complete, clearing
//! and requeueing it for replication on mismatch.
//!
//! Implemented as an [`Actor`] since its "bounded mailbox, one job at a
//! time, dedup on enqueue" shape is exactly what the kept actor framework's
//! mailbox already gives for free — no bespoke `tokio::select!` loop needed
//! here, unlike `uplink::worker`.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::{debug, warn};

use dnbd3_id::ImageId;

use crate::actors::{Actor, ActorContext, ActorError, ActorHandle};
use crate::image::{backing, CrcManifest};
use crate::image::model::Image;

/// Mailbox size for the integrity checker; generous since jobs are cheap to
/// queue and the dedup set keeps it from growing unbounded under repeats.
const MAILBOX_SIZE: usize = 256;

/// One hash-block due for re-verification.
#[derive(Clone)]
pub struct VerifyJob {
    image: Arc<Image>,
    hash_block_idx: u64,
}

impl std::fmt::Debug for VerifyJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VerifyJob")
            .field("image_id", &self.image.id)
            .field("name", &self.image.name)
            .field("revision", &self.image.revision)
            .field("hash_block_idx", &self.hash_block_idx)
            .finish()
    }
}

/// Shared dedup key set: an `(image id, hash-block index)` pair present
/// here is already queued or being processed, so a second `mark` of the
/// same hash-block before it drains does not enqueue a duplicate job.
type DedupSet = Arc<Mutex<HashSet<(ImageId, u64)>>>;

pub struct Checker {
    dedup: DedupSet,
}

impl Checker {
    fn new(dedup: DedupSet) -> Self {
        Self { dedup }
    }
}

#[async_trait]
impl Actor for Checker {
    type Message = VerifyJob;

    fn name(&self) -> &str {
        "integrity-checker"
    }

    async fn handle(&mut self, job: VerifyJob, _ctx: &mut ActorContext) -> Result<bool, ActorError> {
        let key = (job.image.id, job.hash_block_idx);
        let result = verify_one(&job.image, job.hash_block_idx).await;
        self.dedup.lock().unwrap().remove(&key);

        match result {
            Ok(true) => debug!(
                image_id = %job.image.id,
                hash_block = job.hash_block_idx,
                "hash-block verified"
            ),
            Ok(false) => {
                warn!(
                    image_id = %job.image.id,
                    name = %job.image.name,
                    hash_block = job.hash_block_idx,
                    "hash-block CRC mismatch, clearing cache-map range for re-fetch"
                );
                let blocks_per_hash_block = crate::image::HASH_BLOCK_SIZE / crate::image::BLOCK_SIZE;
                let start_offset = job.hash_block_idx * crate::image::HASH_BLOCK_SIZE;
                let mut state = job.image.state.write().await;
                if let Some(cache_map) = state.cache_map.as_mut() {
                    let len = blocks_per_hash_block * crate::image::BLOCK_SIZE;
                    cache_map.mark(start_offset, len, false);
                }
            }
            Err(err) => {
                warn!(image_id = %job.image.id, hash_block = job.hash_block_idx, error = %err, "integrity read failed");
            }
        }

        Ok(true)
    }
}

async fn verify_one(image: &Arc<Image>, hash_block_idx: u64) -> std::io::Result<bool> {
    let manifest = {
        let state = image.state.read().await;
        state.manifest.clone()
    };
    let Some(manifest) = manifest else {
        return Ok(true);
    };
    let Some(expected) = manifest_expected(&manifest, hash_block_idx) else {
        return Ok(true);
    };
    let data = backing::read_hash_block(image, hash_block_idx).await?;
    Ok(CrcManifest::crc_of(&data) == expected)
}

fn manifest_expected(manifest: &CrcManifest, hash_block_idx: u64) -> Option<u32> {
    manifest.expected_crc(hash_block_idx)
}

/// Handle given to every uplink worker and the manifest load-time quick
/// check for enqueuing a hash-block verification.
#[derive(Clone)]
pub struct IntegrityHandle {
    handle: ActorHandle<VerifyJob>,
    dedup: DedupSet,
}

impl IntegrityHandle {
    /// Spawn the checker actor under `supervisor` and return a handle to it.
    pub fn spawn(supervisor: &mut crate::actors::Supervisor) -> Self {
        let dedup = Arc::new(Mutex::new(HashSet::new()));
        let checker = Checker::new(dedup.clone());
        let handle = supervisor.spawn(checker, MAILBOX_SIZE);
        Self { handle, dedup }
    }

    /// Enqueue a hash-block for verification, skipping if one is already
    /// queued or in flight for the same `(image, hash-block)` pair.
    pub fn enqueue(&self, image: Arc<Image>, hash_block_idx: u64) {
        let key = (image.id, hash_block_idx);
        {
            let mut dedup = self.dedup.lock().unwrap();
            if !dedup.insert(key) {
                return;
            }
        }
        if self
            .handle
            .try_send(VerifyJob {
                image,
                hash_block_idx,
            })
            .is_err()
        {
            self.dedup.lock().unwrap().remove(&key);
        }
    }
}

/// Spawn a throwaway checker for tests elsewhere in the crate (e.g. the
/// image registry's load-path tests) that need an `IntegrityHandle` but
/// don't care about its supervisor's lifetime.
#[cfg(test)]
pub(crate) fn test_handle() -> IntegrityHandle {
    let (_shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let mut supervisor = crate::actors::Supervisor::new(crate::actors::RestartPolicy::default(), shutdown_rx);
    IntegrityHandle::spawn(&mut supervisor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tokio::sync::watch;

    use crate::image::CacheMap;

    fn test_image() -> Arc<Image> {
        Arc::new(Image::new(
            ImageId::new(),
            "win10".to_string(),
            1,
            16 * 1024 * 1024,
            0,
            PathBuf::from("/tmp/integrity-test.r1"),
        ))
    }

    #[tokio::test]
    async fn verify_one_passes_when_no_manifest_is_loaded() {
        let image = test_image();
        // No manifest loaded: nothing to check against, treated as OK.
        let (_shutdown_tx, _shutdown_rx) = watch::channel(false);
        // verify_one reads the backing file; point it at a file that does
        // not exist and confirm the "no manifest" short-circuit still
        // returns Ok(true) without touching disk.
        let result = verify_one(&image, 0).await;
        assert!(result.unwrap());
    }

    #[tokio::test]
    async fn dedup_prevents_a_second_enqueue_before_the_first_drains() {
        let dedup: DedupSet = Arc::new(Mutex::new(HashSet::new()));
        let image = test_image();
        let key = (image.id, 0u64);
        assert!(dedup.lock().unwrap().insert(key));
        assert!(!dedup.lock().unwrap().insert(key));
    }

    #[tokio::test]
    async fn manifest_mismatch_clears_the_hash_blocks_cache_map_range() {
        let image = test_image();
        {
            let mut state = image.state.write().await;
            state.cache_map = Some(CacheMap::new(image.virtual_size));
            state.cache_map.as_mut().unwrap().mark(0, image.virtual_size, true);
            state.manifest = Some(CrcManifest::build(vec![0xDEAD_BEEF]));
        }

        // Directly exercise the mismatch branch's cache-map clearing logic
        // the way `handle` does, without needing a running actor mailbox.
        let mut state = image.state.write().await;
        if let Some(cache_map) = state.cache_map.as_mut() {
            cache_map.mark(0, crate::image::HASH_BLOCK_SIZE, false);
        }
        drop(state);

        let state = image.state.read().await;
        assert!(!state.cache_map.as_ref().unwrap().is_block_present(0));
    }
}
