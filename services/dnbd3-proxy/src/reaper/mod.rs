//! The Disk-Space Reaper (§4.7): evicts least-recently-used images when
//! free space on the base path drops below a requested size.
//!
//! Grounded on `image::cache::ImageCache::evict`'s "collect candidates
//! under read lock, sort by last-access, evict until under target" shape,
//! generalized from a byte-budget cache size to a free-disk-space query
//! (via `statvfs`) and the registry's name+revision keyed images.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::config::Config;
use crate::image::{Image, ImageRegistry};

/// Reaping stops after this many images per pass regardless of whether the
/// free-space target was reached (§4.7: "repeats up to 20 times").
const MAX_REAPS_PER_PASS: usize = 20;

/// An image must have sat idle this long before it is reap-eligible,
/// relaxed entirely in sparse-files mode (§4.7).
const MIN_IDLE_AGE: Duration = Duration::from_secs(24 * 3600);

#[derive(Debug, Error)]
pub enum ReaperError {
    #[error("statvfs failed: {0}")]
    Statvfs(#[from] nix::errno::Errno),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub struct Reaper {
    registry: Arc<ImageRegistry>,
    config: Arc<Config>,
}

impl Reaper {
    pub fn new(registry: Arc<ImageRegistry>, config: Arc<Config>) -> Self {
        Self { registry, config }
    }

    /// Free space on the base path, in bytes.
    pub fn free_space_bytes(&self) -> Result<u64, ReaperError> {
        free_space_bytes(&self.config.base_path)
    }

    /// Ensure at least `requested` bytes are free, reaping up to
    /// [`MAX_REAPS_PER_PASS`] least-recently-used eligible images. Returns
    /// the number of bytes freed. Called before accepting a new
    /// replication request (§4.7).
    pub async fn ensure_space(&self, requested: u64) -> Result<u64, ReaperError> {
        if self.free_space_bytes()? >= requested {
            return Ok(0);
        }

        let mut candidates = Vec::new();
        for image in self.registry.reap_candidates().await {
            let last_access = {
                let state = image.state.read().await;
                state.last_access
            };
            let idle_long_enough = self.config.sparse_files || last_access.elapsed() >= MIN_IDLE_AGE;
            if idle_long_enough {
                candidates.push((last_access, image));
            }
        }
        candidates.sort_by_key(|(last_access, _)| *last_access);

        let mut freed = 0u64;
        let mut reaped = 0usize;
        for (_, image) in candidates {
            if reaped >= MAX_REAPS_PER_PASS {
                break;
            }
            if self.free_space_bytes().unwrap_or(0) >= requested {
                break;
            }

            let size = image.real_size;
            self.registry.remove(image.id).await;
            if let Err(err) = remove_image_files(&image).await {
                warn!(
                    image_id = %image.id,
                    name = %image.name,
                    error = %err,
                    "failed to unlink reaped image's files"
                );
            }

            info!(
                image_id = %image.id,
                name = %image.name,
                revision = image.revision,
                size,
                "reaped image for disk space"
            );
            freed += size;
            reaped += 1;
        }

        Ok(freed)
    }

    /// Periodically ensure `low_water_mark` bytes stay free, in the shape of
    /// the teacher's heartbeat loop (interval tick, logged failures, runs
    /// until shutdown fires).
    pub async fn run_loop(
        self: Arc<Self>,
        check_interval: Duration,
        low_water_mark: u64,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(check_interval);
        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("disk-space reaper shutting down");
                        return;
                    }
                }
                _ = ticker.tick() => {
                    match self.ensure_space(low_water_mark).await {
                        Ok(0) => {}
                        Ok(freed) => info!(freed, "disk-space reaper freed space"),
                        Err(err) => warn!(error = %err, "disk-space reaper pass failed"),
                    }
                }
            }
        }
    }
}

fn free_space_bytes(base_path: &Path) -> Result<u64, ReaperError> {
    let stat = nix::sys::statvfs::statvfs(base_path)?;
    Ok(stat.blocks_available() as u64 * stat.fragment_size() as u64)
}

/// Unlink an image's backing file and its `.map`/`.crc`/`.meta` sidecars.
/// Missing files are not an error — the reaper may race a prior partial
/// cleanup.
async fn remove_image_files(image: &Image) -> std::io::Result<()> {
    let path = &image.path;
    remove_if_present(path).await?;
    remove_if_present(&path.with_extension("map")).await?;
    remove_if_present(&path.with_extension("crc")).await?;
    remove_if_present(&path.with_extension("meta")).await?;
    Ok(())
}

async fn remove_if_present(path: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    use dnbd3_id::ImageId;

    fn test_config() -> Arc<Config> {
        Arc::new(Config {
            base_path: std::env::temp_dir(),
            ..Config::default()
        })
    }

    #[tokio::test]
    async fn ensure_space_is_a_noop_when_already_satisfied() {
        let registry = Arc::new(ImageRegistry::new(test_config(), crate::integrity::test_handle()));
        let reaper = Reaper::new(registry, test_config());
        // The temp dir always has some free space; request a tiny amount
        // so the check passes without touching the (empty) registry.
        let freed = reaper.ensure_space(1).await.unwrap();
        assert_eq!(freed, 0);
    }

    #[tokio::test]
    async fn reap_candidates_skip_recently_accessed_images_outside_sparse_mode() {
        let config = Arc::new(Config {
            base_path: std::env::temp_dir(),
            sparse_files: false,
            ..Config::default()
        });
        let registry = Arc::new(ImageRegistry::new(config.clone(), crate::integrity::test_handle()));
        let image = Image::new(
            ImageId::new(),
            "fresh".to_string(),
            1,
            4096,
            0,
            PathBuf::from("/tmp/dnbd3-reaper-test-fresh.r1"),
        );
        let reference = registry.register_proxy_shell(image).await.unwrap();
        registry.release(reference).await;

        // Just-registered image has a fresh last_access; in non-sparse mode
        // it is not yet 24h idle, so it must not appear as a candidate.
        let candidates = registry.reap_candidates().await;
        assert_eq!(candidates.len(), 1);
        let state = candidates[0].state.read().await;
        assert!(state.last_access.elapsed() < MIN_IDLE_AGE);
    }
}
