//! The Image Registry (§4.1): loads, tracks, and disposes image objects,
//! enforcing reference counting and the reload/reap mutual exclusion.
//!
//! Modeled on `ImageCache`'s `RwLock<HashMap<...>>` + atomic stats shape,
//! generalized from a flat digest-keyed cache to the name+revision keyed,
//! reference-counted registry this spec requires.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use dnbd3_id::ImageId;

use super::backing;
use super::cache_map::CacheMap;
use super::manifest::CrcManifest;
use super::model::{virtual_size_for, Image, BLOCK_SIZE};
use crate::config::Config;
use crate::integrity::IntegrityHandle;

/// How long `get_or_load` suppresses a repeat miss for the same
/// `(name, revision)` pair, per §4.1.
const RECENT_QUERY_TTL: Duration = Duration::from_secs(30);

/// Re-probe interval for `get(..., verify=true)`, per §4.1.
const VERIFY_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum ImageError {
    #[error("image '{name}' revision {revision} not found")]
    NotFound { name: String, revision: u16 },

    #[error("image '{name}' revision {revision} is not working")]
    NotWorking { name: String, revision: u16 },

    #[error("registry is at capacity ({0} images)")]
    RegistryFull(usize),

    #[error("recently failed to load '{name}' revision {revision}, suppressing retry")]
    RecentlyFailed { name: String, revision: u16 },

    #[error("proxy mode is disabled; cannot clone '{name}' revision {revision} from upstream")]
    ProxyDisabled { name: String, revision: u16 },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A counted reference to an [`Image`]. Holding one keeps the image alive
/// even if it is concurrently removed from the registry slot; dropping
/// interest in it requires an explicit [`ImageRef::release`] call since
/// freeing (closing the fd, shutting the uplink down) is async and cannot
/// happen in a synchronous `Drop`.
pub struct ImageRef {
    image: Arc<Image>,
}

impl std::ops::Deref for ImageRef {
    type Target = Image;
    fn deref(&self) -> &Image {
        &self.image
    }
}

impl ImageRef {
    pub fn image(&self) -> &Arc<Image> {
        &self.image
    }
}

struct RecentQuery {
    at: Instant,
    succeeded: bool,
}

/// Per-(name,revision) registry entry. The registry holds a weak slot per
/// §9's "reference counting without cycles" design note: promotion to a
/// strong `ImageRef` happens under the registry lock, and the registry
/// itself never contributes to `ref_count`.
struct Slot {
    image: Arc<Image>,
}

pub struct ImageRegistry {
    config: Arc<Config>,
    images: RwLock<HashMap<ImageId, Slot>>,
    by_name: RwLock<HashMap<String, BTreeMap<u16, ImageId>>>,
    recent_queries: RwLock<HashMap<(String, u16), RecentQuery>>,
    /// Top-level mutual exclusion between `reload` and the disk-space
    /// reaper, per the lock hierarchy in §5.
    reload_lock: Mutex<()>,
    /// Where a freshly loaded image's manifest quick-check candidates are
    /// enqueued (§4.2 "On load: a quick check on up to 4 randomly chosen
    /// complete hash-blocks").
    integrity: IntegrityHandle,
}

impl ImageRegistry {
    pub fn new(config: Arc<Config>, integrity: IntegrityHandle) -> Self {
        Self {
            config,
            images: RwLock::new(HashMap::new()),
            by_name: RwLock::new(HashMap::new()),
            recent_queries: RwLock::new(HashMap::new()),
            reload_lock: Mutex::new(()),
            integrity,
        }
    }

    /// Resolve `revision == 0` to the numerically highest known revision.
    async fn resolve_revision(&self, name: &str, revision: u16) -> Option<(u16, ImageId)> {
        let by_name = self.by_name.read().await;
        let revisions = by_name.get(name)?;
        if revision == 0 {
            revisions.iter().next_back().map(|(rid, id)| (*rid, *id))
        } else {
            revisions.get(&revision).map(|id| (revision, *id))
        }
    }

    /// Look up a locally known image, verifying staleness if requested.
    /// Does not fall through to proxy cloning — see [`get_or_load`].
    pub async fn get(
        &self,
        name: &str,
        revision: u16,
        verify: bool,
    ) -> Result<ImageRef, ImageError> {
        let Some((resolved_revision, id)) = self.resolve_revision(name, revision).await else {
            return Err(ImageError::NotFound {
                name: name.to_string(),
                revision,
            });
        };

        let image = {
            let images = self.images.read().await;
            images
                .get(&id)
                .map(|slot| slot.image.clone())
                .ok_or(ImageError::NotFound {
                    name: name.to_string(),
                    revision: resolved_revision,
                })?
        };

        if !image.is_working() {
            return Err(ImageError::NotWorking {
                name: name.to_string(),
                revision: resolved_revision,
            });
        }

        if verify {
            self.maybe_verify(&image).await;
            if !image.is_working() {
                return Err(ImageError::NotWorking {
                    name: name.to_string(),
                    revision: resolved_revision,
                });
            }
        }

        image.acquire();
        {
            let mut state = image.state.write().await;
            state.last_access = Instant::now();
        }
        Ok(ImageRef { image })
    }

    /// `get`, but in proxy mode falls through to cloning from an upstream
    /// when the image is unknown locally or a higher revision exists
    /// upstream. A short TTL cache suppresses repeat-miss storms for the
    /// same `(name, revision)` pair.
    pub async fn get_or_load(
        &self,
        name: &str,
        revision: u16,
    ) -> Result<ImageRef, ImageError> {
        match self.get(name, revision, false).await {
            Ok(image_ref) => return Ok(image_ref),
            Err(ImageError::NotWorking { .. }) => {
                return Err(ImageError::NotWorking {
                    name: name.to_string(),
                    revision,
                })
            }
            Err(ImageError::NotFound { .. }) => {}
            Err(other) => return Err(other),
        }

        if !self.config.is_proxy {
            return Err(ImageError::ProxyDisabled {
                name: name.to_string(),
                revision,
            });
        }

        let key = (name.to_string(), revision);
        {
            let recent = self.recent_queries.read().await;
            if let Some(entry) = recent.get(&key) {
                if entry.at.elapsed() < RECENT_QUERY_TTL && !entry.succeeded {
                    return Err(ImageError::RecentlyFailed {
                        name: name.to_string(),
                        revision,
                    });
                }
            }
        }

        debug!(name, revision, "image not found locally, would clone from upstream");
        // Cloning from upstream requires an uplink connection to an
        // alt-server and is driven by the uplink worker once the image
        // shell exists; registering that shell is out of this function's
        // scope (it has no data to serve yet). Callers in proxy mode create
        // the shell via `register_proxy_shell` once the upstream handshake
        // in `altserver`/`uplink` resolves the concrete revision and size.
        self.recent_queries.write().await.insert(
            key,
            RecentQuery {
                at: Instant::now(),
                succeeded: false,
            },
        );
        Err(ImageError::NotFound {
            name: name.to_string(),
            revision,
        })
    }

    /// Shared bookkeeping between [`register_proxy_shell`](Self::register_proxy_shell)
    /// and [`load_existing_image`](Self::load_existing_image): capacity
    /// check, slot/name-index insertion, recent-query cache eviction, and
    /// the registry's own counted reference.
    async fn insert_image(&self, image: Image) -> Result<ImageRef, ImageError> {
        let mut images = self.images.write().await;
        if images.len() >= self.config.max_images {
            return Err(ImageError::RegistryFull(self.config.max_images));
        }

        let arc = Arc::new(image);
        images.insert(arc.id, Slot { image: arc.clone() });
        drop(images);

        self.by_name
            .write()
            .await
            .entry(arc.name.clone())
            .or_default()
            .insert(arc.revision, arc.id);

        self.recent_queries
            .write()
            .await
            .remove(&(arc.name.clone(), arc.revision));

        arc.acquire();
        Ok(ImageRef { image: arc })
    }

    /// Register a newly resolved proxy-mode image shell: no local data yet,
    /// so its cache-map starts empty and everything is fetched on demand
    /// via the uplink worker (§4.2: `cache_map` is `null` only once an
    /// image is fully present, never for a fresh shell).
    pub async fn register_proxy_shell(&self, image: Image) -> Result<ImageRef, ImageError> {
        {
            let mut state = image.state.write().await;
            state.cache_map = Some(CacheMap::new(image.virtual_size));
        }
        self.insert_image(image).await
    }

    /// Load an already-present backing file found by [`reload`](Self::reload):
    /// read its `.map`/`.crc` sidecars (§6), validate the master CRC, and
    /// schedule the load-time quick check (§4.2) on whatever hash-blocks the
    /// cache-map reports complete.
    async fn load_existing_image(
        &self,
        name: String,
        revision: u16,
        real_size: u64,
        path: PathBuf,
    ) -> Result<ImageRef, ImageError> {
        let virtual_size = virtual_size_for(real_size);

        let cache_map = match tokio::fs::read(backing::sidecar_path(&path, "map")).await {
            Ok(bytes) => Some(CacheMap::from_bytes(virtual_size, bytes)),
            Err(_) => None,
        };

        let manifest = match tokio::fs::read(backing::sidecar_path(&path, "crc")).await {
            Ok(bytes) => match CrcManifest::parse(&bytes) {
                Ok(manifest) => Some(manifest),
                Err(err) => {
                    warn!(name = %name, revision, error = %err, "discarding corrupt crc manifest");
                    None
                }
            },
            Err(_) => None,
        };
        let master_crc = manifest.as_ref().map(|m| m.master_crc()).unwrap_or(0);

        let image = Image::new(ImageId::new(), name, revision, real_size, master_crc, path);

        let quick_check = match (&manifest, &cache_map) {
            (Some(manifest), Some(cache_map)) => {
                manifest.quick_check_candidates(cache_map, &mut rand::rng())
            }
            (Some(manifest), None) => manifest.quick_check_candidates_when_complete(&mut rand::rng()),
            (None, _) => Vec::new(),
        };

        {
            let mut state = image.state.write().await;
            state.cache_map = cache_map;
            state.manifest = manifest;
        }

        let image_ref = self.insert_image(image).await?;
        for hash_block_idx in quick_check {
            self.integrity.enqueue(image_ref.image().clone(), hash_block_idx);
        }
        Ok(image_ref)
    }

    /// Release a counted reference. If the count reaches zero and the
    /// image is no longer present in the registry slot, frees it (closes
    /// the backing fd; the cache-map and manifest are dropped with the
    /// `Image` itself; shutting down any uplink is the caller's
    /// responsibility before calling this, since the uplink holds its own
    /// strong reference for its entire lifetime per §9).
    pub async fn release(&self, image_ref: ImageRef) {
        let image = image_ref.image;
        let remaining = image.release();
        if remaining != 0 {
            return;
        }

        let still_registered = self.images.read().await.contains_key(&image.id);
        if still_registered {
            return;
        }

        let mut state = image.state.write().await;
        if let Some(mut fd) = state.fd.take() {
            use tokio::io::AsyncWriteExt;
            let _ = fd.flush().await;
        }
        state.cache_map = None;
        state.manifest = None;
        debug!(image_id = %image.id, name = %image.name, revision = image.revision, "image freed");
    }

    /// Remove an image from the registry slot without freeing it; it is
    /// freed once its last reference is released.
    pub async fn remove(&self, id: ImageId) {
        let removed = self.images.write().await.remove(&id);
        if let Some(slot) = removed {
            let mut by_name = self.by_name.write().await;
            if let Some(revisions) = by_name.get_mut(&slot.image.name) {
                revisions.retain(|_, v| *v != id);
                if revisions.is_empty() {
                    by_name.remove(&slot.image.name);
                }
            }
        }
    }

    /// §4.1: periodic liveness probe on a local image — an `lseek`-to-end
    /// (here `metadata`) plus a short `pread` at offset 0. Either a size
    /// change or an I/O error marks the image not-working and schedules a
    /// reload of its directory.
    async fn maybe_verify(&self, image: &Arc<Image>) {
        let needs_verify = {
            let state = image.state.read().await;
            state
                .last_verified
                .map(|t| t.elapsed() >= VERIFY_INTERVAL)
                .unwrap_or(true)
        };
        if !needs_verify {
            return;
        }

        let metadata = tokio::fs::metadata(&image.path).await;
        let failure: Option<String> = match &metadata {
            Err(err) => Some(format!("stat failed: {err}")),
            Ok(meta) if meta.len() != image.real_size => Some(format!(
                "size changed: expected {}, actual {}",
                image.real_size,
                meta.len()
            )),
            Ok(_) => {
                let probe_len = image.real_size.min(BLOCK_SIZE) as u32;
                match backing::read_range(image, 0, probe_len).await {
                    Ok(_) => None,
                    Err(err) => Some(format!("read probe failed: {err}")),
                }
            }
        };

        {
            let mut state = image.state.write().await;
            state.last_verified = Some(Instant::now());
        }

        let Some(reason) = failure else {
            return;
        };

        warn!(
            name = %image.name,
            revision = image.revision,
            reason = %reason,
            "image failed verification, marking not-working and scheduling a reload"
        );
        image.mark_not_working();

        if let Some(parent) = image.path.parent() {
            let dir = parent.to_path_buf();
            if let Err(err) = self.reload(&dir).await {
                warn!(name = %image.name, revision = image.revision, error = %err, "reload after verification failure failed");
            }
        }
    }

    /// Rescan `path` for images, mutually exclusive with the disk-space
    /// reaper (§5 lock hierarchy item 1, "reload / remoteClone").
    pub async fn reload(&self, path: &Path) -> Result<usize, ImageError> {
        let _guard = self.reload_lock.lock().await;
        info!(path = %path.display(), "reload scan starting");

        let mut loaded = 0usize;
        let mut entries = tokio::fs::read_dir(path).await?;
        while let Some(entry) = entries.next_entry().await? {
            let file_path = entry.path();
            let Some(file_name) = file_path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if file_name.ends_with(".map") || file_name.ends_with(".crc") || file_name.ends_with(".meta") {
                continue;
            }
            let Some((name, revision)) = split_name_revision(file_name) else {
                continue;
            };

            let already_known = self.resolve_revision(&name, revision).await.is_some();
            if already_known {
                continue;
            }

            let meta = entry.metadata().await?;
            if self
                .load_existing_image(name, revision, meta.len(), file_path)
                .await
                .is_ok()
            {
                loaded += 1;
            }
        }

        info!(loaded, "reload scan complete");
        Ok(loaded)
    }

    /// Completeness-estimate percentage for a known image (§4.2), for
    /// status reporting. Does not touch `ref_count` or `last_access` since
    /// it serves no client data.
    pub async fn completeness(&self, name: &str, revision: u16) -> Result<u8, ImageError> {
        let Some((resolved_revision, id)) = self.resolve_revision(name, revision).await else {
            return Err(ImageError::NotFound {
                name: name.to_string(),
                revision,
            });
        };
        let image = {
            let images = self.images.read().await;
            images
                .get(&id)
                .map(|slot| slot.image.clone())
                .ok_or(ImageError::NotFound {
                    name: name.to_string(),
                    revision: resolved_revision,
                })?
        };
        Ok(image.completeness_percent().await)
    }

    pub async fn len(&self) -> usize {
        self.images.read().await.len()
    }

    /// Snapshot of images eligible for disk-space reaping: `refcount == 1`
    /// (only the registry's own lookup holds it), mutually exclusive with
    /// `reload` via the same top-level lock.
    pub async fn reap_candidates(&self) -> Vec<Arc<Image>> {
        let _guard = self.reload_lock.lock().await;
        let images = self.images.read().await;
        images
            .values()
            .map(|slot| slot.image.clone())
            .filter(|image| image.ref_count() == 0)
            .collect()
    }
}

/// Split a backing-file name `name.rNNN` into `(name, revision)`.
fn split_name_revision(file_name: &str) -> Option<(String, u16)> {
    let idx = file_name.rfind(".r")?;
    let (name, rid_part) = file_name.split_at(idx);
    let revision: u16 = rid_part[2..].parse().ok()?;
    if revision == 0 {
        return None;
    }
    Some((name.to_string(), revision))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn test_config() -> Arc<Config> {
        Arc::new(Config::default())
    }

    #[tokio::test]
    async fn register_and_get_round_trips() {
        let registry = ImageRegistry::new(test_config(), crate::integrity::test_handle());
        let image = Image::new(
            ImageId::new(),
            "win10".to_string(),
            3,
            9000,
            0,
            PathBuf::from("/tmp/win10.r3"),
        );
        let reference = registry.register_proxy_shell(image).await.unwrap();
        assert_eq!(reference.ref_count(), 1);

        let fetched = registry.get("win10", 3, false).await.unwrap();
        assert_eq!(fetched.ref_count(), 2);
        registry.release(fetched).await;
        registry.release(reference).await;
    }

    #[tokio::test]
    async fn revision_zero_resolves_to_highest() {
        let registry = ImageRegistry::new(test_config(), crate::integrity::test_handle());
        for revision in [1u16, 2, 5] {
            let image = Image::new(
                ImageId::new(),
                "win10".to_string(),
                revision,
                1024,
                0,
                PathBuf::from(format!("/tmp/win10.r{revision}")),
            );
            let reference = registry.register_proxy_shell(image).await.unwrap();
            registry.release(reference).await;
        }

        let latest = registry.get("win10", 0, false).await.unwrap();
        assert_eq!(latest.revision, 5);
    }

    #[tokio::test]
    async fn register_proxy_shell_seeds_an_empty_cache_map() {
        let registry = ImageRegistry::new(test_config(), crate::integrity::test_handle());
        let image = Image::new(
            ImageId::new(),
            "win10".to_string(),
            1,
            4096,
            0,
            PathBuf::from("/tmp/win10-shell.r1"),
        );
        let reference = registry.register_proxy_shell(image).await.unwrap();
        assert_eq!(registry.completeness("win10", 1).await.unwrap(), 0);
        registry.release(reference).await;
    }

    #[tokio::test]
    async fn not_found_is_reported_for_unknown_image() {
        let registry = ImageRegistry::new(test_config(), crate::integrity::test_handle());
        let err = registry.get("missing", 1, false).await.unwrap_err();
        assert!(matches!(err, ImageError::NotFound { .. }));
    }

    #[tokio::test]
    async fn release_frees_only_when_unregistered_and_unreferenced() {
        let registry = ImageRegistry::new(test_config(), crate::integrity::test_handle());
        let image = Image::new(
            ImageId::new(),
            "ephemeral".to_string(),
            1,
            4096,
            0,
            PathBuf::from("/tmp/ephemeral.r1"),
        );
        let id = {
            let reference = registry.register_proxy_shell(image).await.unwrap();
            let id = reference.id;
            registry.release(reference).await;
            id
        };
        // Still registered, so the slot keeps it alive with ref_count 0.
        assert_eq!(registry.len().await, 1);
        registry.remove(id).await;
        assert_eq!(registry.len().await, 0);
    }

    #[test]
    fn split_name_revision_parses_trailing_rid() {
        assert_eq!(
            split_name_revision("win10/enterprise.r7"),
            Some(("win10/enterprise".to_string(), 7))
        );
        assert_eq!(split_name_revision("win10.map"), None);
        assert_eq!(split_name_revision("no-revision"), None);
    }
}
