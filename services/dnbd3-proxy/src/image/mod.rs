//! The image cache-and-replication engine: on-disk layout, cache-map,
//! CRC manifest, and the registry that owns image lifetimes (§3, §4.1, §4.2).

pub mod backing;
pub mod cache_map;
pub mod manifest;
pub mod model;
pub mod registry;

pub use cache_map::CacheMap;
pub use manifest::{CrcManifest, ManifestError, HASH_BLOCK_SIZE};
pub use model::{virtual_size_for, Image, ImageState, BLOCK_SIZE};
pub use registry::{ImageError, ImageRef, ImageRegistry};
