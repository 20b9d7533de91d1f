//! Process-wide configuration for the dnbd3 proxy.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;

/// dnbd3's conventional TCP port.
const DEFAULT_LISTEN_ADDRESS: &str = "0.0.0.0:5003";

pub mod alt_servers;

/// Proxy configuration, loaded once at startup from `DNBD3_*` environment
/// variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Root directory holding cached images, their `.map`/`.crc` sidecars,
    /// and the `alt-servers` file.
    pub base_path: PathBuf,

    /// Address the client-facing TCP listener binds to.
    pub listen_address: SocketAddr,

    /// Whether this instance forwards cache misses to an uplink server
    /// (`true`) or only serves what is already on disk (`false`).
    pub is_proxy: bool,

    /// Whether the uplink worker replicates a full image in the background
    /// once enough distinct clients have requested it.
    pub background_replication: bool,

    /// Minimum distinct clients within the replication window before
    /// background replication of an image starts.
    pub bgr_min_clients: u32,

    /// Whether newly created cache files are created sparse.
    pub sparse_files: bool,

    /// Timeout for a single uplink request before the uplink worker treats
    /// the upstream connection as dead and triggers a reconnect/switch.
    pub uplink_timeout: Duration,

    /// Idle timeout after which a client connection is dropped.
    pub client_timeout: Duration,

    /// Whether to close an image's backing file descriptor once its
    /// reference count drops to zero, instead of keeping it open.
    pub close_unused_fd: bool,

    /// Whether a reload scan removes `Image` entries whose backing file has
    /// disappeared from disk.
    pub remove_missing_images: bool,

    /// Hard cap on the number of distinct images tracked by the registry.
    pub max_images: usize,

    /// Cap on how many bytes of background replication may be in flight at
    /// once, across all images.
    pub max_replication_size: u64,

    /// Whether a proxy instance that is missing an image locally asks its
    /// own alt-servers for it instead of immediately failing the client.
    pub lookup_missing_for_proxy: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_path: PathBuf::from("/var/lib/dnbd3"),
            listen_address: DEFAULT_LISTEN_ADDRESS.parse().expect("valid default listen address"),
            is_proxy: false,
            background_replication: false,
            bgr_min_clients: 5,
            sparse_files: true,
            uplink_timeout: Duration::from_secs(5),
            client_timeout: Duration::from_secs(60),
            close_unused_fd: false,
            remove_missing_images: false,
            max_images: 5000,
            max_replication_size: 100 * 1024 * 1024 * 1024,
            lookup_missing_for_proxy: true,
        }
    }
}

impl Config {
    /// Load configuration from `DNBD3_*` environment variables, falling
    /// back to the defaults above for anything unset or unparsable.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let base_path = std::env::var("DNBD3_BASE_PATH")
            .ok()
            .map(PathBuf::from)
            .unwrap_or(defaults.base_path);

        let listen_address = std::env::var("DNBD3_LISTEN_ADDRESS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.listen_address);

        let is_proxy = env_bool("DNBD3_IS_PROXY", defaults.is_proxy);
        let background_replication =
            env_bool("DNBD3_BACKGROUND_REPLICATION", defaults.background_replication);
        let sparse_files = env_bool("DNBD3_SPARSE_FILES", defaults.sparse_files);
        let close_unused_fd = env_bool("DNBD3_CLOSE_UNUSED_FD", defaults.close_unused_fd);
        let remove_missing_images =
            env_bool("DNBD3_REMOVE_MISSING_IMAGES", defaults.remove_missing_images);
        let lookup_missing_for_proxy = env_bool(
            "DNBD3_LOOKUP_MISSING_FOR_PROXY",
            defaults.lookup_missing_for_proxy,
        );

        let uplink_timeout = std::env::var("DNBD3_UPLINK_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.uplink_timeout);

        let client_timeout = std::env::var("DNBD3_CLIENT_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.client_timeout);

        let max_images = std::env::var("DNBD3_MAX_IMAGES")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.max_images);

        let max_replication_size = std::env::var("DNBD3_MAX_REPLICATION_SIZE")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.max_replication_size);

        let bgr_min_clients = std::env::var("DNBD3_BGR_MIN_CLIENTS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.bgr_min_clients);

        Ok(Self {
            base_path,
            listen_address,
            is_proxy,
            background_replication,
            bgr_min_clients,
            sparse_files,
            uplink_timeout,
            client_timeout,
            close_unused_fd,
            remove_missing_images,
            max_images,
            max_replication_size,
            lookup_missing_for_proxy,
        })
    }

    /// Path to the `alt-servers` file, conventionally alongside the cache.
    pub fn alt_servers_path(&self) -> PathBuf {
        self.base_path.join("alt-servers")
    }
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .and_then(|s| match s.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Some(true),
            "0" | "false" | "no" | "off" => Some(false),
            _ => None,
        })
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = Config::default();
        assert!(!cfg.is_proxy);
        assert!(cfg.sparse_files);
        assert_eq!(cfg.max_images, 5000);
    }

    #[test]
    fn alt_servers_path_is_under_base_path() {
        let cfg = Config {
            base_path: PathBuf::from("/srv/dnbd3"),
            ..Config::default()
        };
        assert_eq!(cfg.alt_servers_path(), PathBuf::from("/srv/dnbd3/alt-servers"));
    }
}
