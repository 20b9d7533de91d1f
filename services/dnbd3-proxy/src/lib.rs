//! dnbd3 Proxy Core
//!
//! A read-only network block device proxy: caches remote disk images on
//! local storage, fills cache misses from an upstream alt-server, and
//! re-exports whatever is locally complete to its own clients.
//!
//! ## Architecture
//!
//! ```text
//! Server (TCP listener)
//! ├── ImageRegistry           (name+revision → Image, ref counted)
//! │   └── Image.state.uplink  (one uplink worker per incomplete image)
//! │       └── alt-server RTT probe loop (per uplink)
//! ├── AltServerRegistry       (shared candidate table)
//! ├── IntegrityHandle         (actor: hash-block CRC re-verification)
//! └── Reaper                 (disk-space eviction, called before a clone)
//! ```
//!
//! ## Modules
//!
//! - `actors`: generic actor framework, used by the integrity checker
//! - `altserver`: alt-server candidate table and RTT probe/switch loop
//! - `config`: process configuration and the `alt-servers` file format
//! - `image`: on-disk layout, cache-map, CRC manifest, registry
//! - `integrity`: background hash-block re-verification
//! - `reaper`: disk-space eviction of idle images
//! - `server`: client-facing TCP listener and per-connection protocol
//! - `uplink`: per-image upstream request multiplexer
//! - `wire`: the dnbd3 wire protocol

pub mod actors;
pub mod altserver;
pub mod config;
pub mod image;
pub mod integrity;
pub mod reaper;
pub mod server;
pub mod uplink;
pub mod wire;

pub use config::Config;
pub use image::{Image, ImageRegistry};
pub use integrity::IntegrityHandle;
pub use reaper::Reaper;
pub use server::Server;
