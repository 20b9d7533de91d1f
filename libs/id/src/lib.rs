//! # dnbd3-id
//!
//! Typed runtime identifiers used by the dnbd3 proxy core.
//!
//! ## Design principles
//!
//! - IDs are process-local and generated fresh on every load; they are never
//!   persisted and never compared across process restarts.
//! - All IDs have a canonical string representation with strict parsing,
//!   which makes them safe to embed in log lines.
//! - IDs are typed to prevent mixing an image handle with an uplink handle.
//!
//! ## ID format
//!
//! Every ID uses a prefixed format: `{prefix}_{ulid}`, e.g.
//! `img_01HV4Z2WQXKJNM8GPQY6VBKC3D`. The ULID component makes IDs
//! time-ordered, which is convenient when reading logs chronologically.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations.
pub use ulid::Ulid;
