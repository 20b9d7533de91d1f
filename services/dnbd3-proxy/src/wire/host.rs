//! Re-export of the shared `Host` type for the `GET_SERVERS` payload.
//!
//! The actual `server_entry` encoding lives in `dnbd3-networking` since the
//! alt-server registry's closeness scoring needs the same type without
//! depending on this crate.

pub use dnbd3_networking::{Host, NetworkError, AF_INET, AF_INET6, HOST_WIRE_LEN};
