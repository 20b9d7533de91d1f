//! The Uplink Worker (§4.3): one per incomplete image, multiplexing client
//! read requests onto a single upstream TCP connection.

pub mod queue;
pub mod worker;

pub use queue::{EntryStatus, QueueEntry, QueueError, UplinkQueue, DEFAULT_CAPACITY};
pub use worker::{spawn, UplinkError, UplinkHandle};
