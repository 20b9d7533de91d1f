//! Typed ID definitions for dnbd3 proxy runtime objects.
//!
//! None of these IDs are persisted to disk; they exist only to disambiguate
//! log lines and internal maps for the lifetime of one proxy process.

use crate::define_id;

/// Runtime identifier for a loaded image handle.
///
/// Reassigned on every load, even when reloading the same name+revision, so
/// that log lines from before and after a reload scan are never confused.
define_id!(ImageId, "img");

/// Identifier for one uplink worker's lifetime, used to correlate its log
/// lines across reconnects to different alt-servers.
define_id!(UplinkId, "up");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_id_roundtrips_through_display_and_parse() {
        let id = ImageId::new();
        let rendered = id.to_string();
        let parsed: ImageId = rendered.parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn image_id_rejects_foreign_prefix() {
        let uplink_id = UplinkId::new();
        let err = ImageId::parse(&uplink_id.to_string()).unwrap_err();
        assert!(err.is_prefix_error());
    }

    #[test]
    fn image_id_is_time_ordered() {
        let first = ImageId::new();
        let second = ImageId::new();
        assert!(first.timestamp_ms() <= second.timestamp_ms());
    }
}
