//! Payload carried by a successful `SELECT_IMAGE` reply.

use bytes::{Buf, BufMut, BytesMut};

use super::proto::WireError;

/// Protocol version, length-prefixed name, the concrete revision the server
/// resolved "rid 0 means latest" to, and the image's virtual size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectImagePayload {
    pub protocol_version: u16,
    pub name: String,
    pub revision: u16,
    pub virtual_size: u64,
}

impl SelectImagePayload {
    pub fn encode(&self, buf: &mut BytesMut) {
        let name_bytes = self.name.as_bytes();
        buf.reserve(2 + 2 + name_bytes.len() + 2 + 8);
        buf.put_u16_le(self.protocol_version);
        buf.put_u16_le(name_bytes.len() as u16);
        buf.put_slice(name_bytes);
        buf.put_u16_le(self.revision);
        buf.put_u64_le(self.virtual_size);
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() < 4 {
            return Err(WireError::ShortRead {
                need: 4,
                have: buf.len(),
            });
        }
        let protocol_version = buf.get_u16_le();
        let name_len = buf.get_u16_le() as usize;
        if buf.len() < name_len + 2 + 8 {
            return Err(WireError::ShortRead {
                need: name_len + 2 + 8,
                have: buf.len(),
            });
        }
        let name = String::from_utf8_lossy(&buf[..name_len]).into_owned();
        buf.advance(name_len);
        let revision = buf.get_u16_le();
        let virtual_size = buf.get_u64_le();
        Ok(Self {
            protocol_version,
            name,
            revision,
            virtual_size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::proto::PROTOCOL_VERSION;

    #[test]
    fn round_trips_through_encode_decode() {
        let payload = SelectImagePayload {
            protocol_version: PROTOCOL_VERSION,
            name: "win10/enterprise".to_string(),
            revision: 7,
            virtual_size: 42 * 1024 * 1024 * 1024,
        };
        let mut buf = BytesMut::new();
        payload.encode(&mut buf);
        let decoded = SelectImagePayload::decode(&buf).unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn rejects_truncated_name() {
        let mut buf = BytesMut::new();
        buf.put_u16_le(PROTOCOL_VERSION);
        buf.put_u16_le(100);
        buf.put_slice(b"short");
        assert!(SelectImagePayload::decode(&buf).is_err());
    }
}
