//! Fixed-layout request/reply framing for the dnbd3 wire protocol.
//!
//! All multi-byte integers are little-endian on the wire except where noted
//! (the `server_entry` port field in [`crate::wire::host`] is network byte
//! order, per §6 of the protocol description).

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;

/// Magic constant for both requests and replies on little-endian machines.
pub const MAGIC: u16 = 0x7372;

/// Wire size of one [`Request`].
pub const REQUEST_LEN: usize = 24;
/// Wire size of one [`Reply`] header (payload, if any, follows).
pub const REPLY_LEN: usize = 16;

/// Request command: fetch a byte range of image data.
pub const CMD_GET_BLOCK: u16 = 1;
/// Request command: select an image by name/revision for this connection.
pub const CMD_SELECT_IMAGE: u16 = 2;
/// Request command: fetch the list of known alt-servers.
pub const CMD_GET_SERVERS: u16 = 3;
/// Reply command: carries a protocol-level error instead of payload.
pub const CMD_ERROR: u16 = 4;
/// Request/reply command: zero-length liveness ping.
pub const CMD_KEEPALIVE: u16 = 5;
/// Request command: fetch the CRC-32 manifest for the selected image.
pub const CMD_GET_CRC32: u16 = 8;

/// Errors decoding a wire frame.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("short read: need {need} bytes, have {have}")]
    ShortRead { need: usize, have: usize },

    #[error("bad magic: expected {MAGIC:#06x}, got {0:#06x}")]
    BadMagic(u16),

    #[error("payload size {0} exceeds the protocol maximum of {MAX_PAYLOAD}")]
    PayloadTooLarge(u32),
}

/// Cap on a single `GET_BLOCK`/reply payload; generous enough for one
/// hash-block but small enough to bound a misbehaving peer's memory ask.
pub const MAX_PAYLOAD: u32 = 16 * 1024 * 1024;

/// A 24-byte client→server request header.
///
/// `offset`'s high byte is reused on the wire as a hop counter for proxy
/// chains; [`Request::hops`] and [`Request::byte_offset`] split the two
/// out, since nothing upstream of this core ever needs the combined u64.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Request {
    pub cmd: u16,
    pub size: u32,
    raw_offset: u64,
    pub handle: u64,
}

impl Request {
    /// Build a request for any command. `byte_offset` is masked to 56 bits;
    /// the top byte is reserved for the hop counter (§6).
    pub fn new(cmd: u16, byte_offset: u64, size: u32, handle: u64) -> Self {
        Self {
            cmd,
            size,
            raw_offset: byte_offset & 0x00FF_FFFF_FFFF_FFFF,
            handle,
        }
    }

    pub fn new_get_block(byte_offset: u64, size: u32, handle: u64) -> Self {
        Self::new(CMD_GET_BLOCK, byte_offset, size, handle)
    }

    /// The offset with the hop-count byte masked off.
    pub fn byte_offset(&self) -> u64 {
        self.raw_offset & 0x00FF_FFFF_FFFF_FFFF
    }

    /// Hop counter carried in the offset field's high byte.
    pub fn hops(&self) -> u8 {
        (self.raw_offset >> 56) as u8
    }

    /// Returns a copy with the hop counter incremented by one, saturating.
    pub fn with_incremented_hop(mut self) -> Self {
        let hops = self.hops().saturating_add(1);
        self.raw_offset = self.byte_offset() | ((hops as u64) << 56);
        self
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.reserve(REQUEST_LEN);
        buf.put_u16_le(MAGIC);
        buf.put_u16_le(self.cmd);
        buf.put_u32_le(self.size);
        buf.put_u64_le(self.raw_offset);
        buf.put_u64_le(self.handle);
    }

    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() < REQUEST_LEN {
            return Err(WireError::ShortRead {
                need: REQUEST_LEN,
                have: buf.len(),
            });
        }
        let mut cur = buf;
        let magic = cur.get_u16_le();
        if magic != MAGIC {
            return Err(WireError::BadMagic(magic));
        }
        let cmd = cur.get_u16_le();
        let size = cur.get_u32_le();
        let raw_offset = cur.get_u64_le();
        let handle = cur.get_u64_le();
        Ok(Self {
            cmd,
            size,
            raw_offset,
            handle,
        })
    }
}

/// A 16-byte server→client reply header. The payload (if `size > 0`) is
/// read/written separately by the caller, since it can be arbitrarily large
/// (up to [`MAX_PAYLOAD`]) and callers stream it straight into a file or
/// client socket rather than buffering it here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplyHeader {
    pub cmd: u16,
    pub size: u32,
    pub handle: u64,
}

impl ReplyHeader {
    pub fn new(cmd: u16, size: u32, handle: u64) -> Self {
        Self { cmd, size, handle }
    }

    pub fn error(handle: u64) -> Self {
        Self {
            cmd: CMD_ERROR,
            size: 0,
            handle,
        }
    }

    pub fn keepalive() -> Self {
        Self {
            cmd: CMD_KEEPALIVE,
            size: 0,
            handle: 0,
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.reserve(REPLY_LEN);
        buf.put_u16_le(MAGIC);
        buf.put_u16_le(self.cmd);
        buf.put_u32_le(self.size);
        buf.put_u64_le(self.handle);
    }

    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() < REPLY_LEN {
            return Err(WireError::ShortRead {
                need: REPLY_LEN,
                have: buf.len(),
            });
        }
        let mut cur = buf;
        let magic = cur.get_u16_le();
        if magic != MAGIC {
            return Err(WireError::BadMagic(magic));
        }
        let cmd = cur.get_u16_le();
        let size = cur.get_u32_le();
        if size > MAX_PAYLOAD {
            return Err(WireError::PayloadTooLarge(size));
        }
        let handle = cur.get_u64_le();
        Ok(Self { cmd, size, handle })
    }
}

/// Minimum supported protocol version for alt-server handshakes (§4.5).
pub const MIN_PROTOCOL_VERSION: u16 = 2;
/// Protocol version this implementation speaks.
pub const PROTOCOL_VERSION: u16 = 3;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_round_trips_through_encode_decode() {
        let req = Request::new_get_block(4096 * 3, 4096, 0xdead_beef);
        let mut buf = BytesMut::new();
        req.encode(&mut buf);
        assert_eq!(buf.len(), REQUEST_LEN);

        let decoded = Request::decode(&buf).unwrap();
        assert_eq!(decoded, req);
        assert_eq!(decoded.byte_offset(), 4096 * 3);
        assert_eq!(decoded.hops(), 0);
    }

    #[test]
    fn hop_counter_lives_in_the_high_byte_and_does_not_disturb_the_offset() {
        let req = Request::new_get_block(1 << 40, 4096, 1).with_incremented_hop();
        assert_eq!(req.hops(), 1);
        assert_eq!(req.byte_offset(), 1 << 40);

        let mut buf = BytesMut::new();
        req.encode(&mut buf);
        let decoded = Request::decode(&buf).unwrap();
        assert_eq!(decoded.hops(), 1);
        assert_eq!(decoded.byte_offset(), 1 << 40);
    }

    #[test]
    fn decode_rejects_bad_magic() {
        let mut buf = BytesMut::new();
        buf.put_u16_le(0x1234);
        buf.put_bytes(0, REQUEST_LEN - 2);
        assert_eq!(Request::decode(&buf), Err(WireError::BadMagic(0x1234)));
    }

    #[test]
    fn decode_rejects_short_buffer() {
        let buf = [0u8; 4];
        assert_eq!(
            Request::decode(&buf),
            Err(WireError::ShortRead {
                need: REQUEST_LEN,
                have: 4
            })
        );
    }

    #[test]
    fn reply_header_round_trips() {
        let reply = ReplyHeader::new(CMD_GET_BLOCK, 4096, 77);
        let mut buf = BytesMut::new();
        reply.encode(&mut buf);
        assert_eq!(ReplyHeader::decode(&buf).unwrap(), reply);
    }

    #[test]
    fn reply_header_rejects_oversized_payload() {
        let mut buf = BytesMut::new();
        buf.put_u16_le(MAGIC);
        buf.put_u16_le(CMD_GET_BLOCK);
        buf.put_u32_le(MAX_PAYLOAD + 1);
        buf.put_u64_le(0);
        assert_eq!(
            ReplyHeader::decode(&buf),
            Err(WireError::PayloadTooLarge(MAX_PAYLOAD + 1))
        );
    }
}
