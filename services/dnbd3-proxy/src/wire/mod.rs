//! The dnbd3 wire protocol: fixed-layout request/reply framing plus the
//! variable payloads that follow a handful of reply types.

pub mod host;
pub mod proto;
pub mod select_image;
pub mod servers;

pub use host::Host;
pub use proto::{
    ReplyHeader, Request, WireError, CMD_ERROR, CMD_GET_BLOCK, CMD_GET_CRC32, CMD_GET_SERVERS,
    CMD_KEEPALIVE, CMD_SELECT_IMAGE, MAGIC, MAX_PAYLOAD, MIN_PROTOCOL_VERSION, PROTOCOL_VERSION,
    REPLY_LEN, REQUEST_LEN,
};
pub use select_image::SelectImagePayload;
pub use servers::{decode_servers, encode_servers};
