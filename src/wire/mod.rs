//! Framed wire protocol: frame header, CRC-32C checksum, and the typed value
//! stream (§4.1). Pure, stateless functions — connection state lives in
//! [`crate::server::core`].

pub mod crc32c;
pub mod frame;
pub mod scanf;
pub mod value;

pub use frame::{FrameHeader, FRAME_HEADER_LEN, SELVA_PROTO_FRAME_SIZE_MAX, SELVA_PROTO_MSG_SIZE_MAX};
pub use value::{encode_value, parse_vtype, WireValue};
