//! Device protocol
//!
//! Framed request/response messages exchanged with the device:
//!
//! - [`codec`] - Frame encode/decode with the CRC-32 trailer
//! - [`crc`] - The CRC-32 itself
//! - [`commands`] - Command ids and `MemoryControl` payload layouts

pub mod codec;
pub mod commands;
pub mod crc;

pub use codec::{
    request_frame_len, response_frame_len, Request, Response, ResponseCode, MAX_PAYLOAD_SIZE,
    REQUEST_OVERHEAD, RESPONSE_OVERHEAD,
};
pub use commands::{
    memory_read_request, memory_write_request, parse_response, BlockSpan, CommandId,
    MemoryBlock, MemoryControlSubfn, ResponseData,
};
pub use crc::crc32;
