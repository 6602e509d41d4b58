//! Protocol commands and payload layouts
//!
//! Only `MemoryControl` carries a structured payload in the core. Blocks are
//! laid out as `[address:u32][length:u16]` followed by `length` data bytes
//! where the direction carries data (read response, write request).

use crate::error::{Result, TelewatchError};
use crate::protocol::codec::{Request, Response, MAX_PAYLOAD_SIZE};
use bytes::{Buf, BufMut, BytesMut};
use std::fmt;

/// Size of the `[address][length]` block header
pub const BLOCK_HEADER_SIZE: usize = 6;

/// Top-level command identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CommandId {
    GetInfo = 0x01,
    CommControl = 0x02,
    MemoryControl = 0x03,
    UserCommand = 0x04,
    DummyCommand = 0x05,
}

impl TryFrom<u8> for CommandId {
    type Error = TelewatchError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(CommandId::GetInfo),
            0x02 => Ok(CommandId::CommControl),
            0x03 => Ok(CommandId::MemoryControl),
            0x04 => Ok(CommandId::UserCommand),
            0x05 => Ok(CommandId::DummyCommand),
            other => Err(TelewatchError::Framing(format!("unknown command 0x{:02X}", other))),
        }
    }
}

/// `MemoryControl` subfunctions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MemoryControlSubfn {
    Read = 0x01,
    Write = 0x02,
}

/// A block of memory with its contents
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryBlock {
    pub address: u64,
    pub data: Vec<u8>,
}

impl MemoryBlock {
    pub fn new(address: u64, data: impl Into<Vec<u8>>) -> Self {
        Self {
            address,
            data: data.into(),
        }
    }
}

/// A block reference without contents (read request, write acknowledge)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockSpan {
    pub address: u64,
    pub length: u16,
}

impl BlockSpan {
    pub fn new(address: u64, length: u16) -> Self {
        Self { address, length }
    }
}

/// Parsed contents of a successful response
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseData {
    /// Blocks returned by a memory read
    MemoryRead(Vec<MemoryBlock>),
    /// Spans acknowledged by a memory write
    MemoryWrite(Vec<BlockSpan>),
    /// Commands with nothing to parse
    Empty,
}

impl fmt::Display for ResponseData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResponseData::MemoryRead(blocks) => write!(f, "MemoryRead({} blocks)", blocks.len()),
            ResponseData::MemoryWrite(spans) => write!(f, "MemoryWrite({} blocks)", spans.len()),
            ResponseData::Empty => write!(f, "Empty"),
        }
    }
}

fn put_block_header(dst: &mut BytesMut, address: u64, length: usize) -> Result<()> {
    let address = u32::try_from(address).map_err(|_| {
        TelewatchError::OutOfRange(format!("address 0x{:X} does not fit in 32 bits", address))
    })?;
    let length = u16::try_from(length).map_err(|_| {
        TelewatchError::OutOfRange(format!("block of {} bytes is too long", length))
    })?;
    dst.put_u32(address);
    dst.put_u16(length);
    Ok(())
}

fn finish_payload(dst: BytesMut) -> Result<BytesMut> {
    if dst.len() > MAX_PAYLOAD_SIZE {
        return Err(TelewatchError::Framing(format!(
            "memory payload of {} bytes exceeds a frame",
            dst.len()
        )));
    }
    Ok(dst)
}

fn get_block_header(buf: &mut &[u8]) -> Result<BlockSpan> {
    if buf.remaining() < BLOCK_HEADER_SIZE {
        return Err(TelewatchError::Framing(format!(
            "truncated memory block header ({} bytes left)",
            buf.remaining()
        )));
    }
    let address = buf.get_u32() as u64;
    let length = buf.get_u16();
    Ok(BlockSpan { address, length })
}

fn get_block_data(buf: &mut &[u8], span: BlockSpan) -> Result<MemoryBlock> {
    let len = span.length as usize;
    if buf.remaining() < len {
        return Err(TelewatchError::Framing(format!(
            "memory block at 0x{:X} declares {} bytes, {} present",
            span.address,
            len,
            buf.remaining()
        )));
    }
    let data = buf[..len].to_vec();
    buf.advance(len);
    Ok(MemoryBlock::new(span.address, data))
}

// ==================== Request builders ====================

/// Build a memory read request
pub fn memory_read_request(spans: &[BlockSpan]) -> Result<Request> {
    let mut dst = BytesMut::with_capacity(spans.len() * BLOCK_HEADER_SIZE);
    for span in spans {
        put_block_header(&mut dst, span.address, span.length as usize)?;
    }
    Ok(Request::new(
        CommandId::MemoryControl as u8,
        MemoryControlSubfn::Read as u8,
        finish_payload(dst)?.freeze(),
    ))
}

/// Build a memory write request
pub fn memory_write_request(blocks: &[MemoryBlock]) -> Result<Request> {
    let mut dst = BytesMut::new();
    for block in blocks {
        put_block_header(&mut dst, block.address, block.data.len())?;
        dst.put_slice(&block.data);
    }
    Ok(Request::new(
        CommandId::MemoryControl as u8,
        MemoryControlSubfn::Write as u8,
        finish_payload(dst)?.freeze(),
    ))
}

/// Build a no-op request, used to probe the link
pub fn dummy_request() -> Request {
    Request::new(CommandId::DummyCommand as u8, 0, Vec::new())
}

// ==================== Device-side helpers ====================

/// Parse a memory read request payload
pub fn parse_memory_read_request(payload: &[u8]) -> Result<Vec<BlockSpan>> {
    let mut buf = payload;
    let mut spans = Vec::new();
    while buf.has_remaining() {
        spans.push(get_block_header(&mut buf)?);
    }
    Ok(spans)
}

/// Parse a memory write request payload
pub fn parse_memory_write_request(payload: &[u8]) -> Result<Vec<MemoryBlock>> {
    let mut buf = payload;
    let mut blocks = Vec::new();
    while buf.has_remaining() {
        let span = get_block_header(&mut buf)?;
        blocks.push(get_block_data(&mut buf, span)?);
    }
    Ok(blocks)
}

/// Encode the payload answering a memory read
pub fn memory_read_response_payload(blocks: &[MemoryBlock]) -> Result<BytesMut> {
    let mut dst = BytesMut::new();
    for block in blocks {
        put_block_header(&mut dst, block.address, block.data.len())?;
        dst.put_slice(&block.data);
    }
    finish_payload(dst)
}

/// Encode the payload answering a memory write
pub fn memory_write_response_payload(spans: &[BlockSpan]) -> Result<BytesMut> {
    let mut dst = BytesMut::with_capacity(spans.len() * BLOCK_HEADER_SIZE);
    for span in spans {
        put_block_header(&mut dst, span.address, span.length as usize)?;
    }
    finish_payload(dst)
}

// ==================== Response parsing ====================

/// Interpret the payload of a successful `response` to `request`
pub fn parse_response(request: &Request, response: &Response) -> Result<ResponseData> {
    if !response.matches(request) {
        return Err(TelewatchError::Framing(format!(
            "{} does not answer {}",
            response, request
        )));
    }

    let command = CommandId::try_from(request.command)?;
    match command {
        CommandId::MemoryControl if request.subfunction == MemoryControlSubfn::Read as u8 => {
            let mut buf = &response.payload[..];
            let mut blocks = Vec::new();
            while buf.has_remaining() {
                let span = get_block_header(&mut buf)?;
                blocks.push(get_block_data(&mut buf, span)?);
            }
            Ok(ResponseData::MemoryRead(blocks))
        }
        CommandId::MemoryControl if request.subfunction == MemoryControlSubfn::Write as u8 => {
            Ok(ResponseData::MemoryWrite(parse_memory_read_request(
                &response.payload,
            )?))
        }
        _ => Ok(ResponseData::Empty),
    }
}
