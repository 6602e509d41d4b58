//! Request/response frame codec
//!
//! Wire format (all multi-byte fields big-endian):
//!
//! ```text
//! Request:  ┌────────────┬───────┬──────────┬─────────┬───────────┐
//!           │ cmd & 0x7F │ subfn │ len (2B) │ payload │ CRC32(4B) │
//!           └────────────┴───────┴──────────┴─────────┴───────────┘
//! Response: ┌────────────┬───────┬──────┬──────────┬─────────┬───────────┐
//!           │ cmd | 0x80 │ subfn │ code │ len (2B) │ payload │ CRC32(4B) │
//!           └────────────┴───────┴──────┴──────────┴─────────┴───────────┘
//! ```
//!
//! The CRC covers every byte before it. Decoding expects exactly one complete
//! frame; partial-frame buffering belongs to the link.

use crate::error::{Result, TelewatchError};
use crate::protocol::crc::crc32;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Header + trailer size of a request frame
pub const REQUEST_OVERHEAD: usize = 8;

/// Header + trailer size of a response frame
pub const RESPONSE_OVERHEAD: usize = 9;

/// Largest payload the 16-bit length field can describe
pub const MAX_PAYLOAD_SIZE: usize = u16::MAX as usize;

const RESPONSE_FLAG: u8 = 0x80;
const COMMAND_MASK: u8 = 0x7F;
const CRC_SIZE: usize = 4;

/// Result code carried by every response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ResponseCode {
    Ok = 0,
    InvalidRequest = 1,
    UnsupportedFeature = 2,
    Overflow = 3,
    Busy = 4,
}

impl ResponseCode {
    pub fn is_ok(self) -> bool {
        self == ResponseCode::Ok
    }
}

impl TryFrom<u8> for ResponseCode {
    type Error = TelewatchError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(ResponseCode::Ok),
            1 => Ok(ResponseCode::InvalidRequest),
            2 => Ok(ResponseCode::UnsupportedFeature),
            3 => Ok(ResponseCode::Overflow),
            4 => Ok(ResponseCode::Busy),
            other => Err(TelewatchError::Framing(format!(
                "unknown response code {}",
                other
            ))),
        }
    }
}

impl fmt::Display for ResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResponseCode::Ok => write!(f, "OK"),
            ResponseCode::InvalidRequest => write!(f, "InvalidRequest"),
            ResponseCode::UnsupportedFeature => write!(f, "UnsupportedFeature"),
            ResponseCode::Overflow => write!(f, "Overflow"),
            ResponseCode::Busy => write!(f, "Busy"),
        }
    }
}

/// A request sent to the device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// 7-bit command identifier
    pub command: u8,
    pub subfunction: u8,
    pub payload: Bytes,
}

/// A response received from the device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// 7-bit command identifier (the direction bit is stripped)
    pub command: u8,
    pub subfunction: u8,
    pub code: ResponseCode,
    pub payload: Bytes,
}

fn check_payload_len(len: usize) -> Result<()> {
    if len > MAX_PAYLOAD_SIZE {
        return Err(TelewatchError::Framing(format!(
            "payload too large ({} bytes, max {})",
            len, MAX_PAYLOAD_SIZE
        )));
    }
    Ok(())
}

/// Check the length and the CRC trailer of a complete frame, returning the
/// bytes it covers.
fn verify_frame<'a>(data: &'a [u8], overhead: usize, kind: &str) -> Result<&'a [u8]> {
    if data.len() < overhead {
        return Err(TelewatchError::Framing(format!(
            "{} too short ({} bytes, need at least {})",
            kind,
            data.len(),
            overhead
        )));
    }

    let (body, trailer) = data.split_at(data.len() - CRC_SIZE);
    let expected = u32::from_be_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
    let computed = crc32(body);
    if expected != computed {
        return Err(TelewatchError::Integrity { expected, computed });
    }
    Ok(body)
}

fn check_declared_len(declared: usize, actual: usize, kind: &str) -> Result<()> {
    if declared != actual {
        return Err(TelewatchError::Framing(format!(
            "{} length field says {} bytes but {} are present",
            kind, declared, actual
        )));
    }
    Ok(())
}

impl Request {
    /// Create a request. The command's top bit is dropped.
    pub fn new(command: u8, subfunction: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            command: command & COMMAND_MASK,
            subfunction,
            payload: payload.into(),
        }
    }

    /// Size of the encoded frame
    pub fn wire_size(&self) -> usize {
        REQUEST_OVERHEAD + self.payload.len()
    }

    /// Append the encoded frame to `dst`
    pub fn encode_into(&self, dst: &mut BytesMut) -> Result<()> {
        check_payload_len(self.payload.len())?;
        let start = dst.len();
        dst.reserve(self.wire_size());
        dst.put_u8(self.command & COMMAND_MASK);
        dst.put_u8(self.subfunction);
        dst.put_u16(self.payload.len() as u16);
        dst.put_slice(&self.payload);
        let crc = crc32(&dst[start..]);
        dst.put_u32(crc);
        Ok(())
    }

    /// Encode to a standalone frame
    pub fn encode(&self) -> Result<Bytes> {
        let mut dst = BytesMut::with_capacity(self.wire_size());
        self.encode_into(&mut dst)?;
        Ok(dst.freeze())
    }

    /// Decode one complete request frame.
    ///
    /// The CRC is verified before the header is interpreted, so any corrupted
    /// byte is reported as an integrity error.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut body = verify_frame(data, REQUEST_OVERHEAD, "request")?;

        let command = body.get_u8();
        if command & RESPONSE_FLAG != 0 {
            return Err(TelewatchError::Framing(format!(
                "command byte 0x{:02X} has the response bit set",
                command
            )));
        }
        let subfunction = body.get_u8();
        let declared = body.get_u16() as usize;
        check_declared_len(declared, body.len(), "request")?;

        Ok(Self {
            command,
            subfunction,
            payload: Bytes::copy_from_slice(body),
        })
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Request(cmd=0x{:02X}, subfn=0x{:02X}, {} bytes)",
            self.command,
            self.subfunction,
            self.payload.len()
        )
    }
}

impl Response {
    /// Create a response. The command's top bit is dropped.
    pub fn new(command: u8, subfunction: u8, code: ResponseCode, payload: impl Into<Bytes>) -> Self {
        Self {
            command: command & COMMAND_MASK,
            subfunction,
            code,
            payload: payload.into(),
        }
    }

    /// Build an empty response answering `request` with `code`
    pub fn for_request(request: &Request, code: ResponseCode) -> Self {
        Self::new(request.command, request.subfunction, code, Bytes::new())
    }

    /// Size of the encoded frame
    pub fn wire_size(&self) -> usize {
        RESPONSE_OVERHEAD + self.payload.len()
    }

    /// Append the encoded frame to `dst`
    pub fn encode_into(&self, dst: &mut BytesMut) -> Result<()> {
        check_payload_len(self.payload.len())?;
        let start = dst.len();
        dst.reserve(self.wire_size());
        dst.put_u8(self.command | RESPONSE_FLAG);
        dst.put_u8(self.subfunction);
        dst.put_u8(self.code as u8);
        dst.put_u16(self.payload.len() as u16);
        dst.put_slice(&self.payload);
        let crc = crc32(&dst[start..]);
        dst.put_u32(crc);
        Ok(())
    }

    /// Encode to a standalone frame
    pub fn encode(&self) -> Result<Bytes> {
        let mut dst = BytesMut::with_capacity(self.wire_size());
        self.encode_into(&mut dst)?;
        Ok(dst.freeze())
    }

    /// Decode one complete response frame
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut body = verify_frame(data, RESPONSE_OVERHEAD, "response")?;

        let command = body.get_u8();
        if command & RESPONSE_FLAG == 0 {
            return Err(TelewatchError::Framing(format!(
                "command byte 0x{:02X} lacks the response bit",
                command
            )));
        }
        let subfunction = body.get_u8();
        let code = ResponseCode::try_from(body.get_u8())?;
        let declared = body.get_u16() as usize;
        check_declared_len(declared, body.len(), "response")?;

        Ok(Self {
            command: command & COMMAND_MASK,
            subfunction,
            code,
            payload: Bytes::copy_from_slice(body),
        })
    }

    /// True if this response answers `request`
    pub fn matches(&self, request: &Request) -> bool {
        self.command == request.command && self.subfunction == request.subfunction
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Response(cmd=0x{:02X}, subfn=0x{:02X}, code={}, {} bytes)",
            self.command,
            self.subfunction,
            self.code,
            self.payload.len()
        )
    }
}

/// Total size of the response frame starting at `buf[0]`, once the header
/// is available. `None` while fewer than 5 header bytes are buffered.
pub fn response_frame_len(buf: &[u8]) -> Option<usize> {
    if buf.len() < 5 {
        return None;
    }
    let len = u16::from_be_bytes([buf[3], buf[4]]) as usize;
    Some(RESPONSE_OVERHEAD + len)
}

/// Total size of the request frame starting at `buf[0]`, once the header
/// is available. `None` while fewer than 4 header bytes are buffered.
pub fn request_frame_len(buf: &[u8]) -> Option<usize> {
    if buf.len() < 4 {
        return None;
    }
    let len = u16::from_be_bytes([buf[2], buf[3]]) as usize;
    Some(REQUEST_OVERHEAD + len)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_layout() {
        let req = Request::new(1, 0x34, vec![1, 2, 3, 4]);
        let frame = req.encode().unwrap();

        assert_eq!(&frame[..8], &[1, 0x34, 0, 4, 1, 2, 3, 4]);
        assert_eq!(frame.len(), 12);
        let crc = u32::from_be_bytes([frame[8], frame[9], frame[10], frame[11]]);
        assert_eq!(crc, crc32(&frame[..8]));

        let decoded = Request::decode(&frame).unwrap();
        assert_eq!(decoded.command, 1);
        assert_eq!(decoded.subfunction, 0x34);
        assert_eq!(decoded.payload, vec![1u8, 2, 3, 4]);
    }

    #[test]
    fn test_response_layout() {
        let resp = Response::new(1, 0x34, ResponseCode::InvalidRequest, vec![1, 2, 3, 4]);
        let frame = resp.encode().unwrap();

        assert_eq!(&frame[..9], &[0x81, 0x34, 1, 0, 4, 1, 2, 3, 4]);
        assert_eq!(frame.len(), 13);

        let decoded = Response::decode(&frame).unwrap();
        assert_eq!(decoded, resp);
    }

    #[test]
    fn test_command_top_bit_is_masked() {
        let req = Request::new(0x85, 1, Bytes::new());
        assert_eq!(req.command, 0x05);
        assert_eq!(req.encode().unwrap()[0], 0x05);
    }

    #[test]
    fn test_empty_payload() {
        let frame = Request::new(5, 0, Bytes::new()).encode().unwrap();
        assert_eq!(frame.len(), REQUEST_OVERHEAD);
        assert!(Request::decode(&frame).unwrap().payload.is_empty());
    }

    #[test]
    fn test_too_short_is_framing_error() {
        assert!(matches!(
            Request::decode(&[1, 2, 0, 0, 0, 0, 0]),
            Err(TelewatchError::Framing(_))
        ));
        assert!(matches!(
            Response::decode(&[0x81, 2, 0, 0, 0, 0, 0, 0]),
            Err(TelewatchError::Framing(_))
        ));
    }

    #[test]
    fn test_wrong_direction_is_framing_error() {
        let resp_frame = Response::new(1, 1, ResponseCode::Ok, vec![0u8; 3]).encode().unwrap();
        // Valid CRC, but a response is not a request
        assert!(matches!(
            Request::decode(&resp_frame),
            Err(TelewatchError::Framing(_))
        ));

        let req_frame = Request::new(1, 1, vec![0u8; 3]).encode().unwrap();
        assert!(matches!(
            Response::decode(&req_frame),
            Err(TelewatchError::Framing(_))
        ));
    }

    /// Build a frame with a valid CRC around arbitrary header bytes
    fn frame_with_crc(body: &[u8]) -> Vec<u8> {
        let mut frame = body.to_vec();
        frame.extend_from_slice(&crc32(body).to_be_bytes());
        frame
    }

    #[test]
    fn test_length_mismatch_is_framing_error() {
        let frame = frame_with_crc(&[1, 0x34, 0, 5, 1, 2, 3, 4]);
        assert!(matches!(
            Request::decode(&frame),
            Err(TelewatchError::Framing(_))
        ));

        let frame = frame_with_crc(&[0x81, 0x34, 0, 0, 3, 1, 2, 3, 4]);
        assert!(matches!(
            Response::decode(&frame),
            Err(TelewatchError::Framing(_))
        ));
    }

    #[test]
    fn test_unknown_response_code() {
        let frame = frame_with_crc(&[0x81, 0x00, 0x42, 0, 0]);
        assert!(matches!(
            Response::decode(&frame),
            Err(TelewatchError::Framing(_))
        ));
    }

    #[test]
    fn test_crc_mismatch_is_integrity_error() {
        let mut frame = Request::new(3, 1, vec![9u8; 6]).encode().unwrap().to_vec();
        let last = frame.len() - 1;
        frame[last] ^= 0x01;
        assert!(matches!(
            Request::decode(&frame),
            Err(TelewatchError::Integrity { .. })
        ));
    }

    #[test]
    fn test_payload_too_large() {
        let req = Request::new(3, 1, vec![0u8; MAX_PAYLOAD_SIZE + 1]);
        assert!(matches!(req.encode(), Err(TelewatchError::Framing(_))));
    }

    #[test]
    fn test_frame_len_helpers() {
        let resp = Response::new(3, 1, ResponseCode::Ok, vec![0u8; 10]).encode().unwrap();
        assert_eq!(response_frame_len(&resp[..4]), None);
        assert_eq!(response_frame_len(&resp[..5]), Some(resp.len()));

        let req = Request::new(3, 1, vec![0u8; 7]).encode().unwrap();
        assert_eq!(request_frame_len(&req[..3]), None);
        assert_eq!(request_frame_len(&req), Some(req.len()));
    }

    #[test]
    fn test_response_matches_request() {
        let req = Request::new(3, 2, Bytes::new());
        assert!(Response::for_request(&req, ResponseCode::Ok).matches(&req));
        assert!(!Response::new(3, 1, ResponseCode::Ok, Bytes::new()).matches(&req));
    }

    use proptest::prelude::*;

    proptest! {
        #[test]
        fn test_request_round_trip(
            command in 0u8..0x80,
            subfunction in any::<u8>(),
            payload in prop::collection::vec(any::<u8>(), 0..256)
        ) {
            let req = Request::new(command, subfunction, payload);
            let decoded = Request::decode(&req.encode().unwrap()).unwrap();
            prop_assert_eq!(decoded, req);
        }

        #[test]
        fn test_response_round_trip(
            command in 0u8..0x80,
            subfunction in any::<u8>(),
            code in 0u8..5,
            payload in prop::collection::vec(any::<u8>(), 0..256)
        ) {
            let resp = Response::new(command, subfunction, ResponseCode::try_from(code).unwrap(), payload);
            let decoded = Response::decode(&resp.encode().unwrap()).unwrap();
            prop_assert_eq!(decoded, resp);
        }

        #[test]
        fn test_single_byte_corruption_detected(
            payload in prop::collection::vec(any::<u8>(), 0..64),
            index in any::<prop::sample::Index>(),
            flip in 1u8..=255
        ) {
            let mut frame = Response::new(3, 1, ResponseCode::Ok, payload).encode().unwrap().to_vec();
            let i = index.index(frame.len());
            frame[i] ^= flip;
            let is_integrity_error = matches!(
                Response::decode(&frame),
                Err(TelewatchError::Integrity { .. })
            );
            prop_assert!(is_integrity_error);
        }

        #[test]
        fn test_request_single_byte_corruption_detected(
            command in 0u8..0x80,
            payload in prop::collection::vec(any::<u8>(), 0..64),
            index in any::<prop::sample::Index>(),
            flip in 1u8..=255
        ) {
            let mut frame = Request::new(command, 1, payload).encode().unwrap().to_vec();
            let i = index.index(frame.len());
            frame[i] ^= flip;
            let is_integrity_error = matches!(
                Request::decode(&frame),
                Err(TelewatchError::Integrity { .. })
            );
            prop_assert!(is_integrity_error);
        }
    }
}
