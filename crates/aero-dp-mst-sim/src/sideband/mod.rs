//! DisplayPort MST sideband message codec.
//!
//! A sideband message travels as one or more chunks. Each chunk carries a header (link counts,
//! relative address, flags, sequence number, CRC-4), a body fragment and a CRC-8 over that
//! fragment. The first chunk of a message has `SOMT` set and the last has `EOMT` set; the
//! concatenated fragments form the message body, whose first byte is the request type.

mod crc;
mod header;
mod message;
mod reassembly;

use serde::{Deserialize, Serialize};

pub use crc::{body_crc8, header_crc4};
pub use header::{encode_chunks, header_len, split_chunks, Chunk, SidebandHeader, MAX_RAD_BYTES};
pub use message::{
    AckReply, ConnectionStatusNotify, I2cWrite, LinkAddressPort, NakReason, PeerDeviceType,
    RequestType, SidebandReply, SidebandRequest,
};
pub use reassembly::{DecodedRequest, Reassembler, ReassemblyState};

/// Largest chunk (header, body and CRC) that fits a DPCD sideband mailbox window.
pub const SIDEBAND_MAX_CHUNK_LEN: usize = 48;

/// Largest reassembled message body accepted or produced.
pub const SIDEBAND_MAX_MESSAGE_LEN: usize = 256;

/// `LCR` carried by broadcast messages.
pub const BROADCAST_LCR: u8 = 6;

/// Size limits applied while encoding and reassembling messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Limits {
    pub max_chunk_len: usize,
    pub max_message_len: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_chunk_len: SIDEBAND_MAX_CHUNK_LEN,
            max_message_len: SIDEBAND_MAX_MESSAGE_LEN,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("chunk too short: {len} bytes, need at least {min}")]
    Truncated { len: usize, min: usize },
    #[error("header CRC mismatch: expected {expected:#x}, found {found:#x}")]
    HeaderCrc { expected: u8, found: u8 },
    #[error("body CRC mismatch: expected {expected:#04x}, found {found:#04x}")]
    BodyCrc { expected: u8, found: u8 },
    #[error("chunk declares {declared} bytes but {actual} were supplied")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("chunk has no body")]
    EmptyBody,
    #[error("invalid link counts LCT={lct} LCR={lcr}")]
    InvalidLinkCount { lct: u8, lcr: u8 },
    #[error("request addressed {lct} links deep; only the first branch is simulated")]
    PathTooDeep { lct: u8 },
    #[error("unknown message type {0:#04x}")]
    UnknownRequestType(u8),
    #[error("message type {msg_type:#04x} carries {extra} trailing bytes")]
    TrailingBytes { msg_type: u8, extra: usize },
    #[error("message type {msg_type:#04x} is {actual} bytes, expected {expected}")]
    BodyLength {
        msg_type: u8,
        expected: usize,
        actual: usize,
    },
    #[error("continuation chunk for seqno {seqno} without a start chunk")]
    ContinuationWithoutStart { seqno: u8 },
    #[error("start chunk for seqno {seqno} while a message is still in flight")]
    DuplicateStart { seqno: u8 },
    #[error("chunk for seqno {seqno} does not match the in-flight message path")]
    PathMismatch { seqno: u8 },
    #[error("message of {len} bytes exceeds the {max}-byte limit")]
    MessageTooLong { len: usize, max: usize },
    #[error("invalid {0}")]
    InvalidField(&'static str),
}

/// Header template for a down request sent from the source to the branch.
///
/// Broadcast requests use `LCR = 6`; all others address the first branch directly
/// (`LCT = 1, LCR = 0`).
pub fn request_header(req_type: RequestType, seqno: u8) -> SidebandHeader {
    SidebandHeader {
        lct: 1,
        lcr: if req_type.is_broadcast() { BROADCAST_LCR } else { 0 },
        broadcast: req_type.is_broadcast(),
        path_msg: req_type.is_path_msg(),
        seqno: seqno & 1,
        ..Default::default()
    }
}

/// Header template for a reply to `request`.
///
/// Replies mirror the request sequence number and path flag but carry one remaining upstream
/// hop (`LCR = 1`) and never the broadcast bit, which keeps them from parsing as requests.
pub fn reply_header(request: &SidebandHeader) -> SidebandHeader {
    SidebandHeader {
        lct: 1,
        lcr: 1,
        broadcast: false,
        path_msg: request.path_msg,
        seqno: request.seqno,
        ..Default::default()
    }
}

/// Header template for an up request originated by the branch.
pub fn up_request_header(seqno: u8) -> SidebandHeader {
    SidebandHeader {
        lct: 1,
        lcr: BROADCAST_LCR,
        broadcast: true,
        seqno: seqno & 1,
        ..Default::default()
    }
}

/// Encodes `request` as a chunk train ready to be written to the branch.
pub fn encode_request(request: &SidebandRequest, seqno: u8, limits: &Limits) -> Vec<Vec<u8>> {
    let header = request_header(request.request_type(), seqno);
    encode_chunks(header, &request.encode_body(), limits.max_chunk_len)
}

/// Reassembles a complete reply from back-to-back chunks and decodes it.
pub fn decode_reply(buf: &[u8]) -> Result<(SidebandHeader, SidebandReply), CodecError> {
    let (header, body) = join_chunks(buf)?;
    Ok((header, SidebandReply::decode_body(&body)?))
}

/// Validates a back-to-back chunk train and concatenates its body fragments.
///
/// Returns the header of the first chunk. The train must start with `SOMT`, end with `EOMT`
/// and keep the same path and sequence number throughout.
pub fn join_chunks(buf: &[u8]) -> Result<(SidebandHeader, Vec<u8>), CodecError> {
    let raw = split_chunks(buf).ok_or(CodecError::LengthMismatch {
        declared: Chunk::peek_len(buf).unwrap_or(0),
        actual: buf.len(),
    })?;
    let mut first: Option<SidebandHeader> = None;
    let mut body = Vec::new();
    for (i, raw) in raw.iter().enumerate() {
        let chunk = Chunk::decode(raw)?;
        let h = chunk.header;
        match first {
            None if !h.somt => return Err(CodecError::ContinuationWithoutStart { seqno: h.seqno }),
            None => first = Some(h),
            Some(f) => {
                if h.somt {
                    return Err(CodecError::DuplicateStart { seqno: h.seqno });
                }
                if !f.same_path(&h) || f.seqno != h.seqno {
                    return Err(CodecError::PathMismatch { seqno: h.seqno });
                }
            }
        }
        body.extend_from_slice(chunk.body);
        if h.eomt != (i == raw.len() - 1) {
            return Err(CodecError::LengthMismatch {
                declared: i + 1,
                actual: raw.len(),
            });
        }
    }
    let header = first.ok_or(CodecError::Truncated { len: 0, min: 3 })?;
    Ok((header, body))
}
