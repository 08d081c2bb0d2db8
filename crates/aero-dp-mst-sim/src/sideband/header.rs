use super::crc::{body_crc8, header_crc4};
use super::CodecError;

/// Largest relative address (RAD) the header can carry: LCT is 4 bits, RAD holds LCT-1 hops.
pub const MAX_RAD_BYTES: usize = 8;

/// Decoded sideband message chunk header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SidebandHeader {
    /// Link count total.
    pub lct: u8,
    /// Link count remaining.
    pub lcr: u8,
    /// Relative address, one nibble per hop, packed two per byte.
    pub rad: [u8; MAX_RAD_BYTES],
    pub broadcast: bool,
    pub path_msg: bool,
    /// Chunk body length including the trailing CRC-8 byte.
    pub msg_len: u8,
    pub somt: bool,
    pub eomt: bool,
    pub seqno: u8,
}

impl SidebandHeader {
    pub fn encoded_len(&self) -> usize {
        header_len(self.lct)
    }

    /// Whether two headers describe the same origin and routing.
    pub fn same_path(&self, other: &SidebandHeader) -> bool {
        let rad_len = (self.lct / 2) as usize;
        self.lct == other.lct
            && self.broadcast == other.broadcast
            && self.path_msg == other.path_msg
            && self.rad[..rad_len] == other.rad[..rad_len]
    }

    pub fn encode_into(&self, out: &mut Vec<u8>) {
        let start = out.len();
        out.push(((self.lct & 0xF) << 4) | (self.lcr & 0xF));
        out.extend_from_slice(&self.rad[..(self.lct / 2) as usize]);
        out.push(
            ((self.broadcast as u8) << 7) | ((self.path_msg as u8) << 6) | (self.msg_len & 0x3F),
        );
        out.push(((self.somt as u8) << 7) | ((self.eomt as u8) << 6) | ((self.seqno & 1) << 4));
        let written = out.len() - start;
        let crc = header_crc4(&out[start..], written * 2 - 1);
        let last = out.len() - 1;
        out[last] |= crc & 0xF;
    }

    /// Decodes and CRC-checks the header at the start of `buf`.
    pub fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        let Some(&first) = buf.first() else {
            return Err(CodecError::Truncated { len: 0, min: 3 });
        };
        let lct = first >> 4;
        let lcr = first & 0xF;
        if lct == 0 {
            return Err(CodecError::InvalidLinkCount { lct, lcr });
        }
        let len = header_len(lct);
        if buf.len() < len {
            return Err(CodecError::Truncated {
                len: buf.len(),
                min: len,
            });
        }

        let expected = header_crc4(&buf[..len], len * 2 - 1);
        let found = buf[len - 1] & 0xF;
        if expected != found {
            return Err(CodecError::HeaderCrc { expected, found });
        }

        let rad_len = (lct / 2) as usize;
        let mut rad = [0u8; MAX_RAD_BYTES];
        rad[..rad_len].copy_from_slice(&buf[1..1 + rad_len]);
        let b = buf[1 + rad_len];
        let s = buf[2 + rad_len];
        Ok(Self {
            lct,
            lcr,
            rad,
            broadcast: b & 0x80 != 0,
            path_msg: b & 0x40 != 0,
            msg_len: b & 0x3F,
            somt: s & 0x80 != 0,
            eomt: s & 0x40 != 0,
            seqno: (s >> 4) & 1,
        })
    }
}

pub fn header_len(lct: u8) -> usize {
    3 + (lct / 2) as usize
}

/// One validated sideband chunk: header plus body (trailing CRC-8 stripped).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk<'a> {
    pub header: SidebandHeader,
    pub body: &'a [u8],
}

impl<'a> Chunk<'a> {
    /// Total encoded size of the chunk at the start of `buf`, if its header is readable.
    pub fn peek_len(buf: &[u8]) -> Option<usize> {
        let header = SidebandHeader::decode(buf).ok()?;
        Some(header.encoded_len() + header.msg_len as usize)
    }

    /// Parses exactly one chunk; `buf` must not carry trailing bytes.
    pub fn decode(buf: &'a [u8]) -> Result<Self, CodecError> {
        let header = SidebandHeader::decode(buf)?;
        let hdr_len = header.encoded_len();
        let declared = hdr_len + header.msg_len as usize;
        if buf.len() != declared {
            return Err(CodecError::LengthMismatch {
                declared,
                actual: buf.len(),
            });
        }
        if header.msg_len == 0 {
            return Err(CodecError::EmptyBody);
        }
        let body = &buf[hdr_len..buf.len() - 1];
        let expected = body_crc8(body);
        let found = buf[buf.len() - 1];
        if expected != found {
            return Err(CodecError::BodyCrc { expected, found });
        }
        Ok(Self { header, body })
    }

    pub fn encode(header: SidebandHeader, body: &[u8]) -> Vec<u8> {
        let mut header = header;
        header.msg_len = (body.len() + 1) as u8;
        let mut out = Vec::with_capacity(header.encoded_len() + body.len() + 1);
        header.encode_into(&mut out);
        out.extend_from_slice(body);
        out.push(body_crc8(body));
        out
    }
}

/// Splits `body` into chunks of at most `max_chunk_len` bytes each (header and CRC included).
pub fn encode_chunks(template: SidebandHeader, body: &[u8], max_chunk_len: usize) -> Vec<Vec<u8>> {
    let space = max_chunk_len.saturating_sub(template.encoded_len() + 1).clamp(1, 62);
    let mut chunks = Vec::new();
    let mut offset = 0;
    loop {
        let end = (offset + space).min(body.len());
        let header = SidebandHeader {
            somt: offset == 0,
            eomt: end == body.len(),
            ..template
        };
        chunks.push(Chunk::encode(header, &body[offset..end]));
        if end == body.len() {
            break;
        }
        offset = end;
    }
    chunks
}

/// Splits a buffer holding back-to-back chunks at chunk boundaries.
///
/// Returns `None` if the buffer does not divide cleanly into well-formed chunk headers.
pub fn split_chunks(mut buf: &[u8]) -> Option<Vec<&[u8]>> {
    let mut out = Vec::new();
    while !buf.is_empty() {
        let len = Chunk::peek_len(buf)?;
        if len > buf.len() {
            return None;
        }
        let (chunk, rest) = buf.split_at(len);
        out.push(chunk);
        buf = rest;
    }
    Some(out)
}
