//! Multi-chunk request reassembly.
//!
//! The header carries a single sequence-number bit, so at most two requests can be in flight.
//! Each has its own slot. Chunks must arrive in order: a continuation without a start, a second
//! start for an occupied slot, a path change mid-message or a body that overruns its derivable
//! length is rejected without touching the pending state. A LINK_ADDRESS start discards every
//! pending message, which is how a host restarting topology discovery recovers from a
//! half-delivered request.

use tracing::{debug, warn};

use super::{Chunk, CodecError, RequestType, SidebandHeader, SidebandRequest};

/// A fully reassembled and decoded request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedRequest {
    /// Header of the first chunk.
    pub header: SidebandHeader,
    pub request: SidebandRequest,
    /// Every chunk of the message as received, back to back.
    pub raw: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReassemblyState {
    Complete(DecodedRequest),
    NeedMoreFragments,
}

#[derive(Debug, Clone)]
struct Pending {
    header: SidebandHeader,
    body: Vec<u8>,
    raw: Vec<u8>,
    expected_len: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct Reassembler {
    slots: [Option<Pending>; 2],
    max_message_len: usize,
}

impl Reassembler {
    pub fn new(max_message_len: usize) -> Self {
        Self {
            slots: [None, None],
            max_message_len,
        }
    }

    fn reset(&mut self) {
        self.slots = [None, None];
    }

    pub fn has_pending(&self) -> bool {
        self.slots.iter().any(Option::is_some)
    }

    /// Feeds one raw request chunk.
    pub fn feed(&mut self, raw: &[u8]) -> Result<ReassemblyState, CodecError> {
        let chunk = Chunk::decode(raw)?;
        let header = chunk.header;
        check_addressing(&header)?;
        let slot = (header.seqno & 1) as usize;

        if header.somt {
            let Some(&first) = chunk.body.first() else {
                return Err(CodecError::EmptyBody);
            };
            if first & 0x80 != 0 {
                return Err(CodecError::UnknownRequestType(first));
            }
            let req_type = RequestType::try_from(first)?;
            if req_type == RequestType::LinkAddress {
                if self.has_pending() {
                    debug!("LINK_ADDRESS discards pending sideband reassembly");
                }
                self.reset();
            } else if self.slots[slot].is_some() {
                return Err(CodecError::DuplicateStart {
                    seqno: header.seqno,
                });
            }

            let expected_len = SidebandRequest::expected_len(chunk.body);
            self.check_len(first, chunk.body.len(), expected_len)?;
            if header.eomt {
                return finish(header, raw.to_vec(), chunk.body, expected_len);
            }
            self.slots[slot] = Some(Pending {
                header,
                body: chunk.body.to_vec(),
                raw: raw.to_vec(),
                expected_len,
            });
            return Ok(ReassemblyState::NeedMoreFragments);
        }

        let Some(pending) = self.slots[slot].as_ref() else {
            return Err(CodecError::ContinuationWithoutStart {
                seqno: header.seqno,
            });
        };
        if !pending.header.same_path(&header) {
            return Err(CodecError::PathMismatch {
                seqno: header.seqno,
            });
        }
        let start = pending.header;
        let mut body = Vec::with_capacity(pending.body.len() + chunk.body.len());
        body.extend_from_slice(&pending.body);
        body.extend_from_slice(chunk.body);
        let expected_len = pending
            .expected_len
            .or_else(|| SidebandRequest::expected_len(&body));
        self.check_len(body[0], body.len(), expected_len)?;
        let mut train = pending.raw.clone();
        train.extend_from_slice(raw);

        if header.eomt {
            self.slots[slot] = None;
            return finish(start, train, &body, expected_len);
        }
        self.slots[slot] = Some(Pending {
            header: start,
            body,
            raw: train,
            expected_len,
        });
        Ok(ReassemblyState::NeedMoreFragments)
    }

    fn check_len(
        &self,
        msg_type: u8,
        len: usize,
        expected: Option<usize>,
    ) -> Result<(), CodecError> {
        if len > self.max_message_len {
            warn!(len, max = self.max_message_len, "sideband message overflow");
            return Err(CodecError::MessageTooLong {
                len,
                max: self.max_message_len,
            });
        }
        if let Some(expected) = expected {
            if expected > self.max_message_len {
                return Err(CodecError::MessageTooLong {
                    len: expected,
                    max: self.max_message_len,
                });
            }
            if len > expected {
                return Err(CodecError::BodyLength {
                    msg_type,
                    expected,
                    actual: len,
                });
            }
        }
        Ok(())
    }
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new(super::SIDEBAND_MAX_MESSAGE_LEN)
    }
}

/// Only requests addressed to this branch (LCT = 1) are accepted. Unicast requests must have
/// exactly one link remaining to be consumed here.
fn check_addressing(header: &SidebandHeader) -> Result<(), CodecError> {
    if header.lct > 1 {
        return Err(CodecError::PathTooDeep { lct: header.lct });
    }
    if !header.broadcast && header.lcr != header.lct - 1 {
        return Err(CodecError::InvalidLinkCount {
            lct: header.lct,
            lcr: header.lcr,
        });
    }
    Ok(())
}

fn finish(
    header: SidebandHeader,
    raw: Vec<u8>,
    body: &[u8],
    expected_len: Option<usize>,
) -> Result<ReassemblyState, CodecError> {
    if let Some(expected) = expected_len {
        if body.len() != expected {
            return Err(CodecError::BodyLength {
                msg_type: body[0],
                expected,
                actual: body.len(),
            });
        }
    }
    let request = SidebandRequest::decode_body(body)?;
    Ok(ReassemblyState::Complete(DecodedRequest {
        header,
        request,
        raw,
    }))
}
