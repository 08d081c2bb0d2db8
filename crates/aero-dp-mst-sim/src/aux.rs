//! Native AUX front-end: the branch's own DPCD space and its sideband mailboxes.
//!
//! A DRM-style source drives MST through DPCD rather than through [`crate::Simulator::transfer`]:
//! it writes request chunks into DOWN_REQ, waits for `DOWN_REP_MSG_RDY` in ESI0, reads the reply
//! chunk from DOWN_REP and acknowledges it by writing the bit back. Up requests
//! (CONNECTION_STATUS_NOTIFY) flow the other way through UP_REQ and UP_REP.

use std::collections::VecDeque;

use tracing::{debug, trace, warn};

use crate::dpcd::{
    DpcdRegisters, Esi0, MstmCtrl, PayloadTableStatus, DP_DEVICE_SERVICE_IRQ_VECTOR_ESI0,
    DP_DPCD_REV, DP_GUID, DP_MSTM_CAP, DP_MSTM_CTRL, DP_MST_CAP, DP_PAYLOAD_ALLOCATE_SET,
    DP_PAYLOAD_ALLOCATE_TIME_SLOT_COUNT, DP_PAYLOAD_TABLE_UPDATE_STATUS,
    DP_SIDEBAND_MSG_DOWN_REP_BASE, DP_SIDEBAND_MSG_DOWN_REQ_BASE, DP_SIDEBAND_MSG_UP_REP_BASE,
    DP_SIDEBAND_MSG_UP_REQ_BASE, DP_SINK_COUNT_ESI,
};
use crate::error::{Result, SimError};
use crate::guid::Guid;
use crate::sideband::{
    encode_chunks, split_chunks, up_request_header, Chunk, CodecError, ConnectionStatusNotify,
    SidebandHeader, SIDEBAND_MAX_CHUNK_LEN,
};
use crate::sim::Engine;

/// Largest payload of a single AUX transaction.
pub const AUX_MAX_PAYLOAD: usize = 16;

/// Size of each sideband mailbox window in DPCD.
pub const SIDEBAND_WINDOW_LEN: u32 = SIDEBAND_MAX_CHUNK_LEN as u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuxRequest {
    NativeWrite,
    NativeRead,
    I2cWrite,
    I2cRead,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AuxReply {
    #[default]
    Ack,
    Nack,
    I2cNack,
}

/// One AUX transaction. Reads fill `buffer` in place; its length is the requested size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuxMsg {
    pub request: AuxRequest,
    pub address: u32,
    pub buffer: Vec<u8>,
    pub reply: AuxReply,
}

impl AuxMsg {
    pub fn native_read(address: u32, len: usize) -> Self {
        Self {
            request: AuxRequest::NativeRead,
            address,
            buffer: vec![0; len],
            reply: AuxReply::Ack,
        }
    }

    pub fn native_write(address: u32, data: &[u8]) -> Self {
        Self {
            request: AuxRequest::NativeWrite,
            address,
            buffer: data.to_vec(),
            reply: AuxReply::Ack,
        }
    }
}

fn in_window(address: u32, base: u32) -> Option<usize> {
    (base..base + SIDEBAND_WINDOW_LEN)
        .contains(&address)
        .then(|| (address - base) as usize)
}

/// Branch-side DPCD and mailbox state.
#[derive(Debug)]
pub(crate) struct Mailbox {
    registers: DpcdRegisters,
    mstm_ctrl: MstmCtrl,
    esi0: Esi0,
    payload_status: PayloadTableStatus,
    down_req: Vec<u8>,
    down_rep: VecDeque<Vec<u8>>,
    up_req: VecDeque<Vec<u8>>,
    up_rep: Vec<u8>,
    up_req_seqno: u8,
}

impl Mailbox {
    pub(crate) fn new(guid: Guid, dpcd_revision: u8) -> Self {
        let mut registers = DpcdRegisters::new();
        registers.write_byte(DP_DPCD_REV, dpcd_revision);
        registers.write_byte(DP_MSTM_CAP, DP_MST_CAP);
        registers.write(DP_GUID, guid.as_bytes());
        Self {
            registers,
            mstm_ctrl: MstmCtrl::empty(),
            esi0: Esi0::empty(),
            payload_status: PayloadTableStatus::empty(),
            down_req: Vec::new(),
            down_rep: VecDeque::new(),
            up_req: VecDeque::new(),
            up_rep: Vec::new(),
            up_req_seqno: 0,
        }
    }

    /// Queues one CONNECTION_STATUS_NOTIFY per change if the source enabled up requests.
    ///
    /// Returns whether `UP_REQ_MSG_RDY` was newly raised.
    pub(crate) fn queue_up_requests(
        &mut self,
        guid: Guid,
        notifications: &[ConnectionStatusNotify],
        max_chunk_len: usize,
    ) -> bool {
        if !self.mstm_ctrl.contains(MstmCtrl::UP_REQ_EN) {
            return false;
        }
        let was_empty = self.up_req.is_empty();
        for csn in notifications {
            let csn = ConnectionStatusNotify { guid, ..csn.clone() };
            let header = up_request_header(self.up_req_seqno);
            self.up_req_seqno ^= 1;
            self.up_req
                .extend(encode_chunks(header, &csn.encode_body(), max_chunk_len));
        }
        debug!(queued = notifications.len(), "CONNECTION_STATUS_NOTIFY queued");
        if was_empty && !self.up_req.is_empty() {
            self.esi0.insert(Esi0::UP_REQ_MSG_RDY);
            return true;
        }
        false
    }

    fn read_byte(&self, address: u32, sink_count: u8) -> u8 {
        if let Some(offset) = in_window(address, DP_SIDEBAND_MSG_DOWN_REP_BASE) {
            return window_byte(self.down_rep.front(), offset);
        }
        if let Some(offset) = in_window(address, DP_SIDEBAND_MSG_UP_REQ_BASE) {
            return window_byte(self.up_req.front(), offset);
        }
        match address {
            DP_MSTM_CTRL => self.mstm_ctrl.bits(),
            DP_SINK_COUNT_ESI => sink_count & 0x3F,
            DP_DEVICE_SERVICE_IRQ_VECTOR_ESI0 => self.esi0.bits(),
            DP_PAYLOAD_TABLE_UPDATE_STATUS => self.payload_status.bits(),
            _ => self.registers.read_byte(address),
        }
    }

    /// Handles a write to ESI0. Returns whether a service bit was re-raised.
    fn ack_esi0(&mut self, value: u8) -> bool {
        let acked = Esi0::from_bits_truncate(value) & self.esi0;
        self.esi0.remove(acked);
        let mut raised = false;
        if acked.contains(Esi0::DOWN_REP_MSG_RDY) {
            self.down_rep.pop_front();
            if !self.down_rep.is_empty() {
                self.esi0.insert(Esi0::DOWN_REP_MSG_RDY);
                raised = true;
            }
        }
        if acked.contains(Esi0::UP_REQ_MSG_RDY) {
            self.up_req.pop_front();
            if !self.up_req.is_empty() {
                self.esi0.insert(Esi0::UP_REQ_MSG_RDY);
                raised = true;
            }
        }
        raised
    }

    fn stage_up_rep(&mut self, offset: usize, value: u8) {
        stage(&mut self.up_rep, offset, value);
        let len = match SidebandHeader::decode(&self.up_rep) {
            Ok(header) => header.encoded_len() + header.msg_len as usize,
            Err(CodecError::Truncated { .. }) => return,
            Err(err) => {
                warn!(%err, "malformed up reply header");
                self.up_rep.clear();
                return;
            }
        };
        if self.up_rep.len() < len {
            return;
        }
        match Chunk::decode(&self.up_rep[..len]) {
            Ok(chunk) => trace!(body = ?chunk.body, "up reply received"),
            Err(err) => warn!(%err, "malformed up reply"),
        }
        self.up_rep.clear();
    }
}

fn window_byte(chunk: Option<&Vec<u8>>, offset: usize) -> u8 {
    chunk.and_then(|c| c.get(offset)).copied().unwrap_or(0)
}

/// Stores `value` at `offset` of a staging buffer. Offset 0 starts a new chunk.
fn stage(buf: &mut Vec<u8>, offset: usize, value: u8) {
    if offset == 0 {
        buf.clear();
    }
    buf.resize(offset, 0);
    buf.push(value);
}

impl Engine {
    pub(crate) fn aux_transfer(&mut self, msg: &mut AuxMsg) -> Result<usize> {
        if msg.buffer.len() > AUX_MAX_PAYLOAD {
            return Err(SimError::OutOfRange {
                offset: msg.address as usize,
                len: msg.buffer.len(),
                size: AUX_MAX_PAYLOAD,
            });
        }
        trace!(request = ?msg.request, address = msg.address, len = msg.buffer.len(), "AUX");

        let mut hpd = false;
        let result = match msg.request {
            AuxRequest::I2cRead | AuxRequest::I2cWrite => {
                msg.reply = AuxReply::I2cNack;
                Ok(0)
            }
            AuxRequest::NativeRead => {
                let sink_count = self
                    .store
                    .downstream_ports()
                    .filter(|(_, p)| p.plug_status)
                    .count() as u8;
                for (i, byte) in msg.buffer.iter_mut().enumerate() {
                    *byte = self.mailbox.read_byte(msg.address.wrapping_add(i as u32), sink_count);
                }
                msg.reply = AuxReply::Ack;
                Ok(msg.buffer.len())
            }
            AuxRequest::NativeWrite => {
                msg.reply = AuxReply::Ack;
                let mut down_req_touched = false;
                for (i, &value) in msg.buffer.iter().enumerate() {
                    let address = msg.address.wrapping_add(i as u32);
                    hpd |= self.aux_write_byte(address, value, &mut down_req_touched);
                }
                if down_req_touched {
                    match self.drain_down_req() {
                        Ok(raised) => hpd |= raised,
                        Err(err) => {
                            debug!(%err, "DOWN_REQ chunk rejected");
                            msg.reply = AuxReply::Nack;
                        }
                    }
                }
                Ok(msg.buffer.len())
            }
        };

        if hpd {
            self.host.notify_hpd_irq();
        }
        result
    }

    fn aux_write_byte(&mut self, address: u32, value: u8, down_req_touched: &mut bool) -> bool {
        let mailbox = &mut self.mailbox;
        if let Some(offset) = in_window(address, DP_SIDEBAND_MSG_DOWN_REQ_BASE) {
            stage(&mut mailbox.down_req, offset, value);
            *down_req_touched = true;
            return false;
        }
        if let Some(offset) = in_window(address, DP_SIDEBAND_MSG_UP_REP_BASE) {
            mailbox.stage_up_rep(offset, value);
            return false;
        }
        match address {
            DP_MSTM_CTRL => {
                mailbox.mstm_ctrl = MstmCtrl::from_bits_truncate(value);
                debug!(mstm_ctrl = ?mailbox.mstm_ctrl, "MSTM_CTRL written");
                false
            }
            DP_DEVICE_SERVICE_IRQ_VECTOR_ESI0 => mailbox.ack_esi0(value),
            DP_PAYLOAD_TABLE_UPDATE_STATUS => {
                let acked = PayloadTableStatus::from_bits_truncate(value);
                mailbox.payload_status.remove(acked);
                false
            }
            DP_PAYLOAD_ALLOCATE_SET..=DP_PAYLOAD_ALLOCATE_TIME_SLOT_COUNT => {
                mailbox.registers.write_byte(address, value);
                mailbox.payload_status =
                    PayloadTableStatus::TABLE_UPDATED | PayloadTableStatus::ACT_HANDLED;
                false
            }
            _ => {
                mailbox.registers.write_byte(address, value);
                false
            }
        }
    }

    /// Runs a fully staged DOWN_REQ chunk. Returns whether an HPD pulse is due.
    fn drain_down_req(&mut self) -> Result<bool> {
        let header = match SidebandHeader::decode(&self.mailbox.down_req) {
            Ok(header) => header,
            Err(CodecError::Truncated { .. }) => return Ok(false),
            Err(err) => {
                self.mailbox.down_req.clear();
                return Err(err.into());
            }
        };
        let len = header.encoded_len() + header.msg_len as usize;
        if self.mailbox.down_req.len() < len {
            return Ok(false);
        }
        let raw: Vec<u8> = self.mailbox.down_req.drain(..).take(len).collect();
        let handled = self.handle_chunk(&raw)?;
        let mut hpd = handled.hpd;
        if let Some(reply) = handled.reply {
            let chunks: Vec<Vec<u8>> = match split_chunks(&reply) {
                Some(chunks) => chunks.into_iter().map(<[u8]>::to_vec).collect(),
                None => vec![reply],
            };
            let was_empty = self.mailbox.down_rep.is_empty();
            self.mailbox.down_rep.extend(chunks);
            if was_empty && !self.mailbox.down_rep.is_empty() {
                self.mailbox.esi0.insert(Esi0::DOWN_REP_MSG_RDY);
                hpd = true;
            }
        }
        Ok(hpd)
    }
}
