//! Reply synthesis: turns a decoded down request into the reply a DP 1.2 branch would send.
//!
//! Failures that the protocol can express are NAK replies, never Rust errors, so the host's
//! sideband state machine always gets an answer.

use tracing::{debug, warn};

use crate::error::SimError;
use crate::sideband::{
    AckReply, I2cWrite, LinkAddressPort, NakReason, SidebandReply, SidebandRequest,
    SIDEBAND_MAX_MESSAGE_LEN,
};
use crate::topology::{I2cPointer, PortState, TopologyStore};

/// 7-bit DDC address of the EDID EEPROM.
pub const DDC_ADDR_EDID: u8 = 0x50;
/// 7-bit E-DDC segment pointer address.
pub const DDC_ADDR_SEGMENT: u8 = 0x30;
/// EDID bytes are served in windows of this size, like a DDC read burst.
pub const EDID_WINDOW_LEN: usize = 16;
/// Most data bytes a REMOTE_DPCD_READ or REMOTE_I2C_READ reply carries: the message limit
/// minus the reply type, port and length bytes.
pub const MAX_READ_REPLY_DATA: usize = SIDEBAND_MAX_MESSAGE_LEN - 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Synthesized {
    pub reply: SidebandReply,
    /// Whether the request changed hot-plug relevant state (bandwidth).
    pub mutated: bool,
}

impl Synthesized {
    fn ack(ack: AckReply) -> Self {
        Self {
            reply: SidebandReply::Ack(ack),
            mutated: false,
        }
    }
}

pub fn synthesize(request: &SidebandRequest, store: &mut TopologyStore) -> Synthesized {
    let req_type = request.request_type();
    debug!(?req_type, port = ?request.port(), "sideband request");

    let guid = store.guid();
    let nak = move |reason: NakReason| Synthesized {
        reply: SidebandReply::Nak {
            req_type,
            guid,
            reason,
            data: 0,
        },
        mutated: false,
    };

    let result = match request {
        SidebandRequest::LinkAddress => Synthesized::ack(link_address(store)),
        SidebandRequest::EnumPathResources { port } => match store.get_port(*port as usize) {
            Ok(p) if !p.is_input => Synthesized::ack(AckReply::EnumPathResources {
                port: *port,
                fec_capable: false,
                full_pbn: p.full_bandwidth_pbn,
                available_pbn: p.available_bandwidth_pbn,
            }),
            _ => nak(NakReason::BadParam),
        },
        SidebandRequest::AllocatePayload {
            port, vcpi, pbn, ..
        } => {
            if *vcpi == 0 {
                nak(NakReason::BadParam)
            } else {
                match store.allocate_payload(*port as usize, *vcpi, *pbn) {
                    Ok(mutated) => Synthesized {
                        reply: SidebandReply::Ack(AckReply::AllocatePayload {
                            port: *port,
                            vcpi: *vcpi,
                            allocated_pbn: *pbn,
                        }),
                        mutated,
                    },
                    Err(SimError::InsufficientBandwidth {
                        requested,
                        available,
                        ..
                    }) => {
                        debug!(port, vcpi, requested, available, "payload allocation refused");
                        nak(NakReason::AllocateFail)
                    }
                    Err(_) => nak(NakReason::BadParam),
                }
            }
        }
        SidebandRequest::QueryPayload { port, vcpi } => {
            match store.query_payload(*port as usize, *vcpi) {
                Ok(allocated_pbn) => Synthesized::ack(AckReply::QueryPayload {
                    port: *port,
                    allocated_pbn,
                }),
                Err(_) => nak(NakReason::BadParam),
            }
        }
        SidebandRequest::ClearPayloadIdTable => Synthesized {
            reply: SidebandReply::Ack(AckReply::ClearPayloadIdTable),
            mutated: store.clear_payload_tables(),
        },
        SidebandRequest::RemoteDpcdRead { len, .. } if *len as usize > MAX_READ_REPLY_DATA => {
            debug!(len, "REMOTE_DPCD_READ reply would exceed the message limit");
            nak(NakReason::BadParam)
        }
        SidebandRequest::RemoteDpcdRead { port, address, len } => {
            match store.port_state_mut(*port as usize) {
                Ok((_, state)) => Synthesized::ack(AckReply::RemoteDpcdRead {
                    port: *port,
                    bytes: state.registers.read(*address, *len as usize),
                }),
                Err(_) => nak(NakReason::BadParam),
            }
        }
        SidebandRequest::RemoteDpcdWrite {
            port,
            address,
            bytes,
        } => match store.port_state_mut(*port as usize) {
            Ok((_, state)) => {
                state.registers.write(*address, bytes);
                Synthesized::ack(AckReply::RemoteDpcdWrite { port: *port })
            }
            Err(_) => nak(NakReason::BadParam),
        },
        SidebandRequest::RemoteI2cRead {
            port,
            writes,
            read_device,
            len,
        } => match remote_i2c_read(store, *port, writes, *read_device, *len) {
            Ok(bytes) => Synthesized::ack(AckReply::RemoteI2cRead { port: *port, bytes }),
            Err(reason) => nak(reason),
        },
        SidebandRequest::RemoteI2cWrite {
            port,
            device,
            bytes,
        } => match store.port_state_mut(*port as usize) {
            Ok((_, state)) => match apply_i2c_write(state, *device, bytes) {
                Ok(()) => Synthesized::ack(AckReply::RemoteI2cWrite { port: *port }),
                Err(reason) => nak(reason),
            },
            Err(_) => nak(NakReason::BadParam),
        },
        SidebandRequest::PowerUpPhy { port } => match downstream(store, *port) {
            Ok(()) => Synthesized::ack(AckReply::PowerUpPhy { port: *port }),
            Err(reason) => nak(reason),
        },
        SidebandRequest::PowerDownPhy { port } => match downstream(store, *port) {
            Ok(()) => Synthesized::ack(AckReply::PowerDownPhy { port: *port }),
            Err(reason) => nak(reason),
        },
        SidebandRequest::Unsupported { req_type, .. } => {
            debug!(?req_type, "unsupported sideband request");
            nak(NakReason::BadParam)
        }
    };

    let len = result.reply.encode_body().len();
    if len > SIDEBAND_MAX_MESSAGE_LEN {
        warn!(?req_type, len, "reply exceeds sideband message limit");
        return Synthesized {
            mutated: result.mutated,
            ..nak(NakReason::BadParam)
        };
    }
    result
}

fn downstream(store: &TopologyStore, port: u8) -> Result<(), NakReason> {
    match store.get_port(port as usize) {
        Ok(p) if !p.is_input => Ok(()),
        _ => Err(NakReason::BadParam),
    }
}

fn link_address(store: &TopologyStore) -> AckReply {
    let ports = store
        .downstream_ports()
        .map(|(number, p)| LinkAddressPort {
            input: false,
            peer_device_type: p.peer_device_type,
            port_number: number,
            message_capability: p.message_capability,
            plug_status: p.plug_status,
            legacy_plug_status: p.legacy_plug_status,
            dpcd_revision: p.dpcd_revision,
            peer_guid: p.peer_guid,
            num_sdp_streams: p.stream_count,
            num_sdp_stream_sinks: p.stream_sink_count,
        })
        .collect();
    AckReply::LinkAddress {
        guid: store.guid(),
        ports,
    }
}

/// Applies one I2C write stage: the EDID word offset (0x50) or the E-DDC segment (0x30).
fn apply_i2c_write(state: &mut PortState, device: u8, bytes: &[u8]) -> Result<(), NakReason> {
    match device {
        DDC_ADDR_EDID => {
            if let Some(&offset) = bytes.first() {
                state.i2c.offset = offset;
            }
            Ok(())
        }
        DDC_ADDR_SEGMENT => {
            if let Some(&segment) = bytes.first() {
                state.i2c.segment = segment;
            }
            Ok(())
        }
        _ => Err(NakReason::I2cNak),
    }
}

fn remote_i2c_read(
    store: &mut TopologyStore,
    port: u8,
    writes: &[I2cWrite],
    read_device: u8,
    len: u8,
) -> Result<Vec<u8>, NakReason> {
    if len as usize > MAX_READ_REPLY_DATA {
        debug!(port, len, "REMOTE_I2C_READ reply would exceed the message limit");
        return Err(NakReason::BadParam);
    }
    let index = port as usize;
    let pointer = {
        let (_, state) = store
            .port_state_mut(index)
            .map_err(|_| NakReason::BadParam)?;
        for w in writes {
            apply_i2c_write(state, w.device, &w.bytes)?;
        }
        if read_device != DDC_ADDR_EDID {
            return Err(NakReason::I2cNak);
        }
        state.i2c
    };

    let start = pointer.linear();
    let len = len as usize;
    let mut bytes = Vec::with_capacity(len);
    while bytes.len() < len {
        let window = EDID_WINDOW_LEN.min(len - bytes.len());
        let offset = start + bytes.len();
        match store.get_edid_window(index, offset, window) {
            Ok(chunk) => bytes.extend_from_slice(chunk),
            Err(err) => {
                debug!(port, %err, "EDID read past end");
                return Err(NakReason::I2cNak);
            }
        }
    }

    if let Ok((_, state)) = store.port_state_mut(index) {
        state.i2c = I2cPointer {
            segment: 0,
            offset: pointer.offset.wrapping_add(len as u8),
        };
    }
    Ok(bytes)
}
