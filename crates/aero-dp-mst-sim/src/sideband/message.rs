//! Typed sideband message bodies and their wire encodings.
//!
//! Layouts follow DisplayPort 1.2 section 2.11.9 (down requests and replies) and 2.11.10 (up
//! requests). Port numbers are 4-bit fields; request bodies place them in the high nibble of
//! their second byte, while DPCD and I2C replies place them in the low nibble.

use serde::{Deserialize, Serialize};

use super::CodecError;
use crate::guid::Guid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RequestType {
    GetMsgTransactionVersion = 0x00,
    LinkAddress = 0x01,
    ConnectionStatusNotify = 0x02,
    EnumPathResources = 0x10,
    AllocatePayload = 0x11,
    QueryPayload = 0x12,
    ResourceStatusNotify = 0x13,
    ClearPayloadIdTable = 0x14,
    RemoteDpcdRead = 0x20,
    RemoteDpcdWrite = 0x21,
    RemoteI2cRead = 0x22,
    RemoteI2cWrite = 0x23,
    PowerUpPhy = 0x24,
    PowerDownPhy = 0x25,
    SinkEventNotify = 0x30,
    QueryStreamEncStatus = 0x38,
}

impl TryFrom<u8> for RequestType {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0x00 => RequestType::GetMsgTransactionVersion,
            0x01 => RequestType::LinkAddress,
            0x02 => RequestType::ConnectionStatusNotify,
            0x10 => RequestType::EnumPathResources,
            0x11 => RequestType::AllocatePayload,
            0x12 => RequestType::QueryPayload,
            0x13 => RequestType::ResourceStatusNotify,
            0x14 => RequestType::ClearPayloadIdTable,
            0x20 => RequestType::RemoteDpcdRead,
            0x21 => RequestType::RemoteDpcdWrite,
            0x22 => RequestType::RemoteI2cRead,
            0x23 => RequestType::RemoteI2cWrite,
            0x24 => RequestType::PowerUpPhy,
            0x25 => RequestType::PowerDownPhy,
            0x30 => RequestType::SinkEventNotify,
            0x38 => RequestType::QueryStreamEncStatus,
            other => return Err(CodecError::UnknownRequestType(other)),
        })
    }
}

impl RequestType {
    /// Broadcast messages travel with `LCT = 1, LCR = 6` and no RAD.
    pub fn is_broadcast(self) -> bool {
        matches!(
            self,
            RequestType::ConnectionStatusNotify
                | RequestType::ResourceStatusNotify
                | RequestType::ClearPayloadIdTable
        )
    }

    /// Path messages are processed by every branch along the route.
    pub fn is_path_msg(self) -> bool {
        matches!(
            self,
            RequestType::EnumPathResources
                | RequestType::AllocatePayload
                | RequestType::ClearPayloadIdTable
                | RequestType::PowerUpPhy
                | RequestType::PowerDownPhy
        )
    }
}

/// Reason byte of a NAK reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NakReason {
    WriteFailure = 0x01,
    InvalidRead = 0x02,
    CrcFailure = 0x03,
    BadParam = 0x04,
    Defer = 0x05,
    LinkFailure = 0x06,
    NoResources = 0x07,
    DpcdFail = 0x08,
    I2cNak = 0x09,
    AllocateFail = 0x0A,
}

impl TryFrom<u8> for NakReason {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0x01 => NakReason::WriteFailure,
            0x02 => NakReason::InvalidRead,
            0x03 => NakReason::CrcFailure,
            0x04 => NakReason::BadParam,
            0x05 => NakReason::Defer,
            0x06 => NakReason::LinkFailure,
            0x07 => NakReason::NoResources,
            0x08 => NakReason::DpcdFail,
            0x09 => NakReason::I2cNak,
            0x0A => NakReason::AllocateFail,
            _ => return Err(CodecError::InvalidField("nak reason")),
        })
    }
}

/// Peer device type (3-bit field in LINK_ADDRESS and CONNECTION_STATUS_NOTIFY).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum PeerDeviceType {
    #[default]
    None = 0,
    SourceOrSst = 1,
    MstBranch = 2,
    SstSink = 3,
    DpLegacyConverter = 4,
    DpWirelessConverter = 5,
    WirelessDpConverter = 6,
}

impl TryFrom<u8> for PeerDeviceType {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => PeerDeviceType::None,
            1 => PeerDeviceType::SourceOrSst,
            2 => PeerDeviceType::MstBranch,
            3 => PeerDeviceType::SstSink,
            4 => PeerDeviceType::DpLegacyConverter,
            5 => PeerDeviceType::DpWirelessConverter,
            6 => PeerDeviceType::WirelessDpConverter,
            _ => return Err(CodecError::InvalidField("peer device type")),
        })
    }
}

/// One write stage of a REMOTE_I2C_READ request (typically the EDID offset or segment).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct I2cWrite {
    pub device: u8,
    pub bytes: Vec<u8>,
    pub no_stop: bool,
    pub delay: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SidebandRequest {
    LinkAddress,
    EnumPathResources {
        port: u8,
    },
    AllocatePayload {
        port: u8,
        vcpi: u8,
        pbn: u16,
        sdp_stream_sinks: Vec<u8>,
    },
    QueryPayload {
        port: u8,
        vcpi: u8,
    },
    ClearPayloadIdTable,
    /// Addresses past the 20-bit DPCD space read back as zeros. A `len` above 253 is NAKed with
    /// BAD_PARAM since the reply would not fit in one 256-byte message.
    RemoteDpcdRead {
        port: u8,
        address: u32,
        len: u8,
    },
    RemoteDpcdWrite {
        port: u8,
        address: u32,
        bytes: Vec<u8>,
    },
    /// Same 253-byte `len` cap as [`SidebandRequest::RemoteDpcdRead`]; an oversized read is
    /// refused before the `writes` touch the device pointer.
    RemoteI2cRead {
        port: u8,
        writes: Vec<I2cWrite>,
        read_device: u8,
        len: u8,
    },
    RemoteI2cWrite {
        port: u8,
        device: u8,
        bytes: Vec<u8>,
    },
    PowerUpPhy {
        port: u8,
    },
    PowerDownPhy {
        port: u8,
    },
    /// A DP-defined request the simulator does not model. Answered with a NAK.
    Unsupported {
        req_type: RequestType,
        body: Vec<u8>,
    },
}

impl SidebandRequest {
    pub fn request_type(&self) -> RequestType {
        match self {
            SidebandRequest::LinkAddress => RequestType::LinkAddress,
            SidebandRequest::EnumPathResources { .. } => RequestType::EnumPathResources,
            SidebandRequest::AllocatePayload { .. } => RequestType::AllocatePayload,
            SidebandRequest::QueryPayload { .. } => RequestType::QueryPayload,
            SidebandRequest::ClearPayloadIdTable => RequestType::ClearPayloadIdTable,
            SidebandRequest::RemoteDpcdRead { .. } => RequestType::RemoteDpcdRead,
            SidebandRequest::RemoteDpcdWrite { .. } => RequestType::RemoteDpcdWrite,
            SidebandRequest::RemoteI2cRead { .. } => RequestType::RemoteI2cRead,
            SidebandRequest::RemoteI2cWrite { .. } => RequestType::RemoteI2cWrite,
            SidebandRequest::PowerUpPhy { .. } => RequestType::PowerUpPhy,
            SidebandRequest::PowerDownPhy { .. } => RequestType::PowerDownPhy,
            SidebandRequest::Unsupported { req_type, .. } => *req_type,
        }
    }

    /// Port number the request addresses, for port-scoped requests.
    pub fn port(&self) -> Option<u8> {
        match self {
            SidebandRequest::EnumPathResources { port }
            | SidebandRequest::AllocatePayload { port, .. }
            | SidebandRequest::QueryPayload { port, .. }
            | SidebandRequest::RemoteDpcdRead { port, .. }
            | SidebandRequest::RemoteDpcdWrite { port, .. }
            | SidebandRequest::RemoteI2cRead { port, .. }
            | SidebandRequest::RemoteI2cWrite { port, .. }
            | SidebandRequest::PowerUpPhy { port }
            | SidebandRequest::PowerDownPhy { port } => Some(*port),
            SidebandRequest::LinkAddress
            | SidebandRequest::ClearPayloadIdTable
            | SidebandRequest::Unsupported { .. } => None,
        }
    }

    pub fn encode_body(&self) -> Vec<u8> {
        let mut out = vec![self.request_type() as u8];
        match self {
            SidebandRequest::LinkAddress | SidebandRequest::ClearPayloadIdTable => {}
            SidebandRequest::EnumPathResources { port }
            | SidebandRequest::PowerUpPhy { port }
            | SidebandRequest::PowerDownPhy { port } => out.push((port & 0xF) << 4),
            SidebandRequest::AllocatePayload {
                port,
                vcpi,
                pbn,
                sdp_stream_sinks,
            } => {
                out.push(((port & 0xF) << 4) | (sdp_stream_sinks.len() as u8 & 0xF));
                out.push(vcpi & 0x7F);
                out.extend_from_slice(&pbn.to_be_bytes());
                for pair in sdp_stream_sinks.chunks(2) {
                    let lo = pair.get(1).copied().unwrap_or(0) & 0xF;
                    out.push(((pair[0] & 0xF) << 4) | lo);
                }
            }
            SidebandRequest::QueryPayload { port, vcpi } => {
                out.push((port & 0xF) << 4);
                out.push(vcpi & 0x7F);
            }
            SidebandRequest::RemoteDpcdRead { port, address, len } => {
                push_dpcd_address(&mut out, *port, *address);
                out.push(*len);
            }
            SidebandRequest::RemoteDpcdWrite {
                port,
                address,
                bytes,
            } => {
                push_dpcd_address(&mut out, *port, *address);
                out.push(bytes.len() as u8);
                out.extend_from_slice(bytes);
            }
            SidebandRequest::RemoteI2cRead {
                port,
                writes,
                read_device,
                len,
            } => {
                out.push(((port & 0xF) << 4) | (writes.len() as u8 & 0x3));
                for w in writes {
                    out.push(w.device & 0x7F);
                    out.push(w.bytes.len() as u8);
                    out.extend_from_slice(&w.bytes);
                    out.push(((w.no_stop as u8) << 4) | (w.delay & 0xF));
                }
                out.push(read_device & 0x7F);
                out.push(*len);
            }
            SidebandRequest::RemoteI2cWrite {
                port,
                device,
                bytes,
            } => {
                out.push((port & 0xF) << 4);
                out.push(device & 0x7F);
                out.push(bytes.len() as u8);
                out.extend_from_slice(bytes);
            }
            SidebandRequest::Unsupported { body, .. } => out.extend_from_slice(body),
        }
        out
    }

    /// Decodes a complete request body. Every byte must be consumed.
    pub fn decode_body(body: &[u8]) -> Result<Self, CodecError> {
        let mut r = Reader::new(body);
        let first = r.u8()?;
        if first & 0x80 != 0 {
            return Err(CodecError::UnknownRequestType(first));
        }
        let req_type = RequestType::try_from(first)?;
        let req = match req_type {
            RequestType::LinkAddress => SidebandRequest::LinkAddress,
            RequestType::ClearPayloadIdTable => SidebandRequest::ClearPayloadIdTable,
            RequestType::EnumPathResources => SidebandRequest::EnumPathResources {
                port: r.u8()? >> 4,
            },
            RequestType::PowerUpPhy => SidebandRequest::PowerUpPhy { port: r.u8()? >> 4 },
            RequestType::PowerDownPhy => SidebandRequest::PowerDownPhy { port: r.u8()? >> 4 },
            RequestType::AllocatePayload => {
                let b = r.u8()?;
                let streams = (b & 0xF) as usize;
                let vcpi = r.u8()? & 0x7F;
                let pbn = r.u16_be()?;
                let packed = r.bytes(streams.div_ceil(2))?;
                let sdp_stream_sinks = (0..streams)
                    .map(|i| {
                        let byte = packed[i / 2];
                        if i % 2 == 0 {
                            byte >> 4
                        } else {
                            byte & 0xF
                        }
                    })
                    .collect();
                SidebandRequest::AllocatePayload {
                    port: b >> 4,
                    vcpi,
                    pbn,
                    sdp_stream_sinks,
                }
            }
            RequestType::QueryPayload => SidebandRequest::QueryPayload {
                port: r.u8()? >> 4,
                vcpi: r.u8()? & 0x7F,
            },
            RequestType::RemoteDpcdRead => {
                let (port, address) = read_dpcd_address(&mut r)?;
                SidebandRequest::RemoteDpcdRead {
                    port,
                    address,
                    len: r.u8()?,
                }
            }
            RequestType::RemoteDpcdWrite => {
                let (port, address) = read_dpcd_address(&mut r)?;
                let n = r.u8()? as usize;
                SidebandRequest::RemoteDpcdWrite {
                    port,
                    address,
                    bytes: r.bytes(n)?.to_vec(),
                }
            }
            RequestType::RemoteI2cRead => {
                let b = r.u8()?;
                let mut writes = Vec::new();
                for _ in 0..(b & 0x3) {
                    let device = r.u8()? & 0x7F;
                    let n = r.u8()? as usize;
                    let bytes = r.bytes(n)?.to_vec();
                    let flags = r.u8()?;
                    writes.push(I2cWrite {
                        device,
                        bytes,
                        no_stop: flags & 0x10 != 0,
                        delay: flags & 0xF,
                    });
                }
                SidebandRequest::RemoteI2cRead {
                    port: b >> 4,
                    writes,
                    read_device: r.u8()? & 0x7F,
                    len: r.u8()?,
                }
            }
            RequestType::RemoteI2cWrite => {
                let port = r.u8()? >> 4;
                let device = r.u8()? & 0x7F;
                let n = r.u8()? as usize;
                SidebandRequest::RemoteI2cWrite {
                    port,
                    device,
                    bytes: r.bytes(n)?.to_vec(),
                }
            }
            RequestType::GetMsgTransactionVersion
            | RequestType::ConnectionStatusNotify
            | RequestType::ResourceStatusNotify
            | RequestType::SinkEventNotify
            | RequestType::QueryStreamEncStatus => {
                let rest = r.rest().to_vec();
                return Ok(SidebandRequest::Unsupported {
                    req_type,
                    body: rest,
                });
            }
        };
        r.finish(req_type as u8)?;
        Ok(req)
    }

    /// Length of the complete request body, if `prefix` holds enough of it to tell.
    ///
    /// Used by reassembly to reject continuation chunks that overrun the request. Requests the
    /// simulator does not model have no derivable length.
    pub fn expected_len(prefix: &[u8]) -> Option<usize> {
        let req_type = RequestType::try_from(*prefix.first()?).ok()?;
        match req_type {
            RequestType::LinkAddress | RequestType::ClearPayloadIdTable => Some(1),
            RequestType::EnumPathResources
            | RequestType::PowerUpPhy
            | RequestType::PowerDownPhy => Some(2),
            RequestType::QueryPayload => Some(3),
            RequestType::RemoteDpcdRead => Some(5),
            RequestType::RemoteDpcdWrite => prefix.get(4).map(|&n| 5 + n as usize),
            RequestType::AllocatePayload => {
                prefix.get(1).map(|&b| 5 + ((b & 0xF) as usize).div_ceil(2))
            }
            RequestType::RemoteI2cWrite => prefix.get(3).map(|&n| 4 + n as usize),
            RequestType::RemoteI2cRead => {
                let count = prefix.get(1)? & 0x3;
                let mut idx = 2usize;
                for _ in 0..count {
                    let n = *prefix.get(idx + 1)? as usize;
                    idx += 2 + n + 1;
                }
                Some(idx + 2)
            }
            RequestType::GetMsgTransactionVersion
            | RequestType::ConnectionStatusNotify
            | RequestType::ResourceStatusNotify
            | RequestType::SinkEventNotify
            | RequestType::QueryStreamEncStatus => None,
        }
    }
}

fn push_dpcd_address(out: &mut Vec<u8>, port: u8, address: u32) {
    out.push(((port & 0xF) << 4) | ((address >> 16) & 0xF) as u8);
    out.push((address >> 8) as u8);
    out.push(address as u8);
}

fn read_dpcd_address(r: &mut Reader<'_>) -> Result<(u8, u32), CodecError> {
    let b = r.u8()?;
    let hi = r.u8()?;
    let lo = r.u8()?;
    let address = (((b & 0xF) as u32) << 16) | ((hi as u32) << 8) | lo as u32;
    Ok((b >> 4, address))
}

/// One port record of a LINK_ADDRESS reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkAddressPort {
    pub input: bool,
    pub peer_device_type: PeerDeviceType,
    pub port_number: u8,
    pub message_capability: bool,
    pub plug_status: bool,
    pub legacy_plug_status: bool,
    pub dpcd_revision: u8,
    pub peer_guid: Guid,
    pub num_sdp_streams: u8,
    pub num_sdp_stream_sinks: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckReply {
    LinkAddress {
        guid: Guid,
        ports: Vec<LinkAddressPort>,
    },
    ConnectionStatusNotify,
    EnumPathResources {
        port: u8,
        fec_capable: bool,
        full_pbn: u16,
        available_pbn: u16,
    },
    AllocatePayload {
        port: u8,
        vcpi: u8,
        allocated_pbn: u16,
    },
    QueryPayload {
        port: u8,
        allocated_pbn: u16,
    },
    ClearPayloadIdTable,
    RemoteDpcdRead {
        port: u8,
        bytes: Vec<u8>,
    },
    RemoteDpcdWrite {
        port: u8,
    },
    RemoteI2cRead {
        port: u8,
        bytes: Vec<u8>,
    },
    RemoteI2cWrite {
        port: u8,
    },
    PowerUpPhy {
        port: u8,
    },
    PowerDownPhy {
        port: u8,
    },
}

impl AckReply {
    pub fn request_type(&self) -> RequestType {
        match self {
            AckReply::LinkAddress { .. } => RequestType::LinkAddress,
            AckReply::ConnectionStatusNotify => RequestType::ConnectionStatusNotify,
            AckReply::EnumPathResources { .. } => RequestType::EnumPathResources,
            AckReply::AllocatePayload { .. } => RequestType::AllocatePayload,
            AckReply::QueryPayload { .. } => RequestType::QueryPayload,
            AckReply::ClearPayloadIdTable => RequestType::ClearPayloadIdTable,
            AckReply::RemoteDpcdRead { .. } => RequestType::RemoteDpcdRead,
            AckReply::RemoteDpcdWrite { .. } => RequestType::RemoteDpcdWrite,
            AckReply::RemoteI2cRead { .. } => RequestType::RemoteI2cRead,
            AckReply::RemoteI2cWrite { .. } => RequestType::RemoteI2cWrite,
            AckReply::PowerUpPhy { .. } => RequestType::PowerUpPhy,
            AckReply::PowerDownPhy { .. } => RequestType::PowerDownPhy,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SidebandReply {
    Ack(AckReply),
    Nak {
        req_type: RequestType,
        guid: Guid,
        reason: NakReason,
        data: u8,
    },
}

impl SidebandReply {
    pub fn request_type(&self) -> RequestType {
        match self {
            SidebandReply::Ack(ack) => ack.request_type(),
            SidebandReply::Nak { req_type, .. } => *req_type,
        }
    }

    pub fn is_nak(&self) -> bool {
        matches!(self, SidebandReply::Nak { .. })
    }

    pub fn encode_body(&self) -> Vec<u8> {
        let ack = match self {
            SidebandReply::Nak {
                req_type,
                guid,
                reason,
                data,
            } => {
                let mut out = vec![0x80 | *req_type as u8];
                out.extend_from_slice(guid.as_bytes());
                out.push(*reason as u8);
                out.push(*data);
                return out;
            }
            SidebandReply::Ack(ack) => ack,
        };

        let mut out = vec![ack.request_type() as u8];
        match ack {
            AckReply::LinkAddress { guid, ports } => {
                out.extend_from_slice(guid.as_bytes());
                out.push(ports.len() as u8);
                for p in ports {
                    out.push(
                        ((p.input as u8) << 7)
                            | ((p.peer_device_type as u8 & 0x7) << 4)
                            | (p.port_number & 0xF),
                    );
                    let mut status =
                        ((p.message_capability as u8) << 7) | ((p.plug_status as u8) << 6);
                    if !p.input {
                        status |= (p.legacy_plug_status as u8) << 5;
                    }
                    out.push(status);
                    if !p.input {
                        out.push(p.dpcd_revision);
                        out.extend_from_slice(p.peer_guid.as_bytes());
                        out.push(((p.num_sdp_streams & 0xF) << 4) | (p.num_sdp_stream_sinks & 0xF));
                    }
                }
            }
            AckReply::ConnectionStatusNotify | AckReply::ClearPayloadIdTable => {}
            AckReply::EnumPathResources {
                port,
                fec_capable,
                full_pbn,
                available_pbn,
            } => {
                out.push(((port & 0xF) << 4) | *fec_capable as u8);
                out.extend_from_slice(&full_pbn.to_be_bytes());
                out.extend_from_slice(&available_pbn.to_be_bytes());
            }
            AckReply::AllocatePayload {
                port,
                vcpi,
                allocated_pbn,
            } => {
                out.push((port & 0xF) << 4);
                out.push(*vcpi);
                out.extend_from_slice(&allocated_pbn.to_be_bytes());
            }
            AckReply::QueryPayload {
                port,
                allocated_pbn,
            } => {
                out.push((port & 0xF) << 4);
                out.extend_from_slice(&allocated_pbn.to_be_bytes());
            }
            AckReply::RemoteDpcdRead { port, bytes } | AckReply::RemoteI2cRead { port, bytes } => {
                out.push(port & 0xF);
                out.push(bytes.len() as u8);
                out.extend_from_slice(bytes);
            }
            AckReply::RemoteDpcdWrite { port } | AckReply::RemoteI2cWrite { port } => {
                out.push(port & 0xF)
            }
            AckReply::PowerUpPhy { port } | AckReply::PowerDownPhy { port } => {
                out.push((port & 0xF) << 4)
            }
        }
        out
    }

    /// Decodes a complete reply body. Every byte must be consumed.
    pub fn decode_body(body: &[u8]) -> Result<Self, CodecError> {
        let mut r = Reader::new(body);
        let first = r.u8()?;
        let req_type = RequestType::try_from(first & 0x7F)?;
        if first & 0x80 != 0 {
            let guid = r.guid()?;
            let reason = NakReason::try_from(r.u8()?)?;
            let data = r.u8()?;
            r.finish(first)?;
            return Ok(SidebandReply::Nak {
                req_type,
                guid,
                reason,
                data,
            });
        }

        let ack = match req_type {
            RequestType::LinkAddress => {
                let guid = r.guid()?;
                let count = r.u8()?;
                let mut ports = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    let b0 = r.u8()?;
                    let b1 = r.u8()?;
                    let input = b0 & 0x80 != 0;
                    let mut port = LinkAddressPort {
                        input,
                        peer_device_type: PeerDeviceType::try_from((b0 >> 4) & 0x7)?,
                        port_number: b0 & 0xF,
                        message_capability: b1 & 0x80 != 0,
                        plug_status: b1 & 0x40 != 0,
                        legacy_plug_status: false,
                        dpcd_revision: 0,
                        peer_guid: Guid::ZERO,
                        num_sdp_streams: 0,
                        num_sdp_stream_sinks: 0,
                    };
                    if !input {
                        port.legacy_plug_status = b1 & 0x20 != 0;
                        port.dpcd_revision = r.u8()?;
                        port.peer_guid = r.guid()?;
                        let streams = r.u8()?;
                        port.num_sdp_streams = streams >> 4;
                        port.num_sdp_stream_sinks = streams & 0xF;
                    }
                    ports.push(port);
                }
                AckReply::LinkAddress { guid, ports }
            }
            RequestType::ConnectionStatusNotify => AckReply::ConnectionStatusNotify,
            RequestType::ClearPayloadIdTable => AckReply::ClearPayloadIdTable,
            RequestType::EnumPathResources => {
                let b = r.u8()?;
                AckReply::EnumPathResources {
                    port: b >> 4,
                    fec_capable: b & 0x1 != 0,
                    full_pbn: r.u16_be()?,
                    available_pbn: r.u16_be()?,
                }
            }
            RequestType::AllocatePayload => AckReply::AllocatePayload {
                port: r.u8()? >> 4,
                vcpi: r.u8()?,
                allocated_pbn: r.u16_be()?,
            },
            RequestType::QueryPayload => AckReply::QueryPayload {
                port: r.u8()? >> 4,
                allocated_pbn: r.u16_be()?,
            },
            RequestType::RemoteDpcdRead | RequestType::RemoteI2cRead => {
                let port = r.u8()? & 0xF;
                let n = r.u8()? as usize;
                let bytes = r.bytes(n)?.to_vec();
                if req_type == RequestType::RemoteDpcdRead {
                    AckReply::RemoteDpcdRead { port, bytes }
                } else {
                    AckReply::RemoteI2cRead { port, bytes }
                }
            }
            RequestType::RemoteDpcdWrite => AckReply::RemoteDpcdWrite {
                port: r.u8()? & 0xF,
            },
            RequestType::RemoteI2cWrite => AckReply::RemoteI2cWrite {
                port: r.u8()? & 0xF,
            },
            RequestType::PowerUpPhy => AckReply::PowerUpPhy { port: r.u8()? >> 4 },
            RequestType::PowerDownPhy => AckReply::PowerDownPhy { port: r.u8()? >> 4 },
            RequestType::GetMsgTransactionVersion
            | RequestType::ResourceStatusNotify
            | RequestType::SinkEventNotify
            | RequestType::QueryStreamEncStatus => {
                return Err(CodecError::UnknownRequestType(first))
            }
        };
        r.finish(first)?;
        Ok(SidebandReply::Ack(ack))
    }
}

/// CONNECTION_STATUS_NOTIFY up-request body, sent by the branch when a port changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionStatusNotify {
    pub port_number: u8,
    pub guid: Guid,
    pub legacy_plug_status: bool,
    pub plug_status: bool,
    pub message_capability: bool,
    pub input: bool,
    pub peer_device_type: PeerDeviceType,
}

impl ConnectionStatusNotify {
    pub fn encode_body(&self) -> Vec<u8> {
        let mut out = vec![
            RequestType::ConnectionStatusNotify as u8,
            (self.port_number & 0xF) << 4,
        ];
        out.extend_from_slice(self.guid.as_bytes());
        out.push(
            ((self.legacy_plug_status as u8) << 6)
                | ((self.plug_status as u8) << 5)
                | ((self.message_capability as u8) << 4)
                | ((self.input as u8) << 3)
                | (self.peer_device_type as u8 & 0x7),
        );
        out
    }

    pub fn decode_body(body: &[u8]) -> Result<Self, CodecError> {
        let mut r = Reader::new(body);
        let first = r.u8()?;
        if first != RequestType::ConnectionStatusNotify as u8 {
            return Err(CodecError::UnknownRequestType(first));
        }
        let port_number = r.u8()? >> 4;
        let guid = r.guid()?;
        let b = r.u8()?;
        r.finish(first)?;
        Ok(Self {
            port_number,
            guid,
            legacy_plug_status: b & 0x40 != 0,
            plug_status: b & 0x20 != 0,
            message_capability: b & 0x10 != 0,
            input: b & 0x08 != 0,
            peer_device_type: PeerDeviceType::try_from(b & 0x7)?,
        })
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn u8(&mut self) -> Result<u8, CodecError> {
        let b = *self.buf.get(self.pos).ok_or(CodecError::Truncated {
            len: self.buf.len(),
            min: self.pos + 1,
        })?;
        self.pos += 1;
        Ok(b)
    }

    fn u16_be(&mut self) -> Result<u16, CodecError> {
        Ok(u16::from_be_bytes([self.u8()?, self.u8()?]))
    }

    fn bytes(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        let end = self.pos + n;
        if end > self.buf.len() {
            return Err(CodecError::Truncated {
                len: self.buf.len(),
                min: end,
            });
        }
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn guid(&mut self) -> Result<Guid, CodecError> {
        let mut out = [0u8; 16];
        out.copy_from_slice(self.bytes(16)?);
        Ok(Guid(out))
    }

    fn rest(&mut self) -> &'a [u8] {
        let out = &self.buf[self.pos..];
        self.pos = self.buf.len();
        out
    }

    fn finish(&self, msg_type: u8) -> Result<(), CodecError> {
        if self.pos != self.buf.len() {
            return Err(CodecError::TrailingBytes {
                msg_type,
                extra: self.buf.len() - self.pos,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn dpcd_read_request_layout() {
        let req = SidebandRequest::RemoteDpcdRead {
            port: 2,
            address: 0x2_0304,
            len: 16,
        };
        let body = req.encode_body();
        assert_eq!(body, vec![0x20, 0x22, 0x03, 0x04, 0x10]);
        assert_eq!(SidebandRequest::decode_body(&body).unwrap(), req);
        assert_eq!(SidebandRequest::expected_len(&body[..1]), Some(5));
    }

    #[test]
    fn allocate_payload_packs_sink_nibbles() {
        let req = SidebandRequest::AllocatePayload {
            port: 1,
            vcpi: 3,
            pbn: 0x0123,
            sdp_stream_sinks: vec![0, 1, 2],
        };
        let body = req.encode_body();
        assert_eq!(body, vec![0x11, 0x13, 0x03, 0x01, 0x23, 0x01, 0x20]);
        assert_eq!(SidebandRequest::expected_len(&body[..2]), Some(7));
        assert_eq!(SidebandRequest::decode_body(&body).unwrap(), req);
    }

    #[test]
    fn i2c_read_length_is_derived_from_transactions() {
        let req = SidebandRequest::RemoteI2cRead {
            port: 1,
            writes: vec![I2cWrite {
                device: 0x50,
                bytes: vec![0x80],
                no_stop: false,
                delay: 0,
            }],
            read_device: 0x50,
            len: 128,
        };
        let body = req.encode_body();
        assert_eq!(SidebandRequest::expected_len(&body), Some(body.len()));
        assert_eq!(SidebandRequest::expected_len(&body[..3]), None);
        assert_eq!(SidebandRequest::decode_body(&body).unwrap(), req);
    }

    #[test]
    fn trailing_request_bytes_are_rejected() {
        let err = SidebandRequest::decode_body(&[0x01, 0x00]).unwrap_err();
        assert_eq!(
            err,
            CodecError::TrailingBytes {
                msg_type: 0x01,
                extra: 1
            }
        );
    }

    #[test]
    fn unknown_request_types_are_rejected() {
        assert_eq!(
            SidebandRequest::decode_body(&[0x7E]).unwrap_err(),
            CodecError::UnknownRequestType(0x7E)
        );
        assert_eq!(
            SidebandRequest::decode_body(&[0x81]).unwrap_err(),
            CodecError::UnknownRequestType(0x81)
        );
    }

    #[test]
    fn unmodelled_request_types_decode_as_unsupported() {
        let req = SidebandRequest::decode_body(&[0x38, 0xAA, 0xBB]).unwrap();
        assert_eq!(
            req,
            SidebandRequest::Unsupported {
                req_type: RequestType::QueryStreamEncStatus,
                body: vec![0xAA, 0xBB],
            }
        );
    }

    #[test]
    fn link_address_reply_layout() {
        let reply = SidebandReply::Ack(AckReply::LinkAddress {
            guid: Guid([7; 16]),
            ports: vec![LinkAddressPort {
                input: false,
                peer_device_type: PeerDeviceType::SstSink,
                port_number: 1,
                message_capability: false,
                plug_status: true,
                legacy_plug_status: true,
                dpcd_revision: 0x12,
                peer_guid: Guid::ZERO,
                num_sdp_streams: 1,
                num_sdp_stream_sinks: 1,
            }],
        });
        let body = reply.encode_body();
        assert_eq!(body.len(), 1 + 16 + 1 + 20);
        assert_eq!(body[18], 0x31);
        assert_eq!(body[19], 0x60);
        assert_eq!(body[20], 0x12);
        assert_eq!(body[37], 0x11);
        assert_eq!(SidebandReply::decode_body(&body).unwrap(), reply);
    }

    #[test]
    fn nak_reply_layout() {
        let reply = SidebandReply::Nak {
            req_type: RequestType::AllocatePayload,
            guid: Guid([1; 16]),
            reason: NakReason::AllocateFail,
            data: 0,
        };
        let body = reply.encode_body();
        assert_eq!(body[0], 0x91);
        assert_eq!(body[17], 0x0A);
        assert_eq!(SidebandReply::decode_body(&body).unwrap(), reply);
    }

    #[test]
    fn connection_status_notify_layout() {
        let csn = ConnectionStatusNotify {
            port_number: 3,
            guid: Guid([2; 16]),
            legacy_plug_status: false,
            plug_status: true,
            message_capability: true,
            input: false,
            peer_device_type: PeerDeviceType::SstSink,
        };
        let body = csn.encode_body();
        assert_eq!(body.len(), 19);
        assert_eq!(body[1], 0x30);
        assert_eq!(body[18], 0x33);
        assert_eq!(ConnectionStatusNotify::decode_body(&body).unwrap(), csn);
    }
}
