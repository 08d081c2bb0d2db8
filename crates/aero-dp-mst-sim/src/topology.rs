//! Simulated branch topology: the branch GUID, its ports and their runtime state.
//!
//! Port numbers are list indices. Port 0 is always the upstream-facing input port and is created
//! with the store; [`TopologyStore::replace_ports`] swaps the downstream list (`1..`) wholesale.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::dpcd::{DpcdRegisters, DP_DPCD_REV};
use crate::error::{Result, SimError};
use crate::guid::Guid;
use crate::sideband::{ConnectionStatusNotify, PeerDeviceType};

/// Port numbers are 4-bit on the wire, and a LINK_ADDRESS reply carrying every downstream port
/// must fit a 256-byte message (18 + 20 bytes per port).
pub const MAX_DOWNSTREAM_PORTS: usize = 11;

/// Largest value of the 4-bit SDP stream count fields.
pub const MAX_SDP_STREAMS: u8 = 15;

pub const DEFAULT_DPCD_REVISION: u8 = 0x12;

/// Read-only EDID blob shared between the topology and in-flight replies.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<u8>", into = "Vec<u8>")]
pub struct Edid(Arc<[u8]>);

impl Edid {
    pub fn new(bytes: impl Into<Arc<[u8]>>) -> Self {
        Self(bytes.into())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// `len` bytes starting at `offset`, if the whole window lies inside the blob.
    pub fn window(&self, offset: usize, len: usize) -> Option<&[u8]> {
        let end = offset.checked_add(len)?;
        self.0.get(offset..end)
    }
}

impl core::fmt::Debug for Edid {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Edid").field("len", &self.0.len()).finish()
    }
}

impl From<Vec<u8>> for Edid {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes.into())
    }
}

impl From<Edid> for Vec<u8> {
    fn from(edid: Edid) -> Self {
        edid.0.to_vec()
    }
}

/// Initial contents for part of a port's remote DPCD register file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DpcdSeed {
    pub address: u32,
    pub bytes: Vec<u8>,
}

/// One simulated port, as configured by the scenario driver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Port {
    pub is_input: bool,
    pub message_capability: bool,
    pub plug_status: bool,
    pub legacy_plug_status: bool,
    pub peer_device_type: PeerDeviceType,
    pub dpcd_revision: u8,
    pub peer_guid: Guid,
    pub stream_count: u8,
    pub stream_sink_count: u8,
    pub full_bandwidth_pbn: u16,
    pub available_bandwidth_pbn: u16,
    pub edid: Option<Edid>,
    pub dpcd: Vec<DpcdSeed>,
}

impl Default for Port {
    fn default() -> Self {
        Self {
            is_input: false,
            message_capability: false,
            plug_status: false,
            legacy_plug_status: false,
            peer_device_type: PeerDeviceType::None,
            dpcd_revision: DEFAULT_DPCD_REVISION,
            peer_guid: Guid::ZERO,
            stream_count: 0,
            stream_sink_count: 0,
            full_bandwidth_pbn: 0,
            available_bandwidth_pbn: 0,
            edid: None,
            dpcd: Vec::new(),
        }
    }
}

impl Port {
    /// The branch's upstream-facing port.
    pub fn input(dpcd_revision: u8) -> Self {
        Self {
            is_input: true,
            message_capability: true,
            plug_status: true,
            peer_device_type: PeerDeviceType::SourceOrSst,
            dpcd_revision,
            ..Default::default()
        }
    }

    /// A plugged SST sink with the given link bandwidth, fully available.
    pub fn sst_sink(pbn: u16) -> Self {
        Self {
            plug_status: true,
            legacy_plug_status: true,
            peer_device_type: PeerDeviceType::SstSink,
            stream_count: 1,
            stream_sink_count: 1,
            full_bandwidth_pbn: pbn,
            available_bandwidth_pbn: pbn,
            ..Default::default()
        }
    }

    pub fn with_edid(mut self, edid: impl Into<Edid>) -> Self {
        self.edid = Some(edid.into());
        self
    }

    /// Attributes whose change the host must be told about.
    fn hotplug_view(&self) -> (bool, PeerDeviceType, u16, u16) {
        (
            self.plug_status,
            self.peer_device_type,
            self.full_bandwidth_pbn,
            self.available_bandwidth_pbn,
        )
    }
}

/// Remote I2C pointer used for EDID reads (E-DDC segment plus in-segment offset).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct I2cPointer {
    pub segment: u8,
    pub offset: u8,
}

impl I2cPointer {
    pub fn linear(&self) -> usize {
        self.segment as usize * 256 + self.offset as usize
    }
}

/// Mutable per-port state driven by sideband requests.
#[derive(Debug, Clone, Default)]
pub struct PortState {
    pub registers: DpcdRegisters,
    /// VCPI to allocated PBN.
    pub payloads: BTreeMap<u8, u16>,
    pub i2c: I2cPointer,
}

impl PortState {
    fn seeded(port: &Port) -> Self {
        let mut registers = DpcdRegisters::new();
        for seed in &port.dpcd {
            registers.write(seed.address, &seed.bytes);
        }
        registers.write_byte(DP_DPCD_REV, port.dpcd_revision);
        Self {
            registers,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone)]
struct PortSlot {
    port: Port,
    state: PortState,
}

impl PortSlot {
    fn new(port: Port) -> Self {
        let state = PortState::seeded(&port);
        Self { port, state }
    }
}

/// Outcome of a successful [`TopologyStore::replace_ports`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopologyChange {
    /// One notification per port that appeared, disappeared or changed hot-plug attributes.
    pub notifications: Vec<ConnectionStatusNotify>,
}

impl TopologyChange {
    pub fn needs_hpd(&self) -> bool {
        !self.notifications.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct TopologyStore {
    guid: Guid,
    ports: Vec<PortSlot>,
}

impl TopologyStore {
    pub fn new(guid: Guid, dpcd_revision: u8) -> Self {
        Self {
            guid,
            ports: vec![PortSlot::new(Port::input(dpcd_revision))],
        }
    }

    pub fn guid(&self) -> Guid {
        self.guid
    }

    /// Number of ports, input port included.
    pub fn port_count(&self) -> usize {
        self.ports.len()
    }

    pub fn get_port(&self, index: usize) -> Result<&Port> {
        self.ports
            .get(index)
            .map(|slot| &slot.port)
            .ok_or(SimError::PortNotFound(index))
    }

    pub fn ports(&self) -> impl Iterator<Item = &Port> {
        self.ports.iter().map(|slot| &slot.port)
    }

    /// Downstream ports with their wire port numbers.
    pub fn downstream_ports(&self) -> impl Iterator<Item = (u8, &Port)> {
        self.ports
            .iter()
            .enumerate()
            .filter(|(_, slot)| !slot.port.is_input)
            .map(|(i, slot)| (i as u8, &slot.port))
    }

    /// Runtime state of a downstream port. The input port has no remote state.
    pub fn port_state_mut(&mut self, index: usize) -> Result<(&Port, &mut PortState)> {
        match self.ports.get_mut(index) {
            Some(slot) if !slot.port.is_input => Ok((&slot.port, &mut slot.state)),
            _ => Err(SimError::PortNotFound(index)),
        }
    }

    pub fn get_edid_window(&self, index: usize, offset: usize, len: usize) -> Result<&[u8]> {
        let port = self.get_port(index)?;
        let size = port.edid.as_ref().map_or(0, Edid::len);
        port.edid
            .as_ref()
            .and_then(|edid| edid.window(offset, len))
            .ok_or(SimError::OutOfRange { offset, len, size })
    }

    /// Replaces every downstream port with `new_ports`, in order, and resets runtime state.
    ///
    /// The input port is kept. Nothing changes if validation fails.
    pub fn replace_ports(&mut self, new_ports: &[Port]) -> Result<TopologyChange> {
        self.validate(new_ports)?;

        let old: Vec<&Port> = self.ports.iter().skip(1).map(|slot| &slot.port).collect();
        let mut notifications = Vec::new();
        for i in 0..old.len().max(new_ports.len()) {
            let before = old.get(i).map(|p| p.hotplug_view());
            let after = new_ports.get(i).map(Port::hotplug_view);
            if before != after {
                notifications.push(self.connection_status((i + 1) as u8, new_ports.get(i)));
            }
        }

        let input = PortSlot::new(self.ports[0].port.clone());
        self.ports = std::iter::once(input)
            .chain(new_ports.iter().cloned().map(PortSlot::new))
            .collect();

        info!(
            ports = new_ports.len(),
            changed = notifications.len(),
            "topology replaced"
        );
        Ok(TopologyChange { notifications })
    }

    fn connection_status(&self, port_number: u8, port: Option<&Port>) -> ConnectionStatusNotify {
        match port {
            Some(p) => ConnectionStatusNotify {
                port_number,
                guid: self.guid,
                legacy_plug_status: p.legacy_plug_status,
                plug_status: p.plug_status,
                message_capability: p.message_capability,
                input: false,
                peer_device_type: p.peer_device_type,
            },
            None => ConnectionStatusNotify {
                port_number,
                guid: self.guid,
                legacy_plug_status: false,
                plug_status: false,
                message_capability: false,
                input: false,
                peer_device_type: PeerDeviceType::None,
            },
        }
    }

    fn validate(&self, new_ports: &[Port]) -> Result<()> {
        if new_ports.len() > MAX_DOWNSTREAM_PORTS {
            return Err(SimError::InvalidTopology(format!(
                "{} downstream ports, at most {MAX_DOWNSTREAM_PORTS} supported",
                new_ports.len()
            )));
        }
        let mut branch_guids: Vec<Guid> = Vec::new();
        for (i, port) in new_ports.iter().enumerate() {
            let number = i + 1;
            if port.is_input {
                return Err(SimError::InvalidTopology(format!(
                    "port {number}: the input port cannot be redefined"
                )));
            }
            if port.available_bandwidth_pbn > port.full_bandwidth_pbn {
                return Err(SimError::InvalidTopology(format!(
                    "port {number}: available PBN {} exceeds full PBN {}",
                    port.available_bandwidth_pbn, port.full_bandwidth_pbn
                )));
            }
            if port.stream_count > MAX_SDP_STREAMS || port.stream_sink_count > MAX_SDP_STREAMS {
                return Err(SimError::InvalidTopology(format!(
                    "port {number}: SDP stream counts must not exceed {MAX_SDP_STREAMS}"
                )));
            }
            if port.peer_device_type == PeerDeviceType::MstBranch {
                let guid = port.peer_guid;
                if guid.is_zero() || guid == self.guid || branch_guids.contains(&guid) {
                    return Err(SimError::InvalidTopology(format!(
                        "port {number}: branch peer needs a unique non-zero GUID, got {guid}"
                    )));
                }
                branch_guids.push(guid);
            }
        }
        Ok(())
    }

    /// Sets the PBN allocated to `vcpi` on a downstream port, returning whether anything changed.
    ///
    /// Amounts are absolute: growing an allocation consumes the difference from the port's
    /// available bandwidth, shrinking it returns the difference (capped at full bandwidth), and
    /// `pbn == 0` releases the VCPI.
    pub fn allocate_payload(&mut self, index: usize, vcpi: u8, pbn: u16) -> Result<bool> {
        let slot = match self.ports.get_mut(index) {
            Some(slot) if !slot.port.is_input => slot,
            _ => return Err(SimError::PortNotFound(index)),
        };
        let current = slot.state.payloads.get(&vcpi).copied().unwrap_or(0);
        let port = &mut slot.port;
        if pbn > current {
            let requested = pbn - current;
            if requested > port.available_bandwidth_pbn {
                return Err(SimError::InsufficientBandwidth {
                    port: index,
                    requested,
                    available: port.available_bandwidth_pbn,
                });
            }
            port.available_bandwidth_pbn -= requested;
        } else {
            let returned = current - pbn;
            port.available_bandwidth_pbn = port
                .available_bandwidth_pbn
                .saturating_add(returned)
                .min(port.full_bandwidth_pbn);
        }
        if pbn == 0 {
            slot.state.payloads.remove(&vcpi);
        } else {
            slot.state.payloads.insert(vcpi, pbn);
        }
        debug!(
            port = index,
            vcpi,
            pbn,
            available = slot.port.available_bandwidth_pbn,
            "payload allocation"
        );
        Ok(pbn != current)
    }

    pub fn query_payload(&self, index: usize, vcpi: u8) -> Result<u16> {
        match self.ports.get(index) {
            Some(slot) if !slot.port.is_input => {
                Ok(slot.state.payloads.get(&vcpi).copied().unwrap_or(0))
            }
            _ => Err(SimError::PortNotFound(index)),
        }
    }

    /// Releases every payload on every port. Returns whether any allocation existed.
    pub fn clear_payload_tables(&mut self) -> bool {
        let mut changed = false;
        for slot in &mut self.ports {
            if slot.state.payloads.is_empty() {
                continue;
            }
            let allocated: u32 = slot.state.payloads.values().map(|&p| p as u32).sum();
            changed = true;
            slot.state.payloads.clear();
            let port = &mut slot.port;
            let restored = (port.available_bandwidth_pbn as u32 + allocated)
                .min(port.full_bandwidth_pbn as u32);
            port.available_bandwidth_pbn = restored as u16;
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn store() -> TopologyStore {
        TopologyStore::new(Guid([0x11; 16]), 0x12)
    }

    #[test]
    fn new_store_has_only_the_input_port() {
        let s = store();
        assert_eq!(s.port_count(), 1);
        assert!(s.get_port(0).unwrap().is_input);
        assert_eq!(s.downstream_ports().count(), 0);
        assert_eq!(s.get_port(1).unwrap_err(), SimError::PortNotFound(1));
    }

    #[test]
    fn replace_reports_changes_once_per_port() {
        let mut s = store();
        let change = s.replace_ports(&[Port::sst_sink(960)]).unwrap();
        assert_eq!(change.notifications.len(), 1);
        assert_eq!(change.notifications[0].port_number, 1);
        assert!(change.notifications[0].plug_status);

        let change = s.replace_ports(&[Port::sst_sink(960)]).unwrap();
        assert!(!change.needs_hpd());

        let change = s.replace_ports(&[]).unwrap();
        assert_eq!(change.notifications.len(), 1);
        assert!(!change.notifications[0].plug_status);
    }

    #[test]
    fn invalid_replacements_change_nothing() {
        let mut s = store();
        s.replace_ports(&[Port::sst_sink(100)]).unwrap();

        let mut bad = Port::sst_sink(100);
        bad.available_bandwidth_pbn = 101;
        assert!(matches!(
            s.replace_ports(&[bad]),
            Err(SimError::InvalidTopology(_))
        ));
        assert!(matches!(
            s.replace_ports(&[Port::input(0x12)]),
            Err(SimError::InvalidTopology(_))
        ));
        let too_many = vec![Port::sst_sink(1); MAX_DOWNSTREAM_PORTS + 1];
        assert!(s.replace_ports(&too_many).is_err());

        let branch = Port {
            peer_device_type: PeerDeviceType::MstBranch,
            peer_guid: Guid([0x22; 16]),
            ..Port::sst_sink(10)
        };
        assert!(s.replace_ports(&[branch.clone(), branch]).is_err());

        assert_eq!(s.port_count(), 2);
        assert_eq!(s.get_port(1).unwrap().full_bandwidth_pbn, 100);
    }

    #[test]
    fn edid_windows_never_pad() {
        let mut s = store();
        s.replace_ports(&[Port::sst_sink(10).with_edid(vec![7u8; 128])])
            .unwrap();
        assert_eq!(s.get_edid_window(1, 112, 16).unwrap(), &[7u8; 16][..]);
        assert_eq!(
            s.get_edid_window(1, 120, 16).unwrap_err(),
            SimError::OutOfRange {
                offset: 120,
                len: 16,
                size: 128
            }
        );
    }

    #[test]
    fn payload_amounts_are_absolute() {
        let mut s = store();
        s.replace_ports(&[Port::sst_sink(100)]).unwrap();

        assert!(s.allocate_payload(1, 1, 60).unwrap());
        assert_eq!(s.get_port(1).unwrap().available_bandwidth_pbn, 40);
        assert_eq!(
            s.allocate_payload(1, 2, 50).unwrap_err(),
            SimError::InsufficientBandwidth {
                port: 1,
                requested: 50,
                available: 40
            }
        );
        assert_eq!(s.get_port(1).unwrap().available_bandwidth_pbn, 40);

        assert!(s.allocate_payload(1, 1, 20).unwrap());
        assert_eq!(s.get_port(1).unwrap().available_bandwidth_pbn, 80);
        assert_eq!(s.query_payload(1, 1).unwrap(), 20);

        assert!(s.clear_payload_tables());
        assert_eq!(s.get_port(1).unwrap().available_bandwidth_pbn, 100);
        assert_eq!(s.query_payload(1, 1).unwrap(), 0);
        assert!(!s.clear_payload_tables());
    }

    #[test]
    fn input_port_has_no_payloads() {
        let mut s = store();
        assert_eq!(
            s.allocate_payload(0, 1, 1).unwrap_err(),
            SimError::PortNotFound(0)
        );
    }

    #[test]
    fn replacement_reseeds_registers() {
        let mut s = store();
        let port = Port {
            dpcd_revision: 0x14,
            dpcd: vec![DpcdSeed {
                address: 0x100,
                bytes: vec![1, 2],
            }],
            ..Port::sst_sink(10)
        };
        s.replace_ports(&[port.clone()]).unwrap();
        s.port_state_mut(1).unwrap().1.registers.write_byte(0x100, 9);
        s.replace_ports(&[port]).unwrap();
        let (_, state) = s.port_state_mut(1).unwrap();
        assert_eq!(state.registers.read(0, 1), vec![0x14]);
        assert_eq!(state.registers.read(0x100, 2), vec![1, 2]);
    }

    #[test]
    fn port_config_loads_from_json() {
        let port: Port = serde_json::from_str(
            r#"{ "plug_status": true, "peer_device_type": "sst_sink",
                 "full_bandwidth_pbn": 960, "available_bandwidth_pbn": 960,
                 "edid": [0, 255, 255] }"#,
        )
        .unwrap();
        assert_eq!(port.peer_device_type, PeerDeviceType::SstSink);
        assert_eq!(port.dpcd_revision, DEFAULT_DPCD_REVISION);
        assert_eq!(port.edid.unwrap().as_bytes(), &[0, 255, 255]);
    }
}
