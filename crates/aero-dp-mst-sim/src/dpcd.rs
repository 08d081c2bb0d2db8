//! DPCD register addresses and a sparse register file.
//!
//! Addresses follow the DisplayPort 1.2 DPCD map. Only the registers the simulator gives
//! meaning to are named here; everything else is plain storage.

use std::collections::BTreeMap;

use bitflags::bitflags;

/// DPCD addresses are 20 bits wide.
pub const DPCD_ADDRESS_MASK: u32 = 0xF_FFFF;

pub const DP_DPCD_REV: u32 = 0x0_0000;
pub const DP_MSTM_CAP: u32 = 0x0_0021;
pub const DP_GUID: u32 = 0x0_0030;
pub const DP_MSTM_CTRL: u32 = 0x0_0111;
pub const DP_PAYLOAD_ALLOCATE_SET: u32 = 0x0_01C0;
pub const DP_PAYLOAD_ALLOCATE_TIME_SLOT_COUNT: u32 = 0x0_01C2;
pub const DP_PAYLOAD_TABLE_UPDATE_STATUS: u32 = 0x0_02C0;

pub const DP_SIDEBAND_MSG_DOWN_REQ_BASE: u32 = 0x0_1000;
pub const DP_SIDEBAND_MSG_UP_REP_BASE: u32 = 0x0_1200;
pub const DP_SIDEBAND_MSG_DOWN_REP_BASE: u32 = 0x0_1400;
pub const DP_SIDEBAND_MSG_UP_REQ_BASE: u32 = 0x0_1600;

pub const DP_SINK_COUNT_ESI: u32 = 0x0_2002;
pub const DP_DEVICE_SERVICE_IRQ_VECTOR_ESI0: u32 = 0x0_2003;

/// `DP_MSTM_CAP` bit 0: the device is MST capable.
pub const DP_MST_CAP: u8 = 1 << 0;

bitflags! {
    /// `DP_MSTM_CTRL` (0x111), written by the source.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MstmCtrl: u8 {
        const MST_EN = 1 << 0;
        const UP_REQ_EN = 1 << 1;
        const UPSTREAM_IS_SRC = 1 << 2;
    }
}

bitflags! {
    /// `DP_DEVICE_SERVICE_IRQ_VECTOR_ESI0` (0x2003). Write-1-to-clear.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Esi0: u8 {
        const REMOTE_CONTROL_COMMAND_PENDING = 1 << 0;
        const AUTOMATED_TEST_REQUEST = 1 << 1;
        const CP_IRQ = 1 << 2;
        const MCCS_IRQ = 1 << 3;
        const DOWN_REP_MSG_RDY = 1 << 4;
        const UP_REQ_MSG_RDY = 1 << 5;
        const SINK_SPECIFIC_IRQ = 1 << 6;
    }
}

bitflags! {
    /// `DP_PAYLOAD_TABLE_UPDATE_STATUS` (0x2C0).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PayloadTableStatus: u8 {
        const TABLE_UPDATED = 1 << 0;
        const ACT_HANDLED = 1 << 1;
    }
}

/// Sparse DPCD register file covering the full 20-bit address space.
///
/// Unwritten registers read as zero. Accesses that run past the top of the address space read
/// zero and drop writes for the out-of-range part, the same permissive behaviour real sinks
/// show for unimplemented registers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DpcdRegisters {
    bytes: BTreeMap<u32, u8>,
}

impl DpcdRegisters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read_byte(&self, address: u32) -> u8 {
        if address > DPCD_ADDRESS_MASK {
            return 0;
        }
        self.bytes.get(&address).copied().unwrap_or(0)
    }

    pub fn write_byte(&mut self, address: u32, value: u8) {
        if address > DPCD_ADDRESS_MASK {
            return;
        }
        if value == 0 {
            self.bytes.remove(&address);
        } else {
            self.bytes.insert(address, value);
        }
    }

    pub fn read(&self, address: u32, len: usize) -> Vec<u8> {
        (0..len)
            .map(|i| {
                u32::try_from(i)
                    .ok()
                    .and_then(|i| address.checked_add(i))
                    .map_or(0, |a| self.read_byte(a))
            })
            .collect()
    }

    pub fn write(&mut self, address: u32, data: &[u8]) {
        for (i, &b) in data.iter().enumerate() {
            let Some(a) = u32::try_from(i).ok().and_then(|i| address.checked_add(i)) else {
                return;
            };
            self.write_byte(a, b);
        }
    }
}
