//! Software model of a DisplayPort 1.2 MST branch device.
//!
//! The simulator sits where an AUX channel transport would hand bytes to real silicon. A host
//! driver under test talks to it exactly as it would to a physical branch:
//!
//! - [`Simulator::transfer`]: one MST sideband request chunk in, encoded reply chunks out;
//! - [`Simulator::aux_transfer`]: native AUX access to the branch's own DPCD, including the
//!   DOWN_REQ/DOWN_REP/UP_REQ/UP_REP mailboxes and the ESI service-IRQ vector;
//! - [`Simulator::update`]: a scenario driver swaps the downstream port list (hot plug).
//!
//! Host notifications (HPD IRQ pulses, reply overrides) go through [`HostBridge`].
//!
//! Only the DP 1.2 sideband message set and EDID passthrough are modelled; there is no link
//! training or electrical-layer timing.
#![forbid(unsafe_code)]

pub mod aux;
pub mod config;
pub mod dpcd;
mod error;
mod guid;
pub mod host;
pub mod sideband;
mod sim;
pub mod synth;
pub mod topology;

pub use aux::{AuxMsg, AuxReply, AuxRequest};
pub use config::SimConfig;
pub use error::{status_of, Result, SimError};
pub use guid::{Guid, ParseGuidError};
pub use host::{HostBridge, HostCallbacks};
pub use sideband::{CodecError, Limits, PeerDeviceType};
pub use sim::{SidebandMsg, Simulator, TransferStatus};
pub use topology::{DpcdSeed, Edid, Port};
