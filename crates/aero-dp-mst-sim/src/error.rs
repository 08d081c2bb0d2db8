use thiserror::Error;

use crate::sideband::CodecError;

pub type Result<T> = std::result::Result<T, SimError>;

/// Unified error type for the MST branch simulator.
///
/// Every fallible entry point returns this type. [`SimError::status_code`] maps each variant to
/// the negative status code expected by C-style host glue (`0` means success).
///
/// [`SimError::InsufficientBandwidth`] and [`SimError::OutOfRange`] are produced by the topology
/// store but never escape [`crate::Simulator::transfer`]: the reply synthesizer turns them into
/// NAK replies so the sideband protocol stays live.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SimError {
    #[error("invalid configuration: {0}")]
    Config(&'static str),

    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    #[error("malformed sideband message: {0}")]
    MalformedMessage(#[from] CodecError),

    #[error("port {0} not found")]
    PortNotFound(usize),

    #[error("invalid topology: {0}")]
    InvalidTopology(String),

    #[error("insufficient bandwidth on port {port}: need {requested} PBN, {available} available")]
    InsufficientBandwidth {
        port: usize,
        requested: u16,
        available: u16,
    },

    #[error("out of range: offset={offset} len={len} size={size}")]
    OutOfRange { offset: usize, len: usize, size: usize },

    #[error("reply buffer too small: need {needed} bytes, have {capacity}")]
    BufferTooSmall { needed: usize, capacity: usize },
}

impl SimError {
    /// Negative errno-style status code for this error kind.
    pub fn status_code(&self) -> i32 {
        match self {
            SimError::Config(_) => -22, // EINVAL
            SimError::InvalidState(_) => -1, // EPERM
            SimError::MalformedMessage(_) => -71, // EPROTO
            SimError::PortNotFound(_) => -6, // ENXIO
            SimError::InvalidTopology(_) => -34, // ERANGE
            SimError::InsufficientBandwidth { .. } => -28, // ENOSPC
            SimError::OutOfRange { .. } => -33, // EDOM
            SimError::BufferTooSmall { .. } => -105, // ENOBUFS
        }
    }
}

/// Collapses a `Result` into the status-code convention used by C-style callers.
pub fn status_of<T>(result: &Result<T>) -> i32 {
    match result {
        Ok(_) => 0,
        Err(err) => err.status_code(),
    }
}
