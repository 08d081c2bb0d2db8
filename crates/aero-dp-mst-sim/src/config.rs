use serde::{Deserialize, Serialize};

use crate::error::{Result, SimError};
use crate::guid::Guid;
use crate::sideband::{header_len, Limits, SIDEBAND_MAX_CHUNK_LEN, SIDEBAND_MAX_MESSAGE_LEN};
use crate::topology::DEFAULT_DPCD_REVISION;

/// Smallest chunk that still carries a header, one body byte and the body CRC, with room to
/// spare for the RAD of a one-hop path.
pub const MIN_CHUNK_LEN: usize = 8;

/// Branch configuration passed to [`crate::Simulator::create`].
///
/// ```json
/// { "guid": "00112233445566778899aabbccddeeff", "dpcd_revision": 18 }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    /// Branch GUID. Required and non-zero.
    pub guid: Option<Guid>,
    /// DPCD revision reported by the branch and its input port.
    pub dpcd_revision: u8,
    pub limits: Limits,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            guid: None,
            dpcd_revision: DEFAULT_DPCD_REVISION,
            limits: Limits::default(),
        }
    }
}

impl SimConfig {
    pub fn with_guid(guid: Guid) -> Self {
        Self {
            guid: Some(guid),
            ..Default::default()
        }
    }

    /// Checks the configuration and returns the branch GUID.
    pub fn validate(&self) -> Result<Guid> {
        let guid = match self.guid {
            Some(guid) if !guid.is_zero() => guid,
            Some(_) => return Err(SimError::Config("branch GUID must not be zero")),
            None => return Err(SimError::Config("branch GUID is required")),
        };
        if !(MIN_CHUNK_LEN..=SIDEBAND_MAX_CHUNK_LEN).contains(&self.limits.max_chunk_len) {
            return Err(SimError::Config("max_chunk_len must be between 8 and 48"));
        }
        if self.limits.max_message_len <= header_len(1)
            || self.limits.max_message_len > SIDEBAND_MAX_MESSAGE_LEN
        {
            return Err(SimError::Config("max_message_len must be between 4 and 256"));
        }
        Ok(guid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guid_is_required() {
        assert_eq!(
            SimConfig::default().validate().unwrap_err(),
            SimError::Config("branch GUID is required")
        );
        assert!(SimConfig::with_guid(Guid::ZERO).validate().is_err());
        assert!(SimConfig::with_guid(Guid([1; 16])).validate().is_ok());
    }

    #[test]
    fn chunk_limit_is_bounded() {
        let mut config = SimConfig::with_guid(Guid([1; 16]));
        config.limits.max_chunk_len = 64;
        assert!(config.validate().is_err());
        config.limits.max_chunk_len = 16;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn loads_from_json_with_defaults() {
        let config: SimConfig =
            serde_json::from_str(r#"{ "guid": "0102030405060708090a0b0c0d0e0f10" }"#).unwrap();
        assert_eq!(config.dpcd_revision, DEFAULT_DPCD_REVISION);
        assert_eq!(config.limits, Limits::default());
        assert_eq!(config.validate().unwrap().0[0], 0x01);
    }
}
