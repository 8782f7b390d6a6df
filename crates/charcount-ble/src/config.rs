//! BLE session configuration

use std::time::Duration;

use charcount_core::{WireCodec, DEFAULT_MAX_PAYLOAD_LEN};
use serde::{Deserialize, Serialize};

// ----------------------------------------------------------------------------
// Configuration
// ----------------------------------------------------------------------------

/// How the coordinator decides two discovered games are the same
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DedupPolicy {
    /// Same game id
    #[default]
    ById,
    /// Same game name, as older CharCount builds did
    ByName,
}

/// Configuration for both BLE roles
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BleSessionConfig {
    /// Longest a single browse or join exchange may hold the connection slot
    pub connection_timeout: Duration,
    /// Maximum encoded payload size
    pub max_payload_len: usize,
    /// Drop the link once the game info has been read
    pub disconnect_after_browse: bool,
    /// Start scanning as soon as the radio is powered on
    pub scan_on_power_on: bool,
    /// Re-advertise automatically when the radio comes back after a power-off
    pub resume_advertising: bool,
    /// Discovered game de-duplication
    pub dedup: DedupPolicy,
}

impl Default for BleSessionConfig {
    fn default() -> Self {
        Self {
            connection_timeout: Duration::from_secs(10),
            max_payload_len: DEFAULT_MAX_PAYLOAD_LEN,
            disconnect_after_browse: true,
            scan_on_power_on: true,
            resume_advertising: true,
            dedup: DedupPolicy::ById,
        }
    }
}

impl BleSessionConfig {
    /// Create a new configuration with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Set connection timeout
    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    /// Set maximum payload size
    pub fn with_max_payload_len(mut self, size: usize) -> Self {
        self.max_payload_len = size;
        self
    }

    pub fn with_disconnect_after_browse(mut self, enabled: bool) -> Self {
        self.disconnect_after_browse = enabled;
        self
    }

    pub fn with_scan_on_power_on(mut self, enabled: bool) -> Self {
        self.scan_on_power_on = enabled;
        self
    }

    pub fn with_resume_advertising(mut self, enabled: bool) -> Self {
        self.resume_advertising = enabled;
        self
    }

    pub fn with_dedup(mut self, dedup: DedupPolicy) -> Self {
        self.dedup = dedup;
        self
    }

    /// Codec honouring the configured payload limit
    pub fn codec(&self) -> WireCodec {
        WireCodec::new(self.max_payload_len)
    }
}
