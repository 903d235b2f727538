//! Metering configuration

use peerwire_common::{PeerwireError, Result, DEFAULT_METERED_PEER_LIMIT};
use serde::{Deserialize, Serialize};

use crate::events::DEFAULT_EVENT_BUFFER;

/// Settings for the peer metering subsystem
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeteringConfig {
    /// Global switch; when off, wrapped connections are plain pass-through
    pub enabled: bool,
    /// Maximum number of peers individually metered at once
    pub metered_peer_limit: usize,
    /// Capacity of the lifecycle event broadcast channel
    pub event_buffer: usize,
}

impl Default for MeteringConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            metered_peer_limit: DEFAULT_METERED_PEER_LIMIT,
            event_buffer: DEFAULT_EVENT_BUFFER,
        }
    }
}

impl MeteringConfig {
    /// Configuration with metering switched off
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    pub fn with_peer_limit(mut self, limit: usize) -> Self {
        self.metered_peer_limit = limit;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.event_buffer == 0 {
            return Err(PeerwireError::Config(
                "event_buffer must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
