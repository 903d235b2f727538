//! Sidecar configuration

use std::path::Path;

use anyhow::Result;
use peerwire_metering::MeteringConfig;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Environment variable prefix, e.g. `PEERWIRE_LISTEN_ADDR` or
/// `PEERWIRE_METERING__METERED_PEER_LIMIT`
pub const ENV_PREFIX: &str = "PEERWIRE";

/// Relay sidecar configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SidecarConfig {
    /// Address peers connect to
    pub listen_addr: String,
    /// Address every admitted peer is relayed to
    pub upstream_addr: String,
    /// Period of the aggregate traffic log line
    pub stats_interval_secs: u64,
    /// Deadline for a peer to present its node id
    pub handshake_timeout_ms: u64,
    /// Metering subsystem settings
    pub metering: MeteringConfig,
}

impl Default for SidecarConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:30303".to_string(),
            upstream_addr: "127.0.0.1:30304".to_string(),
            stats_interval_secs: 30,
            handshake_timeout_ms: 5000,
            metering: MeteringConfig::default(),
        }
    }
}

impl SidecarConfig {
    /// Load configuration from an optional file and the environment.
    /// Environment variables win over the file; anything unset keeps its
    /// default.
    pub fn load(path: Option<&str>) -> Result<Self> {
        load_env_file(None);

        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(::config::File::with_name(path));
        }
        builder = builder.add_source(
            ::config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let cfg: Self = builder.build()?.try_deserialize()?;
        cfg.metering.validate()?;
        Ok(cfg)
    }
}

/// Load a `.env` file into the process environment, searching upwards from
/// the working directory when `path` is `None`. A missing file is normal;
/// one that exists but cannot be read or parsed is logged and skipped.
/// Returns whether a file was loaded.
pub fn load_env_file(path: Option<&Path>) -> bool {
    let result = match path {
        Some(path) => dotenvy::from_path(path).map(|_| path.to_path_buf()),
        None => dotenvy::dotenv(),
    };
    match result {
        Ok(loaded) => {
            debug!(path = %loaded.display(), "Loaded .env file");
            true
        }
        Err(e) if e.not_found() => false,
        Err(e) => {
            debug!(error = %e, "Failed to load .env file, ignoring it");
            false
        }
    }
}
