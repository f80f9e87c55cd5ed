//! Runtime configuration for the central session.

use std::time::Duration;

use serde::Deserialize;
use uuid::Uuid;

use crate::{SERVICE_UUID_A, SERVICE_UUID_B};

/// Tunables for the connection state machine.
///
/// Platform adapters specify no timeouts of their own, so the machine applies
/// a bounded wait to the connecting phase and to each discovery phase; expiry
/// forces a timeout disconnect with best-effort cleanup.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CentralConfig {
    /// Bounded wait on the Connecting phase, in seconds.
    pub connect_timeout_secs: u64,
    /// Bounded wait on each discovery phase, in seconds.
    pub discovery_timeout_secs: u64,
    /// Service UUIDs to scan for and to request during discovery.
    pub scan_services: Vec<Uuid>,
    /// Buffer size of the broadcast data channel.
    pub update_capacity: usize,
}

impl Default for CentralConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 15,
            discovery_timeout_secs: 20,
            scan_services: vec![SERVICE_UUID_A, SERVICE_UUID_B],
            update_capacity: 64,
        }
    }
}

impl CentralConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_secs(self.discovery_timeout_secs)
    }
}

/// Configuration loading failure.
#[cfg(feature = "config-file")]
#[derive(thiserror::Error, Debug)]
pub enum ConfigFileError {
    #[error("configuration error: {0}")]
    Load(#[from] config::ConfigError),
}

/// Load configuration from an optional `blelink.toml` in the working
/// directory, overridden by `BLELINK_*` environment variables. Missing
/// sources fall back to the defaults.
#[cfg(feature = "config-file")]
pub fn load() -> Result<CentralConfig, ConfigFileError> {
    let settings = config::Config::builder()
        .add_source(config::File::with_name("blelink").required(false))
        .add_source(config::Environment::with_prefix("BLELINK"))
        .build()?;
    Ok(settings.try_deserialize()?)
}
