//! Configuration file and environment handling for the `rtcd` binary.
//!
//! Settings are read from a TOML file (missing file = defaults) and then
//! overridden by `RTCD_TRANSPORT_*` environment variables, one per
//! [`TransportConfig`] field:
//!
//! ```text
//! RTCD_TRANSPORT_ICE_ADDRESS_UDP=10.0.0.5
//! RTCD_TRANSPORT_ICE_PORT_UDP=8443
//! RTCD_TRANSPORT_UDP_SOCKETS_COUNT=4
//! ```

use anyhow::{Context, anyhow};
use rtcd_transport::TransportConfig;
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::path::Path;
use std::str::FromStr;

/// Prefix of the environment variables overriding `[transport]` settings.
pub const TRANSPORT_ENV_PREFIX: &str = "RTCD_TRANSPORT_";

/// Top-level `rtcd` configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Multiplexed UDP transport settings
    pub transport: TransportConfig,
}

impl Config {
    /// Load configuration from `path`, then apply environment overrides.
    ///
    /// A missing file is not an error: defaults are used instead.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file {}", path.display()))?
        } else {
            tracing::debug!("Config file {} not found, using defaults", path.display());
            Self::default()
        };

        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Override settings from variables resolved through `lookup`.
    pub fn apply_env_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> anyhow::Result<()> {
        let var = |name: &str| {
            let key = format!("{TRANSPORT_ENV_PREFIX}{name}");
            lookup(&key).map(|value| (key, value))
        };
        let t = &mut self.transport;

        if let Some((key, value)) = var("ICE_ADDRESS_UDP") {
            t.ice_address_udp = parse_env(&key, &value)?;
        }
        if let Some((key, value)) = var("ICE_PORT_UDP") {
            t.ice_port_udp = parse_env(&key, &value)?;
        }
        if let Some((key, value)) = var("UDP_SOCKETS_COUNT") {
            t.udp_sockets_count = parse_env(&key, &value)?;
        }
        if let Some((key, value)) = var("RECEIVE_MTU") {
            t.receive_mtu = parse_env(&key, &value)?;
        }
        if let Some((key, value)) = var("RECV_BUFFER_SIZE") {
            t.recv_buffer_size = Some(parse_env(&key, &value)?);
        }
        if let Some((key, value)) = var("SEND_BUFFER_SIZE") {
            t.send_buffer_size = Some(parse_env(&key, &value)?);
        }
        Ok(())
    }

    /// Validate all sections.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.transport
            .validate()
            .context("Invalid [transport] configuration")?;
        Ok(())
    }

    /// Render the configuration as TOML.
    pub fn to_toml(&self) -> anyhow::Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration")
    }
}

fn parse_env<T>(key: &str, value: &str) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| anyhow!("Invalid value {value:?} for {key}: {e}"))
}
