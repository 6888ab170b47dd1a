//! Transport configuration.

use crate::multi::RECEIVE_MTU;
use crate::transport::{TransportError, TransportResult};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

/// Default ICE UDP port.
pub const DEFAULT_ICE_PORT_UDP: u16 = 8443;

/// Configuration for the multiplexed UDP transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Local IP the socket pool binds to (unspecified = all interfaces)
    pub ice_address_udp: IpAddr,
    /// UDP port shared by every socket in the pool (0 = OS-assigned)
    pub ice_port_udp: u16,
    /// Number of sockets in the pool (0 = one per CPU)
    pub udp_sockets_count: usize,
    /// Size of each receive buffer in bytes
    pub receive_mtu: usize,
    /// Kernel receive buffer size per socket (None = OS default)
    pub recv_buffer_size: Option<usize>,
    /// Kernel send buffer size per socket (None = OS default)
    pub send_buffer_size: Option<usize>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            ice_address_udp: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            ice_port_udp: DEFAULT_ICE_PORT_UDP,
            udp_sockets_count: 0,
            receive_mtu: RECEIVE_MTU,
            recv_buffer_size: None,
            send_buffer_size: None,
        }
    }
}

impl TransportConfig {
    /// Configuration binding `addr`, other settings default.
    #[must_use]
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            ice_address_udp: addr.ip(),
            ice_port_udp: addr.port(),
            ..Self::default()
        }
    }

    /// Set the pool size.
    #[must_use]
    pub fn with_sockets(mut self, count: usize) -> Self {
        self.udp_sockets_count = count;
        self
    }

    /// Set kernel buffer sizes.
    #[must_use]
    pub fn with_buffer_sizes(mut self, recv_size: usize, send_size: usize) -> Self {
        self.recv_buffer_size = Some(recv_size);
        self.send_buffer_size = Some(send_size);
        self
    }

    /// Address every socket in the pool binds to.
    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ice_address_udp, self.ice_port_udp)
    }

    /// Pool size with `0` resolved to the number of CPUs.
    pub fn effective_sockets_count(&self) -> usize {
        if self.udp_sockets_count == 0 {
            num_cpus::get().max(1)
        } else {
            self.udp_sockets_count
        }
    }

    /// Check the configuration for values the transport cannot work with.
    ///
    /// # Errors
    /// Returns `TransportError::InvalidArgument` describing the first problem.
    pub fn validate(&self) -> TransportResult<()> {
        if self.receive_mtu == 0 {
            return Err(TransportError::InvalidArgument(
                "invalid receive_mtu value: should be positive".to_string(),
            ));
        }
        if self.receive_mtu > u16::MAX as usize {
            return Err(TransportError::InvalidArgument(format!(
                "invalid receive_mtu value: {} exceeds the maximum datagram size",
                self.receive_mtu
            )));
        }
        if self.recv_buffer_size == Some(0) || self.send_buffer_size == Some(0) {
            return Err(TransportError::InvalidArgument(
                "invalid buffer size: should be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = TransportConfig::default();
        assert_eq!(config.ice_port_udp, 8443);
        assert!(config.ice_address_udp.is_unspecified());
        assert_eq!(config.receive_mtu, 8192);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_effective_sockets_count() {
        let config = TransportConfig::default();
        assert!(config.effective_sockets_count() >= 1);
        assert_eq!(config.with_sockets(3).effective_sockets_count(), 3);
    }

    #[test]
    fn test_config_from_addr() {
        let config = TransportConfig::new("127.0.0.1:0".parse().unwrap());
        assert_eq!(config.bind_addr(), "127.0.0.1:0".parse::<SocketAddr>().unwrap());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let config = TransportConfig {
            receive_mtu: 0,
            ..TransportConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(TransportError::InvalidArgument(_))
        ));

        let config = TransportConfig {
            receive_mtu: 70_000,
            ..TransportConfig::default()
        };
        assert!(config.validate().is_err());

        let config = TransportConfig::default().with_buffer_sizes(0, 1024);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: TransportConfig = toml::from_str(
            r#"
            ice_port_udp = 9000
            udp_sockets_count = 2
            "#,
        )
        .unwrap();
        assert_eq!(config.ice_port_udp, 9000);
        assert_eq!(config.udp_sockets_count, 2);
        assert_eq!(config.receive_mtu, RECEIVE_MTU);
        assert!(config.recv_buffer_size.is_none());
    }
}
