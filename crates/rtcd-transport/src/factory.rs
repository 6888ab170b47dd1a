//! UDP socket pool creation.
//!
//! The relay listens on a single ICE UDP port but spreads the kernel work
//! over several sockets. Every socket in the pool is bound to the same
//! address with `SO_REUSEADDR` and, on unix, `SO_REUSEPORT`, so the kernel
//! load-balances inbound datagrams between them.

use crate::config::TransportConfig;
use crate::transport::{DatagramSocket, TransportError, TransportResult};
use crate::udp::UdpConn;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::SocketAddr;

/// Bind a single pool member to `addr`.
///
/// Kernel buffer sizes from `config` are applied best effort: the OS may
/// clamp or refuse them, which is logged and otherwise ignored.
///
/// # Errors
/// Returns `TransportError::BindFailed` if the socket cannot be created or bound.
pub fn bind_udp_socket(addr: SocketAddr, config: &TransportConfig) -> TransportResult<UdpConn> {
    let bind_err = |e: std::io::Error| TransportError::BindFailed(format!("{addr}: {e}"));

    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))
        .map_err(bind_err)?;
    socket.set_reuse_address(true).map_err(bind_err)?;
    #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
    socket.set_reuse_port(true).map_err(bind_err)?;

    if let Some(size) = config.recv_buffer_size
        && let Err(e) = socket.set_recv_buffer_size(size)
    {
        tracing::warn!("Failed to set receive buffer size to {}: {}", size, e);
    }
    if let Some(size) = config.send_buffer_size
        && let Err(e) = socket.set_send_buffer_size(size)
    {
        tracing::warn!("Failed to set send buffer size to {}: {}", size, e);
    }

    socket.bind(&addr.into()).map_err(bind_err)?;
    socket.set_nonblocking(true).map_err(bind_err)?;

    UdpConn::from_std(socket.into()).map_err(bind_err)
}

/// Bind the socket pool described by `config`.
///
/// With port 0 the first socket's OS-assigned port is reused for the rest,
/// so the whole pool always shares one port. Must be called from within a
/// tokio runtime.
///
/// # Errors
/// Returns an error if the configuration is invalid or any socket fails to bind.
pub fn bind_udp_pool(config: &TransportConfig) -> TransportResult<Vec<UdpConn>> {
    config.validate()?;

    let count = config.effective_sockets_count();
    let mut addr = config.bind_addr();
    let mut conns = Vec::with_capacity(count);

    for _ in 0..count {
        let conn = bind_udp_socket(addr, config)?;
        if addr.port() == 0 {
            let bound = conn
                .local_addr()
                .map_err(|e| TransportError::BindFailed(format!("{addr}: {e}")))?;
            addr.set_port(bound.port());
        }
        conns.push(conn);
    }

    tracing::info!("Bound {} UDP socket(s) on {}", conns.len(), addr);
    Ok(conns)
}
