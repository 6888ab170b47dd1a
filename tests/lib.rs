//! Shared helpers for the rtcd integration tests.

use rtcd_transport::transport::DatagramSocket;
use rtcd_transport::{MultiConn, UdpConn};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;

/// Upper bound for any single network wait in the tests.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Loopback address with an OS-assigned port.
pub fn localhost() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 0))
}

/// Transport over `n` sockets bound to distinct loopback ports.
///
/// # Panics
/// Panics if a socket cannot be bound or the transport cannot be built.
pub fn distinct_ports(n: usize) -> MultiConn {
    let conns = (0..n)
        .map(|_| {
            Arc::new(UdpConn::bind(localhost()).expect("bind loopback socket"))
                as Arc<dyn DatagramSocket>
        })
        .collect();
    MultiConn::new(conns).expect("build transport")
}

/// Plain tokio UDP socket standing in for a remote peer.
///
/// # Panics
/// Panics if the socket cannot be bound.
pub async fn new_client() -> UdpSocket {
    UdpSocket::bind(localhost())
        .await
        .expect("bind client socket")
}
