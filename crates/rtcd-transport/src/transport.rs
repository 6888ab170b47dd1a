//! Packet connection traits and shared error types.
//!
//! Two seams are defined here:
//!
//! - [`Transport`] is what the protocol stack above (ICE agent, DTLS) talks to.
//!   It looks exactly like a single unconnected datagram socket.
//! - [`DatagramSocket`] is what a [`MultiConn`](crate::multi::MultiConn) is built
//!   from. Besides the usual datagram operations it reports the local
//!   destination IP of every received packet and accepts an explicit source IP
//!   when sending.

use async_trait::async_trait;
use std::io;
use std::net::{IpAddr, SocketAddr};
use thiserror::Error;
use tokio::time::Instant;

/// Errors returned by transport operations.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Invalid argument supplied at construction or configuration time
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Failed to bind a socket
    #[error("Bind failed: {0}")]
    BindFailed(String),

    /// A read or write deadline expired
    #[error("I/O timeout")]
    Timeout,

    /// Underlying socket error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The transport has been closed
    #[error("Transport closed")]
    Closed,

    /// Any other error
    #[error("{0}")]
    Other(String),
}

impl TransportError {
    /// Map a socket error, classifying deadline expiry as [`TransportError::Timeout`].
    pub fn from_io(err: io::Error) -> Self {
        if is_timeout(&err) {
            Self::Timeout
        } else {
            Self::Io(err)
        }
    }

    /// Whether this error is transient (a deadline expired).
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
    }
}

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// Whether a socket error reports an expired deadline.
pub fn is_timeout(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::TimedOut
}

/// Traffic counters for a transport.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportStats {
    /// Total payload bytes sent
    pub bytes_sent: u64,
    /// Total payload bytes received
    pub bytes_received: u64,
    /// Datagrams sent
    pub packets_sent: u64,
    /// Datagrams received
    pub packets_received: u64,
    /// Failed sends
    pub send_errors: u64,
    /// Receive errors delivered to readers
    pub recv_errors: u64,
}

/// A packet-oriented connection.
///
/// Deadlines are absolute instants; `None` clears a deadline. Once a read
/// deadline has passed, reads fail with [`TransportError::Timeout`] until the
/// deadline is cleared or moved into the future.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a datagram to `addr`.
    async fn send_to(&self, buf: &[u8], addr: SocketAddr) -> TransportResult<usize>;

    /// Receive the next datagram into `buf`, returning its length and sender.
    ///
    /// A datagram longer than `buf` is truncated; the returned length is the
    /// number of bytes copied, as with `std::net::UdpSocket::recv_from`.
    async fn recv_from(&self, buf: &mut [u8]) -> TransportResult<(usize, SocketAddr)>;

    /// Local address of the transport.
    fn local_addr(&self) -> TransportResult<SocketAddr>;

    /// Set both the read and write deadline.
    fn set_deadline(&self, deadline: Option<Instant>) -> TransportResult<()>;

    /// Set the read deadline.
    fn set_read_deadline(&self, deadline: Option<Instant>) -> TransportResult<()>;

    /// Set the write deadline.
    fn set_write_deadline(&self, deadline: Option<Instant>) -> TransportResult<()>;

    /// Close the transport. Pending and later operations fail with
    /// [`TransportError::Closed`].
    async fn close(&self) -> TransportResult<()>;

    /// Whether [`close`](Transport::close) has been called.
    fn is_closed(&self) -> bool;

    /// Traffic counters.
    fn stats(&self) -> TransportStats {
        TransportStats::default()
    }
}

/// Metadata for one received datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecvInfo {
    /// Number of bytes written into the receive buffer
    pub len: usize,
    /// Sender of the datagram
    pub peer: SocketAddr,
    /// Local IP the datagram was addressed to, when the platform reports it
    pub local_ip: Option<IpAddr>,
}

/// A bound datagram socket usable as a member of a [`MultiConn`](crate::multi::MultiConn).
///
/// Deadline expiry is reported as an [`io::Error`] of kind
/// [`io::ErrorKind::TimedOut`]; every other error is treated as terminal by
/// the multiplexer.
#[async_trait]
pub trait DatagramSocket: Send + Sync {
    /// Receive one datagram.
    async fn recv_msg(&self, buf: &mut [u8]) -> io::Result<RecvInfo>;

    /// Send one datagram to `peer`, originating from `src` when given.
    async fn send_msg(&self, buf: &[u8], src: Option<IpAddr>, peer: SocketAddr)
    -> io::Result<usize>;

    /// Local address the socket is bound to.
    fn local_addr(&self) -> io::Result<SocketAddr>;

    /// Set the read deadline.
    fn set_read_deadline(&self, deadline: Option<Instant>) -> io::Result<()>;

    /// Set the write deadline.
    fn set_write_deadline(&self, deadline: Option<Instant>) -> io::Result<()>;

    /// Set both deadlines. Both are attempted; the last error is returned.
    fn set_deadline(&self, deadline: Option<Instant>) -> io::Result<()> {
        let read = self.set_read_deadline(deadline);
        let write = self.set_write_deadline(deadline);
        write.and(read)
    }

    /// Close the socket, waking any pending operation.
    async fn close(&self) -> io::Result<()>;
}
