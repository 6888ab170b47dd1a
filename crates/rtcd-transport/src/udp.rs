//! UDP member socket with packet info.
//!
//! [`UdpConn`] wraps a tokio UDP socket together with `quinn_udp`'s socket
//! state, which turns on `IP_PKTINFO` / `IPV6_RECVPKTINFO` (or the platform
//! equivalent). That gives each receive the local destination IP, and lets a
//! send pick its source IP explicitly. Both are required for reply-path
//! affinity in [`MultiConn`](crate::multi::MultiConn).

use crate::deadline::Deadline;
use crate::transport::{DatagramSocket, RecvInfo};
use async_trait::async_trait;
use crossbeam_queue::SegQueue;
use parking_lot::RwLock;
use quinn_udp::{RecvMeta, Transmit, UdpSocketState};
use std::io::{self, IoSliceMut};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::io::Interest;
use tokio::net::UdpSocket;
use tokio::sync::{Mutex, watch};
use tokio::time::Instant;

/// Largest UDP payload a single datagram can carry.
const MAX_DATAGRAM_SIZE: usize = u16::MAX as usize;

/// A datagram split off a GRO-coalesced receive, waiting to be returned.
#[derive(Debug)]
struct Segment {
    data: Vec<u8>,
    peer: SocketAddr,
    local_ip: Option<IpAddr>,
}

/// A UDP socket reporting local destination addresses.
///
/// # Examples
///
/// ```no_run
/// use rtcd_transport::transport::DatagramSocket;
/// use rtcd_transport::udp::UdpConn;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let conn = UdpConn::bind("0.0.0.0:8443".parse()?)?;
/// let mut buf = vec![0u8; 8192];
/// let info = conn.recv_msg(&mut buf).await?;
/// // Reply from the address the peer sent to.
/// conn.send_msg(&buf[..info.len], info.local_ip, info.peer).await?;
/// # Ok(())
/// # }
/// ```
pub struct UdpConn {
    /// Taken on close, which releases the fd once in-flight operations let go.
    io: RwLock<Option<Arc<UdpSocket>>>,
    state: UdpSocketState,
    local_addr: SocketAddr,
    read_deadline: Deadline,
    write_deadline: Deadline,
    closed: watch::Sender<bool>,
    /// Receive buffer large enough for a full GRO batch.
    scratch: Mutex<Vec<u8>>,
    backlog: SegQueue<Segment>,
}

impl UdpConn {
    /// Bind a new socket to `addr`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn bind(addr: SocketAddr) -> io::Result<Self> {
        Self::from_std(std::net::UdpSocket::bind(addr)?)
    }

    /// Wrap an already bound socket.
    ///
    /// The socket is switched to non-blocking mode. Must be called from
    /// within a tokio runtime.
    pub fn from_std(socket: std::net::UdpSocket) -> io::Result<Self> {
        socket.set_nonblocking(true)?;
        let state = UdpSocketState::new((&socket).into())?;
        let io = UdpSocket::from_std(socket)?;
        let local_addr = io.local_addr()?;
        let (closed, _) = watch::channel(false);
        // Zeroed allocations are mapped lazily, so only touched pages cost memory.
        let scratch = vec![0u8; MAX_DATAGRAM_SIZE * state.gro_segments().max(1)];

        Ok(Self {
            io: RwLock::new(Some(Arc::new(io))),
            state,
            local_addr,
            read_deadline: Deadline::new(),
            write_deadline: Deadline::new(),
            closed,
            scratch: Mutex::new(scratch),
            backlog: SegQueue::new(),
        })
    }

    /// Whether [`close`](DatagramSocket::close) has been called.
    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    fn socket(&self) -> io::Result<Arc<UdpSocket>> {
        self.io.read().clone().ok_or_else(closed_error)
    }

    async fn closed_signal(&self) {
        let mut rx = self.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    fn pop_backlog(&self, buf: &mut [u8]) -> Option<RecvInfo> {
        let seg = self.backlog.pop()?;
        let len = seg.data.len().min(buf.len());
        buf[..len].copy_from_slice(&seg.data[..len]);
        Some(RecvInfo {
            len,
            peer: seg.peer,
            local_ip: seg.local_ip,
        })
    }

    async fn recv_one(&self, buf: &mut [u8]) -> io::Result<RecvInfo> {
        let socket = self.socket()?;
        let mut scratch = self.scratch.lock().await;
        let mut meta = [RecvMeta::default()];
        loop {
            let count = socket
                .async_io(Interest::READABLE, || {
                    let mut bufs = [IoSliceMut::new(&mut scratch[..])];
                    self.state.recv((&*socket).into(), &mut bufs, &mut meta)
                })
                .await?;
            if count > 0 {
                break;
            }
        }

        let meta = &meta[0];
        let len = meta.len;
        let stride = if meta.stride == 0 { len } else { meta.stride };

        // GRO may have delivered several datagrams from the same peer at once;
        // only the last segment can be shorter than the stride.
        let mut segments = scratch[..len].chunks(stride.max(1));
        let first = segments.next().unwrap_or(&[]);
        for chunk in segments {
            self.backlog.push(Segment {
                data: chunk.to_vec(),
                peer: meta.addr,
                local_ip: meta.dst_ip,
            });
        }

        let n = first.len().min(buf.len());
        buf[..n].copy_from_slice(&first[..n]);
        Ok(RecvInfo {
            len: n,
            peer: meta.addr,
            local_ip: meta.dst_ip,
        })
    }
}

impl std::fmt::Debug for UdpConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpConn")
            .field("local_addr", &self.local_addr)
            .field("closed", &self.is_closed())
            .field("backlog", &self.backlog.len())
            .finish()
    }
}

#[async_trait]
impl DatagramSocket for UdpConn {
    async fn recv_msg(&self, buf: &mut [u8]) -> io::Result<RecvInfo> {
        if self.is_closed() {
            return Err(closed_error());
        }
        if let Some(info) = self.pop_backlog(buf) {
            return Ok(info);
        }

        tokio::select! {
            biased;
            _ = self.closed_signal() => Err(closed_error()),
            res = self.read_deadline.run(self.recv_one(buf)) => res,
        }
    }

    async fn send_msg(
        &self,
        buf: &[u8],
        src: Option<IpAddr>,
        peer: SocketAddr,
    ) -> io::Result<usize> {
        if self.is_closed() {
            return Err(closed_error());
        }
        let socket = self.socket()?;

        let transmit = Transmit {
            destination: peer,
            ecn: None,
            contents: buf,
            segment_size: None,
            src_ip: src,
        };
        // try_send reports every sendmsg error, like a plain UDP socket.
        let send = socket.async_io(Interest::WRITABLE, || {
            self.state.try_send((&*socket).into(), &transmit)
        });

        tokio::select! {
            biased;
            _ = self.closed_signal() => Err(closed_error()),
            res = self.write_deadline.run(send) => res.map(|()| buf.len()),
        }
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.local_addr)
    }

    fn set_read_deadline(&self, deadline: Option<Instant>) -> io::Result<()> {
        if self.is_closed() {
            return Err(closed_error());
        }
        self.read_deadline.set(deadline);
        Ok(())
    }

    fn set_write_deadline(&self, deadline: Option<Instant>) -> io::Result<()> {
        if self.is_closed() {
            return Err(closed_error());
        }
        self.write_deadline.set(deadline);
        Ok(())
    }

    async fn close(&self) -> io::Result<()> {
        if self.closed.send_replace(true) {
            return Err(closed_error());
        }
        // Pending operations have been woken and drop their handles as they
        // return; ours goes here.
        let socket = self.io.write().take();
        drop(socket);
        while self.backlog.pop().is_some() {}
        tracing::debug!("UDP socket {} closed", self.local_addr);
        Ok(())
    }
}

/// Error returned by operations on a closed socket.
pub fn closed_error() -> io::Error {
    io::Error::new(
        io::ErrorKind::NotConnected,
        "use of closed network connection",
    )
}
