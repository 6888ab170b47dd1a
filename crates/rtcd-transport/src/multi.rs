//! Multiplexed packet transport over a pool of datagram sockets.
//!
//! A [`MultiConn`] aggregates N bound sockets into a single [`Transport`].
//! Callers see one unconnected datagram socket; underneath:
//!
//! - One receiver task per socket reads datagrams and hands each result to a
//!   single shared channel, so reads fan in from every socket.
//! - Writes rotate over the sockets round-robin, but always send from the
//!   local IP the destination peer last reached us on (see
//!   [`AffinityTable`]).
//! - [`close`](Transport::close) stops every receiver, closes every socket
//!   and waits for the receivers to exit before tearing down the channel.
//!
//! # Receive errors
//!
//! Deadline expiry is transient: the receiver reports it and keeps reading.
//! Any other socket error retires that receiver after the error has been
//! delivered to one reader. The remaining sockets keep working, so a reader
//! seeing [`TransportError::Io`] should treat it as reduced capacity.

use crate::affinity::AffinityTable;
use crate::buffer_pool::BufferPool;
use crate::config::TransportConfig;
use crate::factory::bind_udp_pool;
use crate::transport::{
    DatagramSocket, Transport, TransportError, TransportResult, TransportStats, is_timeout,
};
use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Default receive buffer size, large enough for any datagram a media relay
/// expects (ICE, DTLS, SRTP).
pub const RECEIVE_MTU: usize = 8192;

/// Idle buffers kept per member socket.
const BUFFERS_PER_SOCKET: usize = 4;

/// Outcome of one receive, handed from a receiver to a reader together with
/// the buffer it was read into.
struct ReadResult {
    buf: Vec<u8>,
    outcome: io::Result<(usize, SocketAddr)>,
}

/// Counters shared between the receivers and the transport.
#[derive(Debug, Default)]
struct Counters {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    packets_sent: AtomicU64,
    packets_received: AtomicU64,
    send_errors: AtomicU64,
    recv_errors: AtomicU64,
}

/// State a receiver task needs.
struct Receiver {
    index: usize,
    conn: Arc<dyn DatagramSocket>,
    results: mpsc::Sender<ReadResult>,
    shutdown: watch::Receiver<bool>,
    affinity: Arc<AffinityTable>,
    pool: BufferPool,
}

/// N datagram sockets presented as one packet connection.
///
/// # Examples
///
/// ```no_run
/// use rtcd_transport::multi::MultiConn;
/// use rtcd_transport::transport::{DatagramSocket, Transport};
/// use rtcd_transport::udp::UdpConn;
/// use std::sync::Arc;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let conns: Vec<Arc<dyn DatagramSocket>> = vec![
///     Arc::new(UdpConn::bind("0.0.0.0:0".parse()?)?),
///     Arc::new(UdpConn::bind("0.0.0.0:0".parse()?)?),
/// ];
/// let mc = MultiConn::new(conns)?;
///
/// let mut buf = vec![0u8; 1500];
/// let (n, peer) = mc.recv_from(&mut buf).await?;
/// mc.send_to(&buf[..n], peer).await?;
///
/// mc.close().await?;
/// # Ok(())
/// # }
/// ```
pub struct MultiConn {
    /// Member sockets, in construction order.
    conns: Vec<Arc<dyn DatagramSocket>>,
    /// Local address of the first member.
    local_addr: SocketAddr,
    /// Peer -> local IP it was last received on.
    affinity: Arc<AffinityTable>,
    /// Shared fan-in channel.
    results: Mutex<mpsc::Receiver<ReadResult>>,
    /// Set to `true` once on close; observed by receivers and readers.
    shutdown: watch::Sender<bool>,
    /// Receive buffers.
    pool: BufferPool,
    /// Round-robin write counter.
    counter: AtomicU64,
    /// Receiver tasks, joined on close.
    receivers: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
    counters: Arc<Counters>,
}

impl MultiConn {
    /// Build a transport over `conns` with [`RECEIVE_MTU`] sized buffers.
    ///
    /// Spawns one receiver task per socket; must be called from within a
    /// tokio runtime. The caller must [`close`](Transport::close) the
    /// transport to stop them.
    ///
    /// # Errors
    /// Returns `TransportError::InvalidArgument` if `conns` is empty or a
    /// socket cannot report its local address. No task is spawned then.
    pub fn new(conns: Vec<Arc<dyn DatagramSocket>>) -> TransportResult<Self> {
        Self::with_receive_mtu(conns, RECEIVE_MTU)
    }

    /// Like [`new`](Self::new) with a custom receive buffer size.
    ///
    /// # Errors
    /// Returns `TransportError::InvalidArgument` for an empty or invalid
    /// socket set, or a zero `receive_mtu`.
    pub fn with_receive_mtu(
        conns: Vec<Arc<dyn DatagramSocket>>,
        receive_mtu: usize,
    ) -> TransportResult<Self> {
        if conns.is_empty() {
            return Err(TransportError::InvalidArgument(
                "conns should not be empty".to_string(),
            ));
        }
        if receive_mtu == 0 {
            return Err(TransportError::InvalidArgument(
                "receive MTU should be positive".to_string(),
            ));
        }

        let mut addrs = Vec::with_capacity(conns.len());
        for (i, conn) in conns.iter().enumerate() {
            let addr = conn.local_addr().map_err(|e| {
                TransportError::InvalidArgument(format!("invalid conn at index {i}: {e}"))
            })?;
            addrs.push(addr);
        }
        let local_addr = addrs[0];

        let affinity = Arc::new(AffinityTable::new());
        let pool = BufferPool::new(receive_mtu, conns.len() * BUFFERS_PER_SOCKET);
        let (results_tx, results_rx) = mpsc::channel(1);
        let (shutdown, _) = watch::channel(false);

        let receivers = conns
            .iter()
            .enumerate()
            .map(|(index, conn)| {
                let receiver = Receiver {
                    index,
                    conn: Arc::clone(conn),
                    results: results_tx.clone(),
                    shutdown: shutdown.subscribe(),
                    affinity: Arc::clone(&affinity),
                    pool: pool.clone(),
                };
                tokio::spawn(receiver.run())
            })
            .collect();

        tracing::debug!(
            "Multiplexed transport started on {} socket(s): {:?}",
            conns.len(),
            addrs
        );

        Ok(Self {
            conns,
            local_addr,
            affinity,
            results: Mutex::new(results_rx),
            shutdown,
            pool,
            counter: AtomicU64::new(0),
            receivers: Mutex::new(receivers),
            closed: AtomicBool::new(false),
            counters: Arc::new(Counters::default()),
        })
    }

    /// Bind a UDP socket pool as described by `config` and build a
    /// transport over it.
    ///
    /// # Errors
    /// Returns an error if the configuration is invalid or binding fails.
    pub fn bind(config: &TransportConfig) -> TransportResult<Self> {
        let conns = bind_udp_pool(config)?
            .into_iter()
            .map(|conn| Arc::new(conn) as Arc<dyn DatagramSocket>)
            .collect();
        Self::with_receive_mtu(conns, config.receive_mtu)
    }

    /// Number of member sockets.
    pub fn conn_count(&self) -> usize {
        self.conns.len()
    }

    /// Local addresses of all member sockets.
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.conns
            .iter()
            .filter_map(|conn| conn.local_addr().ok())
            .collect()
    }

    /// Source-address affinity table.
    pub fn affinity(&self) -> &AffinityTable {
        &self.affinity
    }

    /// Receive buffer pool.
    pub fn buffer_pool(&self) -> &BufferPool {
        &self.pool
    }

    /// Index of the socket the next write will use.
    fn next_index(&self) -> usize {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        (n % self.conns.len() as u64) as usize
    }

    /// Resolve once close has been signalled.
    async fn shutdown_signal(&self) {
        let mut rx = self.shutdown.subscribe();
        let _ = rx.wait_for(|closing| *closing).await;
    }

    /// Apply `set` to every member socket, returning the last error.
    fn broadcast_deadline(
        &self,
        set: impl Fn(&dyn DatagramSocket) -> io::Result<()>,
    ) -> TransportResult<()> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let mut last_err = None;
        for conn in &self.conns {
            if let Err(e) = set(conn.as_ref()) {
                last_err = Some(e);
            }
        }
        match last_err {
            Some(e) => Err(TransportError::Io(e)),
            None => Ok(()),
        }
    }
}

impl Receiver {
    async fn run(mut self) {
        tracing::debug!("Receiver {} started", self.index);
        loop {
            let mut buf = self.pool.acquire();

            let outcome = tokio::select! {
                biased;
                _ = wait_shutdown(&mut self.shutdown) => {
                    self.pool.release(buf);
                    break;
                }
                res = self.conn.recv_msg(&mut buf) => res,
            };

            if let Ok(info) = &outcome
                && let Some(local_ip) = info.local_ip
            {
                self.affinity.record(info.peer, local_ip);
            }

            let terminal = outcome.as_ref().is_err_and(|e| !is_timeout(e));
            let result = ReadResult {
                buf,
                outcome: outcome.map(|info| (info.len, info.peer)),
            };

            let permit = tokio::select! {
                biased;
                _ = wait_shutdown(&mut self.shutdown) => None,
                permit = self.results.reserve() => permit.ok(),
            };
            let Some(permit) = permit else {
                self.pool.release(result.buf);
                break;
            };

            if terminal {
                if let Err(e) = &result.outcome {
                    tracing::warn!("Receiver {} stopped after socket error: {}", self.index, e);
                }
                permit.send(result);
                return;
            }
            permit.send(result);
        }
        tracing::debug!("Receiver {} exiting on shutdown", self.index);
    }
}

async fn wait_shutdown(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|closing| *closing).await;
}

#[async_trait]
impl Transport for MultiConn {
    async fn send_to(&self, buf: &[u8], addr: SocketAddr) -> TransportResult<usize> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }

        let conn = &self.conns[self.next_index()];
        let src = self.affinity.source_for(&addr);

        match conn.send_msg(buf, src, addr).await {
            Ok(sent) => {
                self.counters
                    .bytes_sent
                    .fetch_add(sent as u64, Ordering::Relaxed);
                self.counters.packets_sent.fetch_add(1, Ordering::Relaxed);
                Ok(sent)
            }
            Err(_) if self.is_closed() => Err(TransportError::Closed),
            Err(e) => {
                self.counters.send_errors.fetch_add(1, Ordering::Relaxed);
                Err(TransportError::from_io(e))
            }
        }
    }

    async fn recv_from(&self, buf: &mut [u8]) -> TransportResult<(usize, SocketAddr)> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }

        let result = tokio::select! {
            biased;
            _ = self.shutdown_signal() => None,
            res = async { self.results.lock().await.recv().await } => res,
        };
        let Some(ReadResult { buf: data, outcome }) = result else {
            return Err(TransportError::Closed);
        };

        let outcome = outcome.map(|(len, peer)| {
            let n = len.min(buf.len());
            buf[..n].copy_from_slice(&data[..n]);
            (n, peer)
        });
        self.pool.release(data);

        match outcome {
            Ok((n, peer)) => {
                self.counters
                    .bytes_received
                    .fetch_add(n as u64, Ordering::Relaxed);
                self.counters
                    .packets_received
                    .fetch_add(1, Ordering::Relaxed);
                Ok((n, peer))
            }
            Err(e) => {
                self.counters.recv_errors.fetch_add(1, Ordering::Relaxed);
                Err(TransportError::from_io(e))
            }
        }
    }

    fn local_addr(&self) -> TransportResult<SocketAddr> {
        Ok(self.local_addr)
    }

    fn set_deadline(&self, deadline: Option<Instant>) -> TransportResult<()> {
        self.broadcast_deadline(|conn| conn.set_deadline(deadline))
    }

    fn set_read_deadline(&self, deadline: Option<Instant>) -> TransportResult<()> {
        self.broadcast_deadline(|conn| conn.set_read_deadline(deadline))
    }

    fn set_write_deadline(&self, deadline: Option<Instant>) -> TransportResult<()> {
        self.broadcast_deadline(|conn| conn.set_write_deadline(deadline))
    }

    async fn close(&self) -> TransportResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.shutdown.send_replace(true);

        let mut last_err = None;
        for (i, conn) in self.conns.iter().enumerate() {
            if let Err(e) = conn.close().await {
                tracing::warn!("Failed to close socket {}: {}", i, e);
                last_err = Some(e);
            }
        }

        let receivers = std::mem::take(&mut *self.receivers.lock().await);
        for handle in receivers {
            if let Err(e) = handle.await {
                tracing::warn!("Receiver task failed: {}", e);
            }
        }

        let mut results = self.results.lock().await;
        results.close();
        while let Ok(result) = results.try_recv() {
            self.pool.release(result.buf);
        }
        drop(results);

        tracing::debug!("Multiplexed transport on {} closed", self.local_addr);
        match last_err {
            Some(e) => Err(TransportError::Io(e)),
            None => Ok(()),
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn stats(&self) -> TransportStats {
        TransportStats {
            bytes_sent: self.counters.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.counters.bytes_received.load(Ordering::Relaxed),
            packets_sent: self.counters.packets_sent.load(Ordering::Relaxed),
            packets_received: self.counters.packets_received.load(Ordering::Relaxed),
            send_errors: self.counters.send_errors.load(Ordering::Relaxed),
            recv_errors: self.counters.recv_errors.load(Ordering::Relaxed),
        }
    }
}

impl Drop for MultiConn {
    fn drop(&mut self) {
        // Receivers hold their sockets; make sure they let go.
        self.shutdown.send_replace(true);
    }
}

impl std::fmt::Debug for MultiConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiConn")
            .field("local_addr", &self.local_addr)
            .field("conns", &self.conns.len())
            .field("closed", &self.is_closed())
            .field("pool", &self.pool)
            .finish()
    }
}
