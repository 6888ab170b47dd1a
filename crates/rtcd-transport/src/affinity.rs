//! Source-address affinity for replies.
//!
//! A relay host can own several local addresses. Many NATs and firewalls only
//! accept replies that come from the address the peer originally sent to, so
//! every datagram received records `peer -> local destination IP`, and writes
//! to that peer use the recorded IP as their source.

use dashmap::DashMap;
use std::net::{IpAddr, SocketAddr};

/// Last observed local destination IP per peer.
///
/// Concurrent receivers recording the same peer race; the last write wins.
#[derive(Debug, Default)]
pub struct AffinityTable {
    entries: DashMap<SocketAddr, IpAddr>,
}

impl AffinityTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `peer` reached us on `local_ip`, replacing any earlier entry.
    pub fn record(&self, peer: SocketAddr, local_ip: IpAddr) {
        self.entries.insert(peer, local_ip);
    }

    /// Recorded local IP for `peer`.
    pub fn lookup(&self, peer: &SocketAddr) -> Option<IpAddr> {
        self.entries.get(peer).map(|entry| *entry.value())
    }

    /// Source IP to use when sending to `peer`.
    ///
    /// `None` means the socket picks the source itself. That is the case for
    /// peers never seen, and for recorded IPs that cannot be used as a source
    /// for this destination (unspecified, or the other address family).
    pub fn source_for(&self, peer: &SocketAddr) -> Option<IpAddr> {
        self.lookup(peer)
            .filter(|ip| !ip.is_unspecified() && ip.is_ipv4() == peer.is_ipv4())
    }

    /// Number of peers tracked.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no peer is tracked.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
