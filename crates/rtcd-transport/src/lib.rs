//! # rtcd Transport
//!
//! Multiplexed UDP packet transport for the rtcd media relay.
//!
//! This crate provides:
//! - `Transport` trait: the single packet connection the ICE/DTLS stack uses
//! - `DatagramSocket` trait: a member socket reporting local destination IPs
//! - `MultiConn`: N member sockets fanned into one `Transport`, with
//!   round-robin writes and source-address affinity for replies
//! - `UdpConn`: tokio UDP member socket with packet info via `quinn-udp`
//! - Socket pool factory binding N sockets to one port with `SO_REUSEPORT`
//! - Lock-free receive buffer pool
//! - Deadline cells for tokio sockets

#![warn(missing_docs)]
#![warn(clippy::all)]

// Transport traits and the multiplexer
pub mod multi;
pub mod transport;

// Member sockets and pool creation
pub mod factory;
pub mod udp;

// Shared plumbing
pub mod affinity;
pub mod buffer_pool;
pub mod config;
pub mod deadline;

pub use buffer_pool::BufferPool;
pub use config::TransportConfig;
pub use multi::MultiConn;
pub use transport::{DatagramSocket, RecvInfo, Transport, TransportError, TransportResult};
pub use udp::UdpConn;
