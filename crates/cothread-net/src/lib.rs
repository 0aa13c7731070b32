//! # cothread-net
//!
//! Protocol plumbing on top of the cooperative scheduler.
//!
//! This crate provides:
//! - Byte-stream and datagram contracts ([`AsyncStream`], [`AsyncDatagram`])
//!   with socket and in-memory implementations
//! - A generic [`Connection`] interface
//! - Device-control connections: hello handshake with version negotiation,
//!   liveness probing and auto-reconnect with exponential backoff
//! - Netlink-style request/reply transactions that survive receive-buffer
//!   overruns by retransmitting
//!
//! ```text
//!   ReliableConnection ── FSM driver ── ConnectionFactory (tcp:/ptcp:)
//!          │
//!          └── DeviceConnection ── framing ── AsyncStream (FdStream, LoopbackStream)
//!
//!   NlSocket ── Transaction table ── AsyncDatagram (NetlinkDatagram, LoopbackDatagram)
//! ```

pub mod config;
pub mod error;
pub mod stream;
pub mod datagram;
pub mod loopback;
pub mod connection;
pub mod device;
pub mod netlink;

// Re-exports
pub use config::{ConfigError, NetConfig};
pub use connection::Connection;
pub use datagram::AsyncDatagram;
pub use device::{DeviceConnection, ReliableConnection};
pub use error::{Error, Result};
pub use loopback::{LoopbackDatagram, LoopbackStream};
pub use netlink::{NlMessage, NlSocket, Transaction};
pub use stream::{AsyncStream, FdListener, FdStream};
