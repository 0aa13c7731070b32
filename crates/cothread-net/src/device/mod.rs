//! Device-control protocol connections
//!
//! - [`wire`]: message header and frame constructors
//! - [`DeviceConnection`]: handshake, version negotiation and liveness
//!   over any [`AsyncStream`](crate::AsyncStream)
//! - [`ReliableConnection`]: reconnect with exponential backoff through a
//!   [`ConnectionFactory`]

pub mod wire;
mod framing;
mod handshake;
mod conn;
mod reliable;
mod factory;

pub use conn::DeviceConnection;
pub use factory::{parse, ConnectionFactory, PassiveTcpFactory, Target, TcpFactory, DEFAULT_PORT};
pub use handshake::{Liveness, Negotiation, State, Tick, Versions};
pub use reliable::{Backoff, ReliableConnection, Status};
pub use wire::Message;
