//! Transport connection factories
//!
//! A factory produces fresh [`Connection`]s for
//! [`ReliableConnection`](super::ReliableConnection). Targets are written
//! `tcp:HOST[:PORT]` (active) or `ptcp:PORT` (passive, accept one peer).

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs};

use cothread_runtime::immediate_wake;
use tracing::{debug, info};

use super::conn::DeviceConnection;
use crate::config::NetConfig;
use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::stream::{FdListener, FdStream};

/// Port used when a `tcp:` target names none
pub const DEFAULT_PORT: u16 = 6633;

pub trait ConnectionFactory: fmt::Display + Send + Sync + 'static {
    type Conn: Connection + 'static;

    /// Start a new transport connection; `WouldBlock` if none is ready yet
    fn connect(&self) -> Result<Self::Conn>;

    /// Register the wait for the next `connect` to make progress
    fn connect_wait(&self) {
        immediate_wake();
    }
}

/// Active TCP: connect out to a fixed address
#[derive(Debug, Clone)]
pub struct TcpFactory {
    host: String,
    addr: SocketAddr,
    config: NetConfig,
}

impl TcpFactory {
    pub fn new(addr: SocketAddr, config: NetConfig) -> Self {
        Self { host: addr.ip().to_string(), addr, config }
    }

    /// Resolve `host` once, up front
    ///
    /// Name lookup blocks the OS thread; from inside a group call this
    /// under `run_native`.
    pub fn resolve(host: &str, port: u16, config: NetConfig) -> Result<Self> {
        let addr = match host.parse::<IpAddr>() {
            Ok(ip) => SocketAddr::new(ip, port),
            Err(_) => (host, port)
                .to_socket_addrs()
                .map_err(|e| Error::protocol(format!("{host}: {e}")))?
                .next()
                .ok_or_else(|| Error::protocol(format!("{host}: no addresses")))?,
        };
        Ok(Self { host: host.to_owned(), addr, config })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

impl ConnectionFactory for TcpFactory {
    type Conn = DeviceConnection<FdStream>;

    fn connect(&self) -> Result<Self::Conn> {
        let stream = FdStream::connect_tcp(&self.addr)?;
        debug!(conn = %self, addr = %self.addr, "connecting");
        Ok(DeviceConnection::new(stream, &self.config, self.to_string()))
    }
}

impl fmt::Display for TcpFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tcp:{}:{}", self.host, self.addr.port())
    }
}

/// Passive TCP: listen and take the next peer that connects
pub struct PassiveTcpFactory {
    listener: FdListener,
    port: u16,
    config: NetConfig,
}

impl PassiveTcpFactory {
    pub fn bind(addr: SocketAddr, config: NetConfig) -> Result<Self> {
        let listener = FdListener::bind(&addr)?;
        let port = listener.local_addr().map_or(addr.port(), |a| a.port());
        info!(port, "listening");
        Ok(Self { listener, port, config })
    }

    /// Bound port, useful after binding port 0
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl ConnectionFactory for PassiveTcpFactory {
    type Conn = DeviceConnection<FdStream>;

    fn connect(&self) -> Result<Self::Conn> {
        let (stream, peer) = self.listener.try_accept()?;
        let name = match peer {
            Some(peer) => format!("ptcp:{}:{}", self.port, peer),
            None => self.to_string(),
        };
        info!(conn = %name, "accepted");
        Ok(DeviceConnection::new(stream, &self.config, name))
    }

    fn connect_wait(&self) {
        self.listener.accept_wait();
    }
}

impl fmt::Display for PassiveTcpFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ptcp:{}", self.port)
    }
}

impl fmt::Debug for PassiveTcpFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PassiveTcpFactory").field("port", &self.port).finish()
    }
}

/// A factory chosen from a target string
#[derive(Debug)]
pub enum Target {
    Tcp(TcpFactory),
    PassiveTcp(PassiveTcpFactory),
}

impl ConnectionFactory for Target {
    type Conn = DeviceConnection<FdStream>;

    fn connect(&self) -> Result<Self::Conn> {
        match self {
            Target::Tcp(f) => f.connect(),
            Target::PassiveTcp(f) => f.connect(),
        }
    }

    fn connect_wait(&self) {
        match self {
            Target::Tcp(f) => f.connect_wait(),
            Target::PassiveTcp(f) => f.connect_wait(),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Tcp(t) => fmt::Display::fmt(t, f),
            Target::PassiveTcp(t) => fmt::Display::fmt(t, f),
        }
    }
}

fn parse_port(s: &str, target: &str) -> Result<u16> {
    s.parse()
        .map_err(|_| Error::protocol(format!("{target}: bad port number \"{s}\"")))
}

/// Build a factory for `tcp:HOST[:PORT]` or `ptcp:PORT`
pub fn parse(target: &str, config: &NetConfig) -> Result<Target> {
    if let Some(rest) = target.strip_prefix("tcp:") {
        let (host, port) = match rest.rsplit_once(':') {
            Some((host, port)) if !host.contains(':') || host.starts_with('[') => {
                (host.trim_matches(|c| c == '[' || c == ']'), parse_port(port, target)?)
            }
            _ => (rest, DEFAULT_PORT),
        };
        if host.is_empty() {
            return Err(Error::protocol(format!("{target}: missing host")));
        }
        return Ok(Target::Tcp(TcpFactory::resolve(host, port, config.clone())?));
    }
    if let Some(port) = target.strip_prefix("ptcp:") {
        let port = if port.is_empty() { DEFAULT_PORT } else { parse_port(port, target)? };
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
        return Ok(Target::PassiveTcp(PassiveTcpFactory::bind(addr, config.clone())?));
    }
    Err(Error::protocol(format!("{target}: unknown connection method")))
}
