//! Auto-reconnecting connection
//!
//! [`ReliableConnection`] owns at most one live inner connection and a
//! driver FSM on a group that replaces it whenever it fails:
//!
//! ```text
//!   SLEEPING ── backoff elapsed ──► WAKING ── factory.connect ──► CONNECTING
//!      ▲                              │                              │
//!      └───────── any failure ◄───────┴──────────────────────────────┤
//!      ▲                                                        handshake done
//!      └───────── liveness / I/O error ◄──────────── CONNECTED ◄─────┘
//! ```
//!
//! Once `CONNECTED` the driver sleeps on the inner connection's
//! housekeeping wait (the liveness deadline for device connections) and
//! goes back to `SLEEPING` if that finds the connection dead.
//!
//! Callers never see a hard failure: while the wrapper is not `CONNECTED`
//! every send and receive reports `WouldBlock`, and `send_wait`/`recv_wait`
//! wait for the next `CONNECTED` broadcast.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use cothread_runtime::fsm;
use cothread_runtime::{immediate_wake, might_yield, suspend, timer_wait, yield_now, AutoFsm, Cond, Group};
use tracing::{debug, info, warn};

use super::factory::ConnectionFactory;
use crate::config::NetConfig;
use crate::connection::Connection;
use crate::error::{Error, Result};

/// Reconnect delay in backoff units, doubled per failure and capped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    current: u32,
    limit: u32,
}

impl Backoff {
    pub fn new(limit: u32) -> Self {
        Self { current: 0, limit: limit.max(1) }
    }

    pub fn current(&self) -> u32 {
        self.current
    }

    /// Record a failure: `clamp(1, 2 * current, limit)`
    pub fn fail(&mut self) -> u32 {
        self.current = self.current.saturating_mul(2).clamp(1, self.limit);
        self.current
    }

    pub fn reset(&mut self) {
        self.current = 0;
    }

    pub fn delay(&self, unit: Duration) -> Duration {
        unit * self.current
    }
}

/// Driver status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Sleeping,
    Waking,
    Connecting,
    Connected,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Status::Sleeping => "SLEEPING",
            Status::Waking => "WAKING",
            Status::Connecting => "CONNECTING",
            Status::Connected => "CONNECTED",
        })
    }
}

struct Inner<C> {
    status: Status,
    conn: Option<C>,
    backoff: Backoff,
    reconnects: u64,
}

struct Shared<F: ConnectionFactory> {
    inner: Mutex<Inner<F::Conn>>,
    connected: Cond,
    closed: AtomicBool,
    factory: F,
    backoff_unit: Duration,
}

impl<F: ConnectionFactory> Shared<F> {
    fn lock(&self) -> MutexGuard<'_, Inner<F::Conn>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drop the live connection and start sleeping off the backoff
    fn reconnect(&self, inner: &mut Inner<F::Conn>, cause: &Error) {
        if let Some(mut conn) = inner.conn.take() {
            conn.close();
        }
        let units = inner.backoff.fail();
        inner.status = Status::Sleeping;
        inner.reconnects += 1;
        warn!(
            remote = %self.factory,
            error = %cause,
            "connection dropped, waiting {:?}",
            self.backoff_unit * units
        );
    }

    fn step(&self) {
        if self.closed.load(Ordering::Acquire) {
            let mut inner = self.lock();
            if let Some(mut conn) = inner.conn.take() {
                conn.close();
            }
            fsm::exit();
            return;
        }

        let mut guard = self.lock();
        let inner = &mut *guard;
        match inner.status {
            Status::Sleeping => {
                inner.status = Status::Waking;
                let delay = inner.backoff.delay(self.backoff_unit);
                if delay.is_zero() {
                    yield_now();
                } else {
                    timer_wait(Instant::now() + delay);
                    suspend();
                }
            }
            Status::Waking => match self.factory.connect() {
                Ok(conn) => {
                    debug!(remote = %self.factory, conn = %conn, "transport connection started");
                    inner.conn = Some(conn);
                    inner.status = Status::Connecting;
                    yield_now();
                }
                Err(Error::WouldBlock) | Err(Error::Interrupted) => {
                    self.factory.connect_wait();
                    suspend();
                }
                Err(e) => {
                    self.reconnect(inner, &e);
                    yield_now();
                }
            },
            Status::Connecting => {
                let Some(conn) = inner.conn.as_mut() else {
                    inner.status = Status::Sleeping;
                    return yield_now();
                };
                match conn.connect(false) {
                    Ok(()) => {
                        info!(remote = %self.factory, conn = %conn, "connected");
                        inner.status = Status::Connected;
                        self.connected.broadcast();
                        conn.tick_wait();
                        suspend();
                    }
                    Err(Error::WouldBlock) | Err(Error::Interrupted) => {
                        conn.connect_wait();
                        suspend();
                    }
                    Err(e) => {
                        self.reconnect(inner, &e);
                        yield_now();
                    }
                }
            }
            Status::Connected => {
                let Some(conn) = inner.conn.as_mut() else {
                    inner.status = Status::Sleeping;
                    return yield_now();
                };
                conn.tick(Instant::now());
                match conn.connect(false) {
                    Err(e) if !e.is_transient() => {
                        self.reconnect(inner, &e);
                        yield_now();
                    }
                    _ => {
                        conn.tick_wait();
                        suspend();
                    }
                }
            }
        }
    }
}

/// A connection that reconnects itself with exponential backoff
pub struct ReliableConnection<F: ConnectionFactory> {
    shared: Arc<Shared<F>>,
    driver: AutoFsm,
}

impl<F: ConnectionFactory> ReliableConnection<F> {
    /// Start connecting through `factory`, driven by an FSM on `group`
    pub fn new(factory: F, group: &Group, config: &NetConfig) -> Result<Self> {
        let shared = Arc::new(Shared {
            inner: Mutex::new(Inner {
                status: Status::Waking,
                conn: None,
                backoff: Backoff::new(config.backoff_limit),
                reconnects: 0,
            }),
            connected: Cond::new(),
            closed: AtomicBool::new(false),
            factory,
            backoff_unit: config.backoff_unit,
        });
        let s = Arc::clone(&shared);
        let driver = AutoFsm::new(group.spawn_fsm(move || s.step())?);
        Ok(Self { shared, driver })
    }

    pub fn status(&self) -> Status {
        self.shared.lock().status
    }

    pub fn is_connected(&self) -> bool {
        self.status() == Status::Connected
    }

    /// Current backoff in units
    pub fn backoff(&self) -> u32 {
        self.shared.lock().backoff.current()
    }

    /// Connections dropped so far
    pub fn reconnects(&self) -> u64 {
        self.shared.lock().reconnects
    }

    pub fn factory(&self) -> &F {
        &self.shared.factory
    }

    /// Apply `f` to the live connection; `None` unless `CONNECTED`
    pub fn inspect<T>(&self, f: impl FnOnce(&F::Conn) -> T) -> Option<T> {
        let inner = self.shared.lock();
        match (inner.status, inner.conn.as_ref()) {
            (Status::Connected, Some(conn)) => Some(f(conn)),
            _ => None,
        }
    }

    /// Run `op` on the live connection
    ///
    /// A hard failure drops the connection and is reported as
    /// `WouldBlock`; the driver reconnects in the background.
    fn with_conn<T>(&self, op: impl FnOnce(&mut F::Conn) -> Result<T>) -> Result<T> {
        let mut inner = self.shared.lock();
        if inner.status != Status::Connected {
            return Err(Error::WouldBlock);
        }
        let Some(conn) = inner.conn.as_mut() else {
            return Err(Error::WouldBlock);
        };
        match op(conn) {
            Ok(v) => Ok(v),
            Err(e) if e.is_transient() => Err(e),
            Err(e) => {
                self.shared.reconnect(&mut inner, &e);
                drop(inner);
                self.driver.wake();
                Err(Error::WouldBlock)
            }
        }
    }

    /// Register for the next `CONNECTED` broadcast, or the inner wait
    fn wait_with(&self, inner_wait: impl FnOnce(&F::Conn)) {
        let inner = self.shared.lock();
        match (inner.status, inner.conn.as_ref()) {
            (Status::Connected, Some(conn)) => inner_wait(conn),
            _ => {
                self.shared.connected.wait();
            }
        }
    }
}

impl<F: ConnectionFactory> Connection for ReliableConnection<F> {
    type Message = <F::Conn as Connection>::Message;

    fn connect(&mut self, block: bool) -> Result<()> {
        if block {
            might_yield();
        }
        loop {
            if self.is_connected() {
                return Ok(());
            }
            if !block {
                return Err(Error::WouldBlock);
            }
            self.connect_wait();
            suspend();
        }
    }

    fn send(&mut self, msg: &Self::Message, block: bool) -> Result<()> {
        if block {
            might_yield();
        }
        loop {
            match self.with_conn(|c| c.send(msg, false)) {
                Err(Error::WouldBlock) if block => {
                    self.send_wait();
                    suspend();
                }
                Err(Error::Interrupted) => continue,
                r => return r,
            }
        }
    }

    fn recv(&mut self, block: bool) -> Result<Self::Message> {
        if block {
            might_yield();
        }
        loop {
            match self.with_conn(|c| c.recv(false)) {
                Ok(msg) => {
                    self.shared.lock().backoff.reset();
                    return Ok(msg);
                }
                Err(Error::WouldBlock) if block => {
                    self.recv_wait();
                    suspend();
                }
                Err(Error::Interrupted) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    fn connect_wait(&self) {
        self.wait_with(|_| {
            immediate_wake();
        });
    }

    fn send_wait(&self) {
        self.wait_with(|c| c.send_wait());
    }

    fn recv_wait(&self) {
        self.wait_with(|c| c.recv_wait());
    }

    /// Drop the live connection; the driver reconnects after the backoff
    fn close(&mut self) {
        let mut inner = self.shared.lock();
        if inner.conn.is_some() || inner.status != Status::Sleeping {
            self.shared.reconnect(&mut inner, &Error::Os(nix::errno::Errno::ECONNRESET));
            drop(inner);
            self.driver.wake();
        }
    }
}

impl<F: ConnectionFactory> fmt::Display for ReliableConnection<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.shared.factory, f)
    }
}

impl<F: ConnectionFactory> Drop for ReliableConnection<F> {
    fn drop(&mut self) {
        self.shared.closed.store(true, Ordering::Release);
        self.driver.wake();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::conn::DeviceConnection;
    use crate::device::wire::Message;
    use crate::loopback::LoopbackStream;
    use crate::stream::AsyncStream;
    use cothread_runtime::{sleep, Runtime, RuntimeConfig};
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_backoff_sequence() {
        let mut b = Backoff::new(60);
        let seq: Vec<u32> = (0..9).map(|_| b.fail()).collect();
        assert_eq!(seq, [1, 2, 4, 8, 16, 32, 60, 60, 60]);
        assert_eq!(b.delay(Duration::from_millis(10)), Duration::from_millis(600));
        b.reset();
        assert_eq!(b.fail(), 1);
    }

    /// Refuses a fixed number of attempts, then hands out loopback peers
    struct Flaky {
        refusals: usize,
        attempts: AtomicUsize,
        peers: Mutex<Vec<LoopbackStream>>,
    }

    impl Flaky {
        fn new(refusals: usize) -> Self {
            Self { refusals, attempts: AtomicUsize::new(0), peers: Mutex::new(Vec::new()) }
        }
    }

    impl fmt::Display for Flaky {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("flaky")
        }
    }

    impl ConnectionFactory for Flaky {
        type Conn = DeviceConnection<LoopbackStream>;

        fn connect(&self) -> Result<Self::Conn> {
            let n = self.attempts.fetch_add(1, Ordering::SeqCst);
            if n < self.refusals {
                return Err(Error::Os(nix::errno::Errno::ECONNREFUSED));
            }
            let (ours, mut theirs) = LoopbackStream::pair();
            theirs.try_write(Message::hello(4, 1).as_bytes())?;
            self.peers.lock().unwrap().push(theirs);
            Ok(DeviceConnection::new(ours, &NetConfig::new(), "flaky"))
        }
    }

    fn runtime() -> Runtime {
        Runtime::new(RuntimeConfig::new().max_poll_wait(Duration::from_millis(10))).unwrap()
    }

    #[test]
    fn test_reconnects_after_refusals() {
        let rt = runtime();
        let g = rt.default_group();
        let config = NetConfig::new().backoff_unit(Duration::from_millis(5));
        let mut conn = ReliableConnection::new(Flaky::new(3), &g, &config).unwrap();

        assert_eq!(conn.recv(false), Err(Error::WouldBlock));
        assert_eq!(conn.inspect(|_| ()), None);
        rt.block_on(&g, || conn.connect(true)).unwrap();
        assert!(conn.is_connected());
        assert_eq!(conn.reconnects(), 3);
        assert_eq!(conn.backoff(), 4);
        assert_eq!(conn.factory().attempts.load(Ordering::SeqCst), 4);
        assert_eq!(conn.inspect(DeviceConnection::version), Some(Some(4)));
        assert_eq!(conn.to_string(), "flaky");
    }

    #[test]
    fn test_backoff_resets_on_traffic() {
        let rt = runtime();
        let g = rt.default_group();
        let config = NetConfig::new().backoff_unit(Duration::from_millis(5));
        let mut conn = ReliableConnection::new(Flaky::new(1), &g, &config).unwrap();
        rt.block_on(&g, || conn.connect(true)).unwrap();
        assert_eq!(conn.backoff(), 1);

        {
            let mut peers = conn.factory().peers.lock().unwrap();
            let peer = peers.last_mut().unwrap();
            peer.try_write(Message::new(4, 20, 7, b"hi").unwrap().as_bytes()).unwrap();
        }
        let msg = rt.block_on(&g, || conn.recv(true)).unwrap();
        assert_eq!((msg.msg_type(), msg.xid()), (20, 7));
        assert_eq!(conn.backoff(), 0);
    }

    #[test]
    fn test_peer_loss_triggers_reconnect() {
        let rt = runtime();
        let g = rt.default_group();
        let config = NetConfig::new().backoff_unit(Duration::from_millis(5));
        let mut conn = ReliableConnection::new(Flaky::new(0), &g, &config).unwrap();
        rt.block_on(&g, || conn.connect(true)).unwrap();

        conn.factory().peers.lock().unwrap()[0].close();
        assert_eq!(rt.block_on(&g, || conn.recv(false)), Err(Error::WouldBlock));
        assert_eq!(conn.reconnects(), 1);

        rt.block_on(&g, || {
            while !conn.is_connected() {
                sleep(Duration::from_millis(2));
            }
        });
        assert_eq!(conn.factory().attempts.load(Ordering::SeqCst), 2);
    }
}
