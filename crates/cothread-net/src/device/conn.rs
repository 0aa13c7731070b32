use std::fmt;
use std::time::Instant;

use cothread_runtime::{immediate_wake, might_yield, suspend, timer_wait};
use nix::errno::Errno;
use tracing::{debug, info, warn};

use super::framing::Framed;
use super::handshake::{Liveness, Negotiation, State, Tick, Versions};
use super::wire::{self, Message};
use crate::config::NetConfig;
use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::stream::AsyncStream;

/// Device protocol connection over a byte stream
///
/// Every public operation first drives the handshake
/// (`CONNECTING` → `SEND_HELLO` → `RECV_HELLO` → `CONNECTED`) as far as
/// the transport allows. Once established, [`tick`](Connection::tick)
/// probes an idle peer and drops one that stays silent. Any transport
/// error other than would-block leaves the connection `DISCONNECTED`
/// with that error recorded.
pub struct DeviceConnection<S> {
    framed: Framed<S>,
    state: State,
    versions: Versions,
    version: u8,
    peer_version: u8,
    error: Option<Error>,
    liveness: Liveness,
    xid: u32,
    name: String,
}

impl<S: AsyncStream> DeviceConnection<S> {
    pub fn new(stream: S, config: &NetConfig, name: impl Into<String>) -> Self {
        Self {
            framed: Framed::new(stream),
            state: State::Connecting,
            versions: Versions {
                min: config.min_version,
                max: config.max_version,
                experimental: config.experimental_version,
            },
            version: config.max_version,
            peer_version: 0,
            error: None,
            liveness: Liveness::new(config.probe_interval),
            xid: 0,
            name: name.into(),
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// Negotiated version, once established
    pub fn version(&self) -> Option<u8> {
        self.state.is_established().then_some(self.version)
    }

    pub fn error(&self) -> Option<&Error> {
        self.error.as_ref()
    }

    /// Current liveness deadline, if armed
    pub fn deadline(&self) -> Option<Instant> {
        self.liveness.deadline()
    }

    fn next_xid(&mut self) -> u32 {
        self.xid = self.xid.wrapping_add(1);
        self.xid
    }

    fn fail(&mut self, e: Error) {
        match &e {
            Error::Eof => info!(conn = %self.name, "connection closed by peer"),
            e => warn!(conn = %self.name, state = %self.state, error = %e, "disconnected"),
        }
        self.state = State::Disconnected;
        self.error = Some(e);
    }

    fn fail_unless_transient(&mut self, e: Error) {
        if !e.is_transient() {
            self.fail(e);
        }
    }

    fn s_connecting(&mut self) {
        match self.framed.stream_mut().connect_error() {
            Ok(()) => self.state = State::SendHello,
            Err(e) => self.fail_unless_transient(e),
        }
    }

    fn s_send_hello(&mut self) {
        let hello = Message::hello(self.versions.max, self.next_xid());
        match self.framed.try_send(&hello) {
            Ok(()) => self.state = State::RecvHello,
            Err(e) => self.fail_unless_transient(e),
        }
    }

    fn s_recv_hello(&mut self) {
        let msg = match self.framed.try_recv() {
            Ok(msg) => msg,
            Err(e) => return self.fail_unless_transient(e),
        };
        match msg.msg_type() {
            wire::HELLO => {
                if !msg.body().is_empty() {
                    warn!(conn = %self.name, extra = msg.body().len(), "extra-long hello");
                }
                self.peer_version = msg.version();
                match self.versions.negotiate(self.peer_version) {
                    Negotiation::Agreed(version) => {
                        self.version = version;
                        self.state = State::Connected;
                        self.liveness.arm(Instant::now());
                        info!(conn = %self.name, version, peer = self.peer_version, "connected");
                    }
                    Negotiation::Refused { negotiated } => {
                        self.version = negotiated;
                        warn!(
                            conn = %self.name,
                            min = self.versions.min,
                            max = self.versions.max,
                            peer = self.peer_version,
                            "version negotiation failed"
                        );
                        self.state = State::SendError;
                    }
                }
            }
            wire::ERROR => {
                let e = msg
                    .peer_error()
                    .unwrap_or_else(|| Error::protocol("truncated error frame"));
                self.fail(e);
            }
            other => {
                warn!(conn = %self.name, msg_type = other, "unexpected message waiting for hello");
                self.fail(Error::protocol(format!("unexpected message type {other:#04x} waiting for hello")));
            }
        }
    }

    fn s_send_error(&mut self) {
        let text = self.versions.mismatch_text(self.peer_version);
        let sent = Message::error(self.versions.max, self.next_xid(), wire::HELLO_FAILED, wire::INCOMPATIBLE, &text)
            .and_then(|frame| self.framed.try_send(&frame));
        match sent {
            Err(Error::WouldBlock) => {}
            Err(e) => self.fail(e),
            Ok(()) => self.fail(Error::protocol(format!(
                "no common version with peer (peer version {:#04x})",
                self.peer_version
            ))),
        }
    }

    /// Run state functions until one makes no progress
    fn advance(&mut self) -> Result<()> {
        loop {
            let last = self.state;
            match self.state {
                State::Connecting => self.s_connecting(),
                State::SendHello => self.s_send_hello(),
                State::RecvHello => self.s_recv_hello(),
                State::SendError => self.s_send_error(),
                State::Connected | State::Idle => return Ok(()),
                State::Disconnected => {
                    return Err(self.error.clone().unwrap_or(Error::Os(Errno::ENOTCONN)));
                }
            }
            if self.state == last {
                return Err(Error::WouldBlock);
            }
        }
    }

    /// Register the wait the handshake needs; false once it needs none
    fn handshake_wait(&self) -> bool {
        match self.state {
            State::Connecting => self.framed.stream().connect_wait(),
            State::SendHello | State::SendError => self.framed.stream().write_wait(),
            State::RecvHello => self.framed.stream().read_wait(),
            State::Connected | State::Idle | State::Disconnected => return false,
        }
        true
    }

    fn call_send(&mut self, msg: &Message) -> Result<()> {
        match self.framed.try_send(msg) {
            Err(e) if !e.is_transient() => {
                warn!(conn = %self.name, error = %e, "send error");
                self.fail(e.clone());
                Err(e)
            }
            r => r,
        }
    }

    fn answer_echo(&mut self, request: &Message) {
        match self.framed.try_send(&Message::echo_reply(request)) {
            Ok(()) => debug!(conn = %self.name, xid = request.xid(), "answered echo request"),
            Err(e) if e.is_transient() => {
                debug!(conn = %self.name, xid = request.xid(), "output queue busy, echo request dropped")
            }
            Err(e) => self.fail(e),
        }
    }

    /// Send a liveness probe now
    pub fn send_echo_request(&mut self) -> Result<()> {
        let probe = Message::echo_request(self.version, self.next_xid());
        self.send(&probe, false)
    }
}

impl<S: AsyncStream> Connection for DeviceConnection<S> {
    type Message = Message;

    fn connect(&mut self, block: bool) -> Result<()> {
        if block {
            might_yield();
        }
        loop {
            match self.advance() {
                Err(Error::WouldBlock) if block => {
                    self.connect_wait();
                    suspend();
                }
                r => return r,
            }
        }
    }

    fn send(&mut self, msg: &Message, block: bool) -> Result<()> {
        if block {
            might_yield();
        }
        loop {
            let r = self.connect(block).and_then(|()| self.call_send(msg));
            match r {
                Err(Error::WouldBlock) if block => {
                    self.send_wait();
                    suspend();
                }
                Err(Error::Interrupted) => continue,
                r => return r,
            }
        }
    }

    fn recv(&mut self, block: bool) -> Result<Message> {
        if block {
            might_yield();
        }
        loop {
            match self.connect(false) {
                Ok(()) => {}
                Err(Error::WouldBlock) if block => {
                    self.connect_wait();
                    suspend();
                    continue;
                }
                Err(e) => return Err(e),
            }
            match self.framed.try_recv() {
                Ok(msg) => {
                    if self.state == State::Idle {
                        debug!(conn = %self.name, "message received, entering CONNECTED");
                        self.state = State::Connected;
                    }
                    self.liveness.arm(Instant::now());
                    if msg.msg_type() == wire::ECHO_REQUEST {
                        self.answer_echo(&msg);
                        continue;
                    }
                    return Ok(msg);
                }
                Err(Error::Interrupted) => continue,
                Err(Error::WouldBlock) if block => {
                    self.recv_wait();
                    self.tick_wait();
                    suspend();
                    self.tick(Instant::now());
                }
                Err(e) => {
                    if !e.is_transient() {
                        self.fail(e.clone());
                    }
                    return Err(e);
                }
            }
        }
    }

    fn connect_wait(&self) {
        if !self.handshake_wait() {
            immediate_wake();
        }
    }

    fn send_wait(&self) {
        if !self.handshake_wait() {
            if self.state == State::Disconnected {
                immediate_wake();
            } else {
                self.framed.stream().write_wait();
            }
        }
    }

    fn recv_wait(&self) {
        if !self.handshake_wait() {
            if self.state == State::Disconnected {
                immediate_wake();
            } else {
                self.framed.stream().read_wait();
            }
        }
    }

    fn close(&mut self) {
        self.framed.close();
        if self.state != State::Disconnected {
            self.state = State::Disconnected;
            self.error = Some(Error::Os(Errno::ENOTCONN));
        }
    }

    fn tick(&mut self, now: Instant) {
        if self.framed.tx_pending() {
            if let Err(e) = self.framed.flush() {
                self.fail_unless_transient(e);
            }
        }
        match self.liveness.check(self.state, now) {
            Tick::Quiet => {}
            Tick::Probe => {
                let probe = Message::echo_request(self.version, self.next_xid());
                match self.framed.try_send(&probe) {
                    Ok(()) => {
                        debug!(
                            conn = %self.name,
                            idle = ?self.liveness.interval(),
                            "sending inactivity probe"
                        );
                        self.state = State::Idle;
                        self.liveness.arm(now);
                    }
                    Err(e) if e.is_transient() => {}
                    Err(e) => {
                        warn!(conn = %self.name, error = %e, "sending inactivity probe failed");
                        self.fail(e);
                        self.framed.close();
                    }
                }
            }
            Tick::Expired => {
                warn!(
                    conn = %self.name,
                    after = ?self.liveness.interval(),
                    "no response to inactivity probe, disconnecting"
                );
                self.fail(Error::protocol("no response to inactivity probe"));
                self.framed.close();
            }
        }
    }

    fn tick_wait(&self) {
        if self.state.is_established() {
            if let Some(deadline) = self.liveness.deadline() {
                timer_wait(deadline);
            }
        }
        if self.framed.tx_pending() {
            self.framed.stream().write_wait();
        }
    }
}

impl<S> fmt::Display for DeviceConnection<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

impl<S> fmt::Debug for DeviceConnection<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceConnection")
            .field("name", &self.name)
            .field("state", &self.state)
            .field("version", &self.version)
            .field("error", &self.error)
            .finish()
    }
}
