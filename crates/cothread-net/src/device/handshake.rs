//! Handshake states, version negotiation and liveness timing
//!
//! These are the pure parts of a device connection: given the current
//! state and one observation they decide the next state, leaving the I/O
//! to [`DeviceConnection`](super::DeviceConnection).

use std::fmt;
use std::time::{Duration, Instant};

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Waiting for the transport connect to finish
    Connecting,
    SendHello,
    RecvHello,
    /// Established; liveness deadline armed
    Connected,
    /// Probe sent, waiting for any traffic
    Idle,
    /// Version negotiation failed; telling the peer
    SendError,
    Disconnected,
}

impl State {
    pub fn is_established(self) -> bool {
        matches!(self, State::Connected | State::Idle)
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            State::Connecting => "CONNECTING",
            State::SendHello => "SEND_HELLO",
            State::RecvHello => "RECV_HELLO",
            State::Connected => "CONNECTED",
            State::Idle => "IDLE",
            State::SendError => "SEND_ERROR",
            State::Disconnected => "DISCONNECTED",
        })
    }
}

/// Supported version range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Versions {
    pub min: u8,
    pub max: u8,
    /// Peers advertising more than this are refused outright
    pub experimental: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Negotiation {
    Agreed(u8),
    /// No usable common version; `negotiated` is what `min(max, peer)` gave
    Refused { negotiated: u8 },
}

impl Versions {
    pub fn negotiate(&self, peer: u8) -> Negotiation {
        let version = self.max.min(peer);
        if version < self.min || peer > self.experimental {
            Negotiation::Refused { negotiated: version }
        } else {
            Negotiation::Agreed(version)
        }
    }

    /// Diagnostic carried by the error frame sent on refusal
    pub fn mismatch_text(&self, peer: u8) -> String {
        format!(
            "We support versions 0x{:02x} to 0x{:02x} inclusive but you support no later than version 0x{:02x}.",
            self.min, self.max, peer
        )
    }
}

/// What a liveness check asks the connection to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    Quiet,
    /// Deadline passed while connected: send a probe, go idle
    Probe,
    /// Deadline passed while idle: the peer is gone
    Expired,
}

#[derive(Debug, Clone)]
pub struct Liveness {
    interval: Duration,
    deadline: Option<Instant>,
}

impl Liveness {
    pub fn new(interval: Duration) -> Self {
        Self { interval, deadline: None }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Restart the countdown from `now`
    pub fn arm(&mut self, now: Instant) {
        self.deadline = Some(now + self.interval);
    }

    pub fn check(&self, state: State, now: Instant) -> Tick {
        match (state, self.deadline) {
            (State::Connected, Some(d)) if now >= d => Tick::Probe,
            (State::Idle, Some(d)) if now >= d => Tick::Expired,
            _ => Tick::Quiet,
        }
    }
}
