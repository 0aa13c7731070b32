//! Protocol-independent connection interface

use std::fmt;
use std::time::Instant;

use crate::error::Result;

/// A message connection driven by the cooperative scheduler
///
/// `block == false` calls return `Error::WouldBlock` instead of waiting;
/// the matching `*_wait` registers what to wait for before `suspend()`.
pub trait Connection: fmt::Display + Send {
    type Message: Send;

    /// Drive connection setup as far as possible
    fn connect(&mut self, block: bool) -> Result<()>;

    /// Queue `msg`; success means accepted, not delivered
    fn send(&mut self, msg: &Self::Message, block: bool) -> Result<()>;

    fn recv(&mut self, block: bool) -> Result<Self::Message>;

    fn connect_wait(&self);

    fn send_wait(&self);

    fn recv_wait(&self);

    fn close(&mut self);

    /// Housekeeping at `now` (liveness probes, queued output)
    fn tick(&mut self, _now: Instant) {}

    /// Register the wake-ups `tick` needs
    fn tick_wait(&self) {}
}
