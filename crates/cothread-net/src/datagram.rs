//! Datagram contract

use cothread_runtime::{might_yield, suspend};

use crate::error::{Error, Result};

/// A message-oriented transport driven by the cooperative scheduler
///
/// Loss of a queued inbound datagram is reported by `try_recv` as
/// `Error::Os(ENOBUFS)`, once per loss event.
pub trait AsyncDatagram: Send {
    /// One non-blocking receive of a whole datagram
    fn try_recv(&mut self) -> Result<Vec<u8>>;

    /// One non-blocking send of a whole datagram
    fn try_send(&mut self, datagram: &[u8]) -> Result<()>;

    fn recv_wait(&self);

    fn send_wait(&self);

    fn recv(&mut self, block: bool) -> Result<Vec<u8>> {
        if block {
            might_yield();
        }
        loop {
            match self.try_recv() {
                Err(Error::WouldBlock) if block => {
                    self.recv_wait();
                    suspend();
                }
                Err(Error::Interrupted) => continue,
                r => return r,
            }
        }
    }

    fn send(&mut self, datagram: &[u8], block: bool) -> Result<()> {
        if block {
            might_yield();
        }
        loop {
            match self.try_send(datagram) {
                Err(Error::WouldBlock) if block => {
                    self.send_wait();
                    suspend();
                }
                Err(Error::Interrupted) => continue,
                r => return r,
            }
        }
    }
}
