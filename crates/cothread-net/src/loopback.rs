//! In-memory transports
//!
//! [`LoopbackStream`] and [`LoopbackDatagram`] behave like their socket
//! counterparts (would-block, EOF, wait registrations) without touching
//! the network, so connections and transactions can be exercised in
//! tests. The datagram pair can also simulate receive-buffer overruns.

use std::collections::VecDeque;
use std::sync::Arc;

use cothread_core::SpinLock;
use cothread_runtime::{immediate_wake, Cond};
use nix::errno::Errno;

use crate::datagram::AsyncDatagram;
use crate::error::{Error, Result};
use crate::stream::AsyncStream;

const STREAM_CAPACITY: usize = 64 * 1024;
const INBOX_LIMIT: usize = 256;

struct Pipe {
    buf: VecDeque<u8>,
    capacity: usize,
    closed: bool,
}

/// One direction of a stream pair
struct Channel {
    pipe: SpinLock<Pipe>,
    readable: Cond,
    writable: Cond,
}

impl Channel {
    fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            pipe: SpinLock::new(Pipe { buf: VecDeque::new(), capacity, closed: false }),
            readable: Cond::new(),
            writable: Cond::new(),
        })
    }

    fn shut(&self) {
        self.pipe.lock().closed = true;
        self.readable.broadcast();
        self.writable.broadcast();
    }
}

/// One end of an in-memory byte stream
pub struct LoopbackStream {
    rx: Arc<Channel>,
    tx: Arc<Channel>,
    open: bool,
}

impl LoopbackStream {
    pub fn pair() -> (Self, Self) {
        Self::pair_with_capacity(STREAM_CAPACITY)
    }

    /// Pair whose directions each buffer at most `capacity` bytes
    pub fn pair_with_capacity(capacity: usize) -> (Self, Self) {
        let ab = Channel::new(capacity);
        let ba = Channel::new(capacity);
        (
            Self { rx: Arc::clone(&ba), tx: Arc::clone(&ab), open: true },
            Self { rx: ab, tx: ba, open: true },
        )
    }

    /// Bytes written by the peer and not read yet
    pub fn readable_bytes(&self) -> usize {
        self.rx.pipe.lock().buf.len()
    }

    fn check_open(&self) -> Result<()> {
        if self.open {
            Ok(())
        } else {
            Err(Error::Os(Errno::EBADF))
        }
    }
}

impl AsyncStream for LoopbackStream {
    fn try_read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.check_open()?;
        let n = {
            let mut pipe = self.rx.pipe.lock();
            if pipe.buf.is_empty() {
                return if pipe.closed { Ok(0) } else { Err(Error::WouldBlock) };
            }
            let n = buf.len().min(pipe.buf.len());
            for (dst, src) in buf.iter_mut().zip(pipe.buf.drain(..n)) {
                *dst = src;
            }
            n
        };
        self.rx.writable.broadcast();
        Ok(n)
    }

    fn try_write(&mut self, buf: &[u8]) -> Result<usize> {
        self.check_open()?;
        let n = {
            let mut pipe = self.tx.pipe.lock();
            if pipe.closed {
                return Err(Error::Os(Errno::EPIPE));
            }
            let n = buf.len().min(pipe.capacity - pipe.buf.len());
            if n == 0 && !buf.is_empty() {
                return Err(Error::WouldBlock);
            }
            pipe.buf.extend(&buf[..n]);
            n
        };
        self.tx.readable.broadcast();
        Ok(n)
    }

    fn connect_error(&mut self) -> Result<()> {
        self.check_open()
    }

    fn read_wait(&self) {
        let pipe = self.rx.pipe.lock();
        if !self.open || pipe.closed || !pipe.buf.is_empty() {
            immediate_wake();
        } else {
            self.rx.readable.wait();
        }
    }

    fn write_wait(&self) {
        let pipe = self.tx.pipe.lock();
        if !self.open || pipe.closed || pipe.buf.len() < pipe.capacity {
            immediate_wake();
        } else {
            self.tx.writable.wait();
        }
    }

    fn connect_wait(&self) {
        immediate_wake();
    }

    fn close(&mut self) {
        if self.open {
            self.open = false;
            self.tx.shut();
            self.rx.shut();
        }
    }
}

impl Drop for LoopbackStream {
    fn drop(&mut self) {
        self.close();
    }
}

struct Queue {
    datagrams: VecDeque<Vec<u8>>,
    limit: usize,
    overrun: bool,
}

/// Receive side of one datagram endpoint
struct Inbox {
    queue: SpinLock<Queue>,
    readable: Cond,
}

impl Inbox {
    fn new(limit: usize) -> Arc<Self> {
        Arc::new(Self {
            queue: SpinLock::new(Queue { datagrams: VecDeque::new(), limit, overrun: false }),
            readable: Cond::new(),
        })
    }
}

/// One end of an in-memory datagram link
///
/// Like a kernel socket, a full inbox drops the incoming datagram and the
/// receiver's next `try_recv` reports ENOBUFS.
pub struct LoopbackDatagram {
    rx: Arc<Inbox>,
    tx: Arc<Inbox>,
}

impl LoopbackDatagram {
    pub fn pair() -> (Self, Self) {
        Self::pair_with_limit(INBOX_LIMIT)
    }

    /// Pair whose inboxes each hold at most `limit` datagrams
    pub fn pair_with_limit(limit: usize) -> (Self, Self) {
        let a = Inbox::new(limit);
        let b = Inbox::new(limit);
        (
            Self { rx: Arc::clone(&a), tx: Arc::clone(&b) },
            Self { rx: b, tx: a },
        )
    }

    /// Drop the oldest datagram queued for the peer and flag the loss
    pub fn overrun_peer(&self) {
        {
            let mut q = self.tx.queue.lock();
            q.datagrams.pop_front();
            q.overrun = true;
        }
        self.tx.readable.broadcast();
    }

    /// Datagrams waiting to be received on this end
    pub fn pending(&self) -> usize {
        self.rx.queue.lock().datagrams.len()
    }
}

impl AsyncDatagram for LoopbackDatagram {
    fn try_recv(&mut self) -> Result<Vec<u8>> {
        let mut q = self.rx.queue.lock();
        if q.overrun {
            q.overrun = false;
            return Err(Error::Os(Errno::ENOBUFS));
        }
        q.datagrams.pop_front().ok_or(Error::WouldBlock)
    }

    fn try_send(&mut self, datagram: &[u8]) -> Result<()> {
        {
            let mut q = self.tx.queue.lock();
            if q.datagrams.len() >= q.limit {
                q.overrun = true;
            } else {
                q.datagrams.push_back(datagram.to_vec());
            }
        }
        self.tx.readable.broadcast();
        Ok(())
    }

    fn recv_wait(&self) {
        let q = self.rx.queue.lock();
        if q.overrun || !q.datagrams.is_empty() {
            immediate_wake();
        } else {
            self.rx.readable.wait();
        }
    }

    fn send_wait(&self) {
        immediate_wake();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cothread_runtime::{Runtime, RuntimeConfig};
    use std::time::Duration;

    #[test]
    fn test_stream_capacity_and_eof() {
        let (mut a, mut b) = LoopbackStream::pair_with_capacity(4);
        assert_eq!(a.try_write(b"abcdef"), Ok(4));
        assert_eq!(a.try_write(b"ef"), Err(Error::WouldBlock));
        let mut buf = [0u8; 8];
        assert_eq!(b.try_read(&mut buf), Ok(4));
        assert_eq!(&buf[..4], b"abcd");
        assert_eq!(b.try_read(&mut buf), Err(Error::WouldBlock));
        a.close();
        assert_eq!(b.try_read(&mut buf), Ok(0));
        assert_eq!(b.try_write(b"x"), Err(Error::Os(Errno::EPIPE)));
        assert_eq!(a.try_read(&mut buf), Err(Error::Os(Errno::EBADF)));
    }

    #[test]
    fn test_stream_blocking_read_wakes() {
        let rt = Runtime::new(RuntimeConfig::new().max_poll_wait(Duration::from_millis(50))).unwrap();
        let g = rt.default_group();
        let (mut a, mut b) = LoopbackStream::pair();
        let reader = g
            .spawn(move |_| {
                let mut buf = [0u8; 3];
                b.read_fully(&mut buf, true).1.map(|_| buf)
            })
            .unwrap();
        let writer = g
            .spawn(move |_| {
                a.write(b"x", true).unwrap();
                cothread_runtime::yield_now();
                a.write(b"yz", true).unwrap();
                a
            })
            .unwrap();
        let _a = writer.join();
        assert_eq!(reader.join(), Ok(*b"xyz"));
    }

    #[test]
    fn test_datagram_overrun() {
        let (mut a, mut b) = LoopbackDatagram::pair();
        b.try_send(b"one").unwrap();
        b.try_send(b"two").unwrap();
        assert_eq!(a.pending(), 2);
        b.overrun_peer();
        assert_eq!(a.try_recv(), Err(Error::Os(Errno::ENOBUFS)));
        assert_eq!(a.try_recv(), Ok(b"two".to_vec()));
        assert_eq!(a.try_recv(), Err(Error::WouldBlock));
    }

    #[test]
    fn test_datagram_full_inbox_drops() {
        let (mut a, mut b) = LoopbackDatagram::pair_with_limit(1);
        b.try_send(b"kept").unwrap();
        b.try_send(b"lost").unwrap();
        assert_eq!(a.try_recv(), Err(Error::Os(Errno::ENOBUFS)));
        assert_eq!(a.recv(true), Ok(b"kept".to_vec()));
    }
}
