//! Byte-stream contract and its socket implementation
//!
//! Implementors supply single non-blocking attempts plus the wait
//! registrations that tell the scheduler when to retry; the blocking
//! forms are built on top as "try, register, suspend" loops.

use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};

use cothread_runtime::{fd_closed, fd_read_wait, fd_write_wait, immediate_wake, io, might_yield, suspend};
use nix::errno::Errno;
use tracing::debug;

use crate::error::{Error, Result};

/// A connected byte stream driven by the cooperative scheduler
pub trait AsyncStream: Send {
    /// One non-blocking read; `Ok(0)` is end of stream
    fn try_read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// One non-blocking write
    fn try_write(&mut self, buf: &[u8]) -> Result<usize>;

    /// Outcome of an in-progress connect: `WouldBlock` while pending
    fn connect_error(&mut self) -> Result<()>;

    fn read_wait(&self);

    fn write_wait(&self);

    fn connect_wait(&self);

    /// Release the transport; later calls fail with EBADF
    fn close(&mut self);

    fn read(&mut self, buf: &mut [u8], block: bool) -> Result<usize> {
        if block {
            might_yield();
        }
        loop {
            match self.try_read(buf) {
                Err(Error::WouldBlock) if block => {
                    self.read_wait();
                    suspend();
                }
                Err(Error::Interrupted) => continue,
                r => return r,
            }
        }
    }

    fn write(&mut self, buf: &[u8], block: bool) -> Result<usize> {
        if block {
            might_yield();
        }
        loop {
            match self.try_write(buf) {
                Err(Error::WouldBlock) if block => {
                    self.write_wait();
                    suspend();
                }
                Err(Error::Interrupted) => continue,
                r => return r,
            }
        }
    }

    /// Read until `buf` is full
    ///
    /// Returns the bytes read together with the status; end of stream
    /// before the buffer fills is `Eof`.
    fn read_fully(&mut self, buf: &mut [u8], block: bool) -> (usize, Result<()>) {
        let mut done = 0;
        while done < buf.len() {
            match self.read(&mut buf[done..], block) {
                Ok(0) => return (done, Err(Error::Eof)),
                Ok(n) => done += n,
                Err(e) => return (done, Err(e)),
            }
        }
        (done, Ok(()))
    }

    /// Write all of `buf`, returning the bytes written together with the status
    fn write_fully(&mut self, buf: &[u8], block: bool) -> (usize, Result<()>) {
        let mut done = 0;
        while done < buf.len() {
            match self.write(&buf[done..], block) {
                Ok(0) => return (done, Err(Error::Os(Errno::EPIPE))),
                Ok(n) => done += n,
                Err(e) => return (done, Err(e)),
            }
        }
        (done, Ok(()))
    }
}

/// Stream over a non-blocking socket descriptor
#[derive(Debug)]
pub struct FdStream {
    fd: Option<OwnedFd>,
    connecting: bool,
}

impl FdStream {
    /// Adopt a connected descriptor, switching it to non-blocking mode
    pub fn from_fd(fd: OwnedFd) -> Result<Self> {
        io::set_nonblocking(fd.as_raw_fd())?;
        Ok(Self { fd: Some(fd), connecting: false })
    }

    /// Start a TCP connection without waiting for it to complete
    pub fn connect_tcp(addr: &SocketAddr) -> Result<Self> {
        let fd = io::socket_for(addr, libc::SOCK_STREAM)?;
        let done = io::connect_start(fd.as_raw_fd(), addr)?;
        debug!(%addr, done, "tcp connect started");
        Ok(Self { fd: Some(fd), connecting: !done })
    }

    /// Connected AF_UNIX stream pair
    pub fn pair() -> Result<(Self, Self)> {
        let (a, b) = io::socketpair(libc::SOCK_STREAM)?;
        Ok((
            Self { fd: Some(a), connecting: false },
            Self { fd: Some(b), connecting: false },
        ))
    }

    pub fn raw_fd(&self) -> Option<RawFd> {
        self.fd.as_ref().map(AsRawFd::as_raw_fd)
    }

    pub fn is_open(&self) -> bool {
        self.fd.is_some()
    }

    fn fd(&self) -> Result<RawFd> {
        self.raw_fd().ok_or(Error::Os(Errno::EBADF))
    }

    /// Poll the pending connect once without blocking
    fn connect_ready(fd: RawFd) -> Result<bool> {
        let mut pfd = libc::pollfd { fd, events: libc::POLLOUT, revents: 0 };
        // SAFETY: pfd is a valid pollfd array of length 1
        let n = Errno::result(unsafe { libc::poll(&mut pfd, 1, 0) })?;
        Ok(n > 0)
    }
}

impl AsyncStream for FdStream {
    fn try_read(&mut self, buf: &mut [u8]) -> Result<usize> {
        Ok(io::try_read(self.fd()?, buf)?)
    }

    fn try_write(&mut self, buf: &[u8]) -> Result<usize> {
        Ok(io::try_send(self.fd()?, buf, 0)?)
    }

    fn connect_error(&mut self) -> Result<()> {
        let fd = self.fd()?;
        if !self.connecting {
            return Ok(());
        }
        if !Self::connect_ready(fd)? {
            return Err(Error::WouldBlock);
        }
        self.connecting = false;
        io::take_error(fd).map_err(Error::Os)
    }

    fn read_wait(&self) {
        match self.raw_fd() {
            Some(fd) => fd_read_wait(fd),
            None => immediate_wake(),
        };
    }

    fn write_wait(&self) {
        match self.raw_fd() {
            Some(fd) => fd_write_wait(fd),
            None => immediate_wake(),
        };
    }

    fn connect_wait(&self) {
        if self.connecting {
            self.write_wait();
        } else {
            immediate_wake();
        }
    }

    fn close(&mut self) {
        if let Some(fd) = self.fd.take() {
            fd_closed(fd.as_raw_fd());
        }
    }
}

/// Listening TCP socket handing out [`FdStream`]s
#[derive(Debug)]
pub struct FdListener {
    fd: OwnedFd,
    addr: Option<SocketAddr>,
}

impl FdListener {
    pub fn bind(addr: &SocketAddr) -> Result<Self> {
        let fd = io::tcp_listen(addr)?;
        let addr = io::local_addr(fd.as_raw_fd())?;
        debug!(?addr, "listening");
        Ok(Self { fd, addr })
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.addr
    }

    /// One non-blocking accept
    pub fn try_accept(&self) -> Result<(FdStream, Option<SocketAddr>)> {
        let (fd, peer) = io::try_accept(self.fd.as_raw_fd())?;
        Ok((FdStream { fd: Some(fd), connecting: false }, peer))
    }

    pub fn accept(&self) -> Result<(FdStream, Option<SocketAddr>)> {
        let (fd, peer) = io::accept(self.fd.as_raw_fd())?;
        Ok((FdStream { fd: Some(fd), connecting: false }, peer))
    }

    pub fn accept_wait(&self) {
        fd_read_wait(self.fd.as_raw_fd());
    }
}

impl Drop for FdListener {
    fn drop(&mut self) {
        fd_closed(self.fd.as_raw_fd());
    }
}

impl Drop for FdStream {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cothread_runtime::{Runtime, RuntimeConfig};
    use std::time::Duration;

    fn runtime() -> Runtime {
        Runtime::new(RuntimeConfig::new().max_poll_wait(Duration::from_millis(50))).unwrap()
    }

    #[test]
    fn test_pair_nonblocking() {
        let (mut a, mut b) = FdStream::pair().unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(a.try_read(&mut buf), Err(Error::WouldBlock));
        assert_eq!(b.write(b"abc", false), Ok(3));
        assert_eq!(a.read(&mut buf, false), Ok(3));
        b.close();
        assert!(!b.is_open());
        assert_eq!(b.try_write(b"x"), Err(Error::Os(Errno::EBADF)));
        assert_eq!(a.read(&mut buf, true), Ok(0));
    }

    #[test]
    fn test_read_fully_across_suspends() {
        let rt = runtime();
        let g = rt.default_group();
        let (mut a, mut b) = FdStream::pair().unwrap();
        let reader = g
            .spawn(move |_| {
                let mut buf = [0u8; 6];
                let (n, status) = a.read_fully(&mut buf, true);
                (n, status, buf)
            })
            .unwrap();
        let writer = g
            .spawn(move |_| {
                b.write_fully(b"abc", true).1.unwrap();
                cothread_runtime::sleep(Duration::from_millis(5));
                b.write_fully(b"def", true).1.unwrap();
            })
            .unwrap();
        writer.join();
        assert_eq!(reader.join(), (6, Ok(()), *b"abcdef"));
    }

    #[test]
    fn test_read_fully_eof() {
        let (mut a, b) = FdStream::pair().unwrap();
        drop(b);
        let mut buf = [0u8; 4];
        assert_eq!(a.read_fully(&mut buf, true), (0, Err(Error::Eof)));
    }

    #[test]
    fn test_tcp_connect_and_accept() {
        let rt = runtime();
        let g = rt.default_group();
        let listener = FdListener::bind(&"127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();
        assert!(matches!(listener.try_accept(), Err(Error::WouldBlock)));

        let client = g
            .spawn(move |_| {
                let mut s = FdStream::connect_tcp(&addr).unwrap();
                loop {
                    match s.connect_error() {
                        Err(Error::WouldBlock) => {
                            s.connect_wait();
                            suspend();
                        }
                        r => break r.map(|_| s),
                    }
                }
            })
            .unwrap();
        let (mut server, peer) = g.spawn(move |_| listener.accept().unwrap()).unwrap().join();
        assert!(peer.is_some());
        let mut c = client.join().unwrap();
        c.write_fully(b"hello", true).1.unwrap();
        let mut buf = [0u8; 5];
        assert_eq!(server.read_fully(&mut buf, true), (5, Ok(())));
        assert_eq!(&buf, b"hello");
    }
}
