//! poll(2) wrapper shared by group drivers, `poll()` and native waits

use std::os::unix::io::RawFd;
use std::time::Duration;

use nix::errno::Errno;

pub(crate) struct PollSet {
    fds: Vec<libc::pollfd>,
}

impl PollSet {
    pub(crate) fn new() -> Self {
        Self { fds: Vec::new() }
    }

    /// Add a descriptor; returns its index for `revents`
    pub(crate) fn add(&mut self, fd: RawFd, events: i16) -> usize {
        self.fds.push(libc::pollfd { fd, events, revents: 0 });
        self.fds.len() - 1
    }

    pub(crate) fn len(&self) -> usize {
        self.fds.len()
    }

    /// Wait up to `timeout` (forever if `None`); returns the ready count
    ///
    /// An interrupted poll reports zero ready descriptors.
    pub(crate) fn poll(&mut self, timeout: Option<Duration>) -> Result<usize, Errno> {
        let ms: libc::c_int = match timeout {
            None => -1,
            // Round up so a sub-millisecond deadline does not spin.
            Some(d) => {
                let ms = (d.as_micros() + 999) / 1000;
                ms.min(libc::c_int::MAX as u128) as libc::c_int
            }
        };
        // SAFETY: the pointer and length describe our owned pollfd vector
        let ret = unsafe {
            libc::poll(self.fds.as_mut_ptr(), self.fds.len() as libc::nfds_t, ms)
        };
        match Errno::result(ret) {
            Ok(n) => Ok(n as usize),
            Err(Errno::EINTR) => Ok(0),
            Err(e) => Err(e),
        }
    }

    #[inline]
    pub(crate) fn revents(&self, idx: usize) -> i16 {
        self.fds[idx].revents
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;
    use std::time::Instant;

    #[test]
    fn test_poll_readable() {
        let (mut a, b) = UnixStream::pair().unwrap();
        let mut set = PollSet::new();
        let idx = set.add(b.as_raw_fd(), libc::POLLIN);
        assert_eq!(set.poll(Some(Duration::ZERO)).unwrap(), 0);

        a.write_all(b"x").unwrap();
        let mut set = PollSet::new();
        set.add(b.as_raw_fd(), libc::POLLIN);
        assert_eq!(set.poll(Some(Duration::from_millis(100))).unwrap(), 1);
        assert_ne!(set.revents(idx) & libc::POLLIN, 0);
    }

    #[test]
    fn test_poll_timeout_rounds_up() {
        let mut set = PollSet::new();
        let start = Instant::now();
        set.poll(Some(Duration::from_micros(1500))).unwrap();
        assert!(start.elapsed() >= Duration::from_millis(1));
    }

    #[test]
    fn test_closed_descriptor_reports_nval() {
        let mut set = PollSet::new();
        set.add(987_654, libc::POLLIN);
        assert_eq!(set.poll(Some(Duration::ZERO)).unwrap(), 1);
        assert_ne!(set.revents(0) & libc::POLLNVAL, 0);
    }
}
