//! Cross-thread wakeup for an idle group driver
//!
//! The driver polls the notifier's descriptor alongside task descriptors.
//! Coalescing: several `notify()` calls before the driver drains result in
//! a single wakeup.

use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use cothread_core::SchedResult;
use nix::errno::Errno;

cfg_if::cfg_if! {
    if #[cfg(any(target_os = "linux", target_os = "android"))] {
        /// eventfd-backed notifier
        pub(crate) struct Notifier {
            fd: OwnedFd,
        }

        impl Notifier {
            pub(crate) fn new() -> SchedResult<Self> {
                // SAFETY: eventfd has no memory-safety preconditions
                let fd = Errno::result(unsafe {
                    libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC)
                })?;
                // SAFETY: fd was just created and is owned by nobody else
                Ok(Self { fd: unsafe { OwnedFd::from_raw_fd(fd) } })
            }

            pub(crate) fn fd(&self) -> RawFd {
                self.fd.as_raw_fd()
            }

            pub(crate) fn notify(&self) -> Result<(), Errno> {
                let val: u64 = 1;
                // SAFETY: writes 8 bytes from a live u64
                let ret = unsafe {
                    libc::write(
                        self.fd.as_raw_fd(),
                        &val as *const u64 as *const libc::c_void,
                        std::mem::size_of::<u64>(),
                    )
                };
                match Errno::result(ret) {
                    Ok(_) => Ok(()),
                    // Counter saturated: a wakeup is already pending.
                    Err(Errno::EAGAIN) => Ok(()),
                    Err(e) => Err(e),
                }
            }

            pub(crate) fn drain(&self) {
                let mut val: u64 = 0;
                // SAFETY: reads at most 8 bytes into a live u64
                unsafe {
                    libc::read(
                        self.fd.as_raw_fd(),
                        &mut val as *mut u64 as *mut libc::c_void,
                        std::mem::size_of::<u64>(),
                    );
                }
            }
        }
    } else {
        /// Self-pipe notifier for platforms without eventfd
        pub(crate) struct Notifier {
            rx: OwnedFd,
            tx: OwnedFd,
        }

        impl Notifier {
            pub(crate) fn new() -> SchedResult<Self> {
                let mut fds = [0 as libc::c_int; 2];
                // SAFETY: pipe fills the two-element array
                Errno::result(unsafe { libc::pipe(fds.as_mut_ptr()) })?;
                for fd in fds {
                    // SAFETY: fd is a valid descriptor from pipe()
                    unsafe {
                        libc::fcntl(fd, libc::F_SETFL, libc::O_NONBLOCK);
                        libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC);
                    }
                }
                // SAFETY: both descriptors were just created
                Ok(Self {
                    rx: unsafe { OwnedFd::from_raw_fd(fds[0]) },
                    tx: unsafe { OwnedFd::from_raw_fd(fds[1]) },
                })
            }

            pub(crate) fn fd(&self) -> RawFd {
                self.rx.as_raw_fd()
            }

            pub(crate) fn notify(&self) -> Result<(), Errno> {
                let byte = 1u8;
                // SAFETY: writes one byte from a live u8
                let ret = unsafe {
                    libc::write(self.tx.as_raw_fd(), &byte as *const u8 as *const libc::c_void, 1)
                };
                match Errno::result(ret) {
                    Ok(_) | Err(Errno::EAGAIN) => Ok(()),
                    Err(e) => Err(e),
                }
            }

            pub(crate) fn drain(&self) {
                let mut buf = [0u8; 64];
                // SAFETY: reads into a live buffer of the given length
                while unsafe {
                    libc::read(self.rx.as_raw_fd(), buf.as_mut_ptr() as *mut libc::c_void, buf.len())
                } > 0 {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::poller::PollSet;
    use std::time::Duration;

    #[test]
    fn test_notify_then_drain() {
        let n = Notifier::new().unwrap();
        let mut set = PollSet::new();
        set.add(n.fd(), libc::POLLIN);
        assert_eq!(set.poll(Some(Duration::ZERO)).unwrap(), 0);

        n.notify().unwrap();
        n.notify().unwrap();
        let mut set = PollSet::new();
        set.add(n.fd(), libc::POLLIN);
        assert_eq!(set.poll(Some(Duration::ZERO)).unwrap(), 1);

        n.drain();
        let mut set = PollSet::new();
        set.add(n.fd(), libc::POLLIN);
        assert_eq!(set.poll(Some(Duration::ZERO)).unwrap(), 0);
    }
}
