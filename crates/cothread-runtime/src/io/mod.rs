//! Cooperative socket system calls
//!
//! Sockets are non-blocking; a call that would block registers an fd wait
//! and suspends the current task instead, so these never pay the cost of
//! native migration. EINTR is retried.

mod sockaddr;

use std::mem;
use std::net::SocketAddr;
use std::os::unix::io::{FromRawFd, OwnedFd, RawFd};

use nix::errno::Errno;

use crate::scheduler::{fd_block, Interest};

#[cfg(any(target_os = "linux", target_os = "android"))]
const SEND_FLAGS: libc::c_int = libc::MSG_NOSIGNAL;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const SEND_FLAGS: libc::c_int = 0;

/// Run `op` until it stops reporting EINTR/EAGAIN, suspending on EAGAIN
fn io_loop<T>(fd: RawFd, interest: Interest, mut op: impl FnMut() -> Result<T, Errno>) -> Result<T, Errno> {
    loop {
        match op() {
            Err(Errno::EINTR) => continue,
            Err(Errno::EAGAIN) => {
                fd_block(fd, interest);
            }
            r => return r,
        }
    }
}

fn retry_intr<T>(mut op: impl FnMut() -> Result<T, Errno>) -> Result<T, Errno> {
    loop {
        match op() {
            Err(Errno::EINTR) => continue,
            r => return r,
        }
    }
}

pub fn set_nonblocking(fd: RawFd) -> Result<(), Errno> {
    // SAFETY: fcntl on a caller-supplied descriptor
    let flags = Errno::result(unsafe { libc::fcntl(fd, libc::F_GETFL) })?;
    // SAFETY: as above
    Errno::result(unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) }).map(drop)
}

cfg_if::cfg_if! {
    if #[cfg(any(target_os = "linux", target_os = "android"))] {
        /// socket(2), non-blocking and close-on-exec
        pub fn socket(domain: libc::c_int, ty: libc::c_int, protocol: libc::c_int) -> Result<OwnedFd, Errno> {
            // SAFETY: socket has no memory-safety preconditions
            let fd = Errno::result(unsafe {
                libc::socket(domain, ty | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC, protocol)
            })?;
            // SAFETY: fd was just created
            Ok(unsafe { OwnedFd::from_raw_fd(fd) })
        }

        fn accept_raw(fd: RawFd, addr: *mut libc::sockaddr, len: &mut libc::socklen_t) -> Result<OwnedFd, Errno> {
            // SAFETY: addr and len describe a writable sockaddr_storage
            let new = Errno::result(unsafe {
                libc::accept4(fd, addr, len, libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC)
            })?;
            // SAFETY: accept4 returned a fresh descriptor
            Ok(unsafe { OwnedFd::from_raw_fd(new) })
        }
    } else {
        /// socket(2), non-blocking and close-on-exec
        pub fn socket(domain: libc::c_int, ty: libc::c_int, protocol: libc::c_int) -> Result<OwnedFd, Errno> {
            // SAFETY: socket has no memory-safety preconditions
            let fd = Errno::result(unsafe { libc::socket(domain, ty, protocol) })?;
            // SAFETY: fd was just created
            let owned = unsafe { OwnedFd::from_raw_fd(fd) };
            set_nonblocking(fd)?;
            // SAFETY: fcntl on our own descriptor
            Errno::result(unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) })?;
            Ok(owned)
        }

        fn accept_raw(fd: RawFd, addr: *mut libc::sockaddr, len: &mut libc::socklen_t) -> Result<OwnedFd, Errno> {
            // SAFETY: addr and len describe a writable sockaddr_storage
            let new = Errno::result(unsafe { libc::accept(fd, addr, len) })?;
            // SAFETY: accept returned a fresh descriptor
            let owned = unsafe { OwnedFd::from_raw_fd(new) };
            set_nonblocking(new)?;
            // SAFETY: fcntl on our own descriptor
            Errno::result(unsafe { libc::fcntl(new, libc::F_SETFD, libc::FD_CLOEXEC) })?;
            Ok(owned)
        }
    }
}

/// Non-blocking socket of the right family for `addr`
pub fn socket_for(addr: &SocketAddr, ty: libc::c_int) -> Result<OwnedFd, Errno> {
    let domain = match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    };
    socket(domain, ty, 0)
}

/// One read(2) attempt; EAGAIN goes back to the caller
pub fn try_read(fd: RawFd, buf: &mut [u8]) -> Result<usize, Errno> {
    retry_intr(|| {
        // SAFETY: buf is valid for writes of its length
        Errno::result(unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) }).map(|n| n as usize)
    })
}

/// One write(2) attempt; EAGAIN goes back to the caller
pub fn try_write(fd: RawFd, buf: &[u8]) -> Result<usize, Errno> {
    retry_intr(|| {
        // SAFETY: buf is valid for reads of its length
        Errno::result(unsafe { libc::write(fd, buf.as_ptr().cast(), buf.len()) }).map(|n| n as usize)
    })
}

/// One recv(2) attempt; EAGAIN goes back to the caller
pub fn try_recv(fd: RawFd, buf: &mut [u8], flags: libc::c_int) -> Result<usize, Errno> {
    retry_intr(|| {
        // SAFETY: buf is valid for writes of its length
        Errno::result(unsafe { libc::recv(fd, buf.as_mut_ptr().cast(), buf.len(), flags) })
            .map(|n| n as usize)
    })
}

/// One send(2) attempt; EAGAIN goes back to the caller
pub fn try_send(fd: RawFd, buf: &[u8], flags: libc::c_int) -> Result<usize, Errno> {
    retry_intr(|| {
        // SAFETY: buf is valid for reads of its length
        Errno::result(unsafe { libc::send(fd, buf.as_ptr().cast(), buf.len(), flags | SEND_FLAGS) })
            .map(|n| n as usize)
    })
}

pub fn read(fd: RawFd, buf: &mut [u8]) -> Result<usize, Errno> {
    io_loop(fd, Interest::Read, || try_read(fd, buf))
}

pub fn write(fd: RawFd, buf: &[u8]) -> Result<usize, Errno> {
    io_loop(fd, Interest::Write, || try_write(fd, buf))
}

pub fn recv(fd: RawFd, buf: &mut [u8], flags: libc::c_int) -> Result<usize, Errno> {
    io_loop(fd, Interest::Read, || try_recv(fd, buf, flags))
}

pub fn send(fd: RawFd, buf: &[u8], flags: libc::c_int) -> Result<usize, Errno> {
    io_loop(fd, Interest::Write, || try_send(fd, buf, flags))
}

pub fn recvfrom(fd: RawFd, buf: &mut [u8], flags: libc::c_int) -> Result<(usize, Option<SocketAddr>), Errno> {
    io_loop(fd, Interest::Read, || {
        // SAFETY: all-zero is a valid sockaddr_storage
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        // SAFETY: buf and storage are valid for writes of the given lengths
        let n = Errno::result(unsafe {
            libc::recvfrom(
                fd,
                buf.as_mut_ptr().cast(),
                buf.len(),
                flags,
                &mut storage as *mut _ as *mut libc::sockaddr,
                &mut len,
            )
        })?;
        Ok((n as usize, sockaddr::from_raw(&storage, len)))
    })
}

pub fn sendto(fd: RawFd, buf: &[u8], flags: libc::c_int, addr: &SocketAddr) -> Result<usize, Errno> {
    let (storage, len) = sockaddr::to_raw(addr);
    io_loop(fd, Interest::Write, || {
        // SAFETY: buf and storage are valid for reads of the given lengths
        Errno::result(unsafe {
            libc::sendto(
                fd,
                buf.as_ptr().cast(),
                buf.len(),
                flags | SEND_FLAGS,
                &storage as *const _ as *const libc::sockaddr,
                len,
            )
        })
        .map(|n| n as usize)
    })
}

/// Start a connection; `Ok(false)` means it is in progress
///
/// Wait for writability, then call [`take_error`] to learn the result.
pub fn connect_start(fd: RawFd, addr: &SocketAddr) -> Result<bool, Errno> {
    let (storage, len) = sockaddr::to_raw(addr);
    // SAFETY: storage is valid for reads of len bytes
    let ret = unsafe { libc::connect(fd, &storage as *const _ as *const libc::sockaddr, len) };
    match Errno::result(ret) {
        Ok(_) => Ok(true),
        // An interrupted connect keeps going asynchronously.
        Err(Errno::EINPROGRESS) | Err(Errno::EINTR) => Ok(false),
        Err(e) => Err(e),
    }
}

/// Pending socket error (SO_ERROR), cleared by reading it
pub fn take_error(fd: RawFd) -> Result<(), Errno> {
    let mut err: libc::c_int = 0;
    let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
    // SAFETY: err and len are valid for writes
    Errno::result(unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut err as *mut _ as *mut libc::c_void,
            &mut len,
        )
    })?;
    match err {
        0 => Ok(()),
        e => Err(Errno::from_raw(e)),
    }
}

/// connect(2), suspending until the connection completes
pub fn connect(fd: RawFd, addr: &SocketAddr) -> Result<(), Errno> {
    if connect_start(fd, addr)? {
        return Ok(());
    }
    fd_block(fd, Interest::Write);
    take_error(fd)
}

/// One accept(2) attempt; EAGAIN goes back to the caller
pub fn try_accept(fd: RawFd) -> Result<(OwnedFd, Option<SocketAddr>), Errno> {
    retry_intr(|| {
        // SAFETY: all-zero is a valid sockaddr_storage
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let owned = accept_raw(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len)?;
        Ok((owned, sockaddr::from_raw(&storage, len)))
    })
}

/// accept(2); the new socket is non-blocking and close-on-exec
pub fn accept(fd: RawFd) -> Result<(OwnedFd, Option<SocketAddr>), Errno> {
    io_loop(fd, Interest::Read, || try_accept(fd))
}

pub fn bind(fd: RawFd, addr: &SocketAddr) -> Result<(), Errno> {
    let (storage, len) = sockaddr::to_raw(addr);
    // SAFETY: storage is valid for reads of len bytes
    Errno::result(unsafe { libc::bind(fd, &storage as *const _ as *const libc::sockaddr, len) }).map(drop)
}

pub fn listen(fd: RawFd, backlog: libc::c_int) -> Result<(), Errno> {
    // SAFETY: plain syscall on a caller-supplied descriptor
    Errno::result(unsafe { libc::listen(fd, backlog) }).map(drop)
}

pub fn set_reuseaddr(fd: RawFd) -> Result<(), Errno> {
    let on: libc::c_int = 1;
    // SAFETY: on is valid for reads of its size
    Errno::result(unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &on as *const _ as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    })
    .map(drop)
}

/// getsockname(2)
pub fn local_addr(fd: RawFd) -> Result<Option<SocketAddr>, Errno> {
    // SAFETY: all-zero is a valid sockaddr_storage
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    // SAFETY: storage and len are valid for writes
    Errno::result(unsafe {
        libc::getsockname(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len)
    })?;
    Ok(sockaddr::from_raw(&storage, len))
}

/// Listening TCP socket bound to `addr`
pub fn tcp_listen(addr: &SocketAddr) -> Result<OwnedFd, Errno> {
    use std::os::unix::io::AsRawFd;

    let fd = socket_for(addr, libc::SOCK_STREAM)?;
    set_reuseaddr(fd.as_raw_fd())?;
    bind(fd.as_raw_fd(), addr)?;
    listen(fd.as_raw_fd(), 64)?;
    Ok(fd)
}

/// Connected AF_UNIX pair, both ends non-blocking and close-on-exec
pub fn socketpair(ty: libc::c_int) -> Result<(OwnedFd, OwnedFd), Errno> {
    let mut fds = [0 as libc::c_int; 2];
    // SAFETY: fds is valid for writes of two descriptors
    Errno::result(unsafe { libc::socketpair(libc::AF_UNIX, ty, 0, fds.as_mut_ptr()) })?;
    // SAFETY: socketpair returned two fresh descriptors
    let pair = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
    for fd in fds {
        set_nonblocking(fd)?;
        // SAFETY: fcntl on our own descriptor
        Errno::result(unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) })?;
    }
    Ok(pair)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::runtime::Runtime;
    use std::os::unix::io::AsRawFd;
    use std::time::Duration;

    fn runtime() -> Runtime {
        Runtime::new(RuntimeConfig::new().max_poll_wait(Duration::from_millis(50))).unwrap()
    }

    #[test]
    fn test_tcp_echo_in_one_group() {
        let rt = runtime();
        let g = rt.default_group();
        let listener = tcp_listen(&"127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = local_addr(listener.as_raw_fd()).unwrap().unwrap();

        let server = g
            .spawn(move |_| {
                let (conn, peer) = accept(listener.as_raw_fd()).unwrap();
                assert!(peer.is_some());
                let mut buf = [0u8; 16];
                let n = read(conn.as_raw_fd(), &mut buf).unwrap();
                write(conn.as_raw_fd(), &buf[..n]).unwrap();
            })
            .unwrap();
        let client = g
            .spawn(move |_| {
                let fd = socket_for(&addr, libc::SOCK_STREAM).unwrap();
                connect(fd.as_raw_fd(), &addr).unwrap();
                send(fd.as_raw_fd(), b"ping", 0).unwrap();
                let mut buf = [0u8; 16];
                let n = recv(fd.as_raw_fd(), &mut buf, 0).unwrap();
                buf[..n].to_vec()
            })
            .unwrap();
        server.join();
        assert_eq!(client.join(), b"ping");
    }

    #[test]
    fn test_udp_sendto_recvfrom() {
        let rt = runtime();
        let g = rt.default_group();
        let any: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let a = socket_for(&any, libc::SOCK_DGRAM).unwrap();
        bind(a.as_raw_fd(), &any).unwrap();
        let a_addr = local_addr(a.as_raw_fd()).unwrap().unwrap();
        let b = socket_for(&any, libc::SOCK_DGRAM).unwrap();
        bind(b.as_raw_fd(), &any).unwrap();
        let b_addr = local_addr(b.as_raw_fd()).unwrap().unwrap();

        let receiver = g
            .spawn(move |_| {
                let mut buf = [0u8; 32];
                let (n, from) = recvfrom(a.as_raw_fd(), &mut buf, 0).unwrap();
                (buf[..n].to_vec(), from)
            })
            .unwrap();
        std::thread::sleep(Duration::from_millis(10));
        sendto(b.as_raw_fd(), b"dgram", 0, &a_addr).unwrap();
        assert_eq!(receiver.join(), (b"dgram".to_vec(), Some(b_addr)));
    }

    #[test]
    fn test_connect_refused() {
        let rt = runtime();
        let g = rt.default_group();
        // Reserve a port and close it again so nothing listens there.
        let addr = {
            let l = tcp_listen(&"127.0.0.1:0".parse().unwrap()).unwrap();
            local_addr(l.as_raw_fd()).unwrap().unwrap()
        };
        let h = g
            .spawn(move |_| {
                let fd = socket_for(&addr, libc::SOCK_STREAM).unwrap();
                connect(fd.as_raw_fd(), &addr)
            })
            .unwrap();
        assert_eq!(h.join(), Err(Errno::ECONNREFUSED));
    }

    #[test]
    fn test_try_read_would_block() {
        let (a, b) = socketpair(libc::SOCK_STREAM).unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(try_read(a.as_raw_fd(), &mut buf), Err(Errno::EAGAIN));
        assert_eq!(try_send(b.as_raw_fd(), b"hi", 0), Ok(2));
        assert_eq!(try_read(a.as_raw_fd(), &mut buf), Ok(2));
        assert_eq!(&buf[..2], b"hi");
        drop(b);
        assert_eq!(try_read(a.as_raw_fd(), &mut buf), Ok(0));
    }
}
