//! Kernel netlink sockets

use std::mem;
use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};

use cothread_runtime::{fd_closed, fd_read_wait, fd_write_wait, io};
use nix::errno::Errno;
use tracing::{debug, info};

use super::socket::NlSocket;
use crate::config::NetConfig;
use crate::datagram::AsyncDatagram;
use crate::error::{Error, Result};

/// How to open a netlink socket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Parameters {
    /// Netlink protocol, e.g. `NETLINK_GENERIC`
    pub protocol: libc::c_int,
    /// SO_SNDBUF; 0 keeps the kernel default
    pub send_buffer: usize,
    /// SO_RCVBUF; 0 keeps the kernel default
    pub recv_buffer: usize,
    /// Multicast group to join; 0 for none
    pub group: u32,
}

impl Parameters {
    pub fn new(protocol: libc::c_int) -> Self {
        Self { protocol, send_buffer: 0, recv_buffer: 0, group: 0 }
    }

    /// Protocol with the buffer sizes from `config`
    pub fn from_config(protocol: libc::c_int, config: &NetConfig) -> Self {
        Self { send_buffer: config.send_buffer, recv_buffer: config.recv_buffer, ..Self::new(protocol) }
    }

    pub fn group(mut self, group: u32) -> Self {
        self.group = group;
        self
    }
}

fn setsockopt_int(fd: RawFd, level: libc::c_int, name: libc::c_int, value: libc::c_int) -> Result<()> {
    // SAFETY: value outlives the call and its size is passed along
    Errno::result(unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            &value as *const libc::c_int as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    })?;
    Ok(())
}

fn netlink_addr(pid: u32, groups: u32) -> libc::sockaddr_nl {
    // SAFETY: sockaddr_nl is plain old data; all-zero is a valid value
    let mut sa: libc::sockaddr_nl = unsafe { mem::zeroed() };
    sa.nl_family = libc::AF_NETLINK as libc::sa_family_t;
    sa.nl_pid = pid;
    sa.nl_groups = groups;
    sa
}

/// Non-blocking netlink socket connected to the kernel
#[derive(Debug)]
pub struct NetlinkDatagram {
    fd: OwnedFd,
}

impl NetlinkDatagram {
    /// Open, bind and connect; returns the socket with its kernel-assigned pid
    pub fn open(params: &Parameters) -> Result<(Self, u32)> {
        let fd = io::socket(libc::AF_NETLINK, libc::SOCK_RAW, params.protocol)?;
        let raw = fd.as_raw_fd();

        if params.send_buffer > 0 {
            setsockopt_int(raw, libc::SOL_SOCKET, libc::SO_SNDBUF, params.send_buffer as libc::c_int)?;
        }
        if params.recv_buffer > 0 {
            setsockopt_int(raw, libc::SOL_SOCKET, libc::SO_RCVBUF, params.recv_buffer as libc::c_int)?;
        }

        // Groups 1..=32 fit the bind-time bitmask; later ones need a setsockopt.
        let bitmask = match params.group {
            g @ 1..=32 => 1u32 << (g - 1),
            _ => 0,
        };
        let local = netlink_addr(0, bitmask);
        // SAFETY: local is a valid sockaddr_nl of the given size
        Errno::result(unsafe {
            libc::bind(
                raw,
                &local as *const libc::sockaddr_nl as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
            )
        })?;
        if params.group > 32 {
            setsockopt_int(raw, libc::SOL_NETLINK, libc::NETLINK_ADD_MEMBERSHIP, params.group as libc::c_int)?;
        }

        let kernel = netlink_addr(0, 0);
        // SAFETY: kernel is a valid sockaddr_nl of the given size
        Errno::result(unsafe {
            libc::connect(
                raw,
                &kernel as *const libc::sockaddr_nl as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
            )
        })?;

        let mut bound = netlink_addr(0, 0);
        let mut len = mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t;
        // SAFETY: bound and len are valid for writes
        Errno::result(unsafe {
            libc::getsockname(raw, &mut bound as *mut libc::sockaddr_nl as *mut libc::sockaddr, &mut len)
        })?;

        debug!(protocol = params.protocol, pid = bound.nl_pid, group = params.group, "netlink socket bound");
        Ok((Self { fd }, bound.nl_pid))
    }

    pub fn raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl AsyncDatagram for NetlinkDatagram {
    fn try_recv(&mut self) -> Result<Vec<u8>> {
        let fd = self.fd.as_raw_fd();
        // Peek with MSG_TRUNC for the real size, then take the datagram.
        let mut probe = [0u8; 1];
        let size = io::try_recv(fd, &mut probe, libc::MSG_PEEK | libc::MSG_TRUNC)?;
        let mut buf = vec![0u8; size.max(1)];
        let n = io::try_recv(fd, &mut buf, 0)?;
        buf.truncate(n);
        Ok(buf)
    }

    fn try_send(&mut self, datagram: &[u8]) -> Result<()> {
        let n = io::try_send(self.fd.as_raw_fd(), datagram, 0)?;
        if n != datagram.len() {
            return Err(Error::Os(Errno::EMSGSIZE));
        }
        Ok(())
    }

    fn recv_wait(&self) {
        fd_read_wait(self.fd.as_raw_fd());
    }

    fn send_wait(&self) {
        fd_write_wait(self.fd.as_raw_fd());
    }
}

impl Drop for NetlinkDatagram {
    fn drop(&mut self) {
        fd_closed(self.fd.as_raw_fd());
    }
}

impl NlSocket<NetlinkDatagram> {
    /// Kernel netlink socket for `params.protocol`
    ///
    /// ```rust,ignore
    /// let sock = NlSocket::bind(Parameters::new(libc::NETLINK_GENERIC))?;
    /// let family = GenlFamily::resolve(&sock, "nlctrl")?;
    /// ```
    pub fn bind(params: Parameters) -> Result<Self> {
        let (datagram, pid) = NetlinkDatagram::open(&params)?;
        let sock = NlSocket::new(datagram, pid);
        info!(sock = %sock, protocol = params.protocol, "netlink socket ready");
        Ok(sock)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netlink::genl::{GenlFamily, GENL_ID_CTRL};

    fn generic() -> Option<NlSocket<NetlinkDatagram>> {
        // Sandboxes without netlink skip these tests.
        NlSocket::bind(Parameters::new(libc::NETLINK_GENERIC)).ok()
    }

    #[test]
    fn test_parameters() {
        let config = NetConfig { send_buffer: 4096, recv_buffer: 8192, ..NetConfig::default() };
        let p = Parameters::from_config(libc::NETLINK_GENERIC, &config).group(40);
        assert_eq!((p.send_buffer, p.recv_buffer, p.group), (4096, 8192, 40));
    }

    #[test]
    fn test_bind_assigns_pid() {
        let Some(sock) = generic() else { return };
        assert_ne!(sock.pid(), 0);
        assert!(sock.to_string().starts_with("netlink:"));
    }

    #[test]
    fn test_resolve_controller_family() {
        let Some(sock) = generic() else { return };
        let family = GenlFamily::resolve(&sock, "nlctrl").unwrap();
        assert_eq!(family.id(), GENL_ID_CTRL);
    }
}
