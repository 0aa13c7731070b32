//! File operations run under the native-migration bridge
//!
//! Regular files never report EAGAIN, and path lookups can block on disk
//! or network file systems, so every call here migrates out of the
//! caller's group for its duration. EINTR is retried.

use std::ffi::CString;
use std::mem::MaybeUninit;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::{FromRawFd, OwnedFd, RawFd};
use std::path::Path;

use nix::errno::Errno;

use super::run_native;

fn retry<T>(mut f: impl FnMut() -> Result<T, Errno>) -> Result<T, Errno> {
    loop {
        match f() {
            Err(Errno::EINTR) => continue,
            r => return r,
        }
    }
}

fn c_path(path: &Path) -> Result<CString, Errno> {
    CString::new(path.as_os_str().as_bytes()).map_err(|_| Errno::EINVAL)
}

/// open(2); `O_CLOEXEC` is always added
pub fn open(path: &Path, flags: libc::c_int, mode: libc::mode_t) -> Result<OwnedFd, Errno> {
    let path = c_path(path)?;
    run_native(|| {
        retry(|| {
            // SAFETY: path is a valid nul-terminated string
            Errno::result(unsafe {
                libc::open(path.as_ptr(), flags | libc::O_CLOEXEC, libc::c_uint::from(mode))
            })
        })
    })
    // SAFETY: open returned a fresh descriptor we now own
    .map(|fd| unsafe { OwnedFd::from_raw_fd(fd) })
}

pub fn read(fd: RawFd, buf: &mut [u8]) -> Result<usize, Errno> {
    run_native(|| {
        retry(|| {
            // SAFETY: buf is valid for writes of its length
            Errno::result(unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) })
        })
    })
    .map(|n| n as usize)
}

pub fn pread(fd: RawFd, buf: &mut [u8], offset: i64) -> Result<usize, Errno> {
    run_native(|| {
        retry(|| {
            // SAFETY: buf is valid for writes of its length
            Errno::result(unsafe {
                libc::pread(fd, buf.as_mut_ptr().cast(), buf.len(), offset as libc::off_t)
            })
        })
    })
    .map(|n| n as usize)
}

pub fn write(fd: RawFd, buf: &[u8]) -> Result<usize, Errno> {
    run_native(|| {
        retry(|| {
            // SAFETY: buf is valid for reads of its length
            Errno::result(unsafe { libc::write(fd, buf.as_ptr().cast(), buf.len()) })
        })
    })
    .map(|n| n as usize)
}

pub fn pwrite(fd: RawFd, buf: &[u8], offset: i64) -> Result<usize, Errno> {
    run_native(|| {
        retry(|| {
            // SAFETY: buf is valid for reads of its length
            Errno::result(unsafe {
                libc::pwrite(fd, buf.as_ptr().cast(), buf.len(), offset as libc::off_t)
            })
        })
    })
    .map(|n| n as usize)
}

pub fn ftruncate(fd: RawFd, len: i64) -> Result<(), Errno> {
    run_native(|| {
        // SAFETY: plain syscall on a caller-supplied descriptor
        retry(|| Errno::result(unsafe { libc::ftruncate(fd, len as libc::off_t) }))
    })
    .map(drop)
}

pub fn fchmod(fd: RawFd, mode: libc::mode_t) -> Result<(), Errno> {
    run_native(|| {
        // SAFETY: plain syscall on a caller-supplied descriptor
        retry(|| Errno::result(unsafe { libc::fchmod(fd, mode) }))
    })
    .map(drop)
}

/// fchown(2); `None` leaves that id unchanged
pub fn fchown(fd: RawFd, uid: Option<libc::uid_t>, gid: Option<libc::gid_t>) -> Result<(), Errno> {
    let uid = uid.unwrap_or(libc::uid_t::MAX);
    let gid = gid.unwrap_or(libc::gid_t::MAX);
    run_native(|| {
        // SAFETY: plain syscall on a caller-supplied descriptor
        retry(|| Errno::result(unsafe { libc::fchown(fd, uid, gid) }))
    })
    .map(drop)
}

pub fn fsync(fd: RawFd) -> Result<(), Errno> {
    run_native(|| {
        // SAFETY: plain syscall on a caller-supplied descriptor
        retry(|| Errno::result(unsafe { libc::fsync(fd) }))
    })
    .map(drop)
}

pub fn fdatasync(fd: RawFd) -> Result<(), Errno> {
    run_native(|| {
        retry(|| {
            // SAFETY: plain syscall on a caller-supplied descriptor
            #[cfg(any(target_os = "linux", target_os = "android"))]
            let ret = unsafe { libc::fdatasync(fd) };
            // SAFETY: as above; fsync is the closest equivalent here
            #[cfg(not(any(target_os = "linux", target_os = "android")))]
            let ret = unsafe { libc::fsync(fd) };
            Errno::result(ret)
        })
    })
    .map(drop)
}

pub fn stat(path: &Path) -> Result<libc::stat, Errno> {
    let path = c_path(path)?;
    run_native(|| {
        retry(|| {
            let mut st = MaybeUninit::<libc::stat>::uninit();
            // SAFETY: path is nul-terminated; st is written on success
            Errno::result(unsafe { libc::stat(path.as_ptr(), st.as_mut_ptr()) })?;
            // SAFETY: stat succeeded and initialized st
            Ok(unsafe { st.assume_init() })
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::runtime::Runtime;
    use std::os::unix::io::AsRawFd;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn scratch_path(tag: &str) -> PathBuf {
        static SEQ: AtomicUsize = AtomicUsize::new(0);
        std::env::temp_dir().join(format!(
            "cothread-{}-{}-{}",
            std::process::id(),
            tag,
            SEQ.fetch_add(1, Ordering::Relaxed)
        ))
    }

    #[test]
    fn test_write_read_truncate() {
        let path = scratch_path("rw");
        let fd = open(&path, libc::O_RDWR | libc::O_CREAT | libc::O_TRUNC, 0o600).unwrap();
        let raw = fd.as_raw_fd();
        assert_eq!(write(raw, b"hello world").unwrap(), 11);
        assert_eq!(pwrite(raw, b"W", 6).unwrap(), 1);
        fsync(raw).unwrap();
        fdatasync(raw).unwrap();

        let mut buf = [0u8; 5];
        assert_eq!(pread(raw, &mut buf, 6).unwrap(), 5);
        assert_eq!(&buf, b"World");

        ftruncate(raw, 5).unwrap();
        fchmod(raw, 0o640).unwrap();
        fchown(raw, None, None).unwrap();
        let st = stat(&path).unwrap();
        assert_eq!(st.st_size, 5);
        assert_eq!(st.st_mode & 0o777, 0o640);
        drop(fd);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_missing_file() {
        let path = scratch_path("missing");
        assert_eq!(open(&path, libc::O_RDONLY, 0).err(), Some(Errno::ENOENT));
        assert_eq!(stat(&path).err(), Some(Errno::ENOENT));
    }

    #[test]
    fn test_file_ops_from_cooperative_thread() {
        let rt = Runtime::new(RuntimeConfig::new().max_poll_wait(Duration::from_millis(50))).unwrap();
        let g = rt.default_group();
        let path = scratch_path("coop");
        let p = path.clone();
        let h = g
            .spawn(move |_| {
                let fd = open(&p, libc::O_RDWR | libc::O_CREAT, 0o600).unwrap();
                write(fd.as_raw_fd(), b"abc").unwrap();
                let mut buf = [0u8; 3];
                pread(fd.as_raw_fd(), &mut buf, 0).unwrap();
                (buf, crate::tls::current().group().is_some())
            })
            .unwrap();
        assert_eq!(h.join(), (*b"abc", true));
        assert_eq!(g.member_count(), 0);
        std::fs::remove_file(&path).unwrap();
    }
}
