//! Raw descriptor helpers
//!
//! Thin wrappers over the handful of syscalls the plumbing layer needs.
//! Everything here works on `RawFd` because ownership of pipeline
//! descriptors is tracked explicitly by `RedirectSet` and the IO handlers,
//! not by drop glue.

use std::ffi::CString;
use std::os::fd::IntoRawFd;
use std::os::fd::RawFd;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::libc;
use nix::sys::stat::Mode;

/// Largest write that the kernel performs atomically on a pipe.
pub const PIPE_BUF: usize = 4096;

/// Create a pipe with both ends close-on-exec. Returns `(read, write)`.
#[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
pub fn pipe_cloexec() -> nix::Result<(RawFd, RawFd)> {
    let (r, w) = nix::unistd::pipe2(OFlag::O_CLOEXEC)?;
    let (r, w) = (r.into_raw_fd(), w.into_raw_fd());
    tracing::debug!(target: "pipeshell::fd", read = r, write = w, "pipe");
    Ok((r, w))
}

/// Create a pipe with both ends close-on-exec. Returns `(read, write)`.
///
/// The flag is set right after creation: a fork from another thread in
/// between inherits both ends.
#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
pub fn pipe_cloexec() -> nix::Result<(RawFd, RawFd)> {
    let (r, w) = nix::unistd::pipe()?;
    let (r, w) = (r.into_raw_fd(), w.into_raw_fd());
    for fd in [r, w] {
        if let Err(e) = set_cloexec(fd) {
            let _ = close_fd(r);
            let _ = close_fd(w);
            return Err(e);
        }
    }
    tracing::debug!(target: "pipeshell::fd", read = r, write = w, "pipe");
    Ok((r, w))
}

pub fn set_cloexec(fd: RawFd) -> nix::Result<()> {
    // SAFETY: F_SETFD only touches the descriptor flags of `fd`.
    Errno::result(unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) }).map(drop)
}

/// Switch `fd` to non-blocking mode.
pub fn set_nonblocking(fd: RawFd) -> nix::Result<()> {
    // SAFETY: F_GETFL/F_SETFL only touch the status flags of `fd`.
    let flags = Errno::result(unsafe { libc::fcntl(fd, libc::F_GETFL) })?;
    Errno::result(unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) }).map(drop)
}

/// Duplicate `fd` onto the lowest free descriptor, close-on-exec.
pub fn dup_cloexec(fd: RawFd) -> nix::Result<RawFd> {
    dup_cloexec_from(fd, 0)
}

/// Duplicate `fd` onto the lowest free descriptor not below `lowest`.
pub fn dup_cloexec_from(fd: RawFd, lowest: RawFd) -> nix::Result<RawFd> {
    // SAFETY: F_DUPFD_CLOEXEC creates a new descriptor and has no other effect.
    let new = Errno::result(unsafe { libc::fcntl(fd, libc::F_DUPFD_CLOEXEC, lowest) })?;
    tracing::debug!(target: "pipeshell::fd", from = fd, to = new, "dup");
    Ok(new)
}

/// Open a filesystem path close-on-exec.
pub fn open_path(path: &Path, flags: OFlag, mode: Mode) -> nix::Result<RawFd> {
    let c_path = CString::new(path.as_os_str().as_bytes()).map_err(|_| Errno::EINVAL)?;
    let flags = (flags | OFlag::O_CLOEXEC).bits();
    // SAFETY: `c_path` is a valid NUL-terminated string for the duration of the call.
    let fd = Errno::result(unsafe {
        libc::open(c_path.as_ptr(), flags, libc::c_uint::from(mode.bits()))
    })?;
    tracing::debug!(target: "pipeshell::fd", fd, path = %path.display(), "open");
    Ok(fd)
}

/// Close a descriptor owned by the caller.
pub fn close_fd(fd: RawFd) -> nix::Result<()> {
    tracing::debug!(target: "pipeshell::fd", fd, "close");
    // SAFETY: the caller owns `fd` and does not use it afterwards.
    Errno::result(unsafe { libc::close(fd) }).map(drop)
}

/// Single `read(2)`, retried on EINTR. `Ok(0)` means end of file.
pub fn read_fd(fd: RawFd, buf: &mut [u8]) -> nix::Result<usize> {
    loop {
        // SAFETY: `buf` is valid for writes of `buf.len()` bytes.
        let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
        match Errno::result(n) {
            Err(Errno::EINTR) => continue,
            res => return res.map(|n| n as usize),
        }
    }
}

/// Single `write(2)`, retried on EINTR.
pub fn write_fd(fd: RawFd, buf: &[u8]) -> nix::Result<usize> {
    loop {
        // SAFETY: `buf` is valid for reads of `buf.len()` bytes.
        let n = unsafe { libc::write(fd, buf.as_ptr().cast(), buf.len()) };
        match Errno::result(n) {
            Err(Errno::EINTR) => continue,
            res => return res.map(|n| n as usize),
        }
    }
}

/// True if `fd` refers to an open descriptor of this process.
pub fn is_open(fd: RawFd) -> bool {
    // SAFETY: F_GETFD has no side effects.
    unsafe { libc::fcntl(fd, libc::F_GETFD) != -1 }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipe_roundtrip() {
        let (r, w) = pipe_cloexec().unwrap();
        assert_eq!(write_fd(w, b"hello").unwrap(), 5);
        close_fd(w).unwrap();

        let mut buf = [0u8; 16];
        let n = read_fd(r, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello");
        assert_eq!(read_fd(r, &mut buf).unwrap(), 0);
        close_fd(r).unwrap();
    }

    #[test]
    fn test_pipe_is_cloexec() {
        let (r, w) = pipe_cloexec().unwrap();
        let flags = unsafe { libc::fcntl(r, libc::F_GETFD) };
        assert!(flags & libc::FD_CLOEXEC != 0);
        close_fd(r).unwrap();
        close_fd(w).unwrap();
    }

    #[test]
    fn test_dup_is_independent() {
        let (r, w) = pipe_cloexec().unwrap();
        let w2 = dup_cloexec(w).unwrap();
        assert_ne!(w, w2);
        close_fd(w).unwrap();
        assert_eq!(write_fd(w2, b"x").unwrap(), 1);
        close_fd(w2).unwrap();
        close_fd(r).unwrap();
    }

    #[test]
    fn test_nonblocking_read_would_block() {
        let (r, w) = pipe_cloexec().unwrap();
        set_nonblocking(r).unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(read_fd(r, &mut buf), Err(Errno::EAGAIN));
        close_fd(r).unwrap();
        close_fd(w).unwrap();
    }

    #[test]
    fn test_open_missing_path() {
        let res = open_path(
            Path::new("/nonexistent/pipeshell/file"),
            OFlag::O_RDONLY,
            Mode::empty(),
        );
        assert_eq!(res, Err(Errno::ENOENT));
    }
}
