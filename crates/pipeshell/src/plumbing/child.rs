//! Descriptor shuffle performed in a freshly forked child
//!
//! Everything that allocates happens in `ChildPlumbing::prepare`, before
//! `fork`. `perform` only issues raw syscalls on preallocated memory.

use std::ffi::CString;
use std::os::fd::RawFd;
use std::os::unix::ffi::OsStrExt;

use nix::errno::Errno;
use nix::libc;

use super::redirect::Source;
use super::redirects::RedirectSet;
use crate::error::ShellError;

/// Upper bound on the descriptor sweep after the shuffle.
const MAX_FD_SWEEP: RawFd = 65536;

enum PlannedSource {
    Fd(RawFd),
    Path {
        path: CString,
        flags: libc::c_int,
        mode: libc::c_uint,
    },
}

struct Planned {
    target: RawFd,
    source: PlannedSource,
}

/// Precomputed plan for wiring a child's descriptor table.
pub struct ChildPlumbing {
    entries: Vec<Planned>,
    scratch: Vec<RawFd>,
    base: RawFd,
    exempt: Vec<RawFd>,
    sweep_limit: RawFd,
}

impl ChildPlumbing {
    /// Build the plan for a resolved set. Pending sources are rejected.
    pub fn prepare(set: &RedirectSet, exempt: Option<RawFd>) -> Result<Self, ShellError> {
        let mut entries = Vec::with_capacity(set.len());
        for redirect in set.iter() {
            let source = match redirect.source() {
                Source::Fd { fd, .. } => PlannedSource::Fd(*fd),
                Source::Path(path) => PlannedSource::Path {
                    path: CString::new(path.as_os_str().as_bytes()).map_err(|_| {
                        ShellError::invalid_path(format!("{} contains NUL", path.display()))
                    })?,
                    flags: (redirect.flags() | nix::fcntl::OFlag::O_CLOEXEC).bits(),
                    mode: libc::c_uint::from(redirect.mode().bits()),
                },
                other => {
                    return Err(ShellError::redirect_failed(format!(
                        "unresolved source {other} for {}",
                        redirect.target()
                    )))
                }
            };
            entries.push(Planned {
                target: redirect.target(),
                source,
            });
        }

        // SAFETY: sysconf has no side effects.
        let open_max = unsafe { libc::sysconf(libc::_SC_OPEN_MAX) };
        let sweep_limit = if open_max <= 0 {
            256
        } else {
            open_max.min(MAX_FD_SWEEP as libc::c_long) as RawFd
        };

        Ok(Self {
            scratch: vec![-1; entries.len()],
            base: set.find_free_fd(),
            entries,
            exempt: exempt.into_iter().collect(),
            sweep_limit,
        })
    }

    /// Lowest index the shuffle may use for scratch descriptors.
    pub fn base(&self) -> RawFd {
        self.base
    }

    /// Leave `fd` open through the sweep. It must not be a target index.
    pub fn keep_open(&mut self, fd: RawFd) {
        self.exempt.push(fd);
    }

    /// Wire the descriptor table of the calling process.
    ///
    /// 1. every source is opened or duplicated to a scratch index above all
    ///    targets, so overlapping mappings (swapping 1 and 2) cannot clobber
    ///    each other
    /// 2. every scratch descriptor is `dup2`ed onto its target
    /// 3. every descriptor that is not a target is closed
    ///
    /// # Safety
    ///
    /// Only call in a single-threaded child between `fork` and `exec`.
    /// The caller must `_exit` on error.
    pub unsafe fn perform(&mut self) -> Result<(), Errno> {
        for (i, entry) in self.entries.iter().enumerate() {
            let scratch = match &entry.source {
                PlannedSource::Fd(fd) => Errno::result(libc::fcntl(*fd, libc::F_DUPFD, self.base))?,
                PlannedSource::Path { path, flags, mode } => {
                    let opened = Errno::result(libc::open(path.as_ptr(), *flags, *mode))?;
                    let moved = Errno::result(libc::fcntl(opened, libc::F_DUPFD, self.base));
                    libc::close(opened);
                    moved?
                }
            };
            self.scratch[i] = scratch;
        }

        for (entry, scratch) in self.entries.iter().zip(&self.scratch) {
            Errno::result(libc::dup2(*scratch, entry.target))?;
        }

        for fd in 0..self.sweep_limit {
            if self.exempt.contains(&fd) || self.entries.iter().any(|e| e.target == fd) {
                continue;
            }
            libc::close(fd);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::redirect::Redirect;
    use super::*;

    #[test]
    fn test_prepare_rejects_pending() {
        let set = RedirectSet::new().with(Redirect::pipe(1));
        assert!(ChildPlumbing::prepare(&set, None).is_err());
    }

    #[test]
    fn test_prepare_base_above_everything() {
        let set = RedirectSet::new().with(Redirect::fd(1, 7)).with(Redirect::null(4));
        let plan = ChildPlumbing::prepare(&set, Some(3)).unwrap();
        assert_eq!(plan.base, 8);
        assert_eq!(plan.entries.len(), 4);
        assert!(plan.scratch.iter().all(|fd| *fd == -1));
    }

    #[test]
    fn test_perform_swaps_stdout_and_stderr_in_child() {
        use nix::sys::wait::waitpid;
        use nix::sys::wait::WaitStatus;
        use nix::unistd::fork;
        use nix::unistd::ForkResult;

        use crate::plumbing::fd;

        let (r_out, w_out) = fd::pipe_cloexec().unwrap();
        let (r_err, w_err) = fd::pipe_cloexec().unwrap();
        // stdout goes to the "err" pipe and stderr to the "out" pipe.
        let set = RedirectSet::empty()
            .with(Redirect::fd(1, w_err))
            .with(Redirect::fd(2, w_out));
        let mut plan = ChildPlumbing::prepare(&set, None).unwrap();

        match unsafe { fork() }.unwrap() {
            ForkResult::Child => unsafe {
                if plan.perform().is_err() {
                    libc::_exit(125);
                }
                libc::write(1, b"one".as_ptr().cast(), 3);
                libc::write(2, b"two".as_ptr().cast(), 3);
                libc::_exit(0);
            },
            ForkResult::Parent { child } => {
                fd::close_fd(w_out).unwrap();
                fd::close_fd(w_err).unwrap();
                assert_eq!(waitpid(child, None).unwrap(), WaitStatus::Exited(child, 0));

                let mut buf = [0u8; 8];
                let n = fd::read_fd(r_err, &mut buf).unwrap();
                assert_eq!(&buf[..n], b"one");
                let n = fd::read_fd(r_out, &mut buf).unwrap();
                assert_eq!(&buf[..n], b"two");
                fd::close_fd(r_out).unwrap();
                fd::close_fd(r_err).unwrap();
            }
        }
    }
}
