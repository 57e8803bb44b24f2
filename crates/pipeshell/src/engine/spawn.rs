//! Fork/exec of one external command
//!
//! `SpawnPlan::new` builds every C string and pointer array the child
//! needs. After `fork` the child only runs raw syscalls:
//! 1. descriptor shuffle (`ChildPlumbing::perform`), exit 125 on failure
//! 2. `chdir` into the working directory
//! 3. signal mask cleared, SIGPIPE/SIGINT/SIGTSTP back to default
//! 4. `execve`; on failure a message goes to fd 2 and the child exits 127
//!
//! Every failure before the program runs is also written as a
//! `StartFailure` record to a close-on-exec pipe. The parent reads that
//! pipe to end of file right after the fork: a successful exec closes it
//! with nothing written.

use std::collections::BTreeMap;
use std::ffi::CString;
use std::os::fd::RawFd;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use nix::errno::Errno;
use nix::libc;
use nix::unistd::fork;
use nix::unistd::ForkResult;
use nix::unistd::Pid;

use crate::error::ShellError;
use crate::error::EXIT_EXEC_FAILED;
use crate::error::EXIT_REDIRECT_FAILED;
use crate::plumbing::fd;
use crate::plumbing::ChildPlumbing;
use crate::plumbing::RedirectSet;

use super::running::StartFailure;

fn c_string(text: &[u8], what: &str) -> Result<CString, ShellError> {
    CString::new(text).map_err(|_| ShellError::spawn_failed(format!("{what} contains NUL")))
}

/// A forked child and, if it never reached `execve`, why.
#[derive(Debug)]
pub(crate) struct Spawned {
    pub(crate) pid: Pid,
    pub(crate) failure: Option<StartFailure>,
}

/// Everything a forked child needs, allocated up front.
pub(crate) struct SpawnPlan {
    program: CString,
    argv: Vec<CString>,
    envp: Vec<CString>,
    cwd: CString,
    plumbing: ChildPlumbing,
    exec_failed: Vec<u8>,
    chdir_failed: Vec<u8>,
}

impl SpawnPlan {
    /// `argv[0]` is the first entry of `argv`; `program` is what gets
    /// executed.
    pub(crate) fn new(
        program: &Path,
        argv: &[String],
        exports: &BTreeMap<String, String>,
        cwd: &Path,
        redirects: &RedirectSet,
        debug_fd: Option<RawFd>,
    ) -> Result<Self, ShellError> {
        let argv = argv
            .iter()
            .map(|arg| c_string(arg.as_bytes(), "argument"))
            .collect::<Result<Vec<_>, _>>()?;
        let envp = exports
            .iter()
            .map(|(name, value)| c_string(format!("{name}={value}").as_bytes(), "environment"))
            .collect::<Result<Vec<_>, _>>()?;
        let shown = argv
            .first()
            .map(|a| a.to_string_lossy().into_owned())
            .unwrap_or_default();

        Ok(Self {
            program: c_string(program.as_os_str().as_bytes(), "program path")?,
            argv,
            envp,
            cwd: c_string(cwd.as_os_str().as_bytes(), "working directory")?,
            plumbing: ChildPlumbing::prepare(redirects, debug_fd)?,
            exec_failed: format!("pipeshell: {shown}: exec failed\n").into_bytes(),
            chdir_failed: format!("pipeshell: {}: cannot enter directory\n", cwd.display())
                .into_bytes(),
        })
    }

    /// Fork and exec. Returns once the child has either exec'd or
    /// reported why it could not.
    pub(crate) fn spawn(mut self) -> Result<Spawned, ShellError> {
        let argv: Vec<*const libc::c_char> = self
            .argv
            .iter()
            .map(|a| a.as_ptr())
            .chain(std::iter::once(std::ptr::null()))
            .collect();
        let envp: Vec<*const libc::c_char> = self
            .envp
            .iter()
            .map(|e| e.as_ptr())
            .chain(std::iter::once(std::ptr::null()))
            .collect();

        let (status_r, status_w) = self.status_pipe()?;
        self.plumbing.keep_open(status_w);

        // SAFETY: the child branch only performs async-signal-safe syscalls
        // on memory allocated before the fork, then execs or exits.
        match unsafe { fork() } {
            Ok(ForkResult::Parent { child }) => {
                let _ = fd::close_fd(status_w);
                let failure = read_start_failure(status_r);
                let _ = fd::close_fd(status_r);
                if let Some(failure) = failure {
                    tracing::debug!(target: "pipeshell::cmd", pid = child.as_raw(), "{failure}");
                }
                Ok(Spawned { pid: child, failure })
            }
            Ok(ForkResult::Child) => unsafe {
                if let Err(errno) = self.plumbing.perform() {
                    fail(status_w, StartFailure::Redirect(errno), EXIT_REDIRECT_FAILED);
                }
                if libc::chdir(self.cwd.as_ptr()) != 0 {
                    let errno = Errno::last();
                    report(&self.chdir_failed);
                    fail(status_w, StartFailure::Chdir(errno), EXIT_EXEC_FAILED);
                }
                reset_signals();
                libc::execve(self.program.as_ptr(), argv.as_ptr(), envp.as_ptr());
                let errno = Errno::last();
                report(&self.exec_failed);
                fail(status_w, StartFailure::Exec(errno), EXIT_EXEC_FAILED)
            },
            Err(e) => {
                let _ = fd::close_fd(status_r);
                let _ = fd::close_fd(status_w);
                Err(ShellError::spawn_failed(format!("fork: {e}")))
            }
        }
    }

    /// Close-on-exec pipe whose write end sits above every descriptor
    /// the child shuffle touches.
    fn status_pipe(&self) -> Result<(RawFd, RawFd), ShellError> {
        let (r, w) = fd::pipe_cloexec().map_err(|e| ShellError::pipe_failed(e.desc()))?;
        let moved = fd::dup_cloexec_from(w, self.plumbing.base());
        let _ = fd::close_fd(w);
        match moved {
            Ok(w) => Ok((r, w)),
            Err(e) => {
                let _ = fd::close_fd(r);
                Err(ShellError::pipe_failed(e.desc()))
            }
        }
    }
}

/// Blocks until the child execs (end of file) or writes its record.
fn read_start_failure(status_r: RawFd) -> Option<StartFailure> {
    let mut buf = [0u8; StartFailure::ENCODED_LEN];
    let mut filled = 0;
    while filled < buf.len() {
        match fd::read_fd(status_r, &mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) => {
                tracing::warn!(target: "pipeshell::cmd", error = %e, "reading child start status");
                return None;
            }
        }
    }
    if filled == buf.len() {
        StartFailure::decode(&buf)
    } else {
        None
    }
}

unsafe fn fail(status_w: RawFd, failure: StartFailure, code: i32) -> ! {
    let record = failure.encode();
    libc::write(status_w, record.as_ptr().cast(), record.len());
    libc::_exit(code)
}

unsafe fn report(message: &[u8]) {
    libc::write(2, message.as_ptr().cast(), message.len());
}

/// Undo what the reactor's thread changed: blocked signals are inherited
/// across exec, and an ignored SIGPIPE would make writers spin.
unsafe fn reset_signals() {
    let mut set: libc::sigset_t = std::mem::zeroed();
    libc::sigemptyset(&mut set);
    libc::pthread_sigmask(libc::SIG_SETMASK, &set, std::ptr::null_mut());
    for signal in [libc::SIGPIPE, libc::SIGINT, libc::SIGTSTP, libc::SIGCHLD] {
        libc::signal(signal, libc::SIG_DFL);
    }
}
