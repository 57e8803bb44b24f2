//! Child lifecycle and job-control signals
//!
//! SIGCHLD (and, with job control, SIGINT/SIGTSTP) is blocked in the
//! reactor's thread and read from a signalfd on Linux. Every wakeup reaps
//! all registered pids with `waitpid(WNOHANG)`, since several child
//! transitions can collapse into one signal. Only registered pids are
//! reaped; `waitpid(-1)` would steal children from unrelated code.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::os::fd::RawFd;
use std::rc::Rc;

use nix::errno::Errno;
use nix::sys::signal::SigSet;
use nix::sys::signal::Signal;
use nix::sys::wait::waitpid;
use nix::sys::wait::WaitPidFlag;
use nix::sys::wait::WaitStatus;
use nix::unistd::Pid;

use crate::error::ShellError;

/// Classification of a child status change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildEventKind {
    /// Exited normally; `status` is the exit code.
    Exited,
    /// Terminated by a signal.
    Killed,
    /// Terminated by a signal with a core dump.
    Dumped,
    /// Stopped by a signal.
    Stopped,
    /// Resumed by SIGCONT.
    Continued,
}

impl ChildEventKind {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Exited | Self::Killed | Self::Dumped)
    }
}

/// One normalized status change of a child process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildEvent {
    pub pid: Pid,
    pub kind: ChildEventKind,
    /// Exit code for `Exited`, otherwise the signal number.
    pub status: i32,
    /// Signal that caused the change, if any.
    pub signal: Option<Signal>,
}

impl ChildEvent {
    fn from_wait_status(status: WaitStatus) -> Option<Self> {
        let event = match status {
            WaitStatus::Exited(pid, code) => Self {
                pid,
                kind: ChildEventKind::Exited,
                status: code,
                signal: None,
            },
            WaitStatus::Signaled(pid, signal, dumped) => Self {
                pid,
                kind: if dumped {
                    ChildEventKind::Dumped
                } else {
                    ChildEventKind::Killed
                },
                status: signal as i32,
                signal: Some(signal),
            },
            WaitStatus::Stopped(pid, signal) => Self {
                pid,
                kind: ChildEventKind::Stopped,
                status: signal as i32,
                signal: Some(signal),
            },
            WaitStatus::Continued(pid) => Self {
                pid,
                kind: ChildEventKind::Continued,
                status: Signal::SIGCONT as i32,
                signal: Some(Signal::SIGCONT),
            },
            _ => return None,
        };
        Some(event)
    }

    /// True if the process is gone.
    pub fn is_terminal(&self) -> bool {
        self.kind.is_terminal()
    }
}

impl fmt::Display for ChildEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            ChildEventKind::Exited => write!(f, "exit_code={}", self.status),
            ChildEventKind::Killed => write!(f, "killed={}", signal_name(self.signal)),
            ChildEventKind::Dumped => write!(f, "dumped={}", signal_name(self.signal)),
            ChildEventKind::Stopped => write!(f, "stopped={}", signal_name(self.signal)),
            ChildEventKind::Continued => write!(f, "continued"),
        }
    }
}

fn signal_name(signal: Option<Signal>) -> &'static str {
    signal.map_or("?", |s| s.as_str())
}

type ChildHandler = Rc<dyn Fn(&ChildEvent)>;
type SignalHandler = Rc<dyn Fn(Signal)>;

/// Signal-number dispatch table plus per-pid child watchers.
pub struct SignalManager {
    mask: SigSet,
    #[cfg(any(target_os = "linux", target_os = "android"))]
    signal_fd: RefCell<nix::sys::signalfd::SignalFd>,
    handlers: RefCell<BTreeMap<u64, (Signal, SignalHandler)>>,
    next_id: RefCell<u64>,
    watchers: RefCell<BTreeMap<i32, ChildHandler>>,
}

impl SignalManager {
    /// Block the managed signals in this thread and open the channel.
    pub fn new(job_control: bool) -> Result<Self, ShellError> {
        let mut mask = SigSet::empty();
        mask.add(Signal::SIGCHLD);
        if job_control {
            mask.add(Signal::SIGINT);
            mask.add(Signal::SIGTSTP);
        }
        mask.thread_block()
            .map_err(|e| ShellError::reactor(format!("blocking signals: {e}")))?;

        #[cfg(any(target_os = "linux", target_os = "android"))]
        let signal_fd = {
            use nix::sys::signalfd::SfdFlags;
            use nix::sys::signalfd::SignalFd;
            SignalFd::with_flags(&mask, SfdFlags::SFD_NONBLOCK | SfdFlags::SFD_CLOEXEC)
                .map_err(|e| ShellError::reactor(format!("signalfd: {e}")))?
        };

        tracing::debug!(target: "pipeshell::signal", job_control, "signal channel open");
        Ok(Self {
            mask,
            #[cfg(any(target_os = "linux", target_os = "android"))]
            signal_fd: RefCell::new(signal_fd),
            handlers: RefCell::new(BTreeMap::new()),
            next_id: RefCell::new(1),
            watchers: RefCell::new(BTreeMap::new()),
        })
    }

    /// Descriptor to poll for pending signals, where the platform has one.
    pub fn fd(&self) -> Option<RawFd> {
        #[cfg(any(target_os = "linux", target_os = "android"))]
        {
            use std::os::fd::AsRawFd;
            Some(self.signal_fd.borrow().as_raw_fd())
        }
        #[cfg(not(any(target_os = "linux", target_os = "android")))]
        {
            None
        }
    }

    /// Signals this manager intercepts.
    pub fn mask(&self) -> &SigSet {
        &self.mask
    }

    /// Call `handler` whenever `signal` arrives. The signal must be part
    /// of the mask for delivery to happen.
    pub fn register(&self, signal: Signal, handler: Rc<dyn Fn(Signal)>) -> u64 {
        let mut next = self.next_id.borrow_mut();
        let id = *next;
        *next += 1;
        self.handlers.borrow_mut().insert(id, (signal, handler));
        id
    }

    pub fn deregister(&self, id: u64) {
        self.handlers.borrow_mut().remove(&id);
    }

    pub fn watch(&self, pid: Pid, handler: ChildHandler) {
        tracing::debug!(target: "pipeshell::signal", pid = pid.as_raw(), "watch");
        self.watchers.borrow_mut().insert(pid.as_raw(), handler);
    }

    pub fn unwatch(&self, pid: Pid) {
        self.watchers.borrow_mut().remove(&pid.as_raw());
    }

    pub fn has_watchers(&self) -> bool {
        !self.watchers.borrow().is_empty()
    }

    /// Read pending signals (if `readable`) and reap every watched pid.
    pub fn dispatch(&self, readable: bool) {
        if readable {
            for signal in self.read_pending() {
                if signal == Signal::SIGCHLD {
                    continue;
                }
                tracing::debug!(target: "pipeshell::signal", signal = signal.as_str(), "received");
                let handlers: Vec<SignalHandler> = self
                    .handlers
                    .borrow()
                    .values()
                    .filter(|(s, _)| *s == signal)
                    .map(|(_, h)| h.clone())
                    .collect();
                for handler in handlers {
                    handler(signal);
                }
            }
        }
        self.reap();
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    fn read_pending(&self) -> Vec<Signal> {
        let mut signals = Vec::new();
        let mut sfd = self.signal_fd.borrow_mut();
        loop {
            match sfd.read_signal() {
                Ok(Some(info)) => {
                    if let Ok(signal) = Signal::try_from(info.ssi_signo as i32) {
                        signals.push(signal);
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(target: "pipeshell::signal", error = %e, "signalfd read failed");
                    break;
                }
            }
        }
        signals
    }

    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    fn read_pending(&self) -> Vec<Signal> {
        Vec::new()
    }

    /// Drain all pending status changes of watched children.
    pub fn reap(&self) {
        let pids: Vec<i32> = self.watchers.borrow().keys().copied().collect();
        for raw in pids {
            let pid = Pid::from_raw(raw);
            loop {
                let flags = WaitPidFlag::WNOHANG | WaitPidFlag::WUNTRACED | WaitPidFlag::WCONTINUED;
                let event = match waitpid(pid, Some(flags)) {
                    Ok(WaitStatus::StillAlive) => break,
                    Ok(status) => match ChildEvent::from_wait_status(status) {
                        Some(event) => event,
                        None => continue,
                    },
                    Err(Errno::EINTR) => continue,
                    Err(e) => {
                        // Reaped elsewhere: report it so waiters do not hang.
                        tracing::warn!(target: "pipeshell::signal", pid = raw, error = %e, "lost child");
                        ChildEvent {
                            pid,
                            kind: ChildEventKind::Exited,
                            status: 255,
                            signal: None,
                        }
                    }
                };
                tracing::debug!(target: "pipeshell::signal", pid = raw, event = %event, "child event");
                let handler = if event.is_terminal() {
                    self.watchers.borrow_mut().remove(&raw)
                } else {
                    self.watchers.borrow().get(&raw).cloned()
                };
                if let Some(handler) = handler {
                    handler(&event);
                }
                if event.is_terminal() {
                    break;
                }
            }
        }
    }
}

impl Drop for SignalManager {
    fn drop(&mut self) {
        let _ = self.mask.thread_unblock();
    }
}
