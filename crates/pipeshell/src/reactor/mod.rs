//! Single-threaded event loop
//!
//! The reactor multiplexes descriptor readiness with `poll(2)` and child
//! lifecycle notifications from the `SignalManager`. It provides:
//! - `IoHandler` - descriptor + interest + callback, several per descriptor
//! - `handle_io` - one wait-and-dispatch round, refusing re-entry
//! - `block_on` - drive a future to completion on this loop
//! - `LineInput`/`ByteInput` and `OutputHandler` - async stream adapters
//!
//! A `Reactor` is `!Send`: each thread that runs pipelines owns its own,
//! usually through a `Shell`.

pub mod input;
pub mod output;
pub mod signals;

use std::cell::Cell;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::future::Future;
use std::os::fd::RawFd;
use std::rc::Rc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::task::Context;
use std::task::Poll;
use std::time::Duration;

use futures::task::ArcWake;
use nix::errno::Errno;
use nix::libc;
use nix::poll::PollFlags;
use nix::unistd::Pid;

pub use input::ByteInput;
pub use input::LineInput;
pub use output::OutputHandler;
pub use output::OutputMode;
pub use signals::ChildEvent;
pub use signals::ChildEventKind;
pub use signals::SignalManager;

use crate::config::EngineConfig;
use crate::error::ShellError;
use crate::plumbing::fd;

/// Errors raised by the event loop itself.
#[derive(Debug, thiserror::Error)]
pub enum ReactorError {
    /// `handle_io` was called from inside a handler callback.
    #[error("event loop re-entered during dispatch")]
    Reentrant,
    /// Nothing is registered that could ever make progress.
    #[error("nothing left to wait for")]
    Idle,
    #[error("poll failed: {0}")]
    Poll(Errno),
}

/// Registration key of an `IoHandler`.
pub type HandlerId = u64;

/// Readiness callback attached to one descriptor.
pub trait IoHandler {
    fn fd(&self) -> RawFd;

    /// Events the handler currently wants. Empty means "not now".
    fn interest(&self) -> PollFlags;

    /// Called with the ready events of `fd()`. Errors must be recorded by
    /// the handler; nothing may unwind into the loop.
    fn handle_event(&self, reactor: &Reactor, events: PollFlags);
}

// ============================================================================
// Wakeup plumbing
// ============================================================================

/// Self-pipe used to interrupt `poll` when a waker fires.
pub(crate) struct Notifier {
    read: RawFd,
    write: RawFd,
}

impl Notifier {
    fn new() -> Result<Self, ShellError> {
        let (read, write) = fd::pipe_cloexec().map_err(|e| ShellError::pipe_failed(e.desc()))?;
        let notifier = Self { read, write };
        fd::set_nonblocking(read)?;
        fd::set_nonblocking(write)?;
        Ok(notifier)
    }

    pub(crate) fn notify(&self) {
        // A full pipe already guarantees a wakeup.
        let _ = fd::write_fd(self.write, b"\0");
    }

    fn drain(&self) {
        let mut buf = [0u8; 64];
        while let Ok(n) = fd::read_fd(self.read, &mut buf) {
            if n < buf.len() {
                break;
            }
        }
    }
}

impl Drop for Notifier {
    fn drop(&mut self) {
        let _ = fd::close_fd(self.read);
        let _ = fd::close_fd(self.write);
    }
}

/// Waker that raises a flag and interrupts the loop.
pub(crate) struct FlagWake {
    flag: AtomicBool,
    notifier: Arc<Notifier>,
}

impl FlagWake {
    pub(crate) fn new(notifier: Arc<Notifier>, raised: bool) -> Arc<Self> {
        Arc::new(Self {
            flag: AtomicBool::new(raised),
            notifier,
        })
    }

    /// Lower the flag, returning whether it was raised.
    pub(crate) fn take(&self) -> bool {
        self.flag.swap(false, Ordering::AcqRel)
    }

    pub(crate) fn is_raised(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    pub(crate) fn raise(&self) {
        self.flag.store(true, Ordering::Release);
    }
}

impl ArcWake for FlagWake {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        arc_self.raise();
        arc_self.notifier.notify();
    }
}

// ============================================================================
// Reactor
// ============================================================================

struct ReactorInner {
    handlers: RefCell<BTreeMap<HandlerId, Rc<dyn IoHandler>>>,
    next_id: Cell<HandlerId>,
    dispatching: Cell<bool>,
    notifier: Arc<Notifier>,
    signals: SignalManager,
    reap_interval: Duration,
    read_chunk: usize,
}

/// Handle to the event loop of the current thread. Cheap to clone.
#[derive(Clone)]
pub struct Reactor {
    inner: Rc<ReactorInner>,
}

struct DispatchGuard<'a>(&'a Cell<bool>);

impl Drop for DispatchGuard<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

impl Reactor {
    pub fn new(config: &EngineConfig, job_control: bool) -> Result<Self, ShellError> {
        Ok(Self {
            inner: Rc::new(ReactorInner {
                handlers: RefCell::new(BTreeMap::new()),
                next_id: Cell::new(1),
                dispatching: Cell::new(false),
                notifier: Arc::new(Notifier::new()?),
                signals: SignalManager::new(job_control)?,
                reap_interval: Duration::from_millis(config.reap_interval_ms.max(1)),
                read_chunk: config.read_chunk.max(1),
            }),
        })
    }

    /// Bytes requested per readiness read.
    pub fn read_chunk(&self) -> usize {
        self.inner.read_chunk
    }

    pub fn signals(&self) -> &SignalManager {
        &self.inner.signals
    }

    pub(crate) fn notifier(&self) -> Arc<Notifier> {
        self.inner.notifier.clone()
    }

    /// Attach a handler. Several handlers may share one descriptor; all of
    /// them see its events, in registration order.
    pub fn register(&self, handler: Rc<dyn IoHandler>) -> HandlerId {
        let id = self.inner.next_id.get();
        self.inner.next_id.set(id + 1);
        tracing::debug!(target: "pipeshell::ioreg", id, fd = handler.fd(), "register");
        self.inner.handlers.borrow_mut().insert(id, handler);
        id
    }

    /// Detach a handler. Returns false if it was not registered.
    pub fn deregister(&self, id: HandlerId) -> bool {
        let removed = self.inner.handlers.borrow_mut().remove(&id).is_some();
        if removed {
            tracing::debug!(target: "pipeshell::ioreg", id, "deregister");
        }
        removed
    }

    pub fn is_registered(&self, id: HandlerId) -> bool {
        self.inner.handlers.borrow().contains_key(&id)
    }

    pub fn handler_count(&self) -> usize {
        self.inner.handlers.borrow().len()
    }

    /// Deliver lifecycle events of `pid` to `handler` until it terminates.
    pub fn watch_child(&self, pid: Pid, handler: Rc<dyn Fn(&ChildEvent)>) {
        self.inner.signals.watch(pid, handler);
    }

    pub fn unwatch_child(&self, pid: Pid) {
        self.inner.signals.unwatch(pid);
    }

    /// Wait for readiness (at most `timeout`) and dispatch one round.
    ///
    /// Returns the number of handler callbacks run. While child watchers
    /// exist the wait is capped at the reap interval, since SIGCHLD may be
    /// delivered to a thread that does not block it.
    pub fn handle_io(&self, timeout: Option<Duration>) -> Result<usize, ReactorError> {
        if self.inner.dispatching.get() {
            return Err(ReactorError::Reentrant);
        }
        self.inner.dispatching.set(true);
        let _guard = DispatchGuard(&self.inner.dispatching);

        let snapshot: Vec<(HandlerId, Rc<dyn IoHandler>)> = self
            .inner
            .handlers
            .borrow()
            .iter()
            .map(|(id, h)| (*id, h.clone()))
            .collect();

        let mut interest: BTreeMap<RawFd, PollFlags> = BTreeMap::new();
        for (_, handler) in &snapshot {
            let events = handler.interest();
            if !events.is_empty() {
                *interest.entry(handler.fd()).or_insert(PollFlags::empty()) |= events;
            }
        }

        let watching = self.inner.signals.has_watchers();
        let idle = interest.is_empty() && !watching;

        let mut pollfds = Vec::with_capacity(interest.len() + 2);
        pollfds.push(pollfd(self.inner.notifier.read, PollFlags::POLLIN));
        let signal_fd = self.inner.signals.fd();
        if let Some(sfd) = signal_fd {
            pollfds.push(pollfd(sfd, PollFlags::POLLIN));
        }
        let fixed = pollfds.len();
        for (fd, events) in &interest {
            pollfds.push(pollfd(*fd, *events));
        }

        let mut wait = timeout;
        if watching {
            wait = Some(wait.map_or(self.inner.reap_interval, |t| t.min(self.inner.reap_interval)));
        }
        if idle {
            wait = Some(Duration::ZERO);
        }
        let timeout_ms = wait.map_or(-1, |d| d.as_millis().min(i32::MAX as u128) as libc::c_int);

        // SAFETY: `pollfds` is a valid array of `pollfds.len()` entries.
        let ready = unsafe {
            libc::poll(
                pollfds.as_mut_ptr(),
                pollfds.len() as libc::nfds_t,
                timeout_ms,
            )
        };
        let ready = match Errno::result(ready) {
            Ok(n) => n,
            Err(Errno::EINTR) => 0,
            Err(e) => return Err(ReactorError::Poll(e)),
        };
        if idle && ready == 0 {
            return Err(ReactorError::Idle);
        }

        if pollfds[0].revents != 0 {
            self.inner.notifier.drain();
        }

        let mut dispatched = 0;
        for pfd in &pollfds[fixed..] {
            if pfd.revents == 0 {
                continue;
            }
            let events = PollFlags::from_bits_truncate(pfd.revents);
            for (id, handler) in &snapshot {
                // Earlier callbacks may have removed later handlers.
                if handler.fd() != pfd.fd || !self.is_registered(*id) {
                    continue;
                }
                tracing::trace!(target: "pipeshell::io", id, fd = pfd.fd, ?events, "dispatch");
                handler.handle_event(self, events);
                dispatched += 1;
            }
        }

        self.inner.signals.dispatch(signal_fd.is_some() && pollfds[1].revents != 0);
        Ok(dispatched)
    }

    /// Run the loop until `future` completes.
    ///
    /// Fails with `Idle` if the future is pending while nothing registered
    /// could ever wake it, and with `Reentrant` when called from a handler.
    pub fn block_on<F: Future>(&self, future: F) -> Result<F::Output, ReactorError> {
        let mut future = std::pin::pin!(future);
        let task = FlagWake::new(self.notifier(), true);
        let waker = futures::task::waker(task.clone());
        let mut cx = Context::from_waker(&waker);
        loop {
            if task.take() {
                if let Poll::Ready(output) = future.as_mut().poll(&mut cx) {
                    return Ok(output);
                }
            }
            self.handle_io(None)?;
        }
    }
}

fn pollfd(fd: RawFd, events: PollFlags) -> libc::pollfd {
    libc::pollfd {
        fd,
        events: events.bits(),
        revents: 0,
    }
}
