//! Async writer feeding a descriptor from a `Sequence`

use std::cell::Cell;
use std::cell::RefCell;
use std::os::fd::RawFd;
use std::rc::Rc;
use std::sync::Arc;
use std::task::Context;
use std::task::Poll;

use futures::StreamExt;
use nix::errno::Errno;
use nix::poll::PollFlags;

use super::FlagWake;
use super::HandlerId;
use super::IoHandler;
use super::Reactor;
use crate::plumbing::fd;
use crate::sequence::Sequence;

/// How items are framed on the descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// Each item is followed by `\n`.
    Lines,
    /// Items are written as-is.
    Bytes,
}

type FinishCallback = Box<dyn FnOnce(Option<&anyhow::Error>)>;

struct OutputState {
    source: Option<Sequence>,
    pending: Vec<u8>,
    written: usize,
    /// Set once the source is exhausted; holds its error, if any.
    ended: Option<Option<anyhow::Error>>,
    error: Option<Rc<anyhow::Error>>,
    on_finish: Option<FinishCallback>,
}

/// Writes the items of a sequence to a descriptor as it becomes writable.
///
/// The source is only polled when the descriptor is writable and the
/// source has signalled progress, so a slow consumer applies back-pressure
/// to the producer. The handler finishes when the source ends, fails, or
/// the reader goes away; it then deregisters and closes its descriptor.
pub struct OutputHandler {
    fd: RawFd,
    mode: OutputMode,
    id: Cell<Option<HandlerId>>,
    finished: Cell<bool>,
    wake: Arc<FlagWake>,
    state: RefCell<OutputState>,
}

impl OutputHandler {
    /// Start writing `source` to `fd`. Ownership of `fd` moves to the handler.
    pub fn start(reactor: &Reactor, fd: RawFd, source: Sequence, mode: OutputMode) -> Rc<Self> {
        let handler = Rc::new(Self {
            fd,
            mode,
            id: Cell::new(None),
            finished: Cell::new(false),
            wake: FlagWake::new(reactor.notifier(), true),
            state: RefCell::new(OutputState {
                source: Some(source),
                pending: Vec::new(),
                written: 0,
                ended: None,
                error: None,
                on_finish: None,
            }),
        });
        let id = reactor.register(handler.clone());
        handler.id.set(Some(id));
        handler
    }

    /// Run `callback` once the handler finishes, with the recorded error.
    /// Runs immediately if it already has.
    pub fn on_finish(&self, callback: impl FnOnce(Option<&anyhow::Error>) + 'static) {
        if self.finished.get() {
            let error = self.error();
            callback(error.as_deref());
        } else {
            self.state.borrow_mut().on_finish = Some(Box::new(callback));
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished.get()
    }

    /// Error raised by the source, if any.
    pub fn error(&self) -> Option<Rc<anyhow::Error>> {
        self.state.borrow().error.clone()
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Stop writing: drop the source, close the descriptor.
    pub fn cancel(&self, reactor: &Reactor) {
        self.finish(reactor, None);
    }

    fn finish(&self, reactor: &Reactor, error: Option<anyhow::Error>) {
        if self.finished.replace(true) {
            return;
        }
        if let Some(id) = self.id.take() {
            reactor.deregister(id);
        }
        let _ = fd::close_fd(self.fd);

        let (callback, error) = {
            let mut state = self.state.borrow_mut();
            state.source = None;
            state.pending.clear();
            state.error = error.map(Rc::new);
            (state.on_finish.take(), state.error.clone())
        };
        match &error {
            Some(e) => tracing::debug!(target: "pipeshell::io", fd = self.fd, error = %e, "output failed"),
            None => tracing::debug!(target: "pipeshell::io", fd = self.fd, "output done"),
        }
        if let Some(callback) = callback {
            callback(error.as_deref());
        }
    }

    /// Pull items while the source is ready and the buffer is small.
    /// Returns the outcome if the source ended.
    fn fill(&self) -> Option<Option<anyhow::Error>> {
        let mut source = self.state.borrow_mut().source.take()?;
        let waker = futures::task::waker(self.wake.clone());
        let mut cx = Context::from_waker(&waker);

        let mut outcome = None;
        while self.wake.take() {
            match source.poll_next_unpin(&mut cx) {
                Poll::Ready(Some(Ok(Some(mut data)))) => {
                    if self.mode == OutputMode::Lines {
                        data.push(b'\n');
                    }
                    let mut state = self.state.borrow_mut();
                    state.pending.extend_from_slice(&data);
                    self.wake.raise();
                    if state.pending.len() - state.written >= fd::PIPE_BUF {
                        break;
                    }
                }
                Poll::Ready(Some(Ok(None))) => {
                    // Tick: yield to the loop, poll again next round.
                    self.wake.raise();
                    break;
                }
                Poll::Ready(Some(Err(e))) => {
                    outcome = Some(Some(e));
                    break;
                }
                Poll::Ready(None) => {
                    outcome = Some(None);
                    break;
                }
                Poll::Pending => break,
            }
        }
        if outcome.is_none() {
            self.state.borrow_mut().source = Some(source);
        }
        outcome
    }

    /// Write at most one atomic chunk of the pending buffer.
    fn flush(&self) -> Result<(), Errno> {
        let mut state = self.state.borrow_mut();
        let remaining = state.pending.len() - state.written;
        if remaining == 0 {
            return Ok(());
        }
        let end = state.written + remaining.min(fd::PIPE_BUF);
        let n = fd::write_fd(self.fd, &state.pending[state.written..end])?;
        tracing::trace!(target: "pipeshell::io", fd = self.fd, n, "write");
        state.written += n;
        if state.written == state.pending.len() {
            state.pending.clear();
            state.written = 0;
        }
        Ok(())
    }

    fn has_pending(&self) -> bool {
        let state = self.state.borrow();
        state.pending.len() > state.written
    }
}

impl IoHandler for OutputHandler {
    fn fd(&self) -> RawFd {
        self.fd
    }

    fn interest(&self) -> PollFlags {
        if self.finished.get() {
            PollFlags::empty()
        } else if self.has_pending() || self.wake.is_raised() || self.state.borrow().ended.is_some() {
            PollFlags::POLLOUT
        } else {
            PollFlags::empty()
        }
    }

    fn handle_event(&self, reactor: &Reactor, events: PollFlags) {
        if events.intersects(PollFlags::POLLERR | PollFlags::POLLHUP | PollFlags::POLLNVAL) {
            tracing::debug!(target: "pipeshell::io", fd = self.fd, "reader went away");
            let ended = self.state.borrow_mut().ended.take().flatten();
            self.finish(reactor, ended);
            return;
        }

        if !self.has_pending() && self.state.borrow().ended.is_none() {
            if let Some(outcome) = self.fill() {
                self.state.borrow_mut().ended = Some(outcome);
            }
        }

        if let Err(e) = self.flush() {
            let ended = self.state.borrow_mut().ended.take().flatten();
            match e {
                Errno::EPIPE => {
                    tracing::debug!(target: "pipeshell::io", fd = self.fd, "broken pipe");
                    self.finish(reactor, ended);
                }
                e => self.finish(reactor, Some(ended.unwrap_or_else(|| anyhow::Error::new(e)))),
            }
            return;
        }

        if !self.has_pending() {
            let ended = self.state.borrow_mut().ended.take();
            if let Some(outcome) = ended {
                self.finish(reactor, outcome);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;
    use crate::config::EngineConfig;
    use crate::reactor::LineInput;
    use crate::sequence;

    fn reactor() -> Reactor {
        Reactor::new(&EngineConfig::default(), false).unwrap()
    }

    fn run_until_finished(reactor: &Reactor, handler: &OutputHandler) {
        while !handler.is_finished() {
            reactor.handle_io(None).unwrap();
        }
    }

    #[test]
    fn test_lines_roundtrip_through_input() {
        let reactor = reactor();
        let (r, w) = fd::pipe_cloexec().unwrap();
        let lines: Vec<String> = (0..500).map(|i| format!("line {i}")).collect();

        let out = OutputHandler::start(
            &reactor,
            w,
            sequence::from_iter(lines.clone()),
            OutputMode::Lines,
        );
        let input = LineInput::new(&reactor, r);
        let read = reactor.block_on(input.collect::<Vec<_>>()).unwrap();

        assert_eq!(read, lines);
        assert!(out.is_finished());
        assert!(out.error().is_none());
    }

    #[test]
    fn test_bytes_mode_keeps_partial_tail() {
        let reactor = reactor();
        let (r, w) = fd::pipe_cloexec().unwrap();
        OutputHandler::start(
            &reactor,
            w,
            sequence::from_iter(vec!["a\nb", "\nc"]),
            OutputMode::Bytes,
        );
        let read = reactor
            .block_on(LineInput::new(&reactor, r).collect::<Vec<_>>())
            .unwrap();
        assert_eq!(read, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_source_error_is_recorded() {
        let reactor = reactor();
        let (r, w) = fd::pipe_cloexec().unwrap();
        let items: Vec<anyhow::Result<&str>> = vec![Ok("ok"), Err(anyhow::anyhow!("generator broke"))];
        let out = OutputHandler::start(
            &reactor,
            w,
            sequence::try_from_iter(items),
            OutputMode::Lines,
        );
        let seen = Rc::new(Cell::new(false));
        let s = seen.clone();
        out.on_finish(move |err| s.set(err.is_some()));

        run_until_finished(&reactor, &out);
        assert!(seen.get());
        assert_eq!(out.error().unwrap().to_string(), "generator broke");
        let read = reactor
            .block_on(LineInput::new(&reactor, r).collect::<Vec<_>>())
            .unwrap();
        assert_eq!(read, vec!["ok"]);
    }

    #[test]
    fn test_ticks_are_not_written() {
        let reactor = reactor();
        let (r, w) = fd::pipe_cloexec().unwrap();
        OutputHandler::start(
            &reactor,
            w,
            sequence::from_iter(vec![None, Some("x"), None, None, Some("y")]),
            OutputMode::Lines,
        );
        let read = reactor
            .block_on(LineInput::new(&reactor, r).collect::<Vec<_>>())
            .unwrap();
        assert_eq!(read, vec!["x", "y"]);
    }

    #[test]
    fn test_closed_reader_finishes_without_error() {
        let reactor = reactor();
        let (r, w) = fd::pipe_cloexec().unwrap();
        fd::close_fd(r).unwrap();
        let out = OutputHandler::start(
            &reactor,
            w,
            sequence::from_iter(std::iter::repeat("spam").take(100_000)),
            OutputMode::Lines,
        );
        run_until_finished(&reactor, &out);
        assert!(out.error().is_none());
        assert_eq!(reactor.handler_count(), 0);
    }
}
