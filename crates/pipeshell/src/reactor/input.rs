//! Async readers over a descriptor
//!
//! One bounded `read` per readiness event into an internal buffer. The
//! handler only asks for POLLIN while a consumer is waiting, so an idle
//! reader never keeps the loop busy.

use std::cell::RefCell;
use std::os::fd::RawFd;
use std::pin::Pin;
use std::rc::Rc;
use std::task::Context;
use std::task::Poll;
use std::task::Waker;

use futures::Stream;
use nix::poll::PollFlags;

use super::HandlerId;
use super::IoHandler;
use super::Reactor;
use crate::plumbing::fd;

#[derive(Default)]
struct InputState {
    buf: Vec<u8>,
    eof: bool,
    waker: Option<Waker>,
}

struct InputHandler {
    fd: RawFd,
    chunk: usize,
    state: RefCell<InputState>,
}

impl IoHandler for InputHandler {
    fn fd(&self) -> RawFd {
        self.fd
    }

    fn interest(&self) -> PollFlags {
        let state = self.state.borrow();
        if state.waker.is_some() && !state.eof {
            PollFlags::POLLIN
        } else {
            PollFlags::empty()
        }
    }

    fn handle_event(&self, _reactor: &Reactor, _events: PollFlags) {
        let mut state = self.state.borrow_mut();
        let start = state.buf.len();
        state.buf.resize(start + self.chunk, 0);
        match fd::read_fd(self.fd, &mut state.buf[start..]) {
            Ok(n) => {
                state.buf.truncate(start + n);
                if n == 0 {
                    state.eof = true;
                }
                tracing::trace!(target: "pipeshell::io", fd = self.fd, n, "read");
            }
            Err(e) => {
                state.buf.truncate(start);
                state.eof = true;
                tracing::warn!(target: "pipeshell::io", fd = self.fd, error = %e, "read failed");
            }
        }
        let waker = state.waker.take();
        drop(state);
        if let Some(waker) = waker {
            waker.wake();
        }
    }
}

/// Owns the descriptor and the registration shared by both reader kinds.
struct InputCore {
    reactor: Reactor,
    handler: Rc<InputHandler>,
    id: HandlerId,
}

impl InputCore {
    fn new(reactor: &Reactor, fd: RawFd) -> Self {
        let handler = Rc::new(InputHandler {
            fd,
            chunk: reactor.read_chunk(),
            state: RefCell::new(InputState::default()),
        });
        let id = reactor.register(handler.clone());
        Self {
            reactor: reactor.clone(),
            handler,
            id,
        }
    }

    fn poll_with<T>(
        &self,
        cx: &mut Context<'_>,
        extract: impl FnOnce(&mut InputState) -> Option<T>,
    ) -> Poll<Option<T>> {
        let mut state = self.handler.state.borrow_mut();
        if let Some(item) = extract(&mut *state) {
            return Poll::Ready(Some(item));
        }
        if state.eof {
            return Poll::Ready(None);
        }
        state.waker = Some(cx.waker().clone());
        Poll::Pending
    }
}

impl Drop for InputCore {
    fn drop(&mut self) {
        self.reactor.deregister(self.id);
        let _ = fd::close_fd(self.handler.fd);
    }
}

/// Stream of lines read from a descriptor, without their terminator.
///
/// A final line without `\n` is yielded once at end of file. The
/// descriptor is owned and closed on drop.
pub struct LineInput {
    core: InputCore,
}

impl LineInput {
    pub fn new(reactor: &Reactor, fd: RawFd) -> Self {
        Self {
            core: InputCore::new(reactor, fd),
        }
    }

    pub fn fd(&self) -> RawFd {
        self.core.handler.fd
    }
}

impl Stream for LineInput {
    type Item = String;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<String>> {
        self.core.poll_with(cx, |state| {
            let line = match state.buf.iter().position(|b| *b == b'\n') {
                Some(pos) => {
                    let mut line: Vec<u8> = state.buf.drain(..=pos).collect();
                    line.pop();
                    line
                }
                None if state.eof && !state.buf.is_empty() => std::mem::take(&mut state.buf),
                None => return None,
            };
            Some(String::from_utf8_lossy(&line).into_owned())
        })
    }
}

/// Stream of raw chunks read from a descriptor.
pub struct ByteInput {
    core: InputCore,
}

impl ByteInput {
    pub fn new(reactor: &Reactor, fd: RawFd) -> Self {
        Self {
            core: InputCore::new(reactor, fd),
        }
    }

    pub fn fd(&self) -> RawFd {
        self.core.handler.fd
    }
}

impl Stream for ByteInput {
    type Item = Vec<u8>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Vec<u8>>> {
        self.core.poll_with(cx, |state| {
            if state.buf.is_empty() {
                None
            } else {
                Some(std::mem::take(&mut state.buf))
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;
    use crate::config::EngineConfig;

    fn reactor() -> Reactor {
        Reactor::new(&EngineConfig::default(), false).unwrap()
    }

    #[test]
    fn test_lines_with_partial_tail() {
        let reactor = reactor();
        let (r, w) = fd::pipe_cloexec().unwrap();
        fd::write_fd(w, b"alpha\nbeta\ngam").unwrap();
        fd::close_fd(w).unwrap();

        let input = LineInput::new(&reactor, r);
        let lines = reactor.block_on(input.collect::<Vec<_>>()).unwrap();
        assert_eq!(lines, vec!["alpha", "beta", "gam"]);
        assert_eq!(reactor.handler_count(), 0);
    }

    #[test]
    fn test_small_chunks_reassemble_lines() {
        let config = EngineConfig {
            read_chunk: 3,
            ..EngineConfig::default()
        };
        let reactor = Reactor::new(&config, false).unwrap();
        let (r, w) = fd::pipe_cloexec().unwrap();
        fd::write_fd(w, b"a long line\nshort\n").unwrap();
        fd::close_fd(w).unwrap();

        let lines = reactor
            .block_on(LineInput::new(&reactor, r).collect::<Vec<_>>())
            .unwrap();
        assert_eq!(lines, vec!["a long line", "short"]);
    }

    #[test]
    fn test_empty_input_ends_immediately() {
        let reactor = reactor();
        let (r, w) = fd::pipe_cloexec().unwrap();
        fd::close_fd(w).unwrap();
        let lines = reactor
            .block_on(LineInput::new(&reactor, r).collect::<Vec<_>>())
            .unwrap();
        assert!(lines.is_empty());
    }

    #[test]
    fn test_bytes() {
        let reactor = reactor();
        let (r, w) = fd::pipe_cloexec().unwrap();
        fd::write_fd(w, b"\x00\x01\x02").unwrap();
        fd::close_fd(w).unwrap();
        let chunks = reactor
            .block_on(ByteInput::new(&reactor, r).collect::<Vec<_>>())
            .unwrap();
        assert_eq!(chunks.concat(), vec![0u8, 1, 2]);
    }

    #[test]
    fn test_drop_deregisters() {
        let reactor = reactor();
        let (r, w) = fd::pipe_cloexec().unwrap();
        let input = LineInput::new(&reactor, r);
        assert_eq!(reactor.handler_count(), 1);
        drop(input);
        assert_eq!(reactor.handler_count(), 0);
        fd::close_fd(w).unwrap();
    }
}
