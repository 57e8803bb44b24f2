//! A single stream mapping: "descriptor N of the stage reads/writes X"

use std::fmt;
use std::os::fd::IntoRawFd;
use std::os::fd::RawFd;
use std::path::PathBuf;
use std::str::FromStr;

use nix::fcntl::OFlag;
use nix::sys::stat::Mode;

use super::fd;
use crate::error::ShellError;

// ============================================================================
// Stream Index
// ============================================================================

/// Descriptor index inside a stage (0 = stdin, 1 = stdout, 2 = stderr, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Stream(pub RawFd);

impl Stream {
    pub const STDIN: Stream = Stream(0);
    pub const STDOUT: Stream = Stream(1);
    pub const STDERR: Stream = Stream(2);

    pub fn fd(self) -> RawFd {
        self.0
    }

    /// Conventional name of the stream, if it has one.
    pub fn name(self) -> Option<&'static str> {
        match self.0 {
            0 => Some("stdin"),
            1 => Some("stdout"),
            2 => Some("stderr"),
            _ => None,
        }
    }
}

impl From<RawFd> for Stream {
    fn from(fd: RawFd) -> Self {
        Stream(fd)
    }
}

impl FromStr for Stream {
    type Err = ShellError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stdin" => Ok(Self::STDIN),
            "stdout" => Ok(Self::STDOUT),
            "stderr" => Ok(Self::STDERR),
            other => other
                .parse::<RawFd>()
                .map(Stream)
                .map_err(|_| ShellError::redirect_failed(format!("unknown stream '{other}'"))),
        }
    }
}

impl fmt::Display for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Sources
// ============================================================================

/// What a stream is connected to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    /// An open descriptor. Borrowed descriptors are never closed by the
    /// redirect machinery.
    Fd { fd: RawFd, borrowed: bool },
    /// A filesystem path, opened in the child with the redirect's flags.
    Path(PathBuf),
    /// Pending anonymous pipe, resolved by `make_pipe`.
    Pipe,
    /// Pending temp file, kept on disk after the stage finishes.
    Temp,
    /// Pending temp file whose content is read back into memory and
    /// unlinked once the stage finishes.
    Capture,
    /// No mapping. Registering this removes the stream from a set.
    Unmapped,
}

impl Source {
    pub fn is_pending(&self) -> bool {
        matches!(self, Source::Pipe | Source::Temp | Source::Capture)
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Source::Fd { fd, .. } => write!(f, "{fd}"),
            Source::Path(path) => write!(f, "{}", path.display()),
            Source::Pipe => write!(f, "PIPE"),
            Source::Temp => write!(f, "TMP"),
            Source::Capture => write!(f, "STRING"),
            Source::Unmapped => write!(f, "None"),
        }
    }
}

impl From<PathBuf> for Source {
    fn from(path: PathBuf) -> Self {
        Source::Path(path)
    }
}

impl From<&str> for Source {
    fn from(path: &str) -> Self {
        Source::Path(PathBuf::from(path))
    }
}

impl From<String> for Source {
    fn from(path: String) -> Self {
        Source::Path(PathBuf::from(path))
    }
}

/// The parent's side of a resolved pending source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipeHandle {
    /// The other end of an anonymous pipe, owned by the parent.
    Fd(RawFd),
    /// Temp file left in place for the caller.
    TempFile(PathBuf),
    /// Temp file to be read back into a string and removed.
    Capture(PathBuf),
}

impl fmt::Display for PipeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipeHandle::Fd(fd) => write!(f, "{fd}"),
            PipeHandle::TempFile(path) | PipeHandle::Capture(path) => {
                write!(f, "{}", path.display())
            }
        }
    }
}

// ============================================================================
// Redirect
// ============================================================================

const DEFAULT_MODE: u32 = 0o666;

/// Maps one stream index of a stage onto a source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Redirect {
    target: RawFd,
    source: Source,
    flags: OFlag,
    mode: Mode,
    pipe: Option<PipeHandle>,
}

impl Redirect {
    /// Redirect with the conventional flags for `target`: read-only for
    /// stdin, create-and-truncate for everything else.
    pub fn new(target: impl Into<Stream>, source: impl Into<Source>) -> Self {
        let target = target.into();
        let flags = if target == Stream::STDIN {
            OFlag::O_RDONLY
        } else {
            OFlag::O_WRONLY | OFlag::O_CREAT | OFlag::O_TRUNC
        };
        Self::with_flags(target, source, flags)
    }

    pub fn with_flags(target: impl Into<Stream>, source: impl Into<Source>, flags: OFlag) -> Self {
        Self {
            target: target.into().fd(),
            source: source.into(),
            flags,
            mode: Mode::from_bits_truncate(DEFAULT_MODE as _),
            pipe: None,
        }
    }

    /// Map `target` onto a descriptor owned by the caller.
    pub fn fd(target: impl Into<Stream>, fd: RawFd) -> Self {
        Self::new(target, Source::Fd { fd, borrowed: true })
    }

    /// Map `target` onto a descriptor whose ownership moves into the redirect.
    pub fn owned_fd(target: impl Into<Stream>, fd: RawFd) -> Self {
        Self::new(target, Source::Fd { fd, borrowed: false })
    }

    /// Discard output, or read nothing for stdin.
    pub fn null(target: impl Into<Stream>) -> Self {
        Self::new(target, "/dev/null")
    }

    /// Append to `path` instead of truncating it.
    pub fn append(target: impl Into<Stream>, path: impl Into<PathBuf>) -> Self {
        Self::with_flags(
            target,
            Source::Path(path.into()),
            OFlag::O_WRONLY | OFlag::O_CREAT | OFlag::O_APPEND,
        )
    }

    pub fn pipe(target: impl Into<Stream>) -> Self {
        Self::new(target, Source::Pipe)
    }

    pub fn temp(target: impl Into<Stream>) -> Self {
        Self::new(target, Source::Temp)
    }

    pub fn capture(target: impl Into<Stream>) -> Self {
        Self::new(target, Source::Capture)
    }

    /// Remove the mapping for `target` when registered in a set.
    pub fn unmapped(target: impl Into<Stream>) -> Self {
        Self::new(target, Source::Unmapped)
    }

    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    pub fn target(&self) -> RawFd {
        self.target
    }

    pub fn source(&self) -> &Source {
        &self.source
    }

    pub fn flags(&self) -> OFlag {
        self.flags
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn pipe_handle(&self) -> Option<&PipeHandle> {
        self.pipe.as_ref()
    }

    /// Take the parent's side of a resolved pipe out of the redirect.
    pub fn take_pipe(&mut self) -> Option<PipeHandle> {
        self.pipe.take()
    }

    /// Source descriptor, if the source is one.
    pub fn source_fd(&self) -> Option<RawFd> {
        match self.source {
            Source::Fd { fd, .. } => Some(fd),
            _ => None,
        }
    }

    /// True when the stage reads from this stream.
    pub fn is_input(&self) -> bool {
        (self.flags & OFlag::O_ACCMODE) == OFlag::O_RDONLY
    }

    /// Resolve a pending source into concrete descriptors.
    ///
    /// For a pipe, the end matching the stream's direction becomes the
    /// source and the other end becomes the parent's pipe handle. Temp and
    /// capture sources create a file on disk and require an output stream.
    /// Resolved redirects are returned unchanged.
    pub fn make_pipe(&self) -> Result<Redirect, ShellError> {
        let mut resolved = self.clone();
        match self.source {
            Source::Pipe => {
                let (r, w) = fd::pipe_cloexec().map_err(|e| ShellError::pipe_failed(e.desc()))?;
                let (source, pipe) = if self.is_input() { (r, w) } else { (w, r) };
                resolved.source = Source::Fd {
                    fd: source,
                    borrowed: false,
                };
                resolved.pipe = Some(PipeHandle::Fd(pipe));
            }
            Source::Temp | Source::Capture => {
                if self.is_input() {
                    return Err(ShellError::redirect_failed(format!(
                        "temp file redirect of {} must be an output",
                        self.target
                    )));
                }
                let (file, path) = tempfile::Builder::new()
                    .prefix("pipeshell-")
                    .tempfile()?
                    .keep()
                    .map_err(|e| ShellError::redirect_failed(e.to_string()))?;
                tracing::debug!(target: "pipeshell::fd", path = %path.display(), "temp file");
                resolved.source = Source::Fd {
                    fd: file.into_raw_fd(),
                    borrowed: false,
                };
                resolved.pipe = Some(if self.source == Source::Capture {
                    PipeHandle::Capture(path)
                } else {
                    PipeHandle::TempFile(path)
                });
            }
            _ => {}
        }
        Ok(resolved)
    }

    /// Close the source descriptor if this redirect owns it.
    ///
    /// The source is marked borrowed afterwards so a second call is a no-op.
    pub fn close_source_fd(&mut self) {
        if let Source::Fd { fd, borrowed } = &mut self.source {
            if !*borrowed {
                if let Err(e) = fd::close_fd(*fd) {
                    tracing::warn!(target: "pipeshell::fd", fd = *fd, error = %e, "close of source failed");
                }
                *borrowed = true;
            }
        }
    }

    /// Copy of this redirect that does not own its source descriptor.
    pub fn borrowed(&self) -> Redirect {
        let mut copy = self.clone();
        if let Source::Fd { borrowed, .. } = &mut copy.source {
            *borrowed = true;
        }
        copy
    }
}

impl fmt::Display for Redirect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let arrow = if self.is_input() {
            "<-"
        } else if self.flags.contains(OFlag::O_APPEND) {
            "->>"
        } else {
            "->"
        };
        write!(f, "{} {} {}", self.target, arrow, self.source)?;
        if let Some(pipe) = &self.pipe {
            write!(f, " pipe={pipe}")?;
        }
        Ok(())
    }
}
