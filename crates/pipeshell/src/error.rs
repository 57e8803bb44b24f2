//! Error types for pipeline construction and execution
//!
//! Two families live here:
//! - `ShellError` - setup, plumbing and reactor failures raised while a
//!   pipeline is being started (pipe creation, fork, glob patterns, ...)
//! - `PipelineError` - the outcome of waiting on a running pipeline:
//!   failure, interruption or suspension, each with a full report

use std::fmt;

use serde::Serialize;

use crate::reactor::ReactorError;

/// Exit code used by a forked child when `exec` itself fails.
pub const EXIT_EXEC_FAILED: i32 = 127;

/// Exit code used by a forked child when descriptor plumbing fails.
pub const EXIT_REDIRECT_FAILED: i32 = 125;

// ============================================================================
// Shell Errors
// ============================================================================

/// Error codes for shell operations (9000-9009)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ShellErrorCode {
    /// Generic IO error (9000)
    Io = 9000,
    /// Failed to create a pipe (9001)
    Pipe = 9001,
    /// Failed to resolve or open a redirect (9002)
    Redirect = 9002,
    /// Failed to fork a child process (9003)
    Spawn = 9003,
    /// Event loop failure (9004)
    Reactor = 9004,
    /// Invalid configuration (9005)
    Config = 9005,
    /// Invalid glob pattern (9006)
    Glob = 9006,
    /// Output stream was not captured (9007)
    NotCaptured = 9007,
    /// Invalid path provided (9008)
    InvalidPath = 9008,
    /// Event loop re-entered from a handler (9009)
    Reentrant = 9009,
}

impl fmt::Display for ShellErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", *self as u32)
    }
}

/// Errors that can occur while building the process tree for a pipeline
#[derive(Debug, thiserror::Error)]
pub enum ShellError {
    #[error("[{code}] IO error: {message}")]
    Io {
        code: ShellErrorCode,
        message: String,
    },

    #[error("[{code}] Failed to create pipe: {message}")]
    Pipe {
        code: ShellErrorCode,
        message: String,
    },

    #[error("[{code}] Redirect failed: {message}")]
    Redirect {
        code: ShellErrorCode,
        message: String,
    },

    #[error("[{code}] Failed to spawn: {message}")]
    Spawn {
        code: ShellErrorCode,
        message: String,
    },

    #[error("[{code}] Event loop error: {message}")]
    Reactor {
        code: ShellErrorCode,
        message: String,
    },

    #[error("[{code}] Invalid configuration: {message}")]
    Config {
        code: ShellErrorCode,
        message: String,
    },

    #[error("[{code}] Invalid glob pattern: {message}")]
    Glob {
        code: ShellErrorCode,
        message: String,
    },

    #[error("[{code}] Output not captured: {message}")]
    NotCaptured {
        code: ShellErrorCode,
        message: String,
    },

    #[error("[{code}] Invalid path: {message}")]
    InvalidPath {
        code: ShellErrorCode,
        message: String,
    },

    #[error("[{code}] Event loop re-entered: {message}")]
    Reentrant {
        code: ShellErrorCode,
        message: String,
    },
}

impl ShellError {
    pub fn io(message: impl Into<String>) -> Self {
        Self::Io {
            code: ShellErrorCode::Io,
            message: message.into(),
        }
    }

    pub fn pipe_failed(message: impl Into<String>) -> Self {
        Self::Pipe {
            code: ShellErrorCode::Pipe,
            message: message.into(),
        }
    }

    pub fn redirect_failed(message: impl Into<String>) -> Self {
        Self::Redirect {
            code: ShellErrorCode::Redirect,
            message: message.into(),
        }
    }

    pub fn spawn_failed(message: impl Into<String>) -> Self {
        Self::Spawn {
            code: ShellErrorCode::Spawn,
            message: message.into(),
        }
    }

    pub fn reactor(message: impl Into<String>) -> Self {
        Self::Reactor {
            code: ShellErrorCode::Reactor,
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            code: ShellErrorCode::Config,
            message: message.into(),
        }
    }

    pub fn glob(message: impl Into<String>) -> Self {
        Self::Glob {
            code: ShellErrorCode::Glob,
            message: message.into(),
        }
    }

    pub fn not_captured(message: impl Into<String>) -> Self {
        Self::NotCaptured {
            code: ShellErrorCode::NotCaptured,
            message: message.into(),
        }
    }

    pub fn invalid_path(message: impl Into<String>) -> Self {
        Self::InvalidPath {
            code: ShellErrorCode::InvalidPath,
            message: message.into(),
        }
    }

    pub fn reentrant(message: impl Into<String>) -> Self {
        Self::Reentrant {
            code: ShellErrorCode::Reentrant,
            message: message.into(),
        }
    }

    /// Machine-readable code of this error.
    pub fn code(&self) -> ShellErrorCode {
        match self {
            Self::Io { code, .. }
            | Self::Pipe { code, .. }
            | Self::Redirect { code, .. }
            | Self::Spawn { code, .. }
            | Self::Reactor { code, .. }
            | Self::Config { code, .. }
            | Self::Glob { code, .. }
            | Self::NotCaptured { code, .. }
            | Self::InvalidPath { code, .. }
            | Self::Reentrant { code, .. } => *code,
        }
    }
}

impl From<std::io::Error> for ShellError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::NotFound => Self::invalid_path(e.to_string()),
            _ => Self::io(e.to_string()),
        }
    }
}

impl From<nix::errno::Errno> for ShellError {
    fn from(e: nix::errno::Errno) -> Self {
        Self::io(e.desc())
    }
}

impl From<ReactorError> for ShellError {
    fn from(e: ReactorError) -> Self {
        match e {
            ReactorError::Reentrant => Self::reentrant(e.to_string()),
            _ => Self::reactor(e.to_string()),
        }
    }
}

// ============================================================================
// Pipeline Outcomes
// ============================================================================

/// Snapshot of one running item, rendered for postmortems.
#[derive(Debug, Clone, Serialize)]
pub struct ItemReport {
    /// Description of the stage (`grep("x")`, `my_filter()`)
    pub stage: String,
    /// Status line (`4242 (exit_code=1)`, `exception: ...`)
    pub status: String,
    /// Whether this item counts as failed
    pub failed: bool,
    /// Content of string-capture redirects, keyed by stream name
    pub captured: Vec<(String, String)>,
}

impl fmt::Display for ItemReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} as {}", self.stage, self.status)?;
        for (stream, content) in &self.captured {
            write!(f, "\n{stream} content:\n{content}")?;
        }
        Ok(())
    }
}

/// Full description of a pipeline at the moment it was waited on.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    /// Description of the whole pipeline with per-item status
    pub pipeline: String,
    /// Reports for the items relevant to the outcome
    pub items: Vec<ItemReport>,
}

impl PipelineReport {
    /// Serialize the report for a front end.
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|_| self.pipeline.clone())
    }
}

impl fmt::Display for PipelineReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.pipeline)?;
        if !self.items.is_empty() {
            write!(f, ":\n\n")?;
            let rendered: Vec<String> = self.items.iter().map(|i| i.to_string()).collect();
            write!(f, "{}", rendered.join("\n\n================================\n\n"))?;
        }
        Ok(())
    }
}

/// Outcome of waiting on a running pipeline when it did not simply succeed.
///
/// Failure, interruption and suspension are distinct: only `Failed` means a
/// stage went wrong. The other two are job-control outcomes the caller is
/// expected to handle (re-wait, background, or terminate).
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Pipeline failed: {0}")]
    Failed(PipelineReport),

    #[error("Pipeline canceled: {0}")]
    Interrupted(PipelineReport),

    #[error("Pipeline suspended: {0}")]
    Suspended(PipelineReport),

    #[error(transparent)]
    Shell(#[from] ShellError),
}

impl PipelineError {
    /// True if at least one stage failed.
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed(_))
    }

    pub fn is_interrupted(&self) -> bool {
        matches!(self, Self::Interrupted(_))
    }

    pub fn is_suspended(&self) -> bool {
        matches!(self, Self::Suspended(_))
    }

    /// The report attached to a wait outcome, if any.
    pub fn report(&self) -> Option<&PipelineReport> {
        match self {
            Self::Failed(r) | Self::Interrupted(r) | Self::Suspended(r) => Some(r),
            Self::Shell(_) => None,
        }
    }
}

impl From<ReactorError> for PipelineError {
    fn from(e: ReactorError) -> Self {
        Self::Shell(e.into())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_in_message() {
        let err = ShellError::spawn_failed("fork: EAGAIN");
        assert_eq!(err.code(), ShellErrorCode::Spawn);
        assert_eq!(err.to_string(), "[9003] Failed to spawn: fork: EAGAIN");
    }

    #[test]
    fn test_io_error_conversion() {
        let err: ShellError = std::io::Error::new(std::io::ErrorKind::NotFound, "gone").into();
        assert_eq!(err.code(), ShellErrorCode::InvalidPath);

        let err: ShellError = std::io::Error::other("boom").into();
        assert_eq!(err.code(), ShellErrorCode::Io);
    }

    #[test]
    fn test_report_rendering() {
        let report = PipelineReport {
            pipeline: "false() as 12 (exit_code=1)".into(),
            items: vec![ItemReport {
                stage: "false()".into(),
                status: "12 (exit_code=1)".into(),
                failed: true,
                captured: vec![("stderr".into(), "oops".into())],
            }],
        };
        let err = PipelineError::Failed(report);
        let text = err.to_string();
        assert!(text.starts_with("Pipeline failed: false()"));
        assert!(text.contains("stderr content:\noops"));
        assert!(err.is_failure());
        assert!(!err.is_suspended());
    }

    #[test]
    fn test_report_json() {
        let report = PipelineReport {
            pipeline: "p".into(),
            items: vec![],
        };
        assert!(report.to_json().contains("\"pipeline\": \"p\""));
    }
}
