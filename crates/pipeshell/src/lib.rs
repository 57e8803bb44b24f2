//! Pipelines of processes and in-process functions
//!
//! pipeshell builds shell pipelines as values and runs them on a
//! single-threaded reactor:
//! - `plumbing` - descriptors, redirects and the fork-side setup
//! - `reactor` - poll loop, child signals and function stage I/O
//! - `pipeline` - the immutable pipeline graph and its operators
//! - `engine` - running pipelines, items and the job table
//! - `shell` - the execution context a console front end drives
//!
//! ```no_run
//! use pipeshell::cmd;
//! use pipeshell::Shell;
//!
//! let shell = Shell::new()?;
//! let out = shell.output(cmd("ls").arg("-1") | cmd("sort").flag("reverse"))?;
//! print!("{out}");
//! # Ok::<(), pipeshell::PipelineError>(())
//! ```

pub mod config;
pub mod engine;
pub mod environment;
pub mod error;
pub mod logging;
pub mod pipeline;
pub mod plumbing;
pub mod reactor;
pub mod sequence;
pub mod shell;
pub mod which;

pub use config::EngineConfig;
pub use config::EnvironmentConfig;
pub use config::ShellConfig;
pub use engine::ItemKind;
pub use engine::JobId;
pub use engine::JobState;
pub use engine::JobTable;
pub use engine::RunningItem;
pub use engine::RunningPipeline;
pub use engine::StartFailure;
pub use environment::Environment;
pub use error::ItemReport;
pub use error::PipelineError;
pub use error::PipelineReport;
pub use error::ShellError;
pub use error::ShellErrorCode;
pub use pipeline::cmd;
pub use pipeline::Arg;
pub use pipeline::Command;
pub use pipeline::Function;
pub use pipeline::Lit;
pub use pipeline::Pipeline;
pub use pipeline::StageArgs;
pub use plumbing::Redirect;
pub use plumbing::RedirectSet;
pub use plumbing::Source;
pub use plumbing::Stream;
pub use reactor::LineInput;
pub use reactor::Reactor;
pub use sequence::Sequence;
pub use shell::Shell;
