//! Pipeline graph
//!
//! A `Pipeline` is a plain value tree built with the builder functions and
//! the `|` / `+` operators:
//!
//! ```ignore
//! let p = cmd("ls").arg("-l") | cmd("grep").arg("rs") | "listing.txt";
//! let both = cmd("make").arg("a") + cmd("make").arg("b");
//! ```
//!
//! Nodes own their configuration; only the program name of a command and
//! the body of a function are shared (`Rc`) between clones. Every run works
//! on its own clone of the tree.

mod command;
mod function;
mod ops;

use std::fmt;
use std::path::PathBuf;

pub use command::cmd;
pub use command::Arg;
pub use command::Command;
pub use command::Lit;
pub use function::Function;
pub use function::FunctionBody;
pub use function::StageArgs;

use crate::plumbing::Redirect;
use crate::plumbing::RedirectSet;
use crate::plumbing::Source;

#[derive(Clone)]
pub enum Pipeline {
    Command(Command),
    Function(Function),
    /// Stdout of the first node feeds stdin of the second.
    Pipe(Box<Pipeline>, Box<Pipeline>),
    /// Both nodes run side by side on the same streams.
    Group(Box<Pipeline>, Box<Pipeline>),
    /// The node runs with these redirects merged over the incoming ones.
    Redirected(Box<Pipeline>, RedirectSet),
}

impl Pipeline {
    pub fn pipe(self, dst: impl Into<Pipeline>) -> Pipeline {
        Pipeline::Pipe(Box::new(self), Box::new(dst.into()))
    }

    pub fn group(self, other: impl Into<Pipeline>) -> Pipeline {
        Pipeline::Group(Box::new(self), Box::new(other.into()))
    }

    /// Wrap the node with extra redirects. Redirecting an already
    /// redirected node merges into its set.
    pub fn redirect(self, redirects: impl Into<RedirectSet>) -> Pipeline {
        let redirects = redirects.into();
        match self {
            Pipeline::Redirected(inner, existing) => {
                Pipeline::Redirected(inner, existing.merge(&redirects))
            }
            other => Pipeline::Redirected(Box::new(other), redirects),
        }
    }

    /// Send stdout to a file, truncating it.
    pub fn stdout_to(self, path: impl Into<PathBuf>) -> Pipeline {
        self.redirect(Redirect::new(1, Source::Path(path.into())))
    }

    /// Read stdin from a file.
    pub fn stdin_from(self, path: impl Into<PathBuf>) -> Pipeline {
        self.redirect(Redirect::new(0, Source::Path(path.into())))
    }

    /// Capture stderr into a string available after the run.
    pub fn capture_stderr(self) -> Pipeline {
        self.redirect(Redirect::capture(2))
    }

    /// Number of command and function stages in the tree.
    pub fn stage_count(&self) -> usize {
        match self {
            Pipeline::Command(_) | Pipeline::Function(_) => 1,
            Pipeline::Pipe(a, b) | Pipeline::Group(a, b) => a.stage_count() + b.stage_count(),
            Pipeline::Redirected(inner, _) => inner.stage_count(),
        }
    }

    fn needs_parens(&self) -> bool {
        matches!(self, Pipeline::Pipe(..) | Pipeline::Group(..) | Pipeline::Redirected(..))
    }
}

impl From<Command> for Pipeline {
    fn from(command: Command) -> Self {
        Pipeline::Command(command)
    }
}

impl From<Function> for Pipeline {
    fn from(function: Function) -> Self {
        Pipeline::Function(function)
    }
}

impl From<&Pipeline> for Pipeline {
    fn from(pipeline: &Pipeline) -> Self {
        pipeline.clone()
    }
}

impl fmt::Display for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Pipeline::Command(c) => write!(f, "{c}"),
            Pipeline::Function(func) => write!(f, "{func}"),
            Pipeline::Pipe(src, dst) => {
                let wrap = |p: &Pipeline| {
                    if matches!(p, Pipeline::Group(..)) {
                        format!("({p})")
                    } else {
                        p.to_string()
                    }
                };
                write!(f, "{} | {}", wrap(src), wrap(dst))
            }
            Pipeline::Group(a, b) => write!(f, "{a} + {b}"),
            Pipeline::Redirected(inner, redirects) => {
                if inner.needs_parens() {
                    write!(f, "({inner}) with {redirects}")
                } else {
                    write!(f, "{inner} with {redirects}")
                }
            }
        }
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pipeline({self})")
    }
}
