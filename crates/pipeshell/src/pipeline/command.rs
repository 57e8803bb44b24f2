//! External command nodes

use std::fmt;
use std::rc::Rc;

use super::Pipeline;

/// Argument wrapper that is passed through verbatim, never globbed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lit(pub String);

impl Lit {
    pub fn new(text: impl Into<String>) -> Self {
        Self(text.into())
    }
}

/// One argument of a command.
#[derive(Clone)]
pub enum Arg {
    /// Text subject to `~` and glob expansion.
    Text(String),
    /// Text passed as-is.
    Literal(String),
    /// `--name=value`, or `--name` without a value.
    Keyword { name: String, value: Option<String> },
    /// The command reads the pipeline's stdout through `/dev/fd/N`.
    Input(Pipeline),
    /// The command writes into the pipeline's stdin through `/dev/fd/N`.
    Output(Pipeline),
}

impl Arg {
    pub fn input(pipeline: impl Into<Pipeline>) -> Self {
        Arg::Input(pipeline.into())
    }

    pub fn output(pipeline: impl Into<Pipeline>) -> Self {
        Arg::Output(pipeline.into())
    }
}

impl fmt::Display for Arg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arg::Text(text) => write!(f, "{text:?}"),
            Arg::Literal(text) => write!(f, "Lit({text:?})"),
            Arg::Keyword { name, value: None } => write!(f, "{name}=true"),
            Arg::Keyword {
                name,
                value: Some(value),
            } => write!(f, "{name}={value:?}"),
            Arg::Input(pipeline) => write!(f, "<({pipeline})"),
            Arg::Output(pipeline) => write!(f, ">({pipeline})"),
        }
    }
}

impl From<&str> for Arg {
    fn from(text: &str) -> Self {
        Arg::Text(text.to_string())
    }
}

impl From<String> for Arg {
    fn from(text: String) -> Self {
        Arg::Text(text)
    }
}

impl From<&String> for Arg {
    fn from(text: &String) -> Self {
        Arg::Text(text.clone())
    }
}

impl From<Lit> for Arg {
    fn from(lit: Lit) -> Self {
        Arg::Literal(lit.0)
    }
}

impl From<Pipeline> for Arg {
    fn from(pipeline: Pipeline) -> Self {
        Arg::Input(pipeline)
    }
}

impl From<Command> for Arg {
    fn from(command: Command) -> Self {
        Arg::Input(Pipeline::Command(command))
    }
}

macro_rules! impl_arg_from_number {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for Arg {
                fn from(value: $ty) -> Self {
                    Arg::Literal(value.to_string())
                }
            }
        )*
    };
}

impl_arg_from_number!(i32, i64, u32, u64, usize, f64);

/// An external program invocation.
///
/// ```ignore
/// let status = cmd("git").sub("status").arg("--short");
/// let listing = cmd("ls").arg("-l").arg("*.rs");
/// ```
#[derive(Clone)]
pub struct Command {
    name: Rc<str>,
    subs: Vec<String>,
    args: Vec<Arg>,
}

/// Start building a command.
pub fn cmd(name: &str) -> Command {
    Command::new(name)
}

impl Command {
    pub fn new(name: &str) -> Self {
        Self {
            name: Rc::from(name),
            subs: Vec::new(),
            args: Vec::new(),
        }
    }

    /// Subcommand word, as in `git status`. Never globbed.
    pub fn sub(mut self, name: &str) -> Self {
        self.subs.push(name.to_string());
        self
    }

    pub fn arg(mut self, arg: impl Into<Arg>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I>(mut self, args: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<Arg>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// `--name=value`
    pub fn kwarg(mut self, name: &str, value: impl ToString) -> Self {
        self.args.push(Arg::Keyword {
            name: name.to_string(),
            value: Some(value.to_string()),
        });
        self
    }

    /// `--name`
    pub fn flag(mut self, name: &str) -> Self {
        self.args.push(Arg::Keyword {
            name: name.to_string(),
            value: None,
        });
        self
    }

    /// Append an argument in place.
    pub fn push_arg(&mut self, arg: impl Into<Arg>) {
        self.args.push(arg.into());
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn subcommands(&self) -> &[String] {
        &self.subs
    }

    pub fn arguments(&self) -> &[Arg] {
        &self.args
    }

    /// True if both commands invoke the same program object.
    pub fn shares_program(&self, other: &Command) -> bool {
        Rc::ptr_eq(&self.name, &other.name)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        for sub in &self.subs {
            write!(f, ".{sub}")?;
        }
        let args: Vec<String> = self.args.iter().map(|a| a.to_string()).collect();
        write!(f, "({})", args.join(", "))
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Command({self})")
    }
}
