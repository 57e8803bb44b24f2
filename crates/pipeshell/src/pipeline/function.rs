//! In-process stages

use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use futures::StreamExt;

use crate::reactor::LineInput;
use crate::sequence;
use crate::sequence::IntoChunk;
use crate::sequence::Sequence;

/// Positional and keyword arguments handed to a stage body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageArgs {
    pub args: Vec<String>,
    pub kwargs: BTreeMap<String, String>,
}

impl StageArgs {
    pub fn get(&self, index: usize) -> Option<&str> {
        self.args.get(index).map(String::as_str)
    }

    pub fn kwarg(&self, name: &str) -> Option<&str> {
        self.kwargs.get(name).map(String::as_str)
    }
}

type FilterFn = dyn Fn(LineInput, StageArgs) -> Sequence;
type SourceFn = dyn Fn(StageArgs) -> Sequence;

/// Body of an in-process stage.
#[derive(Clone)]
pub enum FunctionBody {
    /// Consumes the stage's stdin as lines.
    Filter(Rc<FilterFn>),
    /// Produces output without reading stdin.
    Source(Rc<SourceFn>),
}

/// A stage running inside this process on the reactor.
///
/// The body is called once per run and returns a fresh `Sequence`, so
/// re-running the same node never shares iteration state.
#[derive(Clone)]
pub struct Function {
    name: Rc<str>,
    body: FunctionBody,
    args: StageArgs,
}

impl Function {
    /// Stage reading its stdin as lines.
    pub fn new<F>(name: &str, body: F) -> Self
    where
        F: Fn(LineInput, StageArgs) -> Sequence + 'static,
    {
        Self {
            name: Rc::from(name),
            body: FunctionBody::Filter(Rc::new(body)),
            args: StageArgs::default(),
        }
    }

    /// Stage producing output without input.
    pub fn source<F>(name: &str, body: F) -> Self
    where
        F: Fn(StageArgs) -> Sequence + 'static,
    {
        Self {
            name: Rc::from(name),
            body: FunctionBody::Source(Rc::new(body)),
            args: StageArgs::default(),
        }
    }

    /// Stage emitting a fixed list of items, one per line.
    pub fn lines<I>(items: I) -> Self
    where
        I: IntoIterator + Clone + 'static,
        I::Item: IntoChunk,
    {
        Self::source("lines", move |_| sequence::from_iter(items.clone()))
    }

    /// Per-line transform; `None` drops the line.
    pub fn map_lines<F>(name: &str, f: F) -> Self
    where
        F: Fn(String) -> Option<String> + 'static,
    {
        let f = Rc::new(f);
        Self::new(name, move |input, _| {
            let f = f.clone();
            sequence::from_stream(input.filter_map(move |line| futures::future::ready(f(line))))
        })
    }

    pub fn arg(mut self, arg: impl ToString) -> Self {
        self.args.args.push(arg.to_string());
        self
    }

    pub fn kwarg(mut self, name: &str, value: impl ToString) -> Self {
        self.args.kwargs.insert(name.to_string(), value.to_string());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn body(&self) -> &FunctionBody {
        &self.body
    }

    pub fn stage_args(&self) -> &StageArgs {
        &self.args
    }

    pub fn reads_input(&self) -> bool {
        matches!(self.body, FunctionBody::Filter(_))
    }
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts: Vec<String> = self.args.args.iter().map(|a| format!("{a:?}")).collect();
        parts.extend(self.args.kwargs.iter().map(|(k, v)| format!("{k}={v:?}")));
        write!(f, "{}({})", self.name, parts.join(", "))
    }
}

impl fmt::Debug for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Function({self})")
    }
}
