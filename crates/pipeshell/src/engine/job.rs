//! Running pipelines and the job table
//!
//! This module provides:
//! - `RunningPipeline` - the items of one run plus join and job control
//! - `JobTable` - registry of pipelines that have not finished yet
//! - `PipelineLines`/`PipelineBytes` - blocking iterators over stdout
//!
//! A pipeline moves Running -> Suspended -> Running -> Finished. Suspend
//! and restart always apply to every item of the pipeline.

use std::cell::Cell;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::os::fd::RawFd;
use std::path::PathBuf;
use std::rc::Rc;
use std::task::Context;
use std::task::Poll;

use futures::StreamExt;

use super::running::ChangeNotify;
use super::running::RunningItem;
use crate::error::PipelineError;
use crate::error::PipelineReport;
use crate::error::ShellError;
use crate::plumbing::fd;
use crate::plumbing::Stream;
use crate::reactor::ByteInput;
use crate::reactor::LineInput;
use crate::reactor::Reactor;

// ============================================================================
// Identifiers and State
// ============================================================================

/// Job number of a pipeline inside its shell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct JobId(pub u32);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Running,
    Suspended,
    Finished,
}

/// Shape of the run, with stages replaced by item indices.
#[derive(Debug, Clone)]
pub(crate) enum RunNode {
    Item(usize),
    Pipe(Box<RunNode>, Box<RunNode>),
    Group(Box<RunNode>, Box<RunNode>),
    Redirected(Box<RunNode>, String),
}

impl RunNode {
    fn render(&self, items: &[Rc<RunningItem>], f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunNode::Item(index) => match items.get(*index) {
                Some(item) => write!(f, "{item}"),
                None => write!(f, "?"),
            },
            RunNode::Pipe(src, dst) => {
                src.render_wrapped(items, f)?;
                write!(f, " | ")?;
                dst.render_wrapped(items, f)
            }
            RunNode::Group(a, b) => {
                a.render(items, f)?;
                write!(f, " + ")?;
                b.render(items, f)
            }
            RunNode::Redirected(inner, redirects) => {
                if matches!(**inner, RunNode::Item(_)) {
                    inner.render(items, f)?;
                } else {
                    write!(f, "(")?;
                    inner.render(items, f)?;
                    write!(f, ")")?;
                }
                write!(f, " with {redirects}")
            }
        }
    }

    fn render_wrapped(&self, items: &[Rc<RunningItem>], f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if matches!(self, RunNode::Group(..)) {
            write!(f, "(")?;
            self.render(items, f)?;
            write!(f, ")")
        } else {
            self.render(items, f)
        }
    }
}

// ============================================================================
// Running Pipeline
// ============================================================================

struct PipelineInner {
    id: JobId,
    description: String,
    cwd: PathBuf,
    root: RunNode,
    items: Vec<Rc<RunningItem>>,
    /// Parent ends of pipes requested at the top of the run, by stream.
    streams: RefCell<BTreeMap<RawFd, RawFd>>,
    notify: Rc<ChangeNotify>,
    state: Cell<JobState>,
    interrupt: Cell<bool>,
    suspend_requested: Cell<bool>,
    reactor: Reactor,
}

impl Drop for PipelineInner {
    fn drop(&mut self) {
        for (_, fd) in std::mem::take(&mut *self.streams.borrow_mut()) {
            let _ = fd::close_fd(fd);
        }
    }
}

/// Handle to all stages started by one run. Cheap to clone.
#[derive(Clone)]
pub struct RunningPipeline {
    inner: Rc<PipelineInner>,
}

pub(crate) struct PipelineParts {
    pub(crate) id: JobId,
    pub(crate) description: String,
    pub(crate) cwd: PathBuf,
    pub(crate) root: RunNode,
    pub(crate) items: Vec<Rc<RunningItem>>,
    pub(crate) streams: BTreeMap<RawFd, RawFd>,
    pub(crate) notify: Rc<ChangeNotify>,
    pub(crate) reactor: Reactor,
}

impl RunningPipeline {
    pub(crate) fn new(parts: PipelineParts) -> Self {
        tracing::debug!(
            target: "pipeshell::job",
            id = %parts.id,
            items = parts.items.len(),
            pipeline = %parts.description,
            "started"
        );
        Self {
            inner: Rc::new(PipelineInner {
                id: parts.id,
                description: parts.description,
                cwd: parts.cwd,
                root: parts.root,
                items: parts.items,
                streams: RefCell::new(parts.streams),
                notify: parts.notify,
                state: Cell::new(JobState::Running),
                interrupt: Cell::new(false),
                suspend_requested: Cell::new(false),
                reactor: parts.reactor,
            }),
        }
    }

    pub fn id(&self) -> JobId {
        self.inner.id
    }

    /// Description of the pipeline that was run.
    pub fn description(&self) -> &str {
        &self.inner.description
    }

    pub fn cwd(&self) -> &std::path::Path {
        &self.inner.cwd
    }

    pub fn items(&self) -> &[Rc<RunningItem>] {
        &self.inner.items
    }

    pub fn state(&self) -> JobState {
        if self.is_finished() {
            JobState::Finished
        } else {
            self.inner.state.get()
        }
    }

    pub fn is_finished(&self) -> bool {
        self.inner.items.iter().all(|item| item.is_finished())
    }

    /// True if any finished item failed.
    pub fn failed(&self) -> bool {
        self.inner.items.iter().any(|item| item.failed())
    }

    pub fn same_job(&self, other: &RunningPipeline) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// Make the current or next `wait` return `Interrupted`. Items are
    /// left alone.
    pub fn interrupt(&self) {
        tracing::debug!(target: "pipeshell::job", id = %self.inner.id, "interrupt requested");
        self.inner.interrupt.set(true);
        self.inner.notify.notify();
    }

    /// Make the current or next `wait` suspend the pipeline.
    pub fn request_suspend(&self) {
        tracing::debug!(target: "pipeshell::job", id = %self.inner.id, "suspend requested");
        self.inner.suspend_requested.set(true);
        self.inner.notify.notify();
    }

    /// Stop every item.
    pub fn suspend(&self) -> Result<(), ShellError> {
        if self.is_finished() {
            return Ok(());
        }
        self.inner.state.set(JobState::Suspended);
        tracing::info!(target: "pipeshell::job", id = %self.inner.id, "suspended");
        self.inner.items.iter().try_for_each(|item| item.suspend())
    }

    /// Continue every item.
    pub fn restart(&self) -> Result<(), ShellError> {
        if self.is_finished() {
            return Ok(());
        }
        self.inner.state.set(JobState::Running);
        tracing::info!(target: "pipeshell::job", id = %self.inner.id, "restarted");
        self.inner.items.iter().try_for_each(|item| item.restart())
    }

    fn poll_wait(&self, cx: &mut Context<'_>) -> Poll<Result<(), PipelineError>> {
        let inner = &self.inner;
        if inner.interrupt.replace(false) {
            tracing::info!(target: "pipeshell::job", id = %inner.id, "interrupted");
            return Poll::Ready(Err(PipelineError::Interrupted(self.report())));
        }

        let finished = self.is_finished();
        let stopped = inner.items.iter().any(|item| item.is_stopped());
        if !finished && (inner.suspend_requested.replace(false) || stopped) {
            if let Err(e) = self.suspend() {
                return Poll::Ready(Err(e.into()));
            }
            return Poll::Ready(Err(PipelineError::Suspended(self.report())));
        }

        if finished {
            inner.state.set(JobState::Finished);
            if self.failed() {
                tracing::debug!(target: "pipeshell::job", id = %inner.id, "failed");
                return Poll::Ready(Err(PipelineError::Failed(self.report())));
            }
            tracing::debug!(target: "pipeshell::job", id = %inner.id, "finished");
            return Poll::Ready(Ok(()));
        }

        inner.notify.subscribe(cx.waker());
        Poll::Pending
    }

    /// Resolve once every item is terminal.
    ///
    /// A suspended pipeline is continued first. Returns `Suspended` when an
    /// item stops during the wait (after stopping the others),
    /// `Interrupted` when `interrupt` was called, and `Failed` with the
    /// report of every item when any of them failed.
    pub async fn wait(&self) -> Result<(), PipelineError> {
        let stopped = self.inner.items.iter().any(|item| item.is_stopped());
        if self.state() == JobState::Suspended || stopped {
            self.restart()?;
        }
        futures::future::poll_fn(|cx| self.poll_wait(cx)).await
    }

    /// Drive the reactor until `wait` resolves.
    pub fn join(&self) -> Result<(), PipelineError> {
        self.inner.reactor.block_on(self.wait())?
    }

    /// Take the parent's end of a pipe requested for `stream` at run time.
    pub fn take_stream(&self, stream: impl Into<Stream>) -> Option<RawFd> {
        self.inner.streams.borrow_mut().remove(&stream.into().fd())
    }

    /// Async stream of stdout lines. Requires the run to pipe stdout.
    pub fn line_stream(&self) -> Result<LineInput, ShellError> {
        self.take_stream(Stream::STDOUT)
            .map(|fd| LineInput::new(&self.inner.reactor, fd))
            .ok_or_else(|| self.not_piped())
    }

    /// Blocking iterator over stdout lines; fails like `join` at the end.
    pub fn lines(&self) -> Result<PipelineLines, ShellError> {
        Ok(PipelineLines {
            input: Some(self.line_stream()?),
            pipeline: self.clone(),
            done: false,
        })
    }

    /// Blocking iterator over stdout chunks; fails like `join` at the end.
    pub fn bytes(&self) -> Result<PipelineBytes, ShellError> {
        let fd = self.take_stream(Stream::STDOUT).ok_or_else(|| self.not_piped())?;
        Ok(PipelineBytes {
            input: Some(ByteInput::new(&self.inner.reactor, fd)),
            pipeline: self.clone(),
            done: false,
        })
    }

    /// Whole stdout as a string, after a successful join.
    pub fn output(&self) -> Result<String, PipelineError> {
        let mut data = Vec::new();
        for chunk in self.bytes()? {
            data.extend(chunk?);
        }
        Ok(String::from_utf8_lossy(&data).into_owned())
    }

    fn not_piped(&self) -> ShellError {
        ShellError::not_captured(format!("stdout of {} is not piped", self.inner.description))
    }

    /// Exit code of the last item.
    pub fn exit_code(&self) -> Option<i32> {
        self.inner.items.last().and_then(|item| item.exit_code())
    }

    /// TMP files written by the stages.
    pub fn output_files(&self) -> Vec<PathBuf> {
        self.inner
            .items
            .iter()
            .flat_map(|item| item.output_files())
            .collect()
    }

    /// Delete all TMP files. Returns false if nothing was left to delete.
    pub fn remove_output_files(&self) -> bool {
        self.inner
            .items
            .iter()
            .fold(false, |any, item| item.remove_output_files() || any)
    }

    /// STRING capture of `stream`, joined over every item that has one.
    pub fn captured(&self, stream: impl Into<Stream>) -> Option<String> {
        let stream = stream.into();
        let parts: Vec<String> = self
            .inner
            .items
            .iter()
            .filter_map(|item| item.captured(stream))
            .collect();
        if parts.is_empty() {
            None
        } else {
            Some(parts.concat())
        }
    }

    pub fn report(&self) -> PipelineReport {
        PipelineReport {
            pipeline: self.inner.description.clone(),
            items: self.inner.items.iter().map(|item| item.report()).collect(),
        }
    }
}

impl fmt::Display for RunningPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.inner.root.render(&self.inner.items, f)
    }
}

impl fmt::Debug for RunningPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RunningPipeline({} {self})", self.inner.id)
    }
}

// ============================================================================
// Output Iterators
// ============================================================================

/// Stdout lines of a running pipeline. Yields the join error, if any, as
/// the last item.
pub struct PipelineLines {
    pipeline: RunningPipeline,
    input: Option<LineInput>,
    done: bool,
}

impl PipelineLines {
    pub fn pipeline(&self) -> &RunningPipeline {
        &self.pipeline
    }
}

impl Iterator for PipelineLines {
    type Item = Result<String, PipelineError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if let Some(input) = self.input.as_mut() {
            match self.pipeline.inner.reactor.block_on(input.next()) {
                Ok(Some(line)) => return Some(Ok(line)),
                Ok(None) => self.input = None,
                Err(e) => {
                    self.done = true;
                    return Some(Err(e.into()));
                }
            }
        }
        self.done = true;
        self.pipeline.join().err().map(Err)
    }
}

/// Stdout chunks of a running pipeline.
pub struct PipelineBytes {
    pipeline: RunningPipeline,
    input: Option<ByteInput>,
    done: bool,
}

impl Iterator for PipelineBytes {
    type Item = Result<Vec<u8>, PipelineError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if let Some(input) = self.input.as_mut() {
            match self.pipeline.inner.reactor.block_on(input.next()) {
                Ok(Some(chunk)) => return Some(Ok(chunk)),
                Ok(None) => self.input = None,
                Err(e) => {
                    self.done = true;
                    return Some(Err(e.into()));
                }
            }
        }
        self.done = true;
        self.pipeline.join().err().map(Err)
    }
}

// ============================================================================
// Job Table
// ============================================================================

#[derive(Default)]
struct JobTableInner {
    next_id: u32,
    jobs: BTreeMap<JobId, RunningPipeline>,
    last: Option<RunningPipeline>,
}

/// Pipelines started by one shell that have not finished yet.
#[derive(Clone, Default)]
pub struct JobTable {
    inner: Rc<RefCell<JobTableInner>>,
}

impl JobTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn next_id(&self) -> JobId {
        let mut inner = self.inner.borrow_mut();
        inner.next_id += 1;
        JobId(inner.next_id)
    }

    pub(crate) fn insert(&self, pipeline: RunningPipeline) {
        let mut inner = self.inner.borrow_mut();
        inner.jobs.insert(pipeline.id(), pipeline.clone());
        inner.last = Some(pipeline);
    }

    /// Drop finished pipelines from the table.
    pub fn prune(&self) {
        let mut inner = self.inner.borrow_mut();
        inner.jobs.retain(|id, pipeline| {
            let keep = !pipeline.is_finished();
            if !keep {
                tracing::debug!(target: "pipeshell::job", id = %id, "left job table");
            }
            keep
        });
    }

    /// Unfinished pipelines, oldest first.
    pub fn active(&self) -> Vec<RunningPipeline> {
        self.prune();
        self.inner.borrow().jobs.values().cloned().collect()
    }

    pub fn get(&self, id: JobId) -> Option<RunningPipeline> {
        self.inner.borrow().jobs.get(&id).cloned()
    }

    pub fn remove(&self, id: JobId) -> Option<RunningPipeline> {
        self.inner.borrow_mut().jobs.remove(&id)
    }

    /// Most recently started pipeline, finished or not.
    pub fn last(&self) -> Option<RunningPipeline> {
        self.inner.borrow().last.clone()
    }

    pub fn len(&self) -> usize {
        self.inner.borrow().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.borrow().jobs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use nix::unistd::Pid;

    use super::super::running::ItemOutputs;
    use super::*;
    use crate::config::EngineConfig;
    use crate::reactor::ChildEvent;
    use crate::reactor::ChildEventKind;

    fn reactor() -> Reactor {
        Reactor::new(&EngineConfig::default(), false).unwrap()
    }

    fn exited(pid: i32, status: i32) -> ChildEvent {
        ChildEvent {
            pid: Pid::from_raw(pid),
            kind: ChildEventKind::Exited,
            status,
            signal: None,
        }
    }

    /// Pipeline over fake processes whose events the test feeds by hand.
    fn fake_pipeline(stages: &[&str]) -> RunningPipeline {
        let items: Vec<Rc<RunningItem>> = stages
            .iter()
            .enumerate()
            .map(|(i, stage)| {
                Rc::new(RunningItem::process(
                    stage.to_string(),
                    Pid::from_raw(1000 + i as i32),
                    ItemOutputs::default(),
                ))
            })
            .collect();
        let root = (1..items.len()).fold(RunNode::Item(0), |acc, i| {
            RunNode::Pipe(Box::new(acc), Box::new(RunNode::Item(i)))
        });
        RunningPipeline::new(PipelineParts {
            id: JobId(1),
            description: stages.join(" | "),
            cwd: PathBuf::from("/"),
            root,
            items,
            streams: BTreeMap::new(),
            notify: Rc::new(ChangeNotify::default()),
            reactor: reactor(),
        })
    }

    fn poll_once(pipeline: &RunningPipeline) -> Poll<Result<(), PipelineError>> {
        let waker = futures::task::noop_waker();
        let mut cx = Context::from_waker(&waker);
        pipeline.poll_wait(&mut cx)
    }

    #[test]
    fn test_failure_identifies_the_failing_stage() {
        let pipeline = fake_pipeline(&["a()", "b()", "c()"]);
        assert!(poll_once(&pipeline).is_pending());

        pipeline.items()[0].on_child_event(&exited(1000, 0));
        pipeline.items()[1].on_child_event(&exited(1001, 3));
        pipeline.items()[2].on_child_event(&exited(1002, 0));

        let Poll::Ready(Err(PipelineError::Failed(report))) = poll_once(&pipeline) else {
            panic!("expected failure");
        };
        let failed: Vec<&str> = report
            .items
            .iter()
            .filter(|i| i.failed)
            .map(|i| i.stage.as_str())
            .collect();
        assert_eq!(failed, vec!["b()"]);
        assert_eq!(report.items[0].status, "1000 (exit_code=0)");
        assert_eq!(report.items[1].status, "1001 (exit_code=3)");
        assert_eq!(report.items[2].status, "1002 (exit_code=0)");
        assert_eq!(pipeline.state(), JobState::Finished);
        assert_eq!(pipeline.exit_code(), Some(0));
    }

    #[test]
    fn test_interrupt_leaves_items_running() {
        let pipeline = fake_pipeline(&["a()"]);
        pipeline.interrupt();
        assert!(matches!(
            poll_once(&pipeline),
            Poll::Ready(Err(PipelineError::Interrupted(_)))
        ));
        assert_eq!(pipeline.state(), JobState::Running);
        // The request is consumed: waiting again blocks.
        assert!(poll_once(&pipeline).is_pending());
    }

    #[test]
    fn test_display_shows_item_status() {
        let pipeline = fake_pipeline(&["ls()", "wc()"]);
        pipeline.items()[0].on_child_event(&exited(1000, 0));
        assert_eq!(pipeline.to_string(), "ls() as 1000 (exit_code=0) | wc() as 1001");
    }

    #[test]
    fn test_job_table_prunes_finished() {
        let table = JobTable::new();
        let pipeline = fake_pipeline(&["a()"]);
        table.insert(pipeline.clone());
        assert_eq!(table.active().len(), 1);

        pipeline.items()[0].on_child_event(&exited(1000, 0));
        assert!(table.active().is_empty());
        assert!(table.last().is_some_and(|last| last.same_job(&pipeline)));
        assert_eq!(table.next_id(), JobId(1));
        assert_eq!(table.next_id(), JobId(2));
    }

    #[test]
    fn test_lines_requires_piped_stdout() {
        let pipeline = fake_pipeline(&["a()"]);
        assert!(pipeline.lines().is_err());
        assert!(pipeline.take_stream(1).is_none());
    }
}
