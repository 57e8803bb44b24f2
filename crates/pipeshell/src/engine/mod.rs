//! Execution engine
//!
//! `run` turns a pipeline tree into running stages:
//! 1. the overrides are merged over the environment's default redirects
//! 2. the tree is cloned so the caller's value is never touched
//! 3. every node is started with a redirect set threaded top-down
//! 4. the flat item list becomes a `RunningPipeline` in the job table
//!
//! Descriptor ownership: a node never closes the set it was handed. It
//! hands its children borrowed copies plus the ends it created itself,
//! and closes those ends once the children have taken them over.
//!
//! Pending sources are resolved where they belong: anonymous pipes at the
//! top of the run or at the `Redirected` node that declares them (the
//! parent's end becomes a pipeline stream), TMP and STRING files per
//! stage (each stage gets its own file).

pub mod job;
pub mod running;
mod spawn;

use std::collections::BTreeMap;
use std::os::fd::RawFd;
use std::path::Path;
use std::path::PathBuf;
use std::rc::Rc;

use nix::fcntl::OFlag;
use nix::sys::stat::Mode;

pub use job::JobId;
pub use job::JobState;
pub use job::JobTable;
pub use job::PipelineBytes;
pub use job::PipelineLines;
pub use job::RunningPipeline;
pub use running::ItemKind;
pub use running::RunningFunction;
pub use running::RunningItem;
pub use running::RunningProcess;
pub use running::StartFailure;

use job::PipelineParts;
use job::RunNode;
use running::ChangeNotify;
use running::ItemOutputs;
use spawn::SpawnPlan;

use crate::environment::Environment;
use crate::error::ShellError;
use crate::pipeline::Arg;
use crate::pipeline::Command;
use crate::pipeline::Function;
use crate::pipeline::FunctionBody;
use crate::pipeline::Pipeline;
use crate::plumbing::fd;
use crate::plumbing::PipeHandle;
use crate::plumbing::Redirect;
use crate::plumbing::RedirectSet;
use crate::plumbing::Source;
use crate::reactor::ChildEvent;
use crate::reactor::LineInput;
use crate::reactor::OutputHandler;
use crate::reactor::OutputMode;
use crate::reactor::Reactor;

fn is_file_source(source: &Source) -> bool {
    matches!(source, Source::Temp | Source::Capture)
}

/// Start `node` and register the result in `jobs`.
pub(crate) fn run(
    reactor: &Reactor,
    env: &Environment,
    jobs: &JobTable,
    debug_fd: Option<RawFd>,
    node: &Pipeline,
    overrides: &RedirectSet,
) -> Result<RunningPipeline, ShellError> {
    let node = node.clone();
    let merged = env.redirects().borrowed().merge(overrides);

    let mut ctx = RunContext {
        reactor,
        env,
        debug_fd,
        notify: Rc::new(ChangeNotify::default()),
        items: Vec::new(),
        streams: BTreeMap::new(),
    };

    let mut resolved = match ctx.resolve_pipes(&merged) {
        Ok(resolved) => resolved,
        Err(e) => {
            let mut merged = merged;
            merged.close_source_fds();
            return Err(e);
        }
    };
    let root = ctx.run_node(&node, &resolved);
    resolved.close_source_fds();

    let root = match root {
        Ok(root) => root,
        Err(e) => {
            ctx.abandon();
            return Err(e);
        }
    };

    let pipeline = RunningPipeline::new(PipelineParts {
        id: jobs.next_id(),
        description: node.to_string(),
        cwd: env.cwd().to_path_buf(),
        root,
        items: ctx.items,
        streams: ctx.streams,
        notify: ctx.notify,
        reactor: reactor.clone(),
    });
    jobs.insert(pipeline.clone());
    Ok(pipeline)
}

struct RunContext<'a> {
    reactor: &'a Reactor,
    env: &'a Environment,
    debug_fd: Option<RawFd>,
    notify: Rc<ChangeNotify>,
    items: Vec<Rc<RunningItem>>,
    streams: BTreeMap<RawFd, RawFd>,
}

impl RunContext<'_> {
    fn run_node(&mut self, node: &Pipeline, redirects: &RedirectSet) -> Result<RunNode, ShellError> {
        match node {
            Pipeline::Command(command) => self.run_command(command, redirects),
            Pipeline::Function(function) => self.run_function(function, redirects),
            Pipeline::Pipe(src, dst) => self.run_pipe(src, dst, redirects),
            Pipeline::Group(a, b) => {
                let shared = redirects.borrowed();
                let a = self.run_node(a, &shared)?;
                let b = self.run_node(b, &shared)?;
                Ok(RunNode::Group(Box::new(a), Box::new(b)))
            }
            Pipeline::Redirected(inner, overrides) => {
                let merged = redirects.borrowed().merge(&overrides.borrowed());
                let mut resolved = self.resolve_pipes(&merged)?;
                let result = self.run_node(inner, &resolved);
                resolved.close_source_fds();
                Ok(RunNode::Redirected(Box::new(result?), overrides.to_string()))
            }
        }
    }

    fn run_pipe(
        &mut self,
        src: &Pipeline,
        dst: &Pipeline,
        redirects: &RedirectSet,
    ) -> Result<RunNode, ShellError> {
        let (r, w) = fd::pipe_cloexec().map_err(|e| ShellError::pipe_failed(e.desc()))?;
        let mut src_set = redirects.borrowed().with(Redirect::owned_fd(1, w));
        let mut dst_set = redirects.borrowed().with(Redirect::owned_fd(0, r));

        let result = self.run_node(src, &src_set).and_then(|a| {
            let b = self.run_node(dst, &dst_set)?;
            Ok(RunNode::Pipe(Box::new(a), Box::new(b)))
        });
        src_set.close_source_fds();
        dst_set.close_source_fds();
        result
    }

    /// Resolve the anonymous pipes of `set`; their parent ends become
    /// streams of the pipeline.
    fn resolve_pipes(&mut self, set: &RedirectSet) -> Result<RedirectSet, ShellError> {
        let resolved = set.make_pipes_matching(|source| *source == Source::Pipe)?;
        for (target, handle) in resolved.pipe_handles() {
            if let PipeHandle::Fd(parent) = handle {
                if set.get(target).is_some_and(|r| *r.source() == Source::Pipe) {
                    tracing::debug!(target: "pipeshell::cmd", stream = target, fd = *parent, "pipeline stream");
                    if let Some(previous) = self.streams.insert(target, *parent) {
                        let _ = fd::close_fd(previous);
                    }
                }
            }
        }
        Ok(resolved)
    }

    // ========================================================================
    // Commands
    // ========================================================================

    fn run_command(&mut self, command: &Command, redirects: &RedirectSet) -> Result<RunNode, ShellError> {
        let mut set = redirects.borrowed();
        let result = self.spawn_command(command, &mut set);
        set.close_source_fds();
        result
    }

    fn spawn_command(&mut self, command: &Command, set: &mut RedirectSet) -> Result<RunNode, ShellError> {
        let mut argv = vec![command.name().to_string()];
        argv.extend(command.subcommands().iter().cloned());
        for arg in command.arguments() {
            match arg {
                Arg::Text(text) => argv.extend(self.env.expand_argument(text)?),
                Arg::Literal(text) => argv.push(text.clone()),
                Arg::Keyword {
                    name,
                    value: Some(value),
                } => argv.push(format!("--{name}={value}")),
                Arg::Keyword { name, value: None } => argv.push(format!("--{name}")),
                Arg::Input(pipeline) => argv.push(self.substitute(pipeline, set, true)?),
                Arg::Output(pipeline) => argv.push(self.substitute(pipeline, set, false)?),
            }
        }

        let mut resolved = set.make_pipes_matching(is_file_source)?;
        // `resolved` owns everything `set` owned from here on.
        *set = set.borrowed();

        let program = self
            .env
            .resolve_program(command.name())
            .unwrap_or_else(|| PathBuf::from(command.name()));
        let spawned = SpawnPlan::new(
            &program,
            &argv,
            self.env.exports(),
            self.env.cwd(),
            &resolved,
            self.debug_fd,
        )
        .and_then(SpawnPlan::spawn);
        resolved.close_source_fds();

        let spawned = match spawned {
            Ok(spawned) => spawned,
            Err(e) => {
                ItemOutputs::discard(&resolved);
                return Err(e);
            }
        };
        let pid = spawned.pid;
        tracing::debug!(
            target: "pipeshell::cmd",
            pid = pid.as_raw(),
            program = %program.display(),
            redirects = %resolved,
            "spawned {command}"
        );

        let item = Rc::new(
            RunningItem::process(command.to_string(), pid, ItemOutputs::from_set(&resolved))
                .with_start_failure(spawned.failure),
        );
        let watched = item.clone();
        let notify = self.notify.clone();
        self.reactor.watch_child(
            pid,
            Rc::new(move |event: &ChildEvent| {
                watched.on_child_event(event);
                notify.notify();
            }),
        );
        Ok(self.push_item(item))
    }

    /// Start a process-substitution pipeline and map its pipe end into
    /// `set` at a free index. Returns the `/dev/fd/N` path for argv.
    fn substitute(
        &mut self,
        pipeline: &Pipeline,
        set: &mut RedirectSet,
        command_reads: bool,
    ) -> Result<String, ShellError> {
        let index = set.find_free_fd();
        let (r, w) = fd::pipe_cloexec().map_err(|e| ShellError::pipe_failed(e.desc()))?;
        let (mine, theirs) = if command_reads {
            (
                Redirect::with_flags(index, Source::Fd { fd: r, borrowed: false }, OFlag::O_RDONLY),
                Redirect::owned_fd(1, w),
            )
        } else {
            (Redirect::owned_fd(index, w), Redirect::owned_fd(0, r))
        };
        set.register(mine);

        let mut sub_set = self.env.redirects().borrowed().with(theirs);
        let result = self.run_node(pipeline, &sub_set);
        sub_set.close_source_fds();
        result?;
        Ok(format!("/dev/fd/{index}"))
    }

    // ========================================================================
    // Functions
    // ========================================================================

    fn run_function(&mut self, function: &Function, redirects: &RedirectSet) -> Result<RunNode, ShellError> {
        let mut resolved = redirects.borrowed().make_pipes_matching(is_file_source)?;
        let result = self.start_function(function, &resolved);
        resolved.close_source_fds();
        if result.is_err() {
            ItemOutputs::discard(&resolved);
        }
        result
    }

    fn start_function(&mut self, function: &Function, set: &RedirectSet) -> Result<RunNode, ShellError> {
        let out_fd = stage_fd(set.stdout(), OFlag::O_WRONLY)?;
        let sequence = match function.body() {
            FunctionBody::Filter(body) => {
                let in_fd = match stage_fd(set.stdin(), OFlag::O_RDONLY) {
                    Ok(fd) => fd,
                    Err(e) => {
                        let _ = fd::close_fd(out_fd);
                        return Err(e);
                    }
                };
                body(LineInput::new(self.reactor, in_fd), function.stage_args().clone())
            }
            FunctionBody::Source(body) => body(function.stage_args().clone()),
        };

        let item = Rc::new(RunningItem::function(
            function.to_string(),
            ItemOutputs::from_set(set),
        ));
        let handler = OutputHandler::start(self.reactor, out_fd, sequence, OutputMode::Lines);
        tracing::debug!(target: "pipeshell::cmd", fd = out_fd, "started {function}");

        let watched = item.clone();
        let notify = self.notify.clone();
        handler.on_finish(move |error| {
            watched.on_function_finished(error);
            notify.notify();
        });
        Ok(self.push_item(item))
    }

    fn push_item(&mut self, item: Rc<RunningItem>) -> RunNode {
        self.items.push(item);
        RunNode::Item(self.items.len() - 1)
    }

    /// Give up on a run that failed to start. Started stages keep running
    /// and are still reaped.
    fn abandon(&mut self) {
        tracing::warn!(target: "pipeshell::cmd", started = self.items.len(), "run aborted");
        for (_, fd) in std::mem::take(&mut self.streams) {
            let _ = fd::close_fd(fd);
        }
    }
}

/// Private descriptor of a function stage for one stream: a duplicate of
/// the mapped descriptor, the mapped path opened, or `/dev/null`.
fn stage_fd(redirect: Option<&Redirect>, default_flags: OFlag) -> Result<RawFd, ShellError> {
    let Some(redirect) = redirect else {
        return Ok(fd::open_path(Path::new("/dev/null"), default_flags, Mode::empty())?);
    };
    match redirect.source() {
        Source::Fd { fd, .. } => Ok(fd::dup_cloexec(*fd)?),
        Source::Path(path) => fd::open_path(path, redirect.flags(), redirect.mode())
            .map_err(|e| ShellError::redirect_failed(format!("{}: {e}", path.display()))),
        other => Err(ShellError::redirect_failed(format!(
            "unresolved source {other} for {}",
            redirect.target()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use nix::sys::signal::kill;
    use nix::sys::signal::Signal;

    use super::*;
    use crate::config::EngineConfig;
    use crate::error::PipelineError;
    use crate::pipeline::cmd;
    use crate::pipeline::Lit;
    use crate::sequence;

    struct Fixture {
        dir: tempfile::TempDir,
        reactor: Reactor,
        env: Environment,
        jobs: JobTable,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let root = std::fs::canonicalize(dir.path()).unwrap();
            Self {
                dir,
                reactor: Reactor::new(&EngineConfig::default(), false).unwrap(),
                env: Environment::new(root).with_var("PATH", "/usr/bin:/bin"),
                jobs: JobTable::new(),
            }
        }

        fn path(&self, name: &str) -> PathBuf {
            self.env.cwd().join(name)
        }

        fn start(&self, pipeline: impl Into<Pipeline>, overrides: RedirectSet) -> RunningPipeline {
            run(&self.reactor, &self.env, &self.jobs, None, &pipeline.into(), &overrides).unwrap()
        }

        fn output(&self, pipeline: impl Into<Pipeline>) -> String {
            self.start(pipeline, Redirect::pipe(1).into()).output().unwrap()
        }
    }

    fn sh(script: &str) -> Command {
        cmd("sh").arg("-c").arg(Lit::new(script))
    }

    #[test]
    fn test_function_filter_between_functions() {
        let fx = Fixture::new();
        let grep = Function::map_lines("grep", |line: String| line.contains("hel").then_some(line));
        let running = fx.start(Function::lines(vec!["hello", "world"]) | grep, Redirect::pipe(1).into());
        let lines: Vec<String> = running.lines().unwrap().map(|l| l.unwrap()).collect();
        assert_eq!(lines, vec!["hello".to_string()]);
        assert!(running.is_finished());
        assert_eq!(running.exit_code(), Some(0));
    }

    #[test]
    fn test_function_feeds_process() {
        let fx = Fixture::new();
        let out = fx.output(Function::lines(vec!["b", "c", "a"]) | cmd("sort"));
        assert_eq!(out, "a\nb\nc\n");
    }

    #[test]
    fn test_missing_program_fails_with_exec_failed() {
        let fx = Fixture::new();
        let running = fx.start(cmd("pipeshell-no-such-program"), RedirectSet::empty());
        let err = running.join().unwrap_err();
        let PipelineError::Failed(report) = err else {
            panic!("unexpected {err:?}");
        };
        assert_eq!(report.items.len(), 1);
        assert!(report.items[0].status.contains("(exec failed: "));
        assert_eq!(
            running.items()[0].start_failure(),
            Some(StartFailure::Exec(nix::errno::Errno::ENOENT))
        );
        assert_eq!(running.exit_code(), Some(127));
    }

    #[test]
    fn test_program_exiting_127_is_a_plain_exit() {
        let fx = Fixture::new();
        let running = fx.start(sh("exit 127"), RedirectSet::empty());
        let report = running.join().unwrap_err().report().cloned().unwrap();
        assert!(report.items[0].failed);
        assert!(report.items[0].status.ends_with("(exit_code=127)"));
        assert!(!report.items[0].status.contains("exec failed"));
        assert_eq!(running.items()[0].start_failure(), None);
        assert_eq!(running.exit_code(), Some(127));
    }

    #[test]
    fn test_failing_stage_is_identified() {
        let fx = Fixture::new();
        let p = cmd("echo").arg("x") | sh("cat >/dev/null; exit 3") | cmd("cat");
        let running = fx.start(p, Redirect::null(1).into());
        let err = running.join().unwrap_err();
        assert!(err.is_failure());
        let failed: Vec<_> = err.report().unwrap().items.iter().filter(|i| i.failed).collect();
        assert_eq!(failed.len(), 1);
        assert!(failed[0].stage.starts_with("sh("));
        assert!(failed[0].status.ends_with("(exit_code=3)"));
        assert_eq!(running.exit_code(), Some(0));
    }

    #[test]
    fn test_capture_stderr_after_success() {
        let fx = Fixture::new();
        let p = Pipeline::from(sh("echo warn >&2")).capture_stderr();
        let running = fx.start(p, RedirectSet::empty());
        running.join().unwrap();
        assert_eq!(running.captured(2).as_deref(), Some("warn\n"));
        assert_eq!(
            running.report().items[0].captured,
            vec![("stderr".to_string(), "warn\n".to_string())]
        );
    }

    #[test]
    fn test_failing_generator_reports_exception() {
        let fx = Fixture::new();
        let boom = Function::source("boom", |_| {
            sequence::try_from_iter(vec![Ok("first"), Err(anyhow::anyhow!("no more data"))])
        });
        let running = fx.start(boom | cmd("cat"), Redirect::null(1).into());
        let err = running.join().unwrap_err();
        let report = err.report().unwrap();
        assert!(report.items[0].failed);
        assert_eq!(report.items[0].status, "exception: no more data");
        assert!(!report.items[1].failed);
    }

    #[test]
    fn test_sigpipe_death_fails_the_pipeline() {
        let fx = Fixture::new();
        let running = fx.start(sh("kill -PIPE $$"), RedirectSet::empty());
        let err = running.join().unwrap_err();
        assert!(matches!(err, PipelineError::Failed(_)));
        assert!(err.report().unwrap().items[0].failed);
        assert_eq!(running.exit_code(), Some(128 + Signal::SIGPIPE as i32));
    }

    #[test]
    fn test_killed_process_exit_code() {
        let fx = Fixture::new();
        let running = fx.start(sh("kill -TERM $$"), RedirectSet::empty());
        assert!(running.join().unwrap_err().is_failure());
        assert_eq!(running.exit_code(), Some(128 + Signal::SIGTERM as i32));
    }

    #[test]
    fn test_stopped_process_suspends_then_restarts() {
        let fx = Fixture::new();
        let running = fx.start(cmd("sleep").arg("1"), RedirectSet::empty());
        let pid = running.items()[0].pid().unwrap();
        kill(pid, Signal::SIGSTOP).unwrap();

        let err = running.join().unwrap_err();
        assert!(err.is_suspended());
        assert_eq!(running.state(), JobState::Suspended);

        running.restart().unwrap();
        assert_eq!(running.state(), JobState::Running);
        running.join().unwrap();
        assert_eq!(running.state(), JobState::Finished);
    }

    #[test]
    fn test_join_resumes_self_stopped_pipeline() {
        let fx = Fixture::new();
        let running = fx.start(sh("sleep 0.2; kill -STOP $$; echo resumed"), Redirect::pipe(1).into());

        let err = running.join().unwrap_err();
        assert!(err.is_suspended());
        assert_eq!(running.state(), JobState::Suspended);

        running.join().unwrap();
        assert_eq!(running.state(), JobState::Finished);
        assert_eq!(running.output().unwrap(), "resumed\n");
    }

    #[test]
    fn test_join_resumes_suspended_pipeline() {
        let fx = Fixture::new();
        let running = fx.start(cmd("sleep").arg("0.2"), RedirectSet::empty());
        running.suspend().unwrap();
        assert_eq!(running.state(), JobState::Suspended);

        running.join().unwrap();
        assert_eq!(running.state(), JobState::Finished);
        assert_eq!(running.exit_code(), Some(0));
    }

    #[test]
    fn test_interrupt_leaves_items_running() {
        let fx = Fixture::new();
        let running = fx.start(cmd("sleep").arg("0.2"), RedirectSet::empty());
        running.interrupt();
        assert!(running.join().unwrap_err().is_interrupted());
        assert!(!running.is_finished());
        running.join().unwrap();
    }

    #[test]
    fn test_group_shares_stdout() {
        let fx = Fixture::new();
        let out = fx.output(cmd("echo").arg("a") + cmd("echo").arg("b"));
        let mut lines: Vec<&str> = out.lines().collect();
        lines.sort();
        assert_eq!(lines, vec!["a", "b"]);
    }

    #[test]
    fn test_group_member_exit_keeps_shared_stdout_open() {
        let fx = Fixture::new();
        let out = fx.output(cmd("true") + sh("sleep 0.2; echo late"));
        assert_eq!(out, "late\n");
    }

    #[test]
    fn test_rerun_is_independent() {
        let fx = Fixture::new();
        let p = Function::lines(vec!["one", "two"]) | cmd("cat");
        assert_eq!(fx.output(p.clone()), "one\ntwo\n");
        assert_eq!(fx.output(p), "one\ntwo\n");
        assert_eq!(fx.jobs.len(), 2);
    }

    #[test]
    fn test_temp_output_files() {
        let fx = Fixture::new();
        let p = Pipeline::from(cmd("echo").arg("t")).redirect(Redirect::temp(1));
        let running = fx.start(p, RedirectSet::empty());
        running.join().unwrap();

        let files = running.output_files();
        assert_eq!(files.len(), 1);
        assert_eq!(std::fs::read_to_string(&files[0]).unwrap(), "t\n");
        assert!(running.remove_output_files());
        assert!(!running.remove_output_files());
        assert!(!files[0].exists());
        assert!(running.output_files().is_empty());
    }

    #[test]
    fn test_file_redirects() {
        let fx = Fixture::new();
        let out = fx.path("out.txt");
        fx.start(cmd("echo").arg("file") | out.clone(), RedirectSet::empty())
            .join()
            .unwrap();
        assert_eq!(std::fs::read_to_string(&out).unwrap(), "file\n");

        let copied = fx.output(Pipeline::from(cmd("cat")).stdin_from(out));
        assert_eq!(copied, "file\n");
    }

    #[test]
    fn test_input_substitution() {
        let fx = Fixture::new();
        let p = cmd("cat").arg(Arg::input(cmd("echo").arg("sub")));
        assert_eq!(fx.output(p), "sub\n");
    }

    #[test]
    fn test_output_substitution() {
        let fx = Fixture::new();
        let sink = Pipeline::from(cmd("cat")).stdout_to(fx.path("sub.txt"));
        let p = cmd("echo").arg("sub") | cmd("tee").arg(Arg::output(sink));
        let running = fx.start(p, Redirect::null(1).into());
        running.join().unwrap();

        let items = running.items();
        assert_eq!(items.len(), 3);
        assert!(items.iter().all(|item| item.is_finished() && !item.failed()));
        assert_eq!(std::fs::read_to_string(fx.path("sub.txt")).unwrap(), "sub\n");
    }

    #[test]
    fn test_bad_glob_is_rejected_before_spawn() {
        let fx = Fixture::new();
        let res = run(
            &fx.reactor,
            &fx.env,
            &fx.jobs,
            None,
            &Pipeline::from(cmd("echo").arg("a[")),
            &RedirectSet::empty(),
        );
        let err = res.err().unwrap();
        assert_eq!(err.code(), crate::error::ShellErrorCode::Glob);
    }

    #[test]
    fn test_arguments_expand_globs() {
        let fx = Fixture::new();
        std::fs::write(fx.path("b.txt"), "").unwrap();
        std::fs::write(fx.path("a.txt"), "").unwrap();
        let out = fx.output(cmd("echo").arg("*.txt").arg(Lit::new("*.txt")));
        assert_eq!(out, "a.txt b.txt *.txt\n");
    }

    #[test]
    fn test_unpiped_stdout_has_no_lines() {
        let fx = Fixture::new();
        let running = fx.start(cmd("true"), RedirectSet::empty());
        assert!(running.lines().is_err());
        running.join().unwrap();
        assert!(fx.dir.path().exists());
    }
}
