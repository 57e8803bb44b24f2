//! Execution context
//!
//! A `Shell` bundles what every run needs: the reactor of the current
//! thread, the environment and the job table. It is the entry point a
//! console front end talks to:
//! - `run` / `run_with` - start a pipeline in the background
//! - `run_interactive` - run in the foreground and wait
//! - `lines` / `output` - run with stdout piped back
//! - `display` - the REPL echo of a pipeline value

use std::cell::Cell;
use std::cell::Ref;
use std::cell::RefCell;
use std::cell::RefMut;
use std::path::Path;
use std::rc::Rc;

use nix::sys::signal::Signal;

use crate::config::ShellConfig;
use crate::engine;
use crate::engine::JobTable;
use crate::engine::PipelineLines;
use crate::engine::RunningPipeline;
use crate::environment::Environment;
use crate::error::PipelineError;
use crate::error::ShellError;
use crate::pipeline::Pipeline;
use crate::plumbing::Redirect;
use crate::plumbing::RedirectSet;
use crate::reactor::Reactor;

type Foreground = Rc<RefCell<Option<RunningPipeline>>>;

struct ShellInner {
    reactor: Reactor,
    env: RefCell<Environment>,
    jobs: JobTable,
    config: ShellConfig,
    /// Nesting of `display` calls; only the outermost one runs pipelines.
    display_depth: Cell<u32>,
    foreground: Foreground,
    signal_handlers: Vec<u64>,
}

impl Drop for ShellInner {
    fn drop(&mut self) {
        for id in &self.signal_handlers {
            self.reactor.signals().deregister(*id);
        }
    }
}

/// Runs pipelines for one thread. Cheap to clone; `!Send`.
#[derive(Clone)]
pub struct Shell {
    inner: Rc<ShellInner>,
}

impl Shell {
    /// Shell over the process environment with default settings.
    pub fn new() -> Result<Self, ShellError> {
        Self::from_config(ShellConfig::default())
    }

    pub fn from_config(config: ShellConfig) -> Result<Self, ShellError> {
        let env = Environment::from_config(&config.environment)?;
        Self::with_environment(env, config)
    }

    /// Shell over an explicit environment.
    pub fn with_environment(env: Environment, config: ShellConfig) -> Result<Self, ShellError> {
        let job_control = config.job_control();
        let reactor = Reactor::new(&config.engine, job_control)?;
        let foreground: Foreground = Rc::new(RefCell::new(None));

        let mut signal_handlers = Vec::new();
        if job_control {
            for signal in [Signal::SIGINT, Signal::SIGTSTP] {
                let foreground = foreground.clone();
                let id = reactor.signals().register(
                    signal,
                    Rc::new(move |signal: Signal| {
                        let Some(pipeline) = foreground.borrow().clone() else {
                            tracing::debug!(target: "pipeshell::job", signal = signal.as_str(), "no foreground job");
                            return;
                        };
                        if signal == Signal::SIGTSTP {
                            pipeline.request_suspend();
                        } else {
                            pipeline.interrupt();
                        }
                    }),
                );
                signal_handlers.push(id);
            }
        }

        tracing::debug!(target: "pipeshell::job", job_control, cwd = %env.cwd().display(), "shell ready");
        Ok(Self {
            inner: Rc::new(ShellInner {
                reactor,
                env: RefCell::new(env),
                jobs: JobTable::new(),
                config,
                display_depth: Cell::new(0),
                foreground,
                signal_handlers,
            }),
        })
    }

    pub fn reactor(&self) -> &Reactor {
        &self.inner.reactor
    }

    pub fn config(&self) -> &ShellConfig {
        &self.inner.config
    }

    pub fn env(&self) -> Ref<'_, Environment> {
        self.inner.env.borrow()
    }

    pub fn env_mut(&self) -> RefMut<'_, Environment> {
        self.inner.env.borrow_mut()
    }

    pub fn cd(&self, dir: impl AsRef<Path>) -> Result<(), ShellError> {
        self.inner.env.borrow_mut().cd(dir)
    }

    pub fn set_var(&self, name: &str, value: &str) {
        self.inner.env.borrow_mut().set_var(name, value);
    }

    // ========================================================================
    // Running
    // ========================================================================

    /// Start `pipeline` with the environment's default redirects.
    pub fn run(&self, pipeline: impl Into<Pipeline>) -> Result<RunningPipeline, ShellError> {
        self.run_with(pipeline, RedirectSet::empty())
    }

    /// Start `pipeline` with `overrides` merged over the default redirects.
    /// Owned descriptors in `overrides` are closed once the stages have
    /// taken them over.
    pub fn run_with(
        &self,
        pipeline: impl Into<Pipeline>,
        overrides: impl Into<RedirectSet>,
    ) -> Result<RunningPipeline, ShellError> {
        let pipeline = pipeline.into();
        self.inner.jobs.prune();
        let env = self.inner.env.borrow();
        engine::run(
            &self.inner.reactor,
            &env,
            &self.inner.jobs,
            self.inner.config.engine.debug_fd,
            &pipeline,
            &overrides.into(),
        )
    }

    /// Run in the foreground and wait. With job control, SIGINT and
    /// SIGTSTP end the wait with `Interrupted` or `Suspended`.
    pub fn run_interactive(&self, pipeline: impl Into<Pipeline>) -> Result<RunningPipeline, PipelineError> {
        let running = self.run(pipeline)?;
        self.foreground(&running)?;
        Ok(running)
    }

    /// Wait for `pipeline` as the foreground job.
    pub fn foreground(&self, pipeline: &RunningPipeline) -> Result<(), PipelineError> {
        let previous = self.inner.foreground.replace(Some(pipeline.clone()));
        let result = pipeline.join();
        *self.inner.foreground.borrow_mut() = previous;
        if pipeline.is_finished() {
            self.inner.jobs.remove(pipeline.id());
        }
        result
    }

    /// Run with stdout piped back and iterate over its lines.
    pub fn lines(&self, pipeline: impl Into<Pipeline>) -> Result<PipelineLines, ShellError> {
        self.run_with(pipeline, Redirect::pipe(1))?.lines()
    }

    /// Run with stdout piped back and return all of it.
    pub fn output(&self, pipeline: impl Into<Pipeline>) -> Result<String, PipelineError> {
        self.run_with(pipeline, Redirect::pipe(1))?.output()
    }

    /// Description of a pipeline as run in this shell.
    pub fn describe(&self, pipeline: &Pipeline) -> String {
        format!("{pipeline} in {}", self.inner.env.borrow())
    }

    /// REPL echo of a pipeline value.
    ///
    /// In an interactive environment the pipeline runs in the foreground
    /// (outermost call only) and its outcome is logged; the result is
    /// empty. Otherwise this is `describe`.
    pub fn display(&self, pipeline: &Pipeline) -> String {
        let interactive = self.inner.env.borrow().interactive();
        if !interactive || self.inner.display_depth.get() > 0 {
            return self.describe(pipeline);
        }

        self.inner.display_depth.set(self.inner.display_depth.get() + 1);
        let outcome = self.run_interactive(pipeline.clone());
        self.inner.display_depth.set(self.inner.display_depth.get() - 1);

        match outcome {
            Ok(_) => {}
            Err(PipelineError::Interrupted(report)) => {
                tracing::warn!(target: "pipeshell::job", pipeline = %report.pipeline, "interrupted");
            }
            Err(PipelineError::Suspended(report)) => {
                tracing::warn!(target: "pipeshell::job", pipeline = %report.pipeline, "suspended");
            }
            Err(e) => tracing::error!(target: "pipeshell::job", "{e}"),
        }
        String::new()
    }

    // ========================================================================
    // Jobs
    // ========================================================================

    pub fn jobs(&self) -> Vec<RunningPipeline> {
        self.inner.jobs.active()
    }

    pub fn job_table(&self) -> &JobTable {
        &self.inner.jobs
    }

    pub fn last_pipeline(&self) -> Option<RunningPipeline> {
        self.inner.jobs.last()
    }
}
