//! Live handles of started stages
//!
//! A `RunningItem` is created for every command and function stage of a
//! run. Its state is only changed from reactor callbacks:
//! - child lifecycle events for processes
//! - the finish callback of the output handler for functions
//!
//! Once an item is terminal its STRING captures are read back and their
//! files unlinked, exactly once. TMP files stay until
//! `remove_output_files`.

use std::cell::Cell;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::os::fd::RawFd;
use std::path::PathBuf;
use std::task::Waker;

use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::sys::signal::Signal;
use nix::unistd::Pid;

use crate::error::ItemReport;
use crate::error::ShellError;
use crate::plumbing::PipeHandle;
use crate::plumbing::RedirectSet;
use crate::plumbing::Stream;
use crate::reactor::ChildEvent;
use crate::reactor::ChildEventKind;

// ============================================================================
// Change Notification
// ============================================================================

/// Wakes the tasks waiting on a pipeline whenever one of its items changes.
#[derive(Default)]
pub(crate) struct ChangeNotify {
    wakers: RefCell<Vec<Waker>>,
}

impl ChangeNotify {
    pub(crate) fn subscribe(&self, waker: &Waker) {
        let mut wakers = self.wakers.borrow_mut();
        if !wakers.iter().any(|w| w.will_wake(waker)) {
            wakers.push(waker.clone());
        }
    }

    pub(crate) fn notify(&self) {
        let wakers = std::mem::take(&mut *self.wakers.borrow_mut());
        for waker in wakers {
            waker.wake();
        }
    }
}

// ============================================================================
// Output Files
// ============================================================================

/// TMP and STRING files created for one stage.
#[derive(Debug, Default)]
pub(crate) struct ItemOutputs {
    files: Vec<(RawFd, PipeHandle)>,
    captured: BTreeMap<RawFd, String>,
    collected: bool,
    removed: bool,
}

impl ItemOutputs {
    /// Take over the file handles a stage set resolved for itself.
    pub(crate) fn from_set(set: &RedirectSet) -> Self {
        Self {
            files: set
                .pipe_handles()
                .filter(|(_, handle)| !matches!(handle, PipeHandle::Fd(_)))
                .map(|(target, handle)| (target, handle.clone()))
                .collect(),
            ..Self::default()
        }
    }

    /// Delete every file of a stage that never started.
    pub(crate) fn discard(set: &RedirectSet) {
        let mut outputs = Self::from_set(set);
        outputs.collect();
        outputs.remove_files();
    }

    /// Read STRING captures into memory and unlink them. Runs once.
    fn collect(&mut self) {
        if self.collected {
            return;
        }
        self.collected = true;
        for (target, handle) in &self.files {
            let PipeHandle::Capture(path) = handle else {
                continue;
            };
            let content = match std::fs::read(path) {
                Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
                Err(e) => {
                    tracing::warn!(target: "pipeshell::job", path = %path.display(), error = %e, "capture read failed");
                    String::new()
                }
            };
            if let Err(e) = std::fs::remove_file(path) {
                tracing::warn!(target: "pipeshell::job", path = %path.display(), error = %e, "capture unlink failed");
            }
            self.captured.insert(*target, content);
        }
    }

    fn temp_files(&self) -> Vec<PathBuf> {
        if self.removed {
            return Vec::new();
        }
        self.temp_paths()
    }

    fn remove_files(&mut self) -> bool {
        if self.removed {
            return false;
        }
        self.removed = true;
        for path in self.temp_paths() {
            match std::fs::remove_file(&path) {
                Ok(()) => tracing::debug!(target: "pipeshell::job", path = %path.display(), "removed output file"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::warn!(target: "pipeshell::job", path = %path.display(), error = %e, "output file removal failed")
                }
            }
        }
        true
    }

    fn temp_paths(&self) -> Vec<PathBuf> {
        self.files
            .iter()
            .filter_map(|(_, handle)| match handle {
                PipeHandle::TempFile(path) => Some(path.clone()),
                _ => None,
            })
            .collect()
    }
}

// ============================================================================
// Running Items
// ============================================================================

/// Why a forked child never reached the program it was meant to run.
///
/// The child reports it over a close-on-exec pipe before exiting, so it
/// cannot be confused with a program that ran and exited with the same
/// status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartFailure {
    /// Wiring the descriptor table failed
    Redirect(Errno),
    /// The working directory could not be entered
    Chdir(Errno),
    /// `execve` returned
    Exec(Errno),
}

impl StartFailure {
    pub(crate) const ENCODED_LEN: usize = 5;

    pub fn errno(self) -> Errno {
        match self {
            Self::Redirect(e) | Self::Chdir(e) | Self::Exec(e) => e,
        }
    }

    /// Wire form: one tag byte, then the errno in native byte order.
    /// Only touches the stack, so it is usable between fork and exec.
    pub(crate) fn encode(self) -> [u8; Self::ENCODED_LEN] {
        let tag = match self {
            Self::Redirect(_) => 1,
            Self::Chdir(_) => 2,
            Self::Exec(_) => 3,
        };
        let code = (self.errno() as i32).to_ne_bytes();
        [tag, code[0], code[1], code[2], code[3]]
    }

    pub(crate) fn decode(buf: &[u8; Self::ENCODED_LEN]) -> Option<Self> {
        let errno = Errno::from_raw(i32::from_ne_bytes([buf[1], buf[2], buf[3], buf[4]]));
        match buf[0] {
            1 => Some(Self::Redirect(errno)),
            2 => Some(Self::Chdir(errno)),
            3 => Some(Self::Exec(errno)),
            _ => None,
        }
    }
}

impl fmt::Display for StartFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Redirect(e) => write!(f, "redirect failed: {}", e.desc()),
            Self::Chdir(e) => write!(f, "cannot enter directory: {}", e.desc()),
            Self::Exec(e) => write!(f, "exec failed: {}", e.desc()),
        }
    }
}

/// An external process started by a command stage.
#[derive(Debug)]
pub struct RunningProcess {
    pid: Pid,
    last: Cell<Option<ChildEvent>>,
    stopped: Cell<bool>,
    start_failure: Cell<Option<StartFailure>>,
}

impl RunningProcess {
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Set when the child exited before running its program.
    pub fn start_failure(&self) -> Option<StartFailure> {
        self.start_failure.get()
    }

    /// Most recent lifecycle event, if any was observed.
    pub fn last_event(&self) -> Option<ChildEvent> {
        self.last.get()
    }

    fn signal(&self, signal: Signal) -> Result<(), ShellError> {
        match kill(self.pid, signal) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(ShellError::spawn_failed(format!(
                "{} to {}: {e}",
                signal.as_str(),
                self.pid
            ))),
        }
    }
}

/// An in-process function stage running on the reactor.
#[derive(Debug, Default)]
pub struct RunningFunction {
    finished: Cell<bool>,
    error: RefCell<Option<String>>,
}

impl RunningFunction {
    /// Message of the error that ended the stage, if any.
    pub fn error(&self) -> Option<String> {
        self.error.borrow().clone()
    }
}

#[derive(Debug)]
pub enum ItemKind {
    Process(RunningProcess),
    Function(RunningFunction),
}

/// Handle to one started stage.
#[derive(Debug)]
pub struct RunningItem {
    stage: String,
    kind: ItemKind,
    outputs: RefCell<ItemOutputs>,
}

impl RunningItem {
    pub(crate) fn process(stage: String, pid: Pid, outputs: ItemOutputs) -> Self {
        Self {
            stage,
            kind: ItemKind::Process(RunningProcess {
                pid,
                last: Cell::new(None),
                stopped: Cell::new(false),
                start_failure: Cell::new(None),
            }),
            outputs: RefCell::new(outputs),
        }
    }

    pub(crate) fn with_start_failure(self, failure: Option<StartFailure>) -> Self {
        if let ItemKind::Process(process) = &self.kind {
            process.start_failure.set(failure);
        }
        self
    }

    pub(crate) fn function(stage: String, outputs: ItemOutputs) -> Self {
        Self {
            stage,
            kind: ItemKind::Function(RunningFunction::default()),
            outputs: RefCell::new(outputs),
        }
    }

    /// Record a lifecycle event of the item's process.
    pub(crate) fn on_child_event(&self, event: &ChildEvent) {
        let ItemKind::Process(process) = &self.kind else {
            return;
        };
        process.last.set(Some(*event));
        match event.kind {
            ChildEventKind::Stopped => process.stopped.set(true),
            ChildEventKind::Continued => process.stopped.set(false),
            _ => {}
        }
        if event.is_terminal() {
            process.stopped.set(false);
            self.outputs.borrow_mut().collect();
        }
    }

    /// Record the end of the item's function body.
    pub(crate) fn on_function_finished(&self, error: Option<&anyhow::Error>) {
        let ItemKind::Function(function) = &self.kind else {
            return;
        };
        if let Some(e) = error {
            *function.error.borrow_mut() = Some(format!("{e:#}"));
        }
        function.finished.set(true);
        self.outputs.borrow_mut().collect();
    }

    /// Description of the stage this item runs.
    pub fn stage(&self) -> &str {
        &self.stage
    }

    pub fn kind(&self) -> &ItemKind {
        &self.kind
    }

    pub fn pid(&self) -> Option<Pid> {
        match &self.kind {
            ItemKind::Process(p) => Some(p.pid),
            ItemKind::Function(_) => None,
        }
    }

    /// True once the item reached a terminal state.
    pub fn is_finished(&self) -> bool {
        match &self.kind {
            ItemKind::Process(p) => p.last.get().is_some_and(|e| e.is_terminal()),
            ItemKind::Function(f) => f.finished.get(),
        }
    }

    /// Why a process stage never ran its program, if it didn't.
    pub fn start_failure(&self) -> Option<StartFailure> {
        match &self.kind {
            ItemKind::Process(p) => p.start_failure(),
            ItemKind::Function(_) => None,
        }
    }

    pub fn is_stopped(&self) -> bool {
        match &self.kind {
            ItemKind::Process(p) => p.stopped.get(),
            ItemKind::Function(_) => false,
        }
    }

    /// Nonzero exit, death by any signal, a failed start, or an error
    /// raised by a function body.
    pub fn failed(&self) -> bool {
        match &self.kind {
            ItemKind::Process(p) => match p.last.get() {
                Some(e) => match e.kind {
                    ChildEventKind::Exited => e.status != 0 || p.start_failure.get().is_some(),
                    ChildEventKind::Killed | ChildEventKind::Dumped => true,
                    _ => false,
                },
                None => false,
            },
            ItemKind::Function(f) => f.error.borrow().is_some(),
        }
    }

    /// Shell-style exit code: the exit status, or 128 + signal.
    pub fn exit_code(&self) -> Option<i32> {
        match &self.kind {
            ItemKind::Process(p) => p.last.get().and_then(|e| match e.kind {
                ChildEventKind::Exited => Some(e.status),
                ChildEventKind::Killed | ChildEventKind::Dumped => Some(128 + e.status),
                _ => None,
            }),
            ItemKind::Function(f) => {
                if !f.finished.get() {
                    None
                } else if f.error.borrow().is_some() {
                    Some(1)
                } else {
                    Some(0)
                }
            }
        }
    }

    pub fn status(&self) -> String {
        match &self.kind {
            ItemKind::Process(p) => match (p.start_failure.get(), p.last.get()) {
                (Some(failure), _) => format!("{} ({failure})", p.pid),
                (None, None) => p.pid.to_string(),
                (None, Some(e)) => format!("{} ({e})", p.pid),
            },
            ItemKind::Function(f) => match (f.finished.get(), f.error.borrow().as_ref()) {
                (false, _) => "running".to_string(),
                (true, Some(e)) => format!("exception: {e}"),
                (true, None) => "done".to_string(),
            },
        }
    }

    /// Resume a stopped process. Function stages never stop.
    pub fn restart(&self) -> Result<(), ShellError> {
        match &self.kind {
            ItemKind::Process(p) if !self.is_finished() => {
                tracing::debug!(target: "pipeshell::job", pid = p.pid.as_raw(), "continue");
                p.stopped.set(false);
                p.signal(Signal::SIGCONT)
            }
            _ => Ok(()),
        }
    }

    /// Stop a running process. Function stages keep running; they stall
    /// on their stopped neighbours.
    pub fn suspend(&self) -> Result<(), ShellError> {
        match &self.kind {
            ItemKind::Process(p) if !self.is_finished() && !p.stopped.get() => {
                tracing::debug!(target: "pipeshell::job", pid = p.pid.as_raw(), "stop");
                p.signal(Signal::SIGSTOP)
            }
            _ => Ok(()),
        }
    }

    /// Content captured from a STRING redirect of `stream`, once finished.
    pub fn captured(&self, stream: impl Into<Stream>) -> Option<String> {
        self.outputs.borrow().captured.get(&stream.into().fd()).cloned()
    }

    /// All STRING captures by stream index.
    pub fn captures(&self) -> BTreeMap<RawFd, String> {
        self.outputs.borrow().captured.clone()
    }

    /// TMP files written by this stage that still exist.
    pub fn output_files(&self) -> Vec<PathBuf> {
        self.outputs.borrow().temp_files()
    }

    /// Delete the TMP files. Returns false if they were already removed.
    pub fn remove_output_files(&self) -> bool {
        self.outputs.borrow_mut().remove_files()
    }

    pub fn report(&self) -> ItemReport {
        ItemReport {
            stage: self.stage.clone(),
            status: self.status(),
            failed: self.failed(),
            captured: self
                .captures()
                .into_iter()
                .map(|(fd, content)| {
                    let name = Stream(fd).name().map_or_else(|| fd.to_string(), str::to_string);
                    (name, content)
                })
                .collect(),
        }
    }
}

impl fmt::Display for RunningItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} as {}", self.stage, self.status())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EXIT_EXEC_FAILED;
    use crate::plumbing::Redirect;

    fn exited(pid: i32, status: i32) -> ChildEvent {
        ChildEvent {
            pid: Pid::from_raw(pid),
            kind: ChildEventKind::Exited,
            status,
            signal: None,
        }
    }

    #[test]
    fn test_process_status_transitions() {
        let item = RunningItem::process("ls()".into(), Pid::from_raw(4242), ItemOutputs::default());
        assert_eq!(item.to_string(), "ls() as 4242");
        assert!(!item.is_finished());

        item.on_child_event(&ChildEvent {
            pid: Pid::from_raw(4242),
            kind: ChildEventKind::Stopped,
            status: Signal::SIGSTOP as i32,
            signal: Some(Signal::SIGSTOP),
        });
        assert!(item.is_stopped());
        assert_eq!(item.status(), "4242 (stopped=SIGSTOP)");

        item.on_child_event(&exited(4242, 0));
        assert!(item.is_finished());
        assert!(!item.is_stopped());
        assert!(!item.failed());
        assert_eq!(item.to_string(), "ls() as 4242 (exit_code=0)");
        assert_eq!(item.exit_code(), Some(0));
    }

    #[test]
    fn test_exec_failure_status() {
        let item = RunningItem::process("nope()".into(), Pid::from_raw(7), ItemOutputs::default())
            .with_start_failure(Some(StartFailure::Exec(Errno::ENOENT)));
        item.on_child_event(&exited(7, EXIT_EXEC_FAILED));
        assert!(item.failed());
        assert_eq!(item.status(), "7 (exec failed: No such file or directory)");
    }

    #[test]
    fn test_exit_127_without_start_failure_is_plain_exit() {
        let item = RunningItem::process("sh()".into(), Pid::from_raw(11), ItemOutputs::default());
        item.on_child_event(&exited(11, EXIT_EXEC_FAILED));
        assert!(item.failed());
        assert_eq!(item.status(), "11 (exit_code=127)");
    }

    #[test]
    fn test_start_failure_wire_form() {
        for failure in [
            StartFailure::Redirect(Errno::EBADF),
            StartFailure::Chdir(Errno::ENOTDIR),
            StartFailure::Exec(Errno::EACCES),
        ] {
            assert_eq!(StartFailure::decode(&failure.encode()), Some(failure));
        }
        assert_eq!(StartFailure::decode(&[0; StartFailure::ENCODED_LEN]), None);
    }

    #[test]
    fn test_sigpipe_death_is_a_failure() {
        let item = RunningItem::process("yes()".into(), Pid::from_raw(8), ItemOutputs::default());
        item.on_child_event(&ChildEvent {
            pid: Pid::from_raw(8),
            kind: ChildEventKind::Killed,
            status: Signal::SIGPIPE as i32,
            signal: Some(Signal::SIGPIPE),
        });
        assert!(item.failed());
        assert_eq!(item.exit_code(), Some(128 + Signal::SIGPIPE as i32));
    }

    #[test]
    fn test_function_error_is_recorded() {
        let item = RunningItem::function("gen()".into(), ItemOutputs::default());
        assert_eq!(item.status(), "running");
        item.on_function_finished(Some(&anyhow::anyhow!("boom")));
        assert!(item.failed());
        assert_eq!(item.status(), "exception: boom");
        assert_eq!(item.exit_code(), Some(1));
    }

    #[test]
    fn test_capture_collected_once_and_unlinked() {
        let set = RedirectSet::empty().with(Redirect::capture(2)).make_pipes().unwrap();
        let path = match set.stderr().unwrap().pipe_handle() {
            Some(PipeHandle::Capture(path)) => path.clone(),
            other => panic!("unexpected {other:?}"),
        };
        let mut set = set;
        set.close_source_fds();
        std::fs::write(&path, "warning\n").unwrap();

        let item = RunningItem::process("x()".into(), Pid::from_raw(9), ItemOutputs::from_set(&set));
        item.on_child_event(&exited(9, 1));
        assert_eq!(item.captured(2).as_deref(), Some("warning\n"));
        assert!(!path.exists());

        let report = item.report();
        assert!(report.failed);
        assert_eq!(report.captured, vec![("stderr".to_string(), "warning\n".to_string())]);
    }

    #[test]
    fn test_remove_output_files_is_idempotent() {
        let mut set = RedirectSet::empty().with(Redirect::temp(1)).make_pipes().unwrap();
        set.close_source_fds();
        let item = RunningItem::process("x()".into(), Pid::from_raw(10), ItemOutputs::from_set(&set));
        item.on_child_event(&exited(10, 0));

        let files = item.output_files();
        assert_eq!(files.len(), 1);
        assert!(files[0].exists());

        assert!(item.remove_output_files());
        assert!(!files[0].exists());
        assert!(!item.remove_output_files());
        assert!(item.output_files().is_empty());
    }

    #[test]
    fn test_discard_removes_everything() {
        let mut set = RedirectSet::empty()
            .with(Redirect::temp(1))
            .with(Redirect::capture(2))
            .make_pipes()
            .unwrap();
        set.close_source_fds();
        let paths: Vec<PathBuf> = set
            .pipe_handles()
            .filter_map(|(_, h)| match h {
                PipeHandle::TempFile(p) | PipeHandle::Capture(p) => Some(p.clone()),
                PipeHandle::Fd(_) => None,
            })
            .collect();
        assert_eq!(paths.len(), 2);
        ItemOutputs::discard(&set);
        assert!(paths.iter().all(|p| !p.exists()));
    }
}
