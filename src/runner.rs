//! Process supervision.
//!
//! A `ProcessSupervisor` owns one logical slot (a script or the interactive shell) and at most one
//! OS process for it. It streams the child's output to an `OutputSink`, notices when the child
//! exits, and stops it with a bounded interrupt → terminate → kill escalation.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::ChildStdin;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::SupervisorError;
use crate::identity::ScriptId;
use crate::output::{OutputSink, StreamKind};
use crate::process::{self, LaunchSpec, ProcessHandle, Reaper};

/// How long the exit watcher lets the output pumps drain after the process is gone.
const PUMP_DRAIN: Duration = Duration::from_millis(500);
/// Upper bound on the wait after the final kill.
const KILL_WAIT: Duration = Duration::from_millis(2000);
const MIN_INTERRUPT_WAIT: Duration = Duration::from_millis(300);
const MIN_TERMINATE_WAIT: Duration = Duration::from_millis(500);
const ETX: &[u8] = b"\x03";

/// Lifecycle of a supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Idle,
    Starting,
    Running,
    Stopping,
    /// Terminal; the registry replaces exited supervisors with fresh ones.
    Exited,
}

/// Result of a successful `start` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started(u32),
    AlreadyRunning,
}

/// How supervised processes are launched.
#[derive(Debug, Clone)]
pub struct LaunchConfig {
    pub python: PathBuf,
    pub scripts_dir: PathBuf,
    pub imports_dir: PathBuf,
    /// Variables added to every child, see `process::python_env`.
    pub env: HashMap<String, String>,
}

impl LaunchConfig {
    /// Builds a config whose child environment is derived from the current process environment.
    pub fn new(python: PathBuf, scripts_dir: PathBuf, imports_dir: PathBuf) -> Self {
        let base: HashMap<String, String> = std::env::vars().collect();
        let env = process::python_env(&base, &imports_dir);
        Self {
            python,
            scripts_dir,
            imports_dir,
            env,
        }
    }

    /// `<python> -u <script>` in the script's directory.
    pub fn script_command(&self, script: &Path) -> LaunchSpec {
        LaunchSpec {
            program: self.python.clone(),
            args: vec!["-u".to_string(), script.display().to_string()],
            cwd: script
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| self.scripts_dir.clone()),
            env: self.env.clone(),
        }
    }

    /// `<python> -u -i` in the scripts directory.
    pub fn shell_command(&self) -> LaunchSpec {
        LaunchSpec {
            program: self.python.clone(),
            args: vec!["-u".to_string(), "-i".to_string()],
            cwd: self.scripts_dir.clone(),
            env: self.env.clone(),
        }
    }
}

/// Called by the exit watcher once the supervisor reached `Exited`.
pub type ExitHook = Arc<dyn Fn(&Arc<ProcessSupervisor>) + Send + Sync>;

struct Inner {
    state: SupervisorState,
    handle: Option<ProcessHandle>,
    last_exit_code: Option<i32>,
}

/// Supervises at most one OS process for a script identity.
pub struct ProcessSupervisor {
    id: ScriptId,
    launch: Arc<LaunchConfig>,
    inner: Mutex<Inner>,
    state_tx: watch::Sender<SupervisorState>,
    stdin: tokio::sync::Mutex<Option<ChildStdin>>,
    on_exit: Option<ExitHook>,
}

#[derive(Debug, Clone, Copy)]
enum SlotKind {
    Script,
    Shell,
}

impl ProcessSupervisor {
    pub fn new(id: ScriptId, launch: Arc<LaunchConfig>, on_exit: Option<ExitHook>) -> Arc<Self> {
        let (state_tx, _) = watch::channel(SupervisorState::Idle);
        Arc::new(Self {
            id,
            launch,
            inner: Mutex::new(Inner {
                state: SupervisorState::Idle,
                handle: None,
                last_exit_code: None,
            }),
            state_tx,
            stdin: tokio::sync::Mutex::new(None),
            on_exit,
        })
    }

    pub fn id(&self) -> &ScriptId {
        &self.id
    }

    pub fn state(&self) -> SupervisorState {
        self.lock().state
    }

    /// True while a process is attached and has not been observed to exit.
    pub fn is_running(&self) -> bool {
        matches!(
            self.lock().state,
            SupervisorState::Running | SupervisorState::Stopping
        )
    }

    pub fn pid(&self) -> Option<u32> {
        self.lock().handle.as_ref().map(ProcessHandle::pid)
    }

    pub fn last_exit_code(&self) -> Option<i32> {
        self.lock().last_exit_code
    }

    /// Launches the script. Must be called from within a tokio runtime.
    pub fn start(self: &Arc<Self>, sink: OutputSink) -> Result<StartOutcome, SupervisorError> {
        let spec = self.launch.script_command(self.id.path());
        self.launch_with(spec, sink, SlotKind::Script)
    }

    /// Launches an interactive interpreter in the scripts directory.
    pub fn start_interactive_shell(
        self: &Arc<Self>,
        sink: OutputSink,
    ) -> Result<StartOutcome, SupervisorError> {
        let spec = self.launch.shell_command();
        self.launch_with(spec, sink, SlotKind::Shell)
    }

    fn launch_with(
        self: &Arc<Self>,
        spec: LaunchSpec,
        sink: OutputSink,
        kind: SlotKind,
    ) -> Result<StartOutcome, SupervisorError> {
        {
            let mut inner = self.lock();
            match inner.state {
                SupervisorState::Starting | SupervisorState::Running | SupervisorState::Stopping => {
                    return Ok(StartOutcome::AlreadyRunning)
                }
                SupervisorState::Exited => {
                    return Err(SupervisorError::Retired(self.id.to_string()))
                }
                SupervisorState::Idle => self.set_state(&mut inner, SupervisorState::Starting),
            }
        }

        let mut spawned = match process::spawn(&spec) {
            Ok(spawned) => spawned,
            Err(source) => {
                let mut inner = self.lock();
                self.set_state(&mut inner, SupervisorState::Idle);
                drop(inner);
                tracing::warn!(script = %self.id, command = %spec.display(), error = %source, "spawn failed");
                return Err(SupervisorError::Spawn {
                    program: spec.program.display().to_string(),
                    source,
                });
            }
        };

        let pid = spawned.handle.pid();
        match self.stdin.try_lock() {
            Ok(mut slot) => *slot = spawned.stdin.take(),
            Err(_) => tracing::warn!(script = %self.id, "stdin slot busy; input disabled"),
        }
        {
            let mut inner = self.lock();
            inner.handle = Some(spawned.handle.clone());
            inner.last_exit_code = None;
            self.set_state(&mut inner, SupervisorState::Running);
        }

        let name = self.id.file_name();
        match kind {
            SlotKind::Script => sink.emit(format!("[run] {name} started (PID={pid})")),
            SlotKind::Shell => sink.emit(format!("[repl] python shell started (PID={pid})")),
        }
        tracing::info!(script = %self.id, pid, "process started");

        let mut pumps = Vec::with_capacity(2);
        if let Some(stdout) = spawned.stdout.take() {
            pumps.push(tokio::spawn(pump(stdout, StreamKind::Stdout, sink.clone())));
        }
        if let Some(stderr) = spawned.stderr.take() {
            pumps.push(tokio::spawn(pump(stderr, StreamKind::Stderr, sink.clone())));
        }
        tokio::spawn(Arc::clone(self).watch_exit(spawned.reaper, pumps, sink));

        Ok(StartOutcome::Started(pid))
    }

    async fn watch_exit(self: Arc<Self>, reaper: Reaper, pumps: Vec<JoinHandle<()>>, sink: OutputSink) {
        let code = match reaper.wait().await {
            Ok(status) => process::exit_code(&status),
            Err(err) => {
                tracing::warn!(script = %self.id, error = %err, "waiting for process failed");
                None
            }
        };
        // a grandchild holding the pipes open must not block exit handling
        for pump in pumps {
            let _ = tokio::time::timeout(PUMP_DRAIN, pump).await;
        }

        let was_stopping = {
            let mut inner = self.lock();
            if inner.state == SupervisorState::Exited {
                drop(inner);
                tracing::info!(script = %self.id, code = ?code, "detached process finally exited");
                return;
            }
            let was_stopping = inner.state == SupervisorState::Stopping;
            inner.handle = None;
            inner.last_exit_code = code;
            self.set_state(&mut inner, SupervisorState::Exited);
            was_stopping
        };
        *self.stdin.lock().await = None;

        let name = self.id.file_name();
        let shown = code
            .map(|c| c.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        if was_stopping {
            sink.emit(format!("[stop] {name} stopped (code {shown})"));
        } else {
            sink.emit(format!("[exit] {name} exited with code {shown}"));
        }
        tracing::info!(script = %self.id, code = ?code, stopped = was_stopping, "process exited");

        if let Some(hook) = &self.on_exit {
            hook(&self);
        }
    }

    /// Stops the process: interrupt, then terminate, then kill.
    ///
    /// The first two phases wait `max(300ms, grace/3)` and `max(500ms, grace/3)`; the final kill
    /// waits at most two seconds. Returns once the process exited or the kill wait ran out; in
    /// the latter case the slot is detached from the process and reports it stopped anyway.
    pub async fn stop_gracefully(self: &Arc<Self>, grace: Duration) {
        let (interrupt_wait, terminate_wait) = phase_waits(grace);
        let handle = {
            let mut inner = self.lock();
            match (inner.state, inner.handle.clone()) {
                (SupervisorState::Running, Some(handle)) => {
                    self.set_state(&mut inner, SupervisorState::Stopping);
                    Some(handle)
                }
                (SupervisorState::Stopping, _) => None,
                _ => return,
            }
        };
        let Some(handle) = handle else {
            // another caller is already escalating
            self.wait_exited(interrupt_wait + terminate_wait + KILL_WAIT)
                .await;
            return;
        };
        tracing::info!(script = %self.id, pid = handle.pid(), "stopping process");

        if let Err(err) = handle.interrupt() {
            tracing::warn!(script = %self.id, error = %err, "interrupt failed; sending ETX");
            self.write_stdin(ETX).await;
        }
        if self.wait_exited(interrupt_wait).await {
            return;
        }

        if let Err(err) = handle.terminate().await {
            tracing::warn!(script = %self.id, error = %err, "terminate failed");
        }
        if self.wait_exited(terminate_wait).await {
            return;
        }

        handle.force_kill().await;
        if !self.wait_exited(KILL_WAIT).await {
            tracing::warn!(script = %self.id, pid = handle.pid(), "process still present after kill; detaching");
            self.detach();
            *self.stdin.lock().await = None;
        }
    }

    /// Marks the slot exited without waiting for the process, and hands it to the exit hook.
    /// The exit watcher only logs a late exit afterwards.
    fn detach(self: &Arc<Self>) {
        {
            let mut inner = self.lock();
            if inner.state == SupervisorState::Exited {
                return;
            }
            inner.handle = None;
            self.set_state(&mut inner, SupervisorState::Exited);
        }
        if let Some(hook) = &self.on_exit {
            hook(self);
        }
    }

    /// Writes `text` plus a newline to the process's stdin. Dropped when nothing is running.
    pub async fn send_line(&self, text: &str) {
        let mut payload = Vec::with_capacity(text.len() + 1);
        payload.extend_from_slice(text.as_bytes());
        payload.push(b'\n');
        self.write_stdin(&payload).await;
    }

    async fn write_stdin(&self, bytes: &[u8]) {
        let mut slot = self.stdin.lock().await;
        let Some(stdin) = slot.as_mut() else {
            return;
        };
        if let Err(err) = write_flush(stdin, bytes).await {
            tracing::debug!(script = %self.id, error = %err, "stdin closed");
            *slot = None;
        }
    }

    /// Waits until the supervisor reaches `Exited`; false on timeout.
    pub async fn wait_exited(&self, timeout: Duration) -> bool {
        let mut rx = self.state_tx.subscribe();
        let exited = tokio::time::timeout(timeout, rx.wait_for(|s| *s == SupervisorState::Exited))
            .await
            .map(|seen| seen.is_ok())
            .unwrap_or(false);
        exited
    }

    fn set_state(&self, inner: &mut Inner, state: SupervisorState) {
        inner.state = state;
        self.state_tx.send_replace(state);
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn phase_waits(grace: Duration) -> (Duration, Duration) {
    let third = grace / 3;
    (third.max(MIN_INTERRUPT_WAIT), third.max(MIN_TERMINATE_WAIT))
}

async fn write_flush(stdin: &mut ChildStdin, bytes: &[u8]) -> io::Result<()> {
    stdin.write_all(bytes).await?;
    stdin.flush().await
}

// Reads raw lines so invalid UTF-8 degrades to replacement characters instead of ending the pump.
async fn pump<R>(reader: R, stream: StreamKind, sink: OutputSink)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&buf);
                let line = text.trim_end_matches(|c| c == '\n' || c == '\r');
                sink.emit(format!("{}{}", stream.tag(), line));
            }
            Err(err) => {
                sink.emit(format!("[warn] stream pump error: {err}"));
                break;
            }
        }
    }
}
