//! A single supervised OS process.
//!
//! `spawn` starts the child in its own process group with piped standard streams and splits it
//! into a cloneable `ProcessHandle` (pid + signalling) and a `Reaper` that owns the child and
//! resolves when it exits.

use std::collections::HashMap;
use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};

use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;

use crate::error::SignalError;
use crate::identity::normalize_path;
use crate::signal::{self, ProcessSignal};

/// Thread-pool variables that default to `1` so numeric libraries in parallel scripts do not
/// oversubscribe the machine.
pub const THREAD_LIMIT_VARS: [&str; 5] = [
    "OMP_NUM_THREADS",
    "OPENBLAS_NUM_THREADS",
    "MKL_NUM_THREADS",
    "NUMEXPR_NUM_THREADS",
    "VECLIB_MAXIMUM_THREADS",
];

/// Everything needed to spawn one process.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    /// Variables set on top of the inherited environment.
    pub env: HashMap<String, String>,
}

impl LaunchSpec {
    /// Human-readable command line for messages.
    pub fn display(&self) -> String {
        let mut parts = vec![self.program.display().to_string()];
        parts.extend(self.args.iter().cloned());
        shell_words::join(parts)
    }
}

/// Computes the variables a Python child needs on top of `base`.
///
/// `PYTHONPATH` gets `imports_dir` prepended unless it is already listed; `PYTHONUNBUFFERED`
/// and the thread-limit variables are only set when absent.
pub fn python_env(base: &HashMap<String, String>, imports_dir: &Path) -> HashMap<String, String> {
    let mut env = HashMap::new();

    let existing = base
        .get("PYTHONPATH")
        .map(String::as_str)
        .unwrap_or_default();
    let wanted = normalize_path(imports_dir);
    let mut entries: Vec<PathBuf> = std::env::split_paths(existing)
        .filter(|p| !p.as_os_str().is_empty())
        .collect();
    if !entries.iter().any(|p| normalize_path(p) == wanted) {
        entries.insert(0, imports_dir.to_path_buf());
        let joined = std::env::join_paths(&entries)
            .map(OsString::into_string)
            .ok()
            .and_then(Result::ok);
        match joined {
            Some(value) => {
                env.insert("PYTHONPATH".to_string(), value);
            }
            None => tracing::warn!(
                imports = %imports_dir.display(),
                "imports dir cannot be added to PYTHONPATH"
            ),
        }
    }

    if !base.contains_key("PYTHONUNBUFFERED") {
        env.insert("PYTHONUNBUFFERED".to_string(), "1".to_string());
    }
    for var in THREAD_LIMIT_VARS {
        if !base.contains_key(var) {
            env.insert(var.to_string(), "1".to_string());
        }
    }
    env
}

/// Cloneable reference to a running child: its pid and the ways to ask it to stop.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    pid: u32,
    kill_tx: mpsc::UnboundedSender<()>,
}

impl ProcessHandle {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// SIGINT to the process group on Unix, CTRL_BREAK on Windows.
    pub fn interrupt(&self) -> Result<(), SignalError> {
        signal::send(self.pid, ProcessSignal::Interrupt)
    }

    /// SIGTERM to the process, its group and its direct children on Unix.
    /// On Windows this is TerminateProcess on the child itself.
    #[cfg(unix)]
    pub async fn terminate(&self) -> Result<(), SignalError> {
        // children are looked up before the group signal makes them orphans
        let children = crate::scan::child_pids(self.pid).await;
        let result = signal::send(self.pid, ProcessSignal::Terminate);
        signal::send_each(&children, ProcessSignal::Terminate);
        result
    }

    #[cfg(not(unix))]
    pub async fn terminate(&self) -> Result<(), SignalError> {
        let _ = self.kill_tx.send(());
        Ok(())
    }

    /// Unconditional kill of the process and everything it started. Best effort.
    pub async fn force_kill(&self) {
        #[cfg(unix)]
        {
            let children = crate::scan::child_pids(self.pid).await;
            if let Err(err) = signal::send(self.pid, ProcessSignal::Kill) {
                tracing::debug!(error = %err, "group kill failed");
            }
            signal::send_each(&children, ProcessSignal::Kill);
        }
        #[cfg(windows)]
        {
            let pid = self.pid;
            let _ = tokio::task::spawn_blocking(move || signal::kill_tree(pid)).await;
        }
        let _ = self.kill_tx.send(());
    }
}

/// Owns the child and resolves with its exit status.
#[derive(Debug)]
pub struct Reaper {
    child: Child,
    kill_rx: mpsc::UnboundedReceiver<()>,
}

impl Reaper {
    /// Waits for the child to exit, honouring kill requests made through its `ProcessHandle`.
    pub async fn wait(mut self) -> io::Result<ExitStatus> {
        loop {
            tokio::select! {
                status = self.child.wait() => return status,
                request = self.kill_rx.recv() => match request {
                    Some(()) => {
                        if let Err(err) = self.child.start_kill() {
                            tracing::debug!(error = %err, "kill request ignored");
                        }
                    }
                    // every handle is gone; nothing can ask for a kill anymore
                    None => return self.child.wait().await,
                },
            }
        }
    }
}

/// A freshly spawned child split into its parts.
#[derive(Debug)]
pub struct SpawnedProcess {
    pub handle: ProcessHandle,
    pub stdin: Option<ChildStdin>,
    pub stdout: Option<ChildStdout>,
    pub stderr: Option<ChildStderr>,
    pub reaper: Reaper,
}

/// Spawns `spec` with piped streams in a new process group.
pub fn spawn(spec: &LaunchSpec) -> io::Result<SpawnedProcess> {
    let mut command = Command::new(&spec.program);
    command.args(&spec.args);
    command.current_dir(&spec.cwd);
    if !spec.env.is_empty() {
        command.envs(&spec.env);
    }
    command
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    command.kill_on_drop(true);

    #[cfg(windows)]
    {
        const CREATE_NEW_PROCESS_GROUP: u32 = 0x00000200;
        command.creation_flags(CREATE_NEW_PROCESS_GROUP);
    }

    #[cfg(unix)]
    unsafe {
        command.pre_exec(|| {
            let _ = libc::setpgid(0, 0);
            Ok(())
        });
    }

    let mut child = command.spawn()?;
    let pid = child.id().unwrap_or(0);
    let (kill_tx, kill_rx) = mpsc::unbounded_channel();
    Ok(SpawnedProcess {
        handle: ProcessHandle { pid, kill_tx },
        stdin: child.stdin.take(),
        stdout: child.stdout.take(),
        stderr: child.stderr.take(),
        reaper: Reaper { child, kill_rx },
    })
}

/// Exit code of a finished process. Unix signal deaths map to `128 + signal`.
pub fn exit_code(status: &ExitStatus) -> Option<i32> {
    if let Some(code) = status.code() {
        return Some(code);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        status.signal().map(|sig| 128 + sig)
    }
    #[cfg(not(unix))]
    {
        None
    }
}
