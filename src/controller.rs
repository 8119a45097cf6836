//! Glue between the UI state and the process machinery.
//!
//! The main loop owns the `App`; the controller owns handles to the registry, the watcher and
//! the package manager. Every call runs on the main loop, long operations (stops, pip) are pushed
//! onto tasks that report back with an `Event`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::app::{App, AppAction, ScriptStatus};
use crate::error::SupervisorError;
use crate::events::Event;
use crate::identity::ScriptId;
use crate::output::OutputSink;
use crate::packages::PackageManager;
use crate::registry::SupervisorRegistry;
use crate::runner::{ProcessSupervisor, StartOutcome};
use crate::watch::DirectoryWatcher;

const WARNING_TTL: Duration = Duration::from_secs(5);

/// Grace budgets applied to user-requested stops.
#[derive(Debug, Clone, Copy)]
pub struct StopBudgets {
    pub script: Duration,
    pub shell: Duration,
}

pub struct Controller {
    registry: SupervisorRegistry,
    watcher: Arc<DirectoryWatcher>,
    packages: PackageManager,
    events: mpsc::UnboundedSender<Event>,
    sink: OutputSink,
    budgets: StopBudgets,
}

/// What `install` parses out of the prompt text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallRequest {
    Package { spec: String, extra: Vec<String> },
    Requirements { file: PathBuf, extra: Vec<String> },
}

impl InstallRequest {
    /// Accepts `<spec> [pip args]` or `-r <file> [pip args]`, shell-quoted.
    pub fn parse(text: &str) -> Result<Self, String> {
        let words = shell_words::split(text).map_err(|err| err.to_string())?;
        let mut words = words.into_iter();
        match words.next().as_deref() {
            None => Err("nothing to install".to_string()),
            Some("-r") | Some("--requirement") => match words.next() {
                Some(file) => Ok(InstallRequest::Requirements {
                    file: PathBuf::from(file),
                    extra: words.collect(),
                }),
                None => Err("-r needs a requirements file".to_string()),
            },
            Some(spec) => Ok(InstallRequest::Package {
                spec: spec.to_string(),
                extra: words.collect(),
            }),
        }
    }

    fn label(&self) -> String {
        match self {
            InstallRequest::Package { spec, .. } => spec.clone(),
            InstallRequest::Requirements { file, .. } => file.display().to_string(),
        }
    }
}

impl Controller {
    pub fn new(
        registry: SupervisorRegistry,
        watcher: Arc<DirectoryWatcher>,
        packages: PackageManager,
        events: mpsc::UnboundedSender<Event>,
        budgets: StopBudgets,
    ) -> Self {
        let sink = crate::events::output_sink(events.clone());
        Self {
            registry,
            watcher,
            packages,
            events,
            sink,
            budgets,
        }
    }

    pub fn handle_action(&self, app: &mut App, action: AppAction) {
        match action {
            AppAction::None | AppAction::Quit => {}
            AppAction::Toggle(id) => self.toggle(app, &id),
            AppAction::ToggleShell => self.toggle_shell(app),
            AppAction::SendInput(text) => self.send_input(app, text),
            AppAction::Install(text) => self.install(app, &text),
            AppAction::Rescan => self.rescan(app),
        }
    }

    /// Applies a background event to the UI state. Input and shutdown events are handled by
    /// the main loop.
    pub fn handle_event(&self, app: &mut App, event: Event) {
        match event {
            Event::ScriptsChanged(scripts) => app.on_scripts_changed(scripts),
            Event::RunningState { id, running, pid } => app.on_observed(&id, running, pid),
            Event::Output(line) => app.on_output(line),
            Event::SupervisorExited { id, code } => {
                app.on_owned_exited(&id);
                app.drop_stale_input_mode();
                tracing::debug!(script = %id, ?code, "supervisor exited");
            }
            Event::StopFinished { id } => app.on_stop_finished(&id),
            Event::PackageFinished { label, code } => {
                if code == 0 {
                    app.set_status_message(format!("Installed {label}"));
                } else {
                    app.set_status_warning_for(
                        format!("pip failed for {label} (code {code})"),
                        WARNING_TTL,
                    );
                }
            }
            Event::Key(_) | Event::Resize { .. } | Event::Command(_) | Event::Shutdown => {}
        }
    }

    /// Starts the script, or stops it when this session owns it. External processes are left
    /// alone.
    pub fn toggle(&self, app: &mut App, id: &ScriptId) {
        match app.status_of(id) {
            ScriptStatus::Stopping => {
                app.set_status_message(format!("{} is still stopping", id.file_name()))
            }
            ScriptStatus::Running { .. } => self.stop(app, id),
            ScriptStatus::External { pid } => app.set_status_warning_for(
                format!(
                    "{} was started outside pyrack (PID={pid}); stop it there",
                    id.file_name()
                ),
                WARNING_TTL,
            ),
            ScriptStatus::Off => self.start(app, id),
        }
    }

    pub fn toggle_shell(&self, app: &mut App) {
        let shell = app.shell_id.clone();
        match app.shell_status() {
            ScriptStatus::Stopping => app.set_status_message("Shell is still stopping"),
            ScriptStatus::Running { .. } => self.stop(app, &shell),
            ScriptStatus::External { .. } | ScriptStatus::Off => self.start(app, &shell),
        }
    }

    pub fn start(&self, app: &mut App, id: &ScriptId) {
        let result = match self.launch(id) {
            // lost a race with the exit watcher; the registry now hands out a fresh one
            Err(SupervisorError::Retired(_)) => self.launch(id),
            other => other,
        };
        match result {
            Ok(StartOutcome::Started(pid)) => {
                app.on_owned_started(id.clone(), pid);
            }
            Ok(StartOutcome::AlreadyRunning) => {
                app.set_status_message(format!("{} is already running", display_name(id)));
            }
            Err(err) => {
                tracing::warn!(script = %id, error = %err, "start failed");
                app.on_output(format!("[error] {err}"));
                app.set_status_warning_for(err.to_string(), WARNING_TTL);
            }
        }
    }

    fn launch(&self, id: &ScriptId) -> Result<StartOutcome, SupervisorError> {
        let supervisor = self.registry.get_or_create(id);
        if id.is_shell_slot() {
            supervisor.start_interactive_shell(self.sink.clone())
        } else {
            supervisor.start(self.sink.clone())
        }
    }

    /// Escalating stop on a background task; reports `Event::StopFinished` when done.
    pub fn stop(&self, app: &mut App, id: &ScriptId) {
        let Some(supervisor) = self.registry.get(id) else {
            // exited before the request arrived
            app.on_owned_exited(id);
            return;
        };
        let grace = if id.is_shell_slot() {
            self.budgets.shell
        } else {
            self.budgets.script
        };
        app.on_stop_requested(id);
        let events = self.events.clone();
        let id = id.clone();
        tokio::spawn(async move {
            supervisor.stop_gracefully(grace).await;
            let _ = events.send(Event::StopFinished { id });
        });
    }

    pub fn send_input(&self, app: &mut App, text: String) {
        let Some(target) = app.input_target().cloned() else {
            app.set_status_warning_for("Nothing is running to receive input", WARNING_TTL);
            return;
        };
        let Some(supervisor) = self.registry.get(&target) else {
            app.on_owned_exited(&target);
            app.drop_stale_input_mode();
            return;
        };
        app.on_output(format!("[in] {} <- {text}", display_name(&target)));
        tokio::spawn(send_line(supervisor, text));
    }

    pub fn install(&self, app: &mut App, text: &str) {
        let request = match InstallRequest::parse(text) {
            Ok(request) => request,
            Err(err) => {
                app.set_status_warning_for(format!("Install: {err}"), WARNING_TTL);
                return;
            }
        };
        let label = request.label();
        app.set_status_message(format!("Installing {label}..."));
        let packages = self.packages.clone();
        let sink = self.sink.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            let code = match &request {
                InstallRequest::Package { spec, extra } => packages.install(spec, extra, &sink).await,
                InstallRequest::Requirements { file, extra } => {
                    packages.install_requirements(file, extra, &sink).await
                }
            };
            let _ = events.send(Event::PackageFinished { label, code });
        });
    }

    pub fn rescan(&self, app: &mut App) {
        let known = self.watcher.force_rescan_now();
        app.set_status_message(format!("{} scripts", known.len()));
    }

    /// Runs one headless command line. Returns `true` when the user asked to quit.
    pub fn handle_command(&self, app: &mut App, line: &str) -> bool {
        let line = line.trim();
        let (command, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
        let rest = rest.trim();
        app.clear_status_message();
        match command {
            "" => {}
            "quit" | "exit" => return true,
            "help" => {
                for line in HEADLESS_HELP {
                    self.sink.emit(*line);
                }
            }
            "list" => self.print_list(app),
            "rescan" => {
                self.rescan(app);
                self.sink.emit(format!("[info] {} scripts", app.scripts.len()));
            }
            "shell" => self.toggle_shell(app),
            "send" => self.send_input(app, rest.to_string()),
            "install" => self.install(app, rest),
            "requirements" => self.install(app, &format!("-r {rest}")),
            "start" | "stop" | "toggle" => match find_script(app, rest) {
                Some(id) => {
                    let status = app.status_of(&id);
                    let skip = match command {
                        "start" => status != ScriptStatus::Off,
                        "stop" => !matches!(status, ScriptStatus::Running { .. }),
                        _ => false,
                    };
                    if skip {
                        self.sink.emit(format!(
                            "[info] {}: {}",
                            id.file_name(),
                            describe(status)
                        ));
                    } else {
                        self.toggle(app, &id);
                    }
                }
                None => self.sink.emit(format!("[warn] no script named '{rest}'")),
            },
            other => self.sink.emit(format!("[warn] unknown command '{other}' (try help)")),
        }
        if let Some((message, _)) = app.status_message() {
            self.sink.emit(format!("[info] {message}"));
        }
        false
    }

    fn print_list(&self, app: &App) {
        self.sink
            .emit(format!("[list] shell: {}", describe(app.shell_status())));
        if app.scripts.is_empty() {
            self.sink.emit("[list] (no scripts)");
        }
        for id in &app.scripts {
            self.sink.emit(format!(
                "[list] {}: {}",
                id.file_name(),
                describe(app.status_of(id))
            ));
        }
    }
}

async fn send_line(supervisor: Arc<ProcessSupervisor>, text: String) {
    supervisor.send_line(&text).await;
}

const HEADLESS_HELP: &[&str] = &[
    "[help] list                    scripts and their state",
    "[help] start|stop|toggle NAME  control a script",
    "[help] shell                   start or stop the interactive shell",
    "[help] send TEXT               write a line to the shell or last started script",
    "[help] install SPEC [ARGS]     pip install into the imports dir",
    "[help] requirements FILE       pip install -r FILE",
    "[help] rescan                  rescan the scripts dir",
    "[help] quit                    stop everything and exit",
];

fn display_name(id: &ScriptId) -> String {
    if id.is_shell_slot() {
        "shell".to_string()
    } else {
        id.file_name()
    }
}

/// Human-readable script state, shared by the headless list and the `list` subcommand.
pub fn describe(status: ScriptStatus) -> String {
    match status {
        ScriptStatus::Off => "off".to_string(),
        ScriptStatus::Running { pid } => format!("running (PID={pid})"),
        ScriptStatus::Stopping => "stopping".to_string(),
        ScriptStatus::External { pid } => format!("external (PID={pid})"),
    }
}

// Exact file name first, then the name without its extension.
fn find_script(app: &App, name: &str) -> Option<ScriptId> {
    let name = name.trim();
    if name.is_empty() {
        return None;
    }
    app.scripts
        .iter()
        .find(|id| id.file_name().eq_ignore_ascii_case(name))
        .or_else(|| {
            app.scripts.iter().find(|id| {
                id.path()
                    .file_stem()
                    .map(|stem| stem.to_string_lossy().eq_ignore_ascii_case(name))
                    .unwrap_or(false)
            })
        })
        .cloned()
}
