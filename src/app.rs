//! Application state and UI logic.
//!
//! `App` tracks what the user sees: the script list with each script's toggle state, the shared
//! console and the input prompts. It never touches processes itself; key handling produces
//! `AppAction`s that the controller carries out, and the controller reports results back through
//! the `on_*` methods.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use crossterm::event::{KeyCode, KeyEvent, KeyModifiers};

use crate::identity::ScriptId;
use crate::output::ConsoleBuffer;

/// Modes of user input interaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputMode {
    /// Standard navigation mode.
    Normal,
    /// Typing a line for the input target's stdin.
    Input,
    /// Typing a pip install spec.
    Install,
}

/// What a row in the script list shows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptStatus {
    Off,
    /// Started from this session. The pid is known once the spawn succeeded.
    Running { pid: u32 },
    /// A stop was requested and is still escalating.
    Stopping,
    /// Seen in the process table but not started from this session. Read-only.
    External { pid: u32 },
}

/// Actions resulting from user interaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppAction {
    /// No action required.
    None,
    /// Exit the application.
    Quit,
    /// Start or stop a script.
    Toggle(ScriptId),
    /// Start or stop the interactive shell.
    ToggleShell,
    /// Send a line to the input target.
    SendInput(String),
    /// Run pip with the typed arguments.
    Install(String),
    /// Rescan the scripts directory now.
    Rescan,
}

/// A selectable row: the shell first, then the scripts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Row {
    Shell,
    Script(ScriptId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusLevel {
    Info,
    Warning,
}

#[derive(Debug, Clone)]
struct StatusMessage {
    text: String,
    at: Instant,
    ttl: Option<Duration>,
    level: StatusLevel,
}

/// The main application state container.
#[derive(Debug)]
pub struct App {
    /// Scripts in the watched directory, in display order.
    pub scripts: Vec<ScriptId>,
    /// Identity of the interactive shell slot.
    pub shell_id: ScriptId,
    /// Index into `rows()`.
    pub selected: usize,
    pub input_mode: InputMode,
    /// Buffer for the active prompt.
    pub input: String,
    /// Output of every process plus lifecycle messages.
    pub console: ConsoleBuffer,
    /// Whether the console sticks to the newest line.
    pub follow: bool,
    /// First visible console line when not following.
    pub scroll: usize,
    /// Whether to use Unicode symbols.
    pub use_symbols: bool,
    /// Whether to show the help overlay.
    pub show_help: bool,
    /// Flag indicating if the application should exit.
    pub should_quit: bool,
    /// Height of the console area (for scrolling calculations).
    pub log_view_height: usize,
    owned: HashMap<ScriptId, u32>,
    external: HashMap<ScriptId, u32>,
    stopping: HashSet<ScriptId>,
    // every pid this session spawned; never pruned, so late scan results for them are ignored
    spawned_pids: HashSet<u32>,
    last_started: Option<ScriptId>,
    status_message: Option<StatusMessage>,
}

impl App {
    pub fn new(shell_id: ScriptId, max_lines: usize, use_symbols: bool) -> Self {
        Self {
            scripts: Vec::new(),
            shell_id,
            selected: 0,
            input_mode: InputMode::Normal,
            input: String::new(),
            console: ConsoleBuffer::new(max_lines),
            follow: true,
            scroll: 0,
            use_symbols,
            show_help: false,
            should_quit: false,
            log_view_height: 0,
            owned: HashMap::new(),
            external: HashMap::new(),
            stopping: HashSet::new(),
            spawned_pids: HashSet::new(),
            last_started: None,
            status_message: None,
        }
    }

    pub fn rows(&self) -> Vec<Row> {
        std::iter::once(Row::Shell)
            .chain(self.scripts.iter().cloned().map(Row::Script))
            .collect()
    }

    pub fn selected_row(&self) -> Option<Row> {
        if self.selected == 0 {
            return Some(Row::Shell);
        }
        self.scripts.get(self.selected - 1).cloned().map(Row::Script)
    }

    pub fn status_of(&self, id: &ScriptId) -> ScriptStatus {
        if self.stopping.contains(id) {
            return ScriptStatus::Stopping;
        }
        if let Some(pid) = self.owned.get(id) {
            return ScriptStatus::Running { pid: *pid };
        }
        match self.external.get(id) {
            Some(pid) => ScriptStatus::External { pid: *pid },
            None => ScriptStatus::Off,
        }
    }

    pub fn shell_status(&self) -> ScriptStatus {
        self.status_of(&self.shell_id)
    }

    pub fn is_owned(&self, id: &ScriptId) -> bool {
        self.owned.contains_key(id)
    }

    /// Where typed input goes: the shell while it runs, else the most recently started script
    /// that is still running.
    pub fn input_target(&self) -> Option<&ScriptId> {
        if self.owned.contains_key(&self.shell_id) {
            return Some(&self.shell_id);
        }
        self.last_started
            .as_ref()
            .filter(|id| self.owned.contains_key(*id))
    }

    pub fn running_counts(&self) -> (usize, usize) {
        let owned = self.owned.keys().filter(|id| !id.is_shell_slot()).count();
        let external = self
            .external
            .keys()
            .filter(|id| !self.owned.contains_key(*id))
            .count();
        (owned, external)
    }

    pub fn on_scripts_changed(&mut self, scripts: Vec<ScriptId>) {
        let selected = self.selected_row();
        self.scripts = scripts;
        // keep the cursor on the same script when it survived
        self.selected = match selected {
            Some(Row::Script(id)) => self
                .scripts
                .iter()
                .position(|s| *s == id)
                .map(|i| i + 1)
                .unwrap_or_else(|| self.selected.min(self.scripts.len())),
            _ => self.selected.min(self.scripts.len()),
        };
    }

    pub fn on_owned_started(&mut self, id: ScriptId, pid: u32) {
        self.external.remove(&id);
        self.stopping.remove(&id);
        self.owned.insert(id.clone(), pid);
        self.spawned_pids.insert(pid);
        if !id.is_shell_slot() {
            self.last_started = Some(id);
        }
    }

    pub fn on_owned_exited(&mut self, id: &ScriptId) {
        self.owned.remove(id);
        self.stopping.remove(id);
    }

    pub fn on_stop_requested(&mut self, id: &ScriptId) {
        self.stopping.insert(id.clone());
    }

    pub fn on_stop_finished(&mut self, id: &ScriptId) {
        self.stopping.remove(id);
    }

    /// Applies an observation from the process table.
    ///
    /// Processes we launched show up there too, possibly after they already exited; only pids
    /// this session never spawned are recorded as external.
    pub fn on_observed(&mut self, id: &ScriptId, running: bool, pid: Option<u32>) {
        match (running, pid) {
            (true, Some(pid)) => {
                if self.spawned_pids.contains(&pid) {
                    self.external.remove(id);
                } else {
                    self.external.insert(id.clone(), pid);
                }
            }
            _ => {
                self.external.remove(id);
            }
        }
    }

    pub fn on_output(&mut self, line: String) {
        let dropped = self.console.push(line);
        if dropped && !self.follow && self.scroll > 0 {
            self.scroll -= 1;
        }
        if self.follow {
            self.ensure_follow();
        }
    }

    pub fn handle_key(&mut self, key: KeyEvent) -> AppAction {
        if key.code == KeyCode::Char('c') && key.modifiers.contains(KeyModifiers::CONTROL) {
            self.should_quit = true;
            return AppAction::Quit;
        }
        match self.input_mode {
            InputMode::Input => self.handle_input_key(key),
            InputMode::Install => self.handle_install_key(key),
            InputMode::Normal => self.handle_normal_input(key),
        }
    }

    fn handle_input_key(&mut self, key: KeyEvent) -> AppAction {
        match key.code {
            KeyCode::Esc => {
                self.exit_prompt();
                AppAction::None
            }
            KeyCode::Enter => AppAction::SendInput(std::mem::take(&mut self.input)),
            KeyCode::Backspace => {
                self.input.pop();
                AppAction::None
            }
            KeyCode::Char(c) if !key.modifiers.contains(KeyModifiers::CONTROL) => {
                self.input.push(c);
                AppAction::None
            }
            _ => AppAction::None,
        }
    }

    fn handle_install_key(&mut self, key: KeyEvent) -> AppAction {
        match key.code {
            KeyCode::Esc => {
                self.exit_prompt();
                AppAction::None
            }
            KeyCode::Enter => {
                let spec = self.input.trim().to_string();
                self.exit_prompt();
                if spec.is_empty() {
                    AppAction::None
                } else {
                    AppAction::Install(spec)
                }
            }
            KeyCode::Backspace => {
                self.input.pop();
                AppAction::None
            }
            KeyCode::Char(c) if !key.modifiers.contains(KeyModifiers::CONTROL) => {
                self.input.push(c);
                AppAction::None
            }
            _ => AppAction::None,
        }
    }

    fn handle_normal_input(&mut self, key: KeyEvent) -> AppAction {
        if self.show_help {
            // any key closes the overlay
            self.show_help = false;
            return AppAction::None;
        }
        match key.code {
            KeyCode::Char('q') => {
                self.should_quit = true;
                AppAction::Quit
            }
            KeyCode::Up | KeyCode::Char('k') => {
                self.selected = self.selected.saturating_sub(1);
                AppAction::None
            }
            KeyCode::Down | KeyCode::Char('j') => {
                if self.selected < self.scripts.len() {
                    self.selected += 1;
                }
                AppAction::None
            }
            KeyCode::Tab => {
                self.selected = (self.selected + 1) % (self.scripts.len() + 1);
                AppAction::None
            }
            KeyCode::Char(' ') | KeyCode::Enter => match self.selected_row() {
                Some(Row::Shell) => AppAction::ToggleShell,
                Some(Row::Script(id)) => AppAction::Toggle(id),
                None => AppAction::None,
            },
            KeyCode::Char('s') => AppAction::ToggleShell,
            KeyCode::Char('i') => {
                match self.input_target() {
                    Some(_) => {
                        self.input_mode = InputMode::Input;
                        self.input.clear();
                    }
                    None => self.set_status_warning_for(
                        "Nothing is running to receive input",
                        Duration::from_secs(3),
                    ),
                }
                AppAction::None
            }
            KeyCode::Char('p') => {
                self.input_mode = InputMode::Install;
                self.input.clear();
                AppAction::None
            }
            KeyCode::Char('r') => AppAction::Rescan,
            KeyCode::Char('f') => {
                self.follow = !self.follow;
                if self.follow {
                    self.ensure_follow();
                }
                AppAction::None
            }
            KeyCode::Char('?') => {
                self.show_help = true;
                AppAction::None
            }
            KeyCode::PageUp => {
                self.scroll_up(self.log_view_height.max(1));
                AppAction::None
            }
            KeyCode::PageDown => {
                self.scroll_down(self.log_view_height.max(1));
                AppAction::None
            }
            KeyCode::Home => {
                self.scroll = 0;
                self.follow = false;
                AppAction::None
            }
            KeyCode::End => {
                self.follow = true;
                self.ensure_follow();
                AppAction::None
            }
            _ => AppAction::None,
        }
    }

    fn exit_prompt(&mut self) {
        self.input_mode = InputMode::Normal;
        self.input.clear();
    }

    /// Leaves input mode when its target went away.
    pub fn drop_stale_input_mode(&mut self) {
        if self.input_mode == InputMode::Input && self.input_target().is_none() {
            self.exit_prompt();
        }
    }

    fn max_scroll(&self) -> usize {
        self.console.len().saturating_sub(self.log_view_height.max(1))
    }

    pub fn scroll_up(&mut self, amount: usize) {
        let max_scroll = self.max_scroll();
        let current = if self.follow { max_scroll } else { self.scroll };
        self.scroll = current.saturating_sub(amount).min(max_scroll);
        self.follow = false;
    }

    pub fn scroll_down(&mut self, amount: usize) {
        let max_scroll = self.max_scroll();
        let current = if self.follow { max_scroll } else { self.scroll };
        let next = (current + amount).min(max_scroll);
        self.scroll = next;
        self.follow = next == max_scroll;
    }

    pub fn ensure_follow(&mut self) {
        self.scroll = self.max_scroll();
    }

    pub fn set_log_view_height(&mut self, height: usize) {
        self.log_view_height = height;
        let max_scroll = self.max_scroll();
        if self.follow {
            self.scroll = max_scroll;
        } else {
            self.scroll = self.scroll.min(max_scroll);
        }
    }

    pub fn status_line(&self) -> String {
        let (owned, external) = self.running_counts();
        let target = self
            .input_target()
            .map(|id| {
                if id.is_shell_slot() {
                    "shell".to_string()
                } else {
                    id.file_name()
                }
            })
            .unwrap_or_else(|| "-".into());
        format!(
            "scripts: {} | running: {} | external: {} | input: {} | lines: {} | follow: {}",
            self.scripts.len(),
            owned,
            external,
            target,
            self.console.len(),
            if self.follow { "on" } else { "off" }
        )
    }

    pub fn status_message(&self) -> Option<(&str, StatusLevel)> {
        let message = self.status_message.as_ref()?;
        let still_visible = match message.ttl {
            Some(ttl) => message.at.elapsed() < ttl,
            None => true,
        };
        still_visible.then_some((message.text.as_str(), message.level))
    }

    pub fn set_status_message(&mut self, message: impl Into<String>) {
        self.set_status_message_with_level(message, StatusLevel::Info, Some(Duration::from_secs(3)));
    }

    pub fn set_status_warning_for(&mut self, message: impl Into<String>, ttl: Duration) {
        self.set_status_message_with_level(message, StatusLevel::Warning, Some(ttl));
    }

    pub fn clear_status_message(&mut self) {
        self.status_message = None;
    }

    fn set_status_message_with_level(
        &mut self,
        message: impl Into<String>,
        level: StatusLevel,
        ttl: Option<Duration>,
    ) {
        self.status_message = Some(StatusMessage {
            text: message.into(),
            at: Instant::now(),
            ttl,
            level,
        });
    }

    pub fn input_line(&self) -> &str {
        &self.input
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(name: &str) -> ScriptId {
        ScriptId::new(format!("/srv/scripts/{name}"))
    }

    fn make_app() -> App {
        let mut app = App::new(ScriptId::shell_slot(std::path::Path::new("/srv/scripts")), 100, false);
        app.on_scripts_changed(vec![id("a.py"), id("b.py")]);
        app
    }

    fn key(code: KeyCode) -> KeyEvent {
        KeyEvent::new(code, KeyModifiers::NONE)
    }

    #[test]
    fn enter_toggles_selected_row() {
        let mut app = make_app();
        assert_eq!(app.handle_key(key(KeyCode::Enter)), AppAction::ToggleShell);
        app.handle_key(key(KeyCode::Down));
        app.handle_key(key(KeyCode::Down));
        assert_eq!(app.handle_key(key(KeyCode::Char(' '))), AppAction::Toggle(id("b.py")));
        app.handle_key(key(KeyCode::Down));
        assert_eq!(app.selected, 2);
    }

    #[test]
    fn selection_follows_script_across_list_changes() {
        let mut app = make_app();
        app.selected = 2;
        app.on_scripts_changed(vec![id("0.py"), id("a.py"), id("b.py")]);
        assert_eq!(app.selected_row(), Some(Row::Script(id("b.py"))));
        app.on_scripts_changed(vec![id("0.py")]);
        assert_eq!(app.selected, 1);
    }

    #[test]
    fn owned_process_is_not_reported_as_external() {
        let mut app = make_app();
        app.on_owned_started(id("a.py"), 100);
        app.on_observed(&id("a.py"), true, Some(100));
        assert_eq!(app.status_of(&id("a.py")), ScriptStatus::Running { pid: 100 });

        app.on_observed(&id("b.py"), true, Some(7));
        assert_eq!(app.status_of(&id("b.py")), ScriptStatus::External { pid: 7 });
        assert_eq!(app.running_counts(), (1, 1));

        app.on_observed(&id("b.py"), false, None);
        assert_eq!(app.status_of(&id("b.py")), ScriptStatus::Off);
    }

    #[test]
    fn late_observation_of_exited_owned_process_is_ignored() {
        let mut app = make_app();
        app.on_owned_started(id("a.py"), 100);
        // scan ran while the process was alive, its result arrives after the exit
        app.on_owned_exited(&id("a.py"));
        app.on_observed(&id("a.py"), true, Some(100));
        assert_eq!(app.status_of(&id("a.py")), ScriptStatus::Off);
        assert_eq!(app.running_counts(), (0, 0));

        // a different pid for the same script is a genuine outside start
        app.on_observed(&id("a.py"), true, Some(101));
        assert_eq!(app.status_of(&id("a.py")), ScriptStatus::External { pid: 101 });
    }

    #[test]
    fn stopping_wins_until_exit() {
        let mut app = make_app();
        app.on_owned_started(id("a.py"), 100);
        app.on_stop_requested(&id("a.py"));
        assert_eq!(app.status_of(&id("a.py")), ScriptStatus::Stopping);
        app.on_owned_exited(&id("a.py"));
        assert_eq!(app.status_of(&id("a.py")), ScriptStatus::Off);
    }

    #[test]
    fn input_target_prefers_shell_then_last_started() {
        let mut app = make_app();
        assert_eq!(app.input_target(), None);
        app.on_owned_started(id("a.py"), 1);
        app.on_owned_started(id("b.py"), 2);
        assert_eq!(app.input_target(), Some(&id("b.py")));

        let shell = app.shell_id.clone();
        app.on_owned_started(shell.clone(), 3);
        assert_eq!(app.input_target(), Some(&shell));
        app.on_owned_exited(&shell);
        app.on_owned_exited(&id("b.py"));
        // a.py is still running but was not the last one started
        assert_eq!(app.input_target(), None);
    }

    #[test]
    fn input_mode_requires_a_target() {
        let mut app = make_app();
        app.handle_key(key(KeyCode::Char('i')));
        assert_eq!(app.input_mode, InputMode::Normal);
        assert!(matches!(app.status_message(), Some((_, StatusLevel::Warning))));

        app.on_owned_started(id("a.py"), 1);
        app.handle_key(key(KeyCode::Char('i')));
        assert_eq!(app.input_mode, InputMode::Input);
        app.handle_key(key(KeyCode::Char('h')));
        app.handle_key(key(KeyCode::Char('i')));
        assert_eq!(app.handle_key(key(KeyCode::Enter)), AppAction::SendInput("hi".into()));
        assert_eq!(app.input_mode, InputMode::Input);

        app.on_owned_exited(&id("a.py"));
        app.drop_stale_input_mode();
        assert_eq!(app.input_mode, InputMode::Normal);
    }

    #[test]
    fn install_prompt_yields_trimmed_spec() {
        let mut app = make_app();
        app.handle_key(key(KeyCode::Char('p')));
        for c in " requests ".chars() {
            app.handle_key(key(KeyCode::Char(c)));
        }
        assert_eq!(
            app.handle_key(key(KeyCode::Enter)),
            AppAction::Install("requests".into())
        );
        assert_eq!(app.input_mode, InputMode::Normal);
    }

    #[test]
    fn scrolling_leaves_and_rejoins_follow() {
        let mut app = make_app();
        app.set_log_view_height(5);
        for i in 0..20 {
            app.on_output(format!("[out] {i}"));
        }
        assert_eq!(app.scroll, 15);
        app.scroll_up(10);
        assert_eq!(app.scroll, 5);
        assert!(!app.follow);
        app.on_output("[out] more".into());
        assert_eq!(app.scroll, 5);
        app.scroll_down(100);
        assert!(app.follow);
        assert_eq!(app.scroll, 16);
    }

    #[test]
    fn ctrl_c_quits_from_any_mode() {
        let mut app = make_app();
        app.handle_key(key(KeyCode::Char('p')));
        let action = app.handle_key(KeyEvent::new(KeyCode::Char('c'), KeyModifiers::CONTROL));
        assert_eq!(action, AppAction::Quit);
        assert!(app.should_quit);
    }
}
