//! pyrack: a Python script launcher with a TUI.
//!
//! This is the entry point of the application. It parses command-line arguments, resolves
//! settings, wires the watcher, reconciler and supervisor registry together and runs the main
//! event loop (TUI or headless) until the user quits or a signal arrives.

mod app;
mod config;
mod controller;
mod error;
mod events;
mod identity;
mod output;
mod packages;
mod process;
mod reconcile;
mod registry;
mod runner;
mod scan;
mod signal;
mod tui;
mod watch;

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::builder::styling::{AnsiColor, Effects, Style};
use clap::builder::Styles;
use clap::{Parser, Subcommand};
use tokio::sync::{mpsc, Notify};
use tracing_subscriber::EnvFilter;

use crate::app::App;
use crate::config::{default_config_path, load_config, Config, Overrides, Settings};
use crate::controller::{Controller, StopBudgets};
use crate::events::{Event, EventForwarder};
use crate::identity::ScriptId;
use crate::output::{sanitize_text, OutputSink};
use crate::packages::PackageManager;
use crate::reconcile::Reconciler;
use crate::registry::SupervisorRegistry;
use crate::runner::LaunchConfig;
use crate::scan::{ProcessTableScanner, TableScanner, TargetResolver};
use crate::watch::DirectoryWatcher;

/// Command-line interface definition.
#[derive(Debug, Parser)]
#[command(
    name = "pyrack",
    version,
    about = "Launch, watch and stop Python scripts from one terminal",
    styles = help_styles(),
    color = clap::ColorChoice::Always,
    disable_help_subcommand = true
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
    /// Path to pyrack.toml configuration file.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Ignore any pyrack.toml in the current directory.
    #[arg(long)]
    no_config: bool,
    /// Directory holding scripts/ and python/imports/ (default: current directory).
    #[arg(long)]
    root: Option<PathBuf>,
    /// Python interpreter for scripts, the shell and pip.
    #[arg(long)]
    python: Option<PathBuf>,
    /// Executable names recognised as interpreters in the process table (comma-separated).
    #[arg(long = "interpreter", value_delimiter = ',')]
    interpreter_names: Vec<String>,
    /// Script file extensions (comma-separated).
    #[arg(long = "ext", value_delimiter = ',')]
    extensions: Vec<String>,
    /// Process table scan interval (ms).
    #[arg(long)]
    scan_interval_ms: Option<u64>,
    /// Window collapsing bursts of directory events (ms).
    #[arg(long)]
    watch_debounce_ms: Option<u64>,
    /// Grace budget when stopping a script (ms).
    #[arg(long)]
    stop_grace_ms: Option<u64>,
    /// Grace budget when stopping the python shell (ms).
    #[arg(long)]
    shell_grace_ms: Option<u64>,
    /// Grace budget for every process on exit (ms).
    #[arg(long)]
    shutdown_grace_ms: Option<u64>,
    /// Max console lines kept in memory.
    #[arg(long)]
    max_lines: Option<usize>,
    /// Use plain ASCII markers in the TUI.
    #[arg(long)]
    no_symbols: bool,
    /// Write diagnostic logs to this file while the TUI runs.
    #[arg(long)]
    log_file: Option<PathBuf>,
    /// Disable the TUI; print console lines and read commands from stdin.
    #[arg(long)]
    no_ui: bool,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// List scripts and whether each one is running.
    List,
    /// pip install a package (or a requirements file) into python/imports.
    Install {
        /// Package spec, e.g. `requests==2.31`.
        #[arg(required_unless_present = "requirement", conflicts_with = "requirement")]
        spec: Option<String>,
        /// Install from a requirements file.
        #[arg(short = 'r', long)]
        requirement: Option<PathBuf>,
        /// Extra arguments passed to pip after `--`.
        #[arg(last = true)]
        pip_args: Vec<String>,
    },
    /// Remove a package from python/imports.
    Uninstall { name: String },
    /// Remove bytecode caches from python/imports.
    Clean,
    /// List packages installed in python/imports.
    Packages,
}

impl Cli {
    fn overrides(&self) -> Overrides {
        let non_empty = |values: &Vec<String>| (!values.is_empty()).then(|| values.clone());
        Overrides {
            root_dir: self.root.clone(),
            python: self.python.clone(),
            interpreter_names: non_empty(&self.interpreter_names),
            extensions: non_empty(&self.extensions),
            scan_interval_ms: self.scan_interval_ms,
            watch_debounce_ms: self.watch_debounce_ms,
            stop_grace_ms: self.stop_grace_ms,
            shell_grace_ms: self.shell_grace_ms,
            shutdown_grace_ms: self.shutdown_grace_ms,
            max_lines: self.max_lines,
            no_symbols: self.no_symbols,
            log_file: self.log_file.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = load_settings(&cli)?;
    let tui_mode = cli.command.is_none() && !cli.no_ui;
    init_tracing(&settings, tui_mode)?;
    settings.layout.ensure_scaffold()?;
    tracing::info!(
        root = %settings.layout.root.display(),
        python = %settings.python.display(),
        "pyrack starting"
    );

    match cli.command {
        Some(command) => run_command(command, &settings).await,
        None => run(settings, cli.no_ui).await,
    }
}

fn load_settings(cli: &Cli) -> Result<Settings> {
    let file = if cli.no_config {
        Config::default()
    } else {
        match cli.config.clone().or_else(default_config_path) {
            Some(path) => load_config(&path)?,
            None => Config::default(),
        }
    };
    Settings::resolve(&cli.overrides(), file)
}

// The TUI owns the terminal, so its logs go to the configured file or nowhere.
fn init_tracing(settings: &Settings, tui_mode: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("pyrack=info"));
    if !tui_mode {
        return tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_target(false)
            .try_init()
            .map_err(|err| anyhow!(err));
    }
    let Some(path) = &settings.log_file else {
        return Ok(());
    };
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open log file {}", path.display()))?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(Mutex::new(file))
        .with_ansi(false)
        .try_init()
        .map_err(|err| anyhow!(err))
}

async fn run(settings: Settings, headless: bool) -> Result<()> {
    let scripts_dir = settings.layout.scripts_dir.clone();
    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let forwarder = Arc::new(EventForwarder::new(event_tx.clone()));

    let launch = LaunchConfig::new(
        settings.python.clone(),
        scripts_dir.clone(),
        settings.layout.imports_dir.clone(),
    );
    let exit_tx = event_tx.clone();
    let registry = SupervisorRegistry::with_exit_listener(
        launch,
        Arc::new(move |id: &ScriptId, code: Option<i32>| {
            let _ = exit_tx.send(Event::SupervisorExited {
                id: id.clone(),
                code,
            });
        }),
    );

    let nudge = Arc::new(Notify::new());
    let watcher = Arc::new(
        DirectoryWatcher::new(
            scripts_dir.clone(),
            &settings.extensions,
            settings.watch_debounce,
            forwarder.clone(),
        )?
        .with_nudge(Arc::clone(&nudge)),
    );
    let resolver = TargetResolver::new(
        &scripts_dir,
        &settings.interpreter_names,
        &settings.extensions,
    );
    let reconciler = Reconciler::new(
        Arc::new(TableScanner::for_host(resolver)),
        forwarder,
        watcher.subscribe(),
        settings.scan_interval,
        nudge,
    )
    .spawn();
    watcher.start()?;

    let controller = Controller::new(
        registry.clone(),
        Arc::clone(&watcher),
        PackageManager::new(settings.python.clone(), settings.layout.imports_dir.clone()),
        event_tx.clone(),
        StopBudgets {
            script: settings.stop_grace,
            shell: settings.shell_grace,
        },
    );
    let mut app = App::new(
        ScriptId::shell_slot(&scripts_dir),
        settings.max_lines,
        settings.use_symbols,
    );

    let mut terminal = if headless {
        None
    } else {
        Some(tui::init_terminal()?)
    };
    if headless {
        spawn_stdin_listener(event_tx.clone());
        println!("pyrack: watching {} (type 'help')", scripts_dir.display());
    } else {
        spawn_input_listener(event_tx.clone());
    }
    spawn_signal_listener(event_tx.clone());

    let mut ticker = tokio::time::interval(Duration::from_millis(150));
    let mut result = Ok(());
    loop {
        tokio::select! {
            Some(event) = event_rx.recv() => match event {
                Event::Key(key) => {
                    let action = app.handle_key(key);
                    controller.handle_action(&mut app, action);
                }
                Event::Resize { .. } => {
                    if let Some(term) = terminal.as_mut() {
                        let _ = term.autoresize();
                    }
                }
                Event::Command(line) => {
                    if controller.handle_command(&mut app, &line) {
                        app.should_quit = true;
                    }
                }
                Event::Shutdown => {
                    tracing::info!("shutdown requested");
                    app.should_quit = true;
                }
                other => {
                    if headless {
                        print_output(&other);
                    }
                    controller.handle_event(&mut app, other);
                }
            },
            _ = ticker.tick() => {}
        }

        if let Some(term) = terminal.as_mut() {
            if let Err(err) = tui::draw(&mut app, term) {
                result = Err(err.into());
                break;
            }
        }
        if app.should_quit {
            break;
        }
    }

    if let Some(term) = terminal.as_mut() {
        app.set_status_warning_for("Stopping all scripts...", settings.shutdown_grace);
        let _ = tui::draw(&mut app, term);
    }
    watcher.stop();
    reconciler.join().await;
    registry.stop_all_and_clear(settings.shutdown_grace).await;
    if headless {
        while let Ok(event) = event_rx.try_recv() {
            print_output(&event);
        }
    }
    if let Some(term) = terminal {
        tui::restore_terminal(term)?;
    }
    tracing::info!("pyrack stopped");
    result
}

fn print_output(event: &Event) {
    if let Event::Output(line) = event {
        println!("{}", sanitize_text(line));
    }
}

fn spawn_input_listener(tx: mpsc::UnboundedSender<Event>) {
    std::thread::spawn(move || loop {
        if crossterm::event::poll(Duration::from_millis(100)).unwrap_or(false) {
            let sent = match crossterm::event::read() {
                Ok(crossterm::event::Event::Key(key)) => tx.send(Event::Key(key)),
                Ok(crossterm::event::Event::Resize(width, height)) => {
                    tx.send(Event::Resize { width, height })
                }
                _ => Ok(()),
            };
            if sent.is_err() {
                break;
            }
        }
    });
}

fn spawn_signal_listener(tx: mpsc::UnboundedSender<Event>) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(signal) => signal,
                Err(err) => {
                    tracing::warn!(error = %err, "cannot listen for SIGTERM");
                    let _ = tokio::signal::ctrl_c().await;
                    let _ = tx.send(Event::Shutdown);
                    return;
                }
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
        let _ = tx.send(Event::Shutdown);
    });
}

// End of input is not a quit request; a backgrounded pyrack keeps running.
fn spawn_stdin_listener(tx: mpsc::UnboundedSender<Event>) {
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else {
                break;
            };
            if tx.send(Event::Command(line)).is_err() {
                break;
            }
        }
    });
}

async fn run_command(command: Commands, settings: &Settings) -> Result<()> {
    let packages = PackageManager::new(
        settings.python.clone(),
        settings.layout.imports_dir.clone(),
    );
    let stdout_sink = OutputSink::new(|line| println!("{line}"));
    match command {
        Commands::List => list_scripts(settings).await,
        Commands::Install {
            spec,
            requirement,
            pip_args,
        } => {
            let code = match (requirement, spec) {
                (Some(file), _) => {
                    packages
                        .install_requirements(&file, &pip_args, &stdout_sink)
                        .await
                }
                (None, Some(spec)) => packages.install(&spec, &pip_args, &stdout_sink).await,
                (None, None) => bail!("nothing to install"),
            };
            if code != 0 {
                bail!("pip exited with code {code}");
            }
            Ok(())
        }
        Commands::Uninstall { name } => {
            let removed = packages.uninstall(&name)?;
            if removed == 0 {
                println!("{name}: nothing to remove in {}", packages.imports_dir().display());
            } else {
                println!("{name}: removed {removed} entries");
            }
            Ok(())
        }
        Commands::Clean => {
            let removed = packages.clean()?;
            println!("removed {removed} cache entries");
            Ok(())
        }
        Commands::Packages => {
            let installed = packages.list_installed().await;
            if installed.is_empty() {
                println!("no packages in {}", packages.imports_dir().display());
            }
            for package in installed {
                println!(
                    "{:<32} {}",
                    package.name,
                    package.version.as_deref().unwrap_or("-")
                );
            }
            Ok(())
        }
    }
}

/// One directory snapshot plus one process table scan.
async fn list_scripts(settings: &Settings) -> Result<()> {
    let scripts_dir = settings.layout.scripts_dir.clone();
    let (tx, _rx) = mpsc::unbounded_channel();
    let watcher = DirectoryWatcher::new(
        scripts_dir.clone(),
        &settings.extensions,
        settings.watch_debounce,
        Arc::new(EventForwarder::new(tx)),
    )?;
    let known = watcher.force_rescan_now();
    if known.is_empty() {
        println!("no scripts in {}", scripts_dir.display());
        return Ok(());
    }
    let scanner = TableScanner::for_host(TargetResolver::new(
        &scripts_dir,
        &settings.interpreter_names,
        &settings.extensions,
    ));
    let scan_known = Arc::clone(&known);
    let found: HashMap<ScriptId, u32> =
        tokio::task::spawn_blocking(move || scanner.scan(scan_known.set()))
            .await
            .context("process scan failed")?;
    for id in known.ids() {
        match found.get(id) {
            Some(pid) => println!("{:<32} running (PID={pid})", id.file_name()),
            None => println!("{:<32} off", id.file_name()),
        }
    }
    Ok(())
}

fn help_styles() -> Styles {
    Styles::styled()
        .header(
            Style::new()
                .fg_color(Some(AnsiColor::Cyan.into()))
                .effects(Effects::BOLD),
        )
        .usage(
            Style::new()
                .fg_color(Some(AnsiColor::Green.into()))
                .effects(Effects::BOLD),
        )
        .literal(Style::new().fg_color(Some(AnsiColor::Yellow.into())))
        .placeholder(Style::new().fg_color(Some(AnsiColor::Magenta.into())))
        .valid(Style::new().fg_color(Some(AnsiColor::Green.into())))
        .invalid(
            Style::new()
                .fg_color(Some(AnsiColor::Red.into()))
                .effects(Effects::BOLD),
        )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_flags_become_overrides() {
        let cli = Cli::try_parse_from([
            "pyrack",
            "--root",
            "/srv/py",
            "--interpreter",
            "python3,pypy3",
            "--stop-grace-ms",
            "900",
            "--no-symbols",
        ])
        .unwrap();
        let overrides = cli.overrides();
        assert_eq!(overrides.root_dir, Some(PathBuf::from("/srv/py")));
        assert_eq!(
            overrides.interpreter_names,
            Some(vec!["python3".to_string(), "pypy3".to_string()])
        );
        assert_eq!(overrides.extensions, None);
        assert_eq!(overrides.stop_grace_ms, Some(900));
        assert!(overrides.no_symbols);
    }

    #[test]
    fn install_takes_spec_or_requirements() {
        let cli = Cli::try_parse_from(["pyrack", "install", "requests", "--", "--pre"]).unwrap();
        match cli.command {
            Some(Commands::Install { spec, requirement, pip_args }) => {
                assert_eq!(spec.as_deref(), Some("requests"));
                assert_eq!(requirement, None);
                assert_eq!(pip_args, vec!["--pre"]);
            }
            other => panic!("unexpected {other:?}"),
        }
        let cli = Cli::try_parse_from(["pyrack", "install", "-r", "req.txt"]).unwrap();
        assert!(matches!(
            cli.command,
            Some(Commands::Install { requirement: Some(_), spec: None, .. })
        ));
        assert!(Cli::try_parse_from(["pyrack", "install"]).is_err());
        assert!(Cli::try_parse_from(["pyrack", "install", "x", "-r", "req.txt"]).is_err());
    }

    #[test]
    fn no_config_ignores_files() {
        let cli = Cli::try_parse_from([
            "pyrack",
            "--no-config",
            "--config",
            "/definitely/missing.toml",
            "--python",
            "/usr/bin/python3",
        ])
        .unwrap();
        let settings = load_settings(&cli).unwrap();
        assert_eq!(settings.python, PathBuf::from("/usr/bin/python3"));
    }
}
