//! Configuration management for pyrack.
//!
//! `pyrack.toml` supplies optional values, command-line flags override them, and `Settings`
//! holds the fully resolved result that `main` hands to every component.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Name of the config file looked up in the current directory.
pub const CONFIG_FILE_NAME: &str = "pyrack.toml";

const DEFAULT_INTERPRETERS: [&str; 2] = ["python3", "python"];
const DEFAULT_EXTENSIONS: [&str; 2] = ["py", "pyw"];
const DEFAULT_SCAN_INTERVAL_MS: u64 = 2000;
const DEFAULT_WATCH_DEBOUNCE_MS: u64 = 150;
const DEFAULT_STOP_GRACE_MS: u64 = 3000;
const DEFAULT_SHELL_GRACE_MS: u64 = 2000;
const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 3000;
const DEFAULT_MAX_LINES: usize = 10_000;

/// Top-level structure of `pyrack.toml`. Every key is optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Directory holding `scripts/` and `python/imports/`.
    pub root_dir: Option<PathBuf>,
    /// Interpreter used for scripts, the shell and pip.
    pub python: Option<PathBuf>,
    /// Executable names recognised as interpreters when scanning the process table.
    pub interpreter_names: Option<Vec<String>>,
    /// File extensions treated as scripts.
    pub extensions: Option<Vec<String>>,
    pub scan_interval_ms: Option<u64>,
    pub watch_debounce_ms: Option<u64>,
    /// Grace budget when the user stops a script.
    pub stop_grace_ms: Option<u64>,
    /// Grace budget when the user stops the interactive shell.
    pub shell_grace_ms: Option<u64>,
    /// Grace budget for every process on exit.
    pub shutdown_grace_ms: Option<u64>,
    /// Maximum number of console lines kept in memory.
    pub max_lines: Option<usize>,
    /// Whether to use Unicode symbols in the TUI (default: true).
    pub symbols: Option<bool>,
    /// File receiving diagnostic logs while the TUI owns the terminal.
    pub log_file: Option<PathBuf>,
}

/// Loads and parses the configuration from a file path.
pub fn load_config(path: &Path) -> Result<Config> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let config: Config = toml::from_str(&raw)
        .with_context(|| format!("failed to parse config file {}", path.display()))?;
    Ok(config)
}

/// `pyrack.toml` in the current directory, if present.
pub fn default_config_path() -> Option<PathBuf> {
    let path = Path::new(CONFIG_FILE_NAME);
    path.exists().then(|| path.to_path_buf())
}

/// Values given on the command line; `None` means "not given".
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub root_dir: Option<PathBuf>,
    pub python: Option<PathBuf>,
    pub interpreter_names: Option<Vec<String>>,
    pub extensions: Option<Vec<String>>,
    pub scan_interval_ms: Option<u64>,
    pub watch_debounce_ms: Option<u64>,
    pub stop_grace_ms: Option<u64>,
    pub shell_grace_ms: Option<u64>,
    pub shutdown_grace_ms: Option<u64>,
    pub max_lines: Option<usize>,
    pub no_symbols: bool,
    pub log_file: Option<PathBuf>,
}

/// Directory layout under the root directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    pub root: PathBuf,
    pub scripts_dir: PathBuf,
    pub imports_dir: PathBuf,
}

impl Layout {
    pub fn new(root: &Path) -> Self {
        let root = crate::identity::normalize_path(root);
        Self {
            scripts_dir: root.join("scripts"),
            imports_dir: root.join("python").join("imports"),
            root,
        }
    }

    /// Creates `scripts/` and `python/imports/` if missing.
    pub fn ensure_scaffold(&self) -> Result<()> {
        for dir in [&self.scripts_dir, &self.imports_dir] {
            fs::create_dir_all(dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        Ok(())
    }
}

/// Fully resolved runtime configuration.
#[derive(Debug, Clone)]
pub struct Settings {
    pub layout: Layout,
    pub python: PathBuf,
    pub interpreter_names: Vec<String>,
    pub extensions: Vec<String>,
    pub scan_interval: Duration,
    pub watch_debounce: Duration,
    pub stop_grace: Duration,
    pub shell_grace: Duration,
    pub shutdown_grace: Duration,
    pub max_lines: usize,
    pub use_symbols: bool,
    pub log_file: Option<PathBuf>,
}

impl Settings {
    /// Merges command line over file over defaults.
    pub fn resolve(cli: &Overrides, file: Config) -> Result<Self> {
        let root = match cli.root_dir.clone().or(file.root_dir) {
            Some(root) if root.is_absolute() => root,
            Some(root) => std::env::current_dir()
                .context("failed to resolve current dir")?
                .join(root),
            None => std::env::current_dir().context("failed to resolve current dir")?,
        };
        let interpreter_names = cli
            .interpreter_names
            .clone()
            .or(file.interpreter_names)
            .filter(|names| !names.is_empty())
            .unwrap_or_else(|| DEFAULT_INTERPRETERS.iter().map(|s| s.to_string()).collect());
        let extensions = cli
            .extensions
            .clone()
            .or(file.extensions)
            .filter(|exts| !exts.is_empty())
            .unwrap_or_else(|| DEFAULT_EXTENSIONS.iter().map(|s| s.to_string()).collect())
            .into_iter()
            .map(|ext| ext.trim_start_matches('.').to_lowercase())
            .collect();
        let python = cli
            .python
            .clone()
            .or(file.python)
            .or_else(|| discover_python(&DEFAULT_INTERPRETERS))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_INTERPRETERS[0]));
        let millis = |cli: Option<u64>, file: Option<u64>, default: u64| {
            Duration::from_millis(cli.or(file).unwrap_or(default))
        };

        Ok(Self {
            layout: Layout::new(&root),
            python,
            interpreter_names,
            extensions,
            scan_interval: millis(
                cli.scan_interval_ms,
                file.scan_interval_ms,
                DEFAULT_SCAN_INTERVAL_MS,
            ),
            watch_debounce: millis(
                cli.watch_debounce_ms,
                file.watch_debounce_ms,
                DEFAULT_WATCH_DEBOUNCE_MS,
            ),
            stop_grace: millis(cli.stop_grace_ms, file.stop_grace_ms, DEFAULT_STOP_GRACE_MS),
            shell_grace: millis(cli.shell_grace_ms, file.shell_grace_ms, DEFAULT_SHELL_GRACE_MS),
            shutdown_grace: millis(
                cli.shutdown_grace_ms,
                file.shutdown_grace_ms,
                DEFAULT_SHUTDOWN_GRACE_MS,
            ),
            max_lines: cli.max_lines.or(file.max_lines).unwrap_or(DEFAULT_MAX_LINES),
            use_symbols: !cli.no_symbols && file.symbols.unwrap_or(true),
            log_file: cli.log_file.clone().or(file.log_file),
        })
    }
}

/// First of `names` found as a file on `PATH`.
pub fn discover_python(names: &[&str]) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    find_in_dirs(names, std::env::split_paths(&path))
}

fn find_in_dirs(names: &[&str], dirs: impl Iterator<Item = PathBuf>) -> Option<PathBuf> {
    let dirs: Vec<PathBuf> = dirs.collect();
    for name in names {
        for dir in &dirs {
            let candidate = dir.join(name);
            if candidate.is_file() {
                return Some(candidate);
            }
            if cfg!(windows) {
                let exe = candidate.with_extension("exe");
                if exe.is_file() {
                    return Some(exe);
                }
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_optional_fields() {
        let raw = r#"
root_dir = "/srv/pyrack"
python = "/usr/bin/python3.12"
interpreter_names = ["python3", "pypy3"]
extensions = ["py"]
scan_interval_ms = 500
watch_debounce_ms = 75
stop_grace_ms = 1500
shell_grace_ms = 900
shutdown_grace_ms = 4000
max_lines = 200
symbols = false
log_file = "pyrack.log"
"#;
        let config: Config = toml::from_str(raw).unwrap();
        assert_eq!(config.root_dir, Some(PathBuf::from("/srv/pyrack")));
        assert_eq!(config.interpreter_names.as_deref().map(<[String]>::len), Some(2));
        assert_eq!(config.scan_interval_ms, Some(500));
        assert_eq!(config.shell_grace_ms, Some(900));
        assert_eq!(config.max_lines, Some(200));
        assert_eq!(config.symbols, Some(false));
        assert_eq!(config.log_file, Some(PathBuf::from("pyrack.log")));
    }

    #[test]
    fn rejects_unknown_keys() {
        assert!(toml::from_str::<Config>("scan_interval = 5").is_err());
    }

    #[test]
    fn cli_overrides_file_and_defaults_fill_the_rest() {
        let file = Config {
            root_dir: Some(PathBuf::from("/srv/from-file")),
            python: Some(PathBuf::from("/opt/python")),
            stop_grace_ms: Some(1000),
            symbols: Some(true),
            extensions: Some(vec![".PY".to_string()]),
            ..Config::default()
        };
        let cli = Overrides {
            root_dir: Some(PathBuf::from("/srv/from-cli")),
            stop_grace_ms: Some(250),
            no_symbols: true,
            ..Overrides::default()
        };
        let settings = Settings::resolve(&cli, file).unwrap();
        assert_eq!(settings.layout.root, PathBuf::from("/srv/from-cli"));
        assert_eq!(
            settings.layout.scripts_dir,
            PathBuf::from("/srv/from-cli/scripts")
        );
        assert_eq!(
            settings.layout.imports_dir,
            PathBuf::from("/srv/from-cli/python/imports")
        );
        assert_eq!(settings.python, PathBuf::from("/opt/python"));
        assert_eq!(settings.stop_grace, Duration::from_millis(250));
        assert_eq!(settings.shell_grace, Duration::from_millis(2000));
        assert_eq!(settings.shutdown_grace, Duration::from_millis(3000));
        assert_eq!(settings.scan_interval, Duration::from_millis(2000));
        assert_eq!(settings.extensions, vec!["py"]);
        assert_eq!(settings.interpreter_names, vec!["python3", "python"]);
        assert!(!settings.use_symbols);
    }

    #[test]
    fn scaffold_creates_layout() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = Layout::new(tmp.path());
        layout.ensure_scaffold().unwrap();
        assert!(layout.scripts_dir.is_dir());
        assert!(layout.imports_dir.is_dir());
        layout.ensure_scaffold().unwrap();
    }

    #[test]
    fn finds_first_interpreter_in_path_order() {
        let first = tempfile::tempdir().unwrap();
        let second = tempfile::tempdir().unwrap();
        fs::write(second.path().join("python3"), "").unwrap();
        fs::write(first.path().join("python"), "").unwrap();
        let dirs = vec![first.path().to_path_buf(), second.path().to_path_buf()];
        assert_eq!(
            find_in_dirs(&["python3", "python"], dirs.clone().into_iter()),
            Some(second.path().join("python3"))
        );
        assert_eq!(find_in_dirs(&["pypy"], dirs.into_iter()), None);
    }
}
