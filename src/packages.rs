//! Package management for the imports directory.
//!
//! Installs go through `python -m pip install -t <imports>`, with pip's output streamed to an
//! `OutputSink` under a `[pip] ` prefix. Removal and cache cleaning work on the directory
//! directly, since pip cannot uninstall from a `--target` tree.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;

use crate::output::OutputSink;
use crate::process::{exit_code, python_env};

const PIP_PREFIX: &str = "[pip] ";
const INSTALL_TIMEOUT: Duration = Duration::from_secs(600);
const PROBE_TIMEOUT: Duration = Duration::from_secs(30);
const PUMP_DRAIN: Duration = Duration::from_secs(2);

/// A package found in the imports directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledPackage {
    pub name: String,
    pub version: Option<String>,
}

/// Runs pip against the imports directory.
#[derive(Debug, Clone)]
pub struct PackageManager {
    python: PathBuf,
    imports_dir: PathBuf,
    timeout: Duration,
}

impl PackageManager {
    pub fn new(python: PathBuf, imports_dir: PathBuf) -> Self {
        Self {
            python,
            imports_dir,
            timeout: INSTALL_TIMEOUT,
        }
    }

    pub fn imports_dir(&self) -> &Path {
        &self.imports_dir
    }

    /// Installs `spec` (anything pip accepts) plus `extra` pip arguments.
    ///
    /// Returns pip's exit code, or -1 if pip could not run or timed out.
    pub async fn install(&self, spec: &str, extra: &[String], sink: &OutputSink) -> i32 {
        let spec = spec.trim();
        if spec.is_empty() {
            sink.emit(format!("{PIP_PREFIX}nothing to install"));
            return -1;
        }
        if !self.check_python_and_pip(sink).await {
            return -1;
        }
        sink.emit(format!("{PIP_PREFIX}installing {spec}"));
        let code = self.run_logged(self.install_args(&[spec], extra), sink).await;
        sink.emit(format!("{PIP_PREFIX}finished with code {code}"));
        code
    }

    /// Installs everything listed in a requirements file.
    pub async fn install_requirements(&self, file: &Path, extra: &[String], sink: &OutputSink) -> i32 {
        if !file.is_file() {
            sink.emit(format!("{PIP_PREFIX}requirements file not found: {}", file.display()));
            return -1;
        }
        if !self.check_python_and_pip(sink).await {
            return -1;
        }
        let file = file.display().to_string();
        sink.emit(format!("{PIP_PREFIX}installing requirements from {file}"));
        let code = self
            .run_logged(self.install_args(&["-r", &file], extra), sink)
            .await;
        sink.emit(format!("{PIP_PREFIX}finished with code {code}"));
        code
    }

    fn install_args(&self, target: &[&str], extra: &[String]) -> Vec<String> {
        let mut args: Vec<String> = [
            "-m",
            "pip",
            "install",
            "--upgrade",
            "--no-warn-script-location",
            "-t",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        args.push(self.imports_dir.display().to_string());
        args.extend(target.iter().map(|s| s.to_string()));
        args.extend(extra.iter().cloned());
        args
    }

    /// `python --version`, trimmed. Python 2 prints it on stderr, so both streams count.
    pub async fn python_version(&self) -> Option<String> {
        self.probe(&["--version"]).await
    }

    /// `python -m pip --version`, trimmed.
    pub async fn pip_version(&self) -> Option<String> {
        self.probe(&["-m", "pip", "--version"]).await
    }

    /// Verifies the interpreter runs and pip is importable, bootstrapping pip with `ensurepip`.
    pub async fn check_python_and_pip(&self, sink: &OutputSink) -> bool {
        if self.python_version().await.is_none() {
            sink.emit(format!(
                "{PIP_PREFIX}python not usable: {}",
                self.python.display()
            ));
            return false;
        }
        if self.pip_version().await.is_some() {
            return true;
        }
        sink.emit(format!("{PIP_PREFIX}pip missing; bootstrapping with ensurepip"));
        let args = ["-m", "ensurepip", "--upgrade"].map(String::from).to_vec();
        let code = self.run_logged(args, sink).await;
        if code != 0 {
            sink.emit(format!("{PIP_PREFIX}ensurepip failed with code {code}"));
            return false;
        }
        self.pip_version().await.is_some()
    }

    /// Removes a package from the imports directory: its package directory or module file,
    /// its metadata directories and the top-level modules those declare.
    ///
    /// Returns how many entries were removed.
    pub fn uninstall(&self, name: &str) -> Result<usize> {
        let wanted = normalized_names(name);
        if wanted.is_empty() {
            return Ok(0);
        }
        let entries = match fs::read_dir(&self.imports_dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(err) => {
                return Err(err).with_context(|| {
                    format!("failed to list {}", self.imports_dir.display())
                })
            }
        };
        let entries: Vec<PathBuf> = entries.flatten().map(|entry| entry.path()).collect();

        let mut modules = wanted.clone();
        for path in &entries {
            if is_metadata_for(path, &wanted) {
                modules.extend(read_top_level(path));
            }
        }

        let mut removed = 0;
        for path in &entries {
            let Some(file_name) = path.file_name().map(|n| n.to_string_lossy().to_lowercase())
            else {
                continue;
            };
            let module = file_name.strip_suffix(".py").unwrap_or(&file_name);
            if !(modules.contains(module) || is_metadata_for(path, &wanted)) {
                continue;
            }
            let result = if path.is_dir() {
                fs::remove_dir_all(path)
            } else {
                fs::remove_file(path)
            };
            match result {
                Ok(()) => removed += 1,
                Err(err) => {
                    tracing::warn!(path = %path.display(), error = %err, "failed to remove")
                }
            }
        }
        tracing::info!(package = name, removed, "package removed");
        Ok(removed)
    }

    /// Deletes `__pycache__` directories and `*.pyc` / `*.pyo` files under the imports
    /// directory. Returns how many entries were removed.
    pub fn clean(&self) -> Result<usize> {
        if !self.imports_dir.exists() {
            return Ok(0);
        }
        let mut removed = 0;
        let mut pending = vec![self.imports_dir.clone()];
        while let Some(dir) = pending.pop() {
            let entries = fs::read_dir(&dir)
                .with_context(|| format!("failed to list {}", dir.display()))?;
            for entry in entries.flatten() {
                let path = entry.path();
                let Ok(kind) = entry.file_type() else {
                    continue;
                };
                if kind.is_dir() {
                    if entry.file_name() == "__pycache__" {
                        match fs::remove_dir_all(&path) {
                            Ok(()) => removed += 1,
                            Err(err) => tracing::warn!(path = %path.display(), error = %err, "failed to remove"),
                        }
                    } else {
                        pending.push(path);
                    }
                } else if is_bytecode(&path) {
                    match fs::remove_file(&path) {
                        Ok(()) => removed += 1,
                        Err(err) => tracing::warn!(path = %path.display(), error = %err, "failed to remove"),
                    }
                }
            }
        }
        Ok(removed)
    }

    /// Packages installed in the imports directory, as pip reports them, falling back to the
    /// `*.dist-info` directories when pip is unavailable.
    pub async fn list_installed(&self) -> Vec<InstalledPackage> {
        let imports = self.imports_dir.display().to_string();
        let args = ["-m", "pip", "list", "--path", &imports, "--format", "columns"];
        if let Some(output) = self.capture(&args).await.filter(|(code, _)| *code == 0) {
            return parse_pip_columns(&output.1);
        }
        dist_info_packages(&self.imports_dir)
    }

    fn pip_env(&self) -> HashMap<String, String> {
        let base: HashMap<String, String> = std::env::vars().collect();
        let mut env = python_env(&base, &self.imports_dir);
        env.insert(
            "PIP_TARGET".to_string(),
            self.imports_dir.display().to_string(),
        );
        env
    }

    fn command(&self, args: &[String]) -> Command {
        let mut command = Command::new(&self.python);
        command
            .args(args)
            .envs(self.pip_env())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }

    // Streams both pipes into the sink and waits with the install timeout.
    async fn run_logged(&self, args: Vec<String>, sink: &OutputSink) -> i32 {
        let mut child = match self.command(&args).spawn() {
            Ok(child) => child,
            Err(err) => {
                sink.emit(format!(
                    "{PIP_PREFIX}failed to run {}: {err}",
                    self.python.display()
                ));
                return -1;
            }
        };
        let mut pumps = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            pumps.push(tokio::spawn(prefix_lines(stdout, sink.clone())));
        }
        if let Some(stderr) = child.stderr.take() {
            pumps.push(tokio::spawn(prefix_lines(stderr, sink.clone())));
        }

        let code = match tokio::time::timeout(self.timeout, child.wait()).await {
            Ok(Ok(status)) => exit_code(&status).unwrap_or(-1),
            Ok(Err(err)) => {
                sink.emit(format!("{PIP_PREFIX}wait failed: {err}"));
                -1
            }
            Err(_) => {
                let _ = child.kill().await;
                sink.emit(format!(
                    "{PIP_PREFIX}timed out after {} s; killed",
                    self.timeout.as_secs()
                ));
                -1
            }
        };
        for pump in pumps {
            let _ = tokio::time::timeout(PUMP_DRAIN, pump).await;
        }
        code
    }

    // Runs a short command and returns its exit code and combined output.
    async fn capture(&self, args: &[&str]) -> Option<(i32, String)> {
        let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
        let child = self.command(&args).spawn().ok()?;
        let output = tokio::time::timeout(PROBE_TIMEOUT, child.wait_with_output())
            .await
            .ok()?
            .ok()?;
        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        Some((exit_code(&output.status).unwrap_or(-1), text))
    }

    async fn probe(&self, args: &[&str]) -> Option<String> {
        let (code, text) = self.capture(args).await?;
        let text = text.trim();
        (code == 0 && !text.is_empty()).then(|| text.to_string())
    }
}

async fn prefix_lines<R>(reader: R, sink: OutputSink)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        sink.emit(format!("{PIP_PREFIX}{line}"));
    }
}

// Package names compare case-insensitively with `-` and `_` interchangeable.
fn normalized_names(name: &str) -> HashSet<String> {
    let name = name.trim().to_lowercase();
    if name.is_empty() {
        return HashSet::new();
    }
    [name.clone(), name.replace('-', "_"), name.replace('_', "-")]
        .into_iter()
        .collect()
}

fn is_metadata_for(path: &Path, wanted: &HashSet<String>) -> bool {
    let Some(file_name) = path.file_name().map(|n| n.to_string_lossy().to_lowercase()) else {
        return false;
    };
    let Some(stem) = file_name
        .strip_suffix(".dist-info")
        .or_else(|| file_name.strip_suffix(".egg-info"))
    else {
        return false;
    };
    let project = stem.split_once('-').map(|(name, _)| name).unwrap_or(stem);
    wanted.contains(project) || wanted.contains(&project.replace('_', "-"))
}

fn read_top_level(metadata_dir: &Path) -> Vec<String> {
    fs::read_to_string(metadata_dir.join("top_level.txt"))
        .map(|text| {
            text.lines()
                .map(|line| line.trim().to_lowercase())
                .filter(|line| !line.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

fn is_bytecode(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.eq_ignore_ascii_case("pyc") || ext.eq_ignore_ascii_case("pyo"))
        .unwrap_or(false)
}

/// Parses `pip list --format columns`: a header, a dashed rule, then `name version` rows.
pub fn parse_pip_columns(text: &str) -> Vec<InstalledPackage> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter(|line| !line.starts_with("Package") && !line.starts_with("---"))
        .filter(|line| !line.starts_with("WARNING") && !line.starts_with("[notice]"))
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let name = parts.next()?.to_string();
            Some(InstalledPackage {
                name,
                version: parts.next().map(str::to_string),
            })
        })
        .collect()
}

fn dist_info_packages(imports_dir: &Path) -> Vec<InstalledPackage> {
    let Ok(entries) = fs::read_dir(imports_dir) else {
        return Vec::new();
    };
    let mut packages: Vec<InstalledPackage> = entries
        .flatten()
        .filter_map(|entry| {
            let name = entry.file_name().to_string_lossy().into_owned();
            let stem = name.strip_suffix(".dist-info")?;
            let (name, version) = match stem.split_once('-') {
                Some((name, version)) => (name.to_string(), Some(version.to_string())),
                None => (stem.to_string(), None),
            };
            Some(InstalledPackage { name, version })
        })
        .collect();
    packages.sort_by(|a, b| a.name.to_lowercase().cmp(&b.name.to_lowercase()));
    packages
}
