//! Process-table scanning.
//!
//! Detects interpreter processes running one of the known scripts, whether or not pyrack started
//! them. Listing the OS process table is the platform-specific part (`ProcessLister`); turning an
//! argument vector into a script identity is shared (`TargetResolver`).
//!
//! Every host lists processes through `sysinfo`, which yields the exact argv, working directory and
//! parent. When it sees nothing, Unix falls back to parsing `ps` output and Windows to WMIC CSV
//! (PowerShell CIM JSON after that). The textual listings are lossy: arguments containing spaces
//! may split, and there is no working directory, so relative script paths resolve against the
//! scripts directory instead.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::{Mutex, OnceLock, PoisonError};

use regex::Regex;
use serde::Deserialize;
use sysinfo::System;

use crate::error::ScanError;
use crate::identity::ScriptId;

/// One row of the OS process table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessEntry {
    pub pid: u32,
    pub ppid: Option<u32>,
    /// Full argument vector, executable first.
    pub argv: Vec<String>,
    /// Working directory, when the platform exposes it.
    pub cwd: Option<PathBuf>,
}

/// Produces a snapshot of the OS process table.
pub trait ProcessLister: Send + Sync {
    fn name(&self) -> &'static str;
    fn list(&self) -> Result<Vec<ProcessEntry>, ScanError>;
}

/// Maps known script identities to the pid currently running them.
pub trait ProcessTableScanner: Send + Sync {
    /// Never fails: a listing error yields an empty map for this cycle.
    fn scan(&self, known: &HashSet<ScriptId>) -> HashMap<ScriptId, u32>;
}

/// Infers which script an interpreter process is running.
#[derive(Debug, Clone)]
pub struct TargetResolver {
    scripts_dir: PathBuf,
    interpreter_names: Vec<String>,
    extensions: Vec<String>,
}

impl TargetResolver {
    pub fn new(scripts_dir: &Path, interpreter_names: &[String], extensions: &[String]) -> Self {
        let mut names: Vec<String> = interpreter_names
            .iter()
            .map(|name| name.trim().to_lowercase())
            .filter(|name| !name.is_empty())
            .collect();
        if names.is_empty() {
            names = vec!["python3".to_string(), "python".to_string()];
        }
        Self {
            scripts_dir: scripts_dir.to_path_buf(),
            interpreter_names: names,
            extensions: extensions
                .iter()
                .map(|ext| ext.trim_start_matches('.').to_lowercase())
                .collect(),
        }
    }

    /// True if `exe` names one of the accepted interpreters, allowing version suffixes
    /// (`python3.12`), a `w` suffix (`pythonw`) and a `.exe` extension.
    pub fn looks_like_interpreter(&self, exe: &str) -> bool {
        let base = exe
            .rsplit(|c| c == '/' || c == '\\')
            .next()
            .unwrap_or(exe)
            .to_lowercase();
        let base = base.strip_suffix(".exe").unwrap_or(&base);
        self.interpreter_names.iter().any(|name| {
            let Some(rest) = base.strip_prefix(name.as_str()) else {
                return false;
            };
            rest == "w" || rest.chars().all(|c| c.is_ascii_digit() || c == '.')
        })
    }

    fn has_script_extension(&self, token: &str) -> bool {
        Path::new(token)
            .extension()
            .map(|ext| {
                let ext = ext.to_string_lossy().to_lowercase();
                self.extensions.iter().any(|known| *known == ext)
            })
            .unwrap_or(false)
    }

    /// Parses an interpreter argv (executable first) into the script it runs.
    ///
    /// `-c` means inline code and disqualifies the process. `-m pkg.mod` maps to
    /// `<scripts_dir>/pkg/mod.py` and only counts if that file exists. Otherwise the first
    /// non-option token with a script extension wins, resolved against `cwd` when relative.
    pub fn extract_target(&self, argv: &[String], cwd: Option<&Path>) -> Option<ScriptId> {
        let mut expect_module = false;
        for token in argv.iter().skip(1) {
            let token = token.trim();
            if token.is_empty() {
                continue;
            }
            if expect_module {
                let module = token
                    .split('.')
                    .fold(self.scripts_dir.clone(), |path, part| path.join(part))
                    .with_extension("py");
                return module.is_file().then(|| ScriptId::new(module));
            }
            match token {
                "-c" => return None,
                "-m" => expect_module = true,
                t if t.starts_with('-') => {}
                t if self.has_script_extension(t) => {
                    let base = cwd.unwrap_or(&self.scripts_dir);
                    return Some(ScriptId::resolve(base, t));
                }
                _ => {}
            }
        }
        None
    }

    /// Matches a process listing against the known identities.
    ///
    /// When several processes run the same script the lowest pid wins, so the answer stays
    /// stable from one cycle to the next.
    pub fn match_entries(
        &self,
        entries: &[ProcessEntry],
        known: &HashSet<ScriptId>,
    ) -> HashMap<ScriptId, u32> {
        let mut found = HashMap::new();
        if known.is_empty() {
            return found;
        }
        for entry in entries {
            let Some(exe) = entry.argv.first() else {
                continue;
            };
            if !self.looks_like_interpreter(exe) {
                continue;
            }
            let Some(target) = self.extract_target(&entry.argv, entry.cwd.as_deref()) else {
                continue;
            };
            if known.contains(&target) {
                found
                    .entry(target)
                    .and_modify(|pid: &mut u32| *pid = (*pid).min(entry.pid))
                    .or_insert(entry.pid);
            }
        }
        found
    }
}

/// A `ProcessTableScanner` built from a lister and a resolver.
pub struct TableScanner {
    lister: Box<dyn ProcessLister>,
    resolver: TargetResolver,
}

impl TableScanner {
    pub fn new(lister: Box<dyn ProcessLister>, resolver: TargetResolver) -> Self {
        Self { lister, resolver }
    }

    /// Picks the strategy for the host platform.
    pub fn for_host(resolver: TargetResolver) -> Self {
        Self::new(host_lister(), resolver)
    }
}

impl ProcessTableScanner for TableScanner {
    fn scan(&self, known: &HashSet<ScriptId>) -> HashMap<ScriptId, u32> {
        if known.is_empty() {
            return HashMap::new();
        }
        match self.lister.list() {
            Ok(entries) => self.resolver.match_entries(&entries, known),
            Err(err) => {
                tracing::warn!(lister = self.lister.name(), error = %err, "process scan failed");
                HashMap::new()
            }
        }
    }
}

/// Tries `primary`, falling back to `fallback` when it fails outright.
pub struct FallbackLister {
    primary: Box<dyn ProcessLister>,
    fallback: Box<dyn ProcessLister>,
}

impl FallbackLister {
    pub fn new(primary: Box<dyn ProcessLister>, fallback: Box<dyn ProcessLister>) -> Self {
        Self { primary, fallback }
    }
}

impl ProcessLister for FallbackLister {
    fn name(&self) -> &'static str {
        self.primary.name()
    }

    fn list(&self) -> Result<Vec<ProcessEntry>, ScanError> {
        match self.primary.list() {
            Ok(entries) => Ok(entries),
            Err(err) => {
                tracing::debug!(
                    primary = self.primary.name(),
                    fallback = self.fallback.name(),
                    error = %err,
                    "primary process lister failed"
                );
                self.fallback.list()
            }
        }
    }
}

/// The lister best suited to the host platform.
pub fn host_lister() -> Box<dyn ProcessLister> {
    let textual: Box<dyn ProcessLister> = if cfg!(windows) {
        Box::new(FallbackLister::new(Box::new(WmicLister), Box::new(CimLister)))
    } else {
        Box::new(PsLister)
    };
    Box::new(FallbackLister::new(Box::new(SysinfoLister::default()), textual))
}

/// Pids whose parent is `pid`. The listing runs on the blocking pool; failures yield nothing.
pub async fn child_pids(pid: u32) -> Vec<u32> {
    tokio::task::spawn_blocking(move || direct_children(host_lister().as_ref(), pid))
        .await
        .unwrap_or_default()
}

fn direct_children(lister: &dyn ProcessLister, pid: u32) -> Vec<u32> {
    match lister.list() {
        Ok(entries) => entries
            .into_iter()
            .filter(|entry| entry.ppid == Some(pid))
            .map(|entry| entry.pid)
            .collect(),
        Err(err) => {
            tracing::debug!(pid, error = %err, "child lookup failed");
            Vec::new()
        }
    }
}

/// Reads the process table through `sysinfo`. The `System` is kept between calls so each
/// refresh only has to look at processes it has not seen before.
pub struct SysinfoLister {
    system: Mutex<System>,
}

impl Default for SysinfoLister {
    fn default() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }
}

impl ProcessLister for SysinfoLister {
    fn name(&self) -> &'static str {
        "sysinfo"
    }

    fn list(&self) -> Result<Vec<ProcessEntry>, ScanError> {
        let mut system = self.system.lock().unwrap_or_else(PoisonError::into_inner);
        system.refresh_processes();
        let entries: Vec<ProcessEntry> = system
            .processes()
            .iter()
            .filter_map(|(pid, process)| {
                let argv = process.cmd().to_vec();
                // kernel threads, zombies and processes we may not inspect have no argv
                if argv.is_empty() {
                    return None;
                }
                Some(ProcessEntry {
                    pid: pid.as_u32(),
                    ppid: process.parent().map(|parent| parent.as_u32()),
                    argv,
                    cwd: process.cwd().map(Path::to_path_buf),
                })
            })
            .collect();
        if entries.is_empty() {
            return Err(ScanError::Empty(self.name()));
        }
        Ok(entries)
    }
}

/// Parses `ps -eo pid=,ppid=,args=`.
#[derive(Debug, Clone, Copy)]
pub struct PsLister;

impl ProcessLister for PsLister {
    fn name(&self) -> &'static str {
        "ps"
    }

    fn list(&self) -> Result<Vec<ProcessEntry>, ScanError> {
        let raw = run_listing("ps", &["-eo", "pid=,ppid=,args="])?;
        Ok(String::from_utf8_lossy(&raw)
            .lines()
            .filter_map(parse_ps_line)
            .collect())
    }
}

/// Parses a single `pid ppid args...` line; headers and malformed lines yield `None`.
pub fn parse_ps_line(line: &str) -> Option<ProcessEntry> {
    static PS_LINE: OnceLock<Option<Regex>> = OnceLock::new();
    let re = PS_LINE
        .get_or_init(|| Regex::new(r"^\s*(\d+)\s+(\d+)\s+(\S.*?)\s*$").ok())
        .as_ref()?;
    let caps = re.captures(line)?;
    let pid = caps[1].parse().ok()?;
    let ppid = caps[2].parse().ok();
    let argv: Vec<String> = caps[3].split_whitespace().map(str::to_string).collect();
    Some(ProcessEntry {
        pid,
        ppid,
        argv,
        cwd: None,
    })
}

/// Parses `wmic process get CommandLine,ParentProcessId,ProcessId /format:csv`.
#[derive(Debug, Clone, Copy)]
pub struct WmicLister;

impl ProcessLister for WmicLister {
    fn name(&self) -> &'static str {
        "wmic"
    }

    fn list(&self) -> Result<Vec<ProcessEntry>, ScanError> {
        let raw = run_listing(
            "wmic",
            &[
                "process",
                "get",
                "CommandLine,ParentProcessId,ProcessId",
                "/format:csv",
            ],
        )?;
        Ok(parse_wmic_csv(&decode_console_output(&raw)))
    }
}

/// Parses WMIC CSV rows: `Node,CommandLine,ParentProcessId,ProcessId`.
///
/// The command line may itself contain commas, so the numeric columns are taken from the right.
pub fn parse_wmic_csv(text: &str) -> Vec<ProcessEntry> {
    let mut entries = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with("Node,") {
            continue;
        }
        let Some((_node, rest)) = line.split_once(',') else {
            continue;
        };
        let mut columns = rest.rsplitn(3, ',');
        let (Some(pid), Some(ppid), Some(command_line)) =
            (columns.next(), columns.next(), columns.next())
        else {
            continue;
        };
        let Ok(pid) = pid.trim().parse() else {
            continue;
        };
        let argv = split_command_line(command_line);
        if argv.is_empty() {
            continue;
        }
        entries.push(ProcessEntry {
            pid,
            ppid: ppid.trim().parse().ok(),
            argv,
            cwd: None,
        });
    }
    entries
}

/// Queries `Win32_Process` through PowerShell and parses the JSON it prints.
#[derive(Debug, Clone, Copy)]
pub struct CimLister;

const CIM_QUERY: &str = "Get-CimInstance Win32_Process | \
    Select-Object ProcessId,ParentProcessId,CommandLine | ConvertTo-Json -Compress";

impl ProcessLister for CimLister {
    fn name(&self) -> &'static str {
        "powershell-cim"
    }

    fn list(&self) -> Result<Vec<ProcessEntry>, ScanError> {
        let raw = run_listing("powershell.exe", &["-NoProfile", "-Command", CIM_QUERY])?;
        parse_cim_json(&decode_console_output(&raw)).map_err(|err| ScanError::Status {
            command: "powershell.exe".to_string(),
            status: format!("unparseable output: {err}"),
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CimProcess {
    process_id: u32,
    parent_process_id: Option<u32>,
    command_line: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum CimRows {
    Many(Vec<CimProcess>),
    One(CimProcess),
}

/// Parses `ConvertTo-Json` output, which is an array, or a bare object for a single row.
pub fn parse_cim_json(text: &str) -> Result<Vec<ProcessEntry>, serde_json::Error> {
    let text = text.trim();
    if text.is_empty() {
        return Ok(Vec::new());
    }
    let rows = match serde_json::from_str::<CimRows>(text)? {
        CimRows::Many(rows) => rows,
        CimRows::One(row) => vec![row],
    };
    Ok(rows
        .into_iter()
        .filter_map(|row| {
            let argv = split_command_line(row.command_line.as_deref().unwrap_or_default());
            (!argv.is_empty()).then_some(ProcessEntry {
                pid: row.process_id,
                ppid: row.parent_process_id,
                argv,
                cwd: None,
            })
        })
        .collect())
}

/// Splits a Windows-style command line. Double quotes group, backslashes are literal.
pub fn split_command_line(line: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut has_token = false;
    for c in line.chars() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                has_token = true;
            }
            c if c.is_whitespace() && !in_quotes => {
                if has_token {
                    args.push(std::mem::take(&mut current));
                    has_token = false;
                }
            }
            c => {
                current.push(c);
                has_token = true;
            }
        }
    }
    if has_token {
        args.push(current);
    }
    args
}

/// Console tools on Windows sometimes emit UTF-16LE when piped.
pub fn decode_console_output(raw: &[u8]) -> String {
    let utf16 = raw.starts_with(&[0xFF, 0xFE]) || (raw.len() >= 2 && raw[1] == 0);
    if !utf16 {
        return String::from_utf8_lossy(raw).into_owned();
    }
    let body = raw.strip_prefix(&[0xFF, 0xFE]).unwrap_or(raw);
    let units: Vec<u16> = body
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    String::from_utf16_lossy(&units)
}

fn run_listing(program: &str, args: &[&str]) -> Result<Vec<u8>, ScanError> {
    let command = format!("{} {}", program, args.join(" "));
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .output()
        .map_err(|source| ScanError::Command {
            command: command.clone(),
            source,
        })?;
    if !output.status.success() {
        return Err(ScanError::Status {
            command,
            status: output.status.to_string(),
        });
    }
    Ok(output.stdout)
}
