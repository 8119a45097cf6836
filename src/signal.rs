//! Platform signal delivery.
//!
//! On Unix every supervised process leads its own process group, so signals go to the group,
//! and to the pid alone only when the group is gone. Windows has no SIGINT/SIGTERM; the closest equivalents are a
//! console CTRL_BREAK event and a forced tree kill.

use std::fmt;
#[cfg(not(unix))]
use std::io;

use crate::error::SignalError;

/// Signals used by the stop escalation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessSignal {
    Interrupt,
    Terminate,
    Kill,
}

impl fmt::Display for ProcessSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProcessSignal::Interrupt => "SIGINT",
            ProcessSignal::Terminate => "SIGTERM",
            ProcessSignal::Kill => "SIGKILL",
        };
        f.write_str(name)
    }
}

#[cfg(unix)]
fn raw_signal(signal: ProcessSignal) -> libc::c_int {
    match signal {
        ProcessSignal::Interrupt => libc::SIGINT,
        ProcessSignal::Terminate => libc::SIGTERM,
        ProcessSignal::Kill => libc::SIGKILL,
    }
}

/// Sends `signal` to the process group led by `pid`, or to `pid` alone when there is no group.
///
/// A process that no longer exists is not an error.
#[cfg(unix)]
pub fn send(pid: u32, signal: ProcessSignal) -> Result<(), SignalError> {
    let sig = raw_signal(signal);
    deliver(pid, signal, |target| {
        if unsafe { libc::kill(target, sig) } == 0 {
            Ok(())
        } else {
            Err(std::io::Error::last_os_error())
        }
    })
}

// The leader is part of its group, so it is only addressed directly when the group send failed.
#[cfg(unix)]
fn deliver(
    pid: u32,
    signal: ProcessSignal,
    mut kill: impl FnMut(libc::pid_t) -> std::io::Result<()>,
) -> Result<(), SignalError> {
    let pid_i = pid as libc::pid_t;
    if kill(-pid_i).is_ok() {
        return Ok(());
    }
    match kill(pid_i) {
        Ok(()) => Ok(()),
        Err(err) if err.raw_os_error() == Some(libc::ESRCH) => Ok(()),
        Err(source) => Err(SignalError {
            pid,
            signal,
            source,
        }),
    }
}

/// Best-effort delivery of `signal` to each of `pids`. Errors are swallowed.
#[cfg(unix)]
pub fn send_each(pids: &[u32], signal: ProcessSignal) {
    let sig = raw_signal(signal);
    for pid in pids {
        let _ = unsafe { libc::kill(*pid as libc::pid_t, sig) };
    }
}

/// Sends a console CTRL_BREAK to the process group created for `pid`.
#[cfg(windows)]
pub fn send(pid: u32, signal: ProcessSignal) -> Result<(), SignalError> {
    use windows_sys::Win32::System::Console::GenerateConsoleCtrlEvent;
    use windows_sys::Win32::System::Console::CTRL_BREAK_EVENT;
    let ok = unsafe { GenerateConsoleCtrlEvent(CTRL_BREAK_EVENT, pid) };
    if ok != 0 {
        Ok(())
    } else {
        Err(SignalError {
            pid,
            signal,
            source: io::Error::last_os_error(),
        })
    }
}

/// Kills `pid` and its whole descendant tree. Errors are swallowed.
#[cfg(windows)]
pub fn kill_tree(pid: u32) {
    use std::process::{Command, Stdio};
    let _ = Command::new("taskkill")
        .args(["/T", "/F", "/PID", &pid.to_string()])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
}

#[cfg(all(not(unix), not(windows)))]
pub fn send(pid: u32, signal: ProcessSignal) -> Result<(), SignalError> {
    Err(SignalError {
        pid,
        signal,
        source: io::Error::new(io::ErrorKind::Unsupported, "signals unavailable on this platform"),
    })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::process::{CommandExt, ExitStatusExt};
    use std::process::Command;

    #[test]
    fn terminate_reaches_group_leader() {
        let mut child = Command::new("sleep")
            .arg("30")
            .process_group(0)
            .spawn()
            .unwrap();
        send(child.id(), ProcessSignal::Terminate).unwrap();
        let status = child.wait().unwrap();
        assert_eq!(status.signal(), Some(libc::SIGTERM));
    }

    #[test]
    fn group_delivery_does_not_repeat_to_leader() {
        let mut targets = Vec::new();
        deliver(42, ProcessSignal::Interrupt, |target| {
            targets.push(target);
            Ok(())
        })
        .unwrap();
        assert_eq!(targets, vec![-42]);
    }

    #[test]
    fn leader_is_signalled_when_group_send_fails() {
        let mut targets = Vec::new();
        deliver(42, ProcessSignal::Terminate, |target| {
            targets.push(target);
            if target < 0 {
                Err(std::io::Error::from_raw_os_error(libc::ESRCH))
            } else {
                Ok(())
            }
        })
        .unwrap();
        assert_eq!(targets, vec![-42, 42]);

        let err = deliver(42, ProcessSignal::Kill, |_| {
            Err(std::io::Error::from_raw_os_error(libc::EPERM))
        })
        .unwrap_err();
        assert_eq!(err.pid, 42);
    }

    #[test]
    fn missing_process_is_not_an_error() {
        assert!(send(i32::MAX as u32, ProcessSignal::Interrupt).is_ok());
    }

    #[test]
    fn display_names_match_unix_signals() {
        assert_eq!(ProcessSignal::Interrupt.to_string(), "SIGINT");
        assert_eq!(ProcessSignal::Kill.to_string(), "SIGKILL");
    }
}
