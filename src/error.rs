//! Typed errors for the process lifecycle core.
//!
//! Only spawn failures ever reach the caller that initiated an action. Signal and scan
//! failures are carried as values so the background loops can log them and move on.

use std::io;

use thiserror::Error;

use crate::signal::ProcessSignal;

/// Errors surfaced by `ProcessSupervisor::start` and friends.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// The OS refused to create the process (missing interpreter, permission denied, ...).
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    /// The supervisor already ran a process to completion; the registry hands out a fresh one.
    #[error("supervisor for {0} has already exited")]
    Retired(String),
}

/// Sending a signal to a process failed.
#[derive(Debug, Error)]
#[error("failed to send {signal} to pid {pid}: {source}")]
pub struct SignalError {
    pub pid: u32,
    pub signal: ProcessSignal,
    #[source]
    pub source: io::Error,
}

/// A process-table listing could not be produced.
#[derive(Debug, Error)]
pub enum ScanError {
    #[error("failed to run {command}: {source}")]
    Command {
        command: String,
        #[source]
        source: io::Error,
    },
    #[error("{command} exited with {status}")]
    Status { command: String, status: String },
    #[error("{0} listed no processes")]
    Empty(&'static str),
}
