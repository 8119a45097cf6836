//! Event definitions for the application event loop.
//!
//! Background components (watcher, reconciler, supervisors, pip runs, input threads) never touch
//! UI state directly. They push `Event`s into one channel that the main loop drains.

use crossterm::event::KeyEvent;
use tokio::sync::mpsc;

use crate::identity::ScriptId;
use crate::output::OutputSink;

/// Represents an event in the application's main event loop.
#[derive(Debug, Clone)]
pub enum Event {
    /// The watched directory holds a different set of scripts.
    ScriptsChanged(Vec<ScriptId>),
    /// The process table shows a script starting (with its pid) or stopping.
    RunningState {
        id: ScriptId,
        running: bool,
        pid: Option<u32>,
    },
    /// A console line from a supervised process, pip or pyrack itself.
    Output(String),
    /// An owned supervisor's process ended and it left the registry.
    SupervisorExited { id: ScriptId, code: Option<i32> },
    /// A user-requested stop finished escalating.
    StopFinished { id: ScriptId },
    /// A pip run started from the UI finished.
    PackageFinished { label: String, code: i32 },
    /// A keyboard event received from the user.
    Key(KeyEvent),
    /// The terminal window was resized.
    Resize { width: u16, height: u16 },
    /// A command line typed on stdin in headless mode.
    Command(String),
    /// SIGINT/SIGTERM or end of input; begin orderly shutdown.
    Shutdown,
}

/// Receives script-list and running-state notifications from the watcher and reconciler.
///
/// Implementations are called from background threads and tasks and must not block.
pub trait ScriptListener: Send + Sync {
    fn on_scripts_list_changed(&self, scripts: &[ScriptId]);

    /// `pid` is `None` when `running` is false.
    fn on_script_running_state(&self, id: &ScriptId, running: bool, pid: Option<u32>);
}

/// Forwards listener callbacks into the main event channel.
#[derive(Debug, Clone)]
pub struct EventForwarder {
    tx: mpsc::UnboundedSender<Event>,
}

impl EventForwarder {
    pub fn new(tx: mpsc::UnboundedSender<Event>) -> Self {
        Self { tx }
    }

    fn send(&self, event: Event) {
        // the loop is gone during shutdown; late notifications are irrelevant then
        let _ = self.tx.send(event);
    }
}

impl ScriptListener for EventForwarder {
    fn on_scripts_list_changed(&self, scripts: &[ScriptId]) {
        self.send(Event::ScriptsChanged(scripts.to_vec()));
    }

    fn on_script_running_state(&self, id: &ScriptId, running: bool, pid: Option<u32>) {
        self.send(Event::RunningState {
            id: id.clone(),
            running,
            pid,
        });
    }
}

/// A sink delivering each line as `Event::Output` on `tx`.
pub fn output_sink(tx: mpsc::UnboundedSender<Event>) -> OutputSink {
    OutputSink::new(move |line| {
        let _ = tx.send(Event::Output(line));
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forwarder_maps_callbacks_to_events() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let forwarder = EventForwarder::new(tx.clone());
        let a = ScriptId::new("/srv/scripts/a.py");

        forwarder.on_scripts_list_changed(std::slice::from_ref(&a));
        forwarder.on_script_running_state(&a, true, Some(42));
        output_sink(tx).emit("[out] hello");

        match rx.try_recv().unwrap() {
            Event::ScriptsChanged(list) => assert_eq!(list, vec![a.clone()]),
            other => panic!("unexpected {other:?}"),
        }
        match rx.try_recv().unwrap() {
            Event::RunningState { id, running, pid } => {
                assert_eq!(id, a);
                assert!(running);
                assert_eq!(pid, Some(42));
            }
            other => panic!("unexpected {other:?}"),
        }
        match rx.try_recv().unwrap() {
            Event::Output(line) => assert_eq!(line, "[out] hello"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn closed_channel_is_ignored() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let forwarder = EventForwarder::new(tx.clone());
        forwarder.on_scripts_list_changed(&[]);
        output_sink(tx).emit("dropped");
    }
}
