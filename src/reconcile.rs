//! Running-state reconciliation.
//!
//! The reconciler periodically scans the process table for known scripts and tells the listener
//! when a script was observed starting or stopping, whoever launched it. It keeps only the last
//! observed pid per script, so a steady process table produces no notifications at all.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::events::ScriptListener;
use crate::identity::ScriptId;
use crate::scan::ProcessTableScanner;
use crate::watch::KnownScripts;

/// A scan that takes longer than this is abandoned for the cycle.
const SCAN_TIMEOUT: Duration = Duration::from_secs(10);

/// Observed change in a script's running state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunningChange {
    Started { id: ScriptId, pid: u32 },
    Stopped { id: ScriptId },
}

/// Last observed pid per script.
#[derive(Debug, Default, Clone)]
pub struct RunningPidMap {
    pids: HashMap<ScriptId, u32>,
}

impl RunningPidMap {
    /// Replaces the cache with `found` and returns what changed, in display order.
    ///
    /// A script whose pid changed counts as started again; one missing from `found` counts as
    /// stopped.
    pub fn apply(&mut self, found: &HashMap<ScriptId, u32>) -> Vec<RunningChange> {
        let mut changes = Vec::new();
        for (id, pid) in found {
            if self.pids.get(id) != Some(pid) {
                changes.push(RunningChange::Started {
                    id: id.clone(),
                    pid: *pid,
                });
            }
        }
        for id in self.pids.keys() {
            if !found.contains_key(id) {
                changes.push(RunningChange::Stopped { id: id.clone() });
            }
        }
        changes.sort_by(|a, b| ScriptId::display_order(a.id(), b.id()));
        self.pids = found.clone();
        changes
    }
}

impl RunningChange {
    pub fn id(&self) -> &ScriptId {
        match self {
            RunningChange::Started { id, .. } | RunningChange::Stopped { id } => id,
        }
    }
}

/// Polls the scanner and diffs its results.
pub struct Reconciler {
    scanner: Arc<dyn ProcessTableScanner>,
    listener: Arc<dyn ScriptListener>,
    known_rx: watch::Receiver<Arc<KnownScripts>>,
    interval: Duration,
    nudge: Arc<Notify>,
}

impl Reconciler {
    pub fn new(
        scanner: Arc<dyn ProcessTableScanner>,
        listener: Arc<dyn ScriptListener>,
        known_rx: watch::Receiver<Arc<KnownScripts>>,
        interval: Duration,
        nudge: Arc<Notify>,
    ) -> Self {
        Self {
            scanner,
            listener,
            known_rx,
            interval: interval.max(Duration::from_millis(50)),
            nudge,
        }
    }

    /// Starts the polling task. Must be called from within a tokio runtime.
    pub fn spawn(self) -> ReconcilerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(self.run(shutdown_rx));
        ReconcilerHandle {
            shutdown_tx,
            task: Mutex::new(Some(task)),
        }
    }

    async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut pids = RunningPidMap::default();
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.nudge.notified() => {}
                _ = shutdown_rx.changed() => break,
            }
            if *shutdown_rx.borrow() {
                break;
            }
            self.reconcile_once(&mut pids).await;
        }
        tracing::debug!("reconciler stopped");
    }

    async fn reconcile_once(&self, pids: &mut RunningPidMap) {
        let known = Arc::clone(&self.known_rx.borrow());
        let scanner = Arc::clone(&self.scanner);
        let scan = tokio::task::spawn_blocking(move || scanner.scan(known.set()));
        let found = match tokio::time::timeout(SCAN_TIMEOUT, scan).await {
            Ok(Ok(found)) => found,
            Ok(Err(err)) => {
                tracing::warn!(error = %err, "scan task failed");
                return;
            }
            Err(_) => {
                tracing::warn!("process scan timed out");
                return;
            }
        };

        for change in pids.apply(&found) {
            tracing::debug!(?change, "running state changed");
            let listener = self.listener.as_ref();
            let delivered = catch_unwind(AssertUnwindSafe(|| match &change {
                RunningChange::Started { id, pid } => {
                    listener.on_script_running_state(id, true, Some(*pid))
                }
                RunningChange::Stopped { id } => listener.on_script_running_state(id, false, None),
            }));
            if delivered.is_err() {
                tracing::warn!(script = %change.id(), "running-state listener panicked");
            }
        }
    }
}

/// Controls a spawned reconciler. `stop` is idempotent and safe from any task.
pub struct ReconcilerHandle {
    shutdown_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ReconcilerHandle {
    pub fn stop(&self) {
        self.shutdown_tx.send_replace(true);
    }

    /// Stops the loop and waits for it to finish.
    pub async fn join(&self) {
        self.stop();
        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                tracing::warn!(error = %err, "reconciler task failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::time::Instant;

    fn id(name: &str) -> ScriptId {
        ScriptId::new(format!("/srv/scripts/{name}"))
    }

    fn found(entries: &[(&str, u32)]) -> HashMap<ScriptId, u32> {
        entries.iter().map(|(name, pid)| (id(name), *pid)).collect()
    }

    #[test]
    fn pid_change_fires_one_start() {
        let mut map = RunningPidMap::default();
        assert_eq!(
            map.apply(&found(&[("a.py", 100)])),
            vec![RunningChange::Started { id: id("a.py"), pid: 100 }]
        );
        assert!(map.apply(&found(&[("a.py", 100)])).is_empty());
        assert_eq!(
            map.apply(&found(&[("a.py", 200)])),
            vec![RunningChange::Started { id: id("a.py"), pid: 200 }]
        );
        assert_eq!(map.pids.get(&id("a.py")), Some(&200));
    }

    #[test]
    fn disappearance_fires_one_stop() {
        let mut map = RunningPidMap::default();
        map.apply(&found(&[("a.py", 100), ("b.py", 5)]));
        assert_eq!(
            map.apply(&found(&[("b.py", 5)])),
            vec![RunningChange::Stopped { id: id("a.py") }]
        );
        assert_eq!(
            map.apply(&HashMap::new()),
            vec![RunningChange::Stopped { id: id("b.py") }]
        );
        assert!(map.apply(&HashMap::new()).is_empty());
    }

    #[derive(Default)]
    struct FakeScanner {
        result: Mutex<HashMap<ScriptId, u32>>,
    }

    impl ProcessTableScanner for FakeScanner {
        fn scan(&self, known: &HashSet<ScriptId>) -> HashMap<ScriptId, u32> {
            self.result
                .lock()
                .unwrap()
                .iter()
                .filter(|(id, _)| known.contains(id))
                .map(|(id, pid)| (id.clone(), *pid))
                .collect()
        }
    }

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<(String, bool, Option<u32>)>>,
    }

    impl ScriptListener for Recorder {
        fn on_scripts_list_changed(&self, _scripts: &[ScriptId]) {}

        fn on_script_running_state(&self, id: &ScriptId, running: bool, pid: Option<u32>) {
            self.events
                .lock()
                .unwrap()
                .push((id.file_name(), running, pid));
        }
    }

    async fn wait_for_events(recorder: &Recorder, count: usize) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if recorder.events.lock().unwrap().len() >= count {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn nudged_passes_report_external_changes() {
        let scanner = Arc::new(FakeScanner::default());
        let recorder = Arc::new(Recorder::default());
        let (_known_tx, known_rx) =
            watch::channel(Arc::new(KnownScripts::new([id("a.py"), id("b.py")])));
        let nudge = Arc::new(Notify::new());
        let handle = Reconciler::new(
            scanner.clone(),
            recorder.clone(),
            known_rx,
            Duration::from_secs(60),
            nudge.clone(),
        )
        .spawn();

        *scanner.result.lock().unwrap() = found(&[("a.py", 100), ("ghost.py", 7)]);
        nudge.notify_one();
        assert!(wait_for_events(&recorder, 1).await);

        *scanner.result.lock().unwrap() = found(&[("a.py", 200)]);
        nudge.notify_one();
        assert!(wait_for_events(&recorder, 2).await);

        scanner.result.lock().unwrap().clear();
        nudge.notify_one();
        assert!(wait_for_events(&recorder, 3).await);

        handle.join().await;
        handle.stop();
        assert_eq!(
            *recorder.events.lock().unwrap(),
            vec![
                ("a.py".to_string(), true, Some(100)),
                ("a.py".to_string(), true, Some(200)),
                ("a.py".to_string(), false, None),
            ]
        );
    }
}
