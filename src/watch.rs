//! Script directory watching.
//!
//! A `DirectoryWatcher` keeps the set of known scripts in sync with the scripts directory. The OS
//! watcher feeds a dedicated thread that debounces bursts of events and rescans the directory;
//! listeners only hear about it when the set of scripts actually changed.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use notify::{Event as NotifyEvent, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{watch, Notify};

use crate::events::ScriptListener;
use crate::identity::ScriptId;

/// Immutable snapshot of the scripts found in the watched directory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KnownScripts {
    ids: Vec<ScriptId>,
    set: HashSet<ScriptId>,
}

impl KnownScripts {
    pub fn new(ids: impl IntoIterator<Item = ScriptId>) -> Self {
        let set: HashSet<ScriptId> = ids.into_iter().collect();
        let mut ids: Vec<ScriptId> = set.iter().cloned().collect();
        ids.sort_by(ScriptId::display_order);
        Self { ids, set }
    }

    /// Identities in display order.
    pub fn ids(&self) -> &[ScriptId] {
        &self.ids
    }

    pub fn set(&self) -> &HashSet<ScriptId> {
        &self.set
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// Matches file names carrying one of the script extensions, ignoring case.
#[derive(Debug, Clone)]
pub struct ScriptMatcher {
    globset: GlobSet,
}

impl ScriptMatcher {
    pub fn new(extensions: &[String]) -> Result<Self> {
        let mut builder = GlobSetBuilder::new();
        for ext in extensions {
            let ext = ext.trim().trim_start_matches('.');
            if ext.is_empty() {
                continue;
            }
            let glob = GlobBuilder::new(&format!("*.{ext}"))
                .case_insensitive(true)
                .literal_separator(true)
                .build()
                .with_context(|| format!("invalid script extension {ext:?}"))?;
            builder.add(glob);
        }
        Ok(Self {
            globset: builder.build().context("failed to build script matcher")?,
        })
    }

    pub fn is_script(&self, path: &Path) -> bool {
        path.file_name()
            .map(|name| self.globset.is_match(Path::new(name)))
            .unwrap_or(false)
    }
}

struct Shared {
    dir: PathBuf,
    matcher: ScriptMatcher,
    listener: Arc<dyn ScriptListener>,
    known_tx: watch::Sender<Arc<KnownScripts>>,
    nudge: Option<Arc<Notify>>,
    // serializes snapshot + compare + publish; true once the first snapshot went out
    rescan: Mutex<bool>,
}

impl Shared {
    fn snapshot(&self) -> KnownScripts {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) => {
                tracing::warn!(dir = %self.dir.display(), error = %err, "cannot list scripts dir");
                return KnownScripts::default();
            }
        };
        KnownScripts::new(
            entries
                .flatten()
                .map(|entry| entry.path())
                .filter(|path| path.is_file() && self.matcher.is_script(path))
                .map(ScriptId::new),
        )
    }

    /// Rescans and publishes when the set differs from the last published one.
    fn rescan(&self) -> bool {
        let mut published = self.rescan.lock().unwrap_or_else(PoisonError::into_inner);
        let next = self.snapshot();
        let changed = !*published || **self.known_tx.borrow() != next;
        if changed {
            *published = true;
            let next = Arc::new(next);
            self.known_tx.send_replace(Arc::clone(&next));
            tracing::debug!(count = next.len(), "script list changed");
            self.listener.on_scripts_list_changed(next.ids());
            if let Some(nudge) = &self.nudge {
                nudge.notify_one();
            }
        }
        changed
    }

    fn is_relevant(&self, event: &notify::Result<NotifyEvent>) -> bool {
        let event = match event {
            Ok(event) => event,
            Err(err) => {
                tracing::warn!(error = %err, "watch error; forcing rescan");
                return true;
            }
        };
        if event.need_rescan() {
            return true;
        }
        if matches!(event.kind, EventKind::Access(_)) {
            return false;
        }
        event.paths.is_empty() || event.paths.iter().any(|path| self.matcher.is_script(path))
    }
}

/// Watches one directory (non-recursively) for script additions, removals and renames.
pub struct DirectoryWatcher {
    shared: Arc<Shared>,
    debounce: Duration,
    watcher: Mutex<Option<RecommendedWatcher>>,
}

impl DirectoryWatcher {
    pub fn new(
        dir: PathBuf,
        extensions: &[String],
        debounce: Duration,
        listener: Arc<dyn ScriptListener>,
    ) -> Result<Self> {
        let (known_tx, _) = watch::channel(Arc::new(KnownScripts::default()));
        Ok(Self {
            shared: Arc::new(Shared {
                dir,
                matcher: ScriptMatcher::new(extensions)?,
                listener,
                known_tx,
                nudge: None,
                rescan: Mutex::new(false),
            }),
            debounce,
            watcher: Mutex::new(None),
        })
    }

    /// Wakes `nudge` whenever a rescan runs, so the reconciler can react immediately.
    pub fn with_nudge(mut self, nudge: Arc<Notify>) -> Self {
        if let Some(shared) = Arc::get_mut(&mut self.shared) {
            shared.nudge = Some(nudge);
        }
        self
    }

    /// Receiver of the latest published snapshot.
    pub fn subscribe(&self) -> watch::Receiver<Arc<KnownScripts>> {
        self.shared.known_tx.subscribe()
    }

    /// Latest published snapshot.
    pub fn known(&self) -> Arc<KnownScripts> {
        Arc::clone(&self.shared.known_tx.borrow())
    }

    /// Creates the directory if needed, publishes a first snapshot and starts watching.
    /// Calling it again while running does nothing.
    pub fn start(&self) -> Result<()> {
        let mut slot = self.lock_watcher();
        if slot.is_some() {
            return Ok(());
        }
        fs::create_dir_all(&self.shared.dir).with_context(|| {
            format!("failed to create scripts dir {}", self.shared.dir.display())
        })?;
        self.shared.rescan();

        let (raw_tx, raw_rx) = std::sync::mpsc::channel();
        let mut watcher = RecommendedWatcher::new(
            move |res| {
                let _ = raw_tx.send(res);
            },
            notify::Config::default(),
        )
        .context("failed to create watcher")?;
        watcher
            .watch(&self.shared.dir, RecursiveMode::NonRecursive)
            .with_context(|| format!("failed to watch {}", self.shared.dir.display()))?;

        let shared = Arc::clone(&self.shared);
        let debounce = self.debounce.max(Duration::from_millis(10));
        std::thread::Builder::new()
            .name("pyrack-watch".to_string())
            .spawn(move || watch_loop(shared, raw_rx, debounce))
            .context("failed to spawn watch thread")?;
        *slot = Some(watcher);
        tracing::info!(dir = %self.shared.dir.display(), "watching scripts dir");
        Ok(())
    }

    /// Stops watching. Dropping the OS watcher disconnects the loop's channel, which ends it.
    pub fn stop(&self) {
        if self.lock_watcher().take().is_some() {
            tracing::debug!(dir = %self.shared.dir.display(), "watcher stopped");
        }
    }

    /// Rescans synchronously, republishing only on change, and always nudges the reconciler.
    pub fn force_rescan_now(&self) -> Arc<KnownScripts> {
        let changed = self.shared.rescan();
        if !changed {
            if let Some(nudge) = &self.shared.nudge {
                nudge.notify_one();
            }
        }
        self.known()
    }

    fn lock_watcher(&self) -> MutexGuard<'_, Option<RecommendedWatcher>> {
        self.watcher.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for DirectoryWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

fn watch_loop(shared: Arc<Shared>, raw_rx: Receiver<notify::Result<NotifyEvent>>, debounce: Duration) {
    loop {
        let event = match raw_rx.recv() {
            Ok(res) => res,
            Err(_) => break,
        };
        if !shared.is_relevant(&event) {
            continue;
        }
        if !settle(&shared, &raw_rx, debounce) {
            return;
        }
        shared.rescan();
    }
}

/// Waits until events stop for `debounce`, or until `2 * debounce` passed since the burst began.
/// Returns false when the watcher went away.
fn settle(
    shared: &Shared,
    raw_rx: &Receiver<notify::Result<NotifyEvent>>,
    debounce: Duration,
) -> bool {
    let first = Instant::now();
    let cap = first + debounce * 2;
    let mut quiet_until = first + debounce;
    loop {
        let now = Instant::now();
        let deadline = quiet_until.min(cap);
        if now >= deadline {
            return true;
        }
        match raw_rx.recv_timeout(deadline - now) {
            Ok(res) => {
                if shared.is_relevant(&res) {
                    quiet_until = Instant::now() + debounce;
                }
            }
            Err(RecvTimeoutError::Timeout) => return true,
            Err(RecvTimeoutError::Disconnected) => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, Flag};
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Default)]
    struct Recorder {
        lists: Mutex<Vec<Vec<String>>>,
    }

    impl ScriptListener for Recorder {
        fn on_scripts_list_changed(&self, scripts: &[ScriptId]) {
            self.lists
                .lock()
                .unwrap()
                .push(scripts.iter().map(ScriptId::file_name).collect());
        }

        fn on_script_running_state(&self, _id: &ScriptId, _running: bool, _pid: Option<u32>) {}
    }

    impl Recorder {
        fn count(&self) -> usize {
            self.lists.lock().unwrap().len()
        }

        fn last(&self) -> Vec<String> {
            self.lists.lock().unwrap().last().cloned().unwrap_or_default()
        }
    }

    fn exts() -> Vec<String> {
        vec!["py".to_string(), "pyw".to_string()]
    }

    fn wait_until(mut check: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if check() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        false
    }

    #[test]
    fn matcher_checks_extension_case_insensitively() {
        let matcher = ScriptMatcher::new(&exts()).unwrap();
        assert!(matcher.is_script(Path::new("/s/a.py")));
        assert!(matcher.is_script(Path::new("/s/B.PYW")));
        assert!(!matcher.is_script(Path::new("/s/notes.txt")));
        assert!(!matcher.is_script(Path::new("/s/a.py.bak")));
    }

    #[test]
    fn known_scripts_sort_and_dedupe() {
        let known = KnownScripts::new([
            ScriptId::new("/s/zeta.py"),
            ScriptId::new("/s/Alpha.py"),
            ScriptId::new("/s/zeta.py"),
        ]);
        assert_eq!(known.len(), 2);
        assert_eq!(known.ids()[0].file_name(), "Alpha.py");
        assert!(known.set().contains(&ScriptId::new("/s/zeta.py")));
    }

    #[test]
    fn start_creates_dir_and_publishes_snapshot() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("scripts");
        let recorder = Arc::new(Recorder::default());
        let watcher =
            DirectoryWatcher::new(dir.clone(), &exts(), Duration::from_millis(50), recorder.clone())
                .unwrap();
        watcher.start().unwrap();
        assert!(dir.is_dir());
        assert_eq!(recorder.count(), 1);
        assert!(recorder.last().is_empty());
        watcher.stop();
        watcher.stop();
    }

    #[test]
    fn rescan_without_changes_is_silent() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("a.py"), "").unwrap();
        fs::write(tmp.path().join("readme.md"), "").unwrap();
        let recorder = Arc::new(Recorder::default());
        let nudge = Arc::new(Notify::new());
        let watcher = DirectoryWatcher::new(
            tmp.path().to_path_buf(),
            &exts(),
            Duration::from_millis(50),
            recorder.clone(),
        )
        .unwrap()
        .with_nudge(nudge);
        let first = watcher.force_rescan_now();
        assert_eq!(first.len(), 1);
        let second = watcher.force_rescan_now();
        assert_eq!(first, second);
        assert_eq!(recorder.count(), 1);
        assert_eq!(recorder.last(), vec!["a.py"]);
    }

    #[test]
    fn burst_of_new_scripts_is_debounced() {
        let tmp = tempfile::tempdir().unwrap();
        let recorder = Arc::new(Recorder::default());
        let watcher = DirectoryWatcher::new(
            tmp.path().to_path_buf(),
            &exts(),
            Duration::from_millis(150),
            recorder.clone(),
        )
        .unwrap();
        watcher.start().unwrap();
        for name in ["a.py", "b.py", "c.py", "d.py", "e.pyw"] {
            fs::write(tmp.path().join(name), "print('x')\n").unwrap();
        }
        fs::write(tmp.path().join("notes.txt"), "").unwrap();
        assert!(wait_until(|| recorder.last().len() == 5));
        std::thread::sleep(Duration::from_millis(300));
        assert!(recorder.count() <= 3, "got {} publications", recorder.count());

        fs::remove_file(tmp.path().join("c.py")).unwrap();
        assert!(wait_until(|| recorder.last() == vec!["a.py", "b.py", "d.py", "e.pyw"]));
        watcher.stop();
    }

    #[test]
    fn watch_errors_and_rescan_flags_force_full_rescan() {
        let tmp = tempfile::tempdir().unwrap();
        let recorder = Arc::new(Recorder::default());
        let watcher = DirectoryWatcher::new(
            tmp.path().to_path_buf(),
            &exts(),
            Duration::from_millis(20),
            recorder.clone(),
        )
        .unwrap();
        watcher.force_rescan_now();
        assert_eq!(recorder.count(), 1);

        let shared = Arc::clone(&watcher.shared);
        let notes = tmp.path().join("notes.txt");
        let flagged = NotifyEvent::new(EventKind::Other)
            .set_flag(Flag::Rescan)
            .add_path(notes.clone());
        let plain = NotifyEvent::new(EventKind::Create(CreateKind::File)).add_path(notes);
        assert!(shared.is_relevant(&Err(notify::Error::generic("event queue overflow"))));
        assert!(shared.is_relevant(&Ok(flagged.clone())));
        assert!(!shared.is_relevant(&Ok(plain)));

        let (tx, rx) = std::sync::mpsc::channel();
        let worker = std::thread::spawn(move || watch_loop(shared, rx, Duration::from_millis(20)));

        // no event names a.py; only the error makes the loop look at the directory again
        fs::write(tmp.path().join("a.py"), "").unwrap();
        tx.send(Err(notify::Error::generic("event queue overflow"))).unwrap();
        assert!(wait_until(|| recorder.last() == vec!["a.py"]));

        fs::write(tmp.path().join("b.py"), "").unwrap();
        tx.send(Ok(flagged)).unwrap();
        assert!(wait_until(|| recorder.last() == vec!["a.py", "b.py"]));

        drop(tx);
        worker.join().unwrap();
    }

    #[test]
    fn steady_writes_do_not_starve_rescans() {
        let tmp = tempfile::tempdir().unwrap();
        let busy = tmp.path().join("a.py");
        fs::write(&busy, "").unwrap();
        let recorder = Arc::new(Recorder::default());
        let watcher = DirectoryWatcher::new(
            tmp.path().to_path_buf(),
            &exts(),
            Duration::from_millis(100),
            recorder.clone(),
        )
        .unwrap();
        watcher.start().unwrap();

        let writing = Arc::new(AtomicBool::new(true));
        let writer = {
            let writing = writing.clone();
            std::thread::spawn(move || {
                let mut n = 0u32;
                while writing.load(Ordering::SeqCst) {
                    n += 1;
                    let _ = fs::write(&busy, format!("# {n}\n"));
                    std::thread::sleep(Duration::from_millis(20));
                }
            })
        };
        std::thread::sleep(Duration::from_millis(150));
        fs::write(tmp.path().join("b.py"), "").unwrap();

        let deadline = Instant::now() + Duration::from_millis(1500);
        let mut published = false;
        while Instant::now() < deadline {
            if recorder.last() == vec!["a.py", "b.py"] {
                published = true;
                break;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        writing.store(false, Ordering::SeqCst);
        writer.join().unwrap();
        watcher.stop();
        assert!(published, "b.py not published while a.py kept changing");
    }
}
