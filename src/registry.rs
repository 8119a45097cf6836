//! Process-wide map from script identity to its supervisor.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::task::JoinSet;

use crate::identity::ScriptId;
use crate::runner::{ExitHook, LaunchConfig, ProcessSupervisor, SupervisorState};

/// Notified with the identity and exit code after an exited supervisor is removed.
pub type ExitListener = Arc<dyn Fn(&ScriptId, Option<i32>) + Send + Sync>;

/// Holds at most one supervisor per identity. Cheap to clone.
#[derive(Clone)]
pub struct SupervisorRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    launch: Arc<LaunchConfig>,
    supervisors: Mutex<HashMap<ScriptId, Arc<ProcessSupervisor>>>,
    exit_listener: Option<ExitListener>,
}

impl RegistryInner {
    fn lock(&self) -> MutexGuard<'_, HashMap<ScriptId, Arc<ProcessSupervisor>>> {
        self.supervisors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn remove(&self, supervisor: &Arc<ProcessSupervisor>) -> bool {
        let removed = {
            let mut map = self.lock();
            match map.get(supervisor.id()) {
                Some(current) if Arc::ptr_eq(current, supervisor) => {
                    map.remove(supervisor.id());
                    true
                }
                _ => false,
            }
        };
        if removed {
            tracing::debug!(script = %supervisor.id(), "supervisor removed");
            if let Some(listener) = &self.exit_listener {
                listener(supervisor.id(), supervisor.last_exit_code());
            }
        }
        removed
    }
}

impl SupervisorRegistry {
    pub fn new(launch: LaunchConfig) -> Self {
        Self::build(launch, None)
    }

    pub fn with_exit_listener(launch: LaunchConfig, listener: ExitListener) -> Self {
        Self::build(launch, Some(listener))
    }

    fn build(launch: LaunchConfig, exit_listener: Option<ExitListener>) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                launch: Arc::new(launch),
                supervisors: Mutex::new(HashMap::new()),
                exit_listener,
            }),
        }
    }

    /// Returns the live supervisor for `id`, creating one if there is none.
    ///
    /// An exited supervisor whose removal is still in flight is replaced, so callers never get
    /// a retired instance back.
    pub fn get_or_create(&self, id: &ScriptId) -> Arc<ProcessSupervisor> {
        let mut map = self.inner.lock();
        if let Some(existing) = map.get(id) {
            if existing.state() != SupervisorState::Exited {
                return Arc::clone(existing);
            }
        }
        let supervisor = ProcessSupervisor::new(
            id.clone(),
            Arc::clone(&self.inner.launch),
            Some(self.exit_hook()),
        );
        map.insert(id.clone(), Arc::clone(&supervisor));
        supervisor
    }

    pub fn get(&self, id: &ScriptId) -> Option<Arc<ProcessSupervisor>> {
        self.inner.lock().get(id).cloned()
    }

    /// Removes `supervisor` if it is still the registered instance for its identity.
    pub fn remove(&self, supervisor: &Arc<ProcessSupervisor>) -> bool {
        self.inner.remove(supervisor)
    }

    /// Stops every supervisor concurrently, then forgets them all.
    pub async fn stop_all_and_clear(&self, grace: Duration) {
        let supervisors: Vec<Arc<ProcessSupervisor>> =
            self.inner.lock().values().cloned().collect();
        if !supervisors.is_empty() {
            tracing::info!(count = supervisors.len(), "stopping all supervised processes");
        }
        let mut tasks = JoinSet::new();
        for supervisor in supervisors {
            tasks.spawn(async move { supervisor.stop_gracefully(grace).await });
        }
        while let Some(result) = tasks.join_next().await {
            if let Err(err) = result {
                tracing::warn!(error = %err, "stop task failed");
            }
        }
        self.inner.lock().clear();
    }

    fn exit_hook(&self) -> ExitHook {
        let registry: Weak<RegistryInner> = Arc::downgrade(&self.inner);
        Arc::new(move |supervisor: &Arc<ProcessSupervisor>| {
            if let Some(inner) = registry.upgrade() {
                inner.remove(supervisor);
            }
        })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::path::{Path, PathBuf};
    use std::time::Instant;

    use crate::output::OutputSink;
    use crate::runner::StartOutcome;

    fn registry(dir: &Path, listener: Option<ExitListener>) -> SupervisorRegistry {
        let launch = LaunchConfig::new(PathBuf::from("sh"), dir.to_path_buf(), dir.join("imports"));
        match listener {
            Some(listener) => SupervisorRegistry::with_exit_listener(launch, listener),
            None => SupervisorRegistry::new(launch),
        }
    }

    fn script(dir: &Path, name: &str, body: &str) -> ScriptId {
        let path = dir.join(name);
        std::fs::write(&path, body).unwrap();
        ScriptId::new(path)
    }

    async fn wait_until(mut check: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    #[tokio::test]
    async fn get_or_create_returns_same_instance() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path(), None);
        let id = ScriptId::new(dir.path().join("a.py"));
        let first = registry.get_or_create(&id);
        let second = registry.get_or_create(&ScriptId::new(dir.path().join("./a.py")));
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.inner.lock().len(), 1);
    }

    #[tokio::test]
    async fn natural_exit_removes_and_notifies() {
        let dir = tempfile::tempdir().unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let captured = seen.clone();
        let listener: ExitListener = Arc::new(move |id: &ScriptId, code: Option<i32>| {
            captured.lock().unwrap().push((id.file_name(), code));
        });
        let registry = registry(dir.path(), Some(listener));
        let id = script(dir.path(), "done.py", "exit 4\n");

        let supervisor = registry.get_or_create(&id);
        assert!(matches!(
            supervisor.start(OutputSink::discard()).unwrap(),
            StartOutcome::Started(_)
        ));
        assert!(wait_until(|| registry.get(&id).is_none()).await);
        assert!(wait_until(|| !seen.lock().unwrap().is_empty()).await);
        assert_eq!(seen.lock().unwrap()[0], ("done.py".to_string(), Some(4)));

        let fresh = registry.get_or_create(&id);
        assert!(!Arc::ptr_eq(&fresh, &supervisor));
        assert_eq!(fresh.state(), SupervisorState::Idle);
    }

    #[tokio::test]
    async fn remove_ignores_stale_instances() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path(), None);
        let id = ScriptId::new(dir.path().join("a.py"));
        let current = registry.get_or_create(&id);
        let stale = ProcessSupervisor::new(
            id.clone(),
            Arc::clone(&registry.inner.launch),
            None,
        );
        assert!(!registry.remove(&stale));
        assert!(registry.get(&id).is_some());
        assert!(registry.remove(&current));
        assert!(registry.get(&id).is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn stop_all_and_clear_stops_everything() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path(), None);
        let ids = [
            script(dir.path(), "one.py", "sleep 30\n"),
            script(dir.path(), "two.py", "trap '' INT\nsleep 30\n"),
        ];
        for id in &ids {
            registry.get_or_create(id).start(OutputSink::discard()).unwrap();
        }
        let supervisors: Vec<_> = ids.iter().filter_map(|id| registry.get(id)).collect();
        assert_eq!(supervisors.len(), 2);
        assert!(supervisors.iter().all(|s| s.is_running() && s.pid().is_some()));

        let began = Instant::now();
        registry.stop_all_and_clear(Duration::from_millis(600)).await;
        assert!(began.elapsed() < Duration::from_secs(4));
        assert!(ids.iter().all(|id| registry.get(id).is_none()));
        assert!(supervisors.iter().all(|s| !s.is_running()));
    }
}
