use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CleanupPriority {
    Low,
    Normal,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CleanupTaskId(u64);

pub type CleanupAction = Arc<dyn Fn() + Send + Sync>;

struct CleanupTask {
    id: CleanupTaskId,
    name: String,
    priority: CleanupPriority,
    action: CleanupAction,
}

/// Outcome of one [`CleanupRegistry::run_all`] pass, task names in run order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub completed: Vec<String>,
    pub failed: Vec<String>,
}

/// Priority ordered set of teardown actions. Tasks run high to low; equal
/// priorities run in registration order.
#[derive(Clone, Default)]
pub struct CleanupRegistry {
    inner: Arc<Mutex<RegistryState>>,
}

#[derive(Default)]
struct RegistryState {
    tasks: Vec<CleanupTask>,
    next_id: u64,
}

impl CleanupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(
        &self,
        name: impl Into<String>,
        priority: CleanupPriority,
        action: F,
    ) -> CleanupTaskId
    where
        F: Fn() + Send + Sync + 'static,
    {
        let mut guard = self.inner.lock();
        guard.next_id += 1;
        let id = CleanupTaskId(guard.next_id);
        guard.tasks.push(CleanupTask {
            id,
            name: name.into(),
            priority,
            action: Arc::new(action),
        });
        id
    }

    pub fn unregister(&self, id: CleanupTaskId) -> bool {
        let mut guard = self.inner.lock();
        let before = guard.tasks.len();
        guard.tasks.retain(|task| task.id != id);
        guard.tasks.len() != before
    }

    pub fn len(&self) -> usize {
        self.inner.lock().tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run every task once. A panicking task is recorded and the rest still run.
    pub fn run_all(&self) -> CleanupReport {
        let mut ordered: Vec<(CleanupTaskId, CleanupPriority, String, CleanupAction)> = {
            let guard = self.inner.lock();
            guard
                .tasks
                .iter()
                .map(|task| (task.id, task.priority, task.name.clone(), Arc::clone(&task.action)))
                .collect()
        };
        ordered.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));

        let mut report = CleanupReport::default();
        for (_, priority, name, action) in ordered {
            match catch_unwind(AssertUnwindSafe(|| action())) {
                Ok(()) => {
                    debug!(target = "realtime.cleanup", task = %name, ?priority, "cleanup task finished");
                    report.completed.push(name);
                }
                Err(_) => {
                    warn!(target = "realtime.cleanup", task = %name, ?priority, "cleanup task panicked");
                    report.failed.push(name);
                }
            }
        }
        report
    }
}
