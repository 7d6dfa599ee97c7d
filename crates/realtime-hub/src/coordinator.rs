use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::cleanup::{CleanupPriority, CleanupRegistry, CleanupReport, CleanupTaskId};
use crate::config::CoordinatorConfig;
use crate::error::HubResult;
use crate::health::{CleanupHealth, HubHealth};
use crate::host::{HostEvent, HostLifecycle};
use crate::metrics;
use crate::multiplexer::Multiplexer;
use crate::writes::PendingWrites;

/// Name of the registry task that tears down the multiplexer.
pub const SUBSCRIPTIONS_TASK: &str = "realtime-subscriptions";

/// Decides when idle resources are released, based on host lifecycle events.
///
/// A hidden host gets a grace period; if it is still hidden, unfocused, not
/// writing and cleanup is not disabled when the period ends, every registered
/// cleanup task runs. Unload runs them immediately and unconditionally.
#[derive(Clone)]
pub struct CleanupCoordinator {
    inner: Arc<CoordinatorInner>,
}

struct CoordinatorInner {
    hub: Multiplexer,
    registry: CleanupRegistry,
    host: Arc<dyn HostLifecycle>,
    writes: Arc<dyn PendingWrites>,
    config: CoordinatorConfig,
    runtime: Handle,
    state: Mutex<CoordinatorState>,
}

#[derive(Default)]
struct CoordinatorState {
    hidden: bool,
    unloaded: bool,
    hidden_cleanup_ran: bool,
    pending: Option<JoinHandle<()>>,
    /// Identifies the current grace timer; a timer that fires with an older
    /// value was superseded and does nothing.
    pending_epoch: u64,
    disabled_until: Option<Instant>,
}

impl CoordinatorState {
    fn cancel_pending(&mut self) -> bool {
        self.pending_epoch += 1;
        match self.pending.take() {
            Some(task) => {
                task.abort();
                true
            }
            None => false,
        }
    }

    fn disabled(&self) -> bool {
        self.disabled_until
            .map_or(false, |until| Instant::now() < until)
    }
}

impl CleanupCoordinator {
    pub fn new(
        hub: Multiplexer,
        host: Arc<dyn HostLifecycle>,
        writes: Arc<dyn PendingWrites>,
        config: CoordinatorConfig,
    ) -> HubResult<Self> {
        let runtime = Handle::try_current()?;
        let registry = CleanupRegistry::new();
        let subscriptions = hub.clone();
        registry.register(SUBSCRIPTIONS_TASK, CleanupPriority::High, move || {
            subscriptions.cleanup()
        });
        Ok(Self {
            inner: Arc::new(CoordinatorInner {
                hub,
                registry,
                host,
                writes,
                config,
                runtime,
                state: Mutex::new(CoordinatorState::default()),
            }),
        })
    }

    pub fn handle_host_event(&self, event: HostEvent) {
        match event {
            HostEvent::Hidden => self.inner.on_hidden(),
            HostEvent::Visible => self.inner.on_visible(),
            HostEvent::Unload => self.inner.on_unload(),
        }
    }

    /// Feed host events from `events` until every sender is dropped.
    pub fn spawn_host_listener(&self, mut events: mpsc::Receiver<HostEvent>) -> JoinHandle<()> {
        let coordinator = self.clone();
        self.inner.runtime.spawn(async move {
            while let Some(event) = events.recv().await {
                coordinator.handle_host_event(event);
            }
            debug!(target = "realtime.coordinator", "host event stream ended");
        })
    }

    /// Cancel any pending hidden-host cleanup and run every task now.
    pub fn perform_cleanup(&self) -> CleanupReport {
        if self.inner.state.lock().cancel_pending() {
            debug!(target = "realtime.coordinator", "pending cleanup superseded by manual run");
        }
        self.inner.run_cleanup("manual")
    }

    /// Suppress hidden-host cleanup until `duration` from now. Overlapping
    /// calls keep the later deadline. Unload cleanup is not affected.
    pub fn disable_cleanup_temporarily(&self, duration: Duration) {
        let until = Instant::now() + duration;
        let mut state = self.inner.state.lock();
        let until = state.disabled_until.map_or(until, |current| current.max(until));
        state.disabled_until = Some(until);
        drop(state);
        info!(
            target = "realtime.coordinator",
            duration_ms = duration.as_millis() as u64,
            "hidden cleanup disabled"
        );
    }

    pub fn cleanup_disabled(&self) -> bool {
        self.inner.state.lock().disabled()
    }

    pub fn cleanup_pending(&self) -> bool {
        self.inner.state.lock().pending.is_some()
    }

    pub fn add_cleanup_task<F>(
        &self,
        name: impl Into<String>,
        priority: CleanupPriority,
        action: F,
    ) -> CleanupTaskId
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner.registry.register(name, priority, action)
    }

    pub fn remove_cleanup_task(&self, id: CleanupTaskId) -> bool {
        self.inner.registry.unregister(id)
    }

    pub fn multiplexer(&self) -> &Multiplexer {
        &self.inner.hub
    }

    pub fn registry(&self) -> &CleanupRegistry {
        &self.inner.registry
    }

    pub fn health(&self) -> HubHealth {
        let (pending, disabled) = {
            let state = self.inner.state.lock();
            (state.pending.is_some(), state.disabled())
        };
        HubHealth {
            subscriptions: self.inner.hub.subscription_health(),
            recovering: self.inner.hub.recovering(),
            shutting_down: self.inner.hub.is_shutting_down(),
            cleanup: CleanupHealth {
                scopes: self.inner.registry.len(),
                pending,
                disabled,
            },
        }
    }
}

impl CoordinatorInner {
    fn on_hidden(self: &Arc<Self>) {
        let mut state = self.state.lock();
        state.hidden = true;
        if state.unloaded {
            return;
        }
        state.cancel_pending();
        let epoch = state.pending_epoch;
        let grace = self.config.hidden_grace;
        let weak: Weak<CoordinatorInner> = Arc::downgrade(self);
        state.pending = Some(self.runtime.spawn(async move {
            tokio::time::sleep(grace).await;
            if let Some(inner) = weak.upgrade() {
                inner.on_grace_elapsed(epoch);
            }
        }));
        debug!(
            target = "realtime.coordinator",
            grace_ms = grace.as_millis() as u64,
            "host hidden; cleanup scheduled"
        );
    }

    fn on_visible(&self) {
        let resume = {
            let mut state = self.state.lock();
            state.hidden = false;
            if state.cancel_pending() {
                debug!(target = "realtime.coordinator", "host visible again; pending cleanup cancelled");
            }
            let resume = state.hidden_cleanup_ran && !state.unloaded;
            state.hidden_cleanup_ran = false;
            resume
        };
        if resume && self.hub.resume() {
            info!(target = "realtime.coordinator", "host visible; subscriptions accepted again");
        }
    }

    fn on_unload(&self) {
        {
            let mut state = self.state.lock();
            state.unloaded = true;
            state.cancel_pending();
        }
        self.run_cleanup("unload");
    }

    fn on_grace_elapsed(&self, epoch: u64) {
        {
            let mut state = self.state.lock();
            if state.pending_epoch != epoch || !state.hidden || state.unloaded {
                return;
            }
            state.pending = None;
            if state.disabled() {
                info!(target = "realtime.coordinator", reason = "disabled", "hidden cleanup skipped");
                return;
            }
        }

        // Checked outside the lock: both call into caller-provided code.
        if self.writes.has_pending_writes() {
            info!(target = "realtime.coordinator", reason = "writes_in_flight", "hidden cleanup skipped");
            return;
        }
        if self.host.has_focus() {
            info!(target = "realtime.coordinator", reason = "focused", "hidden cleanup skipped");
            return;
        }

        self.state.lock().hidden_cleanup_ran = true;
        self.run_cleanup("hidden");
    }

    fn run_cleanup(&self, trigger: &'static str) -> CleanupReport {
        metrics::CLEANUP_RUNS.with_label_values(&[trigger]).inc();
        let report = self.registry.run_all();
        info!(
            target = "realtime.coordinator",
            trigger,
            completed = report.completed.len(),
            failed = report.failed.len(),
            "cleanup pass finished"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HubConfig;
    use crate::host::HostSignals;
    use crate::writes::WriteTracker;
    use realtime_transport::LocalTransport;

    fn coordinator() -> CleanupCoordinator {
        let writes = WriteTracker::new();
        let hub = Multiplexer::new(
            Arc::new(LocalTransport::new()),
            writes.clone(),
            HubConfig::default(),
        )
        .expect("inside runtime");
        CleanupCoordinator::new(
            hub,
            Arc::new(HostSignals::default()),
            Arc::new(writes),
            CoordinatorConfig::default(),
        )
        .expect("inside runtime")
    }

    #[tokio::test(start_paused = true)]
    async fn registers_subscription_teardown_as_high_priority_scope() {
        let coordinator = coordinator();
        assert_eq!(coordinator.registry().len(), 1);
        let report = coordinator.perform_cleanup();
        assert_eq!(report.completed, vec![SUBSCRIPTIONS_TASK.to_string()]);
        assert!(coordinator.multiplexer().is_shutting_down());
    }

    #[tokio::test(start_paused = true)]
    async fn overlapping_disables_keep_the_later_deadline() {
        let coordinator = coordinator();
        coordinator.disable_cleanup_temporarily(Duration::from_secs(10));
        coordinator.disable_cleanup_temporarily(Duration::from_secs(2));
        assert!(coordinator.cleanup_disabled());

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(coordinator.cleanup_disabled());
        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(!coordinator.cleanup_disabled());
    }

    #[tokio::test(start_paused = true)]
    async fn pending_flag_tracks_the_grace_timer() {
        let coordinator = coordinator();
        assert!(!coordinator.cleanup_pending());
        coordinator.handle_host_event(HostEvent::Hidden);
        assert!(coordinator.cleanup_pending());
        assert!(coordinator.health().cleanup.pending);

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(!coordinator.cleanup_pending());
        assert!(coordinator.multiplexer().is_shutting_down());
    }
}
