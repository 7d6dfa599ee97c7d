use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use realtime_hub::{
    ChangeKind, CleanupCoordinator, CleanupPriority, CleanupRegistry, CoordinatorConfig,
    HostEvent, HostSignals, HubConfig, Multiplexer, SubscriptionHandle, SubscriptionRequest,
    WriteTracker, SUBSCRIPTIONS_TASK,
};
use realtime_transport::LocalTransport;
use tokio::sync::mpsc;

struct Harness {
    transport: LocalTransport,
    host: HostSignals,
    coordinator: CleanupCoordinator,
}

impl Harness {
    fn new() -> Self {
        let transport = LocalTransport::new();
        let writes = WriteTracker::new();
        let host = HostSignals::new(false);
        let hub = Multiplexer::new(
            Arc::new(transport.clone()),
            writes.clone(),
            HubConfig::default(),
        )
        .unwrap();
        let coordinator = CleanupCoordinator::new(
            hub,
            Arc::new(host.clone()),
            Arc::new(writes),
            CoordinatorConfig::default(),
        )
        .unwrap();
        Self {
            transport,
            host,
            coordinator,
        }
    }

    fn hub(&self) -> &Multiplexer {
        self.coordinator.multiplexer()
    }

    fn subscribe(&self) -> SubscriptionHandle {
        self.hub().subscribe(
            SubscriptionRequest::new("g", "workouts", [ChangeKind::Update], |_| Ok(())).unwrap(),
        )
    }
}

fn past_grace() -> Duration {
    CoordinatorConfig::default().hidden_grace + Duration::from_millis(10)
}

#[tokio::test(start_paused = true)]
async fn hidden_host_is_cleaned_up_after_the_grace_period() {
    let harness = Harness::new();
    let _handle = harness.subscribe();

    harness.coordinator.handle_host_event(HostEvent::Hidden);
    tokio::time::sleep(Duration::from_secs(4)).await;
    assert_eq!(harness.hub().connection_count(), 1);

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(harness.hub().connection_count(), 0);
    assert!(harness.hub().is_shutting_down());
    assert_eq!(harness.transport.open_channel_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn becoming_visible_cancels_pending_cleanup() {
    let harness = Harness::new();
    let _handle = harness.subscribe();

    harness.coordinator.handle_host_event(HostEvent::Hidden);
    tokio::time::sleep(Duration::from_secs(3)).await;
    harness.coordinator.handle_host_event(HostEvent::Visible);
    assert!(!harness.coordinator.cleanup_pending());

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(harness.hub().connection_count(), 1);
    assert!(!harness.hub().is_shutting_down());
}

#[tokio::test(start_paused = true)]
async fn repeated_hidden_events_restart_the_grace_period() {
    let harness = Harness::new();
    let _handle = harness.subscribe();

    harness.coordinator.handle_host_event(HostEvent::Hidden);
    tokio::time::sleep(Duration::from_secs(3)).await;
    harness.coordinator.handle_host_event(HostEvent::Hidden);
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(harness.hub().connection_count(), 1);

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(harness.hub().connection_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn hidden_cleanup_is_skipped_while_writing() {
    let harness = Harness::new();
    let _handle = harness.subscribe();
    harness.hub().mark_write_active("save");

    harness.coordinator.handle_host_event(HostEvent::Hidden);
    tokio::time::sleep(past_grace()).await;
    assert_eq!(harness.hub().connection_count(), 1);
    assert!(!harness.coordinator.cleanup_pending());

    // skipped, not retried
    harness.hub().mark_write_complete("save");
    tokio::time::sleep(past_grace() * 2).await;
    assert_eq!(harness.hub().connection_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn hidden_cleanup_is_skipped_while_focused() {
    let harness = Harness::new();
    let _handle = harness.subscribe();
    harness.host.set_focus(true);

    harness.coordinator.handle_host_event(HostEvent::Hidden);
    tokio::time::sleep(past_grace()).await;
    assert_eq!(harness.hub().connection_count(), 1);
    assert!(!harness.hub().is_shutting_down());
}

#[tokio::test(start_paused = true)]
async fn hidden_cleanup_is_skipped_while_disabled() {
    let harness = Harness::new();
    let _handle = harness.subscribe();
    harness
        .coordinator
        .disable_cleanup_temporarily(Duration::from_secs(60));

    harness.coordinator.handle_host_event(HostEvent::Hidden);
    tokio::time::sleep(past_grace()).await;
    assert_eq!(harness.hub().connection_count(), 1);

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert!(!harness.coordinator.cleanup_disabled());
    harness.coordinator.handle_host_event(HostEvent::Hidden);
    tokio::time::sleep(past_grace()).await;
    assert_eq!(harness.hub().connection_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn unload_cleans_up_unconditionally() {
    let harness = Harness::new();
    let _a = harness.subscribe();
    let _b = harness.hub().subscribe(
        SubscriptionRequest::new("g", "sets", [ChangeKind::Delete], |_| Ok(())).unwrap(),
    );
    harness.hub().mark_write_active("save");
    harness.host.set_focus(true);
    harness
        .coordinator
        .disable_cleanup_temporarily(Duration::from_secs(600));

    harness.coordinator.handle_host_event(HostEvent::Unload);
    assert_eq!(harness.hub().connection_count(), 0);
    assert!(harness.hub().active_subscriptions().is_empty());
    assert_eq!(harness.transport.open_channel_count(), 0);
    assert!(!harness.hub().write_tracker().is_busy());
}

#[tokio::test(start_paused = true)]
async fn visible_after_hidden_cleanup_accepts_subscriptions_again() {
    let harness = Harness::new();
    let _handle = harness.subscribe();

    harness.coordinator.handle_host_event(HostEvent::Hidden);
    tokio::time::sleep(past_grace()).await;
    assert!(harness.subscribe().is_inert());

    harness.coordinator.handle_host_event(HostEvent::Visible);
    assert!(!harness.hub().is_shutting_down());
    let handle = harness.subscribe();
    assert!(!handle.is_inert());
    assert_eq!(harness.hub().connection_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn nothing_resumes_after_unload() {
    let harness = Harness::new();
    harness.coordinator.handle_host_event(HostEvent::Unload);

    harness.coordinator.handle_host_event(HostEvent::Hidden);
    assert!(!harness.coordinator.cleanup_pending());
    harness.coordinator.handle_host_event(HostEvent::Visible);
    assert!(harness.hub().is_shutting_down());
    assert!(harness.subscribe().is_inert());
}

#[tokio::test(start_paused = true)]
async fn manual_cleanup_supersedes_the_pending_timer() {
    let harness = Harness::new();
    let runs = Arc::new(AtomicUsize::new(0));
    {
        let runs = Arc::clone(&runs);
        harness
            .coordinator
            .add_cleanup_task("count", CleanupPriority::Normal, move || {
                runs.fetch_add(1, Ordering::SeqCst);
            });
    }

    harness.coordinator.handle_host_event(HostEvent::Hidden);
    let report = harness.coordinator.perform_cleanup();
    assert_eq!(report.completed.len(), 2);
    assert!(!harness.coordinator.cleanup_pending());

    tokio::time::sleep(past_grace() * 2).await;
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn scopes_run_by_priority_and_can_be_removed() {
    let harness = Harness::new();
    let order = Arc::new(Mutex::new(Vec::new()));
    let record = |label: &'static str| {
        let order = Arc::clone(&order);
        move || order.lock().push(label)
    };
    harness
        .coordinator
        .add_cleanup_task("cache", CleanupPriority::Low, record("cache"));
    harness
        .coordinator
        .add_cleanup_task("flush", CleanupPriority::Critical, record("flush"));
    let drafts = harness
        .coordinator
        .add_cleanup_task("drafts", CleanupPriority::Normal, record("drafts"));
    assert_eq!(harness.coordinator.health().cleanup.scopes, 4);

    assert!(harness.coordinator.remove_cleanup_task(drafts));
    let report = harness.coordinator.perform_cleanup();
    assert_eq!(
        report.completed,
        vec!["flush".to_string(), SUBSCRIPTIONS_TASK.to_string(), "cache".to_string()]
    );
    assert_eq!(*order.lock(), vec!["flush", "cache"]);
}

#[tokio::test(start_paused = true)]
async fn host_listener_applies_events_until_the_sender_closes() {
    let harness = Harness::new();
    let _handle = harness.subscribe();
    let (tx, rx) = mpsc::channel(8);
    let listener = harness.coordinator.spawn_host_listener(rx);

    tx.send(HostEvent::Hidden).await.unwrap();
    tokio::time::sleep(past_grace()).await;
    assert_eq!(harness.hub().connection_count(), 0);

    tx.send(HostEvent::Visible).await.unwrap();
    drop(tx);
    listener.await.unwrap();
    assert!(!harness.hub().is_shutting_down());
}

#[tokio::test(start_paused = true)]
async fn health_snapshot_serializes() {
    let harness = Harness::new();
    let handle = harness.subscribe();
    harness.hub().mark_write_active("save");

    let health = harness.coordinator.health();
    let entry = &health.subscriptions[&handle.key().to_string()];
    assert_eq!(entry.ref_count, 1);
    assert!(entry.write_in_flight);

    let value = serde_json::to_value(&health).unwrap();
    assert_eq!(value["shutting_down"], false);
    assert_eq!(value["cleanup"]["scopes"], 1);
    assert_eq!(value["subscriptions"]["g:workouts:UPDATE:"]["ref_count"], 1);
}

#[test_timeout::timeout(5)]
fn registry_runs_without_a_runtime() {
    let registry = CleanupRegistry::new();
    let runs = Arc::new(AtomicUsize::new(0));
    for priority in [CleanupPriority::Low, CleanupPriority::Critical] {
        let runs = Arc::clone(&runs);
        registry.register(format!("{priority:?}"), priority, move || {
            runs.fetch_add(1, Ordering::SeqCst);
        });
    }
    let report = registry.run_all();
    assert_eq!(report.completed, vec!["Critical".to_string(), "Low".to_string()]);
    assert_eq!(runs.load(Ordering::SeqCst), 2);
}
