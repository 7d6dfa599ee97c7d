use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use realtime_transport::{
    ChangeEvent, ChannelStatus, RealtimeChannel, RealtimeTransport, TransportError,
};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::{HubConfig, StalePolicy};
use crate::error::HubResult;
use crate::health::{RecoveryHealth, SubscriptionHealth};
use crate::metrics;
use crate::request::{ChangeCallback, SubscriptionKey, SubscriptionRequest};
use crate::writes::WriteTracker;

type Consumers = BTreeMap<u64, ChangeCallback>;

/// Shares one realtime channel between every consumer of the same
/// [`SubscriptionKey`].
///
/// Cloning is cheap; all clones drive the same set of connections.
#[derive(Clone)]
pub struct Multiplexer {
    inner: Arc<HubInner>,
}

struct HubInner {
    transport: Arc<dyn RealtimeTransport>,
    writes: WriteTracker,
    config: HubConfig,
    runtime: Handle,
    state: Mutex<HubState>,
}

#[derive(Default)]
struct HubState {
    connections: HashMap<SubscriptionKey, ActiveConnection>,
    /// Keys without a live channel: being opened, or parked on a backoff timer.
    /// A key is never in both maps.
    pending: HashMap<SubscriptionKey, PendingConnection>,
    shutting_down: bool,
    /// Bumped by every global cleanup; handles from older epochs are inert.
    epoch: u64,
    next_id: u64,
    health_task: Option<JoinHandle<()>>,
}

impl HubState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

struct ActiveConnection {
    id: u64,
    channel: Arc<dyn RealtimeChannel>,
    request: SubscriptionRequest,
    consumers: Consumers,
    last_activity: Instant,
    write_in_flight: bool,
    failures: u32,
    teardown_scheduled: bool,
}

struct PendingConnection {
    attempt: u64,
    request: SubscriptionRequest,
    consumers: Consumers,
    failures: u32,
    /// Some while waiting for the backoff timer, None while the channel is opening.
    retry_at: Option<Instant>,
}

impl Multiplexer {
    /// Must be called from within a Tokio runtime; deferred teardown, backoff
    /// and health checks run as tasks on it.
    pub fn new(
        transport: Arc<dyn RealtimeTransport>,
        writes: WriteTracker,
        config: HubConfig,
    ) -> HubResult<Self> {
        let runtime = Handle::try_current()?;
        let inner = Arc::new(HubInner {
            transport,
            writes,
            config,
            runtime,
            state: Mutex::new(HubState::default()),
        });
        inner.start_health_check();
        Ok(Self { inner })
    }

    /// Register interest in `request`'s changes.
    ///
    /// Joins the existing connection for the request's key when there is one;
    /// otherwise opens a channel. While the hub is shutting down the returned
    /// handle is inert and nothing is opened.
    pub fn subscribe(&self, request: SubscriptionRequest) -> SubscriptionHandle {
        let key = request.key();
        let callback = request.callback();
        let mut guard = self.inner.state.lock();
        let state = &mut *guard;
        if state.shutting_down {
            warn!(target = "realtime.hub", key = %key, "subscribe rejected while shutting down");
            return SubscriptionHandle::inert(key);
        }

        let consumer = state.next_id();
        let handle = SubscriptionHandle {
            hub: Arc::downgrade(&self.inner),
            key: key.clone(),
            consumer: Some(consumer),
            epoch: state.epoch,
        };

        if let Some(connection) = state.connections.get_mut(&key) {
            connection.consumers.insert(consumer, callback);
            connection.last_activity = Instant::now();
            debug!(
                target = "realtime.hub",
                key = %key,
                ref_count = connection.consumers.len(),
                "joined shared connection"
            );
            return handle;
        }

        if let Some(pending) = state.pending.get_mut(&key) {
            pending.consumers.insert(consumer, callback);
            debug!(
                target = "realtime.hub",
                key = %key,
                consumers = pending.consumers.len(),
                "joined connection awaiting its channel"
            );
            return handle;
        }

        let attempt = state.next_id();
        let mut consumers = Consumers::new();
        consumers.insert(consumer, callback);
        state.pending.insert(
            key.clone(),
            PendingConnection {
                attempt,
                request,
                consumers,
                failures: 0,
                retry_at: None,
            },
        );
        drop(guard);

        self.inner.open_attempt(&key, attempt);
        handle
    }

    pub fn mark_write_active(&self, op_id: &str) {
        self.inner.writes.mark_active(op_id);
        metrics::WRITES_IN_FLIGHT.set(self.inner.writes.len() as i64);
        let mut state = self.inner.state.lock();
        for connection in state.connections.values_mut() {
            connection.write_in_flight = true;
        }
        debug!(target = "realtime.hub", op_id, "write marked active");
    }

    pub fn mark_write_complete(&self, op_id: &str) {
        let idle = self.inner.writes.mark_complete(op_id);
        metrics::WRITES_IN_FLIGHT.set(self.inner.writes.len() as i64);
        if idle {
            let mut state = self.inner.state.lock();
            for connection in state.connections.values_mut() {
                connection.write_in_flight = false;
            }
        }
        debug!(target = "realtime.hub", op_id, idle, "write marked complete");
    }

    /// Mark `op_id` active until the returned guard is dropped.
    pub fn begin_write(&self, op_id: impl Into<String>) -> WriteGuard {
        let op_id = op_id.into();
        self.mark_write_active(&op_id);
        WriteGuard {
            hub: self.clone(),
            op_id,
        }
    }

    /// Global teardown. Closes every connection regardless of consumers or
    /// writes in flight, stops health checks, forgets pending recreations and
    /// clears the write set. Later subscribes are rejected until [`resume`].
    ///
    /// [`resume`]: Multiplexer::resume
    pub fn cleanup(&self) {
        self.inner.cleanup();
    }

    /// Accept subscriptions again after [`cleanup`](Multiplexer::cleanup).
    /// Returns false if the hub was not shut down.
    pub fn resume(&self) -> bool {
        {
            let mut state = self.inner.state.lock();
            if !state.shutting_down {
                return false;
            }
            state.shutting_down = false;
        }
        self.inner.start_health_check();
        info!(target = "realtime.hub", "realtime hub resumed");
        true
    }

    /// Run one health pass now. Returns how many connections were stale.
    pub fn run_health_check(&self) -> usize {
        self.inner.check_health()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.state.lock().shutting_down
    }

    pub fn write_tracker(&self) -> &WriteTracker {
        &self.inner.writes
    }

    pub fn config(&self) -> &HubConfig {
        &self.inner.config
    }

    pub fn connection_count(&self) -> usize {
        self.inner.state.lock().connections.len()
    }

    /// Consumers of the live connection for `key`, if there is one.
    pub fn ref_count(&self, key: &SubscriptionKey) -> Option<usize> {
        self.inner
            .state
            .lock()
            .connections
            .get(key)
            .map(|connection| connection.consumers.len())
    }

    /// Keys with a live connection, sorted.
    pub fn active_subscriptions(&self) -> Vec<String> {
        let state = self.inner.state.lock();
        let mut keys: Vec<String> = state.connections.keys().map(ToString::to_string).collect();
        keys.sort();
        keys
    }

    pub fn subscription_health(&self) -> BTreeMap<String, SubscriptionHealth> {
        let now = Instant::now();
        let stale_after = self.inner.config.stale_after;
        let state = self.inner.state.lock();
        state
            .connections
            .iter()
            .map(|(key, connection)| {
                let idle = now.saturating_duration_since(connection.last_activity);
                (
                    key.to_string(),
                    SubscriptionHealth {
                        ref_count: connection.consumers.len(),
                        idle_ms: idle.as_millis() as u64,
                        write_in_flight: connection.write_in_flight,
                        stale: idle > stale_after,
                        teardown_pending: connection.teardown_scheduled,
                    },
                )
            })
            .collect()
    }

    pub fn recovering(&self) -> BTreeMap<String, RecoveryHealth> {
        let now = Instant::now();
        let state = self.inner.state.lock();
        state
            .pending
            .iter()
            .map(|(key, pending)| {
                (
                    key.to_string(),
                    RecoveryHealth {
                        consumers: pending.consumers.len(),
                        failures: pending.failures,
                        retry_in_ms: pending
                            .retry_at
                            .map(|at| at.saturating_duration_since(now).as_millis() as u64),
                    },
                )
            })
            .collect()
    }

    #[cfg(test)]
    pub(crate) fn destroy(&self, key: &SubscriptionKey) -> bool {
        self.inner.destroy(key, "manual")
    }
}

impl HubInner {
    fn open_attempt(self: &Arc<Self>, key: &SubscriptionKey, attempt: u64) {
        let request = {
            let state = self.state.lock();
            match state.pending.get(key) {
                Some(pending) if pending.attempt == attempt && pending.retry_at.is_none() => {
                    pending.request.clone()
                }
                _ => return,
            }
        };

        let opened = self
            .transport
            .open_channel(request.group())
            .and_then(|channel| match self.bind(&channel, key, &request, attempt) {
                Ok(()) => Ok(channel),
                Err(err) => {
                    channel.close();
                    Err(err)
                }
            });

        match opened {
            Ok(channel) => self.install(key, attempt, channel),
            Err(TransportError::InvalidFilter(expr)) => {
                let mut state = self.state.lock();
                if state
                    .pending
                    .get(key)
                    .map_or(false, |pending| pending.attempt == attempt)
                {
                    state.pending.remove(key);
                }
                warn!(
                    target = "realtime.hub",
                    key = %key,
                    filter = %expr,
                    "dropping subscription with an invalid filter"
                );
            }
            Err(err) => {
                metrics::TRANSPORT_FAILURES.with_label_values(&["open"]).inc();
                warn!(
                    target = "realtime.hub",
                    key = %key,
                    error = %err,
                    "failed to open realtime channel"
                );
                self.park(key, attempt);
            }
        }
    }

    /// Register one handler per requested kind plus the status observer. Every
    /// callback holds the connection id so late events from a replaced channel
    /// are ignored.
    fn bind(
        self: &Arc<Self>,
        channel: &Arc<dyn RealtimeChannel>,
        key: &SubscriptionKey,
        request: &SubscriptionRequest,
        connection_id: u64,
    ) -> Result<(), TransportError> {
        for kind in request.kinds() {
            let weak = Arc::downgrade(self);
            let key = key.clone();
            channel.on_change(
                *kind,
                request.resource(),
                request.filter(),
                Arc::new(move |event: ChangeEvent| {
                    if let Some(inner) = weak.upgrade() {
                        inner.deliver(&key, connection_id, event);
                    }
                }),
            )?;
        }

        let weak = Arc::downgrade(self);
        let key = key.clone();
        channel.on_status(Arc::new(move |status: ChannelStatus| {
            if let Some(inner) = weak.upgrade() {
                inner.on_status(&key, connection_id, status);
            }
        }));
        Ok(())
    }

    fn install(&self, key: &SubscriptionKey, attempt: u64, channel: Arc<dyn RealtimeChannel>) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let matches = state
            .pending
            .get(key)
            .map_or(false, |pending| pending.attempt == attempt);
        let pending = if matches { state.pending.remove(key) } else { None };

        let pending = match pending {
            Some(pending) if !state.shutting_down && !pending.consumers.is_empty() => pending,
            _ => {
                drop(guard);
                debug!(
                    target = "realtime.hub",
                    key = %key,
                    "channel opened after its consumers left; closing"
                );
                channel.close();
                return;
            }
        };

        let consumers = pending.consumers.len();
        let failures = pending.failures;
        state.connections.insert(
            key.clone(),
            ActiveConnection {
                id: attempt,
                channel,
                request: pending.request,
                consumers: pending.consumers,
                last_activity: Instant::now(),
                write_in_flight: self.writes.is_busy(),
                failures,
                teardown_scheduled: false,
            },
        );
        metrics::ACTIVE_CONNECTIONS.set(state.connections.len() as i64);
        drop(guard);

        metrics::CONNECTIONS_OPENED
            .with_label_values(&[key.group()])
            .inc();
        if failures > 0 {
            metrics::RECREATE_ATTEMPTS
                .with_label_values(&["recovered"])
                .inc();
        }
        info!(
            target = "realtime.hub",
            key = %key,
            connection_id = attempt,
            consumers,
            "realtime connection opened"
        );
    }

    /// Opening failed: wait out a backoff delay, or give up if nobody is left.
    fn park(self: &Arc<Self>, key: &SubscriptionKey, attempt: u64) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let Some(pending) = state
            .pending
            .get_mut(key)
            .filter(|pending| pending.attempt == attempt)
        else {
            return;
        };
        if pending.consumers.is_empty() || state.shutting_down {
            state.pending.remove(key);
            return;
        }
        if pending.failures > 0 {
            metrics::RECREATE_ATTEMPTS.with_label_values(&["failed"]).inc();
        }
        pending.failures += 1;
        let delay = self
            .config
            .backoff
            .delay(pending.consumers.len(), pending.failures);
        pending.retry_at = Some(Instant::now() + delay);
        drop(guard);
        self.schedule_retry(key.clone(), attempt, delay);
    }

    fn schedule_retry(self: &Arc<Self>, key: SubscriptionKey, attempt: u64, delay: Duration) {
        metrics::RETRY_DELAY_SECONDS.observe(delay.as_secs_f64());
        let weak = Arc::downgrade(self);
        self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                inner.retry(&key, attempt);
            }
        });
    }

    fn retry(self: &Arc<Self>, key: &SubscriptionKey, attempt: u64) {
        let next = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if state.shutting_down || state.connections.contains_key(key) {
                return;
            }
            let next = state.next_id();
            let Some(pending) = state.pending.get_mut(key) else {
                return;
            };
            if pending.attempt != attempt || pending.retry_at.is_none() {
                return;
            }
            pending.attempt = next;
            pending.retry_at = None;
            next
        };
        metrics::RECREATE_ATTEMPTS
            .with_label_values(&["attempted"])
            .inc();
        info!(target = "realtime.hub", key = %key, "recreating realtime connection");
        self.open_attempt(key, next);
    }

    fn deliver(&self, key: &SubscriptionKey, connection_id: u64, event: ChangeEvent) {
        let callbacks: Vec<ChangeCallback> = {
            let state = self.state.lock();
            match state.connections.get(key) {
                Some(connection) if connection.id == connection_id => {
                    connection.consumers.values().cloned().collect()
                }
                _ => return,
            }
        };

        let mut delivered = false;
        for callback in callbacks {
            match catch_unwind(AssertUnwindSafe(|| callback(&event))) {
                Ok(Ok(())) => delivered = true,
                Ok(Err(err)) => {
                    metrics::CALLBACK_FAULTS
                        .with_label_values(&[key.resource(), "error"])
                        .inc();
                    warn!(
                        target = "realtime.hub",
                        key = %key,
                        kind = %event.kind,
                        error = %err,
                        "subscriber callback failed"
                    );
                }
                Err(_) => {
                    metrics::CALLBACK_FAULTS
                        .with_label_values(&[key.resource(), "panic"])
                        .inc();
                    warn!(
                        target = "realtime.hub",
                        key = %key,
                        kind = %event.kind,
                        "subscriber callback panicked"
                    );
                }
            }
        }

        if delivered {
            let mut state = self.state.lock();
            if let Some(connection) = state
                .connections
                .get_mut(key)
                .filter(|connection| connection.id == connection_id)
            {
                connection.last_activity = Instant::now();
            }
        }
    }

    fn on_status(self: &Arc<Self>, key: &SubscriptionKey, connection_id: u64, status: ChannelStatus) {
        if status.is_failure() {
            metrics::TRANSPORT_FAILURES
                .with_label_values(&[status.label()])
                .inc();
            warn!(target = "realtime.hub", key = %key, connection_id, ?status, "realtime channel failed");
            self.fail_connection(key, connection_id, status.label());
            return;
        }

        if status == ChannelStatus::Established {
            let mut state = self.state.lock();
            if let Some(connection) = state
                .connections
                .get_mut(key)
                .filter(|connection| connection.id == connection_id)
            {
                connection.failures = 0;
                connection.last_activity = Instant::now();
            }
        }
        debug!(target = "realtime.hub", key = %key, connection_id, status = status.label(), "realtime channel status");
    }

    /// A broken channel serves nobody: drop it whatever its consumer count and,
    /// if anyone still wants it, schedule a recreation after backoff.
    fn fail_connection(self: &Arc<Self>, key: &SubscriptionKey, connection_id: u64, reason: &'static str) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let current = state
            .connections
            .get(key)
            .map_or(false, |connection| connection.id == connection_id);
        if !current {
            return;
        }
        let Some(connection) = Self::take(state, key) else {
            return;
        };

        let ActiveConnection {
            channel,
            request,
            consumers,
            failures,
            ..
        } = connection;
        let failures = failures + 1;
        let consumer_count = consumers.len();
        let retry = if state.shutting_down || consumers.is_empty() {
            None
        } else {
            let delay = self.config.backoff.delay(consumer_count, failures);
            state.pending.insert(
                key.clone(),
                PendingConnection {
                    attempt: connection_id,
                    request,
                    consumers,
                    failures,
                    retry_at: Some(Instant::now() + delay),
                },
            );
            Some(delay)
        };
        drop(guard);

        channel.close();
        metrics::CONNECTIONS_CLOSED
            .with_label_values(&["failed"])
            .inc();
        match retry {
            Some(delay) => {
                warn!(
                    target = "realtime.hub",
                    key = %key,
                    reason,
                    consumers = consumer_count,
                    failures,
                    retry_in_ms = delay.as_millis() as u64,
                    "realtime connection failed; recreating after backoff"
                );
                self.schedule_retry(key.clone(), connection_id, delay);
            }
            None => {
                info!(
                    target = "realtime.hub",
                    key = %key,
                    reason,
                    "realtime connection failed with no consumers; not recreating"
                );
            }
        }
    }

    fn release(self: &Arc<Self>, key: &SubscriptionKey, consumer: u64, epoch: u64) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.epoch != epoch {
            return;
        }

        if let Some(connection) = state.connections.get_mut(key) {
            if connection.consumers.remove(&consumer).is_none() {
                return;
            }
            if !connection.consumers.is_empty() {
                debug!(
                    target = "realtime.hub",
                    key = %key,
                    ref_count = connection.consumers.len(),
                    "consumer released"
                );
                return;
            }
            if self.safe_to_close(connection) {
                let taken = Self::take(state, key);
                drop(guard);
                if let Some(connection) = taken {
                    Self::close(key, connection, "released");
                }
                return;
            }
            if connection.teardown_scheduled {
                return;
            }
            connection.teardown_scheduled = true;
            let connection_id = connection.id;
            drop(guard);
            metrics::DEFERRED_TEARDOWNS
                .with_label_values(&["scheduled"])
                .inc();
            info!(
                target = "realtime.hub",
                key = %key,
                connection_id,
                "last consumer left during a write; deferring teardown"
            );
            self.schedule_deferred_teardown(key.clone(), connection_id);
            return;
        }

        if let Some(pending) = state.pending.get_mut(key) {
            pending.consumers.remove(&consumer);
            // An open in progress notices the empty set itself when it installs.
            if pending.consumers.is_empty() && pending.retry_at.is_some() {
                state.pending.remove(key);
                debug!(
                    target = "realtime.hub",
                    key = %key,
                    "last consumer left while awaiting recreation; cancelled"
                );
            }
        }
    }

    fn schedule_deferred_teardown(self: &Arc<Self>, key: SubscriptionKey, connection_id: u64) {
        let delay = self.config.deferred_teardown;
        let weak = Arc::downgrade(self);
        self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                inner.deferred_teardown(&key, connection_id);
            }
        });
    }

    /// Re-reads current state; nothing captured at scheduling time is trusted.
    fn deferred_teardown(self: &Arc<Self>, key: &SubscriptionKey, connection_id: u64) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let Some(connection) = state
            .connections
            .get_mut(key)
            .filter(|connection| connection.id == connection_id)
        else {
            metrics::DEFERRED_TEARDOWNS.with_label_values(&["gone"]).inc();
            return;
        };
        connection.teardown_scheduled = false;

        if !connection.consumers.is_empty() {
            metrics::DEFERRED_TEARDOWNS
                .with_label_values(&["revived"])
                .inc();
            return;
        }

        if !self.safe_to_close(connection) {
            connection.teardown_scheduled = true;
            drop(guard);
            metrics::DEFERRED_TEARDOWNS
                .with_label_values(&["extended"])
                .inc();
            debug!(
                target = "realtime.hub",
                key = %key,
                connection_id,
                "write still in flight; extending teardown window"
            );
            self.schedule_deferred_teardown(key.clone(), connection_id);
            return;
        }

        let taken = Self::take(state, key);
        drop(guard);
        if let Some(connection) = taken {
            metrics::DEFERRED_TEARDOWNS
                .with_label_values(&["destroyed"])
                .inc();
            Self::close(key, connection, "deferred");
        }
    }

    fn safe_to_close(&self, connection: &ActiveConnection) -> bool {
        !connection.write_in_flight && !self.writes.is_busy()
    }

    #[cfg(test)]
    fn destroy(&self, key: &SubscriptionKey, reason: &'static str) -> bool {
        let taken = {
            let mut state = self.state.lock();
            Self::take(&mut state, key)
        };
        match taken {
            Some(connection) => {
                Self::close(key, connection, reason);
                true
            }
            None => false,
        }
    }

    fn take(state: &mut HubState, key: &SubscriptionKey) -> Option<ActiveConnection> {
        let taken = state.connections.remove(key);
        metrics::ACTIVE_CONNECTIONS.set(state.connections.len() as i64);
        taken
    }

    fn close(key: &SubscriptionKey, connection: ActiveConnection, reason: &'static str) {
        connection.channel.close();
        metrics::CONNECTIONS_CLOSED
            .with_label_values(&[reason])
            .inc();
        info!(
            target = "realtime.hub",
            key = %key,
            connection_id = connection.id,
            reason,
            "realtime connection closed"
        );
    }

    fn cleanup(&self) {
        let (connections, health_task) = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            state.shutting_down = true;
            state.epoch += 1;
            state.pending.clear();
            let connections: Vec<(SubscriptionKey, ActiveConnection)> =
                state.connections.drain().collect();
            metrics::ACTIVE_CONNECTIONS.set(0);
            (connections, state.health_task.take())
        };
        if let Some(task) = health_task {
            task.abort();
        }

        let closed = connections.len();
        for (key, connection) in connections {
            Self::close(&key, connection, "cleanup");
        }
        self.writes.clear();
        metrics::WRITES_IN_FLIGHT.set(0);
        info!(target = "realtime.hub", closed, "realtime hub torn down");
    }

    fn start_health_check(self: &Arc<Self>) {
        let mut state = self.state.lock();
        if state.shutting_down || state.health_task.is_some() {
            return;
        }
        // tokio intervals panic on a zero period
        let period = self
            .config
            .health_check_interval
            .max(Duration::from_millis(1));
        let weak: Weak<HubInner> = Arc::downgrade(self);
        state.health_task = Some(self.runtime.spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                inner.check_health();
            }
        }));
    }

    fn check_health(self: &Arc<Self>) -> usize {
        let now = Instant::now();
        let stale: Vec<(SubscriptionKey, u64, Duration)> = {
            let state = self.state.lock();
            state
                .connections
                .iter()
                .filter_map(|(key, connection)| {
                    let idle = now.saturating_duration_since(connection.last_activity);
                    (idle > self.config.stale_after).then(|| (key.clone(), connection.id, idle))
                })
                .collect()
        };

        for (key, connection_id, idle) in &stale {
            metrics::STALE_CONNECTIONS.inc();
            warn!(
                target = "realtime.hub",
                key = %key,
                connection_id = *connection_id,
                idle_ms = idle.as_millis() as u64,
                "realtime connection is stale"
            );
            if self.config.stale_policy == StalePolicy::Reconnect {
                metrics::TRANSPORT_FAILURES.with_label_values(&["stale"]).inc();
                self.fail_connection(key, *connection_id, "stale");
            }
        }
        stale.len()
    }
}

/// Capability to release exactly the interest acquired by one `subscribe`.
///
/// Released by [`release`](SubscriptionHandle::release) or on drop.
#[must_use = "dropping a subscription handle releases it immediately"]
pub struct SubscriptionHandle {
    hub: Weak<HubInner>,
    key: SubscriptionKey,
    consumer: Option<u64>,
    epoch: u64,
}

impl SubscriptionHandle {
    fn inert(key: SubscriptionKey) -> Self {
        Self {
            hub: Weak::new(),
            key,
            consumer: None,
            epoch: 0,
        }
    }

    pub fn key(&self) -> &SubscriptionKey {
        &self.key
    }

    /// True for handles returned while the hub was shutting down, and after release.
    pub fn is_inert(&self) -> bool {
        self.consumer.is_none()
    }

    pub fn release(mut self) {
        self.release_now();
    }

    fn release_now(&mut self) {
        let Some(consumer) = self.consumer.take() else {
            return;
        };
        if let Some(hub) = self.hub.upgrade() {
            hub.release(&self.key, consumer, self.epoch);
        }
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.release_now();
    }
}

impl fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("key", &self.key.to_string())
            .field("consumer", &self.consumer)
            .field("epoch", &self.epoch)
            .finish()
    }
}

/// Keeps a write marked active until dropped.
#[must_use = "the write is marked complete as soon as the guard drops"]
pub struct WriteGuard {
    hub: Multiplexer,
    op_id: String,
}

impl WriteGuard {
    pub fn op_id(&self) -> &str {
        &self.op_id
    }
}

impl Drop for WriteGuard {
    fn drop(&mut self) {
        self.hub.mark_write_complete(&self.op_id);
    }
}
