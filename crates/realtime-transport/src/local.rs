use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::{
    ChangeEvent, ChangeHandler, ChangeKind, ChannelStatus, RealtimeChannel, RealtimeTransport,
    RowFilter, StatusHandler, TransportError, TransportResult,
};

/// In-memory transport for tests and the simulator.
///
/// Delivery is synchronous and follows registration order. Handlers are cloned
/// out of the locks before they run, so a handler may call back into the
/// transport (close its own channel, publish, open another channel).
#[derive(Clone, Default)]
pub struct LocalTransport {
    inner: Arc<Mutex<LocalState>>,
}

#[derive(Default)]
struct LocalState {
    channels: Vec<Arc<LocalChannel>>,
    next_id: u64,
    opened_total: usize,
    failing_opens: usize,
}

impl LocalTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` calls to `open_channel` fail.
    pub fn fail_next_opens(&self, count: usize) {
        self.inner.lock().failing_opens = count;
    }

    /// Deliver `event` to every open channel in `group` bound to its kind and resource.
    pub fn publish(&self, group: &str, event: ChangeEvent) -> usize {
        let handlers: Vec<ChangeHandler> = self
            .open_channels(group)
            .iter()
            .flat_map(|channel| channel.matching_handlers(&event))
            .collect();
        for handler in &handlers {
            handler(event.clone());
        }
        handlers.len()
    }

    /// Report `status` to the observers of every open channel in `group`.
    pub fn emit_status(&self, group: &str, status: ChannelStatus) -> usize {
        let channels = self.open_channels(group);
        for channel in &channels {
            channel.notify(status.clone());
        }
        channels.len()
    }

    pub fn open_channel_count(&self) -> usize {
        let mut guard = self.inner.lock();
        guard.channels.retain(|channel| !channel.is_closed());
        guard.channels.len()
    }

    pub fn opened_total(&self) -> usize {
        self.inner.lock().opened_total
    }

    /// Number of change bindings across the open channels of `group`.
    pub fn subscribed_handlers(&self, group: &str) -> usize {
        self.open_channels(group)
            .iter()
            .map(|channel| channel.state.lock().bindings.len())
            .sum()
    }

    fn open_channels(&self, group: &str) -> Vec<Arc<LocalChannel>> {
        let mut guard = self.inner.lock();
        guard.channels.retain(|channel| !channel.is_closed());
        guard
            .channels
            .iter()
            .filter(|channel| channel.group == group)
            .cloned()
            .collect()
    }
}

impl RealtimeTransport for LocalTransport {
    fn open_channel(&self, group: &str) -> TransportResult<Arc<dyn RealtimeChannel>> {
        let mut guard = self.inner.lock();
        if guard.failing_opens > 0 {
            guard.failing_opens -= 1;
            return Err(TransportError::Unavailable(format!(
                "local transport refused channel for {group}"
            )));
        }
        guard.next_id += 1;
        guard.opened_total += 1;
        let channel = Arc::new(LocalChannel {
            id: guard.next_id,
            group: group.to_string(),
            state: Mutex::new(ChannelState::default()),
        });
        guard.channels.push(Arc::clone(&channel));
        debug!(target = "realtime.transport", channel_id = channel.id, group, "opened local channel");
        Ok(channel)
    }
}

pub struct LocalChannel {
    id: u64,
    group: String,
    state: Mutex<ChannelState>,
}

#[derive(Default)]
struct ChannelState {
    bindings: Vec<Binding>,
    status_handlers: Vec<StatusHandler>,
    closed: bool,
}

struct Binding {
    kind: ChangeKind,
    resource: String,
    filter: Option<RowFilter>,
    handler: ChangeHandler,
}

impl LocalChannel {
    fn matching_handlers(&self, event: &ChangeEvent) -> Vec<ChangeHandler> {
        let guard = self.state.lock();
        if guard.closed {
            return Vec::new();
        }
        guard
            .bindings
            .iter()
            .filter(|binding| binding.kind == event.kind && binding.resource == event.resource)
            .filter(|binding| {
                binding
                    .filter
                    .as_ref()
                    .map_or(true, |filter| filter.matches(&event.record))
            })
            .map(|binding| Arc::clone(&binding.handler))
            .collect()
    }

    fn notify(&self, status: ChannelStatus) {
        let handlers = self.state.lock().status_handlers.clone();
        for handler in handlers {
            handler(status.clone());
        }
    }
}

impl RealtimeChannel for LocalChannel {
    fn id(&self) -> u64 {
        self.id
    }

    fn group(&self) -> &str {
        &self.group
    }

    fn on_change(
        &self,
        kind: ChangeKind,
        resource: &str,
        filter: Option<&str>,
        handler: ChangeHandler,
    ) -> TransportResult<()> {
        let filter = filter.map(RowFilter::parse).transpose()?;
        let mut guard = self.state.lock();
        if guard.closed {
            return Err(TransportError::Closed);
        }
        guard.bindings.push(Binding {
            kind,
            resource: resource.to_string(),
            filter,
            handler,
        });
        Ok(())
    }

    fn on_status(&self, handler: StatusHandler) {
        self.state.lock().status_handlers.push(handler);
    }

    fn close(&self) {
        let handlers = {
            let mut guard = self.state.lock();
            if guard.closed {
                return;
            }
            guard.closed = true;
            guard.bindings.clear();
            std::mem::take(&mut guard.status_handlers)
        };
        debug!(target = "realtime.transport", channel_id = self.id, group = %self.group, "closed local channel");
        for handler in handlers {
            handler(ChannelStatus::Closed);
        }
    }

    fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_handler(counter: &Arc<AtomicUsize>) -> ChangeHandler {
        let counter = Arc::clone(counter);
        Arc::new(move |_event: ChangeEvent| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn delivers_matching_kind_resource_and_filter() {
        let transport = LocalTransport::new();
        let channel = transport.open_channel("g").expect("open");
        let hits = Arc::new(AtomicUsize::new(0));
        channel
            .on_change(
                ChangeKind::Update,
                "workouts",
                Some("user_id=eq.1"),
                counting_handler(&hits),
            )
            .expect("bind");

        let mine = serde_json::json!({"user_id": 1});
        let theirs = serde_json::json!({"user_id": 2});
        assert_eq!(transport.publish("g", ChangeEvent::new(ChangeKind::Update, "workouts", mine.clone())), 1);
        assert_eq!(transport.publish("g", ChangeEvent::new(ChangeKind::Update, "workouts", theirs)), 0);
        assert_eq!(transport.publish("g", ChangeEvent::new(ChangeKind::Delete, "workouts", mine.clone())), 0);
        assert_eq!(transport.publish("other", ChangeEvent::new(ChangeKind::Update, "workouts", mine)), 0);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn close_is_idempotent_and_reports_closed_once() {
        let transport = LocalTransport::new();
        let channel = transport.open_channel("g").expect("open");
        let closed = Arc::new(AtomicUsize::new(0));
        {
            let closed = Arc::clone(&closed);
            channel.on_status(Arc::new(move |status: ChannelStatus| {
                if status == ChannelStatus::Closed {
                    closed.fetch_add(1, Ordering::SeqCst);
                }
            }));
        }
        channel.close();
        channel.close();
        assert_eq!(closed.load(Ordering::SeqCst), 1);
        assert_eq!(transport.open_channel_count(), 0);
        assert!(matches!(
            channel.on_change(ChangeKind::Create, "t", None, Arc::new(|_: ChangeEvent| {})),
            Err(TransportError::Closed)
        ));
    }

    #[test]
    fn refuses_opens_while_failing() {
        let transport = LocalTransport::new();
        transport.fail_next_opens(1);
        assert!(matches!(transport.open_channel("g"), Err(TransportError::Unavailable(_))));
        assert!(transport.open_channel("g").is_ok());
        assert_eq!(transport.opened_total(), 1);
    }

    #[test]
    fn rejects_invalid_filters_at_bind_time() {
        let transport = LocalTransport::new();
        let channel = transport.open_channel("g").expect("open");
        assert!(matches!(
            channel.on_change(ChangeKind::Update, "t", Some("nonsense"), Arc::new(|_: ChangeEvent| {})),
            Err(TransportError::InvalidFilter(_))
        ));
    }
}
