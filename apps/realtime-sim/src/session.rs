use std::collections::HashMap;

use anyhow::{bail, Context, Result};
use realtime_hub::{
    metrics, ChangeEvent, CleanupCoordinator, HostSignals, Multiplexer, SubscriptionHandle,
    SubscriptionRequest,
};
use realtime_transport::LocalTransport;
use tracing::{info, warn};

use crate::script::Command;

/// Named subscriptions plus the handles needed to poke the transport and host.
pub struct Session {
    transport: LocalTransport,
    host: HostSignals,
    coordinator: CleanupCoordinator,
    subscriptions: HashMap<String, SubscriptionHandle>,
}

impl Session {
    pub fn new(transport: LocalTransport, host: HostSignals, coordinator: CleanupCoordinator) -> Self {
        Self {
            transport,
            host,
            coordinator,
            subscriptions: HashMap::new(),
        }
    }

    fn hub(&self) -> &Multiplexer {
        self.coordinator.multiplexer()
    }

    pub async fn apply(&mut self, command: Command) -> Result<()> {
        match command {
            Command::Subscribe {
                name,
                group,
                resource,
                kinds,
                filter,
            } => {
                let consumer = name.clone();
                let mut request =
                    SubscriptionRequest::new(group, resource, kinds, move |event: &ChangeEvent| {
                        println!(
                            "[{consumer}] {} {} {}",
                            event.kind, event.resource, event.record
                        );
                        Ok(())
                    })?;
                if let Some(filter) = filter {
                    request = request.with_filter(filter);
                }
                let handle = self.hub().subscribe(request);
                if handle.is_inert() {
                    warn!(subscription = %name, "hub is shut down; subscription ignored");
                    return Ok(());
                }
                info!(subscription = %name, key = %handle.key(), "subscribed");
                // replacing a name releases the previous handle
                self.subscriptions.insert(name, handle);
            }
            Command::Unsubscribe(name) => {
                let Some(handle) = self.subscriptions.remove(&name) else {
                    bail!("no subscription named {name:?}");
                };
                handle.release();
            }
            Command::Emit {
                group,
                kind,
                resource,
                record,
            } => {
                let delivered = self
                    .transport
                    .publish(&group, ChangeEvent::new(kind, resource, record));
                println!("emitted to {delivered} binding(s)");
            }
            Command::Status { group, status } => {
                let channels = self.transport.emit_status(&group, status);
                println!("status sent to {channels} channel(s)");
            }
            Command::WriteBegin(op) => self.hub().mark_write_active(&op),
            Command::WriteEnd(op) => self.hub().mark_write_complete(&op),
            Command::Host(event) => self.coordinator.handle_host_event(event),
            Command::Focus(focused) => self.host.set_focus(focused),
            Command::Disable(duration) => self.coordinator.disable_cleanup_temporarily(duration),
            Command::Cleanup => {
                let report = self.coordinator.perform_cleanup();
                println!(
                    "cleanup completed={:?} failed={:?}",
                    report.completed, report.failed
                );
            }
            Command::Sleep(duration) => tokio::time::sleep(duration).await,
            Command::Health => {
                let health = serde_json::to_string_pretty(&self.coordinator.health())
                    .context("encoding health snapshot")?;
                println!("{health}");
            }
            Command::Metrics => {
                print!("{}", String::from_utf8_lossy(&metrics::gather()));
            }
            Command::Subscriptions => {
                for key in self.hub().active_subscriptions() {
                    println!("{key}");
                }
            }
            Command::Quit => {}
        }
        Ok(())
    }
}
