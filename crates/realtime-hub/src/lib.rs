//! Lifecycle management for realtime change subscriptions.
//!
//! [`Multiplexer`] shares one channel per [`SubscriptionKey`] between all of its
//! consumers, holds connections open while writes are in flight and recreates
//! failed channels with backoff. [`CleanupCoordinator`] turns host lifecycle
//! events into cleanup passes over a priority ordered [`CleanupRegistry`].

pub mod cleanup;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod health;
pub mod host;
pub mod metrics;
pub mod multiplexer;
pub mod request;
pub mod writes;

pub use cleanup::{CleanupPriority, CleanupRegistry, CleanupReport, CleanupTaskId};
pub use config::{Backoff, BackoffPolicy, CoordinatorConfig, HubConfig, StalePolicy};
pub use coordinator::{CleanupCoordinator, SUBSCRIPTIONS_TASK};
pub use error::{HubError, HubResult};
pub use health::{CleanupHealth, HubHealth, RecoveryHealth, SubscriptionHealth};
pub use host::{HostEvent, HostLifecycle, HostSignals};
pub use multiplexer::{Multiplexer, SubscriptionHandle, WriteGuard};
pub use request::{parse_kinds, ChangeCallback, SubscriptionKey, SubscriptionRequest};
pub use writes::{PendingWrites, WriteTracker};

pub use realtime_transport::{ChangeEvent, ChangeKind, ChannelStatus};
