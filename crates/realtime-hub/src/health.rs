use std::collections::BTreeMap;

use serde::Serialize;

/// Per-connection diagnostics, keyed by the subscription key's display form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubscriptionHealth {
    pub ref_count: usize,
    /// Milliseconds since the last delivered event, join, or `Established` status.
    pub idle_ms: u64,
    pub write_in_flight: bool,
    pub stale: bool,
    pub teardown_pending: bool,
}

/// A key whose connection failed and is waiting for its backoff timer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecoveryHealth {
    pub consumers: usize,
    pub failures: u32,
    /// None while the replacement channel is being opened.
    pub retry_in_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CleanupHealth {
    pub scopes: usize,
    pub pending: bool,
    pub disabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HubHealth {
    pub subscriptions: BTreeMap<String, SubscriptionHealth>,
    pub recovering: BTreeMap<String, RecoveryHealth>,
    pub shutting_down: bool,
    pub cleanup: CleanupHealth,
}
