use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use thiserror::Error;

mod filter;
mod local;

pub use filter::{FilterOp, RowFilter};
pub use local::{LocalChannel, LocalTransport};

/// Kind of row mutation a channel can be asked to forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ChangeKind {
    #[serde(rename = "INSERT", alias = "CREATE")]
    Create,
    #[serde(rename = "UPDATE")]
    Update,
    #[serde(rename = "DELETE")]
    Delete,
}

impl ChangeKind {
    pub const ALL: [ChangeKind; 3] = [ChangeKind::Create, ChangeKind::Update, ChangeKind::Delete];

    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Create => "INSERT",
            ChangeKind::Update => "UPDATE",
            ChangeKind::Delete => "DELETE",
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChangeKind {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "INSERT" | "CREATE" => Ok(ChangeKind::Create),
            "UPDATE" => Ok(ChangeKind::Update),
            "DELETE" => Ok(ChangeKind::Delete),
            other => Err(TransportError::UnknownChangeKind(other.to_string())),
        }
    }
}

/// A single committed change delivered by the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub resource: String,
    pub record: serde_json::Value,
    #[serde(default)]
    pub old_record: Option<serde_json::Value>,
    pub committed_at: SystemTime,
}

impl ChangeEvent {
    pub fn new(kind: ChangeKind, resource: impl Into<String>, record: serde_json::Value) -> Self {
        Self {
            kind,
            resource: resource.into(),
            record,
            old_record: None,
            committed_at: SystemTime::now(),
        }
    }

    pub fn with_old_record(mut self, old_record: serde_json::Value) -> Self {
        self.old_record = Some(old_record);
        self
    }
}

/// Lifecycle notifications a channel reports to its status observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelStatus {
    Established,
    Error(String),
    Timeout,
    Closed,
}

impl ChannelStatus {
    /// Statuses after which the channel can no longer serve consumers.
    pub fn is_failure(&self) -> bool {
        matches!(self, ChannelStatus::Error(_) | ChannelStatus::Timeout)
    }

    pub fn label(&self) -> &'static str {
        match self {
            ChannelStatus::Established => "established",
            ChannelStatus::Error(_) => "error",
            ChannelStatus::Timeout => "timeout",
            ChannelStatus::Closed => "closed",
        }
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("channel closed")]
    Closed,
    #[error("transport unavailable: {0}")]
    Unavailable(String),
    #[error("invalid filter expression: {0}")]
    InvalidFilter(String),
    #[error("unknown change kind: {0}")]
    UnknownChangeKind(String),
}

pub type TransportResult<T> = Result<T, TransportError>;

pub type ChangeHandler = Arc<dyn Fn(ChangeEvent) + Send + Sync>;
pub type StatusHandler = Arc<dyn Fn(ChannelStatus) + Send + Sync>;

/// One long-lived event stream opened for a connection group.
pub trait RealtimeChannel: Send + Sync {
    fn id(&self) -> u64;
    fn group(&self) -> &str;
    /// Forward `kind` changes on `resource` (optionally narrowed by a row filter) to `handler`.
    fn on_change(
        &self,
        kind: ChangeKind,
        resource: &str,
        filter: Option<&str>,
        handler: ChangeHandler,
    ) -> TransportResult<()>;
    fn on_status(&self, handler: StatusHandler);
    /// Idempotent. Observers see `Closed` exactly once.
    fn close(&self);
    fn is_closed(&self) -> bool;
}

pub trait RealtimeTransport: Send + Sync {
    fn open_channel(&self, group: &str) -> TransportResult<Arc<dyn RealtimeChannel>>;
}
