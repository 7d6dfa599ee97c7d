use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Lifecycle signals emitted by the page or process hosting the hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostEvent {
    Hidden,
    Visible,
    Unload,
}

pub trait HostLifecycle: Send + Sync {
    /// Whether the host currently has input focus, independent of visibility.
    fn has_focus(&self) -> bool;
}

/// Host state that can be flipped by whoever drives the hub.
#[derive(Debug, Clone, Default)]
pub struct HostSignals {
    focused: Arc<AtomicBool>,
}

impl HostSignals {
    pub fn new(focused: bool) -> Self {
        Self {
            focused: Arc::new(AtomicBool::new(focused)),
        }
    }

    pub fn set_focus(&self, focused: bool) {
        self.focused.store(focused, Ordering::SeqCst);
    }
}

impl HostLifecycle for HostSignals {
    fn has_focus(&self) -> bool {
        self.focused.load(Ordering::SeqCst)
    }
}
