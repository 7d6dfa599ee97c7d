use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;

/// Data-access side of the safety checks: "is any write running right now?"
pub trait PendingWrites: Send + Sync {
    fn has_pending_writes(&self) -> bool;
}

/// Shared set of in-flight write operation ids. Non-empty means it is unsafe
/// to tear down realtime connections.
#[derive(Debug, Clone, Default)]
pub struct WriteTracker {
    ops: Arc<Mutex<HashSet<String>>>,
}

impl WriteTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if `op_id` was already active.
    pub fn mark_active(&self, op_id: &str) -> bool {
        self.ops.lock().insert(op_id.to_string())
    }

    /// Returns true when no writes remain afterwards.
    pub fn mark_complete(&self, op_id: &str) -> bool {
        let mut ops = self.ops.lock();
        ops.remove(op_id);
        ops.is_empty()
    }

    pub fn is_busy(&self) -> bool {
        !self.ops.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn active_ops(&self) -> Vec<String> {
        let mut ops: Vec<String> = self.ops.lock().iter().cloned().collect();
        ops.sort();
        ops
    }

    pub(crate) fn clear(&self) {
        self.ops.lock().clear();
    }
}

impl PendingWrites for WriteTracker {
    fn has_pending_writes(&self) -> bool {
        self.is_busy()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn busy_until_every_op_completes() {
        let tracker = WriteTracker::new();
        assert!(tracker.mark_active("save-workout"));
        assert!(tracker.mark_active("save-set"));
        assert!(!tracker.mark_active("save-set"));
        assert!(tracker.has_pending_writes());

        assert!(!tracker.mark_complete("save-workout"));
        assert!(tracker.is_busy());
        assert!(tracker.mark_complete("save-set"));
        assert!(!tracker.has_pending_writes());
    }

    #[test]
    fn completing_unknown_op_is_harmless() {
        let tracker = WriteTracker::new();
        tracker.mark_active("a");
        assert!(!tracker.mark_complete("b"));
        assert_eq!(tracker.active_ops(), vec!["a".to_string()]);
    }
}
