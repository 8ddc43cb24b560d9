//! Shutdown coordinator (C7): drains in-flight deletes before the engine's
//! home task is allowed to stop.
//!
//! Teardown is two phases (§4.7): quiesce (cancel everything, fire best-effort
//! deletes) and finalize (stop once every delete has completed). The quiesce
//! side lives in the installer/reconciler; this module only tracks the
//! delete-in-flight counter and wakes whoever is waiting on it to reach zero.

use tokio::sync::Notify;

/// Tracks how many `DeletePortMapping` RPCs are currently in flight as part of
/// teardown, and lets callers wait for that count to drain to zero.
#[derive(Debug, Default)]
pub struct ShutdownCoordinator {
    deleting_count: u32,
    drained: Notify,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin_delete(&mut self) {
        self.deleting_count += 1;
    }

    /// Call exactly once per `begin_delete`, regardless of the RPC's outcome.
    pub fn finish_delete(&mut self) {
        debug_assert!(self.deleting_count > 0);
        self.deleting_count = self.deleting_count.saturating_sub(1);
        if self.deleting_count == 0 {
            self.drained.notify_waiters();
        }
    }

    pub fn deleting_count(&self) -> u32 {
        self.deleting_count
    }

    pub fn is_drained(&self) -> bool {
        self.deleting_count == 0
    }

    /// Resolves once `deleting_count` reaches zero. Resolves immediately if it
    /// already is: callers must re-check `is_drained` before awaiting to avoid
    /// missing a notification that fired before the wait was registered.
    pub async fn wait_drained(&self) {
        if self.is_drained() {
            return;
        }
        self.drained.notified().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracks_in_flight_deletes() {
        let mut coordinator = ShutdownCoordinator::new();
        assert!(coordinator.is_drained());
        coordinator.begin_delete();
        coordinator.begin_delete();
        assert_eq!(coordinator.deleting_count(), 2);
        coordinator.finish_delete();
        assert!(!coordinator.is_drained());
        coordinator.finish_delete();
        assert!(coordinator.is_drained());
    }
}
