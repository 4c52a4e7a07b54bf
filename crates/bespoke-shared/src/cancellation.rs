//! A task-id-keyed cancellation flag shared between the Stage Orchestrator
//! (which sets it on `DELETE /submissions/{id}`) and Worker Pools (which
//! poll it between subprocess chunks, §4.4 "Cancellation", §5).

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::{Mutex, Notify};
use uuid::Uuid;

#[derive(Default)]
pub struct CancellationRegistry {
    cancelled: Mutex<HashSet<Uuid>>,
    notify: Notify,
}

impl CancellationRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn cancel(&self, task_id: Uuid) {
        self.cancelled.lock().await.insert(task_id);
        self.notify.notify_waiters();
    }

    pub async fn is_cancelled(&self, task_id: Uuid) -> bool {
        self.cancelled.lock().await.contains(&task_id)
    }

    pub async fn clear(&self, task_id: Uuid) {
        self.cancelled.lock().await.remove(&task_id);
    }

    /// Resolves the next time any task is cancelled, so a poller can
    /// `tokio::select!` against it instead of busy-polling.
    pub async fn wait_for_any_change(&self) {
        self.notify.notified().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cancel_then_is_cancelled() {
        let registry = CancellationRegistry::new();
        let id = Uuid::now_v7();
        assert!(!registry.is_cancelled(id).await);
        registry.cancel(id).await;
        assert!(registry.is_cancelled(id).await);
    }

    #[tokio::test]
    async fn clear_removes_cancellation() {
        let registry = CancellationRegistry::new();
        let id = Uuid::now_v7();
        registry.cancel(id).await;
        registry.clear(id).await;
        assert!(!registry.is_cancelled(id).await);
    }
}
