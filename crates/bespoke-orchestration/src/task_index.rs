//! Maps an in-flight task id back to the submission whose Orchestrator
//! dispatched it, so the Coordinator's single completion-dispatch loop
//! (fed by the one `mpsc::Receiver<TaskCompletion>` every worker pool
//! shares) can route a `TaskCompletion` to the right actor without every
//! Orchestrator polling a shared channel itself.

use std::collections::HashMap;

use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Default)]
pub struct TaskIndex {
    owners: Mutex<HashMap<Uuid, u64>>,
}

impl TaskIndex {
    pub fn new() -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self::default())
    }

    pub async fn register(&self, task_id: Uuid, submission_id: u64) {
        self.owners.lock().await.insert(task_id, submission_id);
    }

    pub async fn owner_of(&self, task_id: Uuid) -> Option<u64> {
        self.owners.lock().await.get(&task_id).copied()
    }

    pub async fn forget(&self, task_id: Uuid) {
        self.owners.lock().await.remove(&task_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn register_then_lookup_then_forget() {
        let index = TaskIndex::new();
        let task_id = Uuid::now_v7();
        index.register(task_id, 7).await;
        assert_eq!(index.owner_of(task_id).await, Some(7));
        index.forget(task_id).await;
        assert_eq!(index.owner_of(task_id).await, None);
    }
}
