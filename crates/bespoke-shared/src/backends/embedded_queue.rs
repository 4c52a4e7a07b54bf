//! `EmbeddedQueue` — the single-host default Task Queue backend (§4.5): an
//! in-process FIFO-per-routing-key queue whose items are also durably
//! recorded in the Result Store (`queue/<routing-key>/<seq>`, §6.3) so that a
//! restarted process can rebuild its ready queues before any Coordinator
//! traffic arrives.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::domain::RoutingKey;
use crate::error::{ExecutorError, ExecutorResult};
use crate::queue::{QueueItem, TaskQueue};
use crate::store::ResultStore;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct QueueRecord {
    seq: u64,
    task_id: Uuid,
    routing_key: RoutingKey,
    payload: serde_json::Value,
    attempt_count: u32,
}

impl QueueRecord {
    fn store_key(&self) -> String {
        format!("queue/{}/{:020}", self.routing_key.as_str(), self.seq)
    }

    fn into_item(self) -> QueueItem {
        QueueItem {
            handle: self.seq.to_string(),
            task_id: self.task_id,
            routing_key: self.routing_key,
            payload: self.payload,
            attempt_count: self.attempt_count,
        }
    }
}

struct InFlight {
    record: QueueRecord,
    deadline: Instant,
}

#[derive(Default)]
struct PerKeyState {
    ready: VecDeque<QueueRecord>,
    in_flight: HashMap<String, InFlight>,
}

pub struct EmbeddedQueue {
    store: Arc<dyn ResultStore>,
    state: Mutex<HashMap<RoutingKey, PerKeyState>>,
}

impl EmbeddedQueue {
    /// Rebuild in-memory ready queues from durably persisted records,
    /// restoring FIFO order from the zero-padded sequence in each key
    /// (§4.5 "enqueue is durable").
    pub async fn restore(store: Arc<dyn ResultStore>) -> ExecutorResult<Self> {
        let mut state: HashMap<RoutingKey, PerKeyState> = HashMap::new();
        for key in RoutingKey::ALL {
            state.insert(key, PerKeyState::default());
        }

        let keys = store.scan_prefix("queue/").await?;
        let mut records = Vec::new();
        for key in keys {
            if let Some(bytes) = store.get(&key).await? {
                if let Ok(record) = serde_json::from_slice::<QueueRecord>(&bytes) {
                    records.push(record);
                }
            }
        }
        records.sort_by_key(|r| r.seq);
        for record in records {
            state.entry(record.routing_key).or_default().ready.push_back(record);
        }

        Ok(Self {
            store,
            state: Mutex::new(state),
        })
    }

    /// Move any in-flight item whose visibility deadline has passed back to
    /// the front of its ready queue, attempt count unchanged (redelivery,
    /// §7 "worker-crashed ... automatically retried").
    fn reap_expired(per_key: &mut PerKeyState) {
        let now = Instant::now();
        let expired: Vec<String> = per_key
            .in_flight
            .iter()
            .filter(|(_, v)| v.deadline <= now)
            .map(|(k, _)| k.clone())
            .collect();
        for handle in expired {
            if let Some(in_flight) = per_key.in_flight.remove(&handle) {
                per_key.ready.push_front(in_flight.record);
            }
        }
    }
}

#[async_trait]
impl TaskQueue for EmbeddedQueue {
    async fn enqueue(
        &self,
        routing_key: RoutingKey,
        task_id: Uuid,
        payload: serde_json::Value,
    ) -> ExecutorResult<()> {
        let seq = self.store.next_sequence(&format!("queue_{}", routing_key.as_str())).await?;
        let record = QueueRecord {
            seq,
            task_id,
            routing_key,
            payload,
            attempt_count: 0,
        };
        let bytes = serde_json::to_vec(&record).map_err(|e| ExecutorError::internal(e))?;
        self.store.put(&record.store_key(), &bytes).await?;

        let mut state = self.state.lock().await;
        state.entry(routing_key).or_default().ready.push_back(record);
        Ok(())
    }

    async fn claim(
        &self,
        routing_key: RoutingKey,
        visibility_timeout_secs: u64,
        limit: usize,
    ) -> ExecutorResult<Vec<QueueItem>> {
        let mut state = self.state.lock().await;
        let per_key = state.entry(routing_key).or_default();
        Self::reap_expired(per_key);

        let deadline = Instant::now() + Duration::from_secs(visibility_timeout_secs);
        let mut claimed = Vec::with_capacity(limit);
        while claimed.len() < limit {
            let Some(record) = per_key.ready.pop_front() else {
                break;
            };
            let handle = record.seq.to_string();
            per_key.in_flight.insert(
                handle,
                InFlight {
                    record: record.clone(),
                    deadline,
                },
            );
            claimed.push(record.into_item());
        }
        Ok(claimed)
    }

    async fn ack(&self, item: &QueueItem) -> ExecutorResult<()> {
        let mut state = self.state.lock().await;
        let per_key = state.entry(item.routing_key).or_default();
        if let Some(in_flight) = per_key.in_flight.remove(&item.handle) {
            self.store.delete(&in_flight.record.store_key()).await?;
        }
        Ok(())
    }

    async fn nack(&self, item: &QueueItem) -> ExecutorResult<()> {
        let mut state = self.state.lock().await;
        let per_key = state.entry(item.routing_key).or_default();
        if let Some(mut in_flight) = per_key.in_flight.remove(&item.handle) {
            in_flight.record.attempt_count += 1;
            let bytes = serde_json::to_vec(&in_flight.record).map_err(|e| ExecutorError::internal(e))?;
            self.store.put(&in_flight.record.store_key(), &bytes).await?;
            per_key.ready.push_front(in_flight.record);
        }
        Ok(())
    }

    async fn extend_visibility(&self, item: &QueueItem, additional_secs: u64) -> ExecutorResult<()> {
        let mut state = self.state.lock().await;
        let per_key = state.entry(item.routing_key).or_default();
        if let Some(in_flight) = per_key.in_flight.get_mut(&item.handle) {
            in_flight.deadline += Duration::from_secs(additional_secs);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::file_store::FileResultStore;
    use serde_json::json;

    async fn queue() -> (EmbeddedQueue, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn ResultStore> = Arc::new(FileResultStore::open(dir.path()).await.unwrap());
        (EmbeddedQueue::restore(store).await.unwrap(), dir)
    }

    #[tokio::test]
    async fn fifo_within_a_routing_key() {
        let (queue, _dir) = queue().await;
        let t1 = Uuid::now_v7();
        let t2 = Uuid::now_v7();
        queue.enqueue(RoutingKey::Qc, t1, json!({"n": 1})).await.unwrap();
        queue.enqueue(RoutingKey::Qc, t2, json!({"n": 2})).await.unwrap();

        let claimed = queue.claim(RoutingKey::Qc, 30, 10).await.unwrap();
        assert_eq!(claimed.len(), 2);
        assert_eq!(claimed[0].task_id, t1);
        assert_eq!(claimed[1].task_id, t2);
    }

    #[tokio::test]
    async fn ack_removes_item_permanently() {
        let (queue, _dir) = queue().await;
        let t1 = Uuid::now_v7();
        queue.enqueue(RoutingKey::Fragment, t1, json!({})).await.unwrap();
        let claimed = queue.claim(RoutingKey::Fragment, 30, 1).await.unwrap();
        queue.ack(&claimed[0]).await.unwrap();
        let reclaimed = queue.claim(RoutingKey::Fragment, 30, 1).await.unwrap();
        assert!(reclaimed.is_empty());
    }

    #[tokio::test]
    async fn nack_requeues_with_incremented_attempt_count() {
        let (queue, _dir) = queue().await;
        let t1 = Uuid::now_v7();
        queue.enqueue(RoutingKey::Optimize, t1, json!({})).await.unwrap();
        let claimed = queue.claim(RoutingKey::Optimize, 30, 1).await.unwrap();
        assert_eq!(claimed[0].attempt_count, 0);
        queue.nack(&claimed[0]).await.unwrap();

        let reclaimed = queue.claim(RoutingKey::Optimize, 30, 1).await.unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].attempt_count, 1);
    }

    #[tokio::test]
    async fn expired_visibility_is_redelivered() {
        let (queue, _dir) = queue().await;
        let t1 = Uuid::now_v7();
        queue.enqueue(RoutingKey::Qc, t1, json!({})).await.unwrap();
        let claimed = queue.claim(RoutingKey::Qc, 0, 1).await.unwrap();
        assert_eq!(claimed.len(), 1);

        tokio::time::sleep(Duration::from_millis(5)).await;
        let redelivered = queue.claim(RoutingKey::Qc, 30, 1).await.unwrap();
        assert_eq!(redelivered.len(), 1);
        assert_eq!(redelivered[0].task_id, t1);
    }

    #[tokio::test]
    async fn restore_reloads_pending_items_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn ResultStore> = Arc::new(FileResultStore::open(dir.path()).await.unwrap());
        let t1 = Uuid::now_v7();
        let t2 = Uuid::now_v7();
        {
            let queue = EmbeddedQueue::restore(store.clone()).await.unwrap();
            queue.enqueue(RoutingKey::Qc, t1, json!({"n": 1})).await.unwrap();
            queue.enqueue(RoutingKey::Qc, t2, json!({"n": 2})).await.unwrap();
        }

        let reopened = EmbeddedQueue::restore(store).await.unwrap();
        let claimed = reopened.claim(RoutingKey::Qc, 30, 10).await.unwrap();
        assert_eq!(claimed.len(), 2);
        assert_eq!(claimed[0].task_id, t1);
        assert_eq!(claimed[1].task_id, t2);
    }
}
