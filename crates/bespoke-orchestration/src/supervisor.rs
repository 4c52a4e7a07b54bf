//! Supervisor (§4.7): brings up the Result Store, Task Queue, Coordinator,
//! then the three worker pools, in that order; tears them down in reverse
//! with a graceful drain grace period. Shutdown is idempotent.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bespoke_cache::{spawn_lease_reaper, CacheManager, InMemoryCacheManager};
use bespoke_shared::backends::{EmbeddedQueue, FileResultStore};
use bespoke_shared::config::{ExecutorConfig, ResourceBudget};
use bespoke_shared::domain::RoutingKey;
use bespoke_shared::error::{ExecutorError, ExecutorResult};
use bespoke_shared::queue::TaskQueue;
use bespoke_shared::store::ResultStore;
use bespoke_worker::{EchoExecutor, StageExecutor, SubprocessExecutor, WorkerContext, WorkerPoolConfig};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::coordinator::{run_completion_dispatcher, Coordinator};
use crate::http;

pub struct Supervisor {
    config: ExecutorConfig,
    coordinator: Arc<Coordinator>,
    server: Option<(JoinHandle<()>, oneshot::Sender<()>)>,
    dispatcher: Option<JoinHandle<()>>,
    lease_reaper: Option<JoinHandle<()>>,
    workers: Vec<JoinHandle<()>>,
    worker_shutdown: watch::Sender<bool>,
    stopped: AtomicBool,
}

/// Picks an executor for a routing key: a configured external command if
/// one is set (`BESPOKE_{FRAGMENTER,QC,OPTIMIZER}_CMD`, §1 "externally
/// pluggable executors"), otherwise the deterministic `EchoExecutor` so
/// the pipeline runs without any scientific binaries installed (§4.4).
fn executor_for(routing_key: RoutingKey) -> Arc<dyn StageExecutor> {
    let env_key = match routing_key {
        RoutingKey::Fragment => "BESPOKE_FRAGMENTER_CMD",
        RoutingKey::Qc => "BESPOKE_QC_CMD",
        RoutingKey::Optimize => "BESPOKE_OPTIMIZER_CMD",
    };
    match std::env::var(env_key) {
        Ok(command_line) if !command_line.trim().is_empty() => {
            let mut parts = command_line.split_whitespace();
            let program = parts.next().unwrap_or_default().to_string();
            let args = parts.map(str::to_string).collect();
            Arc::new(SubprocessExecutor::new(program, args))
        }
        _ => Arc::new(EchoExecutor::new(routing_key.as_str())),
    }
}

fn budget_for(routing_key: RoutingKey, config: &ExecutorConfig) -> ResourceBudget {
    match routing_key {
        RoutingKey::Fragment => config.fragment_core_budget,
        RoutingKey::Qc => config.qc_core_budget,
        RoutingKey::Optimize => config.optimize_core_budget,
    }
}

fn worker_count_for(routing_key: RoutingKey, config: &ExecutorConfig) -> usize {
    match routing_key {
        RoutingKey::Fragment => config.worker_counts.fragment_workers,
        RoutingKey::Qc => config.worker_counts.qc_workers,
        RoutingKey::Optimize => config.worker_counts.optimize_workers,
    }
}

fn retry_limit_for(routing_key: RoutingKey, config: &ExecutorConfig) -> u32 {
    match routing_key {
        RoutingKey::Fragment => config.retry_limits.fragment,
        RoutingKey::Qc => config.retry_limits.qc,
        RoutingKey::Optimize => config.retry_limits.optimize,
    }
}

impl Supervisor {
    pub async fn bootstrap(config: ExecutorConfig) -> ExecutorResult<Self> {
        // A `postgres://` queue backend URL shares its connection pool with
        // the Result Store (§4.6) rather than standing up a second storage
        // system next to the one already required for `PgmqQueue`.
        let store: Arc<dyn ResultStore>;
        let queue: Arc<dyn TaskQueue>;

        if config.queue_backend_url.starts_with("postgres://") {
            let pool = sqlx::PgPool::connect(&config.queue_backend_url)
                .await
                .map_err(ExecutorError::internal)?;
            store = Arc::new(bespoke_pgmq::PostgresResultStore::new_with_pool(pool.clone()).await?);
            let client = bespoke_pgmq::PgmqClient::new_with_pool(pool).await;
            queue = Arc::new(bespoke_pgmq::PgmqQueue::new(client).await?);
        } else {
            let file_store = Arc::new(FileResultStore::open(config.result_store_dir.clone()).await?);
            queue = Arc::new(EmbeddedQueue::restore(file_store.clone()).await?);
            store = file_store;
        };

        let cache = Arc::new(InMemoryCacheManager::new());
        let lease_reaper = spawn_lease_reaper(cache.clone(), config.lease_ttl / 3);
        let cache: Arc<dyn CacheManager> = cache;

        let coordinator = Coordinator::new(store.clone(), queue.clone(), cache.clone(), config.clone());
        let resumed = coordinator.resume_at_boot().await?;
        tracing::info!(resumed, "resumed non-terminal submissions from the result store");

        let (completion_tx, completion_rx) = mpsc::channel(1024);
        let dispatcher = tokio::spawn(run_completion_dispatcher(coordinator.clone(), completion_rx));

        let (worker_shutdown, worker_shutdown_rx) = watch::channel(false);
        let mut workers = Vec::new();
        for routing_key in RoutingKey::ALL {
            let ctx = Arc::new(WorkerContext {
                queue: queue.clone(),
                cache: cache.clone(),
                store: store.clone(),
                cancellation: coordinator.cancellation(),
                completions: completion_tx.clone(),
            });
            let pool_config = Arc::new(WorkerPoolConfig::new(
                routing_key,
                worker_count_for(routing_key, &config),
                budget_for(routing_key, &config),
                retry_limit_for(routing_key, &config),
                config.lease_ttl,
            ));
            let executor = executor_for(routing_key);
            workers.extend(bespoke_worker::pool::spawn(ctx, pool_config, executor, worker_shutdown_rx.clone()));
        }
        drop(completion_tx);

        let router = http::router(coordinator.clone());
        let listener = TcpListener::bind(&config.bind_address)
            .await
            .map_err(ExecutorError::internal)?;
        let (http_shutdown_tx, http_shutdown_rx) = oneshot::channel();
        let server = tokio::spawn(async move {
            let shutdown = async {
                let _ = http_shutdown_rx.await;
            };
            if let Err(e) = axum::serve(listener, router).with_graceful_shutdown(shutdown).await {
                tracing::error!(error = %e, "http server exited with error");
            }
        });

        Ok(Self {
            config,
            coordinator,
            server: Some((server, http_shutdown_tx)),
            dispatcher: Some(dispatcher),
            lease_reaper: Some(lease_reaper),
            workers,
            worker_shutdown,
            stopped: AtomicBool::new(false),
        })
    }

    pub fn coordinator(&self) -> Arc<Coordinator> {
        self.coordinator.clone()
    }

    /// Idempotent: a second call is a no-op (§4.7).
    pub async fn stop(&mut self) -> ExecutorResult<()> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        if let Some((server, shutdown_tx)) = self.server.take() {
            let _ = shutdown_tx.send(());
            let _ = tokio::time::timeout(self.config.shutdown_grace, server).await;
        }

        let _ = self.worker_shutdown.send(true);

        let grace = self.config.shutdown_grace;
        let workers = std::mem::take(&mut self.workers);
        let drained = tokio::time::timeout(grace, futures::future::join_all(workers)).await;
        if drained.is_err() {
            tracing::warn!("workers did not drain within the shutdown grace period, abandoning remaining tasks");
        }

        if let Some(handle) = self.dispatcher.take() {
            handle.abort();
        }
        if let Some(handle) = self.lease_reaper.take() {
            handle.abort();
        }

        Ok(())
    }
}
