//! Worker pool
//!
//! Owns a fixed-size pool of engine workers, hands them out round-robin,
//! and replaces any worker that dies. Replacement runs on a single
//! supervisor task fed by a deaths channel; the per-worker notifier only
//! drops the dead worker from rotation so selection never sees it.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::{RwLock, mpsc};

use crate::engine::{MediaEngine, WorkerHandle, wait_closed};
use crate::error::{MediaError, Result};

/// Bounded exponential backoff for worker spawns.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

pub struct WorkerPool {
    engine: Arc<dyn MediaEngine>,
    retry: RetryPolicy,
    pool_size: usize,
    workers: RwLock<Vec<Arc<dyn WorkerHandle>>>,
    next: AtomicUsize,
    deaths_tx: mpsc::UnboundedSender<uuid::Uuid>,
}

impl WorkerPool {
    pub fn new(engine: Arc<dyn MediaEngine>, pool_size: usize, retry: RetryPolicy) -> Arc<Self> {
        let (deaths_tx, deaths_rx) = mpsc::unbounded_channel();
        let pool = Arc::new(Self {
            engine,
            retry,
            pool_size: pool_size.max(1),
            workers: RwLock::new(Vec::new()),
            next: AtomicUsize::new(0),
            deaths_tx,
        });
        tokio::spawn(supervise(Arc::downgrade(&pool), deaths_rx));
        pool
    }

    /// Spawn the initial pool. Fails if any worker cannot be spawned
    /// within the retry budget.
    pub async fn initialize(self: &Arc<Self>) -> Result<()> {
        for _ in 0..self.pool_size {
            let worker = self.spawn_with_retry().await?;
            self.register(worker).await;
        }
        tracing::info!("Media worker pool ready with {} workers", self.pool_size);
        Ok(())
    }

    /// Next live worker, round-robin. Dead workers are skipped even if
    /// their removal has not landed yet.
    pub async fn get_worker(&self) -> Result<Arc<dyn WorkerHandle>> {
        let workers = self.workers.read().await;
        let live: Vec<_> = workers
            .iter()
            .filter(|w| !w.liveness().is_dead())
            .cloned()
            .collect();
        if live.is_empty() {
            return Err(MediaError::NoWorkersAvailable);
        }
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % live.len();
        Ok(live[idx].clone())
    }

    pub async fn live_worker_count(&self) -> usize {
        self.workers
            .read()
            .await
            .iter()
            .filter(|w| !w.liveness().is_dead())
            .count()
    }

    async fn spawn_with_retry(&self) -> Result<Arc<dyn WorkerHandle>> {
        let mut delay = self.retry.base_delay;
        let mut last_err = None;
        for attempt in 1..=self.retry.attempts {
            match self.engine.create_worker().await {
                Ok(worker) => return Ok(worker),
                Err(err) => {
                    tracing::warn!(
                        "Worker spawn attempt {attempt}/{} failed: {err}",
                        self.retry.attempts
                    );
                    last_err = Some(err);
                    if attempt < self.retry.attempts {
                        tokio::time::sleep(delay).await;
                        delay *= 2;
                    }
                }
            }
        }
        Err(MediaError::Engine(last_err.ok_or(MediaError::NoWorkersAvailable)?))
    }

    async fn register(self: &Arc<Self>, worker: Arc<dyn WorkerHandle>) {
        let worker_id = worker.id();
        let died = worker.on_died();
        self.workers.write().await.push(worker);

        let weak = Arc::downgrade(self);
        let deaths_tx = self.deaths_tx.clone();
        tokio::spawn(async move {
            wait_closed(died).await;
            tracing::warn!("Media worker {worker_id} died");
            if let Some(pool) = weak.upgrade() {
                pool.remove(worker_id).await;
                let _ = deaths_tx.send(worker_id);
            }
        });
    }

    async fn remove(&self, worker_id: uuid::Uuid) {
        self.workers.write().await.retain(|w| w.id() != worker_id);
    }
}

async fn supervise(
    pool: std::sync::Weak<WorkerPool>,
    mut deaths_rx: mpsc::UnboundedReceiver<uuid::Uuid>,
) {
    while let Some(worker_id) = deaths_rx.recv().await {
        let Some(pool) = pool.upgrade() else {
            return;
        };
        tracing::info!("Replacing dead media worker {worker_id}");
        match pool.spawn_with_retry().await {
            Ok(worker) => pool.register(worker).await,
            Err(err) => {
                tracing::error!("Could not replace media worker {worker_id}: {err}");
            }
        }
    }
}
