use super::OperationProcessor;
use crate::operation::{ErrorSeverity, Operation};
use crate::operations_manager::{OperationsManager, OperationsManagerError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const ON_DEMAND_CHANNEL_CAPACITY: usize = 100;

#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    pub parallel_processors: usize,
    /// How long an idle worker waits before polling again.
    pub quiet_period: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            parallel_processors: 5,
            quiet_period: Duration::from_secs(5),
        }
    }
}

/// Wakes an idle worker when new work was just scheduled.
#[derive(Clone)]
pub struct OnDemandSignal {
    tx: mpsc::Sender<String>,
}

impl OnDemandSignal {
    /// Never blocks. A full channel drops the signal since workers poll anyway.
    pub fn notify(&self, operation_id: &str) {
        match self.tx.try_send(operation_id.to_string()) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!(
                    "On-demand channel full, operation {} will be picked up by polling",
                    operation_id
                );
            }
            Err(TrySendError::Closed(_)) => {
                debug!("On-demand channel closed, dropping signal for {}", operation_id);
            }
        }
    }
}

pub struct WorkerPool {
    manager: Arc<OperationsManager>,
    processor: Arc<dyn OperationProcessor>,
    config: WorkerPoolConfig,
    signals: Mutex<mpsc::Receiver<String>>,
}

impl WorkerPool {
    pub fn new(
        manager: Arc<OperationsManager>,
        processor: Arc<dyn OperationProcessor>,
        config: WorkerPoolConfig,
    ) -> (Arc<Self>, OnDemandSignal) {
        let (tx, rx) = mpsc::channel(ON_DEMAND_CHANNEL_CAPACITY);
        let pool = Arc::new(Self {
            manager,
            processor,
            config,
            signals: Mutex::new(rx),
        });
        (pool, OnDemandSignal { tx })
    }

    /// Run all workers until `shutdown` fires. An operation being processed
    /// when shutdown fires is finished first.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(
            "Starting {} operation workers",
            self.config.parallel_processors
        );
        let workers = (0..self.config.parallel_processors).map(|worker_id| {
            let pool = self.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { pool.worker_loop(worker_id, shutdown).await })
        });
        for result in futures::future::join_all(workers).await {
            if let Err(e) = result {
                error!("Operation worker panicked: {}", e);
            }
        }
        info!("Operation workers stopped");
    }

    async fn worker_loop(&self, worker_id: usize, shutdown: CancellationToken) {
        while !shutdown.is_cancelled() {
            self.drain_signals();

            match self.with_manager(|manager| manager.get_operation()).await {
                Ok(operation) => self.handle(worker_id, operation).await,
                Err(e) if e.is_no_scheduled_operations() => {
                    self.wait_for_work(&shutdown).await;
                }
                Err(e) => {
                    error!("Worker {} failed to claim an operation: {}", worker_id, e);
                    tokio::select! {
                        _ = shutdown.cancelled() => {}
                        _ = tokio::time::sleep(self.config.quiet_period) => {}
                    }
                }
            }
        }
        debug!("Worker {} stopped", worker_id);
    }

    /// Runs a manager call on the blocking pool; every call is a SQLite
    /// transaction.
    async fn with_manager<T, F>(&self, f: F) -> Result<T, OperationsManagerError>
    where
        F: FnOnce(&OperationsManager) -> Result<T, OperationsManagerError> + Send + 'static,
        T: Send + 'static,
    {
        let manager = self.manager.clone();
        tokio::task::spawn_blocking(move || f(&manager))
            .await
            .map_err(|e| {
                OperationsManagerError::Transaction(
                    anyhow::Error::new(e).context("operations manager task failed"),
                )
            })?
    }

    /// Signals queued before a claim are satisfied by that claim.
    fn drain_signals(&self) {
        if let Ok(mut signals) = self.signals.try_lock() {
            while signals.try_recv().is_ok() {}
        }
    }

    async fn wait_for_work(&self, shutdown: &CancellationToken) {
        tokio::select! {
            _ = shutdown.cancelled() => {}
            _ = tokio::time::sleep(self.config.quiet_period) => {}
            signal = async { self.signals.lock().await.recv().await } => {
                match signal {
                    Some(id) => debug!("Woken up for operation {}", id),
                    // Every sender is gone; only polling is left.
                    None => tokio::select! {
                        _ = shutdown.cancelled() => {}
                        _ = tokio::time::sleep(self.config.quiet_period) => {}
                    },
                }
            }
        }
    }

    async fn handle(&self, worker_id: usize, operation: Operation) {
        debug!("Worker {} processing operation {}", worker_id, operation.id);
        let id = operation.id.clone();
        let result = match self.processor.process(&operation).await {
            Ok(None) => {
                self.with_manager(move |manager| manager.mark_operation_completed(&id))
                    .await
            }
            Ok(Some(message)) => {
                self.with_manager(move |manager| {
                    manager.mark_operation_completed_with_message(
                        &id,
                        &message,
                        ErrorSeverity::Warning,
                    )
                })
                .await
            }
            Err(e) => {
                warn!("Operation {} failed: {:#}", operation.id, e);
                let message = format!("{:#}", e);
                self.with_manager(move |manager| manager.mark_operation_failed(&id, &message))
                    .await
            }
        };
        if let Err(e) = result {
            error!(
                "Worker {} could not record the result of operation {}: {}",
                worker_id, operation.id, e
            );
        }
    }
}
