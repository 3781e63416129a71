//! Operations manager: claims, lifecycle transitions and maintenance jobs
//! for the operations of a single type.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::clock::{system_clock, Clock};
use crate::cronjob::{run_cron_job, CronJob, ElectionConfig};
use crate::lease::LeaseCoordinator;
use crate::operation::*;
use crate::server::metrics;

use super::config::OperationsManagerConfig;
use super::error::OperationsManagerError;

type ManagerResult<T> = Result<T, OperationsManagerError>;

pub struct OperationsManager {
    op_type: OperationType,
    store: Arc<dyn OperationStore>,
    config: OperationsManagerConfig,
    election: ElectionConfig,
    coordinator: Option<Arc<dyn LeaseCoordinator>>,
    clock: Clock,
    /// Serializes claims issued by this process.
    claim_lock: Mutex<()>,
    reschedule_job_started: AtomicBool,
    reschedule_hanged_job_started: AtomicBool,
    delete_old_job_started: AtomicBool,
}

impl OperationsManager {
    /// Manager with election disabled and the system clock.
    pub fn new(
        op_type: OperationType,
        store: Arc<dyn OperationStore>,
        config: OperationsManagerConfig,
    ) -> Self {
        Self {
            op_type,
            store,
            config,
            election: ElectionConfig {
                enabled: false,
                ..Default::default()
            },
            coordinator: None,
            clock: system_clock(),
            claim_lock: Mutex::new(()),
            reschedule_job_started: AtomicBool::new(false),
            reschedule_hanged_job_started: AtomicBool::new(false),
            delete_old_job_started: AtomicBool::new(false),
        }
    }

    pub fn with_election(
        mut self,
        election: ElectionConfig,
        coordinator: Option<Arc<dyn LeaseCoordinator>>,
    ) -> Self {
        self.election = election;
        self.coordinator = coordinator;
        self
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn op_type(&self) -> OperationType {
        self.op_type
    }

    pub fn config(&self) -> &OperationsManagerConfig {
        &self.config
    }

    fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    fn begin(&self) -> ManagerResult<Box<dyn OperationTx + '_>> {
        self.store.begin().map_err(OperationsManagerError::Transaction)
    }

    // === Lifecycle ===

    /// Persist a new SCHEDULED operation and return its ID.
    pub fn create_operation(&self, input: OperationInput) -> ManagerResult<String> {
        let operation = Operation::new(input.op_type, input.priority, input.data, self.now());
        let tx = self.begin()?;
        tx.create(&operation)
            .map_err(OperationsManagerError::store(&operation.id, "creating"))?;
        tx.commit().map_err(OperationsManagerError::Transaction)?;

        metrics::record_transition(operation.op_type.as_str(), "created");
        debug!(
            "Created operation {} of type {}",
            operation.id,
            operation.op_type.as_str()
        );
        Ok(operation.id)
    }

    /// Claim the next operation of this manager's type.
    ///
    /// Candidates are read from the priority view, then each one is locked
    /// in its own transaction until one is won. Workers racing on the same
    /// rows see `NoScheduledOperations` once every candidate is taken.
    pub fn get_operation(&self) -> ManagerResult<Operation> {
        let _guard = self.claim_lock.lock().map_err(|_| {
            OperationsManagerError::Transaction(anyhow::anyhow!("claim lock poisoned"))
        })?;
        let op_type = self.op_type.as_str();

        let candidates = {
            let tx = self.begin()?;
            let candidates = tx
                .list_priority_queue(self.op_type, self.config.priority_queue_limit)
                .map_err(OperationsManagerError::store(op_type, "listing scheduled"))?;
            tx.commit().map_err(OperationsManagerError::Transaction)?;
            candidates
        };

        for candidate in candidates {
            match self.try_claim(&candidate.id) {
                Ok(Some(operation)) => {
                    metrics::record_claim(op_type, "claimed");
                    return Ok(operation);
                }
                Ok(None) => continue,
                Err(e) => {
                    metrics::record_claim(op_type, "error");
                    return Err(e);
                }
            }
        }

        metrics::record_claim(op_type, "empty");
        Err(OperationsManagerError::NoScheduledOperations)
    }

    fn try_claim(&self, id: &str) -> ManagerResult<Option<Operation>> {
        let tx = self.begin()?;

        let locked = tx
            .lock_operation(id)
            .map_err(OperationsManagerError::store(id, "locking"))?;
        if !locked {
            debug!("Operation {} was claimed elsewhere, trying next candidate", id);
            tx.commit().map_err(OperationsManagerError::Transaction)?;
            return Ok(None);
        }

        let mut operation = match tx
            .get(id)
            .map_err(OperationsManagerError::store(id, "getting"))?
        {
            Some(operation) if operation.status == OperationStatus::Scheduled => operation,
            _ => {
                tx.commit().map_err(OperationsManagerError::Transaction)?;
                return Ok(None);
            }
        };

        operation.status = OperationStatus::InProgress;
        operation.updated_at = self.now();
        tx.update(&operation)
            .map_err(OperationsManagerError::store(id, "claiming"))?;
        tx.commit().map_err(OperationsManagerError::Transaction)?;
        Ok(Some(operation))
    }

    /// Look up an operation of this manager's type by its exact data.
    pub fn find_operation_by_data(&self, data: &OperationData) -> ManagerResult<Operation> {
        let tx = self.begin()?;
        let operation = tx
            .get_by_data_and_type(data, self.op_type)
            .map_err(OperationsManagerError::store(data.as_str(), "finding by data"))?;
        tx.commit().map_err(OperationsManagerError::Transaction)?;

        operation.ok_or_else(|| OperationsManagerError::NotFound {
            key: data.as_str().to_string(),
        })
    }

    pub fn mark_operation_completed(&self, id: &str) -> ManagerResult<()> {
        self.finish(id, OperationStatus::Completed, None, ErrorSeverity::None)
    }

    /// Complete an operation while keeping a non-fatal message on it.
    pub fn mark_operation_completed_with_message(
        &self,
        id: &str,
        message: &str,
        severity: ErrorSeverity,
    ) -> ManagerResult<()> {
        self.finish(
            id,
            OperationStatus::Completed,
            Some(OperationErrorPayload::new(message)),
            severity,
        )
    }

    pub fn mark_operation_failed(&self, id: &str, error_message: &str) -> ManagerResult<()> {
        self.finish(
            id,
            OperationStatus::Failed,
            Some(OperationErrorPayload::new(error_message)),
            ErrorSeverity::Error,
        )
    }

    fn finish(
        &self,
        id: &str,
        status: OperationStatus,
        error: Option<OperationErrorPayload>,
        severity: ErrorSeverity,
    ) -> ManagerResult<()> {
        let tx = self.begin()?;
        let mut operation = tx
            .get(id)
            .map_err(OperationsManagerError::store(id, "getting"))?
            .ok_or_else(|| OperationsManagerError::NotFound { key: id.to_string() })?;

        if operation.status != OperationStatus::InProgress {
            warn!(
                "Finishing operation {} which is {} instead of IN_PROGRESS",
                id,
                operation.status.as_db_str()
            );
        }

        operation.finish(status, error, severity, self.now());
        tx.update(&operation)
            .map_err(OperationsManagerError::store(id, "updating"))?;
        tx.commit().map_err(OperationsManagerError::Transaction)?;

        metrics::record_transition(operation.op_type.as_str(), status.as_db_str());
        Ok(())
    }

    /// Bump an operation to high priority so it is served next.
    ///
    /// Finished operations are also put back to SCHEDULED. Operations that
    /// are SCHEDULED or IN_PROGRESS keep their status.
    pub fn reschedule_operation(&self, id: &str) -> ManagerResult<()> {
        let tx = self.begin()?;
        let mut operation = tx
            .get(id)
            .map_err(OperationsManagerError::store(id, "getting"))?
            .ok_or_else(|| OperationsManagerError::NotFound { key: id.to_string() })?;

        operation.priority = OperationPriority::High.as_i32();
        if operation.status.is_terminal() {
            operation.rearm(self.now());
        }
        tx.update(&operation)
            .map_err(OperationsManagerError::store(id, "rescheduling"))?;
        tx.commit().map_err(OperationsManagerError::Transaction)?;

        metrics::record_transition(operation.op_type.as_str(), "rescheduled");
        Ok(())
    }

    /// All operations of this manager's type, oldest first.
    pub fn list_all(&self) -> ManagerResult<Vec<Operation>> {
        let tx = self.begin()?;
        let operations = tx
            .list_all_by_type(self.op_type)
            .map_err(OperationsManagerError::store(self.op_type.as_str(), "listing"))?;
        tx.commit().map_err(OperationsManagerError::Transaction)?;
        Ok(operations)
    }

    /// Open and commit an empty transaction to check the store is usable.
    pub fn ping(&self) -> ManagerResult<()> {
        let tx = self.begin()?;
        tx.commit().map_err(OperationsManagerError::Transaction)
    }

    // === Maintenance ===

    /// The hung-operation query: IN_PROGRESS rows older than the hang period.
    pub fn list_hanged_operations(&self) -> ManagerResult<Vec<Operation>> {
        let cutoff = cutoff(self.now(), self.config.operation_hang_period);
        let tx = self.begin()?;
        let operations = tx
            .list_hanged(self.op_type, cutoff)
            .map_err(OperationsManagerError::store(self.op_type.as_str(), "listing hanged"))?;
        tx.commit().map_err(OperationsManagerError::Transaction)?;
        Ok(operations)
    }

    /// One tick of hung-operation recovery. Returns how many rows were reset.
    pub fn reschedule_hanged_operations(&self) -> ManagerResult<usize> {
        let now = self.now();
        let tx = self.begin()?;
        let count = tx
            .reschedule_hanged(self.op_type, cutoff(now, self.config.operation_hang_period), now)
            .map_err(OperationsManagerError::store(
                self.op_type.as_str(),
                "rescheduling hanged",
            ))?;
        tx.commit().map_err(OperationsManagerError::Transaction)?;

        metrics::record_maintenance_rows("reschedule_hanged", count);
        Ok(count)
    }

    /// One tick of stale-data refresh. Returns how many rows were re-armed.
    pub fn reschedule_stale_operations(&self) -> ManagerResult<usize> {
        let now = self.now();
        let tx = self.begin()?;
        let count = tx
            .reschedule_stale(
                self.op_type,
                cutoff(now, self.config.operation_reschedule_period),
                now,
            )
            .map_err(OperationsManagerError::store(
                self.op_type.as_str(),
                "rescheduling stale",
            ))?;
        tx.commit().map_err(OperationsManagerError::Transaction)?;

        metrics::record_maintenance_rows("reschedule_stale", count);
        Ok(count)
    }

    /// Delete finished operations past their retention, in one transaction.
    /// Returns (completed, failed) deletion counts.
    pub fn delete_old_operations(
        &self,
        completed_older_than_days: u32,
        failed_older_than_days: u32,
    ) -> ManagerResult<(usize, usize)> {
        let now = self.now();
        let tx = self.begin()?;
        let completed = tx
            .delete_older_than(
                self.op_type,
                OperationStatus::Completed,
                now - chrono::Duration::days(completed_older_than_days as i64),
            )
            .map_err(OperationsManagerError::store(
                self.op_type.as_str(),
                "deleting completed",
            ))?;
        let failed = tx
            .delete_older_than(
                self.op_type,
                OperationStatus::Failed,
                now - chrono::Duration::days(failed_older_than_days as i64),
            )
            .map_err(OperationsManagerError::store(
                self.op_type.as_str(),
                "deleting failed",
            ))?;
        tx.commit().map_err(OperationsManagerError::Transaction)?;

        metrics::record_maintenance_rows("delete_old", completed + failed);
        Ok((completed, failed))
    }

    // === Periodic jobs ===

    /// Run the stale-data refresh until `shutdown` fires.
    ///
    /// A second call while the job is registered is a no-op.
    pub async fn start_reschedule_operations_job(
        self: &Arc<Self>,
        shutdown: &CancellationToken,
    ) -> ManagerResult<()> {
        if self.reschedule_job_started.swap(true, Ordering::SeqCst) {
            info!("Reschedule operations job already started");
            return Ok(());
        }
        let manager = self.clone();
        let job = self.cron_job(
            "RescheduleOperations",
            self.config.reschedule_job_interval,
            move || match manager.reschedule_stale_operations() {
                Ok(count) => info!("Rescheduled {} stale operations", count),
                Err(e) => error!("Failed to reschedule stale operations: {}", e),
            },
        );
        run_cron_job(shutdown, &self.election, self.coordinator.clone(), job).await?;
        Ok(())
    }

    /// Run hung-operation recovery until `shutdown` fires.
    ///
    /// A second call while the job is registered is a no-op.
    pub async fn start_reschedule_hanged_operations_job(
        self: &Arc<Self>,
        shutdown: &CancellationToken,
    ) -> ManagerResult<()> {
        if self.reschedule_hanged_job_started.swap(true, Ordering::SeqCst) {
            info!("Reschedule hanged operations job already started");
            return Ok(());
        }
        let manager = self.clone();
        let job = self.cron_job(
            "RescheduleHangedOperations",
            self.config.reschedule_hanged_job_interval,
            move || match manager.reschedule_hanged_operations() {
                Ok(count) => info!("Rescheduled {} hanged operations", count),
                Err(e) => error!("Failed to reschedule hanged operations: {}", e),
            },
        );
        run_cron_job(shutdown, &self.election, self.coordinator.clone(), job).await?;
        Ok(())
    }

    /// Run retention cleanup until `shutdown` fires.
    pub async fn start_delete_old_operations_job(
        self: &Arc<Self>,
        shutdown: &CancellationToken,
    ) -> ManagerResult<()> {
        if self.delete_old_job_started.swap(true, Ordering::SeqCst) {
            info!("Delete old operations job already started");
            return Ok(());
        }
        let manager = self.clone();
        let (completed_days, failed_days) = (
            self.config.delete_completed_older_than_days,
            self.config.delete_failed_older_than_days,
        );
        let job = self.cron_job(
            "DeleteOldOperations",
            self.config.delete_old_operations_job_interval,
            move || match manager.delete_old_operations(completed_days, failed_days) {
                Ok((completed, failed)) => info!(
                    "Deleted {} completed and {} failed old operations",
                    completed, failed
                ),
                Err(e) => error!("Failed to delete old operations: {}", e),
            },
        );
        run_cron_job(shutdown, &self.election, self.coordinator.clone(), job).await?;
        Ok(())
    }

    fn cron_job(
        &self,
        name: &str,
        period: Duration,
        tick: impl Fn() + Send + Sync + 'static,
    ) -> CronJob {
        CronJob::blocking(format!("{}-{}", name, self.op_type.as_str()), period, tick)
    }
}

fn cutoff(now: DateTime<Utc>, age: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(age)
        .ok()
        .and_then(|age| now.checked_sub_signed(age))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
