//! Reconciles the operation queue with the registry.
//!
//! Every application with a triggering webhook, directly or through its
//! template, should have exactly one operation of the maintained type. So
//! should every template with a static webhook.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::clock::{system_clock, Clock};
use crate::cronjob::{run_cron_job, CronJob, CronJobError, ElectionConfig};
use crate::lease::LeaseCoordinator;
use crate::operation::{
    AggregationTarget, Operation, OperationData, OperationPriority, OperationStore, OperationType,
};
use crate::registry::{ApplicationSource, WebhookSource, WebhookType};
use crate::server::metrics;

pub const DEFAULT_MAINTAIN_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// What one reconciliation pass changed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MaintainOutcome {
    pub created: usize,
    pub deleted: usize,
}

pub struct OperationMaintainer {
    op_type: OperationType,
    webhook_type: WebhookType,
    static_webhook_type: WebhookType,
    store: Arc<dyn OperationStore>,
    webhooks: Arc<dyn WebhookSource>,
    applications: Arc<dyn ApplicationSource>,
    clock: Clock,
    election: ElectionConfig,
    coordinator: Option<Arc<dyn LeaseCoordinator>>,
    job_started: AtomicBool,
}

impl OperationMaintainer {
    /// Maintainer for ORD aggregation operations, driven by ORD webhooks.
    pub fn new(
        store: Arc<dyn OperationStore>,
        webhooks: Arc<dyn WebhookSource>,
        applications: Arc<dyn ApplicationSource>,
    ) -> Self {
        Self {
            op_type: OperationType::OrdAggregation,
            webhook_type: WebhookType::OpenResourceDiscovery,
            static_webhook_type: WebhookType::OpenResourceDiscoveryStatic,
            store,
            webhooks,
            applications,
            clock: system_clock(),
            election: ElectionConfig {
                enabled: false,
                ..Default::default()
            },
            coordinator: None,
            job_started: AtomicBool::new(false),
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

    /// Operation data that should exist right now, deduplicated, in
    /// discovery order.
    fn desired_operations(&self) -> Result<Vec<OperationData>> {
        let webhooks = self
            .webhooks
            .list_webhooks_by_type(self.webhook_type)
            .with_context(|| format!("Failed to list {} webhooks", self.webhook_type.as_str()))?;
        let static_webhooks = self
            .webhooks
            .list_webhooks_by_type(self.static_webhook_type)
            .with_context(|| {
                format!("Failed to list {} webhooks", self.static_webhook_type.as_str())
            })?;

        let mut seen = HashSet::new();
        let mut desired = Vec::new();
        let mut push = |target: AggregationTarget| {
            let data = target.to_data();
            if seen.insert(canonical_key(&data)) {
                desired.push(data);
            }
        };

        for webhook in webhooks {
            if let Some(application_id) = webhook.application_id {
                push(AggregationTarget::new(application_id, None));
            } else if let Some(template_id) = webhook.application_template_id {
                let applications = self
                    .applications
                    .list_applications_by_template(&template_id)
                    .with_context(|| {
                        format!("Failed to list applications for template {}", template_id)
                    })?;
                for application in applications {
                    push(AggregationTarget::new(application.id, Some(template_id.clone())));
                }
            }
        }
        // Static documents are shared by the whole template.
        for template_id in static_webhooks
            .into_iter()
            .filter_map(|webhook| webhook.application_template_id)
        {
            push(AggregationTarget::for_template(template_id));
        }
        Ok(desired)
    }

    /// Run one reconciliation pass.
    ///
    /// Inputs are gathered first; any failure there aborts before the store
    /// is touched. Creations and deletions then commit together.
    pub fn maintain(&self) -> Result<MaintainOutcome> {
        let desired = self
            .desired_operations()
            .context("Failed to compute desired operations")?;

        let tx = self.store.begin()?;
        let existing = tx
            .list_all_by_type(self.op_type)
            .with_context(|| format!("Failed to list {} operations", self.op_type.as_str()))?;

        let mut existing_by_key: HashMap<String, Vec<String>> = HashMap::new();
        for operation in existing {
            existing_by_key
                .entry(canonical_key(&operation.data))
                .or_default()
                .push(operation.id);
        }

        let now = (self.clock)();
        let mut to_create = Vec::new();
        for data in desired {
            if existing_by_key.remove(&canonical_key(&data)).is_none() {
                to_create.push(Operation::new(
                    self.op_type,
                    OperationPriority::Low.as_i32(),
                    data,
                    now,
                ));
            }
        }
        // Whatever is left is no longer backed by a webhook.
        let to_delete: Vec<String> = existing_by_key.into_values().flatten().collect();

        tx.create_multiple(&to_create)
            .context("Failed to create operations")?;
        tx.delete_multiple(&to_delete)
            .context("Failed to delete operations")?;
        tx.commit()?;

        let outcome = MaintainOutcome {
            created: to_create.len(),
            deleted: to_delete.len(),
        };
        metrics::record_maintenance_rows("maintain", outcome.created + outcome.deleted);
        debug!(
            "Maintained {} operations: {:?}",
            self.op_type.as_str(),
            outcome
        );
        Ok(outcome)
    }

    /// Run [`Self::maintain`] every `interval` until `shutdown` fires.
    pub async fn start_maintain_job(
        self: &Arc<Self>,
        shutdown: &CancellationToken,
        interval: Duration,
    ) -> Result<(), CronJobError> {
        if self.job_started.swap(true, Ordering::SeqCst) {
            info!("Maintain operations job already started");
            return Ok(());
        }
        let maintainer = self.clone();
        let job = CronJob::blocking(
            format!("MaintainOperations-{}", self.op_type.as_str()),
            interval,
            move || match maintainer.maintain() {
                Ok(outcome) => info!(
                    "Operations maintenance finished: {} created, {} deleted",
                    outcome.created, outcome.deleted
                ),
                Err(e) => error!("Operations maintenance failed: {:#}", e),
            },
        );
        run_cron_job(shutdown, &self.election, self.coordinator.clone(), job).await
    }
}

/// Data compared as normalized JSON so key order and spacing don't matter.
fn canonical_key(data: &OperationData) -> String {
    match serde_json::from_str::<serde_json::Value>(data.as_str()) {
        Ok(value) => value.to_string(),
        Err(_) => data.as_str().to_string(),
    }
}
