//! Workers that claim operations and hand them to a processor.

mod pool;

pub use pool::{OnDemandSignal, WorkerPool, WorkerPoolConfig, ON_DEMAND_CHANNEL_CAPACITY};

use crate::operation::{AggregationTarget, Operation};
use anyhow::Result;
use async_trait::async_trait;
use tracing::info;

/// Does the actual work behind an operation.
#[async_trait]
pub trait OperationProcessor: Send + Sync {
    /// `Ok(Some(message))` completes the operation but keeps `message` on it
    /// as a warning. `Err` marks the operation failed.
    async fn process(&self, operation: &Operation) -> Result<Option<String>>;
}

/// Logs each operation and completes it.
pub struct LoggingProcessor;

#[async_trait]
impl OperationProcessor for LoggingProcessor {
    async fn process(&self, operation: &Operation) -> Result<Option<String>> {
        match operation.data.parse::<AggregationTarget>() {
            Ok(target) => info!(
                "Processing operation {} for application {} (template {})",
                operation.id,
                target.application_id,
                target.application_template_id.as_deref().unwrap_or("-")
            ),
            Err(_) => info!(
                "Processing operation {} with data {}",
                operation.id,
                operation.data.as_str()
            ),
        }
        Ok(None)
    }
}
