use crate::cronjob::CronJobError;

#[derive(Debug, thiserror::Error)]
pub enum OperationsManagerError {
    /// Nothing claimable for this caller right now. Poll again later.
    #[error("there are no scheduled operations for processing")]
    NoScheduledOperations,

    #[error("operation not found for {key}")]
    NotFound { key: String },

    /// A store call failed while handling the operation identified by `key`.
    #[error("while {action} operation {key}: {source}")]
    Store {
        key: String,
        action: &'static str,
        #[source]
        source: anyhow::Error,
    },

    /// Beginning or committing a transaction failed.
    #[error("transaction error: {0}")]
    Transaction(#[source] anyhow::Error),

    #[error(transparent)]
    Job(#[from] CronJobError),
}

impl OperationsManagerError {
    pub fn is_no_scheduled_operations(&self) -> bool {
        matches!(self, OperationsManagerError::NoScheduledOperations)
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, OperationsManagerError::NotFound { .. })
    }

    pub(crate) fn store(key: impl Into<String>, action: &'static str) -> impl FnOnce(anyhow::Error) -> Self {
        let key = key.into();
        move |source| OperationsManagerError::Store {
            key,
            action,
            source,
        }
    }
}
