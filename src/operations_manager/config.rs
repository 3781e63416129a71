use std::time::Duration;

const HOUR: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone)]
pub struct OperationsManagerConfig {
    /// Claim candidate window. Must exceed the number of workers polling
    /// the same type across all replicas.
    pub priority_queue_limit: usize,
    pub reschedule_job_interval: Duration,
    /// Finished operations older than this are re-armed for a refresh.
    pub operation_reschedule_period: Duration,
    pub reschedule_hanged_job_interval: Duration,
    /// IN_PROGRESS operations untouched for this long are presumed abandoned.
    pub operation_hang_period: Duration,
    pub delete_old_operations_job_interval: Duration,
    pub delete_completed_older_than_days: u32,
    pub delete_failed_older_than_days: u32,
}

impl Default for OperationsManagerConfig {
    fn default() -> Self {
        Self {
            priority_queue_limit: 10,
            reschedule_job_interval: 24 * HOUR,
            operation_reschedule_period: 72 * HOUR,
            reschedule_hanged_job_interval: HOUR,
            operation_hang_period: 2 * HOUR,
            delete_old_operations_job_interval: 24 * HOUR,
            delete_completed_older_than_days: 5,
            delete_failed_older_than_days: 10,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = OperationsManagerConfig::default();
        assert_eq!(config.priority_queue_limit, 10);
        assert_eq!(config.reschedule_job_interval, Duration::from_secs(86_400));
        assert_eq!(config.operation_reschedule_period, Duration::from_secs(259_200));
        assert_eq!(config.reschedule_hanged_job_interval, Duration::from_secs(3_600));
        assert_eq!(config.operation_hang_period, Duration::from_secs(7_200));
        assert_eq!(config.delete_completed_older_than_days, 5);
        assert_eq!(config.delete_failed_older_than_days, 10);
    }
}
