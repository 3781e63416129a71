use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct FileConfig {
    // Core settings (can override CLI)
    pub db_dir: Option<String>,
    pub port: Option<u16>,
    pub metrics_port: Option<u16>,
    pub logging_level: Option<String>,
    pub request_timeout_secs: Option<u64>,
    pub maintain_operations_job_interval_secs: Option<u64>,

    // Feature configs
    pub operations_manager: Option<OperationsManagerFileConfig>,
    pub election: Option<ElectionFileConfig>,
    pub workers: Option<WorkersFileConfig>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct OperationsManagerFileConfig {
    pub priority_queue_limit: Option<usize>,
    pub reschedule_job_interval_secs: Option<u64>,
    pub operation_reschedule_period_secs: Option<u64>,
    pub reschedule_hanged_job_interval_secs: Option<u64>,
    pub operation_hang_period_secs: Option<u64>,
    pub delete_old_operations_job_interval_secs: Option<u64>,
    pub delete_completed_older_than_days: Option<u32>,
    pub delete_failed_older_than_days: Option<u32>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct ElectionFileConfig {
    pub enabled: Option<bool>,
    pub lock_name: Option<String>,
    pub namespace: Option<String>,
    pub lease_duration_secs: Option<u64>,
    pub renew_deadline_secs: Option<u64>,
    pub retry_period_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct WorkersFileConfig {
    pub parallel_processors: Option<usize>,
    pub quiet_period_secs: Option<u64>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        toml::from_str(&content).with_context(|| format!("Failed to parse config file: {:?}", path))
    }
}
