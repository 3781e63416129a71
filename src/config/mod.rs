mod file_config;

pub use file_config::{ElectionFileConfig, FileConfig, OperationsManagerFileConfig, WorkersFileConfig};

use crate::cronjob::ElectionConfig;
use crate::maintainer::DEFAULT_MAINTAIN_INTERVAL;
use crate::operations_manager::OperationsManagerConfig;
use crate::processor::WorkerPoolConfig;
use crate::server::{RequestsLoggingLevel, ServerConfig};
use anyhow::{bail, Result};
use clap::ValueEnum;
use std::path::PathBuf;
use std::time::Duration;

/// CLI arguments that can be used for config resolution.
/// This struct mirrors the CLI arguments that can be overridden by TOML config.
#[derive(Debug, Clone, Default)]
pub struct CliConfig {
    pub db_dir: Option<PathBuf>,
    pub port: u16,
    pub metrics_port: u16,
    pub logging_level: RequestsLoggingLevel,
    pub request_timeout_secs: u64,
    pub parallel_processors: usize,
    pub disable_election: bool,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    // Core settings
    pub db_dir: PathBuf,
    pub port: u16,
    pub metrics_port: u16,
    pub logging_level: RequestsLoggingLevel,
    pub request_timeout: Duration,
    pub maintain_operations_job_interval: Duration,

    // Feature configs (with defaults)
    pub operations_manager: OperationsManagerConfig,
    pub election: ElectionConfig,
    pub workers: WorkerPoolConfig,
}

fn secs(value: Option<u64>, default: Duration) -> Duration {
    value.map(Duration::from_secs).unwrap_or(default)
}

impl AppConfig {
    /// Resolve configuration from CLI arguments and optional TOML file config.
    /// TOML values override CLI values where present.
    pub fn resolve(cli: &CliConfig, file_config: Option<FileConfig>) -> Result<Self> {
        let file = file_config.unwrap_or_default();

        let db_dir = file
            .db_dir
            .map(PathBuf::from)
            .or_else(|| cli.db_dir.clone())
            .ok_or_else(|| {
                anyhow::anyhow!("db_dir must be specified via --db-dir or in config file")
            })?;

        if !db_dir.exists() {
            bail!("Database directory does not exist: {:?}", db_dir);
        }
        if !db_dir.is_dir() {
            bail!("db_dir is not a directory: {:?}", db_dir);
        }

        let port = file.port.unwrap_or(cli.port);
        let metrics_port = file.metrics_port.unwrap_or(cli.metrics_port);

        let logging_level = file
            .logging_level
            .and_then(|s| parse_logging_level(&s))
            .unwrap_or_else(|| cli.logging_level.clone());

        let request_timeout = Duration::from_secs(
            file.request_timeout_secs.unwrap_or(cli.request_timeout_secs),
        );
        let maintain_operations_job_interval = secs(
            file.maintain_operations_job_interval_secs,
            DEFAULT_MAINTAIN_INTERVAL,
        );

        let om_file = file.operations_manager.unwrap_or_default();
        let om_default = OperationsManagerConfig::default();
        let operations_manager = OperationsManagerConfig {
            priority_queue_limit: om_file
                .priority_queue_limit
                .unwrap_or(om_default.priority_queue_limit),
            reschedule_job_interval: secs(
                om_file.reschedule_job_interval_secs,
                om_default.reschedule_job_interval,
            ),
            operation_reschedule_period: secs(
                om_file.operation_reschedule_period_secs,
                om_default.operation_reschedule_period,
            ),
            reschedule_hanged_job_interval: secs(
                om_file.reschedule_hanged_job_interval_secs,
                om_default.reschedule_hanged_job_interval,
            ),
            operation_hang_period: secs(
                om_file.operation_hang_period_secs,
                om_default.operation_hang_period,
            ),
            delete_old_operations_job_interval: secs(
                om_file.delete_old_operations_job_interval_secs,
                om_default.delete_old_operations_job_interval,
            ),
            delete_completed_older_than_days: om_file
                .delete_completed_older_than_days
                .unwrap_or(om_default.delete_completed_older_than_days),
            delete_failed_older_than_days: om_file
                .delete_failed_older_than_days
                .unwrap_or(om_default.delete_failed_older_than_days),
        };

        let workers_file = file.workers.unwrap_or_default();
        let parallel_processors = workers_file
            .parallel_processors
            .unwrap_or(cli.parallel_processors);
        if parallel_processors == 0 {
            bail!("parallel_processors must be at least 1");
        }
        // Claims scan the top of the queue; it must be wider than the pool.
        if operations_manager.priority_queue_limit <= parallel_processors {
            bail!(
                "priority_queue_limit ({}) must exceed parallel_processors ({})",
                operations_manager.priority_queue_limit,
                parallel_processors
            );
        }
        let workers = WorkerPoolConfig {
            parallel_processors,
            quiet_period: secs(
                workers_file.quiet_period_secs,
                WorkerPoolConfig::default().quiet_period,
            ),
        };

        let election_file = file.election.unwrap_or_default();
        let election_default = ElectionConfig::default();
        let election = ElectionConfig {
            enabled: election_file.enabled.unwrap_or(!cli.disable_election),
            lock_name: election_file.lock_name.unwrap_or(election_default.lock_name),
            namespace: election_file.namespace.unwrap_or(election_default.namespace),
            lease_duration: secs(
                election_file.lease_duration_secs,
                election_default.lease_duration,
            ),
            renew_deadline: secs(
                election_file.renew_deadline_secs,
                election_default.renew_deadline,
            ),
            retry_period: secs(election_file.retry_period_secs, election_default.retry_period),
        };
        if election.enabled {
            election.validate()?;
        }

        Ok(Self {
            db_dir,
            port,
            metrics_port,
            logging_level,
            request_timeout,
            maintain_operations_job_interval,
            operations_manager,
            election,
            workers,
        })
    }

    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            requests_logging_level: self.logging_level.clone(),
            port: self.port,
            metrics_port: self.metrics_port,
            request_timeout: self.request_timeout,
        }
    }

    pub fn operations_db_path(&self) -> PathBuf {
        self.db_dir.join("operations.db")
    }

    pub fn registry_db_path(&self) -> PathBuf {
        self.db_dir.join("registry.db")
    }

    pub fn leases_db_path(&self) -> PathBuf {
        self.db_dir.join("leases.db")
    }
}

/// Parses a logging level string into RequestsLoggingLevel.
/// Uses clap's ValueEnum trait for parsing.
fn parse_logging_level(s: &str) -> Option<RequestsLoggingLevel> {
    RequestsLoggingLevel::from_str(s, true).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn make_temp_db_dir() -> TempDir {
        TempDir::new().unwrap()
    }

    fn cli_with_dir(dir: &TempDir) -> CliConfig {
        CliConfig {
            db_dir: Some(dir.path().to_path_buf()),
            port: 3001,
            metrics_port: 9091,
            logging_level: RequestsLoggingLevel::Path,
            request_timeout_secs: 30,
            parallel_processors: 5,
            disable_election: false,
        }
    }

    #[test]
    fn test_parse_logging_level() {
        assert!(matches!(
            parse_logging_level("none"),
            Some(RequestsLoggingLevel::None)
        ));
        assert!(matches!(
            parse_logging_level("body"),
            Some(RequestsLoggingLevel::Body)
        ));
        // Case insensitive
        assert!(matches!(
            parse_logging_level("PATH"),
            Some(RequestsLoggingLevel::Path)
        ));
        assert!(parse_logging_level("invalid").is_none());
    }

    #[test]
    fn test_resolve_cli_only() {
        let temp_dir = make_temp_db_dir();
        let cli = CliConfig {
            logging_level: RequestsLoggingLevel::Headers,
            parallel_processors: 4,
            ..cli_with_dir(&temp_dir)
        };

        let config = AppConfig::resolve(&cli, None).unwrap();

        assert_eq!(config.db_dir, temp_dir.path());
        assert_eq!(config.port, 3001);
        assert_eq!(config.metrics_port, 9091);
        assert_eq!(config.logging_level, RequestsLoggingLevel::Headers);
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert_eq!(config.maintain_operations_job_interval, Duration::from_secs(3600));
        assert_eq!(config.workers.parallel_processors, 4);
        assert_eq!(config.workers.quiet_period, Duration::from_secs(5));
        assert_eq!(config.operations_manager.priority_queue_limit, 10);
        assert!(config.election.enabled);
        assert_eq!(config.election.lease_duration, Duration::from_secs(60));
    }

    #[test]
    fn test_resolve_toml_overrides_cli() {
        let temp_dir = make_temp_db_dir();
        let cli = CliConfig {
            db_dir: Some(PathBuf::from("/should/be/overridden")),
            ..cli_with_dir(&temp_dir)
        };

        let file_config = FileConfig {
            db_dir: Some(temp_dir.path().to_string_lossy().to_string()),
            port: Some(4000),
            logging_level: Some("body".to_string()),
            maintain_operations_job_interval_secs: Some(120),
            operations_manager: Some(OperationsManagerFileConfig {
                priority_queue_limit: Some(50),
                operation_hang_period_secs: Some(600),
                ..Default::default()
            }),
            election: Some(ElectionFileConfig {
                enabled: Some(false),
                ..Default::default()
            }),
            workers: Some(WorkersFileConfig {
                parallel_processors: Some(20),
                quiet_period_secs: Some(1),
            }),
            ..Default::default()
        };

        let config = AppConfig::resolve(&cli, Some(file_config)).unwrap();

        // TOML values should override CLI
        assert_eq!(config.db_dir, temp_dir.path());
        assert_eq!(config.port, 4000);
        assert_eq!(config.logging_level, RequestsLoggingLevel::Body);
        assert_eq!(config.maintain_operations_job_interval, Duration::from_secs(120));
        assert_eq!(config.operations_manager.priority_queue_limit, 50);
        assert_eq!(config.operations_manager.operation_hang_period, Duration::from_secs(600));
        assert_eq!(
            config.operations_manager.operation_reschedule_period,
            Duration::from_secs(72 * 3600)
        );
        assert!(!config.election.enabled);
        assert_eq!(config.workers.parallel_processors, 20);
        assert_eq!(config.workers.quiet_period, Duration::from_secs(1));
        // CLI value used when TOML doesn't specify
        assert_eq!(config.metrics_port, 9091);
    }

    #[test]
    fn test_resolve_missing_db_dir_error() {
        let cli = CliConfig::default();
        let result = AppConfig::resolve(&cli, None);
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("db_dir must be specified"));
    }

    #[test]
    fn test_resolve_nonexistent_db_dir_error() {
        let cli = CliConfig {
            db_dir: Some(PathBuf::from("/nonexistent/path/that/should/not/exist")),
            ..Default::default()
        };
        let result = AppConfig::resolve(&cli, None);
        assert!(result.unwrap_err().to_string().contains("does not exist"));
    }

    #[test]
    fn test_resolve_db_dir_not_directory_error() {
        let temp_file = tempfile::NamedTempFile::new().unwrap();
        let cli = CliConfig {
            db_dir: Some(temp_file.path().to_path_buf()),
            ..Default::default()
        };
        let result = AppConfig::resolve(&cli, None);
        assert!(result.unwrap_err().to_string().contains("not a directory"));
    }

    #[test]
    fn test_resolve_rejects_queue_limit_not_above_workers() {
        let temp_dir = make_temp_db_dir();
        let file_config = FileConfig {
            operations_manager: Some(OperationsManagerFileConfig {
                priority_queue_limit: Some(2),
                ..Default::default()
            }),
            ..Default::default()
        };
        let err = AppConfig::resolve(&cli_with_dir(&temp_dir), Some(file_config)).unwrap_err();
        assert!(err.to_string().contains("priority_queue_limit"));

        let equal = CliConfig {
            parallel_processors: 10,
            ..cli_with_dir(&temp_dir)
        };
        let err = AppConfig::resolve(&equal, None).unwrap_err();
        assert!(err.to_string().contains("must exceed"));

        let below = CliConfig {
            parallel_processors: 9,
            ..cli_with_dir(&temp_dir)
        };
        assert!(AppConfig::resolve(&below, None).is_ok());

        let cli = CliConfig {
            parallel_processors: 0,
            ..cli_with_dir(&temp_dir)
        };
        assert!(AppConfig::resolve(&cli, None).is_err());
    }

    #[test]
    fn test_resolve_validates_enabled_election() {
        let temp_dir = make_temp_db_dir();
        let bad_election = ElectionFileConfig {
            lease_duration_secs: Some(10),
            renew_deadline_secs: Some(15),
            ..Default::default()
        };
        let file_config = FileConfig {
            election: Some(bad_election.clone()),
            ..Default::default()
        };
        let err = AppConfig::resolve(&cli_with_dir(&temp_dir), Some(file_config)).unwrap_err();
        assert!(err.to_string().contains("invalid election config"));

        // Ignored while election is disabled
        let cli = CliConfig {
            disable_election: true,
            ..cli_with_dir(&temp_dir)
        };
        let file_config = FileConfig {
            election: Some(bad_election),
            ..Default::default()
        };
        assert!(AppConfig::resolve(&cli, Some(file_config)).is_ok());
    }

    #[test]
    fn test_db_path_helpers() {
        let temp_dir = make_temp_db_dir();
        let config = AppConfig::resolve(&cli_with_dir(&temp_dir), None).unwrap();

        assert_eq!(config.operations_db_path(), temp_dir.path().join("operations.db"));
        assert_eq!(config.registry_db_path(), temp_dir.path().join("registry.db"));
        assert_eq!(config.leases_db_path(), temp_dir.path().join("leases.db"));
        assert_eq!(config.server_config().port, 3001);
    }
}
