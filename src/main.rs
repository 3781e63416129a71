use anyhow::{Context, Result};
use clap::Parser;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, level_filters::LevelFilter};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use operations_scheduler::config::{AppConfig, CliConfig, FileConfig};
use operations_scheduler::lease::{LeaseCoordinator, SqliteLeaseCoordinator};
use operations_scheduler::maintainer::OperationMaintainer;
use operations_scheduler::operation::{OperationType, SqliteOperationStore};
use operations_scheduler::operations_manager::OperationsManager;
use operations_scheduler::processor::{LoggingProcessor, WorkerPool};
use operations_scheduler::registry::SqliteRegistryStore;
use operations_scheduler::server::{self, state::ServerState, RequestsLoggingLevel};

fn parse_path(s: &str) -> Result<PathBuf> {
    let path_buf = PathBuf::from(s);
    let original_path = match path_buf.canonicalize() {
        Ok(path) => path,
        Err(msg) => {
            if msg.kind() == std::io::ErrorKind::NotFound {
                path_buf
            } else {
                return Err(msg).with_context(|| format!("Error resolving path: {}", s));
            }
        }
    };
    if original_path.is_absolute() {
        return Ok(original_path);
    }
    let cwd = std::env::current_dir()?;
    Ok(cwd.join(original_path))
}

#[derive(Parser, Debug)]
struct CliArgs {
    /// Directory holding operations.db, registry.db and leases.db.
    #[clap(long, value_parser = parse_path)]
    pub db_dir: Option<PathBuf>,

    /// Optional TOML config file. Its values override the flags.
    #[clap(long, value_parser = parse_path)]
    pub config: Option<PathBuf>,

    /// The port to listen on.
    #[clap(short, long, default_value_t = 3001)]
    pub port: u16,

    /// The port for the metrics server (Prometheus scraping).
    #[clap(long, default_value_t = 9091)]
    pub metrics_port: u16,

    /// The level of logging to perform on each request.
    #[clap(long, default_value = "path")]
    pub logging_level: RequestsLoggingLevel,

    /// Requests running longer than this many seconds are aborted.
    #[clap(long, default_value_t = 30)]
    pub request_timeout_sec: u64,

    /// Number of concurrent operation workers.
    #[clap(long, default_value_t = 5)]
    pub parallel_processors: usize,

    /// Run periodic jobs on this instance without leader election.
    #[clap(long)]
    pub disable_election: bool,
}

impl CliArgs {
    fn to_cli_config(&self) -> CliConfig {
        CliConfig {
            db_dir: self.db_dir.clone(),
            port: self.port,
            metrics_port: self.metrics_port,
            logging_level: self.logging_level.clone(),
            request_timeout_secs: self.request_timeout_sec,
            parallel_processors: self.parallel_processors,
            disable_election: self.disable_election,
        }
    }
}

fn spawn_job<F>(name: &'static str, job: F) -> JoinHandle<()>
where
    F: Future<Output = Result<(), String>> + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(e) = job.await {
            error!("Job {} stopped: {}", name, e);
        }
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli_args = CliArgs::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .with_env_var("LOG_LEVEL")
                .from_env_lossy(),
        )
        .try_init()
        .context("Failed to initialize logging")?;

    let file_config = cli_args
        .config
        .as_deref()
        .map(FileConfig::load)
        .transpose()?;
    let config = AppConfig::resolve(&cli_args.to_cli_config(), file_config)?;
    info!(
        "Starting operations scheduler {} ({})",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_HASH")
    );

    info!("Initializing metrics...");
    server::metrics::init_metrics();

    info!("Opening operations database at {:?}...", config.operations_db_path());
    let operation_store = Arc::new(SqliteOperationStore::new(config.operations_db_path())?);

    info!("Opening registry database at {:?}...", config.registry_db_path());
    let registry = Arc::new(SqliteRegistryStore::new(config.registry_db_path())?);

    let coordinator: Option<Arc<dyn LeaseCoordinator>> = if config.election.enabled {
        info!("Opening leases database at {:?}...", config.leases_db_path());
        let coordinator = SqliteLeaseCoordinator::new(config.leases_db_path())?;
        Some(Arc::new(coordinator) as Arc<dyn LeaseCoordinator>)
    } else {
        info!("Leader election disabled, periodic jobs run on this instance");
        None
    };

    let manager = Arc::new(
        OperationsManager::new(
            OperationType::OrdAggregation,
            operation_store.clone(),
            config.operations_manager.clone(),
        )
        .with_election(config.election.clone(), coordinator.clone()),
    );
    let maintainer = Arc::new(
        OperationMaintainer::new(operation_store, registry.clone(), registry.clone())
            .with_election(config.election.clone(), coordinator),
    );
    let (pool, on_demand) = WorkerPool::new(
        manager.clone(),
        Arc::new(LoggingProcessor),
        config.workers.clone(),
    );

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {}", e);
                return;
            }
            info!("Shutdown requested");
            shutdown.cancel();
        });
    }

    let mut tasks = vec![
        spawn_job("reschedule operations", {
            let (manager, shutdown) = (manager.clone(), shutdown.clone());
            async move {
                manager
                    .start_reschedule_operations_job(&shutdown)
                    .await
                    .map_err(|e| e.to_string())
            }
        }),
        spawn_job("reschedule hanged operations", {
            let (manager, shutdown) = (manager.clone(), shutdown.clone());
            async move {
                manager
                    .start_reschedule_hanged_operations_job(&shutdown)
                    .await
                    .map_err(|e| e.to_string())
            }
        }),
        spawn_job("delete old operations", {
            let (manager, shutdown) = (manager.clone(), shutdown.clone());
            async move {
                manager
                    .start_delete_old_operations_job(&shutdown)
                    .await
                    .map_err(|e| e.to_string())
            }
        }),
        spawn_job("maintain operations", {
            let (maintainer, shutdown) = (maintainer.clone(), shutdown.clone());
            let interval = config.maintain_operations_job_interval;
            async move {
                maintainer
                    .start_maintain_job(&shutdown, interval)
                    .await
                    .map_err(|e| e.to_string())
            }
        }),
        spawn_job("metrics server", {
            let (port, shutdown) = (config.metrics_port, shutdown.clone());
            async move {
                server::run_metrics_server(port, shutdown)
                    .await
                    .map_err(|e| format!("{:#}", e))
            }
        }),
    ];
    tasks.push(tokio::spawn(pool.run(shutdown.clone())));

    let state = ServerState {
        config: config.server_config(),
        start_time: Instant::now(),
        operations_manager: manager,
        webhooks: registry.clone(),
        applications: registry,
        on_demand,
        hash: env!("GIT_HASH").to_string(),
    };
    let result = server::run_server(state, shutdown.clone()).await;

    // The API going down for any reason stops everything else
    shutdown.cancel();
    futures::future::join_all(tasks).await;
    info!("Operations scheduler stopped");
    result
}
