//! Test server lifecycle management
//!
//! Each test gets an isolated server with its own databases in a temp dir.

use super::constants::*;
use super::fixtures::create_test_registry;
use operations_scheduler::maintainer::OperationMaintainer;
use operations_scheduler::operation::{Operation, OperationStatus, OperationType, SqliteOperationStore};
use operations_scheduler::operations_manager::{OperationsManager, OperationsManagerConfig};
use operations_scheduler::processor::{LoggingProcessor, WorkerPool, WorkerPoolConfig};
use operations_scheduler::registry::SqliteRegistryStore;
use operations_scheduler::server::state::ServerState;
use operations_scheduler::server::{make_app, RequestsLoggingLevel, ServerConfig};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Test server instance with isolated databases
///
/// When dropped, the server and its workers shut down and temp resources
/// are cleaned up.
pub struct TestServer {
    /// Base URL for making requests (e.g., "http://127.0.0.1:12345")
    pub base_url: String,

    /// Manager sharing the server's operations database
    pub manager: Arc<OperationsManager>,

    /// Maintainer over the server's databases
    pub maintainer: Arc<OperationMaintainer>,

    /// Registry seeded with the fixtures from `constants`
    pub registry: Arc<SqliteRegistryStore>,

    shutdown: CancellationToken,
    _temp_db_dir: TempDir,
}

impl TestServer {
    /// Spawns a server whose workers process operations in the background.
    pub async fn spawn() -> Self {
        Self::spawn_inner(true).await
    }

    /// Spawns a server with no workers, so operations stay where tests put them.
    pub async fn spawn_without_workers() -> Self {
        Self::spawn_inner(false).await
    }

    async fn spawn_inner(with_workers: bool) -> Self {
        let temp_db_dir = TempDir::new().expect("Failed to create temp dir");

        let store = Arc::new(
            SqliteOperationStore::new(temp_db_dir.path().join("operations.db"))
                .expect("Failed to open operations store"),
        );
        let registry =
            Arc::new(create_test_registry(temp_db_dir.path()).expect("Failed to create registry"));

        let manager = Arc::new(OperationsManager::new(
            OperationType::OrdAggregation,
            store.clone(),
            OperationsManagerConfig::default(),
        ));
        let maintainer = Arc::new(OperationMaintainer::new(
            store,
            registry.clone(),
            registry.clone(),
        ));

        let shutdown = CancellationToken::new();
        let (pool, on_demand) = WorkerPool::new(
            manager.clone(),
            Arc::new(LoggingProcessor),
            WorkerPoolConfig {
                parallel_processors: 2,
                quiet_period: Duration::from_millis(WORKER_QUIET_PERIOD_MS),
            },
        );
        if with_workers {
            tokio::spawn(pool.run(shutdown.clone()));
        } else {
            // Keep the on-demand receiver alive for the server's lifetime
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                shutdown.cancelled().await;
                drop(pool);
            });
        }

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind to random port");
        let port = listener
            .local_addr()
            .expect("Failed to get local address")
            .port();
        let base_url = format!("http://127.0.0.1:{}", port);

        let state = ServerState {
            config: ServerConfig {
                port,
                requests_logging_level: RequestsLoggingLevel::None,
                ..Default::default()
            },
            start_time: Instant::now(),
            operations_manager: manager.clone(),
            webhooks: registry.clone(),
            applications: registry.clone(),
            on_demand,
            hash: "test".to_string(),
        };
        let app = make_app(state);

        let server_shutdown = shutdown.clone();
        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
                .await
                .expect("Server failed");
        });

        let server = Self {
            base_url,
            manager,
            maintainer,
            registry,
            shutdown,
            _temp_db_dir: temp_db_dir,
        };
        server.wait_for_ready().await;
        server
    }

    /// Waits for the server to become ready by polling /readyz
    async fn wait_for_ready(&self) {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(100))
            .build()
            .expect("Failed to build reqwest client");

        let start = Instant::now();
        let timeout = Duration::from_millis(SERVER_READY_TIMEOUT_MS);

        loop {
            if start.elapsed() > timeout {
                panic!(
                    "Server did not become ready within {}ms",
                    SERVER_READY_TIMEOUT_MS
                );
            }

            match client.get(format!("{}/readyz", self.base_url)).send().await {
                Ok(response) if response.status().is_success() => return,
                _ => {
                    tokio::time::sleep(Duration::from_millis(SERVER_READY_POLL_INTERVAL_MS)).await;
                }
            }
        }
    }

    /// All operations currently stored.
    pub fn operations(&self) -> Vec<Operation> {
        self.manager.list_all().expect("Failed to list operations")
    }

    /// Polls until the operation reaches `status`, returning it.
    ///
    /// # Panics
    ///
    /// Panics if the status is not reached within OPERATION_WAIT_TIMEOUT_MS.
    pub async fn wait_for_status(&self, id: &str, status: OperationStatus) -> Operation {
        let start = Instant::now();
        loop {
            let operation = self
                .operations()
                .into_iter()
                .find(|op| op.id == id)
                .unwrap_or_else(|| panic!("Operation {} disappeared", id));
            if operation.status == status {
                return operation;
            }
            if start.elapsed() > Duration::from_millis(OPERATION_WAIT_TIMEOUT_MS) {
                panic!(
                    "Operation {} stuck in {:?}, expected {:?}",
                    id, operation.status, status
                );
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
