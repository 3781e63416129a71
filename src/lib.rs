//! Operations Scheduler Library
//!
//! A durable queue of asynchronous operations with exclusive claims,
//! recovery jobs and leader-elected periodic maintenance.

pub mod clock;
pub mod config;
pub mod cronjob;
pub mod lease;
pub mod maintainer;
pub mod operation;
pub mod operations_manager;
pub mod processor;
pub mod registry;
pub mod server;
pub mod sqlite_persistence;

// Re-export commonly used types for convenience
pub use operation::{Operation, OperationStore, SqliteOperationStore};
pub use operations_manager::{OperationsManager, OperationsManagerConfig, OperationsManagerError};
pub use server::{run_server, RequestsLoggingLevel};
