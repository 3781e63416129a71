//! Lifecycle management for asynchronous operations of one type.

mod config;
mod error;
mod manager;

pub use config::OperationsManagerConfig;
pub use error::OperationsManagerError;
pub use manager::OperationsManager;
