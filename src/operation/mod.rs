//! Operation module
//!
//! Durable, prioritized units of asynchronous work and the transactional
//! store they live in.

mod models;
mod schema;
mod store;

pub use models::*;
pub use schema::OPERATIONS_VERSIONED_SCHEMAS;
pub use store::{OperationStore, OperationTx, SqliteOperationStore};
