//! Lease coordination for leader election.

mod coordinator;
mod sqlite_coordinator;

pub use coordinator::{LeaseCoordinator, LeaseKey};
pub use sqlite_coordinator::{SqliteLeaseCoordinator, LEASES_VERSIONED_SCHEMAS};
