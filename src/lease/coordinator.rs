use anyhow::Result;
use async_trait::async_trait;
use std::fmt;
use std::time::Duration;

/// Identifies a lease: one logical job name inside a namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LeaseKey {
    pub namespace: String,
    pub name: String,
}

impl LeaseKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for LeaseKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Lease-based mutual exclusion used for leader election.
///
/// A lease is held by at most one `holder` until it expires. Holders keep it
/// by renewing before expiry.
#[async_trait]
pub trait LeaseCoordinator: Send + Sync {
    /// Take the lease if it is free, expired, or already ours.
    async fn try_acquire(&self, key: &LeaseKey, holder: &str, duration: Duration) -> Result<bool>;

    /// Extend a lease we still hold. Returns false once it was lost.
    async fn renew(&self, key: &LeaseKey, holder: &str, duration: Duration) -> Result<bool>;

    /// Give the lease up early. Releasing a lease held by someone else is a no-op.
    async fn release(&self, key: &LeaseKey, holder: &str) -> Result<()>;
}
