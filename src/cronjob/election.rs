//! Leader election on top of a [`LeaseCoordinator`].

use super::CronJobError;
use crate::lease::{LeaseCoordinator, LeaseKey};
use crate::server::metrics;
use rand::Rng;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Maximum extra fraction of `retry_period` added as jitter to acquire attempts.
const JITTER_FACTOR: f64 = 1.2;

#[derive(Debug, Clone)]
pub struct ElectionConfig {
    pub enabled: bool,
    pub lock_name: String,
    pub namespace: String,
    /// How long a lease stays valid without renewal.
    pub lease_duration: Duration,
    /// How long the leader keeps retrying renewals before giving up.
    pub renew_deadline: Duration,
    /// Pause between acquire and renew attempts.
    pub retry_period: Duration,
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            lock_name: "operations-scheduler-lock".to_string(),
            namespace: "compass-system".to_string(),
            lease_duration: Duration::from_secs(60),
            renew_deadline: Duration::from_secs(15),
            retry_period: Duration::from_secs(5),
        }
    }
}

impl ElectionConfig {
    pub fn validate(&self) -> Result<(), CronJobError> {
        if self.lock_name.is_empty() || self.namespace.is_empty() {
            return Err(CronJobError::InvalidElectionConfig(
                "lock name and namespace must not be empty".to_string(),
            ));
        }
        if self.renew_deadline >= self.lease_duration {
            return Err(CronJobError::InvalidElectionConfig(format!(
                "lease duration {:?} must be greater than renew deadline {:?}",
                self.lease_duration, self.renew_deadline
            )));
        }
        if self.retry_period.is_zero() || self.retry_period.mul_f64(JITTER_FACTOR) >= self.renew_deadline {
            return Err(CronJobError::InvalidElectionConfig(format!(
                "renew deadline {:?} must be greater than retry period {:?} plus jitter",
                self.renew_deadline, self.retry_period
            )));
        }
        Ok(())
    }
}

/// Builds a holder identity unique to this process.
pub fn instance_identity() -> String {
    let host = std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "instance".to_string());
    format!("{}-{}", host, uuid::Uuid::new_v4())
}

/// Runs work only while holding a named lease.
#[derive(Clone)]
pub struct LeaderElector {
    coordinator: Arc<dyn LeaseCoordinator>,
    config: ElectionConfig,
    key: LeaseKey,
    identity: String,
}

impl LeaderElector {
    pub fn new(
        coordinator: Arc<dyn LeaseCoordinator>,
        config: ElectionConfig,
        identity: String,
    ) -> Result<Self, CronJobError> {
        config.validate()?;
        let key = LeaseKey::new(config.namespace.clone(), config.lock_name.clone());
        Ok(Self {
            coordinator,
            config,
            key,
            identity,
        })
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Acquire the lease, run `on_started_leading` while holding it, and go
    /// back to acquiring whenever leadership ends, until `shutdown` fires.
    ///
    /// The token handed to `on_started_leading` is cancelled as soon as the
    /// lease is lost. Renewal runs on its own task, so it keeps the lease
    /// alive even while the leading work is busy.
    pub async fn run<F, Fut>(&self, shutdown: &CancellationToken, on_started_leading: F)
    where
        F: Fn(CancellationToken) -> Fut,
        Fut: Future<Output = ()>,
    {
        loop {
            if !self.acquire(shutdown).await {
                break;
            }

            info!("{} became leader for lease {}", self.identity, self.key);
            metrics::set_lease_leader(&self.key.to_string(), true);

            let lease_token = shutdown.child_token();
            let mut renewal = self.spawn_renewal(lease_token.clone());
            let leading = on_started_leading(lease_token.clone());
            tokio::pin!(leading);

            let renewal_finished = tokio::select! {
                _ = &mut leading => {
                    debug!("Leading work for lease {} returned", self.key);
                    false
                }
                result = &mut renewal => {
                    if let Err(e) = result {
                        warn!("Renewal task for lease {} failed: {}", self.key, e);
                    }
                    lease_token.cancel();
                    leading.await;
                    true
                }
            };
            lease_token.cancel();
            if !renewal_finished {
                if let Err(e) = renewal.await {
                    warn!("Renewal task for lease {} failed: {}", self.key, e);
                }
            }

            self.on_stopped_leading().await;

            if shutdown.is_cancelled() {
                break;
            }
            warn!(
                "{} is no longer leading lease {}, trying to re-acquire",
                self.identity, self.key
            );
        }
    }

    /// Retry until the lease is ours. Returns false if cancelled first.
    async fn acquire(&self, shutdown: &CancellationToken) -> bool {
        loop {
            if shutdown.is_cancelled() {
                return false;
            }

            match self
                .coordinator
                .try_acquire(&self.key, &self.identity, self.config.lease_duration)
                .await
            {
                Ok(true) => return true,
                Ok(false) => debug!("Lease {} is held by another instance", self.key),
                Err(e) => warn!("Failed to acquire lease {}: {}", self.key, e),
            }

            let wait = jittered(self.config.retry_period);
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = shutdown.cancelled() => return false,
            }
        }
    }

    fn spawn_renewal(&self, lease_token: CancellationToken) -> JoinHandle<()> {
        let elector = self.clone();
        tokio::spawn(async move { elector.renew_until_lost(&lease_token).await })
    }

    /// Renew every retry period. Returns once the lease is lost, the renew
    /// deadline passes without a successful renewal, or the token fires.
    async fn renew_until_lost(&self, lease_token: &CancellationToken) {
        let mut last_renewed = Instant::now();
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.retry_period) => {}
                _ = lease_token.cancelled() => return,
            }

            match self
                .coordinator
                .renew(&self.key, &self.identity, self.config.lease_duration)
                .await
            {
                Ok(true) => last_renewed = Instant::now(),
                Ok(false) => {
                    warn!("Lease {} was taken by another instance", self.key);
                    return;
                }
                Err(e) => warn!("Failed to renew lease {}: {}", self.key, e),
            }

            if last_renewed.elapsed() >= self.config.renew_deadline {
                warn!(
                    "Could not renew lease {} within {:?}",
                    self.key, self.config.renew_deadline
                );
                return;
            }
        }
    }

    async fn on_stopped_leading(&self) {
        metrics::set_lease_leader(&self.key.to_string(), false);
        if let Err(e) = self.coordinator.release(&self.key, &self.identity).await {
            warn!("Failed to release lease {}: {}", self.key, e);
        }
        info!("{} stopped leading lease {}", self.identity, self.key);
    }
}

fn jittered(period: Duration) -> Duration {
    let extra = rand::rng().random_range(0.0..(JITTER_FACTOR - 1.0));
    period + period.mul_f64(extra)
}
