//! Periodic jobs, optionally gated by leader election.
//!
//! [`run_cron_job`] is the entry point: with election disabled the job
//! simply runs in this process; with election enabled it only runs while
//! this instance holds the job's lease.

mod election;
mod runner;

pub use election::{instance_identity, ElectionConfig, LeaderElector};
pub use runner::{CronJob, JobFn, PeriodicRunner, RunnerState};

use crate::lease::LeaseCoordinator;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Debug, thiserror::Error)]
pub enum CronJobError {
    #[error("invalid election config: {0}")]
    InvalidElectionConfig(String),
    #[error("leader election is enabled for job {0} but no lease coordinator was provided")]
    MissingCoordinator(String),
}

/// Run `job` until `shutdown` fires.
///
/// Returns early only for configuration errors.
pub async fn run_cron_job(
    shutdown: &CancellationToken,
    election: &ElectionConfig,
    coordinator: Option<Arc<dyn LeaseCoordinator>>,
    job: CronJob,
) -> Result<(), CronJobError> {
    let runner = PeriodicRunner::new(job);

    if !election.enabled {
        info!("Running job {} without leader election", runner.name());
        runner.run(shutdown).await;
        return Ok(());
    }

    let coordinator =
        coordinator.ok_or_else(|| CronJobError::MissingCoordinator(runner.name().to_string()))?;

    // Each job competes for its own lease so different jobs may land on
    // different instances.
    let mut job_election = election.clone();
    job_election.lock_name = format!("{}-{}", election.lock_name, runner.name());

    let elector = LeaderElector::new(coordinator, job_election, instance_identity())?;
    info!(
        "Running job {} with leader election as {}",
        runner.name(),
        elector.identity()
    );
    let runner = &runner;
    elector
        .run(shutdown, move |lease_token| async move {
            runner.run(&lease_token).await
        })
        .await;
    Ok(())
}
