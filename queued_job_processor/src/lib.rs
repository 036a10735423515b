use std::{
    fmt::Debug,
    time::{Duration, Instant},
};

use anyhow::Context as _;
pub use async_trait::async_trait;
use tokio::{sync::watch, time::sleep};

/// Polling loop for background services that pull discrete jobs from some
/// store: sleep with exponential backoff while idle, process jobs one at a
/// time, never die on a failed job.
#[async_trait]
pub trait JobProcessor: Sync + Send {
    type Job: Send + 'static;
    type JobId: Send + Sync + Debug + 'static;

    const POLLING_INTERVAL_MS: u64 = 1000;
    const MAX_BACKOFF_MS: u64 = 60_000;
    const BACKOFF_MULTIPLIER: u64 = 2;
    const SERVICE_NAME: &'static str;

    /// Returns None when there is no pending job.
    /// Note: must be concurrency-safe - one job must not be returned to two
    /// parallel pollers.
    async fn get_next_job(&self) -> anyhow::Result<Option<(Self::JobId, Self::Job)>>;

    /// Processes one job to completion. An `Err` marks the job failed; the
    /// loop itself continues.
    async fn process_job(
        &self,
        job_id: &Self::JobId,
        job: Self::Job,
        started_at: Instant,
    ) -> anyhow::Result<()>;

    /// Invoked when `process_job` returns an error.
    async fn save_failure(&self, job_id: Self::JobId, started_at: Instant, error: String);

    /// `iterations_left`:
    /// To run indefinitely, pass `None`,
    /// To process one job, pass `Some(1)`,
    /// To process a batch, pass `Some(batch_size)`.
    async fn run(
        self,
        stop_receiver: watch::Receiver<bool>,
        mut iterations_left: Option<usize>,
    ) -> anyhow::Result<()>
    where
        Self: Sized,
    {
        let mut backoff: u64 = Self::POLLING_INTERVAL_MS;
        while iterations_left.map_or(true, |iterations| iterations > 0) {
            if *stop_receiver.borrow() {
                blobd_logs::warn!(
                    "Stop signal received, shutting down {} component while waiting for a new job",
                    Self::SERVICE_NAME
                );
                return Ok(());
            }
            if let Some((job_id, job)) =
                Self::get_next_job(&self).await.context("get_next_job()")?
            {
                let started_at = Instant::now();
                backoff = Self::POLLING_INTERVAL_MS;
                iterations_left = iterations_left.map(|iterations| iterations - 1);

                blobd_logs::debug!(
                    "Processing {} job with id {:?}",
                    Self::SERVICE_NAME,
                    job_id
                );
                match self.process_job(&job_id, job, started_at).await {
                    Ok(()) => blobd_logs::debug!(
                        "{} job {:?} finished successfully",
                        Self::SERVICE_NAME,
                        job_id
                    ),
                    Err(error) => {
                        blobd_logs::error!(
                            "Error occurred while processing {} job {:?}: {:?}",
                            Self::SERVICE_NAME,
                            job_id,
                            error
                        );
                        self.save_failure(job_id, started_at, error.to_string())
                            .await;
                    }
                }
            } else if iterations_left.is_some() {
                blobd_logs::info!("No more jobs to process. Server can stop now.");
                return Ok(());
            } else {
                blobd_logs::trace!("Backing off for {} ms", backoff);
                sleep(Duration::from_millis(backoff)).await;
                backoff = (backoff * Self::BACKOFF_MULTIPLIER).min(Self::MAX_BACKOFF_MS);
            }
        }
        blobd_logs::info!("Requested number of jobs is processed. Server can stop now.");
        Ok(())
    }
}
