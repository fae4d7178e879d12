use std::sync::Arc;

use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::handler::{ExecutionContext, JobHandler};
use super::lease::Lease;
use super::model::Job;
use super::store::{Claim, Dequeued, JobStore, Outcome};
use crate::common::error::{LeaseError, WorkerError};
use crate::config::settings::QueueSettings;

/// What a single pass of the loop did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Iteration {
    /// Queue was empty for the whole wait, or shutdown was requested.
    Idle,
    /// Got an id but did not run it (locked elsewhere or already finished).
    Skipped,
    /// Every slot for the job's kind was taken; it went back on the queue.
    Deferred { job_id: String },
    Completed { job_id: String },
    Failed { job_id: String },
}

/// WaitForJob -> Claim -> Reserve -> Execute (under lease renewal) -> Finalize.
#[derive(Clone)]
pub struct DequeueLoop {
    store: JobStore,
    handler: Arc<dyn JobHandler>,
    settings: QueueSettings,
}

impl DequeueLoop {
    pub fn new(store: JobStore, handler: Arc<dyn JobHandler>, settings: QueueSettings) -> Self {
        Self {
            store,
            handler,
            settings,
        }
    }

    /// Run until `shutdown` fires. Store errors back off before the next try;
    /// a failed or abandoned job never stops the loop.
    pub async fn run(&self, worker: usize, shutdown: CancellationToken) {
        info!(worker, "Dequeue loop started");

        while !shutdown.is_cancelled() {
            let pause = match self.run_once(&shutdown).await {
                Ok(Iteration::Deferred { job_id }) => {
                    debug!(worker, job_id = %job_id, "No free slot, waiting before the next dequeue");
                    Some(self.settings.slot_wait)
                }
                Ok(_) => None,
                Err(WorkerError::Store(e)) => {
                    error!(worker, error = %e, "Job store error, backing off");
                    Some(self.settings.error_backoff)
                }
                Err(e) => {
                    warn!(worker, error = %e, "Job attempt abandoned");
                    None
                }
            };

            if let Some(pause) = pause {
                tokio::select! {
                    _ = shutdown.cancelled() => {}
                    _ = tokio::time::sleep(pause) => {}
                }
            }
        }

        info!(worker, "Dequeue loop stopped");
    }

    pub async fn run_once(&self, shutdown: &CancellationToken) -> Result<Iteration, WorkerError> {
        let dequeued = tokio::select! {
            _ = shutdown.cancelled() => return Ok(Iteration::Idle),
            res = self.store.dequeue(self.settings.dequeue_timeout, self.settings.job_lease_ttl) => res?,
        };

        let claim = match dequeued {
            Dequeued::Empty => return Ok(Iteration::Idle),
            Dequeued::Busy { id } => {
                debug!(job_id = %id, "Skipping job running elsewhere");
                return Ok(Iteration::Skipped);
            }
            Dequeued::Discarded { id } => {
                debug!(job_id = %id, "Skipping stale job id");
                return Ok(Iteration::Skipped);
            }
            Dequeued::Claimed(claim) => claim,
        };

        let Some(_slot) = self.handler.reserve(&claim.job) else {
            let job_id = claim.job.id.clone();
            debug!(job_id = %job_id, kind = %claim.job.kind(), "No free slot for job, putting it back");
            self.store.put_back(claim).await?;
            return Ok(Iteration::Deferred { job_id });
        };

        let Claim { mut job, lease } = claim;
        if let Err(e) = self.store.start(&mut job).await {
            self.store.release_quietly(lease).await;
            return Err(e.into());
        }

        debug!(job_id = %job.id, kind = %job.kind(), attempt = job.attempt, "Working on job");
        let ctx = ExecutionContext::new(shutdown.child_token());

        match self.supervise(&job, &lease, &ctx).await {
            Ok(Ok(())) => {
                self.store.finalize(&mut job, lease, Outcome::Success).await?;
                Ok(Iteration::Completed { job_id: job.id })
            }
            Ok(Err(e)) => {
                let reason = format!("{e:#}");
                if ctx.is_cancelled() {
                    info!(job_id = %job.id, attempt = job.attempt, error = %reason, "Job interrupted");
                } else {
                    error!(job_id = %job.id, attempt = job.attempt, error = %reason, "Job failed");
                }
                self.store.finalize(&mut job, lease, Outcome::Failure).await?;
                Ok(Iteration::Failed { job_id: job.id })
            }
            Err(lost) => {
                self.store.finalize(&mut job, lease, Outcome::Failure).await?;
                Err(lost)
            }
        }
    }

    /// Drive the handler while refreshing the lease every interval. Consecutive
    /// refresh failures above the limit, or a lease that is definitely gone,
    /// cancel the handler and abandon the attempt once it has wound down or
    /// the cancel grace has run out.
    async fn supervise(
        &self,
        job: &Job,
        lease: &Lease,
        ctx: &ExecutionContext,
    ) -> Result<anyhow::Result<()>, WorkerError> {
        let every = self.settings.lease_refresh_interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + every, every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut work = self.handler.handle(job, ctx);
        let mut failures = 0u32;

        loop {
            tokio::select! {
                res = &mut work => return Ok(res),
                _ = ticker.tick() => {
                    match self.store.leases().refresh(lease, self.settings.job_lease_ttl).await {
                        Ok(()) => failures = failures.saturating_sub(1),
                        Err(LeaseError::Lost { key }) => {
                            error!(job_id = %job.id, key = %key, "Job lease lost, cancelling");
                            break;
                        }
                        Err(LeaseError::Store(e)) => {
                            failures += 1;
                            warn!(job_id = %job.id, failures, error = %e, "Failed to refresh job lease");
                            if failures >= self.settings.max_refresh_failures {
                                error!(job_id = %job.id, "Giving up on job after repeated lease refresh failures");
                                break;
                            }
                        }
                    }
                }
            }
        }

        ctx.cancel();
        match tokio::time::timeout(self.settings.cancel_grace, &mut work).await {
            Ok(res) => debug!(job_id = %job.id, ok = res.is_ok(), "Handler stopped after cancellation"),
            Err(_) => warn!(
                job_id = %job.id,
                grace = ?self.settings.cancel_grace,
                "Handler ignored cancellation, dropping it"
            ),
        }
        Err(WorkerError::LostLease { job_id: job.id.clone() })
    }
}
