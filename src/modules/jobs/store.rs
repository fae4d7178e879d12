use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};
use uuid::Uuid;

use super::lease::{Lease, LeaseManager};
use super::model::{Job, JobPayload, JobStatus};
use crate::common::error::StoreError;
use crate::infrastructure::store::{QueueBackend, WriteOutcome};

/// Store keys, scoped to one deployment by a namespace prefix.
#[derive(Debug, Clone)]
pub struct KeySpace {
    namespace: String,
}

impl KeySpace {
    pub fn new(namespace: &str) -> Self {
        Self {
            namespace: namespace.trim_end_matches(':').to_string(),
        }
    }

    fn scoped(&self, key: &str) -> String {
        if self.namespace.is_empty() {
            key.to_string()
        } else {
            format!("{}:{}", self.namespace, key)
        }
    }

    pub fn job(&self, id: &str) -> String {
        self.scoped(&format!("job:{id}"))
    }

    pub fn pending(&self) -> String {
        self.scoped("queue:pending")
    }

    pub fn inflight(&self) -> String {
        self.scoped("queue:inflight")
    }

    pub fn job_lock(&self, id: &str) -> String {
        self.scoped(&format!("lock:job:{id}"))
    }

    pub fn recovery_lock(&self) -> String {
        self.scoped("lock:recovery")
    }
}

/// A job this worker now owns, together with the lease proving it.
#[derive(Debug)]
pub struct Claim {
    pub job: Job,
    pub lease: Lease,
}

#[derive(Debug)]
pub enum Dequeued {
    /// Nothing arrived before the blocking timeout.
    Empty,
    /// Another worker holds the lease for this id.
    Busy { id: String },
    /// The id pointed at a missing or already finished record and was dropped
    /// from the in-flight queue.
    Discarded { id: String },
    Claimed(Claim),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
}

#[derive(Clone)]
pub struct JobStore {
    backend: Arc<dyn QueueBackend>,
    leases: LeaseManager,
    keys: KeySpace,
    done_retention: Duration,
}

impl JobStore {
    pub fn new(backend: Arc<dyn QueueBackend>, namespace: &str, done_retention: Duration) -> Self {
        Self {
            leases: LeaseManager::new(backend.clone()),
            backend,
            keys: KeySpace::new(namespace),
            done_retention,
        }
    }

    pub fn keys(&self) -> &KeySpace {
        &self.keys
    }

    pub fn leases(&self) -> &LeaseManager {
        &self.leases
    }

    /// Write a new Created record and push its id onto the pending queue in a
    /// single transaction.
    pub async fn enqueue(&self, payload: JobPayload) -> Result<Job, StoreError> {
        let job = Job::new(Uuid::new_v4().to_string(), payload);
        let key = self.keys.job(&job.id);
        let raw = serde_json::to_string(&job).map_err(|e| StoreError::corrupt(&key, e))?;

        self.backend
            .insert_and_push(&key, &raw, &self.keys.pending(), &job.id)
            .await?;
        Ok(job)
    }

    pub async fn load(&self, id: &str) -> Result<Option<Job>, StoreError> {
        let key = self.keys.job(id);
        match self.backend.get(&key).await? {
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|e| StoreError::corrupt(key, e)),
            None => Ok(None),
        }
    }

    /// Versioned write: succeeds only if nobody wrote the record since `job`
    /// was read, and bumps `job.version` when it does.
    async fn save(&self, job: &mut Job, ttl: Option<Duration>) -> Result<(), StoreError> {
        let key = self.keys.job(&job.id);
        let expected = job.version;
        job.version += 1;

        let written = match serde_json::to_string(&*job) {
            Ok(raw) => self.backend.put_if_version(&key, &raw, expected, ttl).await,
            Err(e) => Err(StoreError::corrupt(&key, e)),
        };

        match written {
            Ok(WriteOutcome::Written) => Ok(()),
            Ok(WriteOutcome::Conflict | WriteOutcome::Missing) => {
                job.version = expected;
                Err(StoreError::Conflict {
                    id: job.id.clone(),
                    expected,
                })
            }
            Err(e) => {
                job.version = expected;
                Err(e)
            }
        }
    }

    /// Move one id from pending to in-flight, take its lease and load the
    /// record. The job is not started yet; follow with [`JobStore::start`] or
    /// hand it back with [`JobStore::put_back`].
    pub async fn dequeue(&self, timeout: Duration, lease_ttl: Duration) -> Result<Dequeued, StoreError> {
        let Some(id) = self
            .backend
            .move_blocking(&self.keys.pending(), &self.keys.inflight(), timeout)
            .await?
        else {
            return Ok(Dequeued::Empty);
        };

        let Some(lease) = self.leases.acquire(&self.keys.job_lock(&id), lease_ttl).await? else {
            debug!(job_id = %id, "Job is locked by another worker");
            return Ok(Dequeued::Busy { id });
        };

        match self.claimable(&id).await {
            Ok(Some(job)) => Ok(Dequeued::Claimed(Claim { job, lease })),
            Ok(None) => {
                let removed = self.backend.remove(&self.keys.inflight(), &id).await;
                self.release_quietly(lease).await;
                removed?;
                Ok(Dequeued::Discarded { id })
            }
            Err(e) => {
                self.release_quietly(lease).await;
                Err(e)
            }
        }
    }

    async fn claimable(&self, id: &str) -> Result<Option<Job>, StoreError> {
        let Some(job) = self.load(id).await? else {
            warn!(job_id = %id, "Dequeued id has no job record");
            return Ok(None);
        };
        if !job.status.can_advance_to(JobStatus::InProgress) {
            debug!(job_id = %id, status = ?job.status, "Dequeued job is already finished");
            return Ok(None);
        }
        Ok(Some(job))
    }

    /// Mark a claimed job InProgress and count the attempt.
    pub async fn start(&self, job: &mut Job) -> Result<(), StoreError> {
        let mut started = job.clone();
        started.attempt += 1;
        started.set_status(JobStatus::InProgress);
        self.save(&mut started, None).await?;
        *job = started;
        Ok(())
    }

    /// Return a claimed but unstarted job to the pending queue and drop its
    /// lease. The attempt counter is untouched.
    pub async fn put_back(&self, claim: Claim) -> Result<(), StoreError> {
        let requeued = self.requeue(&claim.job.id).await;
        self.release_quietly(claim.lease).await;
        requeued
    }

    /// Record the outcome of an attempt and give up the lease.
    ///
    /// Success marks the job Done, kept for the retention window so a recovery
    /// scan racing with us still sees it, and drops it from the in-flight queue.
    /// Failure leaves the record InProgress for the recovery scanner to decide.
    pub async fn finalize(&self, job: &mut Job, lease: Lease, outcome: Outcome) -> Result<(), StoreError> {
        let result = match outcome {
            Outcome::Success => self.mark_done(job).await,
            Outcome::Failure => Ok(()),
        };
        self.release_quietly(lease).await;
        result
    }

    async fn mark_done(&self, job: &mut Job) -> Result<(), StoreError> {
        if job.status != JobStatus::Done {
            let mut done = job.clone();
            done.set_status(JobStatus::Done);

            match self.save(&mut done, Some(self.done_retention)).await {
                Ok(()) => *job = done,
                Err(StoreError::Conflict { id, expected }) => match self.load(&id).await? {
                    Some(current) if current.status == JobStatus::Done => *job = current,
                    None => {
                        debug!(job_id = %id, "Job record already gone at finalize");
                        job.set_status(JobStatus::Done);
                    }
                    Some(_) => return Err(StoreError::Conflict { id, expected }),
                },
                Err(e) => return Err(e),
            }
        }

        if let Err(e) = self.backend.remove(&self.keys.inflight(), &job.id).await {
            warn!(job_id = %job.id, error = %e, "Failed to drop finished job from in-flight queue");
        }
        Ok(())
    }

    #[cfg(test)]
    pub async fn pending_ids(&self, limit: usize) -> Result<Vec<String>, StoreError> {
        self.backend.range(&self.keys.pending(), limit).await
    }

    pub async fn inflight_ids(&self, limit: usize) -> Result<Vec<String>, StoreError> {
        self.backend.range(&self.keys.inflight(), limit).await
    }

    pub(crate) async fn remove_inflight(&self, id: &str) -> Result<(), StoreError> {
        self.backend.remove(&self.keys.inflight(), id).await
    }

    /// Back onto pending and off in-flight, atomically.
    pub(crate) async fn requeue(&self, id: &str) -> Result<(), StoreError> {
        self.backend
            .requeue(&self.keys.inflight(), &self.keys.pending(), id)
            .await
    }

    pub(crate) async fn release_quietly(&self, lease: Lease) {
        let key = lease.key().to_string();
        if let Err(e) = self.leases.release(lease).await {
            warn!(key = %key, error = %e, "Failed to release lease");
        }
    }
}
