use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::lease::Lease;
use super::model::{Job, JobKind};
use super::store::JobStore;
use crate::common::error::{LeaseError, StoreError};
use crate::config::settings::QueueSettings;

/// How many times a kind may be attempted, and how long a failed attempt
/// waits before recovery puts it back on the pending queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

/// Called when recovery gives up on a job. The record itself is left in the
/// store untouched.
#[async_trait]
pub trait DeadLetterHook: Send + Sync {
    async fn dead_letter(&self, job: &Job);
}

pub struct LogDeadLetter;

#[async_trait]
impl DeadLetterHook for LogDeadLetter {
    async fn dead_letter(&self, job: &Job) {
        warn!(
            job_id = %job.id,
            kind = %job.kind(),
            attempt = job.attempt,
            "Dropping job after too many attempts"
        );
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Someone holds the job's lease; it is legitimately running.
    SkippedLive,
    /// Record was finished or gone; only the in-flight entry was stale.
    Cleaned,
    Requeued,
    /// Orphaned, but still inside its kind's backoff window.
    Deferred,
    Dropped,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    pub scanned: usize,
    pub skipped_live: usize,
    pub cleaned: usize,
    pub requeued: usize,
    pub deferred: usize,
    pub dropped: usize,
    pub corrupt: usize,
}

impl RecoveryReport {
    fn record(&mut self, action: RecoveryAction) {
        match action {
            RecoveryAction::SkippedLive => self.skipped_live += 1,
            RecoveryAction::Cleaned => self.cleaned += 1,
            RecoveryAction::Requeued => self.requeued += 1,
            RecoveryAction::Deferred => self.deferred += 1,
            RecoveryAction::Dropped => self.dropped += 1,
        }
    }

    fn changed_anything(&self) -> bool {
        self.cleaned + self.requeued + self.dropped + self.corrupt > 0
    }
}

/// Periodic sweep of the in-flight queue that hands orphaned jobs back to
/// the pending queue, or drops them once their attempts are used up.
#[derive(Clone)]
pub struct RecoveryScanner {
    store: JobStore,
    settings: QueueSettings,
    default_policy: RetryPolicy,
    policies: HashMap<JobKind, RetryPolicy>,
    dead_letter: Arc<dyn DeadLetterHook>,
}

impl RecoveryScanner {
    pub fn new(store: JobStore, settings: QueueSettings) -> Self {
        Self {
            store,
            default_policy: RetryPolicy {
                max_attempts: settings.default_max_attempts,
                backoff: Duration::ZERO,
            },
            settings,
            policies: HashMap::new(),
            dead_letter: Arc::new(LogDeadLetter),
        }
    }

    pub fn with_policy(mut self, kind: JobKind, policy: RetryPolicy) -> Self {
        self.policies.insert(kind, policy);
        self
    }

    pub fn with_dead_letter(mut self, hook: Arc<dyn DeadLetterHook>) -> Self {
        self.dead_letter = hook;
        self
    }

    fn policy(&self, kind: JobKind) -> RetryPolicy {
        self.policies.get(&kind).copied().unwrap_or(self.default_policy)
    }

    pub async fn run(&self, shutdown: CancellationToken) {
        info!("Recovery scanner started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.settings.recovery_interval) => {}
            }

            match self.scan_once().await {
                Ok(Some(report)) if report.changed_anything() => info!(
                    scanned = report.scanned,
                    requeued = report.requeued,
                    dropped = report.dropped,
                    cleaned = report.cleaned,
                    corrupt = report.corrupt,
                    "Recovery scan finished"
                ),
                Ok(Some(report)) => debug!(scanned = report.scanned, "Recovery scan found nothing to do"),
                Ok(None) => debug!("Recovery scan already running elsewhere"),
                Err(e) => error!(error = %e, "Recovery scan aborted"),
            }
        }
        info!("Recovery scanner stopped");
    }

    /// One pass over a batch of in-flight ids. `Ok(None)` means another
    /// process holds the recovery lease.
    pub async fn scan_once(&self) -> Result<Option<RecoveryReport>, LeaseError> {
        let leases = self.store.leases();
        let Some(global) = leases
            .acquire(&self.store.keys().recovery_lock(), self.settings.recovery_lease_ttl)
            .await?
        else {
            return Ok(None);
        };

        let result = self.sweep(&global).await;
        self.store.release_quietly(global).await;
        result.map(Some)
    }

    async fn sweep(&self, global: &Lease) -> Result<RecoveryReport, LeaseError> {
        let ids = self.store.inflight_ids(self.settings.recovery_batch).await?;
        let mut report = RecoveryReport::default();

        for id in ids {
            self.store
                .leases()
                .refresh(global, self.settings.recovery_lease_ttl)
                .await?;

            report.scanned += 1;
            match self.recover(&id).await {
                Ok(action) => report.record(action),
                Err(e @ StoreError::Corrupt { .. }) => {
                    error!(job_id = %id, error = %e, "Skipping unreadable in-flight job");
                    report.corrupt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(report)
    }

    async fn recover(&self, id: &str) -> Result<RecoveryAction, StoreError> {
        let Some(lease) = self
            .store
            .leases()
            .acquire(&self.store.keys().job_lock(id), self.settings.recovery_job_lease_ttl)
            .await?
        else {
            return Ok(RecoveryAction::SkippedLive);
        };

        let result = self.reconcile(id).await;
        self.store.release_quietly(lease).await;
        result
    }

    async fn reconcile(&self, id: &str) -> Result<RecoveryAction, StoreError> {
        let job = match self.store.load(id).await? {
            Some(job) if !job.status.is_terminal() => job,
            _ => {
                self.store.remove_inflight(id).await?;
                return Ok(RecoveryAction::Cleaned);
            }
        };

        let policy = self.policy(job.kind());
        if job.attempt >= policy.max_attempts {
            self.store.remove_inflight(id).await?;
            self.dead_letter.dead_letter(&job).await;
            return Ok(RecoveryAction::Dropped);
        }

        if OffsetDateTime::now_utc() < job.status_time + policy.backoff {
            return Ok(RecoveryAction::Deferred);
        }

        self.store.requeue(id).await?;
        info!(job_id = %id, kind = %job.kind(), attempt = job.attempt, "Requeued orphaned job");
        Ok(RecoveryAction::Requeued)
    }
}
