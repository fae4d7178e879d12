use tracing::info;

use super::model::{JobPayload, TranscodeJob};
use super::store::JobStore;
use crate::common::error::StoreError;

/// Entry point for producers (library scanners, webhooks, follow-up jobs).
/// Failures are returned to the caller, who decides whether to retry.
#[derive(Clone)]
pub struct Enqueuer {
    store: JobStore,
}

impl Enqueuer {
    pub fn new(store: JobStore) -> Self {
        Self { store }
    }

    pub async fn enqueue(&self, payload: JobPayload) -> Result<String, StoreError> {
        let kind = payload.kind();
        let job = self.store.enqueue(payload).await?;
        info!(job_id = %job.id, kind = %kind, "Enqueued job");
        Ok(job.id)
    }

    pub async fn enqueue_transcode(&self, job: TranscodeJob) -> Result<String, StoreError> {
        self.enqueue(JobPayload::Transcode(job)).await
    }
}
