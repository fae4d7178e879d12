use async_trait::async_trait;
use tokio::sync::OwnedSemaphorePermit;
use tokio_util::sync::CancellationToken;

use super::model::Job;

/// Handed to a running handler. Cancelled on shutdown or when the worker
/// loses the job's lease; long-running handlers should check it between
/// units of work.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    cancel: CancellationToken,
}

impl ExecutionContext {
    pub fn new(cancel: CancellationToken) -> Self {
        Self { cancel }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    pub(crate) fn cancel(&self) {
        self.cancel.cancel();
    }
}

/// Capacity held for one job from before it starts until it is finalized.
/// Dropping it frees the slot.
#[derive(Debug)]
pub struct Slot {
    _permit: Option<OwnedSemaphorePermit>,
}

impl Slot {
    pub fn unbounded() -> Self {
        Self { _permit: None }
    }

    pub fn from_permit(permit: OwnedSemaphorePermit) -> Self {
        Self { _permit: Some(permit) }
    }
}

#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Take capacity for `job` before it is started. `None` means its kind is
    /// saturated and the job should go back on the queue.
    fn reserve(&self, _job: &Job) -> Option<Slot> {
        Some(Slot::unbounded())
    }

    async fn handle(&self, job: &Job, ctx: &ExecutionContext) -> anyhow::Result<()>;
}

#[cfg(test)]
pub(crate) mod testing {
    use std::future::Future;

    use super::*;

    pub(crate) struct FnHandler<F>(F);

    pub(crate) fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
    where
        F: Fn(Job, ExecutionContext) -> Fut + Send + Sync,
        Fut: Future<Output = anyhow::Result<()>> + Send,
    {
        FnHandler(f)
    }

    #[async_trait]
    impl<F, Fut> JobHandler for FnHandler<F>
    where
        F: Fn(Job, ExecutionContext) -> Fut + Send + Sync,
        Fut: Future<Output = anyhow::Result<()>> + Send,
    {
        async fn handle(&self, job: &Job, ctx: &ExecutionContext) -> anyhow::Result<()> {
            (self.0)(job.clone(), ctx.clone()).await
        }
    }
}
