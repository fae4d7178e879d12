use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use super::metrics::JobMetrics;
use crate::modules::jobs::handler::{ExecutionContext, JobHandler};
use crate::modules::jobs::model::Job;

/// Wraps every handler invocation. Call `next.run` to continue the chain.
#[async_trait]
pub trait Middleware: Send + Sync {
    async fn handle(&self, job: &Job, ctx: &ExecutionContext, next: Next<'_>) -> anyhow::Result<()>;
}

/// The rest of the chain, ending in the job's handler.
pub struct Next<'a> {
    middleware: &'a [Arc<dyn Middleware>],
    handler: &'a dyn JobHandler,
}

impl<'a> Next<'a> {
    pub(crate) fn new(middleware: &'a [Arc<dyn Middleware>], handler: &'a dyn JobHandler) -> Self {
        Self { middleware, handler }
    }

    pub async fn run(self, job: &Job, ctx: &ExecutionContext) -> anyhow::Result<()> {
        match self.middleware.split_first() {
            Some((first, rest)) => first.handle(job, ctx, Next::new(rest, self.handler)).await,
            None => self.handler.handle(job, ctx).await,
        }
    }
}

pub struct LoggingMiddleware;

#[async_trait]
impl Middleware for LoggingMiddleware {
    async fn handle(&self, job: &Job, ctx: &ExecutionContext, next: Next<'_>) -> anyhow::Result<()> {
        info!(job_id = %job.id, kind = %job.kind(), attempt = job.attempt, "Starting job");
        next.run(job, ctx).await
    }
}

pub struct MetricsMiddleware {
    metrics: JobMetrics,
}

impl MetricsMiddleware {
    pub fn new(metrics: JobMetrics) -> Self {
        Self { metrics }
    }
}

#[async_trait]
impl Middleware for MetricsMiddleware {
    async fn handle(&self, job: &Job, ctx: &ExecutionContext, next: Next<'_>) -> anyhow::Result<()> {
        let timer = self.metrics.track(job.kind().as_str());
        let result = next.run(job, ctx).await;
        timer.finish(result.is_ok());
        result
    }
}
