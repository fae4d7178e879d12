use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::join_all;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::middleware::{Middleware, Next};
use crate::common::error::WorkerError;
use crate::config::settings::QueueSettings;
use crate::modules::jobs::dequeue::DequeueLoop;
use crate::modules::jobs::handler::{ExecutionContext, JobHandler, Slot};
use crate::modules::jobs::model::{Job, JobKind};
use crate::modules::jobs::recovery::{DeadLetterHook, RecoveryScanner, RetryPolicy};
use crate::modules::jobs::store::JobStore;

/// Per-kind execution policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobOptions {
    /// Lower runs first where the backend can order by it; informational otherwise.
    pub priority: u32,
    pub max_concurrency: usize,
    pub max_attempts: u32,
    /// Minimum wait before recovery retries a failed attempt.
    pub backoff: Duration,
}

impl JobOptions {
    pub fn transcode() -> Self {
        Self {
            priority: 1,
            max_concurrency: 1,
            max_attempts: 3,
            backoff: Duration::ZERO,
        }
    }

    pub fn catalog_update() -> Self {
        Self {
            priority: 2,
            max_concurrency: 5,
            max_attempts: 3,
            backoff: Duration::ZERO,
        }
    }
}

struct Route {
    options: JobOptions,
    handler: Arc<dyn JobHandler>,
    permits: Arc<Semaphore>,
}

/// Dispatches a job to the handler registered for its kind, through the
/// middleware chain. Each kind has its own fixed number of slots; a worker
/// takes one before starting the job and never waits for it.
pub struct Router {
    routes: HashMap<JobKind, Route>,
    middleware: Vec<Arc<dyn Middleware>>,
}

#[async_trait]
impl JobHandler for Router {
    fn reserve(&self, job: &Job) -> Option<Slot> {
        match self.routes.get(&job.kind()) {
            Some(route) => route.permits.clone().try_acquire_owned().ok().map(Slot::from_permit),
            // Unknown kinds still run so that `handle` can fail them.
            None => Some(Slot::unbounded()),
        }
    }

    async fn handle(&self, job: &Job, ctx: &ExecutionContext) -> anyhow::Result<()> {
        let kind = job.kind();
        let route = self.routes.get(&kind).ok_or(WorkerError::NoHandler(kind))?;

        Next::new(&self.middleware, route.handler.as_ref())
            .run(job, ctx)
            .await
    }
}

pub struct WorkerPoolBuilder {
    store: JobStore,
    settings: QueueSettings,
    worker_count: usize,
    routes: HashMap<JobKind, Route>,
    middleware: Vec<Arc<dyn Middleware>>,
    dead_letter: Option<Arc<dyn DeadLetterHook>>,
}

impl WorkerPoolBuilder {
    pub fn worker_count(mut self, count: usize) -> Self {
        self.worker_count = count.max(1);
        self
    }

    /// Middleware runs in registration order, outermost first.
    pub fn middleware(mut self, middleware: impl Middleware + 'static) -> Self {
        self.middleware.push(Arc::new(middleware));
        self
    }

    pub fn job(mut self, kind: JobKind, options: JobOptions, handler: Arc<dyn JobHandler>) -> Self {
        let permits = Arc::new(Semaphore::new(options.max_concurrency.max(1)));
        self.routes.insert(
            kind,
            Route {
                options,
                handler,
                permits,
            },
        );
        self
    }

    pub fn dead_letter(mut self, hook: Arc<dyn DeadLetterHook>) -> Self {
        self.dead_letter = Some(hook);
        self
    }

    pub fn build(self) -> WorkerPool {
        let mut recovery = RecoveryScanner::new(self.store.clone(), self.settings.clone());
        for (kind, route) in &self.routes {
            info!(
                kind = %kind,
                priority = route.options.priority,
                max_concurrency = route.options.max_concurrency,
                max_attempts = route.options.max_attempts,
                "Registered job"
            );
            recovery = recovery.with_policy(
                *kind,
                RetryPolicy {
                    max_attempts: route.options.max_attempts,
                    backoff: route.options.backoff,
                },
            );
        }
        if let Some(hook) = self.dead_letter {
            recovery = recovery.with_dead_letter(hook);
        }

        let router = Arc::new(Router {
            routes: self.routes,
            middleware: self.middleware,
        });

        WorkerPool {
            dequeue: DequeueLoop::new(self.store, router, self.settings),
            recovery,
            worker_count: self.worker_count,
        }
    }
}

pub struct WorkerPool {
    dequeue: DequeueLoop,
    recovery: RecoveryScanner,
    worker_count: usize,
}

impl WorkerPool {
    pub fn builder(store: JobStore, settings: QueueSettings) -> WorkerPoolBuilder {
        WorkerPoolBuilder {
            store,
            settings,
            worker_count: 1,
            routes: HashMap::new(),
            middleware: Vec::new(),
            dead_letter: None,
        }
    }

    #[cfg(test)]
    pub fn recovery(&self) -> &RecoveryScanner {
        &self.recovery
    }

    /// Run every dequeue loop plus the recovery scanner until `shutdown`
    /// fires, then wait for all of them to stop.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(workers = self.worker_count, "Starting worker pool");

        let mut tasks = Vec::with_capacity(self.worker_count + 1);
        for worker in 0..self.worker_count {
            let dequeue = self.dequeue.clone();
            let shutdown = shutdown.clone();
            tasks.push(tokio::spawn(async move { dequeue.run(worker, shutdown).await }));
        }
        let recovery = self.recovery.clone();
        let recovery_shutdown = shutdown.clone();
        tasks.push(tokio::spawn(async move { recovery.run(recovery_shutdown).await }));

        for result in join_all(tasks).await {
            if let Err(e) = result {
                error!(error = %e, "Worker task ended abnormally");
            }
        }
        info!("Worker pool stopped");
    }
}
