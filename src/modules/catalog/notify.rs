//! Follow-up jobs that ask a catalog service to rescan after a conversion.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use async_trait::async_trait;
use tracing::{error, info, warn};

use crate::infrastructure::catalog::{Command, RadarrClient, SonarrClient};
use crate::modules::jobs::handler::{ExecutionContext, JobHandler};
use crate::modules::jobs::model::{Job, JobPayload};

/// How long to wait for a rescan command to report completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandPolling {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for CommandPolling {
    fn default() -> Self {
        Self {
            attempts: 5,
            delay: Duration::from_secs(15),
        }
    }
}

impl CommandPolling {
    /// Poll `check` until the command completes or attempts run out. Running
    /// out is only logged: the rescan was accepted and will finish on its own.
    async fn wait_for<F, Fut>(
        &self,
        job_id: &str,
        command: &Command,
        ctx: &ExecutionContext,
        check: F,
    ) -> anyhow::Result<()>
    where
        F: Fn(i64) -> Fut,
        Fut: Future<Output = anyhow::Result<Command>>,
    {
        for attempt in 1..=self.attempts {
            match check(command.id).await {
                Ok(status) if status.is_complete() => {
                    info!(job_id, command_id = command.id, "Rescan complete");
                    return Ok(());
                }
                Ok(status) => info!(job_id, command_id = command.id, state = %status.state, "Rescan not complete yet"),
                Err(e) => {
                    let reason = format!("{e:#}");
                    error!(job_id, command_id = command.id, error = %reason, "Error checking status of command");
                }
            }

            if attempt < self.attempts {
                tokio::select! {
                    _ = ctx.cancelled() => bail!("stopped waiting for command {} on shutdown", command.id),
                    _ = tokio::time::sleep(self.delay) => {}
                }
            }
        }

        warn!(job_id, command_id = command.id, attempts = self.attempts, "Gave up waiting for rescan");
        Ok(())
    }
}

pub struct MovieUpdateHandler {
    radarr: Arc<dyn RadarrClient>,
    polling: CommandPolling,
}

impl MovieUpdateHandler {
    pub fn new(radarr: Arc<dyn RadarrClient>) -> Self {
        Self {
            radarr,
            polling: CommandPolling::default(),
        }
    }

    #[cfg(test)]
    pub fn polling(mut self, polling: CommandPolling) -> Self {
        self.polling = polling;
        self
    }
}

#[async_trait]
impl JobHandler for MovieUpdateHandler {
    async fn handle(&self, job: &Job, ctx: &ExecutionContext) -> anyhow::Result<()> {
        let JobPayload::UpdateMovie { movie_id } = job.payload else {
            bail!("movie update handler cannot run {} job {}", job.kind(), job.id);
        };

        let command = self
            .radarr
            .rescan(movie_id)
            .await
            .with_context(|| format!("error rescanning movie {movie_id}"))?;

        let radarr = self.radarr.as_ref();
        self.polling
            .wait_for(&job.id, &command, ctx, move |id| radarr.command_status(id))
            .await
    }
}

pub struct SeriesUpdateHandler {
    sonarr: Arc<dyn SonarrClient>,
    polling: CommandPolling,
}

impl SeriesUpdateHandler {
    pub fn new(sonarr: Arc<dyn SonarrClient>) -> Self {
        Self {
            sonarr,
            polling: CommandPolling::default(),
        }
    }

    #[cfg(test)]
    pub fn polling(mut self, polling: CommandPolling) -> Self {
        self.polling = polling;
        self
    }
}

#[async_trait]
impl JobHandler for SeriesUpdateHandler {
    async fn handle(&self, job: &Job, ctx: &ExecutionContext) -> anyhow::Result<()> {
        let JobPayload::UpdateSeries { series_id } = job.payload else {
            bail!("series update handler cannot run {} job {}", job.kind(), job.id);
        };

        let command = self
            .sonarr
            .rescan(series_id)
            .await
            .with_context(|| format!("error rescanning series {series_id}"))?;

        let sonarr = self.sonarr.as_ref();
        self.polling
            .wait_for(&job.id, &command, ctx, move |id| sonarr.command_status(id))
            .await
    }
}
