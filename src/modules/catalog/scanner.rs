//! Periodic walks over the catalog libraries that enqueue a transcode for
//! every file in the wrong format.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::infrastructure::catalog::{RadarrClient, SonarrClient};
use crate::modules::jobs::enqueuer::Enqueuer;
use crate::modules::jobs::model::{TranscodeJob, TranscodeType};
use crate::modules::transcode::policy::{TranscodeDecision, VideoFile, should_transcode};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ScanSummary {
    pub checked: usize,
    pub enqueued: usize,
    pub failed: usize,
}

#[async_trait]
pub trait LibraryScanner: Send + Sync {
    fn name(&self) -> &'static str;

    async fn scan(&self) -> anyhow::Result<ScanSummary>;
}

/// Scan once straight away, then every `interval` until shutdown.
pub async fn run_periodically(scanner: Arc<dyn LibraryScanner>, interval: Duration, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    info!(scanner = scanner.name(), every_secs = interval.as_secs(), "Library scanner started");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        match scanner.scan().await {
            Ok(summary) => info!(
                scanner = scanner.name(),
                checked = summary.checked,
                enqueued = summary.enqueued,
                failed = summary.failed,
                "Library scan finished"
            ),
            Err(e) => {
                let reason = format!("{e:#}");
                error!(scanner = scanner.name(), error = %reason, "Library scan failed");
            }
        }
    }
    info!(scanner = scanner.name(), "Library scanner stopped");
}

/// Decide and enqueue one file. Per-file problems are logged and counted,
/// never returned, so one bad file can't stop a library walk.
async fn consider(
    enqueuer: &Enqueuer,
    summary: &mut ScanSummary,
    transcode_type: TranscodeType,
    video_file: VideoFile,
    video_id: i64,
    file_id: Option<i64>,
) {
    summary.checked += 1;
    let reason = match should_transcode(&video_file) {
        Ok(TranscodeDecision::Keep) => return,
        Ok(TranscodeDecision::Convert { reason }) => reason,
        Err(e) => {
            error!(path = %video_file.file_path.display(), error = %e, "Failed to determine if we should transcode");
            summary.failed += 1;
            return;
        }
    };

    debug!(path = %video_file.file_path.display(), reason = %reason, "Found file in wrong format");
    let path = video_file.file_path.clone();
    let job = TranscodeJob {
        transcode_type,
        video_file,
        video_id,
        file_id,
    };
    match enqueuer.enqueue_transcode(job).await {
        Ok(_) => summary.enqueued += 1,
        Err(e) => {
            error!(path = %path.display(), error = %e, "Failed to enqueue transcode");
            summary.failed += 1;
        }
    }
}

pub struct MovieScanner {
    radarr: Arc<dyn RadarrClient>,
    enqueuer: Enqueuer,
}

impl MovieScanner {
    pub fn new(radarr: Arc<dyn RadarrClient>, enqueuer: Enqueuer) -> Self {
        Self { radarr, enqueuer }
    }
}

#[async_trait]
impl LibraryScanner for MovieScanner {
    fn name(&self) -> &'static str {
        "radarr"
    }

    async fn scan(&self) -> anyhow::Result<ScanSummary> {
        let movies = self.radarr.list_movies().await?;
        let mut summary = ScanSummary::default();

        for movie in movies.iter().filter(|m| m.downloaded) {
            if let Some(file) = movie.video_file() {
                consider(&self.enqueuer, &mut summary, TranscodeType::Movie, file, movie.id, None).await;
            }
        }
        Ok(summary)
    }
}

pub struct TvScanner {
    sonarr: Arc<dyn SonarrClient>,
    enqueuer: Enqueuer,
}

impl TvScanner {
    pub fn new(sonarr: Arc<dyn SonarrClient>, enqueuer: Enqueuer) -> Self {
        Self { sonarr, enqueuer }
    }
}

#[async_trait]
impl LibraryScanner for TvScanner {
    fn name(&self) -> &'static str {
        "sonarr"
    }

    async fn scan(&self) -> anyhow::Result<ScanSummary> {
        let series = self.sonarr.list_series().await?;
        let mut summary = ScanSummary::default();

        for show in &series {
            debug!(series_id = show.id, title = %show.title, "Scanning series");
            let files = match self.sonarr.list_episode_files(show.id).await {
                Ok(files) => files,
                Err(e) => {
                    error!(series_id = show.id, title = %show.title, error = %e, "Got error for series");
                    summary.failed += 1;
                    continue;
                }
            };
            for file in files {
                consider(
                    &self.enqueuer,
                    &mut summary,
                    TranscodeType::Tv,
                    file.video_file(),
                    file.series_id,
                    Some(file.id),
                )
                .await;
            }
        }
        Ok(summary)
    }
}
