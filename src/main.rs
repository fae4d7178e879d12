use std::sync::Arc;

use dotenvy::dotenv;
use futures_util::future::join_all;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::env::{self, EnvKey};
use crate::config::settings::AppConfig;
use crate::infrastructure::catalog::{HttpRadarrClient, HttpSonarrClient, RadarrClient, SonarrClient};
use crate::infrastructure::redis::client::RedisService;
use crate::infrastructure::store::{MemoryBackend, QueueBackend, RedisBackend};
use crate::infrastructure::transcoder::FfmpegTranscoder;
use crate::modules::catalog::notify::{MovieUpdateHandler, SeriesUpdateHandler};
use crate::modules::catalog::scanner::{MovieScanner, TvScanner, run_periodically};
use crate::modules::jobs::enqueuer::Enqueuer;
use crate::modules::jobs::model::JobKind;
use crate::modules::jobs::store::JobStore;
use crate::modules::transcode::handler::TranscodeHandler;
use crate::state::AppState;
use crate::workers::metrics::JobMetrics;
use crate::workers::middleware::{LoggingMiddleware, MetricsMiddleware};
use crate::workers::pool::{JobOptions, WorkerPool};

mod app;
mod common;
mod config;
mod infrastructure;
mod modules;
mod routes;
mod state;
mod workers;

const MEMORY_BACKEND: &str = "memory://";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    init_tracing();

    info!("Starting media worker...");

    let config = match AppConfig::new() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Invalid configuration");
            std::process::exit(1);
        }
    };

    let backend: Arc<dyn QueueBackend> = if config.redis_address.starts_with(MEMORY_BACKEND) {
        warn!("Using in-memory job store, queued jobs will not survive a restart");
        Arc::new(MemoryBackend::new())
    } else {
        let redis = RedisService::new(&config.redis_address).await?;
        Arc::new(RedisBackend::new(redis, config.queue.op_timeout))
    };

    let store = JobStore::new(backend, &config.namespace, config.queue.done_retention);
    let enqueuer = Enqueuer::new(store.clone());
    let metrics = JobMetrics::new()?;
    let radarr: Arc<dyn RadarrClient> = Arc::new(HttpRadarrClient::new(&config.radarr)?);
    let sonarr: Arc<dyn SonarrClient> = Arc::new(HttpSonarrClient::new(&config.sonarr)?);

    let shutdown = CancellationToken::new();
    let mut tasks: Vec<JoinHandle<()>> = Vec::new();

    if config.enable_worker {
        let transcoder = Arc::new(FfmpegTranscoder::new(
            config.ffmpeg_path.clone(),
            config.ffprobe_path.clone(),
        ));
        let transcode = TranscodeHandler::new(transcoder, enqueuer.clone())
            .keep_source(config.keep_source)
            .catalog(radarr.clone(), sonarr.clone());

        let pool = WorkerPool::builder(store.clone(), config.queue.clone())
            .worker_count(config.worker_count)
            .middleware(LoggingMiddleware)
            .middleware(MetricsMiddleware::new(metrics.clone()))
            .dead_letter(Arc::new(metrics.clone()))
            .job(JobKind::Transcode, JobOptions::transcode(), Arc::new(transcode))
            .job(
                JobKind::UpdateMovie,
                JobOptions::catalog_update(),
                Arc::new(MovieUpdateHandler::new(radarr.clone())),
            )
            .job(
                JobKind::UpdateSeries,
                JobOptions::catalog_update(),
                Arc::new(SeriesUpdateHandler::new(sonarr.clone())),
            )
            .build();
        tasks.push(tokio::spawn(pool.run(shutdown.clone())));
    }

    if config.enable_radarr_scanner {
        let scanner = Arc::new(MovieScanner::new(radarr.clone(), enqueuer.clone()));
        tasks.push(tokio::spawn(run_periodically(scanner, config.scan_interval, shutdown.clone())));
    }

    if config.enable_sonarr_scanner {
        let scanner = Arc::new(TvScanner::new(sonarr.clone(), enqueuer.clone()));
        tasks.push(tokio::spawn(run_periodically(scanner, config.scan_interval, shutdown.clone())));
    }

    if config.enable_web {
        let state = AppState::new(config.clone(), metrics.clone());
        let shutdown = shutdown.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = app::serve(state, shutdown).await {
                let reason = format!("{e:#}");
                error!(error = %reason, "Web server stopped");
            }
        }));
    }

    if tasks.is_empty() {
        warn!("Nothing to run, enable at least one of ENABLE_WORKER, ENABLE_WEB, ENABLE_RADARR_SCANNER, ENABLE_SONARR_SCANNER");
        return Ok(());
    }

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received"),
        Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
    }
    shutdown.cancel();

    for result in join_all(tasks).await {
        if let Err(e) = result {
            error!(error = %e, "Task ended abnormally");
        }
    }
    info!("Shutdown complete");
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if env::get_flag(EnvKey::PrettyLog) {
        builder.pretty().init();
    } else {
        builder.compact().init();
    }
}
