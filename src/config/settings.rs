use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::common::error::ConfigError;
use crate::config::env::{self, EnvKey};

#[derive(Clone, Debug, Deserialize)]
pub struct CatalogEndpoint {
    pub base_url: String,
    pub api_key: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct AppConfig {
    pub server_port: u16,
    pub redis_address: String,
    pub namespace: String,
    pub worker_count: usize,
    pub enable_web: bool,
    pub enable_worker: bool,
    pub enable_radarr_scanner: bool,
    pub enable_sonarr_scanner: bool,
    pub scan_interval: Duration,
    pub ffmpeg_path: PathBuf,
    pub ffprobe_path: PathBuf,
    pub radarr: CatalogEndpoint,
    pub sonarr: CatalogEndpoint,
    /// Keep the source file after a successful conversion.
    pub keep_source: bool,
    pub queue: QueueSettings,
}

impl AppConfig {
    pub fn new() -> Result<Self, ConfigError> {
        let redis_address = env::get(EnvKey::RedisAddress)
            .ok()
            .filter(|v| !v.trim().is_empty())
            .ok_or(ConfigError::Missing(EnvKey::RedisAddress.as_str()))?;

        Ok(Self {
            server_port: env::get_parsed(EnvKey::ServerPort, 8080),
            redis_address,
            namespace: env::get_or(EnvKey::JobQueueNamespace, "media-web"),
            worker_count: env::get_parsed(EnvKey::WorkerCount, 20usize).max(1),
            enable_web: env::get_flag(EnvKey::EnableWeb),
            enable_worker: env::get_flag(EnvKey::EnableWorker),
            enable_radarr_scanner: env::get_flag(EnvKey::EnableRadarrScanner),
            enable_sonarr_scanner: env::get_flag(EnvKey::EnableSonarrScanner),
            scan_interval: Duration::from_secs(env::get_parsed(EnvKey::ScanIntervalSecs, 86_400)),
            ffmpeg_path: PathBuf::from(env::get_or(EnvKey::FfmpegPath, "/usr/bin/ffmpeg")),
            ffprobe_path: PathBuf::from(env::get_or(EnvKey::FfprobePath, "/usr/bin/ffprobe")),
            radarr: CatalogEndpoint {
                base_url: env::get_or(EnvKey::RadarrBaseEndpoint, ""),
                api_key: env::get_or(EnvKey::RadarrApiKey, ""),
            },
            sonarr: CatalogEndpoint {
                base_url: env::get_or(EnvKey::SonarrBaseEndpoint, ""),
                api_key: env::get_or(EnvKey::SonarrApiKey, ""),
            },
            keep_source: env::get_flag(EnvKey::Local),
            queue: QueueSettings::default(),
        })
    }
}

/// Timing and sizing knobs for the job queue, dequeue loops and recovery scan.
#[derive(Clone, Debug, Deserialize)]
pub struct QueueSettings {
    /// Upper bound on a single blocking wait for the pending queue.
    pub dequeue_timeout: Duration,
    /// Bound on every non-blocking store round trip.
    pub op_timeout: Duration,
    pub job_lease_ttl: Duration,
    pub lease_refresh_interval: Duration,
    pub max_refresh_failures: u32,
    /// Sleep after a store error before the next dequeue attempt.
    pub error_backoff: Duration,
    /// How long a cancelled handler gets to clean up before it is dropped.
    pub cancel_grace: Duration,
    /// Sleep after handing back a job whose kind had no free slot.
    pub slot_wait: Duration,
    pub recovery_interval: Duration,
    pub recovery_batch: usize,
    pub recovery_lease_ttl: Duration,
    pub recovery_job_lease_ttl: Duration,
    /// How long a Done record stays readable before the store expires it.
    pub done_retention: Duration,
    pub default_max_attempts: u32,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            dequeue_timeout: Duration::from_secs(60),
            op_timeout: Duration::from_secs(5),
            job_lease_ttl: Duration::from_secs(5 * 60),
            lease_refresh_interval: Duration::from_secs(60),
            max_refresh_failures: 3,
            error_backoff: Duration::from_secs(5),
            cancel_grace: Duration::from_secs(30),
            slot_wait: Duration::from_secs(1),
            recovery_interval: Duration::from_secs(60),
            recovery_batch: 100,
            recovery_lease_ttl: Duration::from_secs(5 * 60),
            recovery_job_lease_ttl: Duration::from_secs(60),
            done_retention: Duration::from_secs(72 * 60 * 60),
            default_max_attempts: 3,
        }
    }
}
