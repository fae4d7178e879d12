use std::env;
use std::str::FromStr;

#[derive(Debug, Clone, Copy)]
pub enum EnvKey {
    ServerPort,
    RedisAddress,
    JobQueueNamespace,
    WorkerCount,
    EnableWeb,
    EnableWorker,
    EnableRadarrScanner,
    EnableSonarrScanner,
    ScanIntervalSecs,
    FfmpegPath,
    FfprobePath,
    RadarrBaseEndpoint,
    RadarrApiKey,
    SonarrBaseEndpoint,
    SonarrApiKey,
    Local,
    PrettyLog,
}

impl EnvKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvKey::ServerPort => "APP_PORT",
            EnvKey::RedisAddress => "REDIS_ADDRESS",
            EnvKey::JobQueueNamespace => "JOB_QUEUE_NAMESPACE",
            EnvKey::WorkerCount => "WORKER_COUNT",
            EnvKey::EnableWeb => "ENABLE_WEB",
            EnvKey::EnableWorker => "ENABLE_WORKER",
            EnvKey::EnableRadarrScanner => "ENABLE_RADARR_SCANNER",
            EnvKey::EnableSonarrScanner => "ENABLE_SONARR_SCANNER",
            EnvKey::ScanIntervalSecs => "SCAN_INTERVAL_SECS",
            EnvKey::FfmpegPath => "FFMPEG_PATH",
            EnvKey::FfprobePath => "FFPROBE_PATH",
            EnvKey::RadarrBaseEndpoint => "RADARR_BASE_ENDPOINT",
            EnvKey::RadarrApiKey => "RADARR_API_KEY",
            EnvKey::SonarrBaseEndpoint => "SONARR_BASE_ENDPOINT",
            EnvKey::SonarrApiKey => "SONARR_API_KEY",
            EnvKey::Local => "LOCAL",
            EnvKey::PrettyLog => "ENABLE_PRETTYLOG",
        }
    }
}

pub fn get(key: EnvKey) -> Result<String, env::VarError> {
    env::var(key.as_str())
}

pub fn get_or(key: EnvKey, default: &str) -> String {
    env::var(key.as_str()).unwrap_or_else(|_| default.to_string())
}

pub fn get_parsed<T: FromStr>(key: EnvKey, default: T) -> T {
    match get(key) {
        Ok(val) => val.parse::<T>().unwrap_or(default),
        Err(_) => default,
    }
}

/// Feature switches are on only for the literal value `true`.
pub fn get_flag(key: EnvKey) -> bool {
    get(key).map(|v| v == "true").unwrap_or(false)
}
