use crate::config::settings::AppConfig;
use crate::workers::metrics::JobMetrics;

#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub metrics: JobMetrics,
}

impl AppState {
    pub fn new(config: AppConfig, metrics: JobMetrics) -> Self {
        Self { config, metrics }
    }
}
