use async_trait::async_trait;
use serde::Serialize;

use super::http::ApiClient;
use super::{Command, EpisodeFile, Series, SonarrClient};
use crate::config::settings::CatalogEndpoint;
use crate::modules::transcode::policy::VideoFile;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RescanSeries {
    name: &'static str,
    series_id: i64,
}

#[derive(Clone)]
pub struct HttpSonarrClient {
    api: ApiClient,
}

impl HttpSonarrClient {
    pub fn new(endpoint: &CatalogEndpoint) -> anyhow::Result<Self> {
        Ok(Self {
            api: ApiClient::new(endpoint)?,
        })
    }
}

#[async_trait]
impl SonarrClient for HttpSonarrClient {
    async fn lookup_media_file(&self, episode_file_id: i64) -> anyhow::Result<Option<VideoFile>> {
        let file: Option<EpisodeFile> = self
            .api
            .get_optional(&format!("episodefile/{episode_file_id}"), &[])
            .await?;
        Ok(file.map(|f| f.video_file()))
    }

    async fn list_series(&self) -> anyhow::Result<Vec<Series>> {
        self.api.get("series", &[]).await
    }

    async fn list_episode_files(&self, series_id: i64) -> anyhow::Result<Vec<EpisodeFile>> {
        self.api
            .get("episodefile", &[("seriesId", series_id.to_string())])
            .await
    }

    async fn rescan(&self, series_id: i64) -> anyhow::Result<Command> {
        let body = RescanSeries {
            name: "RescanSeries",
            series_id,
        };
        self.api.post("command", &body).await
    }

    async fn command_status(&self, command_id: i64) -> anyhow::Result<Command> {
        self.api.get(&format!("command/{command_id}"), &[]).await
    }
}
