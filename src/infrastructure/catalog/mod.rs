//! Clients for the movie (Radarr) and TV (Sonarr) catalog services.

use std::path::Path;

use async_trait::async_trait;
use serde::Deserialize;

use crate::modules::transcode::policy::VideoFile;

mod http;
pub mod radarr;
pub mod sonarr;

pub use self::radarr::HttpRadarrClient;
pub use self::sonarr::HttpSonarrClient;

/// A queued or running catalog command, e.g. a rescan.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Command {
    pub id: i64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub state: String,
}

impl Command {
    pub fn is_complete(&self) -> bool {
        self.state.contains("complete")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MovieMediaInfo {
    #[serde(default)]
    pub container_format: String,
    #[serde(default)]
    pub video_format: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MovieFile {
    pub relative_path: String,
    #[serde(default)]
    pub media_info: MovieMediaInfo,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Movie {
    pub id: i64,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub downloaded: bool,
    #[serde(default)]
    pub movie_file: Option<MovieFile>,
}

impl Movie {
    /// `None` until the movie has a file on disk.
    pub fn video_file(&self) -> Option<VideoFile> {
        let file = self.movie_file.as_ref()?;
        Some(VideoFile {
            file_path: Path::new(&self.path).join(&file.relative_path),
            container_format: file.media_info.container_format.clone(),
            video_codec: file.media_info.video_format.clone(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Series {
    pub id: i64,
    #[serde(default)]
    pub title: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EpisodeMediaInfo {
    #[serde(default)]
    pub video_codec: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EpisodeFile {
    pub id: i64,
    pub series_id: i64,
    pub path: String,
    #[serde(default)]
    pub media_info: EpisodeMediaInfo,
}

impl EpisodeFile {
    /// Sonarr doesn't report a container, so only the extension and codec decide.
    pub fn video_file(&self) -> VideoFile {
        VideoFile {
            file_path: self.path.clone().into(),
            container_format: String::new(),
            video_codec: self.media_info.video_codec.clone(),
        }
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RadarrClient: Send + Sync {
    /// File currently attached to a movie. `None` for an unknown movie or one
    /// without a file.
    async fn lookup_media_file(&self, movie_id: i64) -> anyhow::Result<Option<VideoFile>>;
    async fn list_movies(&self) -> anyhow::Result<Vec<Movie>>;
    async fn rescan(&self, movie_id: i64) -> anyhow::Result<Command>;
    async fn command_status(&self, command_id: i64) -> anyhow::Result<Command>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SonarrClient: Send + Sync {
    async fn lookup_media_file(&self, episode_file_id: i64) -> anyhow::Result<Option<VideoFile>>;
    async fn list_series(&self) -> anyhow::Result<Vec<Series>>;
    async fn list_episode_files(&self, series_id: i64) -> anyhow::Result<Vec<EpisodeFile>>;
    async fn rescan(&self, series_id: i64) -> anyhow::Result<Command>;
    async fn command_status(&self, command_id: i64) -> anyhow::Result<Command>;
}
