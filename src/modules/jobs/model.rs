use std::fmt;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::modules::transcode::policy::VideoFile;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobStatus {
    Created,
    InProgress,
    Done,
    Errored,
}

impl JobStatus {
    /// Status only ever moves forward. A requeued job is claimed again while
    /// still InProgress, so InProgress -> InProgress is allowed.
    pub fn can_advance_to(self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Created, JobStatus::InProgress)
                | (JobStatus::InProgress, JobStatus::InProgress)
                | (JobStatus::InProgress, JobStatus::Done)
                | (JobStatus::InProgress, JobStatus::Errored)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Errored)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TranscodeType {
    Movie,
    #[serde(rename = "TV")]
    Tv,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscodeJob {
    pub transcode_type: TranscodeType,
    pub video_file: VideoFile,
    /// Catalog entity to rescan once the file is converted: the movie id for
    /// movies, the series id for TV.
    pub video_id: i64,
    /// Catalog id of the file itself. Sonarr resolves episode files by it;
    /// movies are looked up through `video_id`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum JobPayload {
    #[serde(rename = "transcode-job")]
    Transcode(TranscodeJob),
    #[serde(rename = "update-radarr", rename_all = "camelCase")]
    UpdateMovie { movie_id: i64 },
    #[serde(rename = "update-sonarr", rename_all = "camelCase")]
    UpdateSeries { series_id: i64 },
}

impl JobPayload {
    pub fn kind(&self) -> JobKind {
        match self {
            JobPayload::Transcode(_) => JobKind::Transcode,
            JobPayload::UpdateMovie { .. } => JobKind::UpdateMovie,
            JobPayload::UpdateSeries { .. } => JobKind::UpdateSeries,
        }
    }
}

/// Routing key for the worker pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum JobKind {
    Transcode,
    UpdateMovie,
    UpdateSeries,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Transcode => "transcode-job",
            JobKind::UpdateMovie => "update-radarr",
            JobKind::UpdateSeries => "update-sonarr",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    pub status: JobStatus,
    /// Informational; leases decide liveness.
    #[serde(with = "time::serde::rfc3339")]
    pub status_time: OffsetDateTime,
    pub attempt: u32,
    pub version: u64,
    pub payload: JobPayload,
}

impl Job {
    pub fn new(id: String, payload: JobPayload) -> Self {
        Self {
            id,
            status: JobStatus::Created,
            status_time: OffsetDateTime::now_utc(),
            attempt: 0,
            version: 0,
            payload,
        }
    }

    pub fn kind(&self) -> JobKind {
        self.payload.kind()
    }

    pub(crate) fn set_status(&mut self, status: JobStatus) {
        self.status = status;
        self.status_time = OffsetDateTime::now_utc();
    }
}
