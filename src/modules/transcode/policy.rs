use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::common::error::TranscodeError;

/// A media file as the catalog describes it. Format and codec are whatever
/// the catalog's media info reports and may be empty when unknown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoFile {
    pub file_path: PathBuf,
    #[serde(default)]
    pub container_format: String,
    #[serde(default)]
    pub video_codec: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TranscodeDecision {
    Keep,
    Convert { reason: String },
}

const TARGET_EXTENSION: &str = "mp4";
const TARGET_CONTAINER: &str = "MPEG-4";
/// Codecs that already play everywhere. Empty means the catalog didn't
/// report one, which is treated as acceptable.
const ACCEPTED_CODECS: [&str; 4] = ["AVC", "h264", "x264", ""];

pub fn should_transcode(file: &VideoFile) -> Result<TranscodeDecision, TranscodeError> {
    if !file.file_path.exists() {
        return Err(TranscodeError::FileNotExists(file.file_path.clone()));
    }

    if file.file_path.extension().and_then(|e| e.to_str()) != Some(TARGET_EXTENSION) {
        return Ok(TranscodeDecision::Convert {
            reason: "file does not have .mp4 extension".to_string(),
        });
    }

    if !file.container_format.is_empty() && file.container_format != TARGET_CONTAINER {
        return Ok(TranscodeDecision::Convert {
            reason: "file not in mp4 format".to_string(),
        });
    }

    if !ACCEPTED_CODECS.contains(&file.video_codec.as_str()) {
        return Ok(TranscodeDecision::Convert {
            reason: format!("file has codec {}", file.video_codec),
        });
    }

    Ok(TranscodeDecision::Keep)
}

/// Where the converted file goes: next to the source, with an .mp4 extension.
pub fn output_path(input: &Path) -> PathBuf {
    input.with_extension(TARGET_EXTENSION)
}
