//! External conversion process. The job handler only sees a stream of
//! progress percentages; anything ffmpeg-specific stays in `ffmpeg`.

use std::path::Path;

use async_trait::async_trait;
use tokio::sync::mpsc;

pub mod ffmpeg;

pub use self::ffmpeg::FfmpegTranscoder;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Progress {
    /// 0.0 ..= 100.0. Exactly 100 is only sent once the process finished cleanly.
    pub percent: f64,
}

/// Closed when the conversion process exits. Dropping it stops the process.
pub type ProgressStream = mpsc::Receiver<Progress>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscodeOptions {
    pub preset: String,
    pub format: String,
    pub video_codec: String,
    pub tune: String,
    pub crf: u32,
}

impl Default for TranscodeOptions {
    fn default() -> Self {
        Self {
            preset: "veryfast".to_string(),
            format: "mp4".to_string(),
            video_codec: "libx264".to_string(),
            tune: "film".to_string(),
            crf: 23,
        }
    }
}

#[async_trait]
pub trait Transcoder: Send + Sync {
    async fn start(
        &self,
        input: &Path,
        output: &Path,
        options: &TranscodeOptions,
    ) -> anyhow::Result<ProgressStream>;
}
