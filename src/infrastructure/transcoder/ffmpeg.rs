use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{Progress, ProgressStream, TranscodeOptions, Transcoder};

/// Partial progress never reaches 100 on its own; only a clean exit does.
const MAX_PARTIAL_PERCENT: f64 = 99.9;

#[derive(Debug, Clone)]
pub struct FfmpegTranscoder {
    ffmpeg: PathBuf,
    ffprobe: PathBuf,
}

impl FfmpegTranscoder {
    pub fn new(ffmpeg: impl Into<PathBuf>, ffprobe: impl Into<PathBuf>) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            ffprobe: ffprobe.into(),
        }
    }

    async fn duration_secs(&self, input: &Path) -> anyhow::Result<f64> {
        let output = Command::new(&self.ffprobe)
            .args(["-v", "error", "-show_entries", "format=duration"])
            .args(["-of", "default=noprint_wrappers=1:nokey=1"])
            .arg(input)
            .output()
            .await
            .with_context(|| format!("failed to run ffprobe on {}", input.display()))?;

        if !output.status.success() {
            return Err(anyhow!(
                "ffprobe failed for {} with status code {}: {}",
                input.display(),
                output.status.code().unwrap_or(-1),
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }

        let raw = String::from_utf8_lossy(&output.stdout);
        raw.trim()
            .parse::<f64>()
            .with_context(|| format!("unexpected ffprobe duration {:?}", raw.trim()))
    }

    fn command(&self, input: &Path, output: &Path, options: &TranscodeOptions) -> Command {
        let crf = options.crf.to_string();
        let mut cmd = Command::new(&self.ffmpeg);
        cmd.args(["-y", "-hide_banner", "-nostats", "-loglevel", "error"])
            .arg("-i")
            .arg(input)
            .args(["-c:v", options.video_codec.as_str()])
            .args(["-preset", options.preset.as_str()])
            .args(["-tune", options.tune.as_str()])
            .args(["-crf", crf.as_str()])
            .args(["-f", options.format.as_str()])
            .args(["-progress", "pipe:1"])
            .arg(output)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        cmd
    }
}

#[derive(Debug, PartialEq)]
enum ProgressLine {
    OutTimeMicros(u64),
    End,
}

fn parse_progress_line(line: &str) -> Option<ProgressLine> {
    let (key, value) = line.trim().split_once('=')?;
    match key {
        "out_time_us" => value.parse().ok().map(ProgressLine::OutTimeMicros),
        "progress" if value == "end" => Some(ProgressLine::End),
        _ => None,
    }
}

fn percent_of(out_time_us: u64, duration_secs: f64) -> f64 {
    if duration_secs <= 0.0 {
        return 0.0;
    }
    let percent = out_time_us as f64 / (duration_secs * 1_000_000.0) * 100.0;
    percent.clamp(0.0, MAX_PARTIAL_PERCENT)
}

#[async_trait]
impl Transcoder for FfmpegTranscoder {
    async fn start(
        &self,
        input: &Path,
        output: &Path,
        options: &TranscodeOptions,
    ) -> anyhow::Result<ProgressStream> {
        let duration = self.duration_secs(input).await?;

        let mut child = self
            .command(input, output, options)
            .spawn()
            .with_context(|| format!("failed to spawn ffmpeg for {}", input.display()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("ffmpeg stdout was not captured"))?;

        let (tx, rx) = mpsc::channel(16);
        let input = input.to_path_buf();

        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            let mut ended = false;

            loop {
                let line = match lines.next_line().await {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(e) => {
                        warn!(path = %input.display(), error = %e, "Failed to read ffmpeg progress");
                        break;
                    }
                };
                let percent = match parse_progress_line(&line) {
                    Some(ProgressLine::OutTimeMicros(us)) => percent_of(us, duration),
                    Some(ProgressLine::End) => {
                        ended = true;
                        continue;
                    }
                    None => continue,
                };
                if tx.send(Progress { percent }).await.is_err() {
                    // Receiver gone: the job was cancelled. Dropping `child` kills ffmpeg.
                    return;
                }
            }

            match child.wait().await {
                Ok(status) if status.success() && ended => {
                    let _ = tx.send(Progress { percent: 100.0 }).await;
                }
                Ok(status) => debug!(path = %input.display(), code = ?status.code(), "ffmpeg exited without finishing"),
                Err(e) => warn!(path = %input.display(), error = %e, "Failed to wait for ffmpeg"),
            }
        });

        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_progress_keys() {
        assert_eq!(
            parse_progress_line("out_time_us=1500000"),
            Some(ProgressLine::OutTimeMicros(1_500_000))
        );
        assert_eq!(parse_progress_line("progress=end"), Some(ProgressLine::End));
        assert_eq!(parse_progress_line("progress=continue"), None);
        assert_eq!(parse_progress_line("out_time_us=N/A"), None);
        assert_eq!(parse_progress_line("frame=12"), None);
        assert_eq!(parse_progress_line("garbage"), None);
    }

    #[test]
    fn partial_progress_stays_below_complete() {
        assert_eq!(percent_of(30_000_000, 60.0), 50.0);
        assert_eq!(percent_of(61_000_000, 60.0), MAX_PARTIAL_PERCENT);
        assert_eq!(percent_of(1_000, 0.0), 0.0);
    }

    #[test]
    fn command_carries_options() {
        let transcoder = FfmpegTranscoder::new("/usr/bin/ffmpeg", "/usr/bin/ffprobe");
        let cmd = transcoder.command(
            Path::new("/m/in.mkv"),
            Path::new("/m/in.mp4"),
            &TranscodeOptions::default(),
        );
        let args: Vec<String> = cmd
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();

        for pair in [
            ["-c:v", "libx264"],
            ["-preset", "veryfast"],
            ["-tune", "film"],
            ["-crf", "23"],
            ["-f", "mp4"],
            ["-progress", "pipe:1"],
        ] {
            assert!(args.windows(2).any(|w| w == pair), "missing {pair:?} in {args:?}");
        }
        assert_eq!(args.last().map(String::as_str), Some("/m/in.mp4"));
    }
}
