use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, bail};
use async_trait::async_trait;
use tracing::{debug, error, info};

use super::policy::{TranscodeDecision, VideoFile, output_path, should_transcode};
use crate::common::error::TranscodeError;
use crate::infrastructure::catalog::{RadarrClient, SonarrClient};
use crate::infrastructure::transcoder::{TranscodeOptions, Transcoder};
use crate::modules::jobs::enqueuer::Enqueuer;
use crate::modules::jobs::handler::{ExecutionContext, JobHandler};
use crate::modules::jobs::model::{Job, JobPayload, TranscodeJob, TranscodeType};

/// Anything below this is treated as a conversion that died part way.
const COMPLETE_PERCENT: f64 = 99.99;

/// Where the handler asks for a file's current path and media info.
struct Catalog {
    radarr: Arc<dyn RadarrClient>,
    sonarr: Arc<dyn SonarrClient>,
}

pub struct TranscodeHandler {
    transcoder: Arc<dyn Transcoder>,
    enqueuer: Enqueuer,
    catalog: Option<Catalog>,
    options: TranscodeOptions,
    keep_source: bool,
    log_every: Duration,
}

impl TranscodeHandler {
    pub fn new(transcoder: Arc<dyn Transcoder>, enqueuer: Enqueuer) -> Self {
        Self {
            transcoder,
            enqueuer,
            catalog: None,
            options: TranscodeOptions::default(),
            keep_source: false,
            log_every: Duration::from_secs(60),
        }
    }

    pub fn keep_source(mut self, keep: bool) -> Self {
        self.keep_source = keep;
        self
    }

    /// Re-read the file from the catalog before converting, since it may have
    /// been upgraded or removed since the job was queued.
    pub fn catalog(mut self, radarr: Arc<dyn RadarrClient>, sonarr: Arc<dyn SonarrClient>) -> Self {
        self.catalog = Some(Catalog { radarr, sonarr });
        self
    }

    async fn current_file(&self, job: &TranscodeJob) -> anyhow::Result<Option<VideoFile>> {
        let Some(catalog) = &self.catalog else {
            return Ok(Some(job.video_file.clone()));
        };
        let found = match (job.transcode_type, job.file_id) {
            (TranscodeType::Movie, _) => catalog.radarr.lookup_media_file(job.video_id).await,
            (TranscodeType::Tv, Some(file_id)) => catalog.sonarr.lookup_media_file(file_id).await,
            (TranscodeType::Tv, None) => return Ok(Some(job.video_file.clone())),
        };
        found.context("error getting input file path")
    }

    async fn transcode(&self, job_id: &str, job: &TranscodeJob, ctx: &ExecutionContext) -> anyhow::Result<()> {
        let Some(file) = self.current_file(job).await? else {
            info!(job_id, video_id = job.video_id, "File is gone from the catalog, not transcoding");
            return Ok(());
        };
        let input = file.file_path.as_path();

        let reason = match should_transcode(&file) {
            Ok(TranscodeDecision::Convert { reason }) => reason,
            Ok(TranscodeDecision::Keep) | Err(TranscodeError::FileNotExists(_)) => {
                info!(job_id, path = %input.display(), "Not transcoding file");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        let output = output_path(input);
        if output == input {
            info!(job_id, path = %output.display(), "Aborting transcode because paths are the same");
            return Ok(());
        }
        if output.exists() {
            info!(job_id, path = %output.display(), "Skipping transcode because new file exists already");
            return Ok(());
        }

        info!(
            job_id,
            reason = %reason,
            path = %input.display(),
            new_path = %output.display(),
            "Transcoding file"
        );

        let mut progress = self
            .transcoder
            .start(input, &output, &self.options)
            .await
            .context("failed to start transcode")?;

        let mut last = 0.0;
        let mut logged = Instant::now();
        let mut cancelled = false;
        loop {
            tokio::select! {
                _ = ctx.cancelled() => {
                    cancelled = true;
                    break;
                }
                msg = progress.recv() => match msg {
                    Some(p) => {
                        last = p.percent;
                        if logged.elapsed() >= self.log_every {
                            debug!(job_id, path = %input.display(), progress = last, "Transcoding");
                            logged = Instant::now();
                        }
                    }
                    None => break,
                },
            }
        }
        drop(progress);

        if cancelled {
            discard_partial(&output).await;
            bail!("transcode of {} cancelled at {last:.2}%", input.display());
        }
        if last < COMPLETE_PERCENT {
            discard_partial(&output).await;
            return Err(TranscodeError::Incomplete { progress: last }.into());
        }

        if !self.keep_source {
            info!(job_id, path = %input.display(), "Deleting old file");
            if let Err(e) = tokio::fs::remove_file(input).await {
                error!(job_id, path = %input.display(), error = %e, "Error deleting old file");
            }
        }
        info!(job_id, path = %output.display(), "Done transcoding");

        self.enqueue_update(job_id, job).await;
        Ok(())
    }

    /// The file is already converted, so a failed follow-up is only logged.
    async fn enqueue_update(&self, job_id: &str, job: &TranscodeJob) {
        let payload = match job.transcode_type {
            TranscodeType::Movie => JobPayload::UpdateMovie {
                movie_id: job.video_id,
            },
            TranscodeType::Tv => JobPayload::UpdateSeries {
                series_id: job.video_id,
            },
        };
        let kind = payload.kind();
        match self.enqueuer.enqueue(payload).await {
            Ok(id) => debug!(job_id, follow_up = %id, kind = %kind, "Created update job"),
            Err(e) => error!(job_id, kind = %kind, error = %e, "Failed to enqueue update job"),
        }
    }
}

/// Leaving a half-written output behind would make the retry skip the file.
async fn discard_partial(output: &Path) {
    match tokio::fs::remove_file(output).await {
        Ok(()) => debug!(path = %output.display(), "Removed partial output"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => error!(path = %output.display(), error = %e, "Failed to remove partial output"),
    }
}

#[async_trait]
impl JobHandler for TranscodeHandler {
    async fn handle(&self, job: &Job, ctx: &ExecutionContext) -> anyhow::Result<()> {
        let JobPayload::Transcode(transcode) = &job.payload else {
            bail!("transcode handler cannot run {} job {}", job.kind(), job.id);
        };
        self.transcode(&job.id, transcode, ctx).await
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::Mutex;

    use mockall::predicate::eq;
    use tempfile::TempDir;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::common::error::WorkerError;
    use crate::config::settings::QueueSettings;
    use crate::infrastructure::catalog::{MockRadarrClient, MockSonarrClient};
    use crate::infrastructure::transcoder::{Progress, ProgressStream};
    use crate::modules::jobs::dequeue::DequeueLoop;
    use crate::modules::jobs::store::JobStore;
    use crate::modules::jobs::store::tests::store;
    use crate::workers::metrics::JobMetrics;
    use crate::workers::middleware::{MetricsMiddleware, Middleware, Next};

    /// Writes the output file and replays fixed progress values.
    struct FakeTranscoder {
        steps: Vec<f64>,
        /// Keep the stream open after the steps, like a long conversion.
        hang: bool,
        calls: Mutex<Vec<(PathBuf, PathBuf)>>,
    }

    impl FakeTranscoder {
        fn new(steps: &[f64]) -> Arc<Self> {
            Arc::new(Self {
                steps: steps.to_vec(),
                hang: false,
                calls: Mutex::new(Vec::new()),
            })
        }

        fn hanging() -> Arc<Self> {
            Arc::new(Self {
                steps: vec![10.0],
                hang: true,
                calls: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl Transcoder for FakeTranscoder {
        async fn start(
            &self,
            input: &Path,
            output: &Path,
            _options: &TranscodeOptions,
        ) -> anyhow::Result<ProgressStream> {
            self.calls
                .lock()
                .unwrap()
                .push((input.to_path_buf(), output.to_path_buf()));
            std::fs::write(output, b"converted")?;

            let (tx, rx) = mpsc::channel(self.steps.len().max(1));
            for percent in &self.steps {
                tx.send(Progress { percent: *percent }).await?;
            }
            if self.hang {
                tokio::spawn(async move {
                    tx.closed().await;
                });
            }
            Ok(rx)
        }
    }

    struct Fixture {
        dir: TempDir,
        store: JobStore,
        handler: TranscodeHandler,
    }

    fn fixture(transcoder: Arc<FakeTranscoder>) -> Fixture {
        let (_, store) = store();
        let handler = TranscodeHandler::new(transcoder, Enqueuer::new(store.clone()));
        Fixture {
            dir: TempDir::new().unwrap(),
            store,
            handler,
        }
    }

    fn payload(path: PathBuf, transcode_type: TranscodeType, codec: &str) -> JobPayload {
        JobPayload::Transcode(TranscodeJob {
            transcode_type,
            video_file: VideoFile {
                file_path: path,
                container_format: String::new(),
                video_codec: codec.to_string(),
            },
            video_id: 77,
            file_id: Some(5),
        })
    }

    fn job(path: PathBuf, transcode_type: TranscodeType, codec: &str) -> Job {
        Job::new("job-1".to_string(), payload(path, transcode_type, codec))
    }

    fn source(dir: &TempDir, name: &str) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, b"original").unwrap();
        path
    }

    fn ctx() -> ExecutionContext {
        ExecutionContext::new(CancellationToken::new())
    }

    async fn follow_ups(store: &JobStore) -> Vec<JobPayload> {
        let mut payloads = Vec::new();
        for id in store.pending_ids(10).await.unwrap() {
            payloads.push(store.load(&id).await.unwrap().unwrap().payload);
        }
        payloads
    }

    #[tokio::test]
    async fn converts_movie_and_asks_for_rescan() {
        let transcoder = FakeTranscoder::new(&[12.5, 50.0, 100.0]);
        let f = fixture(transcoder.clone());
        let input = source(&f.dir, "movie.mkv");

        f.handler
            .handle(&job(input.clone(), TranscodeType::Movie, "HEVC"), &ctx())
            .await
            .unwrap();

        assert_eq!(transcoder.calls(), 1);
        assert!(!input.exists());
        assert!(f.dir.path().join("movie.mp4").exists());
        assert_eq!(
            follow_ups(&f.store).await,
            vec![JobPayload::UpdateMovie { movie_id: 77 }]
        );
    }

    #[tokio::test]
    async fn tv_episode_triggers_series_update() {
        let f = fixture(FakeTranscoder::new(&[100.0]));
        let input = source(&f.dir, "s01e01.avi");

        f.handler
            .handle(&job(input, TranscodeType::Tv, ""), &ctx())
            .await
            .unwrap();

        assert_eq!(
            follow_ups(&f.store).await,
            vec![JobPayload::UpdateSeries { series_id: 77 }]
        );
    }

    #[tokio::test]
    async fn incomplete_conversion_keeps_the_original() {
        let transcoder = FakeTranscoder::new(&[40.0, 99.5]);
        let f = fixture(transcoder);
        let input = source(&f.dir, "movie.mkv");

        let err = f
            .handler
            .handle(&job(input.clone(), TranscodeType::Movie, ""), &ctx())
            .await
            .unwrap_err();

        assert!(matches!(
            err.downcast_ref::<TranscodeError>(),
            Some(TranscodeError::Incomplete { .. })
        ));
        assert!(input.exists());
        assert!(!f.dir.path().join("movie.mp4").exists());
        assert!(follow_ups(&f.store).await.is_empty());
    }

    #[tokio::test]
    async fn existing_output_is_left_alone() {
        let transcoder = FakeTranscoder::new(&[100.0]);
        let f = fixture(transcoder.clone());
        let input = source(&f.dir, "movie.mkv");
        source(&f.dir, "movie.mp4");

        f.handler
            .handle(&job(input.clone(), TranscodeType::Movie, ""), &ctx())
            .await
            .unwrap();

        assert_eq!(transcoder.calls(), 0);
        assert!(input.exists());
        assert!(follow_ups(&f.store).await.is_empty());
    }

    #[tokio::test]
    async fn acceptable_file_and_missing_file_are_no_ops() {
        let transcoder = FakeTranscoder::new(&[100.0]);
        let f = fixture(transcoder.clone());
        let good = source(&f.dir, "movie.mp4");

        f.handler
            .handle(&job(good, TranscodeType::Movie, "h264"), &ctx())
            .await
            .unwrap();
        f.handler
            .handle(
                &job(f.dir.path().join("gone.mkv"), TranscodeType::Movie, ""),
                &ctx(),
            )
            .await
            .unwrap();

        assert_eq!(transcoder.calls(), 0);
    }

    #[tokio::test]
    async fn local_mode_keeps_the_source() {
        let f = fixture(FakeTranscoder::new(&[100.0]));
        let handler = TranscodeHandler::new(FakeTranscoder::new(&[100.0]), Enqueuer::new(f.store.clone()))
            .keep_source(true);
        let input = source(&f.dir, "movie.mkv");

        handler
            .handle(&job(input.clone(), TranscodeType::Movie, ""), &ctx())
            .await
            .unwrap();

        assert!(input.exists());
        assert!(f.dir.path().join("movie.mp4").exists());
    }

    #[tokio::test]
    async fn cancellation_stops_the_conversion() {
        let f = fixture(FakeTranscoder::hanging());
        let input = source(&f.dir, "movie.mkv");
        let token = CancellationToken::new();
        let ctx = ExecutionContext::new(token.clone());

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            token.cancel();
        });
        let res = f
            .handler
            .handle(&job(input.clone(), TranscodeType::Movie, ""), &ctx)
            .await;
        canceller.await.unwrap();

        assert!(res.is_err());
        assert!(input.exists());
        assert!(!f.dir.path().join("movie.mp4").exists());
    }

    #[tokio::test]
    async fn rejects_other_job_kinds() {
        let f = fixture(FakeTranscoder::new(&[]));
        let other = Job::new("x".to_string(), JobPayload::UpdateMovie { movie_id: 1 });
        assert!(f.handler.handle(&other, &ctx()).await.is_err());
    }

    #[tokio::test]
    async fn converts_the_file_the_catalog_reports_now() {
        let transcoder = FakeTranscoder::new(&[100.0]);
        let f = fixture(transcoder.clone());
        let upgraded = source(&f.dir, "upgraded.mkv");
        let current = VideoFile {
            file_path: upgraded.clone(),
            container_format: String::new(),
            video_codec: "HEVC".to_string(),
        };
        let mut radarr = MockRadarrClient::new();
        radarr
            .expect_lookup_media_file()
            .with(eq(77))
            .return_once(move |_| Ok(Some(current)));
        let handler = f.handler.catalog(Arc::new(radarr), Arc::new(MockSonarrClient::new()));

        handler
            .handle(&job(f.dir.path().join("old.avi"), TranscodeType::Movie, ""), &ctx())
            .await
            .unwrap();

        assert_eq!(transcoder.calls(), 1);
        assert!(!upgraded.exists());
        assert!(f.dir.path().join("upgraded.mp4").exists());
    }

    #[tokio::test]
    async fn episode_gone_from_catalog_is_skipped() {
        let transcoder = FakeTranscoder::new(&[100.0]);
        let f = fixture(transcoder.clone());
        let input = source(&f.dir, "s01e01.mkv");
        let mut sonarr = MockSonarrClient::new();
        sonarr.expect_lookup_media_file().with(eq(5)).return_once(|_| Ok(None));
        let handler = f.handler.catalog(Arc::new(MockRadarrClient::new()), Arc::new(sonarr));

        handler
            .handle(&job(input.clone(), TranscodeType::Tv, ""), &ctx())
            .await
            .unwrap();

        assert_eq!(transcoder.calls(), 0);
        assert!(input.exists());
        assert!(follow_ups(&f.store).await.is_empty());
    }

    #[tokio::test]
    async fn catalog_outage_fails_the_attempt() {
        let transcoder = FakeTranscoder::new(&[100.0]);
        let f = fixture(transcoder.clone());
        let input = source(&f.dir, "movie.mkv");
        let mut radarr = MockRadarrClient::new();
        radarr
            .expect_lookup_media_file()
            .return_once(|_| Err(anyhow::anyhow!("connection refused")));
        let handler = f.handler.catalog(Arc::new(radarr), Arc::new(MockSonarrClient::new()));

        let err = handler
            .handle(&job(input.clone(), TranscodeType::Movie, ""), &ctx())
            .await
            .unwrap_err();

        assert!(format!("{err:#}").contains("connection refused"));
        assert_eq!(transcoder.calls(), 0);
        assert!(input.exists());
    }

    /// The handler behind the same middleware the pool installs.
    struct Chain {
        middleware: Vec<Arc<dyn Middleware>>,
        handler: TranscodeHandler,
    }

    #[async_trait]
    impl JobHandler for Chain {
        async fn handle(&self, job: &Job, ctx: &ExecutionContext) -> anyhow::Result<()> {
            Next::new(&self.middleware, &self.handler).run(job, ctx).await
        }
    }

    #[tokio::test]
    async fn lost_lease_discards_partial_output_and_settles_metrics() {
        let (backend, store) = store();
        let dir = TempDir::new().unwrap();
        let input = source(&dir, "movie.mkv");
        let metrics = JobMetrics::new().unwrap();
        let chain = Chain {
            middleware: vec![Arc::new(MetricsMiddleware::new(metrics.clone()))],
            handler: TranscodeHandler::new(FakeTranscoder::hanging(), Enqueuer::new(store.clone())),
        };
        let dequeue = DequeueLoop::new(
            store.clone(),
            Arc::new(chain),
            QueueSettings {
                dequeue_timeout: Duration::from_millis(20),
                lease_refresh_interval: Duration::from_millis(10),
                cancel_grace: Duration::from_secs(1),
                ..QueueSettings::default()
            },
        );
        let queued = store
            .enqueue(payload(input.clone(), TranscodeType::Movie, ""))
            .await
            .unwrap();
        backend.fail_next_refreshes(3);

        let err = dequeue.run_once(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, WorkerError::LostLease { .. }));
        assert!(input.exists());
        assert!(!dir.path().join("movie.mp4").exists());
        assert_eq!(metrics.inflight("transcode-job"), 0);
        assert_eq!(metrics.performed("transcode-job", "error"), 1);

        let transcoder = FakeTranscoder::new(&[100.0]);
        let retry = TranscodeHandler::new(transcoder.clone(), Enqueuer::new(store.clone()));
        let job = store.load(&queued.id).await.unwrap().unwrap();
        retry.handle(&job, &ctx()).await.unwrap();

        assert_eq!(transcoder.calls(), 1);
        assert!(!input.exists());
        assert_eq!(std::fs::read(dir.path().join("movie.mp4")).unwrap(), b"converted");
    }
}
