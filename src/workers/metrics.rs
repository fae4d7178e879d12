use std::time::{Duration, Instant};

use async_trait::async_trait;
use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};
use tracing::warn;

use crate::modules::jobs::model::Job;
use crate::modules::jobs::recovery::DeadLetterHook;

const JOB_TIME_BUCKETS: [f64; 10] = [
    1.0,
    5.0,
    15.0,
    30.0,
    60.0,
    60.0 * 5.0,
    60.0 * 15.0,
    60.0 * 30.0,
    60.0 * 45.0,
    60.0 * 60.0,
];

/// Job counters for the worker pool, kept in their own registry so tests
/// and multiple pools never collide on registration.
#[derive(Clone)]
pub struct JobMetrics {
    registry: Registry,
    inflight: IntGaugeVec,
    performed: IntCounterVec,
    dropped: IntCounterVec,
    duration: HistogramVec,
}

impl JobMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let inflight = IntGaugeVec::new(
            Opts::new("inflight_job", "The number of jobs in progress"),
            &["job_name"],
        )?;
        let performed = IntCounterVec::new(
            Opts::new("jobs_performed", "Number of jobs performed"),
            &["job_name", "status"],
        )?;
        let dropped = IntCounterVec::new(
            Opts::new("jobs_dropped", "Number of jobs given up after too many attempts"),
            &["job_name"],
        )?;
        let duration = HistogramVec::new(
            HistogramOpts::new("job_time", "The time taken to perform a job").buckets(JOB_TIME_BUCKETS.to_vec()),
            &["job_name", "status"],
        )?;

        registry.register(Box::new(inflight.clone()))?;
        registry.register(Box::new(performed.clone()))?;
        registry.register(Box::new(dropped.clone()))?;
        registry.register(Box::new(duration.clone()))?;

        Ok(Self {
            registry,
            inflight,
            performed,
            dropped,
            duration,
        })
    }

    /// Count an attempt as in flight until the returned timer is finished or dropped.
    pub fn track(&self, job_name: &'static str) -> JobTimer {
        self.started(job_name);
        JobTimer {
            metrics: self.clone(),
            job_name,
            start: Instant::now(),
            finished: false,
        }
    }

    fn started(&self, job_name: &str) {
        self.inflight.with_label_values(&[job_name]).inc();
    }

    fn finished(&self, job_name: &str, success: bool, elapsed: Duration) {
        let status = if success { "success" } else { "error" };
        self.inflight.with_label_values(&[job_name]).dec();
        self.performed.with_label_values(&[job_name, status]).inc();
        self.duration
            .with_label_values(&[job_name, status])
            .observe(elapsed.as_secs_f64());
    }

    /// Prometheus text exposition of every job metric.
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }

    #[cfg(test)]
    pub fn performed(&self, job_name: &str, status: &str) -> u64 {
        self.performed.with_label_values(&[job_name, status]).get()
    }

    #[cfg(test)]
    pub fn dropped(&self, job_name: &str) -> u64 {
        self.dropped.with_label_values(&[job_name]).get()
    }

    #[cfg(test)]
    pub fn inflight(&self, job_name: &str) -> i64 {
        self.inflight.with_label_values(&[job_name]).get()
    }
}

/// One attempt on the in-flight gauge. Dropping it unfinished records the
/// attempt as an error, so a handler future dropped mid-run is still counted.
pub struct JobTimer {
    metrics: JobMetrics,
    job_name: &'static str,
    start: Instant,
    finished: bool,
}

impl JobTimer {
    pub fn finish(mut self, success: bool) {
        self.finished = true;
        self.metrics.finished(self.job_name, success, self.start.elapsed());
    }
}

impl Drop for JobTimer {
    fn drop(&mut self) {
        if !self.finished {
            self.metrics.finished(self.job_name, false, self.start.elapsed());
        }
    }
}

#[async_trait]
impl DeadLetterHook for JobMetrics {
    async fn dead_letter(&self, job: &Job) {
        let kind = job.kind();
        warn!(job_id = %job.id, kind = %kind, attempt = job.attempt, "Dropping job after too many attempts");
        self.dropped.with_label_values(&[kind.as_str()]).inc();
    }
}
