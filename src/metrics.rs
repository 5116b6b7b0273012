//! Prometheus metrics surface, exposed at `/metrics` (§6.1, SPEC_FULL A.5).

use poem::web::Data;
use poem::{handler, IntoResponse, Response};
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::sync::Arc;

pub struct Metrics {
    registry: Registry,
    pub jobs_submitted_total: IntCounter,
    pub jobs_completed_total: IntCounterVec,
    pub job_duration_seconds: Histogram,
    pub queue_depth: IntGauge,
    pub recovery_reaped_total: IntCounter,
    pub rate_limit_rejections_total: IntCounter,
    pub backend_poll_latency_seconds: Histogram,
}

impl Metrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let jobs_submitted_total = IntCounter::with_opts(Opts::new(
            "jobs_submitted_total",
            "Total number of jobs accepted at the submission API",
        ))?;
        let jobs_completed_total = IntCounterVec::new(
            Opts::new("jobs_completed_total", "Total number of jobs reaching a terminal state"),
            &["status"],
        )?;
        let job_duration_seconds = Histogram::with_opts(HistogramOpts::new(
            "job_duration_seconds",
            "Wall-clock seconds from queued_at to finished_at",
        ))?;
        let queue_depth = IntGauge::with_opts(Opts::new(
            "queue_depth",
            "Approximate number of handles waiting in the work queue",
        ))?;
        let recovery_reaped_total = IntCounter::with_opts(Opts::new(
            "recovery_reaped_total",
            "Total number of in-progress jobs reaped by the recovery loop",
        ))?;
        let rate_limit_rejections_total = IntCounter::with_opts(Opts::new(
            "rate_limit_rejections_total",
            "Total number of requests rejected by the rate limiter",
        ))?;
        let backend_poll_latency_seconds = Histogram::with_opts(HistogramOpts::new(
            "backend_poll_latency_seconds",
            "Latency of a single backend history poll request",
        ))?;

        registry.register(Box::new(jobs_submitted_total.clone()))?;
        registry.register(Box::new(jobs_completed_total.clone()))?;
        registry.register(Box::new(job_duration_seconds.clone()))?;
        registry.register(Box::new(queue_depth.clone()))?;
        registry.register(Box::new(recovery_reaped_total.clone()))?;
        registry.register(Box::new(rate_limit_rejections_total.clone()))?;
        registry.register(Box::new(backend_poll_latency_seconds.clone()))?;

        Ok(Self {
            registry,
            jobs_submitted_total,
            jobs_completed_total,
            job_duration_seconds,
            queue_depth,
            recovery_reaped_total,
            rate_limit_rejections_total,
            backend_poll_latency_seconds,
        })
    }

    pub fn render(&self) -> String {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        let mut buffer = Vec::new();
        if encoder.encode(&families, &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

/// `GET /metrics`, nested directly into the route tree rather than the
/// `poem_openapi` service (a text scrape endpoint isn't an OpenAPI operation).
#[handler]
pub fn scrape(Data(metrics): Data<&Arc<Metrics>>) -> Response {
    metrics.render().into_response()
}
