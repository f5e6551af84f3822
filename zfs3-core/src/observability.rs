/*!
Observability for upload runs.

- Structured logging setup (`tracing-subscriber`, human or JSON lines, always on stderr
  so stdout stays free for restored streams)
- Prometheus instrumentation of upload attempts behind the `metrics` feature
*/

#[cfg(feature = "metrics")]
use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, Registry, TextEncoder};
#[cfg(feature = "metrics")]
use std::sync::OnceLock;
#[cfg(feature = "metrics")]
use std::time::Instant;
use tracing::subscriber::set_global_default;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Registry as TracingRegistry};

use crate::{BackupError, Result};

/// Filter used when `RUST_LOG` is not set
pub const DEFAULT_LOG_DIRECTIVE: &str = "zfs3=info,zfs3_core=info";

#[cfg(feature = "metrics")]
static METRICS: OnceLock<UploadMetrics> = OnceLock::new();

/// Counters and histograms for the upload pipeline
#[cfg(feature = "metrics")]
#[derive(Debug)]
pub struct UploadMetrics {
    pub attempts_total: IntCounter,
    pub attempt_failures_total: IntCounter,
    pub retries_total: IntCounter,
    pub chunks_committed_total: IntCounter,
    pub chunks_failed_total: IntCounter,
    pub uploaded_bytes_total: IntCounter,
    pub attempts_in_flight: IntGauge,
    pub attempt_latency_seconds: Histogram,

    registry: Registry,
}

#[cfg(feature = "metrics")]
fn counter(registry: &Registry, name: &str, help: &str) -> Result<IntCounter> {
    let counter = IntCounter::new(name, help)
        .map_err(|e| BackupError::validation(format!("Failed to create {name} metric: {e}")))?;
    registry
        .register(Box::new(counter.clone()))
        .map_err(|e| BackupError::validation(format!("Failed to register {name}: {e}")))?;
    Ok(counter)
}

#[cfg(feature = "metrics")]
impl UploadMetrics {
    fn new() -> Result<Self> {
        let registry = Registry::new();

        let attempts_total = counter(&registry, "zfs3_upload_attempts_total", "Chunk upload attempts started")?;
        let attempt_failures_total = counter(
            &registry,
            "zfs3_upload_attempt_failures_total",
            "Chunk upload attempts that failed",
        )?;
        let retries_total = counter(&registry, "zfs3_upload_retries_total", "Chunk uploads scheduled for retry")?;
        let chunks_committed_total = counter(
            &registry,
            "zfs3_chunks_committed_total",
            "Chunks stored and checksum-verified",
        )?;
        let chunks_failed_total = counter(
            &registry,
            "zfs3_chunks_failed_total",
            "Chunks that exhausted their retry budget",
        )?;
        let uploaded_bytes_total = counter(
            &registry,
            "zfs3_uploaded_bytes_total",
            "Bytes written to the object store by successful attempts",
        )?;

        let attempts_in_flight = IntGauge::new("zfs3_upload_attempts_in_flight", "Upload attempts currently running")
            .map_err(|e| BackupError::validation(format!("Failed to create attempts_in_flight metric: {e}")))?;
        registry
            .register(Box::new(attempts_in_flight.clone()))
            .map_err(|e| BackupError::validation(format!("Failed to register attempts_in_flight: {e}")))?;

        let attempt_latency_seconds = Histogram::with_opts(HistogramOpts::new(
            "zfs3_upload_attempt_latency_seconds",
            "Duration of a single chunk upload attempt in seconds",
        ))
        .map_err(|e| BackupError::validation(format!("Failed to create attempt_latency_seconds metric: {e}")))?;
        registry
            .register(Box::new(attempt_latency_seconds.clone()))
            .map_err(|e| BackupError::validation(format!("Failed to register attempt_latency_seconds: {e}")))?;

        Ok(Self {
            attempts_total,
            attempt_failures_total,
            retries_total,
            chunks_committed_total,
            chunks_failed_total,
            uploaded_bytes_total,
            attempts_in_flight,
            attempt_latency_seconds,
            registry,
        })
    }

    /// Get or initialize the process-wide metrics instance
    pub fn global() -> Result<&'static UploadMetrics> {
        if let Some(metrics) = METRICS.get() {
            return Ok(metrics);
        }
        let metrics = Self::new()?;
        Ok(METRICS.get_or_init(|| metrics))
    }

    /// Gather metrics in Prometheus text format
    pub fn gather_metrics(&self) -> Result<String> {
        TextEncoder::new()
            .encode_to_string(&self.registry.gather())
            .map_err(|e| BackupError::validation(format!("Failed to encode metrics: {e}")))
    }
}

/// Times one upload attempt; a no-op without the `metrics` feature
pub(crate) struct AttemptTimer {
    #[cfg(feature = "metrics")]
    start: Instant,
}

impl AttemptTimer {
    pub(crate) fn start() -> Self {
        #[cfg(feature = "metrics")]
        if let Ok(metrics) = UploadMetrics::global() {
            metrics.attempts_total.inc();
            metrics.attempts_in_flight.inc();
        }
        Self {
            #[cfg(feature = "metrics")]
            start: Instant::now(),
        }
    }

    /// Finish the attempt; `stored_bytes` is `Some` when the object was committed
    pub(crate) fn finish(self, stored_bytes: Option<u64>) {
        #[cfg(feature = "metrics")]
        if let Ok(metrics) = UploadMetrics::global() {
            metrics.attempts_in_flight.dec();
            metrics
                .attempt_latency_seconds
                .observe(self.start.elapsed().as_secs_f64());
            match stored_bytes {
                Some(bytes) => {
                    metrics.chunks_committed_total.inc();
                    metrics.uploaded_bytes_total.inc_by(bytes);
                }
                None => metrics.attempt_failures_total.inc(),
            }
        }
        #[cfg(not(feature = "metrics"))]
        let _ = stored_bytes;
    }
}

/// Count a chunk scheduled for another attempt
pub(crate) fn record_retry() {
    #[cfg(feature = "metrics")]
    if let Ok(metrics) = UploadMetrics::global() {
        metrics.retries_total.inc();
    }
}

/// Count a chunk that exhausted its retry budget
pub(crate) fn record_permanent_failure() {
    #[cfg(feature = "metrics")]
    if let Ok(metrics) = UploadMetrics::global() {
        metrics.chunks_failed_total.inc();
    }
}

/// Initialize the global tracing subscriber
///
/// `RUST_LOG` takes precedence over `default_directive`. With `json` set, events are
/// written as JSON lines.
pub fn init_logging(json: bool, default_directive: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_directive))
        .map_err(|e| BackupError::validation(format!("invalid log filter: {e}")))?;
    let registry = TracingRegistry::default().with(filter);

    let result = if json {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .json()
            .with_target(false)
            .with_current_span(false)
            .with_writer(std::io::stderr);
        set_global_default(registry.with(fmt_layer))
    } else {
        let fmt_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);
        set_global_default(registry.with(fmt_layer))
    };

    result.map_err(|e| BackupError::validation(format!("Failed to set global tracing subscriber: {e}")))
}
