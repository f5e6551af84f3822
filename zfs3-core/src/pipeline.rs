/*!
The orchestrator: one snapshot stream in, one run outcome out.

A producer task reads the stream through the [`Chunker`] into a bounded queue. The
dispatcher loop owns everything else: it starts attempts on the [`UploadPool`] while
there is capacity (pending retries first, then fresh chunks), feeds attempt results to
the [`RetryGovernor`] and the [`ManifestBuilder`], and decides the final verdict.

```text
reader -> Chunker -> [queue] -> dispatcher -> UploadPool -> ObjectStore
                                   ^    |
                      retry timers +----+--> ManifestBuilder
```
*/

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use zfs3_retry::{with_backoff, RetryPolicy};

use crate::chunker::{Chunk, Chunker};
use crate::compression::Compressor;
use crate::config::RunConfig;
use crate::manifest::{BackupRun, Lineage, Manifest, ManifestBuilder, RunOutcome};
use crate::observability::{record_permanent_failure, record_retry};
use crate::retry::{RetryGovernor, Verdict};
use crate::store::ObjectStore;
use crate::upload::{AttemptReport, UploadContext, UploadPool, UploadTask};
use crate::{BackupError, Result};

/// Storage class of the run record; it is small and read on every catalog scan
pub const RECORD_STORAGE_CLASS: &str = "STANDARD";

/// How the producer task ended
#[derive(Debug)]
enum ProducerEnd {
    Exhausted { chunk_count: u64, bytes: u64 },
    Failed { emitted: u64, error: BackupError },
    /// The task died; how far it got is unknown
    Panicked(String),
    Stopped,
}

async fn produce<R>(mut chunker: Chunker<R>, tx: mpsc::Sender<Chunk>, cancel: CancellationToken) -> ProducerEnd
where
    R: AsyncRead + Unpin,
{
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => return ProducerEnd::Stopped,
            next = chunker.next_chunk() => next,
        };
        match next {
            Ok(Some(chunk)) => {
                tokio::select! {
                    _ = cancel.cancelled() => return ProducerEnd::Stopped,
                    sent = tx.send(chunk) => {
                        if sent.is_err() {
                            return ProducerEnd::Stopped;
                        }
                    }
                }
            }
            Ok(None) => {
                return ProducerEnd::Exhausted {
                    chunk_count: chunker.chunks_emitted(),
                    bytes: chunker.bytes_read(),
                }
            }
            Err(error) => {
                return ProducerEnd::Failed {
                    emitted: chunker.chunks_emitted(),
                    error,
                }
            }
        }
    }
}

async fn join_producer(handle: &mut Option<JoinHandle<ProducerEnd>>) -> ProducerEnd {
    match handle.take() {
        Some(handle) => handle
            .await
            .unwrap_or_else(|e| ProducerEnd::Panicked(format!("chunk producer task panicked: {e}"))),
        None => ProducerEnd::Stopped,
    }
}

fn delayed(task: UploadTask, delay: Duration) -> BoxFuture<'static, UploadTask> {
    Box::pin(async move {
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        task
    })
}

/// Runs chunked uploads of snapshot streams
///
/// # Example
/// ```rust
/// # let rt = tokio::runtime::Runtime::new().unwrap();
/// # rt.block_on(async {
/// use std::sync::Arc;
/// use zfs3_core::{MemoryObjectStore, Orchestrator, RunConfig};
///
/// let config = RunConfig {
///     chunk_size: 256,
///     ..RunConfig::default()
/// };
/// let orchestrator = Orchestrator::new(config, Arc::new(MemoryObjectStore::new()))?;
/// let outcome = orchestrator.run("tank/data@daily-1", std::io::Cursor::new(vec![7u8; 1000])).await?;
/// assert!(outcome.is_success());
/// assert_eq!(outcome.manifest().chunk_count, 4);
/// # Ok::<(), zfs3_core::BackupError>(())
/// # }).unwrap();
/// ```
pub struct Orchestrator {
    config: RunConfig,
    store: Arc<dyn ObjectStore>,
    compressor: Arc<Compressor>,
    cancel: CancellationToken,
    previous: Option<Manifest>,
}

impl Orchestrator {
    /// Create an orchestrator for `config`, writing to `store`
    pub fn new(config: RunConfig, store: Arc<dyn ObjectStore>) -> Result<Self> {
        config.validate()?;
        let compressor = Arc::new(Compressor::from_config(&config)?);
        Ok(Self {
            config,
            store,
            compressor,
            cancel: CancellationToken::new(),
            previous: None,
        })
    }

    /// Use an externally owned cancellation token
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Skip chunks that a previous run of the same dataset already stored intact
    pub fn resume_from(mut self, previous: Manifest) -> Self {
        self.previous = Some(previous);
        self
    }

    /// Token that aborts the run when cancelled
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    fn resume_manifest(&self, dataset_id: &str) -> Option<&Manifest> {
        let previous = self.previous.as_ref()?;
        if previous.dataset_id != dataset_id {
            warn!(
                dataset = %dataset_id,
                previous = %previous.dataset_id,
                "Ignoring resume manifest of a different dataset"
            );
            return None;
        }
        Some(previous)
    }

    /// Back up `reader` as `dataset_id`
    ///
    /// # Errors
    /// Operational failures end up in the returned [`RunOutcome`]. An `Err` means the
    /// run could not start (invalid dataset id, empty stream) or an internal invariant
    /// was violated (`IncompleteManifest`, `DuplicateCommit`).
    pub async fn run<R>(&self, dataset_id: &str, reader: R) -> Result<RunOutcome>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        if dataset_id.trim().is_empty() {
            return Err(BackupError::validation("dataset id cannot be empty"));
        }
        let resume = self.resume_manifest(dataset_id);

        info!(
            dataset = %dataset_id,
            store = %self.store.describe(),
            chunk_size = self.config.chunk_size,
            concurrency = self.config.concurrency,
            max_retries = self.config.max_retries,
            compressor = %self.config.compressor,
            "Starting chunked upload"
        );

        let (tx, mut rx) = mpsc::channel::<Chunk>(self.config.queue_capacity());
        let producer_cancel = self.cancel.child_token();
        let mut producer = Some(tokio::spawn(produce(
            Chunker::new(reader, self.config.chunk_len()),
            tx,
            producer_cancel.clone(),
        )));

        let ctx = Arc::new(UploadContext::new(
            Arc::clone(&self.store),
            Arc::clone(&self.compressor),
            self.config.storage_class.clone(),
        ));
        let mut pool = UploadPool::new(ctx, self.config.concurrency);
        let governor = RetryGovernor::new(self.config.retry_policy());
        let mut builder = ManifestBuilder::new(dataset_id);
        let mut waiting: FuturesUnordered<BoxFuture<'static, UploadTask>> = FuturesUnordered::new();
        let mut ready: VecDeque<UploadTask> = VecDeque::new();
        let mut input_open = true;
        let max_unresolved = self.config.max_unresolved();
        let mut producer_end: Option<ProducerEnd> = None;

        loop {
            // retries go first so a failing chunk is not starved by fresh ones
            while pool.has_capacity() {
                let Some(task) = ready.pop_front() else { break };
                if let Err(task) = pool.submit(task) {
                    ready.push_front(task);
                    break;
                }
            }

            if !input_open && pool.is_idle() && waiting.is_empty() && ready.is_empty() {
                break;
            }

            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => {
                    warn!(dataset = %dataset_id, in_flight = pool.in_flight(), "Upload cancelled");
                    governor.halt();
                    producer_cancel.cancel();
                    pool.abort_all().await;
                    join_producer(&mut producer).await;
                    return Ok(RunOutcome::Aborted {
                        reason: BackupError::Cancelled.to_string(),
                        manifest: builder.partial(),
                    });
                }

                Some(report) = pool.next_report(), if !pool.is_idle() => {
                    if let Some((task, delay)) = resolve(report, &governor, &mut builder)? {
                        waiting.push(delayed(task, delay));
                    }
                }

                Some(task) = waiting.next(), if !waiting.is_empty() => {
                    ready.push_back(task);
                }

                // chunks waiting out a retry delay count against the bound too
                chunk = rx.recv(), if input_open
                    && ready.is_empty()
                    && pool.has_capacity()
                    && pool.in_flight() + waiting.len() < max_unresolved => {
                    match chunk {
                        Some(chunk) => {
                            let key = self.config.chunk_key(dataset_id, chunk.sequence);
                            let mut task = UploadTask::new(chunk, key);
                            if let Some(committed) = resume.and_then(|m| m.chunk(task.sequence())) {
                                task = task.with_previous(committed.clone());
                            }
                            if let Err(task) = pool.submit(task) {
                                ready.push_back(task);
                            }
                        }
                        None => {
                            input_open = false;
                            let end = join_producer(&mut producer).await;
                            match &end {
                                ProducerEnd::Failed { emitted, error } => error!(
                                    dataset = %dataset_id,
                                    emitted,
                                    error = %error,
                                    "Reading the stream failed, draining in-flight uploads"
                                ),
                                ProducerEnd::Panicked(reason) => error!(
                                    dataset = %dataset_id,
                                    reason = %reason,
                                    "Chunk producer died, draining in-flight uploads"
                                ),
                                _ => {}
                            }
                            if matches!(end, ProducerEnd::Failed { .. } | ProducerEnd::Panicked(_)) {
                                governor.halt();
                                waiting.clear();
                                ready.clear();
                            }
                            producer_end = Some(end);
                        }
                    }
                }
            }
        }

        debug!(dataset = %dataset_id, peak_in_flight = pool.peak(), "Dispatcher drained");
        conclude(dataset_id, producer_end, builder)
    }

    /// Run, then persist the run record next to the chunks
    ///
    /// Cancelled runs are recorded too, so a later run can resume from them.
    pub async fn run_and_record<R>(
        &self,
        dataset_id: &str,
        reader: R,
        lineage: Option<Lineage>,
    ) -> Result<BackupRun>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let started_at: DateTime<Utc> = Utc::now();
        let outcome = self.run(dataset_id, reader).await?;
        let mut record = BackupRun::new(dataset_id, &self.config, started_at, outcome);
        if let Some(lineage) = lineage {
            record = record.with_lineage(lineage);
        }
        persist_run(&self.store, &record, &self.config.retry_policy()).await?;
        Ok(record)
    }
}

/// Apply one attempt result; returns the task and its delay when it must be retried
fn resolve(
    report: AttemptReport,
    governor: &RetryGovernor,
    builder: &mut ManifestBuilder,
) -> Result<Option<(UploadTask, Duration)>> {
    let sequence = report.task.sequence();
    match report.result {
        Ok(committed) => {
            let attempts = governor.on_success(sequence);
            debug!(sequence, attempts, key = %committed.key, "Chunk resolved");
            builder.record(committed)?;
            Ok(None)
        }
        Err(error) => match governor.on_failure(sequence, &error) {
            Verdict::Retry { attempt, delay } => {
                record_retry();
                info!(
                    sequence,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Upload attempt failed, retrying"
                );
                Ok(Some((report.task.into_retry(attempt), delay)))
            }
            Verdict::GiveUp(failure) => {
                record_permanent_failure();
                builder.mark_failed(failure)?;
                Ok(None)
            }
            Verdict::Halted { attempts, last_error } => {
                debug!(sequence, attempts, error = %last_error, "Dropping failed chunk of an aborted run");
                Ok(None)
            }
        },
    }
}

fn conclude(dataset_id: &str, producer_end: Option<ProducerEnd>, mut builder: ManifestBuilder) -> Result<RunOutcome> {
    match producer_end {
        Some(ProducerEnd::Exhausted { chunk_count: 0, .. }) => Err(BackupError::validation(format!(
            "refusing to upload an empty stream for {dataset_id}"
        ))),
        Some(ProducerEnd::Exhausted { chunk_count, bytes }) => {
            builder.set_chunk_count(chunk_count)?;
            let (manifest, failures) = builder.finalize()?;
            if failures.is_empty() {
                info!(
                    dataset = %dataset_id,
                    chunks = chunk_count,
                    bytes,
                    stored_bytes = manifest.stored_size,
                    "Upload succeeded"
                );
                Ok(RunOutcome::Succeeded { manifest })
            } else {
                let failed: Vec<u64> = failures.iter().map(|f| f.sequence).collect();
                for failure in &failures {
                    error!(
                        dataset = %dataset_id,
                        sequence = failure.sequence,
                        attempts = failure.attempts,
                        error = %failure.last_error,
                        "Chunk failed permanently"
                    );
                }
                warn!(dataset = %dataset_id, failed = ?failed, "Upload partially failed");
                Ok(RunOutcome::PartiallyFailed { manifest, failures })
            }
        }
        Some(ProducerEnd::Failed { error, .. }) => Ok(RunOutcome::Aborted {
            reason: error.to_string(),
            manifest: builder.partial(),
        }),
        Some(ProducerEnd::Panicked(reason)) => Ok(RunOutcome::Aborted {
            reason,
            manifest: builder.partial(),
        }),
        Some(ProducerEnd::Stopped) | None => Ok(RunOutcome::Aborted {
            reason: "chunk producer stopped before the end of the stream".to_string(),
            manifest: builder.partial(),
        }),
    }
}

/// Write `run` to its record key, retrying with `policy`
pub async fn persist_run(store: &Arc<dyn ObjectStore>, run: &BackupRun, policy: &RetryPolicy) -> Result<()> {
    let body = Bytes::from(run.to_json()?);
    let key = run.record_key();

    with_backoff("put run record", policy, |_attempt| {
        let store = Arc::clone(store);
        let body = body.clone();
        let key = key.clone();
        async move { store.put_object(&key, body, RECORD_STORAGE_CLASS).await }
    })
    .await
    .map_err(|e| BackupError::upload(e.to_string()))?;

    info!(key = %key, status = run.outcome.status(), "Stored run record");
    Ok(())
}
