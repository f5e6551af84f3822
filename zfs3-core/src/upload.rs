/*!
Upload attempts and the bounded worker pool that runs them.

An attempt compresses the chunk (or reuses the result of an earlier attempt), hashes the
compressed bytes, writes them under the chunk's key and checks the store's receipt
against the local hash. The pool never runs more than `concurrency` attempts at once;
the caller decides what to feed it.
*/

use bytes::Bytes;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, trace};

use crate::chunker::Chunk;
use crate::compression::{CompressionAdapter, Compressor};
use crate::manifest::{compute_checksum, CommittedChunk};
use crate::observability::AttemptTimer;
use crate::store::ObjectStore;
use crate::{BackupError, Result};

/// Compressed bytes of a chunk and their checksum, kept across attempts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedBody {
    pub body: Bytes,
    pub checksum: String,
}

/// One upload attempt of one chunk
///
/// Owned by exactly one party at a time: the pool while the attempt runs, the retry
/// path while it waits for its backoff delay.
#[derive(Debug, Clone)]
pub struct UploadTask {
    pub chunk: Chunk,
    pub key: String,
    /// Zero-based attempt index
    pub attempt: u32,
    prepared: Option<PreparedBody>,
    previous: Option<CommittedChunk>,
}

impl UploadTask {
    pub fn new(chunk: Chunk, key: String) -> Self {
        Self {
            chunk,
            key,
            attempt: 0,
            prepared: None,
            previous: None,
        }
    }

    /// Commit without uploading if `previous` already holds identical bytes at this key
    pub fn with_previous(mut self, previous: CommittedChunk) -> Self {
        self.previous = Some(previous);
        self
    }

    pub fn sequence(&self) -> u64 {
        self.chunk.sequence
    }

    /// The same chunk as attempt `attempt`, keeping any cached compressed body
    pub fn into_retry(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    pub fn prepared(&self) -> Option<&PreparedBody> {
        self.prepared.as_ref()
    }
}

/// What a finished attempt hands back: the task (for a retry) and its result
#[derive(Debug)]
pub struct AttemptReport {
    pub task: UploadTask,
    pub result: Result<CommittedChunk>,
}

/// Everything an attempt needs besides the task itself
pub struct UploadContext {
    pub store: Arc<dyn ObjectStore>,
    pub compressor: Arc<Compressor>,
    pub storage_class: String,
}

impl UploadContext {
    pub fn new(store: Arc<dyn ObjectStore>, compressor: Arc<Compressor>, storage_class: String) -> Self {
        Self {
            store,
            compressor,
            storage_class,
        }
    }
}

/// Compress and hash a chunk payload off the async threads
pub async fn prepare_body(compressor: Arc<Compressor>, payload: Bytes) -> Result<PreparedBody> {
    tokio::task::spawn_blocking(move || {
        let compressed = compressor.compress(&payload)?;
        let checksum = compute_checksum(&compressed);
        Ok(PreparedBody {
            body: Bytes::from(compressed),
            checksum,
        })
    })
    .await
    .map_err(|e| BackupError::compression(format!("compression task failed: {e}")))?
}

/// Run one attempt of `task`
///
/// Never panics out and always returns the task, so the caller can hand it to the
/// retry governor.
pub async fn run_attempt(ctx: Arc<UploadContext>, task: UploadTask) -> AttemptReport {
    let fallback = task.clone();
    match AssertUnwindSafe(attempt(ctx, task)).catch_unwind().await {
        Ok(report) => report,
        Err(_) => AttemptReport {
            task: fallback,
            result: Err(BackupError::upload("upload attempt panicked")),
        },
    }
}

async fn attempt(ctx: Arc<UploadContext>, mut task: UploadTask) -> AttemptReport {
    let timer = AttemptTimer::start();
    let result = attempt_inner(&ctx, &mut task).await;
    timer.finish(result.as_ref().ok().map(|c| c.stored_size));
    AttemptReport { task, result }
}

async fn attempt_inner(ctx: &UploadContext, task: &mut UploadTask) -> Result<CommittedChunk> {
    let prepared = match &task.prepared {
        Some(prepared) => prepared.clone(),
        None => {
            let prepared = prepare_body(Arc::clone(&ctx.compressor), task.chunk.payload.clone()).await?;
            task.prepared = Some(prepared.clone());
            prepared
        }
    };

    let stored_size = prepared.body.len() as u64;
    if let Some(previous) = &task.previous {
        let unchanged = previous.key == task.key
            && previous.checksum == prepared.checksum
            && previous.stored_size == stored_size;
        if unchanged && ctx.store.exists(&task.key).await? {
            debug!(sequence = task.chunk.sequence, key = %task.key, "Chunk already stored, skipping upload");
            return Ok(CommittedChunk {
                sequence: task.chunk.sequence,
                key: task.key.clone(),
                size: task.chunk.size,
                stored_size,
                checksum: prepared.checksum,
            });
        }
    }

    trace!(
        sequence = task.chunk.sequence,
        attempt = task.attempt,
        key = %task.key,
        "Uploading chunk"
    );
    let receipt = ctx
        .store
        .put_object(&task.key, prepared.body, &ctx.storage_class)
        .await?;

    if receipt.checksum != prepared.checksum {
        return Err(BackupError::IntegrityCheckFailed {
            key: task.key.clone(),
            expected: prepared.checksum,
            actual: receipt.checksum,
        });
    }
    if receipt.size != stored_size {
        return Err(BackupError::upload(format!(
            "store acknowledged {} bytes for '{}' but {stored_size} were sent",
            receipt.size, task.key
        )));
    }

    debug!(
        sequence = task.chunk.sequence,
        attempt = task.attempt,
        key = %task.key,
        stored_size,
        "Chunk committed"
    );
    Ok(CommittedChunk {
        sequence: task.chunk.sequence,
        key: task.key.clone(),
        size: task.chunk.size,
        stored_size,
        checksum: prepared.checksum,
    })
}

/// Fixed-size pool of concurrent upload attempts
pub struct UploadPool {
    ctx: Arc<UploadContext>,
    in_flight: JoinSet<AttemptReport>,
    concurrency: usize,
    peak: usize,
}

impl UploadPool {
    pub fn new(ctx: Arc<UploadContext>, concurrency: usize) -> Self {
        Self {
            ctx,
            in_flight: JoinSet::new(),
            concurrency: concurrency.max(1),
            peak: 0,
        }
    }

    pub fn has_capacity(&self) -> bool {
        self.in_flight.len() < self.concurrency
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_idle(&self) -> bool {
        self.in_flight.is_empty()
    }

    /// Highest number of simultaneous attempts seen so far
    pub fn peak(&self) -> usize {
        self.peak
    }

    /// Start an attempt
    ///
    /// # Errors
    /// Returns the task back if the pool is full.
    pub fn submit(&mut self, task: UploadTask) -> std::result::Result<(), UploadTask> {
        if !self.has_capacity() {
            return Err(task);
        }
        self.in_flight.spawn(run_attempt(Arc::clone(&self.ctx), task));
        self.peak = self.peak.max(self.in_flight.len());
        Ok(())
    }

    /// Wait for the next attempt to finish; `None` when nothing is in flight
    pub async fn next_report(&mut self) -> Option<AttemptReport> {
        loop {
            match self.in_flight.join_next().await? {
                Ok(report) => return Some(report),
                // only aborted attempts end up here; they carry no outcome
                Err(e) => debug!(error = %e, "Upload attempt ended without a report"),
            }
        }
    }

    /// Abandon every running attempt
    pub async fn abort_all(&mut self) {
        self.in_flight.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CompressorKind;
    use crate::store::{MemoryObjectStore, MockObjectStore, PutReceipt};

    fn task(sequence: u64, data: &'static [u8]) -> UploadTask {
        UploadTask::new(
            Chunk::new(sequence, Bytes::from_static(data)),
            format!("p/ds/chunk-{sequence:08}"),
        )
    }

    fn context(store: Arc<dyn ObjectStore>, kind: CompressorKind) -> Arc<UploadContext> {
        Arc::new(UploadContext::new(
            store,
            Arc::new(Compressor::for_kind(kind, 1).unwrap()),
            "STANDARD_IA".to_string(),
        ))
    }

    #[tokio::test]
    async fn test_successful_attempt_commits_chunk() {
        let store = MemoryObjectStore::new();
        let ctx = context(Arc::new(store.clone()), CompressorKind::Single);

        let report = run_attempt(ctx, task(3, b"payload payload payload")).await;
        let committed = report.result.unwrap();

        assert_eq!(committed.sequence, 3);
        assert_eq!(committed.size, 23);
        let stored = store.get_object(&committed.key).await.unwrap();
        assert_eq!(committed.checksum, compute_checksum(&stored));
        assert_eq!(committed.stored_size, stored.len() as u64);
        assert_eq!(store.storage_class_of(&committed.key).as_deref(), Some("STANDARD_IA"));
    }

    #[tokio::test]
    async fn test_checksum_mismatch_is_integrity_failure() {
        let mut mock = MockObjectStore::new();
        mock.expect_put_object().returning(|key, body, _| {
            Ok(PutReceipt {
                key: key.to_string(),
                checksum: "0".repeat(64),
                size: body.len() as u64,
                etag: None,
            })
        });
        let ctx = context(Arc::new(mock), CompressorKind::Identity);

        let report = run_attempt(ctx, task(0, b"abc")).await;
        match report.result {
            Err(BackupError::IntegrityCheckFailed { key, .. }) => assert_eq!(key, "p/ds/chunk-00000000"),
            other => panic!("expected integrity failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_failed_attempt_keeps_compressed_body() {
        let mut mock = MockObjectStore::new();
        mock.expect_put_object()
            .times(1)
            .returning(|_, _, _| Err(BackupError::upload("503 Slow Down")));
        let ctx = context(Arc::new(mock), CompressorKind::Single);

        let report = run_attempt(ctx, task(1, b"retry me")).await;
        assert!(report.result.unwrap_err().is_retryable());

        let prepared = report.task.prepared().cloned().unwrap();
        assert_eq!(prepared.checksum, compute_checksum(&prepared.body));

        let retried = report.task.into_retry(1);
        assert_eq!(retried.attempt, 1);
        assert_eq!(retried.prepared(), Some(&prepared));
    }

    #[tokio::test]
    async fn test_pool_respects_capacity() {
        let store: Arc<dyn ObjectStore> = Arc::new(MemoryObjectStore::new());
        let mut pool = UploadPool::new(context(store, CompressorKind::Identity), 2);

        assert!(pool.submit(task(0, b"a")).is_ok());
        assert!(pool.submit(task(1, b"b")).is_ok());
        let rejected = pool.submit(task(2, b"c")).unwrap_err();
        assert_eq!(rejected.sequence(), 2);
        assert_eq!(pool.peak(), 2);

        let mut sequences = Vec::new();
        while let Some(report) = pool.next_report().await {
            sequences.push(report.result.unwrap().sequence);
        }
        sequences.sort();
        assert_eq!(sequences, vec![0, 1]);
        assert!(pool.is_idle());
    }

    #[tokio::test]
    async fn test_previous_identical_chunk_is_not_uploaded_again() {
        let store = MemoryObjectStore::new();
        let ctx = context(Arc::new(store.clone()), CompressorKind::Identity);
        let first = run_attempt(Arc::clone(&ctx), task(0, b"same bytes")).await.result.unwrap();

        let mut mock = MockObjectStore::new();
        mock.expect_exists().times(1).returning(|_| Ok(true));
        mock.expect_put_object().never();
        let resumed = run_attempt(
            context(Arc::new(mock), CompressorKind::Identity),
            task(0, b"same bytes").with_previous(first.clone()),
        )
        .await;
        assert_eq!(resumed.result.unwrap(), first);
    }

    #[tokio::test]
    async fn test_previous_with_other_checksum_is_uploaded() {
        let store = MemoryObjectStore::new();
        let ctx = context(Arc::new(store.clone()), CompressorKind::Identity);
        let mut stale = run_attempt(Arc::clone(&ctx), task(0, b"old bytes!")).await.result.unwrap();
        stale.checksum = compute_checksum(b"something else");

        let committed = run_attempt(ctx, task(0, b"new bytes!").with_previous(stale)).await.result.unwrap();
        assert_eq!(store.get_object(&committed.key).await.unwrap(), Bytes::from_static(b"new bytes!"));
    }
}
