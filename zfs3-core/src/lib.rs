/*!
# zfs3 Core Engine

Chunked, concurrent, retrying upload of ZFS snapshot streams to object storage.

A snapshot stream is cut into fixed-size, sequence-numbered chunks. Each chunk is
compressed, checksummed, and uploaded under a deterministic key by a bounded pool of
workers. Failed attempts are retried with backoff up to a ceiling, and the results are
reassembled into an ordered manifest that describes the whole backup.

- Pluggable object stores (local filesystem, in-memory, S3 behind the `s3` feature)
- Identity, gzip and parallel gzip compression
- Run records with chain lineage for incremental snapshot backups
- Verification and in-order restore of stored backups
- Structured logging, plus Prometheus metrics behind the `metrics` feature

## Usage

```rust
# let rt = tokio::runtime::Runtime::new().unwrap();
# rt.block_on(async {
use std::sync::Arc;
use zfs3_core::{MemoryObjectStore, Orchestrator, Restorer, RunConfig, RunOutcome};

let store = Arc::new(MemoryObjectStore::new());
let config = RunConfig {
    chunk_size: 256,
    ..RunConfig::default()
};

// Back up a stream
let orchestrator = Orchestrator::new(config, store.clone())?;
let run = orchestrator
    .run_and_record("tank/data@daily-1", std::io::Cursor::new(vec![1u8; 1000]), None)
    .await?;
assert!(matches!(run.outcome, RunOutcome::Succeeded { .. }));

// Restore it
let mut restored = Vec::new();
Restorer::new(store).restore(&run, &mut restored).await?;
assert_eq!(restored.len(), 1000);
# Ok::<(), zfs3_core::BackupError>(())
# }).unwrap();
```
*/

pub mod catalog;
pub mod chunker;
pub mod compression;
pub mod config;
pub mod error;
pub mod manifest;
pub mod observability;
pub mod pipeline;
pub mod restore;
pub mod retry;
pub mod snapshot;
pub mod store;
pub mod upload;


pub use catalog::{plan_full, Catalog, ChainHealth, PlannedBackup, RestorePlan, SnapshotStatus};
pub use chunker::{Chunk, Chunker};
pub use compression::{CompressionAdapter, Compressor, GzipCompressor, NoCompression, ParallelGzipCompressor};
pub use config::{
    optimize_chunk_size, parse_size, CompressorKind, Credentials, RunConfig, StoreBackend, StoreConfig,
};
pub use error::{BackupError, Result};
pub use manifest::{BackupRun, ChunkFailure, CommittedChunk, Lineage, Manifest, ManifestBuilder, RunOutcome};
pub use pipeline::{persist_run, Orchestrator};
pub use restore::{ChunkIssue, ChunkProblem, Restorer, VerifyReport};
pub use retry::{RetryGovernor, Verdict};
pub use snapshot::{LocalSnapshot, LocalSnapshots, ReceiveSink, SnapshotSource, SnapshotStream, ZfsSendSource};
pub use store::local::LocalObjectStore;
pub use store::memory::MemoryObjectStore;
#[cfg(feature = "s3")]
pub use store::s3::S3ObjectStore;
pub use store::{open_store, ObjectStore, PutReceipt};
