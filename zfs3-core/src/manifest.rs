/*!
Manifest building and the persisted run record.

Chunks complete in any order. [`ManifestBuilder`] keeps one slot per sequence number so
an out-of-order commit lands in its place directly and gaps are visible by scanning
the slots. Once the run resolves, the builder produces an ordered [`Manifest`] that is
stored, together with the run parameters and outcome, as a [`BackupRun`] record.
*/

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::config::{CompressorKind, RunConfig};
use crate::{BackupError, Result};

/// Current manifest format version for compatibility tracking
pub const MANIFEST_FORMAT_VERSION: u8 = 1;

/// File name of the run record stored next to a dataset's chunks
pub const MANIFEST_FILE_NAME: &str = "manifest.json";

fn dataset_prefix(prefix: &str, dataset_id: &str) -> String {
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        dataset_id.to_string()
    } else {
        format!("{prefix}/{dataset_id}")
    }
}

/// Object key for chunk `sequence` of `dataset_id`
///
/// Depends only on its arguments, so a re-run overwrites the same objects.
pub fn chunk_key(prefix: &str, dataset_id: &str, sequence: u64) -> String {
    format!("{}/chunk-{sequence:08}", dataset_prefix(prefix, dataset_id))
}

/// Object key for the run record of `dataset_id`
pub fn manifest_key(prefix: &str, dataset_id: &str) -> String {
    format!("{}/{MANIFEST_FILE_NAME}", dataset_prefix(prefix, dataset_id))
}

/// Compute the SHA-256 of `data` as lowercase hex
pub fn compute_checksum(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// A chunk that was stored and verified
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommittedChunk {
    pub sequence: u64,
    pub key: String,
    /// Raw chunk length before compression
    pub size: u64,
    /// Length of the object as stored
    pub stored_size: u64,
    /// SHA-256 (hex) of the stored object
    pub checksum: String,
}

/// A chunk that used up its retry budget
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkFailure {
    pub sequence: u64,
    pub attempts: u32,
    pub last_error: String,
}

impl ChunkFailure {
    pub fn into_error(self) -> BackupError {
        BackupError::RetryExhausted {
            sequence: self.sequence,
            attempts: self.attempts,
            last_error: self.last_error,
        }
    }
}

/// Ordered record of the committed chunks of one dataset stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub format_version: u8,
    pub dataset_id: String,
    /// Number of chunks the stream was cut into (as far as it was read)
    pub chunk_count: u64,
    /// Committed chunks in sequence order
    pub chunks: Vec<CommittedChunk>,
    /// Sum of the raw sizes of `chunks`
    pub total_size: u64,
    /// Sum of the stored sizes of `chunks`
    pub stored_size: u64,
}

impl Manifest {
    fn from_chunks(dataset_id: String, chunk_count: u64, chunks: Vec<CommittedChunk>) -> Self {
        let total_size = chunks.iter().map(|c| c.size).sum();
        let stored_size = chunks.iter().map(|c| c.stored_size).sum();
        Self {
            format_version: MANIFEST_FORMAT_VERSION,
            dataset_id,
            chunk_count,
            chunks,
            total_size,
            stored_size,
        }
    }

    /// Whether every sequence in `[0, chunk_count)` has exactly one committed chunk
    pub fn is_complete(&self) -> bool {
        self.chunks.len() as u64 == self.chunk_count
            && self
                .chunks
                .iter()
                .enumerate()
                .all(|(i, c)| c.sequence == i as u64)
    }

    /// Look up the committed chunk for `sequence`
    pub fn chunk(&self, sequence: u64) -> Option<&CommittedChunk> {
        self.chunks
            .binary_search_by_key(&sequence, |c| c.sequence)
            .ok()
            .map(|i| &self.chunks[i])
    }

    /// Check a manifest read back from storage before it is trusted
    pub fn validate(&self) -> Result<()> {
        if self.format_version > MANIFEST_FORMAT_VERSION {
            return Err(BackupError::validation(format!(
                "manifest format version {} is newer than supported version {}",
                self.format_version, MANIFEST_FORMAT_VERSION
            )));
        }
        if self.dataset_id.is_empty() {
            return Err(BackupError::validation("dataset_id cannot be empty"));
        }
        let ordered = self.chunks.windows(2).all(|w| w[0].sequence < w[1].sequence);
        if !ordered {
            return Err(BackupError::validation(
                "manifest chunks are not in strictly increasing sequence order",
            ));
        }
        if let Some(last) = self.chunks.last() {
            if last.sequence >= self.chunk_count {
                return Err(BackupError::validation(format!(
                    "chunk sequence {} is outside the chunk count {}",
                    last.sequence, self.chunk_count
                )));
            }
        }
        if self.total_size != self.chunks.iter().map(|c| c.size).sum::<u64>() {
            return Err(BackupError::validation("total_size does not match the chunk sizes"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
enum Slot {
    Pending,
    Committed(CommittedChunk),
    Failed(ChunkFailure),
}

/// Accumulates chunk outcomes in arbitrary completion order
///
/// # Example
/// ```rust
/// use zfs3_core::manifest::{CommittedChunk, ManifestBuilder};
///
/// let mut builder = ManifestBuilder::new("tank/data@daily-1");
/// for sequence in [1, 0] {
///     builder.record(CommittedChunk {
///         sequence,
///         key: format!("zfs3backup/tank/data@daily-1/chunk-{sequence:08}"),
///         size: 10,
///         stored_size: 4,
///         checksum: String::new(),
///     })?;
/// }
/// builder.set_chunk_count(2)?;
/// let (manifest, failures) = builder.finalize()?;
/// assert!(manifest.is_complete());
/// assert!(failures.is_empty());
/// # Ok::<(), zfs3_core::BackupError>(())
/// ```
#[derive(Debug, Clone)]
pub struct ManifestBuilder {
    dataset_id: String,
    slots: Vec<Slot>,
    chunk_count: Option<u64>,
}

impl ManifestBuilder {
    pub fn new<S: Into<String>>(dataset_id: S) -> Self {
        Self {
            dataset_id: dataset_id.into(),
            slots: Vec::new(),
            chunk_count: None,
        }
    }

    pub fn dataset_id(&self) -> &str {
        &self.dataset_id
    }

    fn slot_mut(&mut self, sequence: u64) -> Result<&mut Slot> {
        if let Some(count) = self.chunk_count {
            if sequence >= count {
                return Err(BackupError::validation(format!(
                    "sequence {sequence} is outside the chunk count {count}"
                )));
            }
        }
        let index = usize::try_from(sequence)
            .map_err(|_| BackupError::validation(format!("sequence {sequence} is out of range")))?;
        if index >= self.slots.len() {
            self.slots.resize(index + 1, Slot::Pending);
        }
        Ok(&mut self.slots[index])
    }

    /// Record the first successful upload of a chunk
    ///
    /// # Errors
    /// `DuplicateCommit` if the sequence was already resolved.
    pub fn record(&mut self, chunk: CommittedChunk) -> Result<()> {
        let sequence = chunk.sequence;
        let slot = self.slot_mut(sequence)?;
        if !matches!(slot, Slot::Pending) {
            return Err(BackupError::DuplicateCommit(sequence));
        }
        *slot = Slot::Committed(chunk);
        Ok(())
    }

    /// Record that a chunk failed permanently
    pub fn mark_failed(&mut self, failure: ChunkFailure) -> Result<()> {
        let sequence = failure.sequence;
        let slot = self.slot_mut(sequence)?;
        if !matches!(slot, Slot::Pending) {
            return Err(BackupError::DuplicateCommit(sequence));
        }
        *slot = Slot::Failed(failure);
        Ok(())
    }

    /// Fix the number of chunks once the stream has been fully read
    pub fn set_chunk_count(&mut self, chunk_count: u64) -> Result<()> {
        if (self.slots.len() as u64) > chunk_count {
            return Err(BackupError::validation(format!(
                "{} sequences were recorded but the stream only has {chunk_count} chunks",
                self.slots.len()
            )));
        }
        self.chunk_count = Some(chunk_count);
        Ok(())
    }

    pub fn chunk_count(&self) -> Option<u64> {
        self.chunk_count
    }

    /// Whether sequences `[0, chunk_count)` are all committed
    pub fn is_complete(&self, chunk_count: u64) -> bool {
        self.slots.len() as u64 == chunk_count
            && self.slots.iter().all(|s| matches!(s, Slot::Committed(_)))
    }

    /// Whether the chunk count is known and every sequence is committed or failed
    pub fn is_resolved(&self) -> bool {
        self.chunk_count.is_some() && self.missing().is_empty()
    }

    /// Sequences below the known chunk count with no outcome yet
    pub fn missing(&self) -> Vec<u64> {
        let count = self.chunk_count.unwrap_or(self.slots.len() as u64);
        (0..count)
            .filter(|&seq| {
                !matches!(
                    self.slots.get(seq as usize),
                    Some(Slot::Committed(_)) | Some(Slot::Failed(_))
                )
            })
            .collect()
    }

    pub fn committed_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| matches!(s, Slot::Committed(_)))
            .count()
    }

    /// Permanent failures recorded so far, in sequence order
    pub fn failures(&self) -> Vec<ChunkFailure> {
        self.slots
            .iter()
            .filter_map(|s| match s {
                Slot::Failed(f) => Some(f.clone()),
                _ => None,
            })
            .collect()
    }

    fn committed(&self) -> Vec<CommittedChunk> {
        self.slots
            .iter()
            .filter_map(|s| match s {
                Slot::Committed(c) => Some(c.clone()),
                _ => None,
            })
            .collect()
    }

    /// Manifest of whatever has been committed so far, without completeness checks
    pub fn partial(&self) -> Manifest {
        let count = self.chunk_count.unwrap_or(self.slots.len() as u64);
        Manifest::from_chunks(self.dataset_id.clone(), count, self.committed())
    }

    /// Produce the ordered manifest and the permanent failures
    ///
    /// # Errors
    /// `IncompleteManifest` if the chunk count is unknown or some sequence has neither
    /// a commit nor a failure record. A draining pipeline never reaches this.
    pub fn finalize(self) -> Result<(Manifest, Vec<ChunkFailure>)> {
        let missing = self.missing();
        if self.chunk_count.is_none() || !missing.is_empty() {
            return Err(BackupError::IncompleteManifest {
                dataset_id: self.dataset_id,
                missing,
            });
        }
        let failures = self.failures();
        Ok((self.partial(), failures))
    }
}

/// Terminal state of a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunOutcome {
    Succeeded {
        manifest: Manifest,
    },
    PartiallyFailed {
        manifest: Manifest,
        failures: Vec<ChunkFailure>,
    },
    Aborted {
        reason: String,
        /// Chunks committed before the run stopped
        manifest: Manifest,
    },
}

impl RunOutcome {
    /// Process exit status for this outcome
    pub fn exit_code(&self) -> i32 {
        match self {
            RunOutcome::Succeeded { .. } => 0,
            RunOutcome::PartiallyFailed { .. } => 2,
            RunOutcome::Aborted { .. } => 3,
        }
    }

    pub fn manifest(&self) -> &Manifest {
        match self {
            RunOutcome::Succeeded { manifest }
            | RunOutcome::PartiallyFailed { manifest, .. }
            | RunOutcome::Aborted { manifest, .. } => manifest,
        }
    }

    pub fn failed_sequences(&self) -> Vec<u64> {
        match self {
            RunOutcome::PartiallyFailed { failures, .. } => {
                failures.iter().map(|f| f.sequence).collect()
            }
            _ => Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, RunOutcome::Succeeded { .. })
    }

    pub fn status(&self) -> &'static str {
        match self {
            RunOutcome::Succeeded { .. } => "succeeded",
            RunOutcome::PartiallyFailed { .. } => "partially_failed",
            RunOutcome::Aborted { .. } => "aborted",
        }
    }
}

/// Where a backed-up stream sits in a snapshot chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lineage {
    /// Full snapshot name, e.g. `tank/data@daily-2`
    pub snapshot: String,
    /// Snapshot the stream is an increment from; `None` for a full stream
    pub parent: Option<String>,
    pub is_full: bool,
    /// Size estimate reported by the snapshot source, if any
    pub estimated_size: Option<u64>,
}

impl Lineage {
    pub fn full<S: Into<String>>(snapshot: S) -> Self {
        Self {
            snapshot: snapshot.into(),
            parent: None,
            is_full: true,
            estimated_size: None,
        }
    }

    pub fn incremental<S1: Into<String>, S2: Into<String>>(snapshot: S1, parent: S2) -> Self {
        Self {
            snapshot: snapshot.into(),
            parent: Some(parent.into()),
            is_full: false,
            estimated_size: None,
        }
    }

    pub fn with_estimated_size(mut self, estimated_size: u64) -> Self {
        self.estimated_size = Some(estimated_size);
        self
    }
}

/// The whole-operation record, stored as `manifest.json` next to the chunks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupRun {
    pub run_id: String,
    pub dataset_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub chunk_size: u64,
    pub concurrency: usize,
    pub max_retries: u32,
    pub compressor: CompressorKind,
    pub storage_class: String,
    pub key_prefix: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lineage: Option<Lineage>,
    pub outcome: RunOutcome,
}

impl BackupRun {
    pub fn new<S: Into<String>>(
        dataset_id: S,
        config: &RunConfig,
        started_at: DateTime<Utc>,
        outcome: RunOutcome,
    ) -> Self {
        Self {
            run_id: Uuid::new_v4().to_string(),
            dataset_id: dataset_id.into(),
            started_at,
            finished_at: Utc::now(),
            chunk_size: config.chunk_size,
            concurrency: config.concurrency,
            max_retries: config.max_retries,
            compressor: config.compressor,
            storage_class: config.storage_class.clone(),
            key_prefix: config.key_prefix.clone(),
            lineage: None,
            outcome,
        }
    }

    pub fn with_lineage(mut self, lineage: Lineage) -> Self {
        self.lineage = Some(lineage);
        self
    }

    pub fn manifest(&self) -> &Manifest {
        self.outcome.manifest()
    }

    pub fn exit_code(&self) -> i32 {
        self.outcome.exit_code()
    }

    /// Object key this record is stored under
    pub fn record_key(&self) -> String {
        manifest_key(&self.key_prefix, &self.dataset_id)
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    pub fn from_json(data: &[u8]) -> Result<Self> {
        let run: BackupRun = serde_json::from_slice(data)?;
        run.manifest().validate()?;
        Ok(run)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn committed(sequence: u64, size: u64) -> CommittedChunk {
        CommittedChunk {
            sequence,
            key: chunk_key("p", "ds", sequence),
            size,
            stored_size: size / 2,
            checksum: compute_checksum(&sequence.to_le_bytes()),
        }
    }

    #[test]
    fn test_chunk_key_format() {
        assert_eq!(chunk_key("zfs3backup", "tank@a", 0), "zfs3backup/tank@a/chunk-00000000");
        assert_eq!(chunk_key("zfs3backup///", "tank@a", 12), "zfs3backup/tank@a/chunk-00000012");
        assert_eq!(chunk_key("", "tank@a", 3), "tank@a/chunk-00000003");
        assert_eq!(manifest_key("x/", "tank@a"), "x/tank@a/manifest.json");
    }

    #[test]
    fn test_compute_checksum() {
        assert_eq!(
            compute_checksum(b"test data"),
            "916f0027a575074ce72a331777c3478d6513f786a591bd892da1a577bf2335f9"
        );
    }

    #[test]
    fn test_out_of_order_records_are_ordered() {
        let mut builder = ManifestBuilder::new("ds");
        for seq in [3, 0, 2, 1] {
            builder.record(committed(seq, 256)).unwrap();
        }
        builder.set_chunk_count(4).unwrap();

        assert!(builder.is_complete(4));
        let (manifest, failures) = builder.finalize().unwrap();
        assert!(failures.is_empty());
        let sequences: Vec<u64> = manifest.chunks.iter().map(|c| c.sequence).collect();
        assert_eq!(sequences, vec![0, 1, 2, 3]);
        assert_eq!(manifest.total_size, 1024);
        assert_eq!(manifest.stored_size, 512);
        assert!(manifest.is_complete());
    }

    #[test]
    fn test_duplicate_commit_is_rejected() {
        let mut builder = ManifestBuilder::new("ds");
        builder.record(committed(0, 1)).unwrap();
        assert!(matches!(
            builder.record(committed(0, 1)),
            Err(BackupError::DuplicateCommit(0))
        ));
    }

    #[test]
    fn test_commit_after_failure_is_rejected() {
        let mut builder = ManifestBuilder::new("ds");
        builder
            .mark_failed(ChunkFailure {
                sequence: 1,
                attempts: 4,
                last_error: "boom".to_string(),
            })
            .unwrap();
        assert!(builder.record(committed(1, 1)).unwrap_err().is_internal());
    }

    #[test]
    fn test_finalize_with_gap_is_incomplete() {
        let mut builder = ManifestBuilder::new("ds");
        builder.record(committed(0, 1)).unwrap();
        builder.record(committed(2, 1)).unwrap();
        builder.set_chunk_count(4).unwrap();

        assert!(!builder.is_resolved());
        match builder.finalize() {
            Err(BackupError::IncompleteManifest { missing, .. }) => assert_eq!(missing, vec![1, 3]),
            other => panic!("expected incomplete manifest, got {other:?}"),
        }
    }

    #[test]
    fn test_finalize_without_chunk_count_is_incomplete() {
        let mut builder = ManifestBuilder::new("ds");
        builder.record(committed(0, 1)).unwrap();
        assert!(matches!(
            builder.finalize(),
            Err(BackupError::IncompleteManifest { .. })
        ));
    }

    #[test]
    fn test_chunk_count_below_recorded_sequences() {
        let mut builder = ManifestBuilder::new("ds");
        builder.record(committed(5, 1)).unwrap();
        assert!(builder.set_chunk_count(3).is_err());
    }

    #[test]
    fn test_partial_manifest_keeps_failures_out() {
        let mut builder = ManifestBuilder::new("ds");
        builder.record(committed(0, 10)).unwrap();
        builder
            .mark_failed(ChunkFailure {
                sequence: 1,
                attempts: 4,
                last_error: "access denied".to_string(),
            })
            .unwrap();
        builder.set_chunk_count(2).unwrap();
        assert!(builder.is_resolved());

        let (manifest, failures) = builder.finalize().unwrap();
        assert_eq!(manifest.chunk_count, 2);
        assert_eq!(manifest.chunks.len(), 1);
        assert!(!manifest.is_complete());
        assert_eq!(failures[0].last_error, "access denied");
    }

    #[test]
    fn test_outcome_exit_codes() {
        let manifest = ManifestBuilder::new("ds").partial();
        assert_eq!(RunOutcome::Succeeded { manifest: manifest.clone() }.exit_code(), 0);
        assert_eq!(
            RunOutcome::PartiallyFailed {
                manifest: manifest.clone(),
                failures: vec![]
            }
            .exit_code(),
            2
        );
        assert_eq!(
            RunOutcome::Aborted {
                reason: "cancelled".to_string(),
                manifest
            }
            .exit_code(),
            3
        );
    }
}
