/*!
Error types for the zfs3 upload engine.

Errors fall into three classes: chunk-scoped failures that the retry governor absorbs
(`Compression`, `Upload`, `IntegrityCheckFailed`), run-scoped failures that end a run
(`StreamRead`, `Cancelled`, configuration and collaborator errors), and internal
invariant violations (`IncompleteManifest`, `DuplicateCommit`) that indicate a bug.
*/

use thiserror::Error;

/// Result type used throughout zfs3-core.
pub type Result<T> = std::result::Result<T, BackupError>;

/// Errors that can occur while backing up or restoring a snapshot stream.
#[derive(Error, Debug)]
pub enum BackupError {
    /// Reading the source stream failed before it was fully chunked
    #[error("Stream read error after {offset} bytes: {source}")]
    StreamRead {
        offset: u64,
        #[source]
        source: std::io::Error,
    },

    /// A snapshot or object that was asked for does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Compressing or decompressing a chunk failed
    #[error("Compression error: {0}")]
    Compression(String),

    /// Writing to or reading from the object store failed
    #[error("Upload error: {0}")]
    Upload(String),

    /// Stored bytes did not hash to the value computed locally
    #[error("Integrity check failed for {key}: expected hash {expected}, got {actual}")]
    IntegrityCheckFailed {
        key: String,
        expected: String,
        actual: String,
    },

    /// A chunk used up its retry budget
    #[error("Chunk {sequence} failed after {attempts} attempts: {last_error}")]
    RetryExhausted {
        sequence: u64,
        attempts: u32,
        last_error: String,
    },

    /// Finalization found sequences that were neither committed nor failed
    #[error("Manifest for {dataset_id} is incomplete: missing sequences {missing:?}")]
    IncompleteManifest { dataset_id: String, missing: Vec<u64> },

    /// The same sequence was committed twice
    #[error("Sequence {0} was already recorded in the manifest")]
    DuplicateCommit(u64),

    /// The run was cancelled
    #[error("Backup cancelled")]
    Cancelled,

    /// A remote snapshot chain is broken
    #[error("Integrity error: {0}")]
    Chain(String),

    /// I/O errors outside the chunked stream (local store, child processes)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid configuration or arguments
    #[error("Validation error: {0}")]
    Validation(String),
}

impl BackupError {
    /// Create a new compression error
    pub fn compression<S: Into<String>>(msg: S) -> Self {
        Self::Compression(msg.into())
    }

    /// Create a new upload error
    pub fn upload<S: Into<String>>(msg: S) -> Self {
        Self::Upload(msg.into())
    }

    /// Create a new validation error
    pub fn validation<S: Into<String>>(msg: S) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a new not-found error
    pub fn not_found<S: Into<String>>(msg: S) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a new chain integrity error
    pub fn chain<S: Into<String>>(msg: S) -> Self {
        Self::Chain(msg.into())
    }

    /// Wrap a read failure of the source stream
    pub fn stream_read(offset: u64, source: std::io::Error) -> Self {
        Self::StreamRead { offset, source }
    }

    /// Whether the retry governor may try the failed attempt again
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Compression(_) | Self::Upload(_) | Self::IntegrityCheckFailed { .. }
        )
    }

    /// Whether the error is a broken invariant rather than an operational failure
    pub fn is_internal(&self) -> bool {
        matches!(self, Self::IncompleteManifest { .. } | Self::DuplicateCommit(_))
    }
}
