//! Configuration for upload runs and object store selection
//!
//! A [`RunConfig`] is built once when a run starts, validated, and then shared by
//! reference with every pipeline component. [`StoreConfig`] selects and parameterizes
//! the object store the chunks are written to.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;
use zfs3_retry::RetryPolicy;

use crate::manifest::{chunk_key, manifest_key};
use crate::{BackupError, Result};

const KIB: u64 = 1024;
const MIB: u64 = 1024 * KIB;
const GIB: u64 = 1024 * MIB;
const TIB: u64 = 1024 * GIB;

/// S3 allows part numbers 1..=10000; keep a margin like the multipart limit does
const MAX_CHUNKS_PER_STREAM: u64 = 9999;
const MIN_OPTIMIZED_CHUNK_SIZE: u64 = 10 * MIB;

/// Largest object a single S3 PUT accepts
pub const MAX_CHUNK_SIZE: u64 = 5 * GIB;
/// Upper bound on concurrent uploads
pub const MAX_CONCURRENCY: usize = 256;
/// Upper bound on chunks buffered between the reader and the uploaders
pub const MAX_QUEUE_DEPTH: usize = 1024;

/// Default chunk size for streams without a size estimate
pub const DEFAULT_CHUNK_SIZE: u64 = 64 * MIB;
/// Default number of concurrent uploads
pub const DEFAULT_CONCURRENCY: usize = 4;
/// Default retries per chunk after the first attempt
pub const DEFAULT_MAX_RETRIES: u32 = 3;
/// Default S3 storage class for chunk objects
pub const DEFAULT_STORAGE_CLASS: &str = "STANDARD_IA";
/// Default key prefix under which datasets are stored
pub const DEFAULT_KEY_PREFIX: &str = "zfs3backup";

/// Compression applied to every chunk before upload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressorKind {
    /// Store chunks as-is
    Identity,
    /// One gzip stream per chunk
    Single,
    /// Multi-member gzip per chunk with members compressed in parallel
    Parallel,
}

impl CompressorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompressorKind::Identity => "identity",
            CompressorKind::Single => "single",
            CompressorKind::Parallel => "parallel",
        }
    }
}

impl fmt::Display for CompressorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CompressorKind {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "identity" | "none" => Ok(CompressorKind::Identity),
            "single" | "gzip" => Ok(CompressorKind::Single),
            "parallel" | "pigz" => Ok(CompressorKind::Parallel),
            other => Err(BackupError::validation(format!(
                "unknown compressor '{other}' (expected identity, single or parallel)"
            ))),
        }
    }
}

/// Immutable parameters of one upload run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    /// Bytes per chunk before compression
    pub chunk_size: u64,
    /// Maximum number of upload attempts in flight
    pub concurrency: usize,
    /// Retries per chunk after its first attempt
    pub max_retries: u32,
    pub compressor: CompressorKind,
    /// gzip level (0-9) for the gzip compressors
    pub compression_level: u32,
    /// Storage class every chunk object is written with
    pub storage_class: String,
    /// Key prefix under which `{dataset_id}/chunk-{sequence}` keys are placed
    pub key_prefix: String,
    /// Ready queue capacity; defaults to twice the concurrency
    pub queue_depth: Option<usize>,
    pub retry_initial_delay_ms: u64,
    pub retry_max_delay_ms: u64,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            concurrency: DEFAULT_CONCURRENCY,
            max_retries: DEFAULT_MAX_RETRIES,
            compressor: CompressorKind::Parallel,
            compression_level: 1,
            storage_class: DEFAULT_STORAGE_CLASS.to_string(),
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            queue_depth: None,
            retry_initial_delay_ms: 200,
            retry_max_delay_ms: 10_000,
        }
    }
}

impl RunConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(BackupError::validation("chunk_size must be > 0"));
        }
        if self.chunk_size > MAX_CHUNK_SIZE || usize::try_from(self.chunk_size).is_err() {
            return Err(BackupError::validation(format!(
                "chunk_size must be at most {MAX_CHUNK_SIZE} bytes"
            )));
        }
        if self.concurrency == 0 || self.concurrency > MAX_CONCURRENCY {
            return Err(BackupError::validation(format!(
                "concurrency must be between 1 and {MAX_CONCURRENCY}"
            )));
        }
        if let Some(depth) = self.queue_depth {
            if depth == 0 || depth > MAX_QUEUE_DEPTH {
                return Err(BackupError::validation(format!(
                    "queue_depth must be between 1 and {MAX_QUEUE_DEPTH}"
                )));
            }
        }
        if self.compression_level > 9 {
            return Err(BackupError::validation("compression_level must be between 0 and 9"));
        }
        if self.storage_class.trim().is_empty() {
            return Err(BackupError::validation("storage_class cannot be empty"));
        }
        if self.retry_max_delay_ms < self.retry_initial_delay_ms {
            return Err(BackupError::validation(
                "retry_max_delay_ms must be >= retry_initial_delay_ms",
            ));
        }

        let cpus = num_cpus::get();
        if self.concurrency > cpus * 8 {
            warn!(
                concurrency = self.concurrency,
                cpus, "concurrency is far above available parallelism"
            );
        }
        Ok(())
    }

    /// Capacity of the queue between the chunker and the uploaders
    pub fn queue_capacity(&self) -> usize {
        self.queue_depth
            .unwrap_or_else(|| self.concurrency.saturating_mul(2))
            .max(1)
    }

    /// Most chunks the dispatcher holds at once, counting uploads in flight and
    /// chunks waiting out a retry delay
    pub fn max_unresolved(&self) -> usize {
        self.concurrency.saturating_add(self.queue_capacity())
    }

    /// Chunk size as an in-memory buffer length
    pub fn chunk_len(&self) -> usize {
        usize::try_from(self.chunk_size).unwrap_or(usize::MAX)
    }

    /// Per-chunk retry policy derived from this configuration
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries).with_delays(
            Duration::from_millis(self.retry_initial_delay_ms),
            Duration::from_millis(self.retry_max_delay_ms),
            2.0,
        )
    }

    /// Object key of chunk `sequence` of `dataset_id`
    pub fn chunk_key(&self, dataset_id: &str, sequence: u64) -> String {
        chunk_key(&self.key_prefix, dataset_id, sequence)
    }

    /// Object key of the manifest record of `dataset_id`
    pub fn manifest_key(&self, dataset_id: &str) -> String {
        manifest_key(&self.key_prefix, dataset_id)
    }
}

/// Enumeration of supported object store backends
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreBackend {
    /// Local filesystem directory
    Local,
    /// S3 or an S3-compatible service
    S3,
    /// Process memory; used for dry runs
    Memory,
}

/// How the S3 client authenticates
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Credentials {
    /// Default AWS provider chain (environment, shared config, instance roles)
    Environment,
    /// Named profile from the shared AWS config files
    Profile(String),
    /// Explicit key pair
    Static {
        access_key_id: String,
        secret_access_key: String,
        session_token: Option<String>,
    },
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credentials::Environment => f.write_str("Environment"),
            Credentials::Profile(name) => f.debug_tuple("Profile").field(name).finish(),
            Credentials::Static { access_key_id, .. } => f
                .debug_struct("Static")
                .field("access_key_id", access_key_id)
                .finish_non_exhaustive(),
        }
    }
}

/// Configuration structure for object store settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    /// Bucket name (required for S3)
    pub bucket: Option<String>,
    /// Region; defaults to the provider chain
    pub region: Option<String>,
    /// Custom endpoint for S3-compatible services; `None` uses AWS
    pub endpoint: Option<String>,
    pub credentials: Credentials,
    /// Base directory for the local backend
    pub local_base_path: Option<PathBuf>,
}

impl StoreConfig {
    /// Configuration for a local directory store
    pub fn local<P: Into<PathBuf>>(base_path: P) -> Self {
        StoreConfig {
            backend: StoreBackend::Local,
            bucket: None,
            region: None,
            endpoint: None,
            credentials: Credentials::Environment,
            local_base_path: Some(base_path.into()),
        }
    }

    /// Configuration for an in-memory store
    pub fn memory() -> Self {
        StoreConfig {
            backend: StoreBackend::Memory,
            bucket: None,
            region: None,
            endpoint: None,
            credentials: Credentials::Environment,
            local_base_path: None,
        }
    }

    /// Create an S3 configuration with the specified bucket
    pub fn s3_with_bucket(bucket: String) -> Self {
        StoreConfig {
            backend: StoreBackend::S3,
            bucket: Some(bucket),
            region: None,
            endpoint: None,
            credentials: Credentials::Environment,
            local_base_path: None,
        }
    }

    /// Set a custom endpoint; `"aws"` selects the default AWS endpoint
    pub fn with_endpoint<S: Into<String>>(mut self, endpoint: S) -> Self {
        let endpoint = endpoint.into();
        self.endpoint = if endpoint.is_empty() || endpoint.eq_ignore_ascii_case("aws") {
            None
        } else {
            Some(endpoint)
        };
        self
    }

    pub fn with_region<S: Into<String>>(mut self, region: S) -> Self {
        self.region = Some(region.into());
        self
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = credentials;
        self
    }

    /// Parse a store URI and create the matching configuration
    ///
    /// Supports `s3://bucket/prefix` for S3 and plain paths for local storage.
    /// Returns the config and the key prefix component (empty for local paths).
    pub fn from_uri(uri: &str) -> Result<(StoreConfig, String)> {
        if let Some(s3_part) = uri.strip_prefix("s3://") {
            let mut parts = s3_part.splitn(2, '/');
            let bucket = parts.next().unwrap_or_default();
            if bucket.is_empty() {
                return Err(BackupError::validation("Invalid S3 URI: missing bucket name"));
            }
            let prefix = parts.next().unwrap_or_default().trim_end_matches('/').to_string();
            Ok((StoreConfig::s3_with_bucket(bucket.to_string()), prefix))
        } else if uri.is_empty() {
            Err(BackupError::validation("store URI cannot be empty"))
        } else {
            Ok((StoreConfig::local(uri), String::new()))
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        match self.backend {
            StoreBackend::S3 => {
                if self.bucket.as_deref().map_or(true, str::is_empty) {
                    return Err(BackupError::validation(
                        "S3 backend requires a valid bucket name",
                    ));
                }
                if let Credentials::Static {
                    access_key_id,
                    secret_access_key,
                    ..
                } = &self.credentials
                {
                    if access_key_id.is_empty() || secret_access_key.is_empty() {
                        return Err(BackupError::validation(
                            "explicit credentials need both an access key id and a secret",
                        ));
                    }
                }
            }
            StoreBackend::Local => {
                if self.local_base_path.is_none() {
                    return Err(BackupError::validation(
                        "local backend requires a base directory",
                    ));
                }
            }
            StoreBackend::Memory => {}
        }
        Ok(())
    }
}

/// Parse a human size such as `10M`, `1G`, `512K` or `4096`
pub fn parse_size(size: &str) -> Result<u64> {
    let upper = size.trim().to_ascii_uppercase();
    let size = upper.strip_suffix('B').unwrap_or(upper.as_str());
    let (digits, unit) = match size.chars().last() {
        Some('K') => (&size[..size.len() - 1], KIB),
        Some('M') => (&size[..size.len() - 1], MIB),
        Some('G') => (&size[..size.len() - 1], GIB),
        Some('T') => (&size[..size.len() - 1], TIB),
        Some(_) => (size, 1),
        None => return Err(BackupError::validation("size cannot be empty")),
    };

    let value: u64 = digits
        .trim()
        .parse()
        .map_err(|_| BackupError::validation(format!("invalid size '{size}'")))?;
    value
        .checked_mul(unit)
        .ok_or_else(|| BackupError::validation(format!("size '{size}' is too large")))
}

/// Chunk size that keeps a stream of `estimated` bytes under the part limit
/// The estimate is padded by 5% and the result stays between 10 MiB and [`MAX_CHUNK_SIZE`].
/// The estimate is padded by 5% and the result is never below 10 MiB.
pub fn optimize_chunk_size(estimated: u64) -> u64 {
    let padded = estimated as f64 * 1.05;
    let per_chunk = (padded / MAX_CHUNKS_PER_STREAM as f64).ceil() as u64;
    per_chunk.clamp(MIN_OPTIMIZED_CHUNK_SIZE, MAX_CHUNK_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_run_config_is_valid() {
        let config = RunConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.queue_capacity(), 8);
        assert_eq!(config.retry_policy().max_retries, 3);
    }

    #[test]
    fn test_run_config_rejects_zero_values() {
        let mut config = RunConfig::default();
        config.chunk_size = 0;
        assert!(config.validate().is_err());

        let mut config = RunConfig::default();
        config.concurrency = 0;
        assert!(config.validate().is_err());

        let mut config = RunConfig::default();
        config.queue_depth = Some(0);
        assert!(config.validate().is_err());

        let mut config = RunConfig::default();
        config.compression_level = 10;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_run_config_rejects_oversized_values() {
        let mut config = RunConfig::default();
        config.chunk_size = MAX_CHUNK_SIZE + 1;
        assert!(config.validate().is_err());
        config.chunk_size = parse_size("1T").unwrap();
        assert!(config.validate().is_err());
        config.chunk_size = MAX_CHUNK_SIZE;
        assert!(config.validate().is_ok());

        let mut config = RunConfig::default();
        config.concurrency = usize::MAX;
        assert!(config.validate().is_err());
        assert_eq!(config.queue_capacity(), usize::MAX);
        assert_eq!(config.max_unresolved(), usize::MAX);

        let mut config = RunConfig::default();
        config.queue_depth = Some(MAX_QUEUE_DEPTH + 1);
        assert!(config.validate().is_err());
        config.queue_depth = Some(MAX_QUEUE_DEPTH);
        assert!(config.validate().is_ok());
        assert_eq!(config.max_unresolved(), DEFAULT_CONCURRENCY + MAX_QUEUE_DEPTH);
    }

    #[test]
    fn test_keys_are_deterministic() {
        let config = RunConfig {
            key_prefix: "backups/".to_string(),
            ..RunConfig::default()
        };
        assert_eq!(
            config.chunk_key("tank/data@daily-1", 7),
            "backups/tank/data@daily-1/chunk-00000007"
        );
        assert_eq!(
            config.chunk_key("tank/data@daily-1", 7),
            config.chunk_key("tank/data@daily-1", 7)
        );
        assert_eq!(
            config.manifest_key("tank/data@daily-1"),
            "backups/tank/data@daily-1/manifest.json"
        );
    }

    #[test]
    fn test_compressor_kind_parsing() {
        assert_eq!("none".parse::<CompressorKind>().unwrap(), CompressorKind::Identity);
        assert_eq!("gzip".parse::<CompressorKind>().unwrap(), CompressorKind::Single);
        assert_eq!("Parallel".parse::<CompressorKind>().unwrap(), CompressorKind::Parallel);
        assert!("lz4".parse::<CompressorKind>().is_err());
    }

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("4096").unwrap(), 4096);
        assert_eq!(parse_size("10M").unwrap(), 10 * MIB);
        assert_eq!(parse_size(" 1g ").unwrap(), GIB);
        assert_eq!(parse_size("512KB").unwrap(), 512 * KIB);
        assert_eq!(parse_size("2T").unwrap(), 2 * TIB);
        assert!(parse_size("").is_err());
        assert!(parse_size("abcM").is_err());
    }

    #[test]
    fn test_optimize_chunk_size() {
        assert_eq!(optimize_chunk_size(0), MIN_OPTIMIZED_CHUNK_SIZE);
        assert_eq!(optimize_chunk_size(GIB), MIN_OPTIMIZED_CHUNK_SIZE);

        let huge = 2 * TIB;
        let chunk = optimize_chunk_size(huge);
        assert!(chunk > MIN_OPTIMIZED_CHUNK_SIZE);
        assert!(huge.div_ceil(chunk) <= MAX_CHUNKS_PER_STREAM);
        assert_eq!(optimize_chunk_size(u64::MAX), MAX_CHUNK_SIZE);
    }

    #[test]
    fn test_from_uri_s3() {
        let (config, prefix) = StoreConfig::from_uri("s3://test-bucket/zfs3backup/").unwrap();
        assert_eq!(config.backend, StoreBackend::S3);
        assert_eq!(config.bucket, Some("test-bucket".to_string()));
        assert_eq!(prefix, "zfs3backup");
    }

    #[test]
    fn test_from_uri_local() {
        let (config, prefix) = StoreConfig::from_uri("/var/backups").unwrap();
        assert_eq!(config.backend, StoreBackend::Local);
        assert_eq!(config.local_base_path, Some(PathBuf::from("/var/backups")));
        assert!(prefix.is_empty());
    }

    #[test]
    fn test_from_uri_invalid_s3() {
        let result = StoreConfig::from_uri("s3://");
        assert!(result.unwrap_err().to_string().contains("missing bucket name"));
    }

    #[test]
    fn test_validate_store_config() {
        let mut config = StoreConfig::s3_with_bucket("bucket".to_string());
        assert!(config.validate().is_ok());

        config.bucket = Some(String::new());
        assert!(config.validate().is_err());

        let config = StoreConfig::s3_with_bucket("bucket".to_string()).with_credentials(
            Credentials::Static {
                access_key_id: "AKIA".to_string(),
                secret_access_key: String::new(),
                session_token: None,
            },
        );
        assert!(config.validate().is_err());
        assert!(StoreConfig::memory().validate().is_ok());
    }

    #[test]
    fn test_endpoint_aws_means_default() {
        let config = StoreConfig::s3_with_bucket("b".to_string()).with_endpoint("aws");
        assert!(config.endpoint.is_none());

        let config = StoreConfig::s3_with_bucket("b".to_string())
            .with_endpoint("https://s3.wasabisys.com");
        assert_eq!(config.endpoint.as_deref(), Some("https://s3.wasabisys.com"));
    }

    #[test]
    fn test_credentials_debug_hides_secret() {
        let creds = Credentials::Static {
            access_key_id: "AKIA123".to_string(),
            secret_access_key: "hunter2".to_string(),
            session_token: None,
        };
        let rendered = format!("{creds:?}");
        assert!(rendered.contains("AKIA123"));
        assert!(!rendered.contains("hunter2"));
    }
}
