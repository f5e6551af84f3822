/*!
Compression adapters for chunk payloads.

Every adapter is a pure per-chunk transform: no state is carried from one chunk to the
next, so chunks can be compressed in any order and recompressed on retry with the same
result. The pipeline only sees [`Compressor`], a tagged variant chosen from the run
configuration.
*/

use flate2::{read::MultiGzDecoder, write::GzEncoder, Compression};
use rayon::prelude::*;
use std::io::{Read, Write};
use std::sync::Arc;

use crate::config::{CompressorKind, RunConfig};
use crate::{BackupError, Result};

/// Default size of the independently compressed members of a parallel gzip chunk
pub const DEFAULT_PARALLEL_BLOCK_SIZE: usize = 4 * 1024 * 1024;

/// Compression abstraction for chunk data
///
/// Implementations must be deterministic: compressing the same bytes twice yields the
/// same output, so a retried chunk hashes to the same checksum.
pub trait CompressionAdapter: Send + Sync {
    /// Compress the input data
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>>;

    /// Decompress the input data
    fn decompress(&self, compressed_data: &[u8]) -> Result<Vec<u8>>;

    /// Get the name of the compression algorithm
    fn algorithm_name(&self) -> &str;
}

/// Gzip compression adapter producing a single gzip member per chunk
#[derive(Debug, Clone)]
pub struct GzipCompressor {
    compression_level: Compression,
}

impl GzipCompressor {
    /// Create a new gzip compressor with default compression level (6)
    pub fn new() -> Self {
        Self {
            compression_level: Compression::default(),
        }
    }

    /// Create a new gzip compressor with the specified compression level (0-9)
    pub fn with_level(level: u32) -> Self {
        Self {
            compression_level: Compression::new(level),
        }
    }

    /// Create a compressor for fast compression (level 1)
    pub fn fast() -> Self {
        Self::with_level(1)
    }
}

impl Default for GzipCompressor {
    fn default() -> Self {
        Self::new()
    }
}

impl CompressionAdapter for GzipCompressor {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        gzip_member(data, self.compression_level)
    }

    fn decompress(&self, compressed_data: &[u8]) -> Result<Vec<u8>> {
        gunzip_all(compressed_data)
    }

    fn algorithm_name(&self) -> &str {
        "gzip"
    }
}

/// Parallel gzip adapter
///
/// The chunk is cut into blocks of `block_size` bytes; each block becomes its own gzip
/// member and the members are compressed concurrently on a rayon pool, then
/// concatenated in order. Any multi-member aware gzip reader (including `gzip -d`)
/// decodes the result.
#[derive(Debug, Clone)]
pub struct ParallelGzipCompressor {
    compression_level: Compression,
    block_size: usize,
    pool: Option<Arc<rayon::ThreadPool>>,
}

impl ParallelGzipCompressor {
    /// Parallel compressor on the global rayon pool
    pub fn with_level(level: u32) -> Self {
        Self {
            compression_level: Compression::new(level),
            block_size: DEFAULT_PARALLEL_BLOCK_SIZE,
            pool: None,
        }
    }

    /// Use blocks of `block_size` bytes (at least one byte)
    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size.max(1);
        self
    }

    /// Run compression on a dedicated pool of `threads` workers
    pub fn with_threads(mut self, threads: usize) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads.max(1))
            .thread_name(|i| format!("zfs3-gzip-{i}"))
            .build()
            .map_err(|e| BackupError::compression(format!("Failed to build compression pool: {e}")))?;
        self.pool = Some(Arc::new(pool));
        Ok(self)
    }

    fn compress_blocks(&self, data: &[u8]) -> Result<Vec<u8>> {
        let level = self.compression_level;
        let members: Vec<Vec<u8>> = data
            .par_chunks(self.block_size)
            .map(|block| gzip_member(block, level))
            .collect::<Result<_>>()?;

        let mut out = Vec::with_capacity(members.iter().map(Vec::len).sum());
        for member in members {
            out.extend_from_slice(&member);
        }
        Ok(out)
    }
}

impl CompressionAdapter for ParallelGzipCompressor {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        if data.is_empty() {
            return gzip_member(data, self.compression_level);
        }
        match &self.pool {
            Some(pool) => pool.install(|| self.compress_blocks(data)),
            None => self.compress_blocks(data),
        }
    }

    fn decompress(&self, compressed_data: &[u8]) -> Result<Vec<u8>> {
        gunzip_all(compressed_data)
    }

    fn algorithm_name(&self) -> &str {
        "pgzip"
    }
}

/// No-compression adapter for data that is already compressed or for testing
#[derive(Debug, Clone, Default)]
pub struct NoCompression;

impl NoCompression {
    pub fn new() -> Self {
        Self
    }
}

impl CompressionAdapter for NoCompression {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn decompress(&self, compressed_data: &[u8]) -> Result<Vec<u8>> {
        Ok(compressed_data.to_vec())
    }

    fn algorithm_name(&self) -> &str {
        "none"
    }
}

/// The compressor a run was configured with
#[derive(Debug, Clone)]
pub enum Compressor {
    Identity(NoCompression),
    Single(GzipCompressor),
    Parallel(ParallelGzipCompressor),
}

impl Compressor {
    /// Build the compressor selected by `config`
    pub fn from_config(config: &RunConfig) -> Result<Self> {
        Self::for_kind(config.compressor, config.compression_level)
    }

    /// Build a compressor of the given kind and gzip level
    pub fn for_kind(kind: CompressorKind, level: u32) -> Result<Self> {
        Ok(match kind {
            CompressorKind::Identity => Compressor::Identity(NoCompression::new()),
            CompressorKind::Single => Compressor::Single(GzipCompressor::with_level(level)),
            CompressorKind::Parallel => Compressor::Parallel(
                ParallelGzipCompressor::with_level(level).with_threads(num_cpus::get())?,
            ),
        })
    }

    pub fn kind(&self) -> CompressorKind {
        match self {
            Compressor::Identity(_) => CompressorKind::Identity,
            Compressor::Single(_) => CompressorKind::Single,
            Compressor::Parallel(_) => CompressorKind::Parallel,
        }
    }

    fn adapter(&self) -> &dyn CompressionAdapter {
        match self {
            Compressor::Identity(c) => c,
            Compressor::Single(c) => c,
            Compressor::Parallel(c) => c,
        }
    }
}

impl CompressionAdapter for Compressor {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        self.adapter().compress(data)
    }

    fn decompress(&self, compressed_data: &[u8]) -> Result<Vec<u8>> {
        self.adapter().decompress(compressed_data)
    }

    fn algorithm_name(&self) -> &str {
        self.adapter().algorithm_name()
    }
}

fn gzip_member(data: &[u8], level: Compression) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(data.len() / 2 + 64), level);

    encoder
        .write_all(data)
        .map_err(|e| BackupError::compression(format!("Failed to write data for compression: {e}")))?;

    encoder
        .finish()
        .map_err(|e| BackupError::compression(format!("Failed to finish compression: {e}")))
}

fn gunzip_all(compressed_data: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = MultiGzDecoder::new(compressed_data);
    let mut decompressed = Vec::new();

    decoder
        .read_to_end(&mut decompressed)
        .map_err(|e| BackupError::compression(format!("Failed to decompress data: {e}")))?;

    Ok(decompressed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;

    fn sample() -> Vec<u8> {
        b"zfs send stream bytes with some repetitive structure. ".repeat(200)
    }

    #[test]
    fn test_gzip_compression_roundtrip() {
        let compressor = GzipCompressor::new();
        let original = sample();

        let compressed = compressor.compress(&original).unwrap();
        assert!(compressed.len() < original.len());
        assert_eq!(compressor.decompress(&compressed).unwrap(), original);
    }

    #[test]
    fn test_parallel_gzip_produces_multiple_members() {
        let compressor = ParallelGzipCompressor::with_level(1).with_block_size(1000);
        let original = sample();

        let compressed = compressor.compress(&original).unwrap();

        // a single-member reader stops after the first block
        let mut first = Vec::new();
        GzDecoder::new(&compressed[..]).read_to_end(&mut first).unwrap();
        assert_eq!(first, &original[..1000]);

        assert_eq!(compressor.decompress(&compressed).unwrap(), original);
    }

    #[test]
    fn test_parallel_gzip_is_deterministic() {
        let compressor = ParallelGzipCompressor::with_level(4)
            .with_block_size(777)
            .with_threads(3)
            .unwrap();
        let original = sample();

        assert_eq!(
            compressor.compress(&original).unwrap(),
            compressor.compress(&original).unwrap()
        );
    }

    #[test]
    fn test_parallel_output_readable_by_single_gzip_adapter() {
        let parallel = ParallelGzipCompressor::with_level(1).with_block_size(64);
        let original = sample();
        let compressed = parallel.compress(&original).unwrap();

        assert_eq!(GzipCompressor::new().decompress(&compressed).unwrap(), original);
    }

    #[test]
    fn test_empty_input_roundtrips() {
        for compressor in [
            Compressor::for_kind(CompressorKind::Identity, 1).unwrap(),
            Compressor::for_kind(CompressorKind::Single, 1).unwrap(),
            Compressor::for_kind(CompressorKind::Parallel, 1).unwrap(),
        ] {
            let compressed = compressor.compress(b"").unwrap();
            assert!(compressor.decompress(&compressed).unwrap().is_empty());
        }
    }

    #[test]
    fn test_no_compression() {
        let compressor = NoCompression::new();
        let data = b"already compressed";

        assert_eq!(compressor.compress(data).unwrap(), data);
        assert_eq!(compressor.decompress(data).unwrap(), data);
        assert_eq!(compressor.algorithm_name(), "none");
    }

    #[test]
    fn test_compressor_from_config() {
        let config = RunConfig {
            compressor: CompressorKind::Single,
            compression_level: 9,
            ..RunConfig::default()
        };
        let compressor = Compressor::from_config(&config).unwrap();
        assert_eq!(compressor.kind(), CompressorKind::Single);
        assert_eq!(compressor.algorithm_name(), "gzip");
    }

    #[test]
    fn test_invalid_compressed_data() {
        let result = GzipCompressor::new().decompress(b"this is not gzip data");
        assert!(matches!(result, Err(BackupError::Compression(_))));
    }
}
