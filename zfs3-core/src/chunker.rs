/*!
Fixed-size chunking of a snapshot stream.

The chunker reads the stream front to back and hands out chunks one at a time; it never
reads ahead of the caller, so the bounded queue it feeds is the only read-ahead buffer.
*/

use bytes::Bytes;
use futures::Stream;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::{BackupError, Result};

/// A sequence-numbered slice of the source stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Zero-based position of the chunk in the stream
    pub sequence: u64,
    pub payload: Bytes,
    /// Length of `payload` in bytes
    pub size: u64,
}

impl Chunk {
    pub fn new(sequence: u64, payload: Bytes) -> Self {
        let size = payload.len() as u64;
        Self {
            sequence,
            payload,
            size,
        }
    }
}

/// Splits a byte stream into chunks of `chunk_size` bytes
///
/// Every chunk except the last is exactly `chunk_size` bytes long. An empty stream
/// produces no chunks.
///
/// # Example
/// ```rust
/// # let rt = tokio::runtime::Runtime::new().unwrap();
/// # rt.block_on(async {
/// use zfs3_core::Chunker;
///
/// let mut chunker = Chunker::new(&b"aabbccdde"[..], 2);
/// let mut sizes = Vec::new();
/// while let Some(chunk) = chunker.next_chunk().await? {
///     sizes.push(chunk.size);
/// }
/// assert_eq!(sizes, vec![2, 2, 2, 2, 1]);
/// # Ok::<(), zfs3_core::BackupError>(())
/// # }).unwrap();
/// ```
pub struct Chunker<R> {
    reader: R,
    chunk_size: usize,
    next_sequence: u64,
    offset: u64,
    finished: bool,
}

impl<R: AsyncRead + Unpin> Chunker<R> {
    /// Create a chunker over `reader`
    ///
    /// # Panics
    /// Panics if `chunk_size` is zero; run configurations are validated before a
    /// chunker is built.
    pub fn new(reader: R, chunk_size: usize) -> Self {
        assert!(chunk_size > 0, "chunk_size must be > 0");
        Self {
            reader,
            chunk_size,
            next_sequence: 0,
            offset: 0,
            finished: false,
        }
    }

    /// Read the next chunk, or `None` once the stream is exhausted
    ///
    /// # Errors
    /// Returns `BackupError::StreamRead` if the underlying read fails. The chunker is
    /// finished afterwards: the stream cannot be resumed mid-way.
    pub async fn next_chunk(&mut self) -> Result<Option<Chunk>> {
        if self.finished {
            return Ok(None);
        }

        let mut buf = vec![0u8; self.chunk_size];
        let mut filled = 0;
        while filled < self.chunk_size {
            match self.reader.read(&mut buf[filled..]).await {
                Ok(0) => {
                    self.finished = true;
                    break;
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.finished = true;
                    return Err(BackupError::stream_read(self.offset + filled as u64, e));
                }
            }
        }

        if filled == 0 {
            return Ok(None);
        }

        buf.truncate(filled);
        let chunk = Chunk::new(self.next_sequence, Bytes::from(buf));
        self.next_sequence += 1;
        self.offset += filled as u64;
        Ok(Some(chunk))
    }

    /// Number of chunks produced so far; equals the chunk count once exhausted
    pub fn chunks_emitted(&self) -> u64 {
        self.next_sequence
    }

    /// Bytes consumed from the stream so far
    pub fn bytes_read(&self) -> u64 {
        self.offset
    }

    /// Whether the stream has been fully consumed (or failed)
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Turn the chunker into a lazy stream of chunks that ends after the first error
    pub fn into_stream(self) -> impl Stream<Item = Result<Chunk>> {
        futures::stream::unfold(Some(self), |state| async move {
            let mut chunker = state?;
            match chunker.next_chunk().await {
                Ok(Some(chunk)) => Some((Ok(chunk), Some(chunker))),
                Ok(None) => None,
                Err(e) => Some((Err(e), None)),
            }
        })
    }
}
