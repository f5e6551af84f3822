//! Test doubles shared by the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, ReadBuf};
use zfs3_core::{BackupError, MemoryObjectStore, ObjectStore, PutReceipt, Result, RunConfig};

/// Wraps a [`MemoryObjectStore`] and injects failures and latency into `put_object`
#[derive(Clone, Default)]
pub struct FaultyStore {
    pub inner: MemoryObjectStore,
    /// Key suffixes whose uploads always fail
    always_fail: Arc<Mutex<HashSet<String>>>,
    /// Key suffixes that fail this many more times before succeeding
    fail_times: Arc<Mutex<HashMap<String, u32>>>,
    puts: Arc<Mutex<HashMap<String, u32>>>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
    delay: Duration,
}

impl FaultyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A fresh fault plan over existing objects
    pub fn sharing(inner: MemoryObjectStore) -> Self {
        Self {
            inner,
            ..Self::default()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn fail_always(self, suffix: &str) -> Self {
        self.always_fail.lock().unwrap().insert(suffix.to_string());
        self
    }

    pub fn fail_times(self, suffix: &str, times: u32) -> Self {
        self.fail_times.lock().unwrap().insert(suffix.to_string(), times);
        self
    }

    /// `put_object` calls seen for `key`, successful or not
    pub fn puts(&self, key: &str) -> u32 {
        self.puts.lock().unwrap().get(key).copied().unwrap_or(0)
    }

    /// Distinct keys `put_object` was called for
    pub fn distinct_puts(&self) -> usize {
        self.puts.lock().unwrap().len()
    }

    pub fn total_puts(&self) -> u32 {
        self.puts.lock().unwrap().values().sum()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn should_fail(&self, key: &str) -> bool {
        if self.always_fail.lock().unwrap().iter().any(|s| key.ends_with(s.as_str())) {
            return true;
        }
        let mut fail_times = self.fail_times.lock().unwrap();
        for (suffix, remaining) in fail_times.iter_mut() {
            if key.ends_with(suffix.as_str()) && *remaining > 0 {
                *remaining -= 1;
                return true;
            }
        }
        false
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ObjectStore for FaultyStore {
    async fn put_object(&self, key: &str, body: Bytes, storage_class: &str) -> Result<PutReceipt> {
        *self.puts.lock().unwrap().entry(key.to_string()).or_insert(0) += 1;
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = InFlight(&self.in_flight);
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.should_fail(key) {
            return Err(BackupError::upload(format!("injected failure for {key}")));
        }
        self.inner.put_object(key, body, storage_class).await
    }

    async fn get_object(&self, key: &str) -> Result<Bytes> {
        self.inner.get_object(key).await
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.inner.exists(key).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        self.inner.list(prefix).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.inner.delete(key).await
    }

    fn describe(&self) -> String {
        "faulty-memory".to_string()
    }
}

/// Yields `data`, then fails every later read
pub struct FailingReader {
    data: Vec<u8>,
    position: usize,
}

impl FailingReader {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data, position: 0 }
    }
}

impl AsyncRead for FailingReader {
    fn poll_read(mut self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        if self.position >= self.data.len() {
            return Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "zfs send died")));
        }
        let n = buf.remaining().min(self.data.len() - self.position);
        let start = self.position;
        buf.put_slice(&self.data[start..start + n]);
        self.position += n;
        Poll::Ready(Ok(()))
    }
}

/// Identity compression, no backoff, small chunks
pub fn test_config(chunk_size: u64, max_retries: u32) -> RunConfig {
    RunConfig {
        chunk_size,
        max_retries,
        compressor: zfs3_core::CompressorKind::Identity,
        retry_initial_delay_ms: 0,
        retry_max_delay_ms: 0,
        ..RunConfig::default()
    }
}

pub fn sample(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}
