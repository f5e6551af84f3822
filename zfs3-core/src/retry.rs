/*!
Per-chunk retry bookkeeping.

The governor owns an explicit state per chunk (failures so far, backoff schedule, last
error) instead of retrying in a loop around the upload call. Deciding whether and when
to retry is therefore separate from performing I/O and can be tested without any.
*/

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, warn};
use zfs3_retry::{BackoffSchedule, RetryDecision, RetryPolicy};

use crate::manifest::ChunkFailure;
use crate::BackupError;

#[derive(Debug)]
struct ChunkState {
    schedule: BackoffSchedule,
    last_error: String,
}

/// What to do with a chunk after a failed attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Resubmit as attempt `attempt` (zero-based) once `delay` has passed
    Retry { attempt: u32, delay: Duration },
    /// The chunk failed permanently
    GiveUp(ChunkFailure),
    /// Retries are halted for this run; the chunk stays unresolved
    Halted { attempts: u32, last_error: String },
}

/// Tracks attempt counts and backoff for every chunk with a failed attempt
///
/// Chunks that succeed on their first attempt never enter the table. The table lock is
/// only held for bookkeeping, never across an upload.
#[derive(Debug)]
pub struct RetryGovernor {
    policy: RetryPolicy,
    table: Mutex<HashMap<u64, ChunkState>>,
    halted: AtomicBool,
}

impl RetryGovernor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            table: Mutex::new(HashMap::new()),
            halted: AtomicBool::new(false),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    fn table(&self) -> std::sync::MutexGuard<'_, HashMap<u64, ChunkState>> {
        self.table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Report a failed attempt of chunk `sequence`
    ///
    /// Chunk-scoped errors (compression, upload, integrity) share one budget whatever
    /// their cause, auth failures included. Anything else fails the chunk at once. The
    /// error text is kept verbatim for the failure report.
    pub fn on_failure(&self, sequence: u64, error: &BackupError) -> Verdict {
        let mut table = self.table();
        let state = table.entry(sequence).or_insert_with(|| ChunkState {
            schedule: self.policy.schedule(),
            last_error: String::new(),
        });
        state.last_error = error.to_string();

        if self.halted.load(Ordering::Acquire) {
            let attempts = state.schedule.failures() + 1;
            let last_error = state.last_error.clone();
            table.remove(&sequence);
            debug!(sequence, attempts, "Retries halted, dropping chunk");
            return Verdict::Halted { attempts, last_error };
        }

        if !error.is_retryable() {
            let attempts = state.schedule.failures() + 1;
            let last_error = state.last_error.clone();
            table.remove(&sequence);
            warn!(sequence, attempts, error = %last_error, "Chunk failed with an error retrying cannot fix");
            return Verdict::GiveUp(ChunkFailure {
                sequence,
                attempts,
                last_error,
            });
        }

        match state.schedule.on_failure() {
            RetryDecision::Retry { attempt, delay } => {
                debug!(sequence, attempt, delay_ms = delay.as_millis() as u64, error = %error, "Scheduling chunk retry");
                Verdict::Retry { attempt, delay }
            }
            RetryDecision::Exhausted { attempts } => {
                let last_error = state.last_error.clone();
                table.remove(&sequence);
                warn!(sequence, attempts, error = %last_error, "Chunk failed permanently");
                Verdict::GiveUp(ChunkFailure {
                    sequence,
                    attempts,
                    last_error,
                })
            }
        }
    }

    /// Retire a chunk after its successful attempt; returns the attempts it took
    pub fn on_success(&self, sequence: u64) -> u32 {
        self.table()
            .remove(&sequence)
            .map(|state| state.schedule.failures() + 1)
            .unwrap_or(1)
    }

    /// Failed attempts recorded so far for `sequence`
    pub fn failures(&self, sequence: u64) -> u32 {
        self.table()
            .get(&sequence)
            .map(|state| state.schedule.failures())
            .unwrap_or(0)
    }

    /// Chunks with at least one failure that are not yet resolved
    pub fn pending(&self) -> usize {
        self.table().len()
    }

    /// Stop resubmitting; later failures resolve as [`Verdict::Halted`]
    pub fn halt(&self) {
        self.halted.store(true, Ordering::Release);
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::Acquire)
    }
}
