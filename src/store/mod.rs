//! Collaborators the bridge consumes but does not implement the policy of:
//! the chunk network, the encryption/chunking codec and the durable
//! metadata store. Each has a local implementation used by the binary and
//! an in-memory one used by tests.

pub mod codec;
pub mod dir;
pub mod memory;

use std::time::{Duration, Instant};

use tracing::warn;

use crate::error::StoreError;
use crate::tree::manifest::{ChunkId, ChunkRef};
use crate::tree::snapshot::TreeSnapshot;

/// Content-addressed chunk network.
pub trait ChunkStore: Send + Sync {
    fn get(&self, id: &ChunkId) -> Result<Vec<u8>, StoreError>;

    /// Returns only once the chunk is durably stored.
    fn put(&self, id: &ChunkId, data: &[u8]) -> Result<(), StoreError>;

    /// Best effort; reclamation policy belongs to the store.
    fn delete(&self, id: &ChunkId) -> Result<(), StoreError>;
}

/// Turns plaintext ranges into stored chunks and back. Must be pure and
/// deterministic: identical input yields identical ids and bytes.
pub trait ChunkCodec: Send + Sync {
    fn encode(&self, data: &[u8]) -> Vec<EncodedChunk>;

    /// Recover the plaintext of one chunk from its stored bytes.
    fn decode(&self, chunk: &ChunkRef, stored: &[u8]) -> Result<Vec<u8>, StoreError>;

    /// Check fetched bytes against their identifier.
    fn verify(&self, id: &ChunkId, stored: &[u8]) -> bool;

    /// Preferred plaintext chunk length. Shorter trailing chunks are
    /// re-encoded together with appended data.
    fn target_chunk_len(&self) -> u64;
}

/// One piece produced by [`ChunkCodec::encode`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedChunk {
    pub id: ChunkId,
    /// Plaintext bytes this chunk covers in the file.
    pub len: u64,
    /// Bytes as handed to the chunk store.
    pub stored: Vec<u8>,
}

/// Durable home of the metadata tree snapshot.
pub trait MetadataStore: Send + Sync {
    fn load_snapshot(&self) -> Result<Option<TreeSnapshot>, StoreError>;
    fn save_snapshot(&self, snapshot: &TreeSnapshot) -> Result<(), StoreError>;
}

/// Bounded exponential backoff for transient store failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// No waiting between attempts.
    pub fn immediate(attempts: u32) -> Self {
        Self {
            attempts,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        }
    }

    /// Delay before retry number `retry` (1-based).
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry.saturating_sub(1)).unwrap_or(u32::MAX);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    /// Run `op` until it succeeds, fails permanently, or the attempts run out.
    pub fn run<T>(
        &self,
        what: &str,
        op: impl FnMut() -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        self.run_until(what, None, StoreError::is_retryable, op)
    }

    /// Like [`run`](Self::run), but `retryable` picks the errors worth
    /// another attempt and no retry is started whose backoff would end past
    /// `deadline`.
    pub fn run_until<T>(
        &self,
        what: &str,
        deadline: Option<Instant>,
        retryable: impl Fn(&StoreError) -> bool,
        mut op: impl FnMut() -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let attempts = self.attempts.max(1);
        let mut attempt = 1;
        loop {
            match op() {
                Ok(v) => return Ok(v),
                Err(e) if retryable(&e) && attempt < attempts => {
                    let delay = self.backoff(attempt);
                    if deadline.is_some_and(|d| Instant::now() + delay >= d) {
                        warn!(
                            "{} failed (attempt {}/{}): {}; no time left to retry",
                            what, attempt, attempts, e
                        );
                        return Err(StoreError::TimedOut(format!("{}: {}", what, e)));
                    }
                    warn!(
                        "{} failed (attempt {}/{}): {}; retrying in {:?}",
                        what, attempt, attempts, e, delay
                    );
                    std::thread::sleep(delay);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
