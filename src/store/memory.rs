use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::debug;

use super::{ChunkStore, MetadataStore};
use crate::error::StoreError;
use crate::tree::manifest::ChunkId;
use crate::tree::snapshot::TreeSnapshot;

/// Chunk store held in process memory. Failures can be injected to exercise
/// the retry and crash-consistency paths.
#[derive(Debug, Default)]
pub struct MemoryChunkStore {
    chunks: DashMap<ChunkId, Vec<u8>>,
    get_failures: AtomicU32,
    put_failures: AtomicU32,
    get_calls: AtomicUsize,
    put_calls: AtomicUsize,
}

impl MemoryChunkStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` `get` calls fail as unavailable.
    pub fn fail_next_gets(&self, n: u32) {
        self.get_failures.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` `put` calls fail as unavailable.
    pub fn fail_next_puts(&self, n: u32) {
        self.put_failures.store(n, Ordering::SeqCst);
    }

    pub fn get_calls(&self) -> usize {
        self.get_calls.load(Ordering::SeqCst)
    }

    pub fn put_calls(&self) -> usize {
        self.put_calls.load(Ordering::SeqCst)
    }

    pub fn contains(&self, id: &ChunkId) -> bool {
        self.chunks.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Overwrite stored bytes without regard to their id.
    pub fn tamper(&self, id: &ChunkId, data: Vec<u8>) {
        self.chunks.insert(id.clone(), data);
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl ChunkStore for MemoryChunkStore {
    fn get(&self, id: &ChunkId) -> Result<Vec<u8>, StoreError> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        if Self::take_failure(&self.get_failures) {
            debug!("injected get failure for {}", id);
            return Err(StoreError::Unavailable(format!("injected failure fetching {}", id)));
        }
        self.chunks
            .get(id)
            .map(|c| c.value().clone())
            .ok_or_else(|| StoreError::NotFound(id.clone()))
    }

    fn put(&self, id: &ChunkId, data: &[u8]) -> Result<(), StoreError> {
        self.put_calls.fetch_add(1, Ordering::SeqCst);
        if Self::take_failure(&self.put_failures) {
            debug!("injected put failure for {}", id);
            return Err(StoreError::Unavailable(format!("injected failure storing {}", id)));
        }
        self.chunks.insert(id.clone(), data.to_vec());
        Ok(())
    }

    fn delete(&self, id: &ChunkId) -> Result<(), StoreError> {
        self.chunks.remove(id);
        Ok(())
    }
}

/// Metadata store that keeps the last saved snapshot in memory.
#[derive(Debug, Default)]
pub struct MemoryMetadataStore {
    snapshot: Mutex<Option<TreeSnapshot>>,
    saves: AtomicUsize,
    save_failures: AtomicU32,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_snapshot(snapshot: TreeSnapshot) -> Self {
        Self {
            snapshot: Mutex::new(Some(snapshot)),
            ..Self::default()
        }
    }

    /// Make the next `n` saves fail with a local IO error.
    pub fn fail_next_saves(&self, n: u32) {
        self.save_failures.store(n, Ordering::SeqCst);
    }

    pub fn saves(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    pub fn latest(&self) -> Option<TreeSnapshot> {
        self.snapshot.lock().clone()
    }
}

impl MetadataStore for MemoryMetadataStore {
    fn load_snapshot(&self) -> Result<Option<TreeSnapshot>, StoreError> {
        Ok(self.snapshot.lock().clone())
    }

    fn save_snapshot(&self, snapshot: &TreeSnapshot) -> Result<(), StoreError> {
        if MemoryChunkStore::take_failure(&self.save_failures) {
            debug!("injected snapshot save failure");
            return Err(StoreError::Io("injected failure saving snapshot".to_string()));
        }
        *self.snapshot.lock() = Some(snapshot.clone());
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
