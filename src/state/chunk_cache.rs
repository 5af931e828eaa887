//! Local cache of stored chunk bytes keyed by content identifier.
//!
//! - One fetch per missing chunk at a time: concurrent callers wait for the
//!   leader's result instead of hitting the store again.
//! - Least-recently-used eviction once the memory budget is exceeded.
//! - Dirty chunks (uploads not yet acknowledged) and chunks pinned by a live
//!   [`ChunkGuard`] are never evicted.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::store::{ChunkCodec, ChunkStore, RetryPolicy};
use crate::tree::manifest::{ChunkId, ChunkRef};

struct Slot {
    data: Arc<Vec<u8>>,
    /// Outstanding uploads of this chunk.
    dirty: u32,
    /// Live guards.
    pins: u32,
    tick: u64,
}

impl Slot {
    fn evictable(&self) -> bool {
        self.dirty == 0 && self.pins == 0
    }
}

type FetchResult = Result<Arc<Vec<u8>>, StoreError>;

/// A fetch in progress; followers block on `ready` until `result` is set.
#[derive(Default)]
struct Inflight {
    result: Mutex<Option<FetchResult>>,
    ready: Condvar,
}

impl Inflight {
    fn wait(&self) -> FetchResult {
        let mut result = self.result.lock();
        loop {
            if let Some(r) = result.as_ref() {
                return r.clone();
            }
            self.ready.wait(&mut result);
        }
    }

    fn complete(&self, r: FetchResult) {
        *self.result.lock() = Some(r);
        self.ready.notify_all();
    }
}

#[derive(Default)]
struct CacheInner {
    slots: HashMap<ChunkId, Slot>,
    /// tick -> id; lowest tick is least recently used.
    lru: BTreeMap<u64, ChunkId>,
    pending: HashMap<ChunkId, Arc<Inflight>>,
    tick: u64,
    current_size: u64,
}

impl CacheInner {
    fn touch(&mut self, id: &ChunkId) {
        self.tick += 1;
        let tick = self.tick;
        if let Some(slot) = self.slots.get_mut(id) {
            self.lru.remove(&slot.tick);
            slot.tick = tick;
            self.lru.insert(tick, id.clone());
        }
    }

    /// Pin an existing slot or insert `data` as a new pinned one.
    fn pin_or_insert(&mut self, id: &ChunkId, data: Arc<Vec<u8>>) -> Arc<Vec<u8>> {
        if let Some(slot) = self.slots.get_mut(id) {
            slot.pins += 1;
            let data = Arc::clone(&slot.data);
            self.touch(id);
            return data;
        }
        self.insert(id, Arc::clone(&data), 0, 1);
        data
    }

    fn insert(&mut self, id: &ChunkId, data: Arc<Vec<u8>>, dirty: u32, pins: u32) {
        self.tick += 1;
        self.current_size += data.len() as u64;
        self.lru.insert(self.tick, id.clone());
        self.slots.insert(
            id.clone(),
            Slot {
                data,
                dirty,
                pins,
                tick: self.tick,
            },
        );
    }

    /// Evict least-recently-used clean, unpinned chunks until within budget.
    /// Returns how many were evicted.
    fn evict_to(&mut self, budget: u64) -> u64 {
        let mut evicted = 0;
        while self.current_size > budget {
            let victim = self
                .lru
                .iter()
                .find(|(_, id)| self.slots.get(*id).is_some_and(Slot::evictable))
                .map(|(tick, id)| (*tick, id.clone()));
            let Some((tick, id)) = victim else {
                break;
            };
            self.lru.remove(&tick);
            if let Some(slot) = self.slots.remove(&id) {
                self.current_size -= slot.data.len() as u64;
                evicted += 1;
                debug!("evicted chunk {} ({} bytes)", id, slot.data.len());
            }
        }
        evicted
    }
}

/// Point-in-time cache counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub bytes: u64,
    pub budget: u64,
    pub dirty: usize,
    pub pinned: usize,
    pub hits: u64,
    pub misses: u64,
    pub fetches: u64,
    pub evictions: u64,
}

pub struct ChunkCache {
    store: Arc<dyn ChunkStore>,
    codec: Arc<dyn ChunkCodec>,
    retry: RetryPolicy,
    budget: u64,
    inner: Mutex<CacheInner>,
    hits: AtomicU64,
    misses: AtomicU64,
    fetches: AtomicU64,
    evictions: AtomicU64,
}

/// Pinned reference to cached chunk bytes; unpins on drop.
pub struct ChunkGuard<'a> {
    cache: &'a ChunkCache,
    id: ChunkId,
    data: Arc<Vec<u8>>,
}

impl ChunkGuard<'_> {
    pub fn id(&self) -> &ChunkId {
        &self.id
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

impl AsRef<[u8]> for ChunkGuard<'_> {
    fn as_ref(&self) -> &[u8] {
        self.data()
    }
}

impl Drop for ChunkGuard<'_> {
    fn drop(&mut self) {
        self.cache.unpin(&self.id);
    }
}

impl ChunkCache {
    pub fn new(
        store: Arc<dyn ChunkStore>,
        codec: Arc<dyn ChunkCodec>,
        retry: RetryPolicy,
        budget: u64,
    ) -> Self {
        Self {
            store,
            codec,
            retry,
            budget,
            inner: Mutex::new(CacheInner::default()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            fetches: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn codec(&self) -> &Arc<dyn ChunkCodec> {
        &self.codec
    }

    /// Return the chunk's stored bytes, fetching it on a miss. Blocks while
    /// another caller's fetch of the same id is in flight.
    pub fn get(&self, id: &ChunkId) -> Result<ChunkGuard<'_>, StoreError> {
        let mut inner = self.inner.lock();
        if let Some(slot) = inner.slots.get_mut(id) {
            slot.pins += 1;
            let data = Arc::clone(&slot.data);
            inner.touch(id);
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(self.guard(id, data));
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        if let Some(inflight) = inner.pending.get(id).cloned() {
            drop(inner);
            debug!("waiting on in-flight fetch of {}", id);
            let data = inflight.wait()?;
            let data = self.inner.lock().pin_or_insert(id, data);
            return Ok(self.guard(id, data));
        }

        let inflight = Arc::new(Inflight::default());
        inner.pending.insert(id.clone(), Arc::clone(&inflight));
        drop(inner);

        let result = self.fetch(id);

        let mut inner = self.inner.lock();
        inner.pending.remove(id);
        let outcome = match &result {
            Ok(data) => {
                let data = inner.pin_or_insert(id, Arc::clone(data));
                let evicted = inner.evict_to(self.budget);
                self.evictions.fetch_add(evicted, Ordering::Relaxed);
                Ok(self.guard(id, data))
            }
            Err(e) => Err(e.clone()),
        };
        drop(inner);
        inflight.complete(result);
        outcome
    }

    /// Fetch (if needed) and decode one chunk of a manifest.
    pub fn read_plain(&self, chunk: &ChunkRef) -> Result<Vec<u8>, StoreError> {
        let guard = self.get(&chunk.id)?;
        self.codec.decode(chunk, guard.data())
    }

    fn fetch(&self, id: &ChunkId) -> FetchResult {
        self.fetches.fetch_add(1, Ordering::Relaxed);
        let what = format!("fetch of chunk {}", id);
        let data = self.retry.run(&what, || self.store.get(id))?;
        if !self.codec.verify(id, &data) {
            warn!("chunk {} failed verification", id);
            return Err(StoreError::Corrupt(format!("chunk {} does not match its id", id)));
        }
        Ok(Arc::new(data))
    }

    fn guard(&self, id: &ChunkId, data: Arc<Vec<u8>>) -> ChunkGuard<'_> {
        ChunkGuard {
            cache: self,
            id: id.clone(),
            data,
        }
    }

    fn unpin(&self, id: &ChunkId) {
        let mut inner = self.inner.lock();
        if let Some(slot) = inner.slots.get_mut(id) {
            slot.pins = slot.pins.saturating_sub(1);
        }
        let evicted = inner.evict_to(self.budget);
        self.evictions.fetch_add(evicted, Ordering::Relaxed);
    }

    /// Insert or refresh a chunk. A dirty put pins the chunk until a matching
    /// [`clear_dirty`](Self::clear_dirty).
    pub fn put(&self, id: &ChunkId, data: Vec<u8>, dirty: bool) {
        let mut inner = self.inner.lock();
        if let Some(slot) = inner.slots.get_mut(id) {
            if dirty {
                slot.dirty += 1;
            }
            inner.touch(id);
        } else {
            inner.insert(id, Arc::new(data), u32::from(dirty), 0);
        }
        let evicted = inner.evict_to(self.budget);
        self.evictions.fetch_add(evicted, Ordering::Relaxed);
        if inner.current_size > self.budget {
            debug!(
                "chunk cache over budget ({} > {}): remaining chunks are dirty or pinned",
                inner.current_size, self.budget
            );
        }
    }

    /// Drop one dirty mark, making the chunk evictable once none remain.
    pub fn clear_dirty(&self, id: &ChunkId) {
        let mut inner = self.inner.lock();
        if let Some(slot) = inner.slots.get_mut(id) {
            slot.dirty = slot.dirty.saturating_sub(1);
        }
        let evicted = inner.evict_to(self.budget);
        self.evictions.fetch_add(evicted, Ordering::Relaxed);
    }

    /// Cached bytes without fetching or pinning.
    pub fn peek(&self, id: &ChunkId) -> Option<Arc<Vec<u8>>> {
        self.inner.lock().slots.get(id).map(|s| Arc::clone(&s.data))
    }

    pub fn contains(&self, id: &ChunkId) -> bool {
        self.inner.lock().slots.contains_key(id)
    }

    pub fn is_dirty(&self, id: &ChunkId) -> bool {
        self.inner
            .lock()
            .slots
            .get(id)
            .is_some_and(|s| s.dirty > 0)
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            entries: inner.slots.len(),
            bytes: inner.current_size,
            budget: self.budget,
            dirty: inner.slots.values().filter(|s| s.dirty > 0).count(),
            pinned: inner.slots.values().filter(|s| s.pins > 0).count(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            fetches: self.fetches.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}
