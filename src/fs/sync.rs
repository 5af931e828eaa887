//! Commits buffered writes as new chunks and a new manifest.
//!
//! A commit runs under the entry's commit lock:
//! 1. take the entry's sealed writes, ordered by sequence number;
//! 2. re-encode every old chunk those writes touch (plus any growth), one
//!    chunk-sized window at a time, and put the new chunks in the cache as
//!    dirty;
//! 3. upload them; only when every upload is acknowledged build the new
//!    manifest and swap it onto the entry;
//! 4. save the metadata snapshot;
//! 5. clear the dirty marks.
//!
//! A crash before step 4 leaves the durable snapshot on the old manifest,
//! whose chunks were all acknowledged by earlier commits. A snapshot save
//! that fails after the swap does not undo the commit; the next commit or
//! the unmount saves the tree again.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use super::dirty::DirtyBuffer;
use crate::error::{FsError, FsResult, StoreError};
use crate::state::chunk_cache::ChunkCache;
use crate::store::{ChunkStore, MetadataStore, RetryPolicy};
use crate::tree::manifest::{ChunkId, ChunkRef, Manifest, ManifestVersion};
use crate::tree::{EntryId, EntryRef, MetadataTree};

/// Writes of one handle, sealed at flush/close with a commit sequence number.
#[derive(Debug)]
pub struct SealedWrite {
    pub seq: u64,
    pub dirty: DirtyBuffer,
}

#[derive(Debug)]
struct PendingWrites {
    entry: EntryRef,
    writes: Vec<SealedWrite>,
}

/// A stretch of the new file: either an untouched old chunk or a byte range
/// that must be re-encoded.
#[derive(Debug)]
enum Segment {
    Keep(ChunkRef),
    Rewrite { start: u64, end: u64 },
}

fn push_rewrite(segments: &mut Vec<Segment>, start: u64, end: u64) {
    if start >= end {
        return;
    }
    if let Some(Segment::Rewrite { end: prev_end, .. }) = segments.last_mut() {
        if *prev_end == start {
            *prev_end = end;
            return;
        }
    }
    segments.push(Segment::Rewrite { start, end });
}

/// Copy the part of `src` (which starts at file offset `src_at`) that falls
/// inside `dst` (which starts at `dst_at`).
pub(crate) fn copy_overlap(dst: &mut [u8], dst_at: u64, src: &[u8], src_at: u64) {
    let from = dst_at.max(src_at);
    let to = (dst_at + dst.len() as u64).min(src_at + src.len() as u64);
    if from >= to {
        return;
    }
    dst[(from - dst_at) as usize..(to - dst_at) as usize]
        .copy_from_slice(&src[(from - src_at) as usize..(to - src_at) as usize]);
}

pub struct SyncEngine {
    tree: Arc<MetadataTree>,
    cache: Arc<ChunkCache>,
    store: Arc<dyn ChunkStore>,
    meta: Arc<dyn MetadataStore>,
    retry: RetryPolicy,
    next_seq: AtomicU64,
    pending: DashMap<EntryId, PendingWrites>,
    /// Serializes snapshot saves so an older image never lands last.
    snapshot_lock: Mutex<()>,
    commits: AtomicU64,
}

impl SyncEngine {
    pub fn new(
        tree: Arc<MetadataTree>,
        cache: Arc<ChunkCache>,
        store: Arc<dyn ChunkStore>,
        meta: Arc<dyn MetadataStore>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            tree,
            cache,
            store,
            meta,
            retry,
            next_seq: AtomicU64::new(1),
            pending: DashMap::new(),
            snapshot_lock: Mutex::new(()),
            commits: AtomicU64::new(0),
        }
    }

    /// Queue a handle's writes for the next commit of `entry`. Returns the
    /// assigned sequence number, or `None` when there was nothing to queue.
    pub fn seal(&self, entry: &EntryRef, dirty: DirtyBuffer) -> Option<u64> {
        if dirty.is_empty() {
            return None;
        }
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        debug!(
            "sealed {} dirty bytes for entry {} as seq {}",
            dirty.len(),
            entry.id(),
            seq
        );
        let mut slot = self.pending.entry(entry.id()).or_insert_with(|| PendingWrites {
            entry: Arc::clone(entry),
            writes: Vec::new(),
        });
        slot.writes.push(SealedWrite { seq, dirty });
        Some(seq)
    }

    pub fn has_pending(&self, entry: EntryId) -> bool {
        self.pending.contains_key(&entry)
    }

    /// One past the last sealed-but-uncommitted byte of `entry`.
    pub fn pending_end(&self, entry: EntryId) -> u64 {
        self.pending
            .get(&entry)
            .map(|p| p.writes.iter().map(|w| w.dirty.end()).max().unwrap_or(0))
            .unwrap_or(0)
    }

    /// Copy sealed-but-uncommitted bytes of `entry` overlapping
    /// `[offset, offset + buf.len())` into `buf`, later writes winning.
    pub fn overlay_pending(&self, entry: EntryId, offset: u64, buf: &mut [u8]) {
        let Some(pending) = self.pending.get(&entry) else {
            return;
        };
        let mut writes: Vec<&SealedWrite> = pending.writes.iter().collect();
        writes.sort_by_key(|w| w.seq);
        for w in writes {
            w.dirty.overlay(offset, buf);
        }
    }

    pub fn pending_entries(&self) -> Vec<EntryRef> {
        self.pending.iter().map(|p| Arc::clone(&p.entry)).collect()
    }

    /// Drop sealed writes of an entry that is no longer linked anywhere.
    pub fn discard(&self, entry: EntryId) -> usize {
        let dropped = self.take_pending(entry).len();
        if dropped > 0 {
            debug!("discarded {} sealed writes of unlinked entry {}", dropped, entry);
        }
        dropped
    }

    pub fn commits(&self) -> u64 {
        self.commits.load(Ordering::Relaxed)
    }

    fn take_pending(&self, entry: EntryId) -> Vec<SealedWrite> {
        let mut writes = self
            .pending
            .remove(&entry)
            .map(|(_, p)| p.writes)
            .unwrap_or_default();
        writes.sort_by_key(|w| w.seq);
        writes
    }

    /// Put writes back after a failed commit, keeping sequence order.
    fn restore_pending(&self, entry: &EntryRef, writes: Vec<SealedWrite>) {
        if writes.is_empty() {
            return;
        }
        let mut slot = self.pending.entry(entry.id()).or_insert_with(|| PendingWrites {
            entry: Arc::clone(entry),
            writes: Vec::new(),
        });
        slot.writes.extend(writes);
        slot.writes.sort_by_key(|w| w.seq);
    }

    /// Commit every sealed write of `entry`. With nothing pending this is a
    /// no-op returning the current version.
    pub fn flush(&self, entry: &EntryRef) -> FsResult<ManifestVersion> {
        self.flush_until(entry, None)
    }

    fn flush_until(
        &self,
        entry: &EntryRef,
        deadline: Option<Instant>,
    ) -> FsResult<ManifestVersion> {
        let _commit = entry.lock_commit();
        let writes = self.take_pending(entry.id());
        if writes.is_empty() {
            return Ok(entry.manifest().version);
        }
        self.commit_or_restore(entry, writes, None, deadline)
    }

    /// Set the size of `entry`, committing any sealed writes first in the
    /// same new manifest.
    pub fn truncate(&self, entry: &EntryRef, size: u64) -> FsResult<ManifestVersion> {
        let _commit = entry.lock_commit();
        let writes = self.take_pending(entry.id());
        if writes.is_empty() && entry.size() == size {
            return Ok(entry.manifest().version);
        }
        self.commit_or_restore(entry, writes, Some(size), None)
    }

    /// Commit every linked entry with sealed writes. Stops with `Busy` once
    /// `deadline` has passed, including while a transfer is being retried.
    pub fn flush_all(&self, deadline: Option<Instant>) -> FsResult<()> {
        let expired = || deadline.is_some_and(|d| Instant::now() >= d);
        for entry in self.pending_entries() {
            if expired() {
                warn!("flush deadline passed with {} entries pending", self.pending.len());
                return Err(FsError::Busy);
            }
            if self.tree.get(entry.id()).is_none() {
                self.discard(entry.id());
                continue;
            }
            match self.flush_until(&entry, deadline) {
                Ok(_) => {}
                Err(e) if expired() => {
                    warn!("flush deadline passed while committing entry {}: {}", entry.id(), e);
                    return Err(FsError::Busy);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn commit_or_restore(
        &self,
        entry: &EntryRef,
        writes: Vec<SealedWrite>,
        truncate_to: Option<u64>,
        deadline: Option<Instant>,
    ) -> FsResult<ManifestVersion> {
        if let Some(reason) = entry.corruption() {
            self.restore_pending(entry, writes);
            return Err(FsError::CorruptManifest {
                path: self.describe(entry),
                reason,
            });
        }
        match self.commit(entry, &writes, truncate_to, deadline) {
            Ok(version) => Ok(version),
            Err(e) => {
                error!("commit of entry {} failed: {}", entry.id(), e);
                self.restore_pending(entry, writes);
                Err(e)
            }
        }
    }

    fn describe(&self, entry: &EntryRef) -> String {
        self.tree
            .path_of(entry.id())
            .unwrap_or_else(|| format!("<unlinked entry {}>", entry.id()))
    }

    fn commit(
        &self,
        entry: &EntryRef,
        writes: &[SealedWrite],
        truncate_to: Option<u64>,
        deadline: Option<Instant>,
    ) -> FsResult<ManifestVersion> {
        let started = Instant::now();
        let old = entry.manifest();
        let new_size = match truncate_to {
            Some(size) => size,
            None => writes
                .iter()
                .map(|w| w.dirty.end())
                .fold(old.size, u64::max),
        };
        let segments = self.plan(&old, writes, new_size);

        // Stage new chunks as dirty, then upload them.
        let mut staged: Vec<ChunkId> = Vec::new();
        let uploaded = self
            .stage(&old, writes, &segments, new_size, &mut staged)
            .and_then(|rewritten| self.upload(&staged, deadline).map(|_| rewritten));
        let rewritten = match uploaded {
            Ok(rewritten) => rewritten,
            Err(e) => {
                for id in &staged {
                    self.cache.clear_dirty(id);
                }
                return Err(e);
            }
        };

        // Every new chunk is acknowledged: build and install the manifest.
        let mut pieces: Vec<(ChunkId, u64)> = Vec::new();
        let mut rewritten = rewritten.into_iter();
        for segment in &segments {
            match segment {
                Segment::Keep(c) => pieces.push((c.id.clone(), c.len)),
                Segment::Rewrite { .. } => pieces.extend(rewritten.next().unwrap_or_default()),
            }
        }
        let manifest = Manifest::from_pieces(old.version.next(), pieces);
        if let Err(reason) = manifest.validate().and_then(|_| {
            if manifest.size == new_size {
                Ok(())
            } else {
                Err(format!("built {} bytes, expected {}", manifest.size, new_size))
            }
        }) {
            for id in &staged {
                self.cache.clear_dirty(id);
            }
            entry.mark_corrupt(reason.clone());
            return Err(FsError::CorruptManifest {
                path: self.describe(entry),
                reason,
            });
        }
        let version = manifest.version;
        let chunk_count = manifest.chunks.len();
        entry.install_manifest(manifest);
        self.commits.fetch_add(1, Ordering::Relaxed);

        if let Err(e) = self.persist_until(deadline) {
            warn!(
                "entry {} committed as {} but the snapshot was not saved: {}",
                entry.id(),
                version,
                e
            );
        }
        for id in &staged {
            self.cache.clear_dirty(id);
        }
        info!(
            "committed entry {} {} ({} bytes, {} chunks, {} new) in {:?}",
            entry.id(),
            version,
            new_size,
            chunk_count,
            staged.len(),
            started.elapsed()
        );
        Ok(version)
    }

    /// Materialize and encode every rewritten range one window of
    /// `target_chunk_len` at a time, putting each new chunk in the cache as
    /// dirty and recording its id in `staged`. Returns the pieces of each
    /// rewritten segment in order. Windows that hold only zeros are encoded
    /// once per length.
    fn stage(
        &self,
        old: &Manifest,
        writes: &[SealedWrite],
        segments: &[Segment],
        new_size: u64,
        staged: &mut Vec<ChunkId>,
    ) -> FsResult<Vec<Vec<(ChunkId, u64)>>> {
        let codec = self.cache.codec();
        let window = codec.target_chunk_len().max(1);
        let old_limit = new_size.min(old.size);
        let touched: Vec<(u64, u64)> = writes.iter().flat_map(|w| w.dirty.ranges()).collect();
        let mut seen: HashSet<ChunkId> = HashSet::new();
        let mut holes: HashMap<u64, Vec<(ChunkId, u64)>> = HashMap::new();

        let mut rewritten = Vec::new();
        for segment in segments {
            let Segment::Rewrite { start, end } = *segment else {
                continue;
            };
            let mut pieces = Vec::new();
            let mut at = start;
            while at < end {
                let to = end.min(at.saturating_add(window));
                let hole = at >= old_limit && !touched.iter().any(|&(s, e)| s < to && e > at);
                if let Some(known) = hole.then(|| holes.get(&(to - at))).flatten() {
                    pieces.extend(known.iter().cloned());
                    at = to;
                    continue;
                }
                let bytes = self.materialize(old, writes, at, to, old_limit)?;
                let mut encoded = Vec::new();
                for piece in codec.encode(&bytes) {
                    if seen.insert(piece.id.clone()) {
                        self.cache.put(&piece.id, piece.stored, true);
                        staged.push(piece.id.clone());
                    }
                    encoded.push((piece.id, piece.len));
                }
                if hole {
                    holes.insert(to - at, encoded.clone());
                }
                pieces.extend(encoded);
                at = to;
            }
            rewritten.push(pieces);
        }
        Ok(rewritten)
    }

    /// Decide which old chunks survive untouched and which ranges must be
    /// re-encoded.
    fn plan(&self, old: &Manifest, writes: &[SealedWrite], new_size: u64) -> Vec<Segment> {
        let kept_limit = old.size.min(new_size);
        let touched: Vec<(u64, u64)> = writes
            .iter()
            .flat_map(|w| w.dirty.ranges())
            .filter_map(|(s, e)| {
                let e = e.min(new_size);
                (s < e).then_some((s, e))
            })
            .collect();

        let mut segments = Vec::new();
        for c in old.chunks.iter().take_while(|c| c.offset < kept_limit) {
            let end = c.end().min(kept_limit);
            let clipped = end < c.end();
            let overlaps = touched.iter().any(|&(s, e)| s < end && e > c.offset);
            if clipped || overlaps {
                push_rewrite(&mut segments, c.offset, end);
            } else {
                segments.push(Segment::Keep(c.clone()));
            }
        }

        if new_size > kept_limit {
            // Growth: fold a short trailing chunk into the appended range so
            // repeated appends do not leave a trail of tiny chunks.
            let target = self.cache.codec().target_chunk_len();
            let start = match segments.last() {
                Some(Segment::Keep(last)) if last.len < target && last.end() == kept_limit => {
                    let start = last.offset;
                    segments.pop();
                    start
                }
                _ => kept_limit,
            };
            push_rewrite(&mut segments, start, new_size);
        }
        segments
    }

    /// Bytes of `[start, end)` in the new file: surviving old content, then
    /// each sealed write in sequence order, zeros elsewhere.
    fn materialize(
        &self,
        old: &Manifest,
        writes: &[SealedWrite],
        start: u64,
        end: u64,
        old_limit: u64,
    ) -> FsResult<Vec<u8>> {
        let mut buf = vec![0u8; (end - start) as usize];
        let old_end = end.min(old_limit);
        if start < old_end {
            for c in old.chunks_in_range(start, old_end - start) {
                let plain = self.cache.read_plain(c)?;
                let keep = (old_end.min(c.end()) - c.offset) as usize;
                copy_overlap(&mut buf, start, &plain[..keep.min(plain.len())], c.offset);
            }
        }
        for w in writes {
            for (offset, bytes) in w.dirty.extents() {
                copy_overlap(&mut buf, start, bytes, offset);
            }
        }
        Ok(buf)
    }

    fn upload(&self, ids: &[ChunkId], deadline: Option<Instant>) -> FsResult<()> {
        for id in ids {
            let data = self
                .cache
                .peek(id)
                .ok_or_else(|| FsError::Io(format!("dirty chunk {} missing from cache", id)))?;
            let what = format!("upload of chunk {}", id);
            self.retry.run_until(&what, deadline, StoreError::is_retryable, || {
                self.store.put(id, &data)
            })?;
            debug!("uploaded chunk {} ({} bytes)", id, data.len());
        }
        Ok(())
    }

    /// Save the current tree as the durable snapshot, giving up on retries
    /// at `deadline`.
    pub fn persist_until(&self, deadline: Option<Instant>) -> FsResult<()> {
        let _guard = self.snapshot_lock.lock();
        let snapshot = self.tree.snapshot();
        // A save replaces the whole image, so a local IO failure may be repeated.
        let retryable = |e: &StoreError| e.is_retryable() || matches!(e, StoreError::Io(_));
        self.retry
            .run_until("metadata snapshot save", deadline, retryable, || {
                self.meta.save_snapshot(&snapshot)
            })
            .map_err(|e| {
                error!("failed to persist metadata snapshot: {}", e);
                match e {
                    StoreError::TimedOut(_) => FsError::Busy,
                    e => FsError::Io(format!("metadata snapshot: {}", e)),
                }
            })?;
        debug!("persisted snapshot ({} entries)", snapshot.entries.len());
        Ok(())
    }
}
