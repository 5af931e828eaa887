use std::sync::Arc;
use std::time::SystemTime;

use tracing::{debug, info, warn};

use super::callbacks::{Attr, DirEntry, FilesystemCallbacks, FsStats, SetAttr};
use super::handles::{HandleId, HandlePhase, HandleTable, OpenFileInfo, OpenMode};
use super::sync::{copy_overlap, SyncEngine};
use crate::error::{FsError, FsResult};
use crate::state::chunk_cache::ChunkCache;
use crate::tree::manifest::Manifest;
use crate::tree::{EntryId, EntryKind, EntryRef, MetadataTree};

const BLOCK_SIZE: u32 = 4096;
/// Advertised capacity. The network has no fixed size; report 1 TiB.
const SYNTHETIC_CAPACITY: u64 = 1 << 40;
const SYNTHETIC_FILES: u64 = 1 << 32;
const MAX_NAME_LEN: u32 = 255;

/// Serves the callback set from the metadata tree, the handle table, the
/// chunk cache and the sync engine.
pub struct Bridge {
    tree: Arc<MetadataTree>,
    cache: Arc<ChunkCache>,
    handles: HandleTable,
    sync: SyncEngine,
}

impl Bridge {
    pub fn new(tree: Arc<MetadataTree>, cache: Arc<ChunkCache>, sync: SyncEngine) -> Self {
        Self {
            tree,
            cache,
            handles: HandleTable::new(),
            sync,
        }
    }

    pub fn tree(&self) -> &Arc<MetadataTree> {
        &self.tree
    }

    pub fn cache(&self) -> &Arc<ChunkCache> {
        &self.cache
    }

    pub fn handles(&self) -> &HandleTable {
        &self.handles
    }

    pub fn sync(&self) -> &SyncEngine {
        &self.sync
    }

    pub fn open_files(&self) -> Vec<OpenFileInfo> {
        self.handles.list_open()
    }

    /// Path of a linked entry, for adapters that address entries by id.
    pub fn path_of(&self, id: EntryId) -> FsResult<String> {
        self.tree
            .path_of(id)
            .ok_or_else(|| FsError::NotFound(format!("entry {}", id)))
    }

    pub fn attr_of(&self, entry: &EntryRef) -> Attr {
        let meta = entry.meta();
        let (size, nlink) = match entry.kind() {
            EntryKind::Directory => (0, 2),
            EntryKind::File => {
                let size = entry
                    .size()
                    .max(self.handles.dirty_end(entry.id()))
                    .max(self.sync.pending_end(entry.id()));
                (size, 1)
            }
        };
        Attr {
            id: entry.id(),
            kind: entry.kind(),
            size,
            perm: meta.perm,
            nlink,
            atime: meta.atime,
            mtime: meta.mtime,
            ctime: meta.ctime,
            crtime: meta.crtime,
            read_only: entry.is_read_only(),
        }
    }

    /// Move every open handle's buffered writes into the sync engine.
    pub fn seal_open_handles(&self) -> usize {
        let mut sealed = 0;
        for fh in self.handles.ids() {
            let taken = self
                .handles
                .get_mut(fh)
                .map(|mut h| (Arc::clone(&h.entry), h.dirty.take()));
            if let Some((entry, dirty)) = taken {
                if self.sync.seal(&entry, dirty).is_some() {
                    sealed += 1;
                }
            }
        }
        sealed
    }

    fn corrupt(&self, entry: &EntryRef, reason: String) -> FsError {
        FsError::CorruptManifest {
            path: self
                .tree
                .path_of(entry.id())
                .unwrap_or_else(|| format!("entry {}", entry.id())),
            reason,
        }
    }

    /// Committed bytes of `[offset, offset + len)` from one manifest version.
    fn read_committed(&self, manifest: &Manifest, offset: u64, len: u64) -> FsResult<Vec<u8>> {
        let end = offset.saturating_add(len).min(manifest.size);
        if offset >= end {
            return Ok(Vec::new());
        }
        let mut out = vec![0u8; (end - offset) as usize];
        for chunk in manifest.chunks_in_range(offset, end - offset) {
            let plain = self.cache.read_plain(chunk)?;
            copy_overlap(&mut out, offset, &plain, chunk.offset);
        }
        Ok(out)
    }

    fn open_entry(&self, entry: EntryRef, path: &str, mode: OpenMode, sid: u32) -> HandleId {
        let path = self
            .tree
            .path_of(entry.id())
            .unwrap_or_else(|| path.to_string());
        let fh = self.handles.alloc(entry, path, mode, sid);
        debug!("opened fh={} mode={:?} sid={}", fh, mode, sid);
        fh
    }
}

impl FilesystemCallbacks for Bridge {
    fn create(&self, path: &str, perm: u16, sid: u32) -> FsResult<(HandleId, Attr)> {
        let entry = self.tree.create_path(path, EntryKind::File, perm)?;
        let attr = self.attr_of(&entry);
        let fh = self.open_entry(entry, path, OpenMode::ReadWrite, sid);
        Ok((fh, attr))
    }

    fn open(&self, path: &str, mode: OpenMode, sid: u32) -> FsResult<HandleId> {
        let entry = self.tree.resolve(path)?;
        if entry.is_dir() {
            return Err(FsError::IsADirectory(path.to_string()));
        }
        if mode.can_write() && entry.is_read_only() {
            return Err(FsError::PermissionDenied(path.to_string()));
        }
        Ok(self.open_entry(entry, path, mode, sid))
    }

    fn read(&self, fh: HandleId, offset: u64, len: u32) -> FsResult<Vec<u8>> {
        let entry = match self.handles.get(fh) {
            Some(h) if h.mode.can_read() && h.phase != HandlePhase::Closed => Arc::clone(&h.entry),
            _ => return Err(FsError::BadHandle(fh)),
        };
        if let Some(reason) = entry.corruption() {
            return Err(self.corrupt(&entry, reason));
        }

        // One manifest version for the whole call; no handle ref is held
        // across chunk fetches.
        let manifest = entry.manifest();
        let mut buf = self.read_committed(&manifest, offset, u64::from(len))?;

        // Sealed writes awaiting commit go under this handle's unflushed ones.
        let mut h = self.handles.get_mut(fh).ok_or(FsError::BadHandle(fh))?;
        let visible = manifest
            .size
            .max(self.sync.pending_end(entry.id()))
            .max(h.dirty.end());
        let end = offset.saturating_add(u64::from(len)).min(visible);
        if end > offset {
            buf.resize((end - offset) as usize, 0);
            self.sync.overlay_pending(entry.id(), offset, &mut buf);
            h.dirty.overlay(offset, &mut buf);
        }
        h.has_read = true;
        if h.phase == HandlePhase::Opened {
            h.phase = HandlePhase::Reading;
        }
        Ok(buf)
    }

    fn write(&self, fh: HandleId, offset: u64, data: &[u8]) -> FsResult<usize> {
        let mut h = self.handles.get_mut(fh).ok_or(FsError::BadHandle(fh))?;
        if !h.mode.can_write() {
            return Err(FsError::BadHandle(fh));
        }
        match h.phase {
            HandlePhase::Flushing => return Err(FsError::Busy),
            HandlePhase::Closed => return Err(FsError::BadHandle(fh)),
            _ => {}
        }
        if h.entry.is_read_only() {
            return Err(FsError::PermissionDenied(h.path.clone()));
        }
        let at = match h.mode {
            OpenMode::Append => h
                .entry
                .size()
                .max(h.dirty.end())
                .max(self.sync.pending_end(h.entry.id())),
            _ => offset,
        };
        h.dirty.write(at, data);
        h.phase = HandlePhase::Writing;
        Ok(data.len())
    }

    fn flush(&self, fh: HandleId) -> FsResult<()> {
        let (entry, dirty) = {
            let mut h = self.handles.get_mut(fh).ok_or(FsError::BadHandle(fh))?;
            h.begin_flush()?;
            (Arc::clone(&h.entry), h.dirty.take())
        };
        self.sync.seal(&entry, dirty);
        let result = if self.tree.get(entry.id()).is_some() {
            self.sync.flush(&entry).map(|_| ())
        } else {
            Ok(())
        };
        if let Some(mut h) = self.handles.get_mut(fh) {
            h.end_flush(false);
        }
        result
    }

    fn close(&self, fh: HandleId) -> FsResult<()> {
        let (mut handle, remaining) = self
            .handles
            .remove(fh, |h| {
                self.sync.seal(&h.entry, h.dirty.take());
            })
            .ok_or(FsError::BadHandle(fh))?;
        if let Err(e) = handle.begin_flush() {
            debug!("close of fh={} while it is flushing: {}", fh, e);
        }
        let entry = Arc::clone(&handle.entry);

        let mut result = Ok(());
        if remaining == 0 && self.sync.has_pending(entry.id()) {
            if self.tree.get(entry.id()).is_some() {
                result = self.sync.flush(&entry).map(|_| ());
            } else {
                self.sync.discard(entry.id());
            }
        }
        if handle.mode == OpenMode::Read && handle.has_read {
            entry.touch_accessed();
        }
        handle.end_flush(true);
        if let Err(e) = &result {
            warn!("close of fh={} ({}) failed to commit: {}", fh, handle.path, e);
        }
        result
    }

    fn delete(&self, path: &str) -> FsResult<()> {
        let entry = self.tree.remove(path, EntryKind::File)?;
        if self.handles.open_count(entry.id()) == 0 {
            self.sync.discard(entry.id());
        }
        info!("deleted {} (entry {})", path, entry.id());
        Ok(())
    }

    fn rename(&self, from: &str, to: &str) -> FsResult<()> {
        self.tree.rename(from, to)?;
        info!("renamed {} -> {}", from, to);
        Ok(())
    }

    fn getattr(&self, path: &str) -> FsResult<Attr> {
        let entry = self.tree.resolve(path)?;
        Ok(self.attr_of(&entry))
    }

    fn readdir(&self, path: &str) -> FsResult<Vec<DirEntry>> {
        Ok(self
            .tree
            .readdir(path)?
            .map(|l| DirEntry {
                id: l.id,
                name: l.name,
                kind: l.kind,
            })
            .collect())
    }

    fn mkdir(&self, path: &str, perm: u16) -> FsResult<Attr> {
        let entry = self.tree.create_path(path, EntryKind::Directory, perm)?;
        Ok(self.attr_of(&entry))
    }

    fn rmdir(&self, path: &str) -> FsResult<()> {
        self.tree.remove(path, EntryKind::Directory)?;
        Ok(())
    }

    fn setattr(&self, path: &str, changes: SetAttr) -> FsResult<Attr> {
        let entry = self.tree.resolve(path)?;
        if changes != SetAttr::default() && entry.is_read_only() {
            return Err(FsError::PermissionDenied(path.to_string()));
        }
        if let Some(size) = changes.size {
            if entry.is_dir() {
                return Err(FsError::IsADirectory(path.to_string()));
            }
            self.handles.truncate_dirty(entry.id(), size);
            let version = self.sync.truncate(&entry, size)?;
            debug!("truncated {} to {} bytes ({})", path, size, version);
        }
        entry.update_meta(|m| {
            if let Some(perm) = changes.perm {
                m.perm = perm & 0o7777;
            }
            if let Some(atime) = changes.atime {
                m.atime = atime;
            }
            if let Some(mtime) = changes.mtime {
                m.mtime = mtime;
            }
            m.ctime = SystemTime::now();
        });
        Ok(self.attr_of(&entry))
    }

    fn statfs(&self) -> FsResult<FsStats> {
        let used: u64 = self.tree.files().iter().map(|e| e.size()).sum();
        let block = u64::from(BLOCK_SIZE);
        let total_blocks = SYNTHETIC_CAPACITY / block;
        let used_blocks = used.div_ceil(block);
        Ok(FsStats {
            block_size: BLOCK_SIZE,
            total_blocks,
            free_blocks: total_blocks.saturating_sub(used_blocks),
            total_files: SYNTHETIC_FILES,
            free_files: SYNTHETIC_FILES.saturating_sub(self.tree.len() as u64),
            max_name_len: MAX_NAME_LEN,
        })
    }
}
