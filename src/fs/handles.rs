use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::DashMap;
use serde::Serialize;

use super::dirty::DirtyBuffer;
use crate::error::{FsError, FsResult};
use crate::tree::{EntryId, EntryRef};

pub type HandleId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum OpenMode {
    Read,
    Write,
    ReadWrite,
    /// Every write lands at the end of the file as seen by this handle.
    Append,
}

impl OpenMode {
    /// Derive the mode from POSIX open flags.
    pub fn from_flags(flags: i32) -> Self {
        let append = flags & libc::O_APPEND != 0;
        match flags & libc::O_ACCMODE {
            libc::O_RDONLY => OpenMode::Read,
            _ if append => OpenMode::Append,
            libc::O_WRONLY => OpenMode::Write,
            _ => OpenMode::ReadWrite,
        }
    }

    pub fn can_read(self) -> bool {
        matches!(self, OpenMode::Read | OpenMode::ReadWrite | OpenMode::Append)
    }

    pub fn can_write(self) -> bool {
        !matches!(self, OpenMode::Read)
    }
}

/// Lifecycle of a handle:
/// `Opened -> {Reading, Writing} -> Flushing -> Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum HandlePhase {
    Opened,
    Reading,
    Writing,
    Flushing,
    Closed,
}

#[derive(Debug)]
pub struct OpenHandle {
    /// The file handle ID assigned by chunkfs.
    pub fh: HandleId,
    pub entry: EntryRef,
    /// Path at open time, for reporting.
    pub path: String,
    pub mode: OpenMode,
    pub phase: HandlePhase,
    /// Writes not yet sealed for commit.
    pub dirty: DirtyBuffer,
    /// Whether this handle has been used for reading.
    pub has_read: bool,
    /// Session ID of the process that opened this handle.
    pub sid: u32,
}

impl OpenHandle {
    /// Enter `Flushing`. Only an open handle can flush, and only once at a time.
    pub fn begin_flush(&mut self) -> FsResult<()> {
        match self.phase {
            HandlePhase::Opened | HandlePhase::Reading | HandlePhase::Writing => {
                self.phase = HandlePhase::Flushing;
                Ok(())
            }
            HandlePhase::Flushing => Err(FsError::Busy),
            HandlePhase::Closed => Err(FsError::BadHandle(self.fh)),
        }
    }

    pub fn end_flush(&mut self, closing: bool) {
        self.phase = if closing {
            HandlePhase::Closed
        } else {
            HandlePhase::Opened
        };
    }
}

/// Summary of an open handle for status output.
#[derive(Debug, Clone, Serialize)]
pub struct OpenFileInfo {
    pub fh: HandleId,
    pub path: String,
    pub mode: OpenMode,
    pub sid: u32,
    pub dirty_bytes: u64,
}

pub struct HandleTable {
    handles: DashMap<HandleId, OpenHandle>,
    /// Open handles per entry.
    open_counts: DashMap<EntryId, usize>,
    next_fh: AtomicU64,
}

impl HandleTable {
    pub fn new() -> Self {
        Self {
            handles: DashMap::new(),
            open_counts: DashMap::new(),
            next_fh: AtomicU64::new(1),
        }
    }

    pub fn alloc(&self, entry: EntryRef, path: String, mode: OpenMode, sid: u32) -> HandleId {
        let fh = self.next_fh.fetch_add(1, Ordering::Relaxed);
        *self.open_counts.entry(entry.id()).or_insert(0) += 1;
        let state = OpenHandle {
            fh,
            entry,
            path,
            mode,
            phase: HandlePhase::Opened,
            dirty: DirtyBuffer::new(),
            has_read: false,
            sid,
        };
        self.handles.insert(fh, state);
        fh
    }

    pub fn get(&self, fh: HandleId) -> Option<dashmap::mapref::one::Ref<'_, HandleId, OpenHandle>> {
        self.handles.get(&fh)
    }

    pub fn get_mut(
        &self,
        fh: HandleId,
    ) -> Option<dashmap::mapref::one::RefMut<'_, HandleId, OpenHandle>> {
        self.handles.get_mut(&fh)
    }

    /// Remove a handle and report how many handles remain open on its entry.
    ///
    /// `seal` runs on the removed handle while its entry's open count is
    /// still held and before it drops, so whichever closer sees zero
    /// remaining also sees what every earlier closer sealed.
    pub fn remove(
        &self,
        fh: HandleId,
        seal: impl FnOnce(&mut OpenHandle),
    ) -> Option<(OpenHandle, usize)> {
        let (_, mut handle) = self.handles.remove(&fh)?;
        let remaining = match self.open_counts.entry(handle.entry.id()) {
            MapEntry::Occupied(mut o) => {
                seal(&mut handle);
                *o.get_mut() = o.get().saturating_sub(1);
                let left = *o.get();
                if left == 0 {
                    o.remove();
                }
                left
            }
            MapEntry::Vacant(_) => {
                seal(&mut handle);
                0
            }
        };
        Some((handle, remaining))
    }

    pub fn open_count(&self, entry: EntryId) -> usize {
        self.open_counts.get(&entry).map(|c| *c).unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn ids(&self) -> Vec<HandleId> {
        self.handles.iter().map(|h| *h.key()).collect()
    }

    /// Largest unflushed write end across handles open on `entry`.
    pub fn dirty_end(&self, entry: EntryId) -> u64 {
        self.handles
            .iter()
            .filter(|h| h.entry.id() == entry)
            .map(|h| h.dirty.end())
            .max()
            .unwrap_or(0)
    }

    /// Drop unflushed bytes at or beyond `size` on every handle of `entry`.
    pub fn truncate_dirty(&self, entry: EntryId, size: u64) {
        for mut h in self.handles.iter_mut().filter(|h| h.entry.id() == entry) {
            h.dirty.truncate(size);
        }
    }

    pub fn list_open(&self) -> Vec<OpenFileInfo> {
        let mut out: Vec<OpenFileInfo> = self
            .handles
            .iter()
            .map(|h| OpenFileInfo {
                fh: h.fh,
                path: h.path.clone(),
                mode: h.mode,
                sid: h.sid,
                dirty_bytes: h.dirty.len(),
            })
            .collect();
        out.sort_by_key(|i| i.fh);
        out
    }
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}
