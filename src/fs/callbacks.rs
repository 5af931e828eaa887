//! The platform-neutral callback surface. Each OS binding translates its
//! native calls into these, and every call resolves to a value or one
//! [`FsError`](crate::error::FsError).

use std::time::SystemTime;

use serde::Serialize;

use super::handles::{HandleId, OpenMode};
use crate::error::FsResult;
use crate::tree::{EntryId, EntryKind};

/// Attributes of one entry as reported to the OS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attr {
    pub id: EntryId,
    pub kind: EntryKind,
    pub size: u64,
    pub perm: u16,
    pub nlink: u32,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
    pub crtime: SystemTime,
    /// Set for entries whose manifest failed validation.
    pub read_only: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub id: EntryId,
    pub name: String,
    pub kind: EntryKind,
}

/// Attribute changes requested by `setattr`. `None` leaves a field alone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SetAttr {
    pub size: Option<u64>,
    pub perm: Option<u16>,
    pub atime: Option<SystemTime>,
    pub mtime: Option<SystemTime>,
}

/// Filesystem-wide figures for `statfs`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FsStats {
    pub block_size: u32,
    pub total_blocks: u64,
    pub free_blocks: u64,
    pub total_files: u64,
    pub free_files: u64,
    pub max_name_len: u32,
}

pub trait FilesystemCallbacks: Send + Sync {
    /// Create a new empty file and open it for writing.
    fn create(&self, path: &str, perm: u16, sid: u32) -> FsResult<(HandleId, Attr)>;
    fn open(&self, path: &str, mode: OpenMode, sid: u32) -> FsResult<HandleId>;
    /// Up to `len` bytes at `offset`; fewer only at end of file.
    fn read(&self, fh: HandleId, offset: u64, len: u32) -> FsResult<Vec<u8>>;
    fn write(&self, fh: HandleId, offset: u64, data: &[u8]) -> FsResult<usize>;
    /// Commit the handle's writes now, keeping it open.
    fn flush(&self, fh: HandleId) -> FsResult<()>;
    fn close(&self, fh: HandleId) -> FsResult<()>;
    fn delete(&self, path: &str) -> FsResult<()>;
    fn rename(&self, from: &str, to: &str) -> FsResult<()>;
    fn getattr(&self, path: &str) -> FsResult<Attr>;
    fn readdir(&self, path: &str) -> FsResult<Vec<DirEntry>>;
    fn mkdir(&self, path: &str, perm: u16) -> FsResult<Attr>;
    fn rmdir(&self, path: &str) -> FsResult<()>;
    fn setattr(&self, path: &str, changes: SetAttr) -> FsResult<Attr>;
    fn statfs(&self) -> FsResult<FsStats>;
}
