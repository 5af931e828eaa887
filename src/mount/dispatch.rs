//! Operation registry: every OS call is turned into an [`FsRequest`] and
//! routed through a map from [`OpKind`] to handler, filled once per mount.

use std::collections::HashMap;
use std::fmt;

use serde::Serialize;

use crate::error::{FsError, FsResult};
use crate::fs::bridge::Bridge;
use crate::fs::callbacks::{Attr, DirEntry, FilesystemCallbacks, FsStats, SetAttr};
use crate::fs::handles::{HandleId, OpenMode};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum OpKind {
    Create,
    Open,
    Read,
    Write,
    Flush,
    Close,
    Delete,
    Rename,
    Getattr,
    Readdir,
    Mkdir,
    Rmdir,
    Setattr,
    Statfs,
}

#[derive(Debug)]
pub enum FsRequest<'a> {
    Create { path: &'a str, perm: u16, sid: u32 },
    Open { path: &'a str, mode: OpenMode, sid: u32 },
    Read { fh: HandleId, offset: u64, len: u32 },
    Write { fh: HandleId, offset: u64, data: &'a [u8] },
    Flush { fh: HandleId },
    Close { fh: HandleId },
    Delete { path: &'a str },
    Rename { from: &'a str, to: &'a str },
    Getattr { path: &'a str },
    Readdir { path: &'a str },
    Mkdir { path: &'a str, perm: u16 },
    Rmdir { path: &'a str },
    Setattr { path: &'a str, changes: SetAttr },
    Statfs,
}

impl FsRequest<'_> {
    pub fn kind(&self) -> OpKind {
        match self {
            FsRequest::Create { .. } => OpKind::Create,
            FsRequest::Open { .. } => OpKind::Open,
            FsRequest::Read { .. } => OpKind::Read,
            FsRequest::Write { .. } => OpKind::Write,
            FsRequest::Flush { .. } => OpKind::Flush,
            FsRequest::Close { .. } => OpKind::Close,
            FsRequest::Delete { .. } => OpKind::Delete,
            FsRequest::Rename { .. } => OpKind::Rename,
            FsRequest::Getattr { .. } => OpKind::Getattr,
            FsRequest::Readdir { .. } => OpKind::Readdir,
            FsRequest::Mkdir { .. } => OpKind::Mkdir,
            FsRequest::Rmdir { .. } => OpKind::Rmdir,
            FsRequest::Setattr { .. } => OpKind::Setattr,
            FsRequest::Statfs => OpKind::Statfs,
        }
    }
}

impl fmt::Display for FsRequest<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FsRequest::Create { path, perm, sid } => {
                write!(f, "create({}, mode={:#o}, sid={})", path, perm, sid)
            }
            FsRequest::Open { path, mode, sid } => {
                write!(f, "open({}, {:?}, sid={})", path, mode, sid)
            }
            FsRequest::Read { fh, offset, len } => {
                write!(f, "read(fh={}, offset={}, size={})", fh, offset, len)
            }
            FsRequest::Write { fh, offset, data } => {
                write!(f, "write(fh={}, offset={}, size={})", fh, offset, data.len())
            }
            FsRequest::Flush { fh } => write!(f, "flush(fh={})", fh),
            FsRequest::Close { fh } => write!(f, "close(fh={})", fh),
            FsRequest::Delete { path } => write!(f, "delete({})", path),
            FsRequest::Rename { from, to } => write!(f, "rename({} -> {})", from, to),
            FsRequest::Getattr { path } => write!(f, "getattr({})", path),
            FsRequest::Readdir { path } => write!(f, "readdir({})", path),
            FsRequest::Mkdir { path, perm } => write!(f, "mkdir({}, mode={:#o})", path, perm),
            FsRequest::Rmdir { path } => write!(f, "rmdir({})", path),
            FsRequest::Setattr { path, changes } => write!(f, "setattr({}, {:?})", path, changes),
            FsRequest::Statfs => write!(f, "statfs"),
        }
    }
}

#[derive(Debug)]
pub enum FsReply {
    Created(HandleId, Attr),
    Opened(HandleId),
    Data(Vec<u8>),
    Written(usize),
    Attr(Attr),
    Entries(Vec<DirEntry>),
    Stats(FsStats),
    Done,
}

impl FsReply {
    /// Error for a reply that does not fit the request that produced it.
    pub fn mismatch(self, wanted: OpKind) -> FsError {
        FsError::Io(format!("{:?} produced an unexpected reply {:?}", wanted, self))
    }
}

pub type Handler = for<'a> fn(&Bridge, FsRequest<'a>) -> FsResult<FsReply>;

fn wrong_request(req: FsRequest<'_>) -> FsError {
    FsError::InvalidArgument(format!("handler received mismatched request {:?}", req.kind()))
}

pub struct Dispatcher {
    handlers: HashMap<OpKind, Handler>,
}

impl Dispatcher {
    pub fn empty() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Registry with a handler for every operation the bridge serves.
    pub fn new() -> Self {
        let mut d = Self::empty();
        d.register(OpKind::Create, |b, req| match req {
            FsRequest::Create { path, perm, sid } => {
                b.create(path, perm, sid).map(|(fh, attr)| FsReply::Created(fh, attr))
            }
            other => Err(wrong_request(other)),
        });
        d.register(OpKind::Open, |b, req| match req {
            FsRequest::Open { path, mode, sid } => b.open(path, mode, sid).map(FsReply::Opened),
            other => Err(wrong_request(other)),
        });
        d.register(OpKind::Read, |b, req| match req {
            FsRequest::Read { fh, offset, len } => b.read(fh, offset, len).map(FsReply::Data),
            other => Err(wrong_request(other)),
        });
        d.register(OpKind::Write, |b, req| match req {
            FsRequest::Write { fh, offset, data } => {
                b.write(fh, offset, data).map(FsReply::Written)
            }
            other => Err(wrong_request(other)),
        });
        d.register(OpKind::Flush, |b, req| match req {
            FsRequest::Flush { fh } => b.flush(fh).map(|_| FsReply::Done),
            other => Err(wrong_request(other)),
        });
        d.register(OpKind::Close, |b, req| match req {
            FsRequest::Close { fh } => b.close(fh).map(|_| FsReply::Done),
            other => Err(wrong_request(other)),
        });
        d.register(OpKind::Delete, |b, req| match req {
            FsRequest::Delete { path } => b.delete(path).map(|_| FsReply::Done),
            other => Err(wrong_request(other)),
        });
        d.register(OpKind::Rename, |b, req| match req {
            FsRequest::Rename { from, to } => b.rename(from, to).map(|_| FsReply::Done),
            other => Err(wrong_request(other)),
        });
        d.register(OpKind::Getattr, |b, req| match req {
            FsRequest::Getattr { path } => b.getattr(path).map(FsReply::Attr),
            other => Err(wrong_request(other)),
        });
        d.register(OpKind::Readdir, |b, req| match req {
            FsRequest::Readdir { path } => b.readdir(path).map(FsReply::Entries),
            other => Err(wrong_request(other)),
        });
        d.register(OpKind::Mkdir, |b, req| match req {
            FsRequest::Mkdir { path, perm } => b.mkdir(path, perm).map(FsReply::Attr),
            other => Err(wrong_request(other)),
        });
        d.register(OpKind::Rmdir, |b, req| match req {
            FsRequest::Rmdir { path } => b.rmdir(path).map(|_| FsReply::Done),
            other => Err(wrong_request(other)),
        });
        d.register(OpKind::Setattr, |b, req| match req {
            FsRequest::Setattr { path, changes } => b.setattr(path, changes).map(FsReply::Attr),
            other => Err(wrong_request(other)),
        });
        d.register(OpKind::Statfs, |b, req| match req {
            FsRequest::Statfs => b.statfs().map(FsReply::Stats),
            other => Err(wrong_request(other)),
        });
        d
    }

    /// Install or replace the handler for `kind`.
    pub fn register(&mut self, kind: OpKind, handler: Handler) {
        self.handlers.insert(kind, handler);
    }

    pub fn handles(&self, kind: OpKind) -> bool {
        self.handlers.contains_key(&kind)
    }

    pub fn dispatch(&self, bridge: &Bridge, req: FsRequest<'_>) -> FsResult<FsReply> {
        let kind = req.kind();
        let handler = self
            .handlers
            .get(&kind)
            .ok_or_else(|| FsError::InvalidArgument(format!("{:?} is not supported", kind)))?;
        handler(bridge, req)
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}
