pub mod bridge;
pub mod callbacks;
pub mod dirty;
pub mod handles;
pub mod sync;

use std::ffi::OsStr;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use fuser::{
    AccessFlags, BsdFileFlags, Errno, FileAttr, FileHandle, FileType, Filesystem, FopenFlags,
    Generation, INodeNo, KernelConfig, LockOwner, OpenFlags, ReplyAttr, ReplyCreate, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, RenameFlags,
    Request, TimeOrNow, WriteFlags,
};
use tracing::{debug, info, warn};

use self::callbacks::{Attr, FilesystemCallbacks, SetAttr};
use self::handles::OpenMode;
use crate::error::{FsError, FsResult, MountError};
use crate::mount::{MountSession, OsRegistrar, Registration};
use crate::tree::path::PathPolicy;
use crate::tree::{EntryKind, ROOT_ID};

const TTL: Duration = Duration::from_secs(1);
const BLOCK_SIZE: u32 = 4096;

/// Get the session ID for a given PID. Falls back to the PID itself on error.
fn get_sid(pid: u32) -> u32 {
    let sid = unsafe { libc::getsid(pid as i32) };
    if sid < 0 { pid } else { sid as u32 }
}

fn errno(e: &FsError) -> Errno {
    Errno::from(std::io::Error::from_raw_os_error(e.errno()))
}

fn file_type(kind: EntryKind) -> FileType {
    match kind {
        EntryKind::File => FileType::RegularFile,
        EntryKind::Directory => FileType::Directory,
    }
}

fn attr_to_file_attr(attr: &Attr) -> FileAttr {
    let perm = if attr.read_only {
        attr.perm & !0o222
    } else {
        attr.perm
    };
    FileAttr {
        ino: INodeNo(attr.id),
        size: attr.size,
        blocks: attr.size.div_ceil(512),
        atime: attr.atime,
        mtime: attr.mtime,
        ctime: attr.ctime,
        crtime: attr.crtime,
        kind: file_type(attr.kind),
        perm,
        nlink: attr.nlink,
        uid: unsafe { libc::getuid() },
        gid: unsafe { libc::getgid() },
        rdev: 0,
        blksize: BLOCK_SIZE,
        flags: 0,
    }
}

fn system_time(t: TimeOrNow) -> SystemTime {
    match t {
        TimeOrNow::SpecificTime(st) => st,
        TimeOrNow::Now => SystemTime::now(),
    }
}

/// FUSE binding: translates inode-addressed kernel calls into the
/// path-addressed callback set of a [`MountSession`]. Entry ids double as
/// inode numbers; the root is inode 1.
pub struct ChunkFs {
    session: Arc<MountSession>,
}

impl ChunkFs {
    pub fn new(session: Arc<MountSession>) -> Self {
        Self { session }
    }

    fn path(&self, ino: INodeNo) -> FsResult<String> {
        self.session.bridge().path_of(u64::from(ino))
    }

    fn child_path(&self, parent: INodeNo, name: &OsStr) -> FsResult<String> {
        let name = name
            .to_str()
            .ok_or_else(|| FsError::InvalidArgument(format!("non-UTF-8 name {:?}", name)))?;
        let parent = self.path(parent)?;
        let mut components = self.session.bridge().tree().policy().components(&parent);
        components.push(name.to_string());
        Ok(PathPolicy::join(&components))
    }

    fn parent_ino(&self, path: &str) -> u64 {
        let components = self.session.bridge().tree().policy().components(path);
        if components.len() <= 1 {
            return ROOT_ID;
        }
        let parent = PathPolicy::join(&components[..components.len() - 1]);
        self.session
            .getattr(&parent)
            .map(|a| a.id)
            .unwrap_or(ROOT_ID)
    }
}

impl Filesystem for ChunkFs {
    fn init(
        &mut self,
        _req: &Request,
        _config: &mut KernelConfig,
    ) -> std::io::Result<()> {
        info!("chunkfs filesystem initialized at {}", self.session.target());
        Ok(())
    }

    fn destroy(&mut self) {
        info!("chunkfs filesystem shutting down");
    }

    fn lookup(&self, _req: &Request, parent: INodeNo, name: &OsStr, reply: ReplyEntry) {
        debug!("lookup(parent={}, name={:?})", u64::from(parent), name);
        match self
            .child_path(parent, name)
            .and_then(|path| self.session.getattr(&path))
        {
            Ok(attr) => reply.entry(&TTL, &attr_to_file_attr(&attr), Generation(0)),
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn getattr(&self, _req: &Request, ino: INodeNo, _fh: Option<FileHandle>, reply: ReplyAttr) {
        match self.path(ino).and_then(|path| self.session.getattr(&path)) {
            Ok(attr) => reply.attr(&TTL, &attr_to_file_attr(&attr)),
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn setattr(
        &self,
        _req: &Request,
        ino: INodeNo,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<FileHandle>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<BsdFileFlags>,
        reply: ReplyAttr,
    ) {
        debug!("setattr(ino={}, size={:?}, mode={:?})", u64::from(ino), size, mode);
        if uid.is_some() || gid.is_some() {
            // Ownership is always the mounting user.
            reply.error(Errno::from(std::io::Error::from_raw_os_error(libc::EPERM)));
            return;
        }
        let changes = SetAttr {
            size,
            perm: mode.map(|m| (m & 0o7777) as u16),
            atime: atime.map(system_time),
            mtime: mtime.map(system_time),
        };
        match self
            .path(ino)
            .and_then(|path| self.session.setattr(&path, changes))
        {
            Ok(attr) => reply.attr(&TTL, &attr_to_file_attr(&attr)),
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn open(&self, req: &Request, ino: INodeNo, flags: OpenFlags, reply: ReplyOpen) {
        let mode = OpenMode::from_flags(flags.0);
        let sid = get_sid(req.pid());
        match self
            .path(ino)
            .and_then(|path| self.session.open(&path, mode, sid))
        {
            Ok(fh) => reply.opened(FileHandle(fh), FopenFlags::empty()),
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn read(
        &self,
        _req: &Request,
        _ino: INodeNo,
        fh: FileHandle,
        offset: u64,
        size: u32,
        _flags: OpenFlags,
        _lock_owner: Option<LockOwner>,
        reply: ReplyData,
    ) {
        match self.session.read(u64::from(fh), offset, size) {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn write(
        &self,
        _req: &Request,
        _ino: INodeNo,
        fh: FileHandle,
        offset: u64,
        data: &[u8],
        _write_flags: WriteFlags,
        _flags: OpenFlags,
        _lock_owner: Option<LockOwner>,
        reply: ReplyWrite,
    ) {
        match self.session.write(u64::from(fh), offset, data) {
            Ok(n) => reply.written(n as u32),
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn flush(
        &self,
        _req: &Request,
        _ino: INodeNo,
        fh: FileHandle,
        _lock_owner: LockOwner,
        reply: ReplyEmpty,
    ) {
        match self.session.flush(u64::from(fh)) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn fsync(
        &self,
        _req: &Request,
        _ino: INodeNo,
        fh: FileHandle,
        _datasync: bool,
        reply: ReplyEmpty,
    ) {
        match self.session.flush(u64::from(fh)) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn release(
        &self,
        _req: &Request,
        _ino: INodeNo,
        fh: FileHandle,
        _flags: OpenFlags,
        _lock_owner: Option<LockOwner>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        match self.session.close(u64::from(fh)) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn readdir(
        &self,
        _req: &Request,
        ino: INodeNo,
        _fh: FileHandle,
        offset: u64,
        mut reply: ReplyDirectory,
    ) {
        let listing = self.path(ino).and_then(|path| {
            let entries = self.session.readdir(&path)?;
            Ok((self.parent_ino(&path), entries))
        });
        let (parent, entries) = match listing {
            Ok(l) => l,
            Err(e) => {
                reply.error(errno(&e));
                return;
            }
        };
        let dots = [
            (u64::from(ino), FileType::Directory, ".".to_string()),
            (parent, FileType::Directory, "..".to_string()),
        ];
        let all = dots
            .into_iter()
            .chain(entries.into_iter().map(|e| (e.id, file_type(e.kind), e.name)));
        for (i, (id, kind, name)) in all.enumerate().skip(offset as usize) {
            if reply.add(INodeNo(id), (i + 1) as u64, kind, &name) {
                break;
            }
        }
        reply.ok();
    }

    fn create(
        &self,
        req: &Request,
        parent: INodeNo,
        name: &OsStr,
        mode: u32,
        umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        let perm = (mode & !umask & 0o7777) as u16;
        let sid = get_sid(req.pid());
        match self
            .child_path(parent, name)
            .and_then(|path| self.session.create(&path, perm, sid))
        {
            Ok((fh, attr)) => reply.created(
                &TTL,
                &attr_to_file_attr(&attr),
                Generation(0),
                FileHandle(fh),
                FopenFlags::empty(),
            ),
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn mkdir(
        &self,
        _req: &Request,
        parent: INodeNo,
        name: &OsStr,
        mode: u32,
        umask: u32,
        reply: ReplyEntry,
    ) {
        let perm = (mode & !umask & 0o7777) as u16;
        match self
            .child_path(parent, name)
            .and_then(|path| self.session.mkdir(&path, perm))
        {
            Ok(attr) => reply.entry(&TTL, &attr_to_file_attr(&attr), Generation(0)),
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn unlink(&self, _req: &Request, parent: INodeNo, name: &OsStr, reply: ReplyEmpty) {
        match self
            .child_path(parent, name)
            .and_then(|path| self.session.delete(&path))
        {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn rmdir(&self, _req: &Request, parent: INodeNo, name: &OsStr, reply: ReplyEmpty) {
        match self
            .child_path(parent, name)
            .and_then(|path| self.session.rmdir(&path))
        {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn rename(
        &self,
        _req: &Request,
        parent: INodeNo,
        name: &OsStr,
        newparent: INodeNo,
        newname: &OsStr,
        _flags: RenameFlags,
        reply: ReplyEmpty,
    ) {
        let result = self.child_path(parent, name).and_then(|from| {
            let to = self.child_path(newparent, newname)?;
            self.session.rename(&from, &to)
        });
        match result {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn link(
        &self,
        _req: &Request,
        _ino: INodeNo,
        _newparent: INodeNo,
        _newname: &OsStr,
        reply: ReplyEntry,
    ) {
        // A manifest belongs to exactly one entry.
        reply.error(Errno::ENOTSUP);
    }

    fn statfs(&self, _req: &Request, _ino: INodeNo, reply: ReplyStatfs) {
        match self.session.statfs() {
            Ok(st) => reply.statfs(
                st.total_blocks,
                st.free_blocks,
                st.free_blocks,
                st.total_files,
                st.free_files,
                st.block_size,
                st.max_name_len,
                st.block_size,
            ),
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn access(&self, _req: &Request, ino: INodeNo, mask: AccessFlags, reply: ReplyEmpty) {
        debug!("access(ino={}, mask={:?})", u64::from(ino), mask);
        // Permission bits are enforced by the kernel (DefaultPermissions);
        // only existence is checked here.
        match self.path(ino).and_then(|path| self.session.getattr(&path)) {
            Ok(_) => reply.ok(),
            Err(e) => reply.error(errno(&e)),
        }
    }
}

/// Registers sessions as FUSE mounts.
#[derive(Debug, Default)]
pub struct FuseRegistrar;

struct FuseRegistration {
    session: fuser::BackgroundSession,
    mountpoint: String,
}

impl Registration for FuseRegistration {
    fn is_active(&self) -> bool {
        !self.session.guard.is_finished()
    }

    fn release(self: Box<Self>) -> std::io::Result<()> {
        let FuseRegistration {
            session,
            mountpoint,
        } = *self;
        if session.guard.is_finished() {
            return session.join();
        }
        if let Err(e) = session.umount_and_join() {
            warn!("Error during unmount of {}, trying force unmount: {}", mountpoint, e);
            let status = std::process::Command::new("umount")
                .args(["-f", &*mountpoint])
                .status()?;
            if !status.success() {
                return Err(e);
            }
        }
        Ok(())
    }
}

fn mount_error(target: &str, e: std::io::Error) -> MountError {
    match e.raw_os_error() {
        Some(code) if code == libc::EPERM || code == libc::EACCES => {
            MountError::PermissionDenied(format!("{}: {}", target, e))
        }
        _ => MountError::Os(e),
    }
}

impl OsRegistrar for FuseRegistrar {
    fn validate(&self, target: &str) -> Result<String, MountError> {
        let invalid = |reason: String| MountError::InvalidTarget {
            target: target.to_string(),
            reason,
        };
        let path = std::fs::canonicalize(target).map_err(|e| invalid(e.to_string()))?;
        if !path.is_dir() {
            return Err(invalid("not a directory".to_string()));
        }
        path.to_str()
            .map(str::to_string)
            .ok_or_else(|| invalid("path is not valid UTF-8".to_string()))
    }

    fn register(
        &self,
        target: &str,
        session: Arc<MountSession>,
    ) -> Result<Box<dyn Registration>, MountError> {
        let mountpoint = Path::new(target);
        let mut fuse_config = fuser::Config::default();
        fuse_config.mount_options = vec![
            fuser::MountOption::FSName("chunkfs".to_string()),
            fuser::MountOption::AutoUnmount,
            fuser::MountOption::DefaultPermissions,
        ];
        fuse_config.acl = fuser::SessionACL::All;

        info!("Mounting chunkfs filesystem at {}...", target);
        let fs = ChunkFs::new(Arc::clone(&session));
        let background = match fuser::spawn_mount2(fs, mountpoint, &fuse_config) {
            Ok(background) => background,
            Err(e)
                if e.raw_os_error() == Some(libc::EPERM)
                    || e.to_string().contains("allow_other") =>
            {
                warn!("mount with allow_other refused ({}); retrying for owner only", e);
                fuse_config.acl = fuser::SessionACL::Owner;
                fuser::spawn_mount2(ChunkFs::new(session), mountpoint, &fuse_config)
                    .map_err(|e| mount_error(target, e))?
            }
            Err(e) => return Err(mount_error(target, e)),
        };
        Ok(Box::new(FuseRegistration {
            session: background,
            mountpoint: target.to_string(),
        }))
    }
}
