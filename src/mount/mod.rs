//! Mount lifecycle: building a session from its collaborators, registering
//! it with the OS, routing calls through the dispatcher and draining it on
//! unmount.

pub mod dispatch;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use tracing::{debug, info, warn};

use self::dispatch::{Dispatcher, FsReply, FsRequest, OpKind};
use crate::config::MountConfig;
use crate::error::{FsError, FsResult, MountError, UnmountError};
use crate::fs::bridge::Bridge;
use crate::fs::callbacks::{Attr, DirEntry, FilesystemCallbacks, FsStats, SetAttr};
use crate::fs::handles::{HandleId, OpenFileInfo, OpenMode};
use crate::fs::sync::SyncEngine;
use crate::logging::LogContext;
use crate::state::chunk_cache::{CacheStats, ChunkCache};
use crate::store::{ChunkCodec, ChunkStore, MetadataStore};
use crate::tree::MetadataTree;

/// The external services a mount is built on.
#[derive(Clone)]
pub struct Collaborators {
    pub store: Arc<dyn ChunkStore>,
    pub codec: Arc<dyn ChunkCodec>,
    pub meta: Arc<dyn MetadataStore>,
}

/// A live OS registration. Dropping it without `release` leaves the mount
/// to the OS's own cleanup.
pub trait Registration: Send {
    /// False once the OS side has gone away (e.g. an external unmount).
    fn is_active(&self) -> bool;

    fn release(self: Box<Self>) -> std::io::Result<()>;
}

/// Makes a session visible to the operating system.
pub trait OsRegistrar: Send + Sync {
    /// Check a target and return its canonical form.
    fn validate(&self, target: &str) -> Result<String, MountError>;

    fn register(
        &self,
        target: &str,
        session: Arc<MountSession>,
    ) -> Result<Box<dyn Registration>, MountError>;
}

/// Registrar that keeps sessions inside the process; callers drive them
/// through [`FilesystemCallbacks`] directly.
#[derive(Debug, Default)]
pub struct InProcessRegistrar {
    denied: HashSet<String>,
}

impl InProcessRegistrar {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse to register the given targets, as an OS without the needed
    /// privileges would.
    pub fn denying<I, S>(targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            denied: targets.into_iter().map(Into::into).collect(),
        }
    }
}

struct InProcessRegistration;

impl Registration for InProcessRegistration {
    fn is_active(&self) -> bool {
        true
    }

    fn release(self: Box<Self>) -> std::io::Result<()> {
        Ok(())
    }
}

impl OsRegistrar for InProcessRegistrar {
    fn validate(&self, target: &str) -> Result<String, MountError> {
        let target = target.trim();
        if target.is_empty() {
            return Err(MountError::InvalidTarget {
                target: target.to_string(),
                reason: "empty target".to_string(),
            });
        }
        Ok(target.to_string())
    }

    fn register(
        &self,
        target: &str,
        _session: Arc<MountSession>,
    ) -> Result<Box<dyn Registration>, MountError> {
        if self.denied.contains(target) {
            return Err(MountError::PermissionDenied(target.to_string()));
        }
        Ok(Box::new(InProcessRegistration))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionPhase {
    Active,
    /// Unmount in progress; new calls are rejected with `Busy`.
    Draining,
    Released,
}

struct Gate {
    phase: SessionPhase,
    inflight: usize,
}

/// Counts one dispatched call for the duration of its handler.
struct OpGuard<'a> {
    session: &'a MountSession,
}

impl Drop for OpGuard<'_> {
    fn drop(&mut self) {
        let mut gate = self.session.gate.lock();
        gate.inflight -= 1;
        if gate.inflight == 0 {
            self.session.idle.notify_all();
        }
    }
}

/// Serializable summary of a session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub target: String,
    pub session_id: String,
    pub phase: SessionPhase,
    pub uptime_seconds: u64,
    pub entries: usize,
    pub open_files: Vec<OpenFileInfo>,
    pub pending_entries: usize,
    pub commits: u64,
    pub cache: CacheStats,
}

/// One mounted filesystem. Owns every entry, the cache and the handle table
/// for as long as it is mounted.
pub struct MountSession {
    target: String,
    config: MountConfig,
    log: LogContext,
    dispatcher: Dispatcher,
    bridge: Bridge,
    gate: Mutex<Gate>,
    idle: Condvar,
    registration: Mutex<Option<Box<dyn Registration>>>,
}

impl MountSession {
    fn new(target: String, config: MountConfig, tree: MetadataTree, collab: Collaborators) -> Self {
        let log = LogContext::new(&target, &config.session_id);
        let tree = Arc::new(tree);
        let cache = Arc::new(ChunkCache::new(
            Arc::clone(&collab.store),
            collab.codec,
            config.retry,
            config.cache_budget_bytes,
        ));
        let sync = SyncEngine::new(
            Arc::clone(&tree),
            Arc::clone(&cache),
            collab.store,
            collab.meta,
            config.retry,
        );
        Self {
            target,
            config,
            log,
            dispatcher: Dispatcher::new(),
            bridge: Bridge::new(tree, cache, sync),
            gate: Mutex::new(Gate {
                phase: SessionPhase::Active,
                inflight: 0,
            }),
            idle: Condvar::new(),
            registration: Mutex::new(None),
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn config(&self) -> &MountConfig {
        &self.config
    }

    pub fn bridge(&self) -> &Bridge {
        &self.bridge
    }

    pub fn phase(&self) -> SessionPhase {
        self.gate.lock().phase
    }

    /// Whether the OS side of the mount is still attached.
    pub fn is_registered(&self) -> bool {
        self.registration
            .lock()
            .as_ref()
            .is_some_and(|r| r.is_active())
    }

    pub fn open_files(&self) -> Vec<OpenFileInfo> {
        self.bridge.open_files()
    }

    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            target: self.target.clone(),
            session_id: self.config.session_id.clone(),
            phase: self.phase(),
            uptime_seconds: self.log.uptime().as_secs(),
            entries: self.bridge.tree().len(),
            open_files: self.bridge.open_files(),
            pending_entries: self.bridge.sync().pending_entries().len(),
            commits: self.bridge.sync().commits(),
            cache: self.bridge.cache().stats(),
        }
    }

    fn begin_op(&self) -> FsResult<OpGuard<'_>> {
        let mut gate = self.gate.lock();
        if gate.phase != SessionPhase::Active {
            return Err(FsError::Busy);
        }
        gate.inflight += 1;
        Ok(OpGuard { session: self })
    }

    fn call(&self, req: FsRequest<'_>) -> FsResult<FsReply> {
        let kind = req.kind();
        let _op = self.begin_op()?;
        let _span = self.log.span().enter();
        debug!("{}", req);
        let result = self.dispatcher.dispatch(&self.bridge, req);
        if let Err(e) = &result {
            debug!("{:?} failed: {}", kind, e);
        }
        result
    }

    fn set_phase(&self, phase: SessionPhase) {
        self.gate.lock().phase = phase;
    }

    /// Drain, commit and release. On `Busy` or a failed commit the session
    /// goes back to `Active` with nothing lost, so the caller may retry.
    fn shutdown(&self, timeout: Duration) -> Result<(), UnmountError> {
        let deadline = Instant::now() + timeout;
        {
            let mut gate = self.gate.lock();
            match gate.phase {
                SessionPhase::Released => return Err(UnmountError::NotMounted(self.target.clone())),
                SessionPhase::Draining => return Err(UnmountError::Busy),
                SessionPhase::Active => gate.phase = SessionPhase::Draining,
            }
            while gate.inflight > 0 {
                if self.idle.wait_until(&mut gate, deadline).timed_out() && gate.inflight > 0 {
                    warn!(
                        "unmount of {} timed out with {} calls in flight",
                        self.target, gate.inflight
                    );
                    gate.phase = SessionPhase::Active;
                    return Err(UnmountError::Busy);
                }
            }
        }

        let _span = self.log.span().enter();
        let sealed = self.bridge.seal_open_handles();
        if sealed > 0 {
            info!("sealed buffered writes of {} open handles", sealed);
        }
        let committed = self
            .bridge
            .sync()
            .flush_all(Some(deadline))
            .and_then(|_| self.bridge.sync().persist_until(Some(deadline)));
        match committed {
            Ok(()) => {}
            Err(FsError::Busy) => {
                self.set_phase(SessionPhase::Active);
                return Err(UnmountError::Busy);
            }
            Err(e) => {
                self.set_phase(SessionPhase::Active);
                return Err(UnmountError::Flush(e));
            }
        }

        let registration = self.registration.lock().take();
        if let Some(registration) = registration {
            if let Err(e) = registration.release() {
                warn!("OS unmount of {} reported: {}", self.target, e);
            }
        }
        self.set_phase(SessionPhase::Released);
        match serde_json::to_string(&self.status()) {
            Ok(json) => info!("unmounted: {}", json),
            Err(_) => info!("unmounted"),
        }
        Ok(())
    }
}

impl FilesystemCallbacks for MountSession {
    fn create(&self, path: &str, perm: u16, sid: u32) -> FsResult<(HandleId, Attr)> {
        match self.call(FsRequest::Create { path, perm, sid })? {
            FsReply::Created(fh, attr) => Ok((fh, attr)),
            other => Err(other.mismatch(OpKind::Create)),
        }
    }

    fn open(&self, path: &str, mode: OpenMode, sid: u32) -> FsResult<HandleId> {
        match self.call(FsRequest::Open { path, mode, sid })? {
            FsReply::Opened(fh) => Ok(fh),
            other => Err(other.mismatch(OpKind::Open)),
        }
    }

    fn read(&self, fh: HandleId, offset: u64, len: u32) -> FsResult<Vec<u8>> {
        match self.call(FsRequest::Read { fh, offset, len })? {
            FsReply::Data(data) => Ok(data),
            other => Err(other.mismatch(OpKind::Read)),
        }
    }

    fn write(&self, fh: HandleId, offset: u64, data: &[u8]) -> FsResult<usize> {
        match self.call(FsRequest::Write { fh, offset, data })? {
            FsReply::Written(n) => Ok(n),
            other => Err(other.mismatch(OpKind::Write)),
        }
    }

    fn flush(&self, fh: HandleId) -> FsResult<()> {
        match self.call(FsRequest::Flush { fh })? {
            FsReply::Done => Ok(()),
            other => Err(other.mismatch(OpKind::Flush)),
        }
    }

    fn close(&self, fh: HandleId) -> FsResult<()> {
        match self.call(FsRequest::Close { fh })? {
            FsReply::Done => Ok(()),
            other => Err(other.mismatch(OpKind::Close)),
        }
    }

    fn delete(&self, path: &str) -> FsResult<()> {
        match self.call(FsRequest::Delete { path })? {
            FsReply::Done => Ok(()),
            other => Err(other.mismatch(OpKind::Delete)),
        }
    }

    fn rename(&self, from: &str, to: &str) -> FsResult<()> {
        match self.call(FsRequest::Rename { from, to })? {
            FsReply::Done => Ok(()),
            other => Err(other.mismatch(OpKind::Rename)),
        }
    }

    fn getattr(&self, path: &str) -> FsResult<Attr> {
        match self.call(FsRequest::Getattr { path })? {
            FsReply::Attr(attr) => Ok(attr),
            other => Err(other.mismatch(OpKind::Getattr)),
        }
    }

    fn readdir(&self, path: &str) -> FsResult<Vec<DirEntry>> {
        match self.call(FsRequest::Readdir { path })? {
            FsReply::Entries(entries) => Ok(entries),
            other => Err(other.mismatch(OpKind::Readdir)),
        }
    }

    fn mkdir(&self, path: &str, perm: u16) -> FsResult<Attr> {
        match self.call(FsRequest::Mkdir { path, perm })? {
            FsReply::Attr(attr) => Ok(attr),
            other => Err(other.mismatch(OpKind::Mkdir)),
        }
    }

    fn rmdir(&self, path: &str) -> FsResult<()> {
        match self.call(FsRequest::Rmdir { path })? {
            FsReply::Done => Ok(()),
            other => Err(other.mismatch(OpKind::Rmdir)),
        }
    }

    fn setattr(&self, path: &str, changes: SetAttr) -> FsResult<Attr> {
        match self.call(FsRequest::Setattr { path, changes })? {
            FsReply::Attr(attr) => Ok(attr),
            other => Err(other.mismatch(OpKind::Setattr)),
        }
    }

    fn statfs(&self) -> FsResult<FsStats> {
        match self.call(FsRequest::Statfs)? {
            FsReply::Stats(stats) => Ok(stats),
            other => Err(other.mismatch(OpKind::Statfs)),
        }
    }
}

/// Owns every active mount of the process, keyed by canonical target.
pub struct MountManager {
    registrar: Box<dyn OsRegistrar>,
    sessions: DashMap<String, Arc<MountSession>>,
    /// Serializes mount and unmount so a target is never registered twice.
    lifecycle: Mutex<()>,
}

impl MountManager {
    pub fn new(registrar: impl OsRegistrar + 'static) -> Self {
        Self {
            registrar: Box::new(registrar),
            sessions: DashMap::new(),
            lifecycle: Mutex::new(()),
        }
    }

    pub fn mount(
        &self,
        target: &str,
        config: MountConfig,
        collab: Collaborators,
    ) -> Result<Arc<MountSession>, MountError> {
        let _lifecycle = self.lifecycle.lock();
        let target = self.registrar.validate(target)?;
        if self.sessions.contains_key(&target) {
            return Err(MountError::AlreadyMounted(target));
        }

        let policy = config.path_policy();
        let tree = match collab.meta.load_snapshot()? {
            Some(snapshot) => {
                let files = snapshot.file_count();
                let tree = MetadataTree::from_snapshot(policy, snapshot)?;
                info!("loaded snapshot for {}: {} entries, {} files", target, tree.len(), files);
                tree
            }
            None => {
                info!("no snapshot for {}; starting empty", target);
                MetadataTree::new(policy)
            }
        };

        let session = Arc::new(MountSession::new(target.clone(), config, tree, collab));
        let registration = self.registrar.register(&target, Arc::clone(&session))?;
        *session.registration.lock() = Some(registration);
        self.sessions.insert(target.clone(), Arc::clone(&session));
        info!("mounted {}", target);
        Ok(session)
    }

    /// Commit everything and release `target`. `Busy` leaves the mount
    /// active and is safe to retry.
    pub fn unmount(&self, target: &str, timeout: Duration) -> Result<(), UnmountError> {
        let _lifecycle = self.lifecycle.lock();
        let target = self
            .registrar
            .validate(target)
            .map_err(|_| UnmountError::NotMounted(target.to_string()))?;
        let session = self
            .sessions
            .get(&target)
            .map(|s| Arc::clone(s.value()))
            .ok_or_else(|| UnmountError::NotMounted(target.clone()))?;
        session.shutdown(timeout)?;
        self.sessions.remove(&target);
        Ok(())
    }

    pub fn session(&self, target: &str) -> Option<Arc<MountSession>> {
        let target = self.registrar.validate(target).ok()?;
        self.sessions.get(&target).map(|s| Arc::clone(s.value()))
    }

    pub fn targets(&self) -> Vec<String> {
        let mut targets: Vec<String> = self.sessions.iter().map(|s| s.key().clone()).collect();
        targets.sort();
        targets
    }
}
