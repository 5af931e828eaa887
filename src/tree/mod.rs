//! In-memory namespace: directories, files and their current manifests.
//!
//! Structure (names, parents, children) lives behind one tree-wide
//! `RwLock`: lookups and traversal share it, create/rename/remove take it
//! exclusively. File content is reached through each `Entry`'s manifest
//! pointer, which is swapped on its own without touching the tree lock.

pub mod manifest;
pub mod path;
pub mod snapshot;

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::{Mutex, MutexGuard, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use self::manifest::Manifest;
use self::path::PathPolicy;
use self::snapshot::{SnapshotEntry, TreeSnapshot};
use crate::error::{FsError, FsResult, StoreError};

pub type EntryId = u64;

/// Id of the root directory. Matches the FUSE root inode.
pub const ROOT_ID: EntryId = 1;

pub const DEFAULT_FILE_PERM: u16 = 0o644;
pub const DEFAULT_DIR_PERM: u16 = 0o755;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntryKind {
    File,
    Directory,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryMeta {
    pub perm: u16,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
    pub crtime: SystemTime,
}

impl EntryMeta {
    pub fn new(perm: u16) -> Self {
        let now = SystemTime::now();
        Self {
            perm,
            atime: now,
            mtime: now,
            ctime: now,
            crtime: now,
        }
    }
}

/// A file or directory node. Shared by the tree and by every open handle on
/// it, so an unlinked file stays readable until its handles close.
#[derive(Debug)]
pub struct Entry {
    id: EntryId,
    kind: EntryKind,
    meta: Mutex<EntryMeta>,
    manifest: RwLock<Arc<Manifest>>,
    /// Set when the manifest failed validation; the entry is read-only until
    /// repaired outside the filesystem.
    corruption: RwLock<Option<String>>,
    /// Serializes commits to this entry's manifest.
    commit_lock: Mutex<()>,
}

pub type EntryRef = Arc<Entry>;

impl Entry {
    fn new(id: EntryId, kind: EntryKind, meta: EntryMeta, manifest: Manifest) -> Self {
        Self {
            id,
            kind,
            meta: Mutex::new(meta),
            manifest: RwLock::new(Arc::new(manifest)),
            corruption: RwLock::new(None),
            commit_lock: Mutex::new(()),
        }
    }

    pub fn id(&self) -> EntryId {
        self.id
    }

    pub fn kind(&self) -> EntryKind {
        self.kind
    }

    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }

    /// The current manifest. Readers hold on to the returned version for the
    /// whole call, so a concurrent swap never mixes two versions.
    pub fn manifest(&self) -> Arc<Manifest> {
        Arc::clone(&self.manifest.read())
    }

    /// Atomically replace the manifest, returning the previous one.
    pub fn install_manifest(&self, manifest: Manifest) -> Arc<Manifest> {
        let new = Arc::new(manifest);
        let old = std::mem::replace(&mut *self.manifest.write(), new);
        let mut meta = self.meta.lock();
        let now = SystemTime::now();
        meta.mtime = now;
        meta.ctime = now;
        old
    }

    pub fn size(&self) -> u64 {
        self.manifest.read().size
    }

    pub fn meta(&self) -> EntryMeta {
        self.meta.lock().clone()
    }

    pub fn update_meta(&self, f: impl FnOnce(&mut EntryMeta)) {
        f(&mut self.meta.lock());
    }

    pub fn touch_accessed(&self) {
        self.meta.lock().atime = SystemTime::now();
    }

    fn touch_changed(&self) {
        let now = SystemTime::now();
        let mut meta = self.meta.lock();
        meta.mtime = now;
        meta.ctime = now;
    }

    pub fn is_read_only(&self) -> bool {
        self.corruption.read().is_some()
    }

    pub fn corruption(&self) -> Option<String> {
        self.corruption.read().clone()
    }

    pub fn mark_corrupt(&self, reason: impl Into<String>) {
        let reason = reason.into();
        warn!("entry {} marked read-only: {}", self.id, reason);
        *self.corruption.write() = Some(reason);
    }

    pub fn lock_commit(&self) -> MutexGuard<'_, ()> {
        self.commit_lock.lock()
    }
}

#[derive(Debug)]
struct Node {
    name: String,
    parent: Option<EntryId>,
    /// Normalized key -> child id. Empty for files.
    children: BTreeMap<String, EntryId>,
    entry: EntryRef,
}

#[derive(Debug)]
struct TreeInner {
    nodes: HashMap<EntryId, Node>,
    next_id: EntryId,
}

impl TreeInner {
    fn walk(&self, policy: &PathPolicy, components: &[String]) -> FsResult<EntryId> {
        let mut current = ROOT_ID;
        for (depth, name) in components.iter().enumerate() {
            let node = self
                .nodes
                .get(&current)
                .ok_or_else(|| FsError::NotFound(PathPolicy::join(&components[..depth])))?;
            if !node.entry.is_dir() {
                return Err(FsError::NotADirectory(PathPolicy::join(&components[..depth])));
            }
            current = *node
                .children
                .get(&policy.key(name))
                .ok_or_else(|| FsError::NotFound(PathPolicy::join(&components[..=depth])))?;
        }
        Ok(current)
    }

    fn node(&self, id: EntryId) -> FsResult<&Node> {
        self.nodes
            .get(&id)
            .ok_or_else(|| FsError::NotFound(format!("entry {}", id)))
    }

    fn is_ancestor(&self, ancestor: EntryId, mut id: EntryId) -> bool {
        loop {
            if id == ancestor {
                return true;
            }
            match self.nodes.get(&id).and_then(|n| n.parent) {
                Some(p) => id = p,
                None => return false,
            }
        }
    }

    fn path_of(&self, id: EntryId) -> Option<String> {
        let mut names = Vec::new();
        let mut current = id;
        while current != ROOT_ID {
            let node = self.nodes.get(&current)?;
            names.push(node.name.clone());
            current = node.parent?;
        }
        names.reverse();
        Some(PathPolicy::join(&names))
    }
}

/// Hierarchical namespace mapping paths to entries.
#[derive(Debug)]
pub struct MetadataTree {
    policy: PathPolicy,
    inner: RwLock<TreeInner>,
}

/// One item produced by [`ReadDir`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirListing {
    pub id: EntryId,
    pub name: String,
    pub kind: EntryKind,
}

impl MetadataTree {
    pub fn new(policy: PathPolicy) -> Self {
        let root = Node {
            name: String::new(),
            parent: None,
            children: BTreeMap::new(),
            entry: Arc::new(Entry::new(
                ROOT_ID,
                EntryKind::Directory,
                EntryMeta::new(DEFAULT_DIR_PERM),
                Manifest::empty(),
            )),
        };
        let mut nodes = HashMap::new();
        nodes.insert(ROOT_ID, root);
        Self {
            policy,
            inner: RwLock::new(TreeInner {
                nodes,
                next_id: ROOT_ID + 1,
            }),
        }
    }

    pub fn policy(&self) -> &PathPolicy {
        &self.policy
    }

    /// Number of entries including the root.
    pub fn len(&self) -> usize {
        self.inner.read().nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn lookup(&self, path: &str) -> Option<EntryRef> {
        self.resolve(path).ok()
    }

    /// Like [`lookup`](Self::lookup) but says why resolution failed.
    pub fn resolve(&self, path: &str) -> FsResult<EntryRef> {
        let components = self.policy.components(path);
        let inner = self.inner.read();
        let id = inner.walk(&self.policy, &components)?;
        Ok(Arc::clone(&inner.node(id)?.entry))
    }

    pub fn get(&self, id: EntryId) -> Option<EntryRef> {
        self.inner.read().nodes.get(&id).map(|n| Arc::clone(&n.entry))
    }

    /// Absolute path of an entry, if it is still linked into the tree.
    pub fn path_of(&self, id: EntryId) -> Option<String> {
        self.inner.read().path_of(id)
    }

    pub fn create(
        &self,
        parent_path: &str,
        name: &str,
        kind: EntryKind,
        perm: u16,
    ) -> FsResult<EntryRef> {
        self.policy.validate_name(name)?;
        let parent_components = self.policy.components(parent_path);
        let key = self.policy.key(name);

        let mut inner = self.inner.write();
        let parent_id = inner.walk(&self.policy, &parent_components)?;
        let parent = inner.node(parent_id)?;
        if !parent.entry.is_dir() {
            return Err(FsError::NotADirectory(PathPolicy::join(&parent_components)));
        }
        if parent.children.contains_key(&key) {
            let mut full = parent_components.clone();
            full.push(name.to_string());
            return Err(FsError::AlreadyExists(PathPolicy::join(&full)));
        }
        let parent_entry = Arc::clone(&parent.entry);

        let id = inner.next_id;
        inner.next_id += 1;
        let entry = Arc::new(Entry::new(id, kind, EntryMeta::new(perm), Manifest::empty()));
        inner.nodes.insert(
            id,
            Node {
                name: name.to_string(),
                parent: Some(parent_id),
                children: BTreeMap::new(),
                entry: Arc::clone(&entry),
            },
        );
        if let Some(p) = inner.nodes.get_mut(&parent_id) {
            p.children.insert(key, id);
        }
        parent_entry.touch_changed();
        debug!("created {:?} {} as entry {}", kind, name, id);
        Ok(entry)
    }

    /// Create at a full path.
    pub fn create_path(&self, path: &str, kind: EntryKind, perm: u16) -> FsResult<EntryRef> {
        let (parent, name) = self.policy.split_parent(path)?;
        self.create(&PathPolicy::join(&parent), &name, kind, perm)
    }

    /// Move `old_path` to `new_path`, replacing a compatible target. All
    /// checks run before anything changes, so a failed rename leaves the tree
    /// untouched. Manifests are never touched.
    pub fn rename(&self, old_path: &str, new_path: &str) -> FsResult<()> {
        let old_components = self.policy.components(old_path);
        let (new_parent_components, new_name) = self.policy.split_parent(new_path)?;
        if old_components.is_empty() {
            return Err(FsError::InvalidArgument("cannot rename the root".to_string()));
        }
        self.policy.validate_name(&new_name)?;
        let new_key = self.policy.key(&new_name);

        let mut inner = self.inner.write();
        let src_id = inner.walk(&self.policy, &old_components)?;
        let new_parent_id = inner.walk(&self.policy, &new_parent_components)?;
        let new_parent = inner.node(new_parent_id)?;
        if !new_parent.entry.is_dir() {
            return Err(FsError::NotADirectory(PathPolicy::join(&new_parent_components)));
        }
        let src = inner.node(src_id)?;
        if src.entry.is_read_only() {
            return Err(FsError::PermissionDenied(PathPolicy::join(&old_components)));
        }
        if src.entry.is_dir() && inner.is_ancestor(src_id, new_parent_id) {
            return Err(FsError::InvalidArgument(format!(
                "cannot move {} inside itself",
                PathPolicy::join(&old_components)
            )));
        }
        let src_is_dir = src.entry.is_dir();
        let old_parent_id = src.parent.unwrap_or(ROOT_ID);
        let old_key = self.policy.key(&src.name);

        let target_id = new_parent.children.get(&new_key).copied();
        let replaced = match target_id {
            Some(t) if t == src_id => None,
            Some(t) => {
                let target = inner.node(t)?;
                match (src_is_dir, target.entry.is_dir()) {
                    (false, true) => return Err(FsError::IsADirectory(new_path.to_string())),
                    (true, false) => return Err(FsError::NotADirectory(new_path.to_string())),
                    (true, true) if !target.children.is_empty() => {
                        return Err(FsError::NotEmpty(new_path.to_string()))
                    }
                    _ => {}
                }
                if target.entry.is_read_only() {
                    return Err(FsError::PermissionDenied(new_path.to_string()));
                }
                Some(t)
            }
            None => None,
        };

        // Checks done: mutate.
        if let Some(t) = replaced {
            inner.nodes.remove(&t);
        }
        if let Some(p) = inner.nodes.get_mut(&old_parent_id) {
            p.children.remove(&old_key);
        }
        if let Some(p) = inner.nodes.get_mut(&new_parent_id) {
            p.children.insert(new_key, src_id);
        }
        if let Some(n) = inner.nodes.get_mut(&src_id) {
            n.name = new_name;
            n.parent = Some(new_parent_id);
            n.entry.meta.lock().ctime = SystemTime::now();
        }
        for id in [old_parent_id, new_parent_id] {
            if let Some(p) = inner.nodes.get(&id) {
                p.entry.touch_changed();
            }
        }
        debug!("renamed {} -> {}", old_path, new_path);
        Ok(())
    }

    /// Unlink the entry at `path`, which must be of `kind`. Directories must
    /// be empty. Returns the removed entry; open handles keep it alive.
    pub fn remove(&self, path: &str, kind: EntryKind) -> FsResult<EntryRef> {
        let components = self.policy.components(path);
        if components.is_empty() {
            return Err(FsError::PermissionDenied("cannot remove the root".to_string()));
        }
        let mut inner = self.inner.write();
        let id = inner.walk(&self.policy, &components)?;
        let node = inner.node(id)?;
        match (kind, node.entry.kind()) {
            (EntryKind::File, EntryKind::Directory) => {
                return Err(FsError::IsADirectory(path.to_string()))
            }
            (EntryKind::Directory, EntryKind::File) => {
                return Err(FsError::NotADirectory(path.to_string()))
            }
            _ => {}
        }
        if !node.children.is_empty() {
            return Err(FsError::NotEmpty(path.to_string()));
        }
        if node.entry.is_read_only() {
            return Err(FsError::PermissionDenied(path.to_string()));
        }
        let key = self.policy.key(&node.name);
        let parent_id = node.parent.unwrap_or(ROOT_ID);

        let removed = inner
            .nodes
            .remove(&id)
            .map(|n| n.entry)
            .ok_or_else(|| FsError::NotFound(path.to_string()))?;
        if let Some(p) = inner.nodes.get_mut(&parent_id) {
            p.children.remove(&key);
            p.entry.touch_changed();
        }
        debug!("removed {} (entry {})", path, id);
        Ok(removed)
    }

    /// Lazily list a directory. Each step re-reads the current state, so the
    /// listing reflects entries present when they are reached.
    pub fn readdir(self: &Arc<Self>, path: &str) -> FsResult<ReadDir> {
        let dir = self.resolve(path)?;
        if !dir.is_dir() {
            return Err(FsError::NotADirectory(path.to_string()));
        }
        Ok(ReadDir {
            tree: Arc::clone(self),
            dir: dir.id(),
            cursor: None,
        })
    }

    /// Every file entry currently linked into the tree.
    pub fn files(&self) -> Vec<EntryRef> {
        self.inner
            .read()
            .nodes
            .values()
            .filter(|n| !n.entry.is_dir())
            .map(|n| Arc::clone(&n.entry))
            .collect()
    }

    pub fn snapshot(&self) -> TreeSnapshot {
        let inner = self.inner.read();
        let mut entries: Vec<SnapshotEntry> = inner
            .nodes
            .iter()
            .map(|(id, n)| SnapshotEntry {
                id: *id,
                parent: n.parent,
                name: n.name.clone(),
                kind: n.entry.kind(),
                meta: n.entry.meta(),
                manifest: (!n.entry.is_dir()).then(|| (*n.entry.manifest()).clone()),
            })
            .collect();
        entries.sort_by_key(|e| e.id);
        TreeSnapshot {
            next_id: inner.next_id,
            entries,
        }
    }

    /// Rebuild a tree from a durable snapshot. Structural damage (dangling
    /// parents, duplicate names) fails the load; a bad manifest only marks
    /// its entry read-only.
    pub fn from_snapshot(policy: PathPolicy, snapshot: TreeSnapshot) -> Result<Self, StoreError> {
        let mut nodes: HashMap<EntryId, Node> = HashMap::new();
        let mut corrupt = Vec::new();
        for e in &snapshot.entries {
            if e.id >= snapshot.next_id {
                return Err(StoreError::Corrupt(format!(
                    "entry id {} not below next_id {}",
                    e.id, snapshot.next_id
                )));
            }
            let manifest = e.manifest.clone().unwrap_or_default();
            if e.kind == EntryKind::File {
                if let Err(reason) = manifest.validate() {
                    corrupt.push((e.id, reason));
                }
            }
            let entry = Arc::new(Entry::new(e.id, e.kind, e.meta.clone(), manifest));
            let node = Node {
                name: e.name.clone(),
                parent: e.parent,
                children: BTreeMap::new(),
                entry,
            };
            if nodes.insert(e.id, node).is_some() {
                return Err(StoreError::Corrupt(format!("duplicate entry id {}", e.id)));
            }
        }
        match nodes.get(&ROOT_ID) {
            Some(root) if root.entry.is_dir() && root.parent.is_none() => {}
            _ => return Err(StoreError::Corrupt("snapshot has no root directory".to_string())),
        }

        for e in &snapshot.entries {
            let Some(parent_id) = e.parent else {
                if e.id != ROOT_ID {
                    return Err(StoreError::Corrupt(format!("entry {} has no parent", e.id)));
                }
                continue;
            };
            let key = policy.key(&e.name);
            let parent = nodes
                .get_mut(&parent_id)
                .filter(|p| p.entry.is_dir())
                .ok_or_else(|| {
                    StoreError::Corrupt(format!("entry {} has invalid parent {}", e.id, parent_id))
                })?;
            if parent.children.insert(key, e.id).is_some() {
                return Err(StoreError::Corrupt(format!(
                    "duplicate name {:?} in directory {}",
                    e.name, parent_id
                )));
            }
        }

        let inner = TreeInner {
            nodes,
            next_id: snapshot.next_id,
        };
        // Every entry must be reachable from the root.
        for id in inner.nodes.keys() {
            if !inner.is_ancestor(ROOT_ID, *id) {
                return Err(StoreError::Corrupt(format!("entry {} is detached from the root", id)));
            }
        }
        for (id, reason) in corrupt {
            if let Some(n) = inner.nodes.get(&id) {
                n.entry.mark_corrupt(reason);
            }
        }
        Ok(Self {
            policy,
            inner: RwLock::new(inner),
        })
    }
}

/// Lazy, restartable directory listing.
#[derive(Debug)]
pub struct ReadDir {
    tree: Arc<MetadataTree>,
    dir: EntryId,
    cursor: Option<String>,
}

impl ReadDir {
    /// Start over from the first child.
    pub fn rewind(&mut self) {
        self.cursor = None;
    }
}

impl Iterator for ReadDir {
    type Item = DirListing;

    fn next(&mut self) -> Option<DirListing> {
        let inner = self.tree.inner.read();
        let dir = inner.nodes.get(&self.dir)?;
        let lower = match &self.cursor {
            Some(key) => Bound::Excluded(key.clone()),
            None => Bound::Unbounded,
        };
        let (key, id) = dir
            .children
            .range::<String, _>((lower, Bound::Unbounded))
            .next()?;
        let child = inner.nodes.get(id)?;
        self.cursor = Some(key.clone());
        Some(DirListing {
            id: *id,
            name: child.name.clone(),
            kind: child.entry.kind(),
        })
    }
}
