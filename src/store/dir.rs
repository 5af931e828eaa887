use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{ChunkStore, MetadataStore};
use crate::error::StoreError;
use crate::tree::manifest::ChunkId;
use crate::tree::snapshot::TreeSnapshot;

/// Suffix counter so concurrent writers never share a temp file.
static TEMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// Write `data` to `path` so that readers see either the old file or the
/// complete new one, and the new one survives a crash once this returns.
fn write_atomic(path: &Path, data: &[u8]) -> io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)?;
    let tmp = dir.join(format!(
        ".tmp-{}-{}",
        std::process::id(),
        TEMP_SEQ.fetch_add(1, Ordering::Relaxed)
    ));
    let result = (|| {
        let mut f = File::create(&tmp)?;
        f.write_all(data)?;
        f.sync_all()?;
        fs::rename(&tmp, path)?;
        File::open(dir)?.sync_all()
    })();
    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

/// Chunk store backed by a local directory, one file per chunk under a
/// two-character fan-out (`chunks/ab/abcd...`).
#[derive(Debug, Clone)]
pub struct DirChunkStore {
    root: PathBuf,
}

impl DirChunkStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        info!("chunk store at {}", root.display());
        Ok(Self { root })
    }

    fn chunk_path(&self, id: &ChunkId) -> Result<PathBuf, StoreError> {
        let s = id.as_str();
        if s.len() < 3 || !s.bytes().all(|b| b.is_ascii_alphanumeric()) {
            return Err(StoreError::Corrupt(format!("malformed chunk id {:?}", s)));
        }
        Ok(self.root.join(&s[..2]).join(s))
    }
}

impl ChunkStore for DirChunkStore {
    fn get(&self, id: &ChunkId) -> Result<Vec<u8>, StoreError> {
        let path = self.chunk_path(id)?;
        match fs::read(&path) {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(StoreError::NotFound(id.clone())),
            Err(e) => Err(StoreError::Unavailable(format!("{}: {}", path.display(), e))),
        }
    }

    fn put(&self, id: &ChunkId, data: &[u8]) -> Result<(), StoreError> {
        let path = self.chunk_path(id)?;
        if path.exists() {
            // Same id, same bytes.
            return Ok(());
        }
        write_atomic(&path, data)
            .map_err(|e| StoreError::Unavailable(format!("{}: {}", path.display(), e)))?;
        debug!("stored chunk {} ({} bytes)", id, data.len());
        Ok(())
    }

    fn delete(&self, id: &ChunkId) -> Result<(), StoreError> {
        let path = self.chunk_path(id)?;
        match fs::remove_file(&path) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }
}

#[derive(Serialize, Deserialize)]
struct SnapshotEnvelope {
    format: u32,
    saved_at: String,
    /// xxh3-64 of the serialized tree, hex.
    checksum: String,
    tree: TreeSnapshot,
}

const SNAPSHOT_FORMAT: u32 = 1;

/// Metadata snapshot stored as a checksummed JSON file, replaced atomically.
#[derive(Debug, Clone)]
pub struct JsonMetadataStore {
    path: PathBuf,
}

impl JsonMetadataStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn checksum(tree: &TreeSnapshot) -> Result<String, StoreError> {
        let body = serde_json::to_vec(tree).map_err(|e| StoreError::Io(e.to_string()))?;
        Ok(format!("{:016x}", xxhash_rust::xxh3::xxh3_64(&body)))
    }
}

impl MetadataStore for JsonMetadataStore {
    fn load_snapshot(&self) -> Result<Option<TreeSnapshot>, StoreError> {
        let raw = match fs::read(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let envelope: SnapshotEnvelope = serde_json::from_slice(&raw)
            .map_err(|e| StoreError::Corrupt(format!("{}: {}", self.path.display(), e)))?;
        if envelope.format != SNAPSHOT_FORMAT {
            return Err(StoreError::Corrupt(format!(
                "unsupported snapshot format {}",
                envelope.format
            )));
        }
        let actual = Self::checksum(&envelope.tree)?;
        if actual != envelope.checksum {
            return Err(StoreError::Corrupt(format!(
                "snapshot checksum mismatch: expected {}, found {}",
                envelope.checksum, actual
            )));
        }
        debug!(
            "loaded snapshot saved at {} ({} entries)",
            envelope.saved_at,
            envelope.tree.entries.len()
        );
        Ok(Some(envelope.tree))
    }

    fn save_snapshot(&self, snapshot: &TreeSnapshot) -> Result<(), StoreError> {
        let envelope = SnapshotEnvelope {
            format: SNAPSHOT_FORMAT,
            saved_at: chrono::Utc::now().to_rfc3339(),
            checksum: Self::checksum(snapshot)?,
            tree: snapshot.clone(),
        };
        let raw = serde_json::to_vec_pretty(&envelope).map_err(|e| StoreError::Io(e.to_string()))?;
        write_atomic(&self.path, &raw)?;
        Ok(())
    }
}
