use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chunkfs::config::MountConfig;
use chunkfs::fs::callbacks::FilesystemCallbacks;
use chunkfs::fs::handles::{HandleId, OpenMode};
use chunkfs::mount::{Collaborators, InProcessRegistrar, MountManager, MountSession};
use chunkfs::store::codec::Sha256Codec;
use chunkfs::store::memory::{MemoryChunkStore, MemoryMetadataStore};
use chunkfs::store::RetryPolicy;

/// Chunk size used by in-process mounts: small enough that short test files
/// span several chunks.
pub const TEST_CHUNK_SIZE: u64 = 16;

/// An in-process mount over in-memory collaborators. The stores outlive
/// `remount`, so a second session sees what the first one committed.
pub struct Harness {
    pub manager: MountManager,
    pub store: Arc<MemoryChunkStore>,
    pub meta: Arc<MemoryMetadataStore>,
    pub config: MountConfig,
    pub target: String,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: MountConfig) -> Self {
        Self::with_stores(
            config,
            Arc::new(MemoryChunkStore::new()),
            Arc::new(MemoryMetadataStore::new()),
        )
    }

    pub fn with_stores(
        config: MountConfig,
        store: Arc<MemoryChunkStore>,
        meta: Arc<MemoryMetadataStore>,
    ) -> Self {
        let harness = Harness {
            manager: MountManager::new(InProcessRegistrar::new()),
            store,
            meta,
            config,
            target: "/mnt/test".to_string(),
        };
        harness
            .manager
            .mount(&harness.target, harness.config.clone(), harness.collaborators())
            .expect("mount");
        harness
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            store: self.store.clone(),
            codec: Arc::new(Sha256Codec::new(self.config.chunk_size)),
            meta: self.meta.clone(),
        }
    }

    pub fn fs(&self) -> Arc<MountSession> {
        self.manager.session(&self.target).expect("session mounted")
    }

    pub fn unmount(&self) {
        self.manager
            .unmount(&self.target, Duration::from_secs(1))
            .expect("unmount");
    }

    /// Unmount and mount again on the same stores, starting with a cold cache.
    pub fn remount(&self) {
        self.unmount();
        self.manager
            .mount(&self.target, self.config.clone(), self.collaborators())
            .expect("remount");
    }
}

pub fn test_config() -> MountConfig {
    MountConfig {
        session_id: "test".to_string(),
        chunk_size: TEST_CHUNK_SIZE,
        cache_budget_bytes: 1024 * 1024,
        retry: RetryPolicy::immediate(3),
        flush_timeout: Duration::from_secs(1),
        ..MountConfig::default()
    }
}

/// Create (or replace the content of) `path` and close it.
pub fn write_file(fs: &impl FilesystemCallbacks, path: &str, data: &[u8]) {
    let fh = match fs.open(path, OpenMode::ReadWrite, 0) {
        Ok(fh) => {
            fs.setattr(
                path,
                chunkfs::fs::callbacks::SetAttr {
                    size: Some(0),
                    ..Default::default()
                },
            )
            .expect("truncate");
            fh
        }
        Err(_) => fs.create(path, 0o644, 0).expect("create").0,
    };
    assert_eq!(fs.write(fh, 0, data).expect("write"), data.len());
    fs.close(fh).expect("close");
}

/// Whole content of `path` through a fresh read handle.
pub fn read_file(fs: &impl FilesystemCallbacks, path: &str) -> Vec<u8> {
    let size = fs.getattr(path).expect("getattr").size;
    let fh = fs.open(path, OpenMode::Read, 0).expect("open");
    let data = read_handle(fs, fh, 0, size);
    fs.close(fh).expect("close");
    data
}

pub fn read_handle(fs: &impl FilesystemCallbacks, fh: HandleId, offset: u64, len: u64) -> Vec<u8> {
    let mut out = Vec::new();
    let mut at = offset;
    while (at - offset) < len {
        let want = (len - (at - offset)).min(64 * 1024) as u32;
        let chunk = fs.read(fh, at, want).expect("read");
        if chunk.is_empty() {
            break;
        }
        at += chunk.len() as u64;
        out.extend_from_slice(&chunk);
    }
    out
}

pub fn chunkfs_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_chunkfs"))
}

/// Wait until `mount_path` is served by a FUSE mount.
pub fn wait_for_mount(mount_path: &Path) -> bool {
    for _ in 0..50 {
        if is_mounted(mount_path) {
            return true;
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    false
}

pub fn is_mounted(mount_path: &Path) -> bool {
    let output = match std::process::Command::new("mount").output() {
        Ok(o) => o,
        Err(_) => return false,
    };
    let stdout = String::from_utf8_lossy(&output.stdout);
    let path = mount_path.to_string_lossy();
    stdout
        .lines()
        .any(|line| line.contains(path.as_ref()) && line.contains("chunkfs"))
}
