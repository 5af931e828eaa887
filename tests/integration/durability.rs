use std::sync::Arc;
use std::time::Duration;

use chunkfs::error::{FsError, MountError, StoreError, UnmountError};
use chunkfs::fs::callbacks::FilesystemCallbacks;
use chunkfs::fs::handles::OpenMode;
use chunkfs::mount::{Collaborators, InProcessRegistrar, MountManager, SessionPhase};
use chunkfs::store::codec::{chunk_id, Sha256Codec};
use chunkfs::store::dir::{DirChunkStore, JsonMetadataStore};
use chunkfs::store::memory::{MemoryChunkStore, MemoryMetadataStore};
use chunkfs::store::{ChunkStore, MetadataStore};
use chunkfs::tree::manifest::ChunkId;

use crate::helpers::{read_file, test_config, write_file, Harness, TEST_CHUNK_SIZE};

fn file_manifest_size(meta: &MemoryMetadataStore, name: &str) -> Option<u64> {
    meta.latest()?
        .entries
        .into_iter()
        .find(|e| e.name == name)
        .and_then(|e| e.manifest)
        .map(|m| m.size)
}

#[test]
fn test_tree_survives_remount() {
    let h = Harness::new();
    let fs = h.fs();
    fs.mkdir("/projects", 0o750).unwrap();
    fs.mkdir("/projects/empty", 0o755).unwrap();
    write_file(&*fs, "/projects/notes.md", b"# notes\nremember the milk\n");
    write_file(&*fs, "/top", &vec![3u8; 100]);
    drop(fs);

    h.remount();
    let fs = h.fs();
    assert_eq!(
        read_file(&*fs, "/projects/notes.md"),
        b"# notes\nremember the milk\n"
    );
    assert_eq!(read_file(&*fs, "/top"), vec![3u8; 100]);
    assert_eq!(fs.getattr("/projects").unwrap().perm, 0o750);
    assert!(fs.readdir("/projects/empty").unwrap().is_empty());
}

#[test]
fn test_structural_changes_persist_at_unmount() {
    let h = Harness::new();
    let fs = h.fs();
    write_file(&*fs, "/a", b"content");
    let saves = h.meta.saves();

    fs.mkdir("/later", 0o755).unwrap();
    fs.rename("/a", "/later/a").unwrap();
    assert_eq!(h.meta.saves(), saves);
    drop(fs);

    h.remount();
    let fs = h.fs();
    assert_eq!(read_file(&*fs, "/later/a"), b"content");
    assert!(matches!(fs.getattr("/a"), Err(FsError::NotFound(_))));
}

#[test]
fn test_failed_upload_keeps_old_manifest_durable() {
    let h = Harness::new();
    let fs = h.fs();
    write_file(&*fs, "/doc", b"version one");
    assert_eq!(file_manifest_size(&h.meta, "doc"), Some(11));

    let fh = fs.open("/doc", OpenMode::Write, 0).unwrap();
    fs.write(fh, 0, b"version two, longer").unwrap();
    h.store.fail_next_puts(3);
    assert!(matches!(fs.close(fh), Err(FsError::NetworkUnavailable(_))));

    // The committed manifest and its durable snapshot are untouched.
    assert_eq!(file_manifest_size(&h.meta, "doc"), Some(11));
    assert_eq!(fs.bridge().tree().resolve("/doc").unwrap().size(), 11);
    // Readers see the queued writes on top of it.
    let reader = fs.open("/doc", OpenMode::Read, 0).unwrap();
    assert_eq!(fs.read(reader, 0, 100).unwrap(), b"version two, longer");
    fs.close(reader).unwrap();

    // The writes stay queued and go out with the final flush.
    assert_eq!(fs.bridge().sync().pending_entries().len(), 1);
    assert_eq!(fs.getattr("/doc").unwrap().size, 19);
    drop(fs);
    h.remount();
    assert_eq!(read_file(&*h.fs(), "/doc"), b"version two, longer");
}

#[test]
fn test_snapshot_save_failure_does_not_fail_the_commit() {
    let h = Harness::new();
    let fs = h.fs();
    h.meta.fail_next_saves(100);

    let (fh, _) = fs.create("/a", 0o644, 0).unwrap();
    fs.write(fh, 0, b"hello").unwrap();
    fs.close(fh).unwrap();
    assert_eq!(read_file(&*fs, "/a"), b"hello");
    assert!(fs.bridge().sync().pending_entries().is_empty());
    assert_eq!(h.meta.saves(), 0);

    // Unmount needs the snapshot on disk and stays mounted until it is.
    assert!(matches!(
        h.manager.unmount(&h.target, Duration::from_secs(1)),
        Err(UnmountError::Flush(FsError::Io(_)))
    ));
    assert_eq!(fs.phase(), SessionPhase::Active);
    h.meta.fail_next_saves(0);
    drop(fs);
    h.remount();
    assert_eq!(read_file(&*h.fs(), "/a"), b"hello");
}

#[test]
fn test_snapshot_save_retries_local_failures() {
    let h = Harness::new();
    let fs = h.fs();
    h.meta.fail_next_saves(2);
    write_file(&*fs, "/f", b"saved on the third try");
    assert_eq!(file_manifest_size(&h.meta, "f"), Some(22));
}

#[test]
fn test_upload_retries_transient_failures() {
    let h = Harness::new();
    let fs = h.fs();
    h.store.fail_next_puts(2);
    write_file(&*fs, "/f", b"made it");
    assert_eq!(read_file(&*fs, "/f"), b"made it");
    assert!(fs.bridge().sync().pending_entries().is_empty());
}

#[test]
fn test_read_fails_after_retry_budget() {
    let h = Harness::new();
    write_file(&*h.fs(), "/a.txt", b"remote bytes");
    h.remount();
    let fs = h.fs();

    let fh = fs.open("/a.txt", OpenMode::Read, 0).unwrap();
    h.store.fail_next_gets(3);
    let calls = h.store.get_calls();
    assert!(matches!(
        fs.read(fh, 0, 12),
        Err(FsError::NetworkUnavailable(_))
    ));
    assert_eq!(h.store.get_calls() - calls, 3);

    // The failure is not cached; the next read goes back to the store.
    assert_eq!(fs.read(fh, 0, 12).unwrap(), b"remote bytes");
    fs.close(fh).unwrap();
}

#[test]
fn test_read_recovers_within_retry_budget() {
    let h = Harness::new();
    write_file(&*h.fs(), "/a.txt", b"flaky");
    h.remount();
    let fs = h.fs();

    h.store.fail_next_gets(2);
    assert_eq!(read_file(&*fs, "/a.txt"), b"flaky");
}

#[test]
fn test_tampered_chunk_is_rejected() {
    let h = Harness::new();
    write_file(&*h.fs(), "/f", b"genuine");
    h.remount();
    let fs = h.fs();

    h.store.tamper(&chunk_id(b"genuine"), b"forgery".to_vec());
    let fh = fs.open("/f", OpenMode::Read, 0).unwrap();
    assert!(matches!(fs.read(fh, 0, 7), Err(FsError::Io(_))));
    fs.close(fh).unwrap();
}

#[test]
fn test_corrupt_manifest_makes_entry_read_only() {
    let h = Harness::new();
    write_file(&*h.fs(), "/bad", &vec![1u8; 40]);
    write_file(&*h.fs(), "/good", b"fine");
    h.unmount();

    let mut snapshot = h.meta.latest().unwrap();
    let bad = snapshot
        .entries
        .iter_mut()
        .find(|e| e.name == "bad")
        .unwrap();
    bad.manifest.as_mut().unwrap().size += 5;

    let h = Harness::with_stores(
        test_config(),
        Arc::clone(&h.store),
        Arc::new(MemoryMetadataStore::with_snapshot(snapshot)),
    );
    let fs = h.fs();

    assert!(fs.getattr("/bad").unwrap().read_only);
    assert!(matches!(
        fs.open("/bad", OpenMode::Write, 0),
        Err(FsError::PermissionDenied(_))
    ));
    assert!(matches!(fs.delete("/bad"), Err(FsError::PermissionDenied(_))));
    let fh = fs.open("/bad", OpenMode::Read, 0).unwrap();
    assert!(matches!(
        fs.read(fh, 0, 10),
        Err(FsError::CorruptManifest { .. })
    ));
    fs.close(fh).unwrap();

    // The rest of the tree is unaffected.
    assert_eq!(read_file(&*fs, "/good"), b"fine");
}

#[test]
fn test_broken_snapshot_fails_mount() {
    let h = Harness::new();
    write_file(&*h.fs(), "/f", b"x");
    h.unmount();

    let mut snapshot = h.meta.latest().unwrap();
    let file = snapshot.entries.iter_mut().find(|e| e.name == "f").unwrap();
    file.parent = Some(9999);

    let manager = MountManager::new(InProcessRegistrar::new());
    let collab = Collaborators {
        store: h.store.clone(),
        codec: Arc::new(Sha256Codec::new(TEST_CHUNK_SIZE)),
        meta: Arc::new(MemoryMetadataStore::with_snapshot(snapshot)),
    };
    assert!(matches!(
        manager.mount("/mnt/broken", test_config(), collab),
        Err(MountError::Metadata(StoreError::Corrupt(_)))
    ));
    assert!(manager.targets().is_empty());
}

#[test]
fn test_directory_backed_stores() {
    let dir = tempfile::tempdir().unwrap();
    let collab = || Collaborators {
        store: Arc::new(DirChunkStore::open(dir.path().join("chunks")).unwrap()),
        codec: Arc::new(Sha256Codec::new(TEST_CHUNK_SIZE)),
        meta: Arc::new(JsonMetadataStore::new(dir.path().join("metadata.json"))),
    };
    let manager = MountManager::new(InProcessRegistrar::new());
    let data: Vec<u8> = (0..=255u8).cycle().take(1000).collect();

    let fs = manager.mount("/mnt/disk", test_config(), collab()).unwrap();
    fs.mkdir("/d", 0o755).unwrap();
    write_file(&*fs, "/d/blob", &data);
    drop(fs);
    manager.unmount("/mnt/disk", Duration::from_secs(1)).unwrap();
    assert!(dir.path().join("metadata.json").exists());

    let fs = manager.mount("/mnt/disk", test_config(), collab()).unwrap();
    assert_eq!(read_file(&*fs, "/d/blob"), data);
}

#[test]
fn test_dir_chunk_store_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let store = DirChunkStore::open(dir.path()).unwrap();
    let id = chunk_id(b"payload");

    assert!(matches!(store.get(&id), Err(StoreError::NotFound(_))));
    store.put(&id, b"payload").unwrap();
    store.put(&id, b"payload").unwrap();
    assert_eq!(store.get(&id).unwrap(), b"payload");
    store.delete(&id).unwrap();
    store.delete(&id).unwrap();
    assert!(matches!(store.get(&id), Err(StoreError::NotFound(_))));

    let bad = ChunkId::new("../../etc/passwd");
    assert!(matches!(store.put(&bad, b"x"), Err(StoreError::Corrupt(_))));
}

#[test]
fn test_json_snapshot_detects_tampering() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("metadata.json");
    let meta = JsonMetadataStore::new(&path);
    assert!(meta.load_snapshot().unwrap().is_none());

    let h = Harness::new();
    write_file(&*h.fs(), "/f", b"x");
    let snapshot = h.meta.latest().unwrap();
    meta.save_snapshot(&snapshot).unwrap();
    assert_eq!(meta.load_snapshot().unwrap(), Some(snapshot));

    let raw = std::fs::read_to_string(&path).unwrap();
    std::fs::write(&path, raw.replace("\"f\"", "\"g\"")).unwrap();
    assert!(matches!(meta.load_snapshot(), Err(StoreError::Corrupt(_))));
}

#[test]
fn test_memory_store_counts_calls() {
    let store = MemoryChunkStore::new();
    let id = chunk_id(b"abc");
    store.put(&id, b"abc").unwrap();
    store.fail_next_gets(1);
    assert!(matches!(store.get(&id), Err(StoreError::Unavailable(_))));
    assert_eq!(store.get(&id).unwrap(), b"abc");
    assert_eq!(store.get_calls(), 2);
    assert_eq!(store.put_calls(), 1);
    assert_eq!(store.len(), 1);
}
