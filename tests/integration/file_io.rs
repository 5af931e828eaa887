use chunkfs::config::MountConfig;
use chunkfs::error::FsError;
use chunkfs::fs::callbacks::{FilesystemCallbacks, SetAttr};
use chunkfs::fs::handles::OpenMode;
use rand::{Rng, SeedableRng};

use crate::helpers::{read_file, read_handle, test_config, write_file, Harness, TEST_CHUNK_SIZE};

#[test]
fn test_write_close_reopen_read() {
    let h = Harness::new();
    let fs = h.fs();

    let (fh, attr) = fs.create("/a.txt", 0o644, 0).unwrap();
    assert_eq!(attr.size, 0);
    assert_eq!(fs.write(fh, 0, b"hello").unwrap(), 5);
    fs.close(fh).unwrap();

    let fh = fs.open("/a.txt", OpenMode::Read, 0).unwrap();
    assert_eq!(fs.read(fh, 0, 5).unwrap(), b"hello");
    fs.close(fh).unwrap();
}

#[test]
fn test_two_handles_commit_disjoint_writes() {
    let h = Harness::new();
    let fs = h.fs();
    let (fh, _) = fs.create("/a.txt", 0o644, 0).unwrap();
    fs.close(fh).unwrap();

    let h1 = fs.open("/a.txt", OpenMode::ReadWrite, 1).unwrap();
    let h2 = fs.open("/a.txt", OpenMode::ReadWrite, 2).unwrap();
    fs.write(h1, 0, b"AAAAA").unwrap();
    fs.write(h2, 10, b"BBBBB").unwrap();
    fs.close(h1).unwrap();
    fs.close(h2).unwrap();

    let mut expected = b"AAAAA".to_vec();
    expected.extend_from_slice(&[0u8; 5]);
    expected.extend_from_slice(b"BBBBB");
    assert_eq!(read_file(&*fs, "/a.txt"), expected);
}

#[test]
fn test_overlapping_writes_commit_in_close_order() {
    let h = Harness::new();
    let fs = h.fs();
    write_file(&*fs, "/f", b"..........");

    let first = fs.open("/f", OpenMode::Write, 1).unwrap();
    let second = fs.open("/f", OpenMode::Write, 2).unwrap();
    fs.write(second, 2, b"2222").unwrap();
    fs.write(first, 0, b"111111").unwrap();
    // `second` is sealed first, so `first` lands on top of it.
    fs.close(second).unwrap();
    fs.close(first).unwrap();

    assert_eq!(read_file(&*fs, "/f"), b"111111....");
}

#[test]
fn test_rename_keeps_content() {
    let h = Harness::new();
    let fs = h.fs();
    write_file(&*fs, "/a.txt", b"prior content");

    fs.rename("/a.txt", "/b.txt").unwrap();

    assert_eq!(read_file(&*fs, "/b.txt"), b"prior content");
    assert!(matches!(fs.getattr("/a.txt"), Err(FsError::NotFound(_))));
    assert!(matches!(
        fs.open("/a.txt", OpenMode::Read, 0),
        Err(FsError::NotFound(_))
    ));
}

#[test]
fn test_round_trip_random_content() {
    let h = Harness::new();
    let fs = h.fs();
    let mut rng = rand::rngs::StdRng::seed_from_u64(7);

    for len in [0usize, 1, 15, 16, 17, 100, 1000] {
        let data: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
        let path = format!("/rand-{}", len);
        write_file(&*fs, &path, &data);
        assert_eq!(fs.getattr(&path).unwrap().size, len as u64);
        assert_eq!(read_file(&*fs, &path), data, "length {}", len);
    }

    h.remount();
    let fs = h.fs();
    let mut rng = rand::rngs::StdRng::seed_from_u64(7);
    for len in [0usize, 1, 15, 16, 17, 100, 1000] {
        let data: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
        assert_eq!(read_file(&*fs, &format!("/rand-{}", len)), data);
    }
}

#[test]
fn test_random_overwrites_match_model() {
    let h = Harness::new();
    let fs = h.fs();
    let mut rng = rand::rngs::StdRng::seed_from_u64(42);
    let mut model: Vec<u8> = Vec::new();
    write_file(&*fs, "/model", &model);

    for round in 0..20 {
        let fh = fs.open("/model", OpenMode::ReadWrite, 0).unwrap();
        for _ in 0..rng.gen_range(1..4) {
            let offset = rng.gen_range(0..200u64);
            let len = rng.gen_range(1..40usize);
            let data: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
            fs.write(fh, offset, &data).unwrap();
            let end = offset as usize + len;
            if model.len() < end {
                model.resize(end, 0);
            }
            model[offset as usize..end].copy_from_slice(&data);
        }
        if round % 3 == 0 {
            fs.flush(fh).unwrap();
        }
        fs.close(fh).unwrap();
        assert_eq!(read_file(&*fs, "/model"), model, "round {}", round);
    }
}

#[test]
fn test_handle_reads_its_own_unflushed_writes() {
    let h = Harness::new();
    let fs = h.fs();
    write_file(&*fs, "/f", b"committed data");

    let writer = fs.open("/f", OpenMode::ReadWrite, 1).unwrap();
    let reader = fs.open("/f", OpenMode::Read, 2).unwrap();
    fs.write(writer, 0, b"COMMITTED").unwrap();
    fs.write(writer, 14, b" and more").unwrap();

    assert_eq!(read_handle(&*fs, writer, 0, 100), b"COMMITTED data and more");
    // Unflushed writes stay private to their handle.
    assert_eq!(read_handle(&*fs, reader, 0, 100), b"committed data");
    // getattr reports the size the writer will commit.
    assert_eq!(fs.getattr("/f").unwrap().size, 23);

    // Closing only seals while the reader keeps the file open; an explicit
    // flush commits.
    fs.flush(writer).unwrap();
    fs.close(writer).unwrap();
    assert_eq!(read_handle(&*fs, reader, 0, 100), b"COMMITTED data and more");
    fs.close(reader).unwrap();
}

#[test]
fn test_flush_is_idempotent() {
    let h = Harness::new();
    let fs = h.fs();
    let (fh, _) = fs.create("/f", 0o644, 0).unwrap();
    fs.write(fh, 0, b"flush me").unwrap();

    fs.flush(fh).unwrap();
    let commits = fs.bridge().sync().commits();
    let puts = h.store.put_calls();
    fs.flush(fh).unwrap();
    fs.flush(fh).unwrap();
    assert_eq!(fs.bridge().sync().commits(), commits);
    assert_eq!(h.store.put_calls(), puts);

    // Still usable after an explicit flush.
    fs.write(fh, 8, b"!").unwrap();
    fs.close(fh).unwrap();
    assert_eq!(read_file(&*fs, "/f"), b"flush me!");
}

#[test]
fn test_read_past_end_is_short() {
    let h = Harness::new();
    let fs = h.fs();
    write_file(&*fs, "/f", b"0123456789");

    let fh = fs.open("/f", OpenMode::Read, 0).unwrap();
    assert_eq!(fs.read(fh, 8, 100).unwrap(), b"89");
    assert!(fs.read(fh, 10, 10).unwrap().is_empty());
    assert!(fs.read(fh, 1000, 10).unwrap().is_empty());
    fs.close(fh).unwrap();
}

#[test]
fn test_append_mode_writes_at_end() {
    let h = Harness::new();
    let fs = h.fs();
    write_file(&*fs, "/log", b"one\n");

    let fh = fs.open("/log", OpenMode::Append, 0).unwrap();
    fs.write(fh, 0, b"two\n").unwrap();
    fs.write(fh, 0, b"three\n").unwrap();
    fs.close(fh).unwrap();

    assert_eq!(read_file(&*fs, "/log"), b"one\ntwo\nthree\n");
}

#[test]
fn test_mode_checks() {
    let h = Harness::new();
    let fs = h.fs();
    write_file(&*fs, "/f", b"data");

    let ro = fs.open("/f", OpenMode::Read, 0).unwrap();
    assert!(matches!(fs.write(ro, 0, b"x"), Err(FsError::BadHandle(_))));
    fs.close(ro).unwrap();

    let wo = fs.open("/f", OpenMode::Write, 0).unwrap();
    assert!(matches!(fs.read(wo, 0, 4), Err(FsError::BadHandle(_))));
    fs.close(wo).unwrap();

    assert!(matches!(fs.read(9999, 0, 1), Err(FsError::BadHandle(9999))));
    assert!(matches!(fs.close(wo), Err(FsError::BadHandle(_))));

    fs.mkdir("/d", 0o755).unwrap();
    assert!(matches!(
        fs.open("/d", OpenMode::Read, 0),
        Err(FsError::IsADirectory(_))
    ));
}

#[test]
fn test_truncate_shrinks_and_grows() {
    let h = Harness::new();
    let fs = h.fs();
    let data: Vec<u8> = (0..50u8).collect();
    write_file(&*fs, "/f", &data);

    let attr = fs
        .setattr("/f", SetAttr { size: Some(20), ..Default::default() })
        .unwrap();
    assert_eq!(attr.size, 20);
    assert_eq!(read_file(&*fs, "/f"), &data[..20]);

    fs.setattr("/f", SetAttr { size: Some(40), ..Default::default() })
        .unwrap();
    let mut expected = data[..20].to_vec();
    expected.resize(40, 0);
    assert_eq!(read_file(&*fs, "/f"), expected);

    fs.setattr("/f", SetAttr { size: Some(0), ..Default::default() })
        .unwrap();
    assert!(read_file(&*fs, "/f").is_empty());
}

#[test]
fn test_truncate_clips_open_handle_writes() {
    let h = Harness::new();
    let fs = h.fs();
    write_file(&*fs, "/f", b"");

    let fh = fs.open("/f", OpenMode::Write, 0).unwrap();
    fs.write(fh, 0, b"0123456789").unwrap();
    fs.setattr("/f", SetAttr { size: Some(4), ..Default::default() })
        .unwrap();
    fs.close(fh).unwrap();

    assert_eq!(read_file(&*fs, "/f"), b"0123");
}

#[test]
fn test_setattr_mode_and_times() {
    let h = Harness::new();
    let fs = h.fs();
    write_file(&*fs, "/f", b"x");

    let when = std::time::UNIX_EPOCH + std::time::Duration::from_secs(1_000_000);
    let attr = fs
        .setattr(
            "/f",
            SetAttr {
                perm: Some(0o600),
                mtime: Some(when),
                atime: Some(when),
                ..Default::default()
            },
        )
        .unwrap();
    assert_eq!(attr.perm, 0o600);
    assert_eq!(attr.mtime, when);
    assert_eq!(fs.getattr("/f").unwrap().atime, when);
}

#[test]
fn test_unchanged_chunks_are_not_uploaded_again() {
    let h = Harness::new();
    let fs = h.fs();
    let data = vec![7u8; (TEST_CHUNK_SIZE * 8) as usize];
    write_file(&*fs, "/big", &data);
    let puts = h.store.put_calls();

    // Rewrite one byte in the middle chunk.
    let fh = fs.open("/big", OpenMode::Write, 0).unwrap();
    fs.write(fh, TEST_CHUNK_SIZE * 4 + 3, b"x").unwrap();
    fs.close(fh).unwrap();

    assert_eq!(h.store.put_calls() - puts, 1);
    let mut expected = data.clone();
    expected[(TEST_CHUNK_SIZE * 4 + 3) as usize] = b'x';
    assert_eq!(read_file(&*fs, "/big"), expected);
}

#[test]
fn test_statfs_reports_synthetic_capacity() {
    let h = Harness::new();
    let fs = h.fs();
    let empty = fs.statfs().unwrap();
    assert_eq!(empty.block_size, 4096);
    assert_eq!(empty.max_name_len, 255);
    assert_eq!(empty.free_blocks, empty.total_blocks);

    write_file(&*fs, "/f", &vec![1u8; 5000]);
    let used = fs.statfs().unwrap();
    assert_eq!(used.total_blocks, empty.total_blocks);
    assert_eq!(used.free_blocks, empty.free_blocks - 2);
    assert_eq!(used.free_files, empty.free_files - 1);
}

#[test]
fn test_sparse_growth_does_not_materialize_the_file() {
    let h = Harness::with_config(MountConfig {
        chunk_size: 1 << 20,
        ..test_config()
    });
    let fs = h.fs();
    let (fh, _) = fs.create("/sparse", 0o644, 0).unwrap();
    fs.close(fh).unwrap();

    let size = 4u64 << 30;
    let attr = fs
        .setattr(
            "/sparse",
            SetAttr {
                size: Some(size),
                ..Default::default()
            },
        )
        .unwrap();
    assert_eq!(attr.size, size);
    // Every window is the same zero chunk.
    assert_eq!(h.store.len(), 1);

    let fh = fs.open("/sparse", OpenMode::Write, 0).unwrap();
    fs.write(fh, 5u64 << 30, b"tail").unwrap();
    fs.close(fh).unwrap();
    assert_eq!(fs.getattr("/sparse").unwrap().size, (5u64 << 30) + 4);
    assert_eq!(h.store.len(), 2);

    let fh = fs.open("/sparse", OpenMode::Read, 0).unwrap();
    assert_eq!(fs.read(fh, 3u64 << 30, 16).unwrap(), vec![0u8; 16]);
    assert_eq!(fs.read(fh, (5u64 << 30) - 2, 16).unwrap(), b"\0\0tail");
    fs.close(fh).unwrap();
}

#[test]
fn test_failed_flush_keeps_writes_readable() {
    let h = Harness::new();
    let fs = h.fs();
    let (fh, _) = fs.create("/a", 0o644, 0).unwrap();
    fs.write(fh, 0, b"hello").unwrap();

    h.store.fail_next_puts(100);
    assert!(matches!(fs.flush(fh), Err(FsError::NetworkUnavailable(_))));
    assert_eq!(fs.getattr("/a").unwrap().size, 5);
    assert_eq!(fs.read(fh, 0, 5).unwrap(), b"hello");
    let reader = fs.open("/a", OpenMode::Read, 1).unwrap();
    assert_eq!(fs.read(reader, 0, 5).unwrap(), b"hello");
    fs.close(reader).unwrap();

    // Writes after the failure land on top of the queued ones.
    fs.write(fh, 4, b"!").unwrap();
    assert_eq!(fs.read(fh, 0, 10).unwrap(), b"hell!");

    h.store.fail_next_puts(0);
    fs.close(fh).unwrap();
    assert!(fs.bridge().sync().pending_entries().is_empty());
    drop(fs);
    h.remount();
    assert_eq!(read_file(&*h.fs(), "/a"), b"hell!");
}
