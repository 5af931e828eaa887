use chunkfs::error::FsError;
use chunkfs::fs::callbacks::FilesystemCallbacks;
use chunkfs::fs::handles::OpenMode;
use chunkfs::tree::path::CaseSensitivity;
use chunkfs::tree::EntryKind;

use crate::helpers::{read_file, read_handle, test_config, write_file, Harness};

fn names(fs: &impl FilesystemCallbacks, path: &str) -> Vec<String> {
    let mut names: Vec<String> = fs.readdir(path).unwrap().into_iter().map(|e| e.name).collect();
    names.sort();
    names
}

#[test]
fn test_mkdir_readdir_rmdir() {
    let h = Harness::new();
    let fs = h.fs();

    let attr = fs.mkdir("/docs", 0o755).unwrap();
    assert_eq!(attr.kind, EntryKind::Directory);
    write_file(&*fs, "/docs/a.txt", b"a");
    write_file(&*fs, "/docs/b.txt", b"b");
    fs.mkdir("/docs/sub", 0o755).unwrap();

    assert_eq!(names(&*fs, "/docs"), vec!["a.txt", "b.txt", "sub"]);
    assert_eq!(names(&*fs, "/"), vec!["docs"]);

    assert!(matches!(fs.rmdir("/docs"), Err(FsError::NotEmpty(_))));
    assert!(matches!(fs.rmdir("/docs/a.txt"), Err(FsError::NotADirectory(_))));
    assert!(matches!(fs.delete("/docs/sub"), Err(FsError::IsADirectory(_))));

    fs.rmdir("/docs/sub").unwrap();
    fs.delete("/docs/a.txt").unwrap();
    fs.delete("/docs/b.txt").unwrap();
    fs.rmdir("/docs").unwrap();
    assert!(names(&*fs, "/").is_empty());
}

#[test]
fn test_create_errors() {
    let h = Harness::new();
    let fs = h.fs();
    write_file(&*fs, "/f", b"x");

    assert!(matches!(fs.create("/f", 0o644, 0), Err(FsError::AlreadyExists(_))));
    assert!(matches!(fs.mkdir("/f", 0o755), Err(FsError::AlreadyExists(_))));
    assert!(matches!(
        fs.create("/missing/f", 0o644, 0),
        Err(FsError::NotFound(_))
    ));
    assert!(matches!(fs.create("/f/child", 0o644, 0), Err(FsError::NotADirectory(_))));
    assert!(matches!(fs.readdir("/f"), Err(FsError::NotADirectory(_))));
    assert!(matches!(fs.getattr("/nope"), Err(FsError::NotFound(_))));
    assert!(matches!(fs.delete("/nope"), Err(FsError::NotFound(_))));
}

#[test]
fn test_root_cannot_be_removed_or_renamed() {
    let h = Harness::new();
    let fs = h.fs();
    assert!(fs.rmdir("/").is_err());
    assert!(fs.rename("/", "/elsewhere").is_err());
    assert_eq!(fs.getattr("/").unwrap().kind, EntryKind::Directory);
}

#[test]
fn test_rename_replaces_file_and_rejects_bad_moves() {
    let h = Harness::new();
    let fs = h.fs();
    write_file(&*fs, "/a", b"new");
    write_file(&*fs, "/b", b"old");
    fs.mkdir("/dir", 0o755).unwrap();
    fs.mkdir("/dir/inner", 0o755).unwrap();

    fs.rename("/a", "/b").unwrap();
    assert_eq!(read_file(&*fs, "/b"), b"new");
    assert!(matches!(fs.getattr("/a"), Err(FsError::NotFound(_))));

    assert!(matches!(fs.rename("/b", "/dir"), Err(FsError::IsADirectory(_))));
    assert!(matches!(
        fs.rename("/dir", "/dir/inner/moved"),
        Err(FsError::InvalidArgument(_))
    ));
    assert!(matches!(fs.rename("/nope", "/x"), Err(FsError::NotFound(_))));

    // A failed rename leaves both sides untouched.
    assert_eq!(read_file(&*fs, "/b"), b"new");
    assert_eq!(names(&*fs, "/dir"), vec!["inner"]);
}

#[test]
fn test_rename_directory_moves_subtree() {
    let h = Harness::new();
    let fs = h.fs();
    fs.mkdir("/src", 0o755).unwrap();
    fs.mkdir("/src/deep", 0o755).unwrap();
    write_file(&*fs, "/src/deep/file", b"payload");

    fs.rename("/src", "/dst").unwrap();
    assert_eq!(read_file(&*fs, "/dst/deep/file"), b"payload");
    assert!(matches!(fs.getattr("/src/deep/file"), Err(FsError::NotFound(_))));
}

#[test]
fn test_rename_with_open_handle_keeps_writing() {
    let h = Harness::new();
    let fs = h.fs();
    let (fh, _) = fs.create("/draft", 0o644, 0).unwrap();
    fs.write(fh, 0, b"first ").unwrap();
    fs.rename("/draft", "/final").unwrap();
    fs.write(fh, 6, b"second").unwrap();
    fs.close(fh).unwrap();

    assert_eq!(read_file(&*fs, "/final"), b"first second");
}

#[test]
fn test_delete_while_open() {
    let h = Harness::new();
    let fs = h.fs();
    write_file(&*fs, "/gone", b"still readable");

    let fh = fs.open("/gone", OpenMode::ReadWrite, 0).unwrap();
    fs.delete("/gone").unwrap();
    assert!(matches!(fs.getattr("/gone"), Err(FsError::NotFound(_))));
    assert!(names(&*fs, "/").is_empty());

    // The open handle keeps working against the unlinked entry.
    assert_eq!(read_handle(&*fs, fh, 0, 100), b"still readable");
    fs.write(fh, 0, b"STILL").unwrap();
    fs.close(fh).unwrap();

    // Nothing was committed for the unlinked entry.
    assert!(fs.bridge().sync().pending_entries().is_empty());
    // A new file at the same path starts empty.
    let (fh, attr) = fs.create("/gone", 0o644, 0).unwrap();
    assert_eq!(attr.size, 0);
    fs.close(fh).unwrap();
}

#[test]
fn test_paths_are_normalized() {
    let h = Harness::new();
    let fs = h.fs();
    fs.mkdir("/a", 0o755).unwrap();
    write_file(&*fs, "/a/file", b"x");

    assert!(fs.getattr("//a///file").is_ok());
    assert!(fs.getattr("/a/./file").is_ok());
    assert!(fs.getattr("/a/../a/file").is_ok());
    assert!(fs.getattr("a/file").is_ok());
}

#[test]
fn test_case_insensitive_lookup_keeps_created_case() {
    let mut config = test_config();
    config.case_sensitivity = CaseSensitivity::Insensitive;
    let h = Harness::with_config(config);
    let fs = h.fs();

    write_file(&*fs, "/ReadMe.TXT", b"hi");
    assert_eq!(read_file(&*fs, "/readme.txt"), b"hi");
    assert!(matches!(
        fs.create("/README.txt", 0o644, 0),
        Err(FsError::AlreadyExists(_))
    ));
    assert_eq!(names(&*fs, "/"), vec!["ReadMe.TXT"]);
}

#[test]
fn test_case_sensitive_names_are_distinct() {
    let h = Harness::new();
    let fs = h.fs();
    write_file(&*fs, "/name", b"lower");
    write_file(&*fs, "/NAME", b"upper");
    assert_eq!(read_file(&*fs, "/name"), b"lower");
    assert_eq!(read_file(&*fs, "/NAME"), b"upper");
}

#[test]
fn test_backslash_separators() {
    let mut config = test_config();
    config.accept_backslash = true;
    let h = Harness::with_config(config);
    let fs = h.fs();

    fs.mkdir("\\dir", 0o755).unwrap();
    write_file(&*fs, "\\dir\\file.txt", b"win");
    assert_eq!(read_file(&*fs, "/dir/file.txt"), b"win");
}

#[test]
fn test_lookup_reports_missing_entries() {
    let h = Harness::new();
    let fs = h.fs();
    fs.mkdir("/docs", 0o755).unwrap();
    write_file(&*fs, "/docs/a", b"a");
    let tree = fs.bridge().tree();

    let entry = tree.lookup("/docs/a").expect("linked file");
    assert_eq!(entry.id(), fs.getattr("/docs/a").unwrap().id);
    assert!(tree.lookup("/docs/missing").is_none());
    assert!(tree.lookup("/docs/a/child").is_none());
    assert!(tree.lookup("/nowhere/a").is_none());

    fs.delete("/docs/a").unwrap();
    assert!(tree.lookup("/docs/a").is_none());
}

#[test]
fn test_readdir_resumes_and_rewinds_over_changes() {
    let h = Harness::new();
    let fs = h.fs();
    fs.mkdir("/d", 0o755).unwrap();
    for name in ["a", "b", "c"] {
        write_file(&*fs, &format!("/d/{}", name), b"x");
    }

    let mut listing = fs.bridge().tree().readdir("/d").unwrap();
    assert_eq!(listing.next().unwrap().name, "a");

    fs.delete("/d/b").unwrap();
    write_file(&*fs, "/d/zz", b"late");
    let rest: Vec<String> = listing.by_ref().map(|l| l.name).collect();
    assert_eq!(rest, vec!["c", "zz"]);

    listing.rewind();
    let all: Vec<String> = listing.map(|l| l.name).collect();
    assert_eq!(all, vec!["a", "c", "zz"]);
}
