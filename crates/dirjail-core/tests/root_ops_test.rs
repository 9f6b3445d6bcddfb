//! Integration tests for mutating operations on a confinement root.
//!
//! Covered scenarios:
//! 1. File creation, node creation and hard/symbolic links
//! 2. `mkdir` / `mkdir_all` semantics, including idempotence and the
//!    set-id permission guard
//! 3. Removal: `unlink`, `rmdir` and recursive `remove_all`
//! 4. `rename` with NOREPLACE and EXCHANGE flags
//! 5. Mutations with hostile final components stay confined

#![cfg(target_os = "linux")]
#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::fs::File;
use std::io::{Read, Write};
use std::os::unix::fs::FileTypeExt;
use std::os::unix::fs::MetadataExt;
use std::path::Path;

use dirjail_core::{ErrorKind, ResolverKind, Root, RootConfig};
use nix::fcntl::{OFlag, RenameFlags};
use nix::sys::stat::{Mode, SFlag};

fn open_root(path: &Path) -> Root {
    Root::open(path).expect("should open root")
}

// ── Creation ─────────────────────────────────────────────────────────

#[test]
fn creat_makes_a_writable_file() {
    let dir = tempfile::tempdir().expect("should create tempdir");
    let root = open_root(dir.path());

    let handle = root
        .creat("notes.txt", OFlag::O_WRONLY, Mode::from_bits_truncate(0o644))
        .expect("should create file");
    let mut file = File::from(handle.into_fd());
    file.write_all(b"hello").expect("should write through creat fd");

    let contents = std::fs::read(dir.path().join("notes.txt")).expect("should read back");
    assert_eq!(contents, b"hello");
}

#[test]
fn creat_with_excl_refuses_existing_file() {
    let dir = tempfile::tempdir().expect("should create tempdir");
    std::fs::write(dir.path().join("taken"), b"x").expect("should write file");
    let root = open_root(dir.path());

    let err = root
        .creat(
            "taken",
            OFlag::O_WRONLY | OFlag::O_EXCL,
            Mode::from_bits_truncate(0o644),
        )
        .expect_err("should refuse existing file with O_EXCL");
    assert_eq!(err.kind(), ErrorKind::AlreadyExists);
}

#[test]
fn creat_does_not_follow_a_trailing_symlink() {
    let dir = tempfile::tempdir().expect("should create tempdir");
    std::os::unix::fs::symlink("victim", dir.path().join("trap"))
        .expect("should create symlink");
    let root = open_root(dir.path());

    root.creat("trap", OFlag::O_WRONLY, Mode::from_bits_truncate(0o644))
        .expect_err("should refuse to create through a symlink");
    assert!(
        !dir.path().join("victim").exists(),
        "the symlink target must not be created"
    );
}

#[test]
fn mknod_creates_a_fifo() {
    let dir = tempfile::tempdir().expect("should create tempdir");
    let root = open_root(dir.path());

    root.mknod("pipe", SFlag::S_IFIFO, Mode::from_bits_truncate(0o600), 0)
        .expect("should create fifo");
    let meta = std::fs::metadata(dir.path().join("pipe")).expect("should stat fifo");
    assert!(meta.file_type().is_fifo());
}

#[test]
fn mknod_rejects_directory_kind() {
    let dir = tempfile::tempdir().expect("should create tempdir");
    let root = open_root(dir.path());

    let err = root
        .mknod("d", SFlag::S_IFDIR, Mode::from_bits_truncate(0o755), 0)
        .expect_err("should reject S_IFDIR");
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
}

#[test]
fn hardlink_takes_target_then_linkname() {
    let dir = tempfile::tempdir().expect("should create tempdir");
    std::fs::write(dir.path().join("original"), b"x").expect("should write file");
    let root = open_root(dir.path());

    root.hardlink("original", "alias")
        .expect("should create hard link");
    let original = std::fs::metadata(dir.path().join("original")).expect("should stat");
    let alias = std::fs::metadata(dir.path().join("alias")).expect("should stat");
    assert_eq!(original.ino(), alias.ino());
    assert_eq!(original.nlink(), 2);
}

#[test]
fn symlink_stores_the_target_verbatim() {
    let dir = tempfile::tempdir().expect("should create tempdir");
    let root = open_root(dir.path());

    root.symlink("../odd//target/.", "sl")
        .expect("should create symlink");
    let target = root.readlink("sl").expect("should read back target");
    assert_eq!(target, Path::new("../odd//target/."));
}

// ── mkdir / mkdir_all ────────────────────────────────────────────────

#[test]
fn mkdir_then_rmdir_roundtrip() {
    let dir = tempfile::tempdir().expect("should create tempdir");
    let root = open_root(dir.path());

    root.mkdir("box", Mode::from_bits_truncate(0o755))
        .expect("should create directory");
    assert!(dir.path().join("box").is_dir());

    root.rmdir("box").expect("should remove empty directory");
    assert!(!dir.path().join("box").exists());
}

#[test]
fn mkdir_reports_existing_entry() {
    let dir = tempfile::tempdir().expect("should create tempdir");
    std::fs::create_dir(dir.path().join("box")).expect("should create directory");
    let root = open_root(dir.path());

    let err = root
        .mkdir("box", Mode::from_bits_truncate(0o755))
        .expect_err("should refuse existing directory");
    assert_eq!(err.kind(), ErrorKind::AlreadyExists);
}

#[test]
fn mkdir_all_creates_nested_tree_and_is_idempotent() {
    let dir = tempfile::tempdir().expect("should create tempdir");
    let root = open_root(dir.path());

    let handle = root
        .mkdir_all("a/b/c/d", Mode::from_bits_truncate(0o755))
        .expect("should create nested directories");
    let created = nix::sys::stat::fstat(&handle).expect("should fstat handle");
    let on_disk = std::fs::metadata(dir.path().join("a/b/c/d")).expect("should stat");
    assert_eq!(created.st_ino, on_disk.ino());

    root.mkdir_all("a/b/c/d", Mode::from_bits_truncate(0o755))
        .expect("should succeed when the tree already exists");
}

#[test]
fn mkdir_all_rejects_setid_bits() {
    let dir = tempfile::tempdir().expect("should create tempdir");
    let root = open_root(dir.path());

    let err = root
        .mkdir_all("a/b", Mode::from_bits_truncate(0o2755))
        .expect_err("should reject setgid");
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
}

#[test]
fn mkdir_all_refuses_a_file_in_the_way() {
    let dir = tempfile::tempdir().expect("should create tempdir");
    std::fs::write(dir.path().join("blocker"), b"x").expect("should write file");
    let root = open_root(dir.path());

    let err = root
        .mkdir_all("blocker", Mode::from_bits_truncate(0o755))
        .expect_err("should refuse a file at the final component");
    assert_eq!(err.kind(), ErrorKind::NotADirectory);

    let err = root
        .mkdir_all("blocker/sub", Mode::from_bits_truncate(0o755))
        .expect_err("should refuse a file in the middle");
    assert_eq!(err.kind(), ErrorKind::NotADirectory);
}

#[test]
fn mkdir_all_through_a_dangling_symlink_creates_the_target() {
    // A fresh fixture per backend: the first run would otherwise create
    // the target for the second.
    for resolver in [None, Some(ResolverKind::Emulated)] {
        let dir = tempfile::tempdir().expect("should create tempdir");
        std::os::unix::fs::symlink("target-dir", dir.path().join("dangling"))
            .expect("should create dangling symlink");
        let config = RootConfig { resolver };
        let root = Root::open_with(dir.path(), &config).expect("should open root");

        let handle = root
            .mkdir_all("dangling", Mode::from_bits_truncate(0o755))
            .expect("should create the link target");
        let created = nix::sys::stat::fstat(&handle).expect("should fstat handle");
        let on_disk =
            std::fs::metadata(dir.path().join("target-dir")).expect("should stat target");
        assert_eq!(created.st_ino, on_disk.ino(), "for {resolver:?}");
        assert!(dir.path().join("target-dir").is_dir());
    }
}

#[test]
fn mkdir_all_follows_symlinked_prefix_inside_the_root() {
    let dir = tempfile::tempdir().expect("should create tempdir");
    std::fs::create_dir(dir.path().join("real")).expect("should create directory");
    std::os::unix::fs::symlink("real", dir.path().join("via"))
        .expect("should create symlink");
    let root = open_root(dir.path());

    root.mkdir_all("via/deeper", Mode::from_bits_truncate(0o755))
        .expect("should create below a symlinked prefix");
    assert!(dir.path().join("real/deeper").is_dir());
}

// ── Removal ──────────────────────────────────────────────────────────

#[test]
fn unlink_removes_files_but_not_directories() {
    let dir = tempfile::tempdir().expect("should create tempdir");
    std::fs::write(dir.path().join("file"), b"x").expect("should write file");
    std::fs::create_dir(dir.path().join("box")).expect("should create directory");
    let root = open_root(dir.path());

    root.unlink("file").expect("should unlink file");
    assert!(!dir.path().join("file").exists());

    root.unlink("box")
        .expect_err("should refuse to unlink a directory");
}

#[test]
fn remove_all_clears_a_nested_tree() {
    let dir = tempfile::tempdir().expect("should create tempdir");
    std::fs::create_dir_all(dir.path().join("tree/a/b")).expect("should create tree");
    std::fs::write(dir.path().join("tree/a/file"), b"x").expect("should write file");
    std::fs::write(dir.path().join("tree/a/b/deep"), b"x").expect("should write file");
    std::os::unix::fs::symlink("/etc", dir.path().join("tree/a/link"))
        .expect("should create symlink");
    let root = open_root(dir.path());

    root.remove_all("tree").expect("should remove the tree");
    assert!(!dir.path().join("tree").exists());
    // The symlink must be removed as a link, not descended into.
    assert!(Path::new("/etc/passwd").exists());
}

#[test]
fn remove_all_of_a_missing_path_succeeds() {
    let dir = tempfile::tempdir().expect("should create tempdir");
    let root = open_root(dir.path());

    root.remove_all("never-existed")
        .expect("should succeed on missing path");
    root.remove_all("no/such/parent")
        .expect("should succeed on missing parent");
}

#[test]
fn remove_all_of_a_single_file_succeeds() {
    let dir = tempfile::tempdir().expect("should create tempdir");
    std::fs::write(dir.path().join("lonely"), b"x").expect("should write file");
    let root = open_root(dir.path());

    root.remove_all("lonely").expect("should remove single file");
    assert!(!dir.path().join("lonely").exists());
}

// ── Rename ───────────────────────────────────────────────────────────

#[test]
fn rename_moves_between_directories() {
    let dir = tempfile::tempdir().expect("should create tempdir");
    std::fs::create_dir(dir.path().join("src")).expect("should create src");
    std::fs::create_dir(dir.path().join("dst")).expect("should create dst");
    std::fs::write(dir.path().join("src/file"), b"x").expect("should write file");
    let root = open_root(dir.path());

    root.rename("src/file", "dst/file", RenameFlags::empty())
        .expect("should rename");
    assert!(!dir.path().join("src/file").exists());
    assert!(dir.path().join("dst/file").exists());
}

#[test]
fn rename_noreplace_refuses_existing_destination() {
    let dir = tempfile::tempdir().expect("should create tempdir");
    std::fs::write(dir.path().join("a"), b"a").expect("should write file");
    std::fs::write(dir.path().join("b"), b"b").expect("should write file");
    let root = open_root(dir.path());

    let err = root
        .rename("a", "b", RenameFlags::RENAME_NOREPLACE)
        .expect_err("should refuse existing destination");
    assert_eq!(err.kind(), ErrorKind::AlreadyExists);
}

#[test]
fn rename_exchange_swaps_both_entries() {
    let dir = tempfile::tempdir().expect("should create tempdir");
    std::fs::write(dir.path().join("a"), b"first").expect("should write file");
    std::fs::write(dir.path().join("b"), b"second").expect("should write file");
    let root = open_root(dir.path());

    match root.rename("a", "b", RenameFlags::RENAME_EXCHANGE) {
        Ok(()) => {
            let a = std::fs::read(dir.path().join("a")).expect("should read a");
            let b = std::fs::read(dir.path().join("b")).expect("should read b");
            assert_eq!(a, b"second");
            assert_eq!(b, b"first");
        }
        // Not every filesystem implements EXCHANGE; the kernel reports
        // that as EINVAL or EOPNOTSUPP depending on where it is caught.
        Err(err) => assert!(
            err.kind() == ErrorKind::Unsupported || err.errno() == Some(libc::EINVAL),
            "unexpected exchange failure: {err:?}"
        ),
    }
}

#[test]
fn rename_into_own_subtree_keeps_the_kernel_error() {
    let dir = tempfile::tempdir().expect("should create tempdir");
    std::fs::create_dir(dir.path().join("box")).expect("should create directory");
    let root = open_root(dir.path());

    // EINVAL here means "invalid rename", not "flags unsupported"; the
    // kind must not claim the filesystem lacks NOREPLACE.
    let err = root
        .rename("box", "box/inner", RenameFlags::RENAME_NOREPLACE)
        .expect_err("should refuse moving a directory into itself");
    assert_eq!(err.errno(), Some(libc::EINVAL));
    assert_ne!(err.kind(), ErrorKind::Unsupported);
}

#[test]
fn rename_rejects_exchange_combined_with_whiteout() {
    let dir = tempfile::tempdir().expect("should create tempdir");
    std::fs::write(dir.path().join("a"), b"x").expect("should write file");
    let root = open_root(dir.path());

    let err = root
        .rename(
            "a",
            "b",
            RenameFlags::RENAME_EXCHANGE | RenameFlags::RENAME_WHITEOUT,
        )
        .expect_err("should reject the flag combination");
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
}

// ── Root construction ────────────────────────────────────────────────

#[test]
fn opening_a_symlink_root_reports_not_a_directory() {
    let dir = tempfile::tempdir().expect("should create tempdir");
    std::fs::create_dir(dir.path().join("real")).expect("should create directory");
    std::os::unix::fs::symlink("real", dir.path().join("alias"))
        .expect("should create symlink");

    let err = Root::open(dir.path().join("alias")).expect_err("should refuse a symlink root");
    assert_eq!(err.kind(), ErrorKind::NotADirectory);
}

// ── Confinement of mutations ─────────────────────────────────────────

#[test]
fn mutations_with_climbing_parents_stay_in_the_root() {
    let dir = tempfile::tempdir().expect("should create tempdir");
    let root = open_root(dir.path());

    // The parent walk clamps ".." at the root, so the file lands inside.
    let handle = root
        .creat(
            "../../escapee",
            OFlag::O_WRONLY,
            Mode::from_bits_truncate(0o644),
        )
        .expect("should create inside the root");
    drop(handle);
    assert!(dir.path().join("escapee").exists());
    assert!(!dir.path().parent().expect("tempdir has a parent").join("escapee").exists());
}

#[test]
fn mutations_reject_special_final_components() {
    let dir = tempfile::tempdir().expect("should create tempdir");
    let root = open_root(dir.path());

    for bad in ["", ".", "a/..", "b/."] {
        let err = root
            .mkdir(bad, Mode::from_bits_truncate(0o755))
            .expect_err("should reject special final component");
        assert_eq!(err.kind(), ErrorKind::InvalidArgument, "for {bad:?}");
    }
}

#[test]
fn readlink_reports_non_links() {
    let dir = tempfile::tempdir().expect("should create tempdir");
    std::fs::write(dir.path().join("plain"), b"x").expect("should write file");
    let root = open_root(dir.path());

    root.readlink("plain")
        .expect_err("should refuse readlink of a regular file");
}

#[test]
fn handles_survive_renames_of_their_path() {
    let dir = tempfile::tempdir().expect("should create tempdir");
    std::fs::write(dir.path().join("before"), b"stable").expect("should write file");
    let root = open_root(dir.path());

    let handle = root.resolve("before").expect("should resolve");
    root.rename("before", "after", RenameFlags::empty())
        .expect("should rename");

    let mut contents = String::new();
    handle
        .reopen(OFlag::O_RDONLY)
        .expect("should reopen after rename")
        .read_to_string(&mut contents)
        .expect("should read");
    assert_eq!(contents, "stable");
}
