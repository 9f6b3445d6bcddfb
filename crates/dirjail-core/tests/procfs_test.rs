//! Integration tests for the procfs accessor and descriptor re-opening.
//!
//! Covered scenarios:
//! 1. `Handle::reopen` through `fd/<n>` returns the same file
//! 2. Reopen flag validation
//! 3. Procfs reads below the self / pid bases
//! 4. The read-safe mask on top-of-procfs entries
//! 5. Magic-links: opaque to `open`, usable via `open_follow`, readable
//!    via `readlink`

#![cfg(target_os = "linux")]
#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::io::{Read, Seek, SeekFrom, Write};
use std::os::fd::AsRawFd;

use dirjail_core::procfs::{ProcfsBase, ProcfsHandle};
use dirjail_core::{ErrorKind, Root};
use nix::fcntl::OFlag;

// ── Handle::reopen ───────────────────────────────────────────────────

#[test]
fn reopen_returns_the_same_file_with_fresh_flags() {
    let dir = tempfile::tempdir().expect("should create tempdir");
    std::fs::write(dir.path().join("data"), b"through the looking glass")
        .expect("should write file");
    let root = Root::open(dir.path()).expect("should open root");

    let handle = root.resolve("data").expect("should resolve");
    let mut reader = handle.reopen(OFlag::O_RDONLY).expect("should reopen read-only");
    let mut contents = String::new();
    reader.read_to_string(&mut contents).expect("should read");
    assert_eq!(contents, "through the looking glass");

    // A second reopen gets an independent offset.
    let mut second = handle.reopen(OFlag::O_RDONLY).expect("should reopen again");
    let mut again = String::new();
    second.read_to_string(&mut again).expect("should read");
    assert_eq!(again, contents);
}

#[test]
fn reopen_can_upgrade_an_o_path_resolution_to_read_write() {
    let dir = tempfile::tempdir().expect("should create tempdir");
    std::fs::write(dir.path().join("data"), b"old").expect("should write file");
    let root = Root::open(dir.path()).expect("should open root");

    let handle = root.resolve("data").expect("should resolve");
    let mut file = handle.reopen(OFlag::O_RDWR).expect("should reopen read-write");
    file.seek(SeekFrom::Start(0)).expect("should seek");
    file.write_all(b"new").expect("should write");

    let contents = std::fs::read(dir.path().join("data")).expect("should read back");
    assert_eq!(contents, b"new");
}

#[test]
fn reopen_rejects_creation_flags() {
    let dir = tempfile::tempdir().expect("should create tempdir");
    std::fs::write(dir.path().join("data"), b"x").expect("should write file");
    let root = Root::open(dir.path()).expect("should open root");

    let handle = root.resolve("data").expect("should resolve");
    for flags in [OFlag::O_CREAT, OFlag::O_EXCL, OFlag::O_TMPFILE | OFlag::O_RDWR] {
        let err = handle
            .reopen(flags)
            .expect_err("should reject creation flags");
        assert_eq!(err.kind(), ErrorKind::InvalidArgument, "for {flags:?}");
    }
}

#[test]
fn reopen_of_a_directory_handle_works() {
    let dir = tempfile::tempdir().expect("should create tempdir");
    std::fs::create_dir(dir.path().join("sub")).expect("should create dir");
    let root = Root::open(dir.path()).expect("should open root");

    let handle = root.resolve("sub").expect("should resolve dir");
    handle
        .reopen(OFlag::O_RDONLY | OFlag::O_DIRECTORY)
        .expect("should reopen directory");
}

// ── Procfs reads ─────────────────────────────────────────────────────

#[test]
fn self_status_names_this_process() {
    let procfs = ProcfsHandle::new().expect("should open procfs");
    let mut file = procfs
        .open(ProcfsBase::SelfProcess, "status", OFlag::O_RDONLY)
        .expect("should open self status");
    let mut contents = String::new();
    file.read_to_string(&mut contents).expect("should read status");
    assert!(contents.starts_with("Name:"), "unexpected status: {contents:?}");
}

#[test]
fn explicit_pid_base_reaches_our_own_entry() {
    let procfs = ProcfsHandle::new().expect("should open procfs");
    let mut file = procfs
        .open(ProcfsBase::Pid(std::process::id()), "comm", OFlag::O_RDONLY)
        .expect("should open pid comm");
    let mut contents = String::new();
    file.read_to_string(&mut contents).expect("should read comm");
    assert!(!contents.trim().is_empty());
}

#[test]
fn thread_self_base_resolves() {
    let procfs = ProcfsHandle::new().expect("should open procfs");
    procfs
        .open(ProcfsBase::SelfThread, "status", OFlag::O_RDONLY)
        .expect("should open thread-self status");
}

// ── Mask ─────────────────────────────────────────────────────────────

#[test]
fn masked_handle_allows_read_safe_root_entries() {
    let procfs = ProcfsHandle::new().expect("should open procfs");
    for entry in ["uptime", "meminfo", "stat"] {
        let mut file = procfs
            .open(ProcfsBase::Root, entry, OFlag::O_RDONLY)
            .expect("should open read-safe entry");
        let mut contents = String::new();
        file.read_to_string(&mut contents).expect("should read entry");
        assert!(!contents.is_empty(), "{entry} was empty");
    }
}

#[test]
fn masked_handle_blocks_everything_else_at_the_top() {
    let procfs = ProcfsHandle::new().expect("should open procfs");
    for entry in ["cmdline", "kcore", "sysrq-trigger", "1"] {
        let err = procfs
            .open(ProcfsBase::Root, entry, OFlag::O_RDONLY)
            .expect_err("should be masked");
        assert_eq!(err.kind(), ErrorKind::Masked, "for {entry:?}");
    }
}

#[test]
fn unmasked_handle_reaches_the_whole_top_level() {
    let procfs = ProcfsHandle::unmasked().expect("should open unmasked procfs");
    let mut file = procfs
        .open(ProcfsBase::Root, "cmdline", OFlag::O_RDONLY)
        .expect("should open kernel cmdline unmasked");
    let mut contents = String::new();
    file.read_to_string(&mut contents).expect("should read cmdline");
    assert!(!contents.is_empty());
}

#[test]
fn per_pid_bases_are_never_masked() {
    let procfs = ProcfsHandle::new().expect("should open procfs");
    procfs
        .open(ProcfsBase::SelfProcess, "cmdline", OFlag::O_RDONLY)
        .expect("should read our own cmdline despite the mask");
}

// ── Magic-links ──────────────────────────────────────────────────────

#[test]
fn open_refuses_to_traverse_a_magic_link() {
    let procfs = ProcfsHandle::new().expect("should open procfs");
    procfs
        .open(ProcfsBase::SelfProcess, "exe", OFlag::O_RDONLY)
        .expect_err("should refuse to follow exe");
    procfs
        .open(ProcfsBase::SelfProcess, "cwd/anything", OFlag::O_RDONLY)
        .expect_err("should refuse to walk through cwd");
}

#[test]
fn open_follow_dereferences_a_trailing_fd_link() {
    let mut scratch = tempfile::tempfile().expect("should create scratch file");
    scratch.write_all(b"via fd link").expect("should write");
    scratch.flush().expect("should flush");

    let procfs = ProcfsHandle::new().expect("should open procfs");
    let mut reopened = procfs
        .open_follow(
            ProcfsBase::SelfProcess,
            format!("fd/{}", scratch.as_raw_fd()),
            OFlag::O_RDONLY,
        )
        .expect("should open through fd link");
    let mut contents = String::new();
    reopened.read_to_string(&mut contents).expect("should read");
    assert_eq!(contents, "via fd link");
}

#[test]
fn readlink_renders_magic_link_targets() {
    let procfs = ProcfsHandle::new().expect("should open procfs");
    let target = procfs
        .readlink(ProcfsBase::SelfProcess, "exe")
        .expect("should readlink exe");
    assert!(target.is_absolute(), "exe target was {target:?}");
}

#[test]
fn subpaths_cannot_climb_out_of_procfs() {
    let procfs = ProcfsHandle::new().expect("should open procfs");
    procfs
        .open(ProcfsBase::SelfProcess, "../../etc/passwd", OFlag::O_RDONLY)
        .expect_err("should refuse .. in procfs subpaths");
    procfs
        .open(ProcfsBase::SelfProcess, "/etc/passwd", OFlag::O_RDONLY)
        .expect_err("should refuse absolute procfs subpaths");
}
