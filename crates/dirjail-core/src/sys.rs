//! Thin syscall helpers shared by the resolver backends.
//!
//! Everything here maps `nix` results into [`DirjailError`] at the lowest
//! sensible level and keeps raw descriptors as [`OwnedFd`] so that release
//! is exactly-once by construction.

use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use dirjail_common::error::{DirjailError, Result};
use nix::errno::Errno;
use nix::fcntl::{OFlag, OpenHow};
use nix::sys::stat::{FileStat, Mode, SFlag};

/// Bounded retry count for `openat2(2)` calls that report a detected race
/// via `EAGAIN`.
const MAX_RACE_RETRIES: u32 = 8;

/// Builds the standard syscall error record.
pub(crate) fn sys_err(
    operation: &'static str,
    path: impl Into<PathBuf>,
    errno: Errno,
) -> DirjailError {
    DirjailError::Syscall {
        operation,
        path: path.into(),
        source: errno,
    }
}

/// Duplicates a borrowed descriptor into an owned one.
pub(crate) fn dup_fd(fd: BorrowedFd<'_>) -> Result<OwnedFd> {
    fd.try_clone_to_owned().map_err(|err| DirjailError::Io {
        operation: "duplicate directory descriptor",
        source: err,
    })
}

/// Identity of a filesystem object, used to pin a freshly opened entry to
/// the directory entry it was opened from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FileIdent {
    /// Device the inode lives on.
    pub dev: u64,
    /// Inode number.
    pub ino: u64,
}

impl From<&FileStat> for FileIdent {
    fn from(stat: &FileStat) -> Self {
        Self {
            dev: stat.st_dev,
            ino: stat.st_ino,
        }
    }
}

/// Returns whether the stat record describes a symbolic link.
pub(crate) fn is_symlink(stat: &FileStat) -> bool {
    SFlag::from_bits_truncate(stat.st_mode) & SFlag::S_IFMT == SFlag::S_IFLNK
}

/// Returns whether the stat record describes a directory.
pub(crate) fn is_dir(stat: &FileStat) -> bool {
    SFlag::from_bits_truncate(stat.st_mode) & SFlag::S_IFMT == SFlag::S_IFDIR
}

/// Returns whether the descriptor sits on a procfs superblock.
///
/// Absolute symlink targets found on procfs are overwhelmingly likely to be
/// magic-links, which must never be expanded in userspace.
pub(crate) fn on_procfs(fd: impl AsFd) -> Result<bool> {
    let statfs = nix::sys::statfs::fstatfs(fd).map_err(|errno| DirjailError::Io {
        operation: "statfs of path component",
        source: std::io::Error::from_raw_os_error(errno as i32),
    })?;
    Ok(statfs.filesystem_type() == nix::sys::statfs::PROC_SUPER_MAGIC)
}

/// Reports whether the host kernel supports `openat2(2)`.
///
/// Probed once per process with a dummy lookup; a kernel (or seccomp
/// policy) that rejects the probe pins the process to the emulated
/// backend.
pub(crate) fn openat2_supported() -> bool {
    static SUPPORTED: OnceLock<bool> = OnceLock::new();
    *SUPPORTED.get_or_init(|| {
        let how = OpenHow::new().flags(OFlag::O_PATH | OFlag::O_CLOEXEC);
        let supported = nix::fcntl::open("/", OFlag::O_PATH | OFlag::O_CLOEXEC, Mode::empty())
            .map(|rootfd| nix::fcntl::openat2(&rootfd, ".", how).is_ok())
            .unwrap_or(false);
        if !supported {
            tracing::debug!("openat2 probe failed; using the emulated resolver");
        }
        supported
    })
}

/// `openat2(2)` with a bounded retry on kernel-detected races.
///
/// The kernel reports `EAGAIN` when a concurrent rename or mount table
/// change was observed mid-lookup; retrying cannot weaken the confinement
/// contract because every attempt is a fresh atomic lookup.
pub(crate) fn openat2_retry(
    dirfd: BorrowedFd<'_>,
    path: &Path,
    how: OpenHow,
) -> std::result::Result<OwnedFd, Errno> {
    let mut attempt = 0;
    loop {
        match nix::fcntl::openat2(dirfd, path, how) {
            Err(Errno::EAGAIN) if attempt < MAX_RACE_RETRIES => attempt += 1,
            other => return other,
        }
    }
}
