//! Already-resolved, escape-verified references to filesystem entries.

use std::fs::File;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::path::PathBuf;

use dirjail_common::error::{DirjailError, Result};
use nix::fcntl::OFlag;

use crate::procfs::{ProcfsBase, ProcfsHandle};
use crate::sys::{self, FileIdent};

/// The result of a completed, verified walk inside a [`Root`].
///
/// A `Handle` owns a descriptor that was reachable from its root without
/// any component redirecting outside of it at the moment of resolution,
/// and it stays valid regardless of later renames or unlinks. It carries
/// no path: re-opening goes through the descriptor itself, never through
/// a second walk.
///
/// Dropping the `Handle` releases the descriptor; Rust ownership makes the
/// release happen exactly once and makes use-after-release
/// unrepresentable.
///
/// [`Root`]: crate::Root
#[derive(Debug)]
pub struct Handle {
    fd: OwnedFd,
}

impl Handle {
    /// Wraps a descriptor produced by a completed walk.
    pub(crate) fn from_fd(fd: OwnedFd) -> Self {
        Self { fd }
    }

    /// Re-opens the underlying entry with new access flags.
    ///
    /// The re-open goes through the kernel's own self-referential
    /// `fd/<n>` magic-link, so no path walk is repeated and no second
    /// race window opens. The result is verified to refer to the same
    /// inode as this handle before it is returned.
    ///
    /// `O_NOFOLLOW` is ignored (the magic-link must be followed to reach
    /// the entry). Re-opening a handle to a symlink (from
    /// [`Root::resolve_nofollow`]) with anything but `O_PATH` fails with
    /// `ELOOP`, as the kernel refuses to open symlink inodes.
    ///
    /// # Errors
    ///
    /// Returns an error if creation flags are passed, if procfs is not
    /// available, or if the re-opened descriptor does not match this
    /// handle.
    ///
    /// [`Root::resolve_nofollow`]: crate::Root::resolve_nofollow
    pub fn reopen(&self, flags: OFlag) -> Result<File> {
        if flags.intersects(OFlag::O_CREAT | OFlag::O_EXCL)
            || flags.contains(OFlag::O_TMPFILE)
        {
            return Err(DirjailError::InvalidArgument {
                name: "flags",
                description: format!("creation flags {flags:?} are invalid for a reopen"),
            });
        }
        let flags = flags.difference(OFlag::O_NOFOLLOW);

        let procfs = ProcfsHandle::global()?;
        let fd_link = PathBuf::from(format!("fd/{}", self.fd.as_raw_fd()));
        let file = procfs.open_follow(ProcfsBase::SelfProcess, &fd_link, flags)?;

        // The fd/<n> entry is under our control, but procfs itself might
        // not be; make sure the reopen landed on the same inode.
        let expected = nix::sys::stat::fstat(&self.fd)
            .map_err(|errno| sys::sys_err("fstat of handle", &fd_link, errno))?;
        let actual = nix::sys::stat::fstat(&file)
            .map_err(|errno| sys::sys_err("fstat of reopened handle", &fd_link, errno))?;
        if FileIdent::from(&expected) != FileIdent::from(&actual) {
            return Err(DirjailError::EscapeDetected {
                path: fd_link,
                description: "procfs reopen returned a different inode than the handle".into(),
            });
        }
        Ok(file)
    }

    /// Consumes the handle, returning the owned descriptor.
    pub fn into_fd(self) -> OwnedFd {
        self.fd
    }

    /// Duplicates the handle.
    ///
    /// # Errors
    ///
    /// Returns an error if the descriptor cannot be duplicated.
    pub fn try_clone(&self) -> Result<Self> {
        sys::dup_fd(self.fd.as_fd()).map(Self::from_fd)
    }
}

impl AsFd for Handle {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl From<Handle> for OwnedFd {
    fn from(handle: Handle) -> Self {
        handle.fd
    }
}
