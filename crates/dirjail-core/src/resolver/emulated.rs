//! Userspace emulation of in-kernel confined lookup.
//!
//! The walk keeps an explicit work queue of remaining components and a
//! stack of already-opened, already-verified ancestor descriptors. `..`
//! never touches the filesystem: it pops the stack (clamping at the root),
//! so a concurrent rename of a directory we have already walked through
//! cannot redirect the walk. Every forward step is a single-component
//! `openat(2)` with `O_NOFOLLOW`, pinned back to the parent's directory
//! entry by a dev+ino comparison before the walk descends through it.

use std::collections::VecDeque;
use std::ffi::OsString;
use std::os::fd::{BorrowedFd, OwnedFd};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use dirjail_common::error::{DirjailError, Result};
use nix::errno::Errno;
use nix::fcntl::{AtFlags, OFlag};
use nix::sys::stat::Mode;

use super::{MAX_SYMLINK_TRAVERSALS, PartialLookup, join_remaining, raw_components};
use crate::sys::{self, FileIdent, sys_err};

/// Attempts to re-pin a freshly opened component to its directory entry
/// before giving up on a transient race.
const MAX_VERIFY_RETRIES: u32 = 3;

/// Resolves `path` inside `root`, failing if any component cannot be
/// walked.
pub(crate) fn resolve(
    root: BorrowedFd<'_>,
    path: &Path,
    follow_trailing: bool,
) -> Result<OwnedFd> {
    match walk(root, path, follow_trailing)? {
        PartialLookup::Complete(fd) => Ok(fd),
        PartialLookup::Partial { last_error, .. } => Err(last_error),
    }
}

/// Resolves as many components of `path` as possible inside `root`.
pub(crate) fn resolve_partial(
    root: BorrowedFd<'_>,
    path: &Path,
    follow_trailing: bool,
) -> Result<PartialLookup> {
    walk(root, path, follow_trailing)
}

/// One confined component-by-component walk.
fn walk(root: BorrowedFd<'_>, path: &Path, follow_trailing: bool) -> Result<PartialLookup> {
    if path.as_os_str().is_empty() {
        return Err(sys_err("resolve subpath", path, Errno::ENOENT));
    }

    let mut queue: VecDeque<OsString> = raw_components(path);
    // Directories above `current` that this walk has already verified, so
    // ".." is answered from descriptors we own instead of re-reading a
    // mutable parent entry.
    let mut ancestors: Vec<OwnedFd> = Vec::new();
    let mut current = sys::dup_fd(root)?;
    let mut symlink_traversals = 0u32;

    while let Some(part) = queue.pop_front() {
        // Empty components come from "//" or a trailing slash; treat them
        // as "." so that "file/" fails with ENOTDIR like openat2 does.
        let part = if part.is_empty() {
            OsString::from(".")
        } else {
            part
        };

        match part.as_bytes() {
            b"." => {
                // No-op for the walk position, but the probe surfaces
                // ENOTDIR when the current position is not a directory.
                match nix::fcntl::openat(
                    &current,
                    ".",
                    OFlag::O_PATH | OFlag::O_CLOEXEC,
                    Mode::empty(),
                ) {
                    Ok(_probe) => {}
                    Err(errno) => {
                        return Ok(PartialLookup::Partial {
                            handle: current,
                            remaining: join_remaining(&part, &queue),
                            last_error: sys_err("open next component", path, errno),
                        });
                    }
                }
                continue;
            }
            b".." => {
                // ".." never touches the filesystem, but stepping out of a
                // non-directory must still fail the way a real lookup
                // would ("file/.." is ENOTDIR under openat2).
                let stat = nix::sys::stat::fstat(&current)
                    .map_err(|errno| sys_err("fstat current component", path, errno))?;
                if !sys::is_dir(&stat) {
                    return Ok(PartialLookup::Partial {
                        handle: current,
                        remaining: join_remaining(&part, &queue),
                        last_error: sys_err("open next component", path, Errno::ENOTDIR),
                    });
                }
                // Everything on the ancestor stack is a verified non-link
                // directory, so ".." is purely lexical; at the root it
                // stays at the root, matching in-kernel confined lookup.
                current = match ancestors.pop() {
                    Some(parent) => parent,
                    None => sys::dup_fd(root)?,
                };
                continue;
            }
            bytes => {
                // Components come from splitting on '/', so this cannot
                // trigger; it guards the invariant that each openat only
                // ever touches a single component.
                if bytes.contains(&b'/') {
                    return Err(DirjailError::EscapeDetected {
                        path: path.into(),
                        description: "path component contains '/'".into(),
                    });
                }
            }
        }

        // Open the next component without following a trailing symlink,
        // then pin it back to the directory entry it was opened from. A
        // mismatch means the entry was swapped mid-walk; a bounded retry
        // re-reads the (possibly legitimate) replacement.
        let mut attempt = 0u32;
        let (child, child_stat) = loop {
            let child = match nix::fcntl::openat(
                &current,
                part.as_os_str(),
                OFlag::O_PATH | OFlag::O_NOFOLLOW | OFlag::O_CLOEXEC,
                Mode::empty(),
            ) {
                Ok(fd) => fd,
                Err(errno) => {
                    return Ok(PartialLookup::Partial {
                        handle: current,
                        remaining: join_remaining(&part, &queue),
                        last_error: sys_err("open next component", path, errno),
                    });
                }
            };
            let child_stat = nix::sys::stat::fstat(&child)
                .map_err(|errno| sys_err("fstat next component", path, errno))?;
            if sys::is_symlink(&child_stat) {
                // Symlinks are never descended through; we only read the
                // descriptor we already hold, so no entry pinning needed.
                break (child, child_stat);
            }
            match nix::sys::stat::fstatat(
                &current,
                part.as_os_str(),
                AtFlags::AT_SYMLINK_NOFOLLOW,
            ) {
                Ok(entry) if FileIdent::from(&entry) == FileIdent::from(&child_stat) => {
                    break (child, child_stat);
                }
                Ok(_) | Err(Errno::ENOENT) if attempt < MAX_VERIFY_RETRIES => attempt += 1,
                Ok(_) => {
                    return Err(DirjailError::EscapeDetected {
                        path: path.into(),
                        description: format!(
                            "component {part:?} was replaced between open and verification"
                        ),
                    });
                }
                Err(errno) => return Err(sys_err("verify next component", path, errno)),
            }
        };

        if !sys::is_symlink(&child_stat) {
            ancestors.push(std::mem::replace(&mut current, child));
            continue;
        }

        // Trailing symlink, not followed: the raw link descriptor is the
        // result.
        if queue.is_empty() && !follow_trailing {
            return Ok(PartialLookup::Complete(child));
        }

        symlink_traversals += 1;
        if symlink_traversals > MAX_SYMLINK_TRAVERSALS {
            return Err(DirjailError::TooManySymlinks { path: path.into() });
        }

        let target = nix::fcntl::readlinkat(&child, "")
            .map_err(|errno| sys_err("readlink next component", path, errno))?;
        let target = Path::new(&target);

        // An absolute link target on a procfs superblock is almost
        // certainly a magic-link; expanding it in userspace would resolve
        // against the real filesystem root, so refuse like
        // RESOLVE_NO_MAGICLINKS does.
        if target.is_absolute() && sys::on_procfs(&child)? {
            return Err(sys_err(
                "refuse magic-link traversal",
                path,
                Errno::ELOOP,
            ));
        }

        // Splice the target's components onto the front of the queue
        // instead of recursing, so the expansion ceiling stays a counter.
        for component in raw_components(target.as_os_str()).into_iter().rev() {
            queue.push_front(component);
        }

        // Absolute targets restart the walk at the confinement root.
        if target.is_absolute() {
            ancestors.clear();
            current = sys::dup_fd(root)?;
        }
    }

    Ok(PartialLookup::Complete(current))
}
