//! Kernel-assisted confined lookup via `openat2(2)`.
//!
//! One atomic syscall enforces confinement in the kernel
//! (`RESOLVE_IN_ROOT`), with magic-link traversal disabled. When the
//! primitive is unavailable (pre-5.6 kernels, seccomp filters, or a path
//! shape the kernel rejects as oversized) the call falls back to the
//! emulated walk with an identical return contract; callers cannot observe
//! which backend served them.

use std::os::fd::{BorrowedFd, OwnedFd};
use std::path::Path;

use dirjail_common::error::{ErrorKind, Result};
use nix::errno::Errno;
use nix::fcntl::{OFlag, OpenHow, ResolveFlag};

use super::{PartialLookup, emulated, partial_ancestors};
use crate::sys::{self, sys_err};

/// Resolves `path` inside `root` with a single `openat2(2)` call.
pub(crate) fn resolve(
    root: BorrowedFd<'_>,
    path: &Path,
    follow_trailing: bool,
) -> Result<OwnedFd> {
    if !sys::openat2_supported() {
        return emulated::resolve(root, path, follow_trailing);
    }

    let mut oflags = OFlag::O_PATH | OFlag::O_CLOEXEC;
    if !follow_trailing {
        oflags |= OFlag::O_NOFOLLOW;
    }
    let how = OpenHow::new()
        .flags(oflags)
        .resolve(ResolveFlag::RESOLVE_IN_ROOT | ResolveFlag::RESOLVE_NO_MAGICLINKS);

    match sys::openat2_retry(root, path, how) {
        Ok(fd) => Ok(fd),
        // E2BIG means this particular lookup exceeded an in-kernel limit;
        // the emulated walk handles it with the same contract.
        Err(Errno::E2BIG | Errno::ENOSYS) => {
            tracing::debug!(?path, "openat2 rejected the lookup; falling back to emulation");
            emulated::resolve(root, path, follow_trailing)
        }
        Err(errno) => Err(sys_err("openat2 confined lookup", path, errno)),
    }
}

/// Resolves as many components of `path` as possible inside `root`.
///
/// `openat2(2)` is all-or-nothing, so partial progress is recovered by
/// probing successively shorter lexical prefixes of the path.
pub(crate) fn resolve_partial(
    root: BorrowedFd<'_>,
    path: &Path,
    follow_trailing: bool,
) -> Result<PartialLookup> {
    if !sys::openat2_supported() {
        return emulated::resolve_partial(root, path, follow_trailing);
    }

    let last_error = match resolve(root, path, follow_trailing) {
        Ok(fd) => return Ok(PartialLookup::Complete(fd)),
        Err(err) => err,
    };

    // A detected escape is never downgraded to partial progress: reporting
    // a handle would hand composite operations (mkdir_all) a foothold that
    // the full resolution already refused.
    if last_error.kind() == ErrorKind::EscapeDetected {
        return Err(last_error);
    }

    // A NotFound stop can sit behind a dangling trailing symlink, which
    // lexical prefix probing cannot see through; the emulated walk splices
    // link targets and therefore reports the true unresolved remainder.
    if last_error.kind() == ErrorKind::NotFound {
        return emulated::resolve_partial(root, path, follow_trailing);
    }

    for (prefix, remaining) in partial_ancestors(path) {
        match resolve(root, &prefix, true) {
            Ok(handle) => {
                return Ok(PartialLookup::Partial {
                    handle,
                    remaining,
                    last_error,
                });
            }
            Err(err) if err.kind() == ErrorKind::EscapeDetected => return Err(err),
            Err(_) => {}
        }
    }

    Ok(PartialLookup::Partial {
        handle: sys::dup_fd(root)?,
        remaining: path.into(),
        last_error,
    })
}
