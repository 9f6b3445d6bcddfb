//! Resolver backends for confined path walks.
//!
//! Both backends share one external contract: given a root directory
//! descriptor and a caller-supplied subpath, produce a descriptor whose
//! target is reachable from the root without any component redirecting
//! outside of it, or fail with a typed error. Absolute subpaths and
//! absolute symlink targets are reinterpreted as rooted at the confinement
//! directory, never at the real filesystem root.

pub(crate) mod emulated;
pub(crate) mod kernel;

use std::collections::VecDeque;
use std::ffi::{OsStr, OsString};
use std::os::fd::{BorrowedFd, OwnedFd};
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::{Path, PathBuf};

use dirjail_common::config::ResolverKind;
use dirjail_common::error::{DirjailError, Result};

/// Ceiling on symlink expansions during one walk, matching the kernel's
/// own `MAXSYMLINKS` loop limit.
pub(crate) const MAX_SYMLINK_TRAVERSALS: u32 = 40;

/// Outcome of a partial lookup: either the full path resolved, or the walk
/// stopped early and reports how far it got.
pub(crate) enum PartialLookup {
    /// Every component resolved; the descriptor refers to the final entry.
    Complete(OwnedFd),
    /// The walk stopped early.
    Partial {
        /// Descriptor to the deepest directory that was reached.
        handle: OwnedFd,
        /// Components that remain unresolved, starting with the one that
        /// failed.
        remaining: PathBuf,
        /// The error that stopped the walk.
        last_error: DirjailError,
    },
}

/// Resolves `path` inside `root` with the selected backend.
pub(crate) fn resolve(
    kind: ResolverKind,
    root: BorrowedFd<'_>,
    path: &Path,
    follow_trailing: bool,
) -> Result<OwnedFd> {
    match kind {
        ResolverKind::KernelAssisted => kernel::resolve(root, path, follow_trailing),
        ResolverKind::Emulated => emulated::resolve(root, path, follow_trailing),
    }
}

/// Resolves as many components of `path` as possible inside `root`.
pub(crate) fn resolve_partial(
    kind: ResolverKind,
    root: BorrowedFd<'_>,
    path: &Path,
    follow_trailing: bool,
) -> Result<PartialLookup> {
    match kind {
        ResolverKind::KernelAssisted => kernel::resolve_partial(root, path, follow_trailing),
        ResolverKind::Emulated => emulated::resolve_partial(root, path, follow_trailing),
    }
}

/// Splits a path into raw components on `/` without any normalization.
///
/// Leading slashes are dropped (absolute paths are root-relative by
/// contract); interior empty components and `.`/`..` entries are kept so
/// the walk can give them openat2-compatible treatment.
pub(crate) fn raw_components(path: impl AsRef<OsStr>) -> VecDeque<OsString> {
    let bytes = path.as_ref().as_bytes();
    let trimmed = {
        let start = bytes.iter().take_while(|&&b| b == b'/').count();
        &bytes[start..]
    };
    if trimmed.is_empty() {
        return VecDeque::new();
    }
    trimmed
        .split(|&b| b == b'/')
        .map(|part| OsString::from_vec(part.to_vec()))
        .collect()
}

/// Joins the current component with the rest of the work queue, for
/// reporting how much of a walk remained when it stopped.
pub(crate) fn join_remaining(part: &OsStr, rest: &VecDeque<OsString>) -> PathBuf {
    let mut bytes = part.as_bytes().to_vec();
    for component in rest {
        bytes.push(b'/');
        bytes.extend_from_slice(component.as_bytes());
    }
    PathBuf::from(OsString::from_vec(bytes))
}

/// Lexical `(prefix, remaining)` splits of a path, longest prefix first.
///
/// The full path itself is not included; the shortest split has a single
/// leading component as its prefix.
pub(crate) fn partial_ancestors(path: &Path) -> Vec<(PathBuf, PathBuf)> {
    let components: Vec<OsString> = raw_components(path).into();
    let mut splits = Vec::new();
    for cut in (1..components.len()).rev() {
        let prefix = join_components(&components[..cut]);
        let remaining = join_components(&components[cut..]);
        splits.push((prefix, remaining));
    }
    splits
}

/// Splits a subpath into its lexical parent and final component.
///
/// Mutations resolve the parent through the confined walk and then issue
/// one final-component syscall against it, so the final component must be
/// a real name: empty paths and `.`/`..` endings are rejected.
pub(crate) fn split_final(subpath: &Path) -> Result<(PathBuf, OsString)> {
    let mut components: Vec<OsString> = raw_components(subpath.as_os_str())
        .into_iter()
        .filter(|part| !part.is_empty())
        .collect();
    let name = components
        .pop()
        .ok_or_else(|| DirjailError::InvalidArgument {
            name: "subpath",
            description: format!("path {subpath:?} has no final component"),
        })?;
    if name == "." || name == ".." {
        return Err(DirjailError::InvalidArgument {
            name: "subpath",
            description: format!("path {subpath:?} ends in a special component"),
        });
    }
    let parent = if components.is_empty() {
        PathBuf::from(".")
    } else {
        join_components(&components)
    };
    Ok((parent, name))
}

fn join_components(components: &[OsString]) -> PathBuf {
    let mut bytes = Vec::new();
    for (i, component) in components.iter().enumerate() {
        if i > 0 {
            bytes.push(b'/');
        }
        bytes.extend_from_slice(component.as_bytes());
    }
    PathBuf::from(OsString::from_vec(bytes))
}
