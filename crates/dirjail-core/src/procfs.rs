//! Safe accessor for the process-information filesystem.
//!
//! Procfs is full of magic-links: entries that readlink like symlinks but
//! are bind-mount-like jumps the kernel resolves internally (`fd/<n>`,
//! `map_files/*`, `exe`, ...). Resolving them in userspace with
//! readlink-then-walk is unsound, so the accessor restricts every walk to
//! the procfs mount (no `..`, no absolute subpaths, no magic-link
//! traversal) and only dereferences a trailing magic-link when the caller
//! explicitly asks for it via [`ProcfsHandle::open_follow`].
//!
//! By default a handle is *masked*: subpaths rooted at the top of procfs
//! are limited to an allow-list of known-read-safe entries, protecting
//! against footguns like side-effecting global files. Per-process bases
//! are always available. [`ProcfsHandle::unmasked`] lifts the mask.

use std::ffi::OsString;
use std::fs::File;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use dirjail_common::error::{DirjailError, Result};
use nix::errno::Errno;
use nix::fcntl::{AtFlags, OFlag, OpenHow, ResolveFlag};
use nix::sys::stat::Mode;

use crate::resolver::{MAX_SYMLINK_TRAVERSALS, raw_components, split_final};
use crate::sys::{self, sys_err};

/// Which subtree of procfs an operation is rooted at.
///
/// Bases are resolved fresh on every operation through the kernel's own
/// self-referential symlinks; no process or thread id is ever cached
/// across calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcfsBase {
    /// The top of procfs (`/proc`). Subject to the safety mask.
    Root,
    /// The calling process (`/proc/self`).
    SelfProcess,
    /// The calling thread (`/proc/thread-self`, with `self/task/<tid>`
    /// and `self` fallbacks for pre-3.17 kernels).
    SelfThread,
    /// An explicit process id (`/proc/<pid>`). Inherently best-effort:
    /// the process may exit and the pid may be recycled at any time, and
    /// no liveness check is performed.
    Pid(u32),
}

impl ProcfsBase {
    /// The subpath of this base below the procfs root, computed fresh.
    fn to_subpath(self, procfd: BorrowedFd<'_>) -> PathBuf {
        match self {
            Self::Root => PathBuf::from("."),
            Self::SelfProcess => PathBuf::from("self"),
            Self::Pid(pid) => PathBuf::from(pid.to_string()),
            Self::SelfThread => [
                PathBuf::from("thread-self"),
                PathBuf::from(format!("self/task/{}", nix::unistd::gettid())),
                // Final fallback for procfs mounts from another pid
                // namespace, where our tid is not visible.
                PathBuf::from("self"),
            ]
            .into_iter()
            .find(|candidate| {
                nix::sys::stat::fstatat(procfd, candidate, AtFlags::AT_SYMLINK_NOFOLLOW).is_ok()
            })
            .unwrap_or_else(|| PathBuf::from("self")),
        }
    }
}

/// Top-of-procfs entries that are safe to open for reading and cannot
/// trigger side effects or leak another mount's state.
const READ_SAFE_ROOT_ENTRIES: &[&str] = &[
    "cgroups",
    "cpuinfo",
    "filesystems",
    "loadavg",
    "meminfo",
    "mounts",
    "self",
    "stat",
    "sys",
    "thread-self",
    "uptime",
    "version",
];

/// A verified descriptor to the procfs mount.
#[derive(Debug)]
pub struct ProcfsHandle {
    fd: OwnedFd,
    /// Device id of the procfs superblock, used by the emulated walk to
    /// detect crossings onto other mounts (files bind-mounted over
    /// procfs entries).
    dev: u64,
    masked: bool,
}

impl ProcfsHandle {
    /// Opens a masked handle to `/proc`.
    ///
    /// # Errors
    ///
    /// Returns an error if `/proc` cannot be opened or is not a procfs
    /// mount.
    pub fn new() -> Result<Self> {
        Self::open_procfs(true)
    }

    /// Opens an unmasked handle to `/proc`, disabling the read-safe
    /// allow-list for [`ProcfsBase::Root`] subpaths.
    ///
    /// # Errors
    ///
    /// Returns an error if `/proc` cannot be opened or is not a procfs
    /// mount.
    pub fn unmasked() -> Result<Self> {
        Self::open_procfs(false)
    }

    fn open_procfs(masked: bool) -> Result<Self> {
        let fd = nix::fcntl::open(
            "/proc",
            OFlag::O_PATH | OFlag::O_DIRECTORY | OFlag::O_NOFOLLOW | OFlag::O_CLOEXEC,
            Mode::empty(),
        )
        .map_err(|errno| sys_err("open procfs root", "/proc", errno))?;

        if !sys::on_procfs(&fd)? {
            return Err(DirjailError::Unsupported {
                description: "no procfs mounted at /proc".into(),
            });
        }
        let stat = nix::sys::stat::fstat(&fd)
            .map_err(|errno| sys_err("fstat procfs root", "/proc", errno))?;

        tracing::debug!(masked, "procfs handle opened");
        Ok(Self {
            fd,
            dev: stat.st_dev,
            masked,
        })
    }

    /// Shared masked handle used internally for descriptor re-opens.
    pub(crate) fn global() -> Result<&'static Self> {
        static GLOBAL: OnceLock<ProcfsHandle> = OnceLock::new();
        match GLOBAL.get() {
            Some(handle) => Ok(handle),
            None => {
                let handle = Self::new()?;
                Ok(GLOBAL.get_or_init(|| handle))
            }
        }
    }

    /// Opens `subpath` below `base` with the given flags.
    ///
    /// Ordinary relative symlinks inside procfs (such as `self`) are
    /// followed; a trailing magic-link fails with `ELOOP`. Use
    /// [`open_follow`] for entries like `fd/<n>` that must be
    /// dereferenced.
    ///
    /// # Errors
    ///
    /// Returns [`DirjailError::Masked`] for non-allow-listed
    /// [`ProcfsBase::Root`] subpaths on a masked handle, and a typed
    /// error for any resolution failure.
    ///
    /// [`open_follow`]: Self::open_follow
    pub fn open(&self, base: ProcfsBase, subpath: impl AsRef<Path>, flags: OFlag) -> Result<File> {
        let subpath = subpath.as_ref();
        self.check_flags(flags)?;
        self.check_mask(base, subpath)?;
        let basefd = self.open_base(base)?;
        self.resolve_rel(basefd.as_fd(), subpath, flags, true)
            .map(File::from)
    }

    /// Opens `subpath` below `base`, dereferencing a trailing
    /// magic-link.
    ///
    /// The parent directory is resolved through the restricted walk; only
    /// the final component is opened directly, which is the sound way to
    /// step through per-fd and map-file entries. The result may
    /// legitimately live outside procfs (that is the point of a
    /// magic-link).
    ///
    /// # Errors
    ///
    /// As for [`open`](Self::open), plus `InvalidArgument` if `subpath`
    /// has no final component.
    pub fn open_follow(
        &self,
        base: ProcfsBase,
        subpath: impl AsRef<Path>,
        flags: OFlag,
    ) -> Result<File> {
        let subpath = subpath.as_ref();
        self.check_flags(flags)?;
        self.check_mask(base, subpath)?;
        let flags = flags.difference(OFlag::O_NOFOLLOW);

        let (parent, name) = split_final(subpath)?;
        let basefd = self.open_base(base)?;
        let dirfd = self.resolve_rel(
            basefd.as_fd(),
            &parent,
            OFlag::O_PATH | OFlag::O_DIRECTORY | OFlag::O_CLOEXEC,
            true,
        )?;
        nix::fcntl::openat(&dirfd, name.as_os_str(), flags | OFlag::O_CLOEXEC, Mode::empty())
            .map(File::from)
            .map_err(|errno| sys_err("open final procfs component", subpath, errno))
    }

    /// Reads the target of a symlink (or magic-link) below `base`.
    ///
    /// Magic-link targets are returned as the kernel renders them; they
    /// are informational and must not be fed back into path resolution.
    ///
    /// # Errors
    ///
    /// As for [`open`](Self::open), plus the usual `EINVAL` when the
    /// entry is not a link.
    pub fn readlink(&self, base: ProcfsBase, subpath: impl AsRef<Path>) -> Result<PathBuf> {
        let subpath = subpath.as_ref();
        self.check_mask(base, subpath)?;
        let basefd = self.open_base(base)?;
        let linkfd = self.resolve_rel(
            basefd.as_fd(),
            subpath,
            OFlag::O_PATH | OFlag::O_NOFOLLOW | OFlag::O_CLOEXEC,
            false,
        )?;
        nix::fcntl::readlinkat(&linkfd, "")
            .map(PathBuf::from)
            .map_err(|errno| sys_err("readlink procfs entry", subpath, errno))
    }

    fn check_flags(&self, flags: OFlag) -> Result<()> {
        if flags.intersects(OFlag::O_CREAT | OFlag::O_EXCL) || flags.contains(OFlag::O_TMPFILE) {
            return Err(DirjailError::InvalidArgument {
                name: "flags",
                description: format!("creation flags {flags:?} make no sense for procfs"),
            });
        }
        Ok(())
    }

    fn check_mask(&self, base: ProcfsBase, subpath: &Path) -> Result<()> {
        if !self.masked || base != ProcfsBase::Root {
            return Ok(());
        }
        let first = raw_components(subpath.as_os_str())
            .into_iter()
            .find(|part| !part.is_empty() && part.as_bytes() != b".");
        let allowed = first.as_ref().is_some_and(|part| {
            READ_SAFE_ROOT_ENTRIES
                .iter()
                .any(|safe| part.as_bytes() == safe.as_bytes())
        });
        if allowed {
            Ok(())
        } else {
            Err(DirjailError::Masked {
                path: subpath.into(),
            })
        }
    }

    /// Opens the directory a base refers to, fresh for this operation.
    fn open_base(&self, base: ProcfsBase) -> Result<OwnedFd> {
        let subpath = base.to_subpath(self.fd.as_fd());
        self.resolve_rel(
            self.fd.as_fd(),
            &subpath,
            OFlag::O_PATH | OFlag::O_DIRECTORY | OFlag::O_CLOEXEC,
            true,
        )
    }

    /// Restricted resolution below a procfs directory: no `..`, no
    /// absolute subpaths, no magic-link traversal, no leaving the procfs
    /// mount.
    fn resolve_rel(
        &self,
        dirfd: BorrowedFd<'_>,
        subpath: &Path,
        flags: OFlag,
        follow_trailing: bool,
    ) -> Result<OwnedFd> {
        if subpath.is_absolute() {
            return Err(DirjailError::EscapeDetected {
                path: subpath.into(),
                description: "procfs subpaths must be relative".into(),
            });
        }

        if sys::openat2_supported() {
            let mut oflags = flags | OFlag::O_CLOEXEC;
            if !follow_trailing {
                oflags |= OFlag::O_NOFOLLOW;
            }
            let how = OpenHow::new().flags(oflags).resolve(
                ResolveFlag::RESOLVE_BENEATH
                    | ResolveFlag::RESOLVE_NO_MAGICLINKS
                    | ResolveFlag::RESOLVE_NO_XDEV,
            );
            match sys::openat2_retry(dirfd, subpath, how) {
                Ok(fd) => return Ok(fd),
                Err(Errno::E2BIG | Errno::ENOSYS) => {
                    tracing::debug!(?subpath, "openat2 unavailable for procfs lookup");
                }
                Err(errno) => return Err(sys_err("openat2 procfs lookup", subpath, errno)),
            }
        }

        self.restricted_walk(dirfd, subpath, flags, follow_trailing)
    }

    /// Userspace emulation of the restricted procfs lookup.
    fn restricted_walk(
        &self,
        dirfd: BorrowedFd<'_>,
        subpath: &Path,
        flags: OFlag,
        follow_trailing: bool,
    ) -> Result<OwnedFd> {
        if subpath.as_os_str().is_empty() {
            return Err(sys_err("resolve procfs subpath", subpath, Errno::ENOENT));
        }

        let mut queue = raw_components(subpath.as_os_str());
        let mut current = sys::dup_fd(dirfd)?;
        let mut symlink_traversals = 0u32;

        while let Some(part) = queue.pop_front() {
            let part = if part.is_empty() {
                OsString::from(".")
            } else {
                part
            };
            // Walking up cannot be verified without a procfs-independent
            // escape check, so the restricted walk refuses it outright,
            // like RESOLVE_BENEATH.
            if part.as_bytes() == b".." {
                return Err(sys_err(
                    "step into parent directory",
                    subpath,
                    Errno::EXDEV,
                ));
            }

            let child = nix::fcntl::openat(
                &current,
                part.as_os_str(),
                OFlag::O_PATH | OFlag::O_NOFOLLOW | OFlag::O_CLOEXEC,
                Mode::empty(),
            )
            .map_err(|errno| sys_err("open next procfs component", subpath, errno))?;
            self.check_same_mount(&child, subpath)?;

            let stat = nix::sys::stat::fstat(&child)
                .map_err(|errno| sys_err("fstat procfs component", subpath, errno))?;

            if sys::is_symlink(&stat) {
                if queue.is_empty() && !follow_trailing {
                    if flags.contains(OFlag::O_PATH) {
                        return Ok(child);
                    }
                    return Err(sys_err("open trailing procfs link", subpath, Errno::ELOOP));
                }
                symlink_traversals += 1;
                if symlink_traversals > MAX_SYMLINK_TRAVERSALS {
                    return Err(DirjailError::TooManySymlinks {
                        path: subpath.into(),
                    });
                }
                let target = nix::fcntl::readlinkat(&child, "")
                    .map_err(|errno| sys_err("readlink procfs component", subpath, errno))?;
                check_link_target(Path::new(&target), subpath)?;
                for component in raw_components(&target).into_iter().rev() {
                    queue.push_front(component);
                }
                continue;
            }

            if queue.is_empty() {
                // Re-open the final component with the caller's flags;
                // O_NOFOLLOW is safe because we already know it is not a
                // link.
                let opened = nix::fcntl::openat(
                    &current,
                    part.as_os_str(),
                    flags | OFlag::O_NOFOLLOW | OFlag::O_CLOEXEC,
                    Mode::empty(),
                )
                .map_err(|errno| sys_err("open final procfs component", subpath, errno))?;
                self.check_same_mount(&opened, subpath)?;
                return Ok(opened);
            }
            current = child;
        }

        // The subpath was all "." components; hand back the directory.
        Ok(current)
    }

    /// Pins a descriptor to the procfs superblock this handle was opened
    /// on, catching files bind-mounted over procfs entries.
    fn check_same_mount(&self, fd: &OwnedFd, subpath: &Path) -> Result<()> {
        let stat = nix::sys::stat::fstat(fd)
            .map_err(|errno| sys_err("fstat procfs component", subpath, errno))?;
        if stat.st_dev != self.dev {
            return Err(DirjailError::EscapeDetected {
                path: subpath.into(),
                description: "procfs component crossed onto another mount".into(),
            });
        }
        Ok(())
    }
}

impl AsFd for ProcfsHandle {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

/// Rejects symlink targets that cannot be ordinary relative procfs links.
///
/// All procfs magic-links render absolute targets, and anon-inode style
/// links render `name:[inode]`; a genuine relative symlink in procfs
/// (`self`, `mounts`, ...) never looks like either.
fn check_link_target(target: &Path, subpath: &Path) -> Result<()> {
    if target.is_absolute() {
        return Err(sys_err(
            "refuse magic-link traversal",
            subpath,
            Errno::ELOOP,
        ));
    }
    let ordered: Vec<u8> = target
        .as_os_str()
        .as_bytes()
        .iter()
        .copied()
        .filter(|b| matches!(b, b':' | b'[' | b']'))
        .collect();
    if ordered == b":[]" {
        return Err(sys_err(
            "refuse anon-inode link traversal",
            subpath,
            Errno::ELOOP,
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn link_targets_that_look_magic_are_rejected() {
        assert!(check_link_target(Path::new("/etc/passwd"), Path::new("x")).is_err());
        assert!(check_link_target(Path::new("pipe:[12345]"), Path::new("x")).is_err());
        assert!(check_link_target(Path::new("self/task"), Path::new("x")).is_ok());
        assert!(check_link_target(Path::new("1234"), Path::new("x")).is_ok());
    }
}
