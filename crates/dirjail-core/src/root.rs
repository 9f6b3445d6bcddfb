//! The confinement root and the operations anchored to it.
//!
//! Every operation takes a root-relative subpath; absolute subpaths are
//! reinterpreted as relative to the root, never the real filesystem root.
//! Mutations never hand the full subpath to a syscall: the parent
//! directory is resolved through the confined walker first, and the final
//! component is then created, linked, renamed or removed relative to that
//! verified parent descriptor.

use std::ffi::{OsStr, OsString};
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use dirjail_common::config::{ResolverKind, RootConfig};
use dirjail_common::error::{DirjailError, ErrorKind, Result};
use nix::errno::Errno;
use nix::fcntl::{OFlag, RenameFlags};
use nix::sys::stat::{Mode, SFlag};
use nix::unistd::UnlinkatFlags;

use crate::handle::Handle;
use crate::resolver::{self, PartialLookup, raw_components, split_final};
use crate::sys::{self, FileIdent, sys_err};

/// A directory tree that confines all path resolution.
///
/// The root descriptor is opened once at construction and never
/// re-resolved; renaming or bind-mounting the root directory afterwards
/// does not change what the `Root` refers to. Dropping the `Root` releases
/// the descriptor.
#[derive(Debug)]
pub struct Root {
    fd: OwnedFd,
    resolver: ResolverKind,
}

impl Root {
    /// Opens a confinement root at `path`.
    ///
    /// The resolver backend is auto-detected (kernel-assisted when the
    /// host supports `openat2(2)`), subject to the `DIRJAIL_RESOLVER`
    /// environment override.
    ///
    /// # Errors
    ///
    /// Returns an error if `path` cannot be opened as a directory. The
    /// path itself is trusted and resolved without confinement; it must
    /// not be attacker-controlled.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with(path, &RootConfig::from_env())
    }

    /// Opens a confinement root with an explicit configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if `path` cannot be opened as a directory.
    pub fn open_with(path: impl AsRef<Path>, config: &RootConfig) -> Result<Self> {
        let path = path.as_ref();
        let fd = nix::fcntl::open(
            path,
            OFlag::O_PATH | OFlag::O_DIRECTORY | OFlag::O_NOFOLLOW | OFlag::O_CLOEXEC,
            Mode::empty(),
        )
        .map_err(|errno| {
            // O_NOFOLLOW turns a symlink root path into ELOOP, which would
            // classify as a symlink-ceiling failure; the actual contract
            // violated is "the root must be a directory".
            let errno = if errno == Errno::ELOOP {
                Errno::ENOTDIR
            } else {
                errno
            };
            sys_err("open root directory", path, errno)
        })?;
        let root = Self::from_fd_with(fd, config);
        tracing::debug!(?path, resolver = ?root.resolver, "confinement root opened");
        Ok(root)
    }

    /// Wraps an already-opened directory descriptor as a confinement root.
    ///
    /// The descriptor should refer to a directory; operations will fail
    /// with `ENOTDIR` otherwise.
    pub fn from_fd(fd: OwnedFd) -> Self {
        Self::from_fd_with(fd, &RootConfig::from_env())
    }

    fn from_fd_with(fd: OwnedFd, config: &RootConfig) -> Self {
        let resolver = config.resolver.unwrap_or({
            if sys::openat2_supported() {
                ResolverKind::KernelAssisted
            } else {
                ResolverKind::Emulated
            }
        });
        Self { fd, resolver }
    }

    /// The resolver backend this root walks paths with.
    pub fn resolver(&self) -> ResolverKind {
        self.resolver
    }

    /// Duplicates the root.
    ///
    /// # Errors
    ///
    /// Returns an error if the descriptor cannot be duplicated.
    pub fn try_clone(&self) -> Result<Self> {
        Ok(Self {
            fd: sys::dup_fd(self.fd.as_fd())?,
            resolver: self.resolver,
        })
    }

    /// Resolves `subpath` inside the root, following a trailing symlink.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::EscapeDetected`] if any component redirects
    /// outside the root, [`ErrorKind::TooManySymlinks`] past the expansion
    /// ceiling, and the usual lookup errors otherwise.
    pub fn resolve(&self, subpath: impl AsRef<Path>) -> Result<Handle> {
        resolver::resolve(self.resolver, self.fd.as_fd(), subpath.as_ref(), true)
            .map(Handle::from_fd)
    }

    /// Resolves `subpath` without following a trailing symlink.
    ///
    /// A trailing symlink yields a handle to the link itself, which can
    /// only be re-opened with `O_PATH`.
    ///
    /// # Errors
    ///
    /// As for [`resolve`](Self::resolve).
    pub fn resolve_nofollow(&self, subpath: impl AsRef<Path>) -> Result<Handle> {
        resolver::resolve(self.resolver, self.fd.as_fd(), subpath.as_ref(), false)
            .map(Handle::from_fd)
    }

    /// Creates and opens a file at `subpath`.
    ///
    /// `O_CREAT|O_NOFOLLOW` are implied; `perm` applies only when the file
    /// is newly created. Pass `O_EXCL` to insist on creating it.
    ///
    /// # Errors
    ///
    /// Returns lookup errors for the parent walk and the open(2) errors
    /// for the final component.
    pub fn creat(&self, subpath: impl AsRef<Path>, flags: OFlag, perm: Mode) -> Result<Handle> {
        let subpath = subpath.as_ref();
        let (dirfd, name) = self.resolve_parent(subpath)?;
        let flags = flags | OFlag::O_CREAT | OFlag::O_NOFOLLOW | OFlag::O_CLOEXEC;
        nix::fcntl::openat(&dirfd, name.as_os_str(), flags, perm)
            .map(Handle::from_fd)
            .map_err(|errno| sys_err("create file", subpath, errno))
    }

    /// Creates a directory at `subpath`.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::AlreadyExists`] if the entry exists, plus the
    /// usual parent lookup errors.
    pub fn mkdir(&self, subpath: impl AsRef<Path>, perm: Mode) -> Result<()> {
        let subpath = subpath.as_ref();
        let (dirfd, name) = self.resolve_parent(subpath)?;
        nix::sys::stat::mkdirat(&dirfd, name.as_os_str(), perm)
            .map_err(|errno| sys_err("create directory", subpath, errno))
    }

    /// Creates `subpath` and any missing ancestors, like `mkdir -p`.
    ///
    /// The existing prefix is resolved through the confined walker; each
    /// missing component is then created and re-verified (directory,
    /// matching directory entry, owned by the calling user) before the
    /// walk descends into it, so an attacker who swaps in a directory of
    /// their own cannot have the remainder of the tree created inside it.
    ///
    /// Idempotent when the full path already exists as a directory. If a
    /// concurrent writer creates components mid-flight, their directories
    /// are reused exactly as an existing prefix would be.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for set-id bits in `perm`, `ENOTDIR` when
    /// an existing component is not a directory, and
    /// [`ErrorKind::EscapeDetected`] when a freshly created directory
    /// fails re-verification.
    pub fn mkdir_all(&self, subpath: impl AsRef<Path>, perm: Mode) -> Result<Handle> {
        let subpath = subpath.as_ref();
        if perm.intersects(Mode::S_ISUID | Mode::S_ISGID) {
            return Err(DirjailError::InvalidArgument {
                name: "perm",
                description: format!("set-id bits are not allowed for mkdir_all ({perm:?})"),
            });
        }

        let lookup =
            resolver::resolve_partial(self.resolver, self.fd.as_fd(), subpath, true)?;
        let (mut current, remaining) = match lookup {
            PartialLookup::Complete(fd) => {
                let stat = nix::sys::stat::fstat(&fd)
                    .map_err(|errno| sys_err("fstat existing directory", subpath, errno))?;
                if !sys::is_dir(&stat) {
                    return Err(sys_err("create directory tree", subpath, Errno::ENOTDIR));
                }
                return Ok(Handle::from_fd(fd));
            }
            PartialLookup::Partial {
                handle,
                remaining,
                last_error,
            } => {
                if last_error.kind() != ErrorKind::NotFound {
                    return Err(last_error);
                }
                (handle, remaining)
            }
        };

        let parts: Vec<OsString> = raw_components(remaining.as_os_str())
            .into_iter()
            .filter(|part| !part.is_empty() && part.as_bytes() != b".")
            .collect();
        // ".." in the unresolved remainder means a missing component was
        // followed by an upward step; there is nothing to climb out of, the
        // same shape mkdir -p fails on.
        if parts.iter().any(|part| part.as_bytes() == b"..") {
            return Err(sys_err("create directory tree", subpath, Errno::ENOENT));
        }

        let euid = nix::unistd::geteuid();
        for part in parts {
            let created =
                match nix::sys::stat::mkdirat(&current, part.as_os_str(), perm) {
                    Ok(()) => true,
                    // Lost a race with a concurrent creator; use theirs.
                    Err(Errno::EEXIST) => false,
                    Err(errno) => {
                        return Err(sys_err("create directory component", subpath, errno));
                    }
                };

            let next = nix::fcntl::openat(
                &current,
                part.as_os_str(),
                OFlag::O_PATH | OFlag::O_DIRECTORY | OFlag::O_NOFOLLOW | OFlag::O_CLOEXEC,
                Mode::empty(),
            )
            .map_err(|errno| sys_err("open created directory", subpath, errno))?;

            if created {
                let stat = nix::sys::stat::fstat(&next)
                    .map_err(|errno| sys_err("fstat created directory", subpath, errno))?;
                let entry = nix::sys::stat::fstatat(
                    &current,
                    part.as_os_str(),
                    nix::fcntl::AtFlags::AT_SYMLINK_NOFOLLOW,
                )
                .map_err(|errno| sys_err("verify created directory", subpath, errno))?;
                if FileIdent::from(&entry) != FileIdent::from(&stat) {
                    return Err(DirjailError::EscapeDetected {
                        path: subpath.into(),
                        description: format!(
                            "created directory {part:?} was swapped before it could be entered"
                        ),
                    });
                }
                if stat.st_uid != euid.as_raw() {
                    return Err(DirjailError::EscapeDetected {
                        path: subpath.into(),
                        description: format!(
                            "created directory {part:?} is owned by another user"
                        ),
                    });
                }
            }
            current = next;
        }
        Ok(Handle::from_fd(current))
    }

    /// Creates a filesystem node at `subpath`.
    ///
    /// `kind` must be one of `S_IFREG`, `S_IFCHR`, `S_IFBLK`, `S_IFIFO` or
    /// `S_IFSOCK`; `dev` is only meaningful for device nodes.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for other kinds, plus the usual parent
    /// lookup and mknod(2) errors.
    pub fn mknod(
        &self,
        subpath: impl AsRef<Path>,
        kind: SFlag,
        perm: Mode,
        dev: u64,
    ) -> Result<()> {
        let subpath = subpath.as_ref();
        let creatable = [
            SFlag::S_IFREG,
            SFlag::S_IFCHR,
            SFlag::S_IFBLK,
            SFlag::S_IFIFO,
            SFlag::S_IFSOCK,
        ];
        if !creatable.contains(&kind) {
            return Err(DirjailError::InvalidArgument {
                name: "kind",
                description: format!("{kind:?} cannot be created with mknod"),
            });
        }
        let (dirfd, name) = self.resolve_parent(subpath)?;
        nix::sys::stat::mknodat(&dirfd, name.as_os_str(), kind, perm, dev)
            .map_err(|errno| sys_err("create filesystem node", subpath, errno))
    }

    /// Creates a hard link at `linkname` pointing to the existing entry at
    /// `target`, with `link(2)` argument order.
    ///
    /// A trailing symlink at `target` is linked as the symlink itself, not
    /// its referent.
    ///
    /// # Errors
    ///
    /// Returns lookup errors for either parent walk and the link(2)
    /// errors.
    pub fn hardlink(&self, target: impl AsRef<Path>, linkname: impl AsRef<Path>) -> Result<()> {
        let target = target.as_ref();
        let linkname = linkname.as_ref();
        let (old_dir, old_name) = self.resolve_parent(target)?;
        let (new_dir, new_name) = self.resolve_parent(linkname)?;
        nix::unistd::linkat(
            &old_dir,
            old_name.as_os_str(),
            &new_dir,
            new_name.as_os_str(),
            nix::fcntl::AtFlags::empty(),
        )
        .map_err(|errno| sys_err("create hard link", linkname, errno))
    }

    /// Creates a symlink at `linkname` whose target is the verbatim string
    /// `target`, with `symlink(2)` argument order.
    ///
    /// The target is not resolved or validated at creation time; it is
    /// confined like any other component whenever a later walk traverses
    /// it.
    ///
    /// # Errors
    ///
    /// Returns lookup errors for the parent walk and the symlink(2)
    /// errors.
    pub fn symlink(&self, target: impl AsRef<Path>, linkname: impl AsRef<Path>) -> Result<()> {
        let linkname = linkname.as_ref();
        let (dirfd, name) = self.resolve_parent(linkname)?;
        nix::unistd::symlinkat(target.as_ref(), &dirfd, name.as_os_str())
            .map_err(|errno| sys_err("create symlink", linkname, errno))
    }

    /// Removes the non-directory entry at `subpath`.
    ///
    /// # Errors
    ///
    /// `EISDIR` for directories, plus parent lookup errors.
    pub fn unlink(&self, subpath: impl AsRef<Path>) -> Result<()> {
        self.remove_entry(subpath.as_ref(), UnlinkatFlags::NoRemoveDir)
    }

    /// Removes the empty directory at `subpath`.
    ///
    /// # Errors
    ///
    /// `ENOTDIR` for non-directories, `ENOTEMPTY` for non-empty ones, plus
    /// parent lookup errors.
    pub fn rmdir(&self, subpath: impl AsRef<Path>) -> Result<()> {
        self.remove_entry(subpath.as_ref(), UnlinkatFlags::RemoveDir)
    }

    fn remove_entry(&self, subpath: &Path, flags: UnlinkatFlags) -> Result<()> {
        let (dirfd, name) = self.resolve_parent(subpath)?;
        nix::unistd::unlinkat(&dirfd, name.as_os_str(), flags)
            .map_err(|errno| sys_err("remove entry", subpath, errno))
    }

    /// Removes `subpath` and everything below it, like `rm -rf`.
    ///
    /// The descent never leaves the root: each level is opened with
    /// `O_NOFOLLOW` relative to its verified parent. Entries vanishing
    /// concurrently are tolerated, and an already-missing `subpath`
    /// succeeds.
    ///
    /// # Errors
    ///
    /// Returns parent lookup errors and any removal error other than
    /// `ENOENT`.
    pub fn remove_all(&self, subpath: impl AsRef<Path>) -> Result<()> {
        let subpath = subpath.as_ref();
        let (dirfd, name) = match self.resolve_parent(subpath) {
            Ok(resolved) => resolved,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err),
        };
        self.remove_all_inner(dirfd.as_fd(), &name, subpath)
    }

    fn remove_all_inner(
        &self,
        dirfd: BorrowedFd<'_>,
        name: &OsStr,
        subpath: &Path,
    ) -> Result<()> {
        // Fast path: files, symlinks and empty directories go in one call.
        match nix::unistd::unlinkat(dirfd, name, UnlinkatFlags::NoRemoveDir) {
            Ok(()) | Err(Errno::ENOENT) => return Ok(()),
            Err(Errno::EISDIR) => {}
            Err(errno) => return Err(sys_err("remove entry", subpath, errno)),
        }
        match nix::unistd::unlinkat(dirfd, name, UnlinkatFlags::RemoveDir) {
            Ok(()) | Err(Errno::ENOENT) => return Ok(()),
            Err(Errno::ENOTEMPTY | Errno::EEXIST) => {}
            Err(errno) => return Err(sys_err("remove directory", subpath, errno)),
        }

        let subdir = match nix::fcntl::openat(
            dirfd,
            name,
            OFlag::O_RDONLY | OFlag::O_DIRECTORY | OFlag::O_NOFOLLOW | OFlag::O_CLOEXEC,
            Mode::empty(),
        ) {
            Ok(fd) => fd,
            Err(Errno::ENOENT) => return Ok(()),
            Err(errno) => return Err(sys_err("open directory for removal", subpath, errno)),
        };

        // Concurrent writers may repopulate the directory while it is being
        // emptied; re-read it until a pass finds nothing left.
        loop {
            let mut dir = nix::dir::Dir::openat(
                &subdir,
                ".",
                OFlag::O_RDONLY | OFlag::O_CLOEXEC,
                Mode::empty(),
            )
            .map_err(|errno| sys_err("reopen directory for removal", subpath, errno))?;

            let mut emptied = true;
            for entry in dir.iter() {
                let entry =
                    entry.map_err(|errno| sys_err("read directory entry", subpath, errno))?;
                let child = entry.file_name().to_bytes();
                if child == b"." || child == b".." {
                    continue;
                }
                emptied = false;
                self.remove_all_inner(subdir.as_fd(), OsStr::from_bytes(child), subpath)?;
            }
            if emptied {
                break;
            }
        }

        match nix::unistd::unlinkat(dirfd, name, UnlinkatFlags::RemoveDir) {
            Ok(()) | Err(Errno::ENOENT) => Ok(()),
            Err(errno) => Err(sys_err("remove directory", subpath, errno)),
        }
    }

    /// Reads the target of the symlink at `subpath`.
    ///
    /// # Errors
    ///
    /// `EINVAL` when the entry is not a symlink, plus the usual lookup
    /// errors.
    pub fn readlink(&self, subpath: impl AsRef<Path>) -> Result<PathBuf> {
        let subpath = subpath.as_ref();
        let linkfd = resolver::resolve(self.resolver, self.fd.as_fd(), subpath, false)?;
        nix::fcntl::readlinkat(&linkfd, "")
            .map(PathBuf::from)
            .map_err(|errno| sys_err("read symlink target", subpath, errno))
    }

    /// Renames `src` to `dst` inside the root with `renameat2(2)`.
    ///
    /// `RENAME_NOREPLACE`, `RENAME_EXCHANGE` and `RENAME_WHITEOUT` are
    /// passed through; combining EXCHANGE with WHITEOUT is invalid by
    /// contract.
    ///
    /// # Errors
    ///
    /// The error rules are those of `renameat2(2)`: a filesystem that
    /// reports `EOPNOTSUPP`/`ENOSYS` for the requested flags classifies as
    /// [`ErrorKind::Unsupported`], while `EINVAL` is passed through
    /// unchanged because the kernel uses it both for unsupported flags and
    /// for genuinely invalid renames (such as moving a directory into its
    /// own subtree). Lookup errors for both parent walks are reported as
    /// usual.
    pub fn rename(
        &self,
        src: impl AsRef<Path>,
        dst: impl AsRef<Path>,
        rflags: RenameFlags,
    ) -> Result<()> {
        let src = src.as_ref();
        let dst = dst.as_ref();
        if rflags.contains(RenameFlags::RENAME_EXCHANGE | RenameFlags::RENAME_WHITEOUT) {
            return Err(DirjailError::InvalidArgument {
                name: "rflags",
                description: "RENAME_EXCHANGE and RENAME_WHITEOUT cannot be combined".into(),
            });
        }
        let (src_dir, src_name) = self.resolve_parent(src)?;
        let (dst_dir, dst_name) = self.resolve_parent(dst)?;
        nix::fcntl::renameat2(
            &src_dir,
            src_name.as_os_str(),
            &dst_dir,
            dst_name.as_os_str(),
            rflags,
        )
        .map_err(|errno| sys_err("rename entry", src, errno))
    }

    /// Resolves the lexical parent of `subpath` through the confined
    /// walker, returning the verified parent descriptor and the final
    /// component name.
    fn resolve_parent(&self, subpath: &Path) -> Result<(OwnedFd, OsString)> {
        let (parent, name) = split_final(subpath)?;
        let dirfd = resolver::resolve(self.resolver, self.fd.as_fd(), &parent, true)?;
        Ok((dirfd, name))
    }
}

impl AsFd for Root {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}
