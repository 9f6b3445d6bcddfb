//! Unified error types for the dirjail workspace.
//!
//! Every operation in the resolution engine returns a [`DirjailError`]
//! directly; there is no side-channel error retrieval. Callers that need to
//! branch programmatically should use [`DirjailError::kind`], which also
//! yields a classic errno value for each failure class via
//! [`ErrorKind::errno`].

use std::path::PathBuf;

use nix::errno::Errno;
use thiserror::Error;

/// Top-level error type shared across the workspace.
#[derive(Debug, Error)]
pub enum DirjailError {
    /// Resolution would have left the confinement root. This is always fatal
    /// to the operation and usually indicates an attack in progress.
    #[error("path {path} escapes the root: {description}")]
    EscapeDetected {
        /// Subpath that was being resolved.
        path: PathBuf,
        /// Description of how the escape was detected.
        description: String,
    },

    /// The symlink expansion ceiling was exceeded during a walk.
    #[error("too many levels of symbolic links while resolving {path}")]
    TooManySymlinks {
        /// Subpath that was being resolved.
        path: PathBuf,
    },

    /// A procfs subpath was rejected by the default safety mask.
    #[error("procfs path {path} is masked; use an unmasked handle to access it")]
    Masked {
        /// Subpath that was rejected.
        path: PathBuf,
    },

    /// A caller-supplied argument is malformed.
    #[error("invalid {name} argument: {description}")]
    InvalidArgument {
        /// Name of the offending argument.
        name: &'static str,
        /// Description of why it was rejected.
        description: String,
    },

    /// The requested operation is not supported by the kernel or the
    /// underlying filesystem.
    #[error("operation not supported: {description}")]
    Unsupported {
        /// Description of the missing support.
        description: String,
    },

    /// A syscall issued on behalf of the caller failed.
    #[error("{operation} failed for {path}: {source}")]
    Syscall {
        /// Syscall or resolution step that failed.
        operation: &'static str,
        /// Path the syscall was operating on, relative to its root.
        path: PathBuf,
        /// Errno reported by the kernel.
        source: Errno,
    },

    /// A descriptor-level I/O operation failed (duplication, metadata).
    #[error("{operation} failed: {source}")]
    Io {
        /// Operation that failed.
        operation: &'static str,
        /// Underlying I/O error.
        source: std::io::Error,
    },
}

/// Failure class of a [`DirjailError`], usable for programmatic handling.
///
/// This is similar in concept to [`std::io::ErrorKind`] but scoped to the
/// confinement contract: syscall errnos that encode a contract violation
/// (`EXDEV` from an in-kernel lookup, `ELOOP` from a symlink ceiling) are
/// folded into their dedicated kinds so both resolver backends report
/// identically.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorKind {
    /// Resolution would have left the confinement root.
    EscapeDetected,
    /// Symlink expansion ceiling exceeded.
    TooManySymlinks,
    /// A path component does not exist.
    NotFound,
    /// The target entry already exists.
    AlreadyExists,
    /// A non-directory was found where a directory was required.
    NotADirectory,
    /// The kernel denied access.
    PermissionDenied,
    /// The kernel or filesystem does not support the operation.
    Unsupported,
    /// A caller-supplied argument was malformed.
    InvalidArgument,
    /// A procfs subpath was rejected by the safety mask.
    Masked,
    /// Any other syscall failure, carrying the raw errno when known.
    Os(Option<i32>),
}

impl DirjailError {
    /// Returns the [`ErrorKind`] of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::EscapeDetected { .. } => ErrorKind::EscapeDetected,
            Self::TooManySymlinks { .. } => ErrorKind::TooManySymlinks,
            Self::Masked { .. } => ErrorKind::Masked,
            Self::InvalidArgument { .. } => ErrorKind::InvalidArgument,
            Self::Unsupported { .. } => ErrorKind::Unsupported,
            Self::Syscall { source, .. } => ErrorKind::from_errno(*source),
            Self::Io { source, .. } => ErrorKind::Os(source.raw_os_error()),
        }
    }

    /// Returns the errno equivalent of this error, if one exists.
    ///
    /// Shorthand for [`self.kind().errno()`](ErrorKind::errno).
    pub fn errno(&self) -> Option<i32> {
        self.kind().errno()
    }
}

impl ErrorKind {
    /// Classifies a raw syscall errno into an [`ErrorKind`].
    fn from_errno(errno: Errno) -> Self {
        match errno {
            Errno::ENOENT => Self::NotFound,
            Errno::EEXIST => Self::AlreadyExists,
            Errno::ENOTDIR => Self::NotADirectory,
            Errno::EACCES | Errno::EPERM => Self::PermissionDenied,
            // openat2(RESOLVE_IN_ROOT) reports attempted breakouts as EXDEV
            // and magic-links or symlink loops as ELOOP.
            Errno::EXDEV => Self::EscapeDetected,
            Errno::ELOOP => Self::TooManySymlinks,
            Errno::EOPNOTSUPP | Errno::ENOSYS => Self::Unsupported,
            other => Self::Os(Some(other as i32)),
        }
    }

    /// Returns a C-like errno for this [`ErrorKind`].
    ///
    /// Pure-Rust failure classes are mapped to the errno a kernel-side
    /// implementation of the same check would produce.
    pub fn errno(&self) -> Option<i32> {
        match self {
            Self::EscapeDetected => Some(libc::EXDEV),
            Self::TooManySymlinks => Some(libc::ELOOP),
            Self::NotFound => Some(libc::ENOENT),
            Self::AlreadyExists => Some(libc::EEXIST),
            Self::NotADirectory => Some(libc::ENOTDIR),
            Self::PermissionDenied | Self::Masked => Some(libc::EACCES),
            Self::Unsupported => Some(libc::ENOSYS),
            Self::InvalidArgument => Some(libc::EINVAL),
            Self::Os(errno) => *errno,
        }
    }

    /// Indicates whether the error was transient and the operation might
    /// succeed if retried by the caller.
    ///
    /// Escape detection is deliberately excluded: an escape is never safe
    /// to retry automatically.
    pub fn can_retry(&self) -> bool {
        matches!(self.errno(), Some(libc::EAGAIN) | Some(libc::EINTR))
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, DirjailError>;
