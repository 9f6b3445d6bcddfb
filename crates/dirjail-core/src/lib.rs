//! # dirjail-core
//!
//! Race-free resolution of paths confined to a directory tree.
//!
//! A [`Root`] is a handle to a confinement directory: every path a caller
//! supplies is resolved component by component relative to that directory,
//! and no concurrent rename, symlink swap, or magic-link trick can redirect
//! the walk outside of it. A successful resolution produces a [`Handle`],
//! an already-verified file descriptor that can be re-opened with new
//! access flags without repeating the walk.
//!
//! Two interchangeable resolver backends are provided:
//! - **Kernel-assisted**: a single `openat2(2)` call with in-kernel
//!   confinement enforcement (Linux 5.6+).
//! - **Emulated**: a userspace component walk built from `openat(2)`,
//!   `readlinkat(2)` and `fstatat(2)` with explicit symlink and ancestor
//!   tracking, used on older kernels or when selected explicitly.
//!
//! The same restricted walk also backs [`procfs::ProcfsHandle`], a safe
//! accessor for the kernel's process-information filesystem that treats
//! magic-links as opaque jumps instead of ordinary symlinks.
//!
//! ```no_run
//! use dirjail_core::Root;
//! use nix::fcntl::OFlag;
//!
//! # fn main() -> dirjail_common::error::Result<()> {
//! let root = Root::open("/srv/untrusted")?;
//! let file = root.resolve("uploads/../config/app.toml")?
//!     .reopen(OFlag::O_RDONLY)?;
//! # Ok(())
//! # }
//! ```

#![cfg(target_os = "linux")]

pub mod handle;
pub mod procfs;
pub mod root;

mod resolver;
mod sys;

pub use dirjail_common::config::{ResolverKind, RootConfig};
pub use dirjail_common::error::{DirjailError, ErrorKind, Result};
pub use handle::Handle;
pub use root::Root;
