//! # hako-vfs
//!
//! A virtual filesystem in the Midnight Commander mould: paths such as
//! `/home/me/src.tar#utar/dir/file.c` reach into archives and remote hosts
//! through pluggable classes.
//!
//! Key components:
//!
//! - [`VfsContext`] - The facade: routing, handles, current directory
//! - [`VfsClass`] - The operation table every backend implements
//! - [`DirCache`] - Generic class over an in-memory inode/entry tree, driven
//!   by a [`Subclass`] that knows how to read one kind of archive or host
//! - [`Gc`] - Stamps idle instances and frees them after a timeout
//! - [`LocalFs`], [`MemFs`], [`TarFs`] - Built-in classes
//!
//! ## Design Decisions
//!
//! - **Markers, not mounts**: the rightmost `#op` a registered class claims
//!   decides the class. Unclaimed markers are ordinary name characters.
//! - **Instances are shared**: every path into the same archive uses one
//!   superblock until the GC frees it.
//! - **Two resolvers**: archives known in full walk the tree; remote and
//!   temp-file classes load one directory at a time and let it expire.

pub mod backends;
mod class;
mod config;
mod context;
pub mod direntry;
mod error;
mod interrupt;
pub mod listing;
pub mod path;
mod stamp;
mod types;

pub use backends::{LocalFs, MemFs, MemoryBackend, TarArchive, TarFs};
pub use class::{
    ClassEnv, ClassFlags, ClassInfo, DirSnapshot, Strategy, VfsClass, VfsDir, VfsFile,
};
pub use config::VfsConfig;
pub use context::{DirHandle, Fd, VfsContext};
pub use direntry::{DirCache, Subclass};
pub use error::{VfsError, VfsResult};
pub use interrupt::Interrupt;
pub use stamp::{EXPIRE_INTERVAL, Gc, Stamp};
pub use types::{
    ClassId, CtlOp, DirEntry, FileType, OpenFlags, S_IFBLK, S_IFCHR, S_IFDIR, S_IFIFO, S_IFLNK,
    S_IFMT, S_IFREG, S_IFSOCK, SetCtl, Stat, VfsId,
};
