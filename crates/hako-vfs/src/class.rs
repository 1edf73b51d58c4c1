//! The class contract every backend implements.
//!
//! A class is one backend kind (local disk, tar archives, a remote shell).
//! It is registered once with a [`VfsContext`](crate::VfsContext) and then
//! receives every operation on paths whose rightmost `#op` marker it claims.
//! Operations a backend lacks keep their default body, which fails with
//! [`VfsError::NotSupported`].
//!
//! Paths handed to a class are canonical absolute VFS paths, markers
//! included; the class splits them itself.

use bitflags::bitflags;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use crate::config::VfsConfig;
use crate::error::{VfsError, VfsResult};
use crate::interrupt::Interrupt;
use crate::stamp::Gc;
use crate::types::{ClassId, CtlOp, DirEntry, OpenFlags, SetCtl, Stat, VfsId};

bitflags! {
    /// Capability flags of a class.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ClassFlags: u32 {
        /// Operates directly on the host filesystem. Never stamped.
        const LOCAL = 1 << 0;
        /// Refuses every modification.
        const READ_ONLY = 1 << 1;
        /// File contents go through local temp copies.
        const USETMP = 1 << 2;
        /// Talks to a remote host; listings are loaded one directory at a time.
        const REMOTE = 1 << 3;
        /// Hard links cannot be created.
        const NO_HARDLINKS = 1 << 4;
    }
}

/// Which path resolver a generic class uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// The whole tree is known after opening the instance.
    Tree,
    /// Directories are listed on demand and expire.
    Linear,
}

/// Static description of a class.
#[derive(Debug, Clone)]
pub struct ClassInfo {
    /// Human readable name, used in logs.
    pub name: String,
    /// Marker prefix this class claims, e.g. `utar` for `/x.tar#utar/`.
    pub prefix: String,
    pub flags: ClassFlags,
}

impl ClassInfo {
    pub fn new(name: impl Into<String>, prefix: impl Into<String>, flags: ClassFlags) -> Self {
        Self {
            name: name.into(),
            prefix: prefix.into(),
            flags,
        }
    }

    /// Does a `#op` marker select this class?
    pub fn matches(&self, op: &str) -> bool {
        !self.prefix.is_empty() && op.starts_with(&self.prefix)
    }

    /// Classes with temp files or a remote side resolve linearly.
    pub fn strategy(&self) -> Strategy {
        if self.flags.intersects(ClassFlags::USETMP | ClassFlags::REMOTE) {
            Strategy::Linear
        } else {
            Strategy::Tree
        }
    }

    pub fn is_local(&self) -> bool {
        self.flags.contains(ClassFlags::LOCAL)
    }

    pub fn is_read_only(&self) -> bool {
        self.flags.contains(ClassFlags::READ_ONLY)
    }
}

/// Context-wide services handed to a class when it is registered.
#[derive(Clone)]
pub struct ClassEnv {
    /// This class's slot in the context.
    pub id: ClassId,
    pub gc: Gc,
    pub interrupt: Interrupt,
    pub config: Arc<VfsConfig>,
}

impl ClassEnv {
    /// Services for a class used on its own, outside any context.
    pub fn detached() -> Self {
        Self {
            id: ClassId(0),
            gc: Gc::new(),
            interrupt: Interrupt::new(),
            config: Arc::new(VfsConfig::default()),
        }
    }
}

/// The operation table of one backend kind.
pub trait VfsClass: Send + Sync {
    fn info(&self) -> &ClassInfo;

    /// Called once at registration.
    fn attach(&self, _env: ClassEnv) {}

    /// Does this class claim the `#op` marker `op`?
    fn which(&self, op: &str) -> bool {
        self.info().matches(op)
    }

    fn open(&self, _path: &str, _flags: OpenFlags, _mode: u32) -> VfsResult<Box<dyn VfsFile>> {
        Err(VfsError::NotSupported)
    }

    fn opendir(&self, _path: &str) -> VfsResult<Box<dyn VfsDir>> {
        Err(VfsError::NotSupported)
    }

    fn stat(&self, _path: &str) -> VfsResult<Stat> {
        Err(VfsError::NotSupported)
    }

    fn lstat(&self, _path: &str) -> VfsResult<Stat> {
        Err(VfsError::NotSupported)
    }

    fn readlink(&self, _path: &str) -> VfsResult<String> {
        Err(VfsError::NotSupported)
    }

    /// Check that `path` is an enterable directory.
    fn chdir(&self, _path: &str) -> VfsResult<()> {
        Err(VfsError::NotSupported)
    }

    fn chmod(&self, _path: &str, _mode: u32) -> VfsResult<()> {
        Err(VfsError::NotSupported)
    }

    fn chown(&self, _path: &str, _uid: Option<u32>, _gid: Option<u32>) -> VfsResult<()> {
        Err(VfsError::NotSupported)
    }

    fn utime(&self, _path: &str, _atime: SystemTime, _mtime: SystemTime) -> VfsResult<()> {
        Err(VfsError::NotSupported)
    }

    fn mknod(&self, _path: &str, _mode: u32, _dev: u64) -> VfsResult<()> {
        Err(VfsError::NotSupported)
    }

    /// Create `path` as a symlink pointing at `target`.
    fn symlink(&self, _target: &str, _path: &str) -> VfsResult<()> {
        Err(VfsError::NotSupported)
    }

    fn link(&self, _from: &str, _to: &str) -> VfsResult<()> {
        Err(VfsError::NotSupported)
    }

    fn rename(&self, _from: &str, _to: &str) -> VfsResult<()> {
        Err(VfsError::NotSupported)
    }

    fn unlink(&self, _path: &str) -> VfsResult<()> {
        Err(VfsError::NotSupported)
    }

    fn mkdir(&self, _path: &str, _mode: u32) -> VfsResult<()> {
        Err(VfsError::NotSupported)
    }

    fn rmdir(&self, _path: &str) -> VfsResult<()> {
        Err(VfsError::NotSupported)
    }

    /// The instance `path` lives in, if the class keeps instances.
    fn getid(&self, _path: &str) -> Option<VfsId> {
        None
    }

    /// True when no handle is open on the instance.
    fn nothingisopen(&self, _id: VfsId) -> bool {
        true
    }

    /// Drop the instance's state. Called by the GC.
    fn free(&self, _id: VfsId) {}

    /// A host path holding the contents of `path`.
    ///
    /// Classes that return `NotSupported` get the generic copy-out done by
    /// the context.
    fn getlocalcopy(&self, _path: &str) -> VfsResult<PathBuf> {
        Err(VfsError::NotSupported)
    }

    /// Give back a copy from [`getlocalcopy`](Self::getlocalcopy), storing it
    /// if `changed`.
    fn ungetlocalcopy(&self, _path: &str, _local: &Path, _changed: bool) -> VfsResult<()> {
        Err(VfsError::NotSupported)
    }

    /// Backend control. Returns whether the class understood `op`.
    fn setctl(&self, _path: &str, _op: &SetCtl) -> VfsResult<bool> {
        Ok(false)
    }

    /// Report every open instance as a VFS path.
    fn fill_names(&self, _out: &mut dyn FnMut(String)) {}

    /// The class's own errno for the last failure, if it keeps one.
    fn ferrno(&self) -> Option<i32> {
        None
    }

    /// Called once when the context shuts down.
    fn done(&self) {}
}

// Lets tests call `unwrap_err()` on `VfsResult<Box<dyn VfsFile>>`.
#[cfg(test)]
impl std::fmt::Debug for dyn VfsFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("VfsFile")
    }
}

/// An open file.
pub trait VfsFile: Send {
    fn read(&mut self, buf: &mut [u8]) -> VfsResult<usize>;

    fn write(&mut self, _buf: &[u8]) -> VfsResult<usize> {
        Err(VfsError::NotSupported)
    }

    fn lseek(&mut self, pos: SeekFrom) -> VfsResult<u64>;

    fn fstat(&mut self) -> VfsResult<Stat>;

    fn ctl(&mut self, _op: CtlOp) -> VfsResult<bool> {
        Ok(false)
    }

    fn close(self: Box<Self>) -> VfsResult<()>;
}

/// An open directory stream.
pub trait VfsDir: Send {
    fn readdir(&mut self) -> VfsResult<Option<DirEntry>>;

    /// Current position, if the stream can report one.
    fn telldir(&self) -> Option<usize> {
        None
    }

    fn seekdir(&mut self, _pos: usize) -> VfsResult<()> {
        Err(VfsError::NotSupported)
    }

    fn closedir(self: Box<Self>) -> VfsResult<()> {
        Ok(())
    }
}

/// A directory stream over a listing taken when it was opened.
#[derive(Debug)]
pub struct DirSnapshot {
    entries: Vec<DirEntry>,
    pos: usize,
}

impl DirSnapshot {
    pub fn new(entries: Vec<DirEntry>) -> Self {
        Self { entries, pos: 0 }
    }
}

impl VfsDir for DirSnapshot {
    fn readdir(&mut self) -> VfsResult<Option<DirEntry>> {
        let entry = self.entries.get(self.pos).cloned();
        if entry.is_some() {
            self.pos += 1;
        }
        Ok(entry)
    }

    fn telldir(&self) -> Option<usize> {
        Some(self.pos)
    }

    fn seekdir(&mut self, pos: usize) -> VfsResult<()> {
        self.pos = pos.min(self.entries.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy_from_flags() {
        let tar = ClassInfo::new("tar", "utar", ClassFlags::READ_ONLY);
        assert_eq!(tar.strategy(), Strategy::Tree);

        let sh = ClassInfo::new("shell", "sh", ClassFlags::REMOTE);
        assert_eq!(sh.strategy(), Strategy::Linear);

        let tmp = ClassInfo::new("extfs", "ext", ClassFlags::USETMP);
        assert_eq!(tmp.strategy(), Strategy::Linear);
    }

    #[test]
    fn test_prefix_match() {
        let sh = ClassInfo::new("shell", "sh", ClassFlags::REMOTE);
        assert!(sh.matches("sh:user@host"));
        assert!(!sh.matches("utar"));

        let local = ClassInfo::new("local", "", ClassFlags::LOCAL);
        assert!(!local.matches("anything"));
    }

    #[test]
    fn test_dir_snapshot_seek() {
        let mut dir = DirSnapshot::new(vec![DirEntry::new("a", 1), DirEntry::new("b", 2)]);
        assert_eq!(dir.readdir().unwrap().unwrap().name, "a");
        let pos = dir.telldir().unwrap();
        assert_eq!(dir.readdir().unwrap().unwrap().name, "b");
        assert!(dir.readdir().unwrap().is_none());
        dir.seekdir(pos).unwrap();
        assert_eq!(dir.readdir().unwrap().unwrap().name, "b");
    }
}
