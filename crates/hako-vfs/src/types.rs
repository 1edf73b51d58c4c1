//! Core VFS types.
//!
//! `Stat` mirrors the POSIX stat record. Inode numbers are only meaningful
//! inside one cached superblock.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::SystemTime;

/// File type mask.
pub const S_IFMT: u32 = 0o170000;
/// Socket.
pub const S_IFSOCK: u32 = 0o140000;
/// Symbolic link.
pub const S_IFLNK: u32 = 0o120000;
/// Regular file.
pub const S_IFREG: u32 = 0o100000;
/// Block device.
pub const S_IFBLK: u32 = 0o060000;
/// Directory.
pub const S_IFDIR: u32 = 0o040000;
/// Character device.
pub const S_IFCHR: u32 = 0o020000;
/// FIFO.
pub const S_IFIFO: u32 = 0o010000;

/// File type enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileType {
    /// Regular file.
    File,
    /// Directory.
    Directory,
    /// Symbolic link.
    Symlink,
    /// Character device.
    CharDevice,
    /// Block device.
    BlockDevice,
    /// Named pipe.
    Fifo,
    /// Unix socket.
    Socket,
}

impl FileType {
    /// Decode the type bits of a mode. Unknown types read as regular files.
    pub fn from_mode(mode: u32) -> Self {
        match mode & S_IFMT {
            S_IFDIR => FileType::Directory,
            S_IFLNK => FileType::Symlink,
            S_IFCHR => FileType::CharDevice,
            S_IFBLK => FileType::BlockDevice,
            S_IFIFO => FileType::Fifo,
            S_IFSOCK => FileType::Socket,
            _ => FileType::File,
        }
    }

    /// The `S_IF*` bits for this type.
    pub fn mode_bits(&self) -> u32 {
        match self {
            FileType::File => S_IFREG,
            FileType::Directory => S_IFDIR,
            FileType::Symlink => S_IFLNK,
            FileType::CharDevice => S_IFCHR,
            FileType::BlockDevice => S_IFBLK,
            FileType::Fifo => S_IFIFO,
            FileType::Socket => S_IFSOCK,
        }
    }

    /// Returns true if this is a regular file.
    pub fn is_file(&self) -> bool {
        matches!(self, FileType::File)
    }

    /// Returns true if this is a directory.
    pub fn is_dir(&self) -> bool {
        matches!(self, FileType::Directory)
    }

    /// Returns true if this is a symbolic link.
    pub fn is_symlink(&self) -> bool {
        matches!(self, FileType::Symlink)
    }
}

/// The stat-equivalent record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stat {
    pub dev: u64,
    pub ino: u64,
    /// Type and permission bits.
    pub mode: u32,
    /// For cached inodes this is the cache retain count, not POSIX nlink.
    pub nlink: u64,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u64,
    pub size: u64,
    pub blksize: u64,
    pub blocks: u64,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
}

impl Default for Stat {
    fn default() -> Self {
        Self {
            dev: 0,
            ino: 0,
            mode: 0,
            nlink: 0,
            uid: 0,
            gid: 0,
            rdev: 0,
            size: 0,
            blksize: 512,
            blocks: 0,
            atime: SystemTime::UNIX_EPOCH,
            mtime: SystemTime::UNIX_EPOCH,
            ctime: SystemTime::UNIX_EPOCH,
        }
    }
}

impl Stat {
    /// Attributes for a new regular file.
    pub fn file(size: u64, perm: u32) -> Self {
        let now = SystemTime::now();
        Self {
            mode: S_IFREG | (perm & 0o7777),
            size,
            blocks: size.div_ceil(512),
            atime: now,
            mtime: now,
            ctime: now,
            ..Default::default()
        }
    }

    /// Attributes for a new directory.
    pub fn directory(perm: u32) -> Self {
        let now = SystemTime::now();
        Self {
            mode: S_IFDIR | (perm & 0o7777),
            atime: now,
            mtime: now,
            ctime: now,
            ..Default::default()
        }
    }

    /// Attributes for a symlink to a target of `target_len` bytes.
    pub fn symlink(target_len: u64) -> Self {
        let now = SystemTime::now();
        Self {
            mode: S_IFLNK | 0o777,
            size: target_len,
            atime: now,
            mtime: now,
            ctime: now,
            ..Default::default()
        }
    }

    pub fn kind(&self) -> FileType {
        FileType::from_mode(self.mode)
    }

    /// Permission bits only.
    pub fn perm(&self) -> u32 {
        self.mode & 0o7777
    }

    pub fn is_file(&self) -> bool {
        self.kind().is_file()
    }

    pub fn is_dir(&self) -> bool {
        self.kind().is_dir()
    }

    pub fn is_symlink(&self) -> bool {
        self.kind().is_symlink()
    }
}

/// Directory entry: a name plus an inode-number hint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    /// Entry name (not full path).
    pub name: String,
    pub ino: u64,
}

impl DirEntry {
    /// Create a new directory entry.
    pub fn new(name: impl Into<String>, ino: u64) -> Self {
        Self {
            name: name.into(),
            ino,
        }
    }
}

/// Open file flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenFlags {
    /// Read access requested.
    pub read: bool,
    /// Write access requested.
    pub write: bool,
    /// Append mode.
    pub append: bool,
    /// Create if not exists.
    pub create: bool,
    /// Truncate on open.
    pub truncate: bool,
    /// Exclusive create (fail if exists).
    pub exclusive: bool,
    /// Ask for a streaming, non-seekable read if the class supports one.
    pub linear: bool,
}

impl Default for OpenFlags {
    fn default() -> Self {
        Self {
            read: true,
            write: false,
            append: false,
            create: false,
            truncate: false,
            exclusive: false,
            linear: false,
        }
    }
}

impl OpenFlags {
    /// Read-only access.
    pub fn read() -> Self {
        Self::default()
    }

    /// Read-only streaming access.
    pub fn read_linear() -> Self {
        Self {
            linear: true,
            ..Default::default()
        }
    }

    /// Write access (also enables read).
    pub fn write() -> Self {
        Self {
            read: true,
            write: true,
            ..Default::default()
        }
    }

    /// Create with write access.
    pub fn create() -> Self {
        Self {
            read: true,
            write: true,
            create: true,
            ..Default::default()
        }
    }

    /// Create exclusively (fail if exists).
    pub fn create_exclusive() -> Self {
        Self {
            exclusive: true,
            ..Self::create()
        }
    }

    /// Create and truncate.
    pub fn create_truncate() -> Self {
        Self {
            truncate: true,
            ..Self::create()
        }
    }

    /// True if the open may modify the file.
    pub fn wants_write(&self) -> bool {
        self.write || self.append || self.truncate
    }
}

/// Backend control operations issued by path (`setctl`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SetCtl {
    /// Force the next freshness check on this instance to fail.
    Flush,
    /// Keep serving cached data even when it may be stale.
    StaleData(bool),
    /// Write protocol chatter to this file.
    LogFile(PathBuf),
}

/// Per-handle control operations (`ctl`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CtlOp {
    /// Would a read block? Answered `false` by classes that do not know.
    IsNotReady,
}

/// Opaque identifier of one backend instance, used by the GC hooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VfsId(pub u64);

/// Index of a registered class inside one `VfsContext`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClassId(pub usize);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_type_from_mode() {
        assert_eq!(FileType::from_mode(S_IFDIR | 0o755), FileType::Directory);
        assert_eq!(FileType::from_mode(S_IFLNK | 0o777), FileType::Symlink);
        assert_eq!(FileType::from_mode(S_IFCHR), FileType::CharDevice);
        assert_eq!(FileType::from_mode(0o644), FileType::File);
        assert_eq!(FileType::Fifo.mode_bits(), S_IFIFO);
    }

    #[test]
    fn test_stat_constructors() {
        let file = Stat::file(1024, 0o644);
        assert!(file.is_file());
        assert_eq!(file.size, 1024);
        assert_eq!(file.perm(), 0o644);
        assert_eq!(file.blocks, 2);

        let dir = Stat::directory(0o755);
        assert!(dir.is_dir());
        assert_eq!(dir.perm(), 0o755);
        assert_eq!(dir.nlink, 0);

        assert!(Stat::symlink(4).is_symlink());
    }

    #[test]
    fn test_open_flags() {
        let read = OpenFlags::read();
        assert!(read.read);
        assert!(!read.wants_write());

        let create = OpenFlags::create_exclusive();
        assert!(create.create);
        assert!(create.exclusive);
        assert!(create.wants_write());

        assert!(OpenFlags::read_linear().linear);
    }
}
