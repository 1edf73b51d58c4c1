//! Local filesystem class.
//!
//! The fallback class: every path without a claimed `#op` marker lands
//! here. Operations map straight onto the host filesystem, optionally jailed
//! under a root directory so that `..` and symlinks cannot escape it.

use std::fs::{self, DirBuilder, File, FileTimes, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::fs::{DirBuilderExt, DirEntryExt, MetadataExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::class::{ClassFlags, ClassInfo, DirSnapshot, VfsClass, VfsDir, VfsFile};
use crate::error::{VfsError, VfsResult};
use crate::types::{DirEntry, OpenFlags, Stat};

/// The host filesystem.
///
/// Without a root, VFS paths are host paths. With one, `/src/main.rs`
/// reads `<root>/src/main.rs` and anything resolving outside the root is
/// refused.
#[derive(Debug, Clone)]
pub struct LocalFs {
    info: ClassInfo,
    root: Option<PathBuf>,
}

impl Default for LocalFs {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalFs {
    pub fn new() -> Self {
        Self {
            info: ClassInfo::new("local", "", ClassFlags::LOCAL),
            root: None,
        }
    }

    /// Jail every path under `root`.
    ///
    /// The root is canonicalized up front to handle symlinked temp dirs
    /// (e.g. macOS `/tmp` → `/private/tmp`).
    pub fn jailed(root: impl Into<PathBuf>) -> Self {
        let root: PathBuf = root.into();
        let root = root.canonicalize().unwrap_or(root);
        Self {
            info: ClassInfo::new("local", "", ClassFlags::LOCAL),
            root: Some(root),
        }
    }

    /// A jailed view that refuses every modification.
    pub fn read_only(root: impl Into<PathBuf>) -> Self {
        let mut fs = Self::jailed(root);
        fs.info.flags |= ClassFlags::READ_ONLY;
        fs
    }

    pub fn root(&self) -> Option<&Path> {
        self.root.as_deref()
    }

    /// Map a VFS path to a host path.
    ///
    /// With `follow`, an existing final segment is resolved through
    /// symlinks before the escape check; otherwise only its parent is.
    fn host_path(&self, path: &str, follow: bool) -> VfsResult<PathBuf> {
        let Some(root) = &self.root else {
            return Ok(PathBuf::from(path));
        };

        let relative = path.trim_start_matches('/');
        if relative.is_empty() {
            return Ok(root.clone());
        }
        let full = root.join(relative);

        let canonical = if follow && full.exists() {
            full.canonicalize()
                .map_err(|e| VfsError::from_io(e, path))?
        } else {
            let parent = full.parent().ok_or_else(|| VfsError::invalid_path(path))?;
            let name = full.file_name().ok_or_else(|| VfsError::invalid_path(path))?;
            if parent.exists() {
                parent
                    .canonicalize()
                    .map_err(|e| VfsError::from_io(e, path))?
                    .join(name)
            } else {
                // Fails on the actual operation.
                full
            }
        };

        if !canonical.starts_with(root) {
            return Err(VfsError::path_escapes_root(format!(
                "{} is not under {}",
                canonical.display(),
                root.display()
            )));
        }
        Ok(canonical)
    }

    fn check_writable(&self) -> VfsResult<()> {
        if self.info.is_read_only() {
            Err(VfsError::ReadOnly)
        } else {
            Ok(())
        }
    }
}

fn io_err(path: &str) -> impl FnOnce(std::io::Error) -> VfsError + '_ {
    move |e| VfsError::from_io(e, path)
}

fn time_of(secs: i64, nsecs: i64) -> SystemTime {
    let nsecs = Duration::from_nanos(nsecs.clamp(0, 999_999_999) as u64);
    if secs >= 0 {
        UNIX_EPOCH + Duration::from_secs(secs as u64) + nsecs
    } else {
        UNIX_EPOCH - Duration::from_secs(secs.unsigned_abs()) + nsecs
    }
}

/// Convert host metadata into a VFS stat record.
pub fn stat_from_metadata(meta: &fs::Metadata) -> Stat {
    Stat {
        dev: meta.dev(),
        ino: meta.ino(),
        mode: meta.mode(),
        nlink: meta.nlink(),
        uid: meta.uid(),
        gid: meta.gid(),
        rdev: meta.rdev(),
        size: meta.size(),
        blksize: meta.blksize(),
        blocks: meta.blocks(),
        atime: time_of(meta.atime(), meta.atime_nsec()),
        mtime: time_of(meta.mtime(), meta.mtime_nsec()),
        ctime: time_of(meta.ctime(), meta.ctime_nsec()),
    }
}

impl VfsClass for LocalFs {
    fn info(&self) -> &ClassInfo {
        &self.info
    }

    fn open(&self, path: &str, flags: OpenFlags, mode: u32) -> VfsResult<Box<dyn VfsFile>> {
        if flags.create || flags.wants_write() {
            self.check_writable()?;
        }
        let host = self.host_path(path, true)?;
        let mut options = OpenOptions::new();
        options
            .read(flags.read || !flags.wants_write())
            .write(flags.write)
            .append(flags.append)
            .truncate(flags.truncate)
            .mode(mode);
        if flags.create && flags.exclusive {
            options.create_new(true);
        } else {
            options.create(flags.create);
        }
        let file = options.open(&host).map_err(io_err(path))?;
        if file.metadata().map_err(io_err(path))?.is_dir() {
            return Err(VfsError::is_a_directory(path));
        }
        Ok(Box::new(LocalFile {
            file,
            path: path.to_string(),
        }))
    }

    fn opendir(&self, path: &str) -> VfsResult<Box<dyn VfsDir>> {
        let host = self.host_path(path, true)?;
        let mut entries = Vec::new();
        for entry in fs::read_dir(&host).map_err(io_err(path))? {
            let entry = entry.map_err(io_err(path))?;
            entries.push(DirEntry::new(
                entry.file_name().to_string_lossy().into_owned(),
                entry.ino(),
            ));
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(Box::new(DirSnapshot::new(entries)))
    }

    fn stat(&self, path: &str) -> VfsResult<Stat> {
        let host = self.host_path(path, true)?;
        let meta = fs::metadata(&host).map_err(io_err(path))?;
        Ok(stat_from_metadata(&meta))
    }

    fn lstat(&self, path: &str) -> VfsResult<Stat> {
        let host = self.host_path(path, false)?;
        let meta = fs::symlink_metadata(&host).map_err(io_err(path))?;
        Ok(stat_from_metadata(&meta))
    }

    fn readlink(&self, path: &str) -> VfsResult<String> {
        let host = self.host_path(path, false)?;
        match fs::read_link(&host) {
            Ok(target) => Ok(target.to_string_lossy().into_owned()),
            Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => {
                Err(VfsError::NotASymlink(path.to_string()))
            }
            Err(e) => Err(VfsError::from_io(e, path)),
        }
    }

    fn chdir(&self, path: &str) -> VfsResult<()> {
        let host = self.host_path(path, true)?;
        if fs::metadata(&host).map_err(io_err(path))?.is_dir() {
            Ok(())
        } else {
            Err(VfsError::not_a_directory(path))
        }
    }

    fn chmod(&self, path: &str, mode: u32) -> VfsResult<()> {
        self.check_writable()?;
        let host = self.host_path(path, true)?;
        fs::set_permissions(&host, fs::Permissions::from_mode(mode & 0o7777)).map_err(io_err(path))
    }

    fn chown(&self, path: &str, uid: Option<u32>, gid: Option<u32>) -> VfsResult<()> {
        self.check_writable()?;
        let host = self.host_path(path, true)?;
        std::os::unix::fs::chown(&host, uid, gid).map_err(io_err(path))
    }

    fn utime(&self, path: &str, atime: SystemTime, mtime: SystemTime) -> VfsResult<()> {
        self.check_writable()?;
        let host = self.host_path(path, true)?;
        let file = File::open(&host).map_err(io_err(path))?;
        file.set_times(FileTimes::new().set_accessed(atime).set_modified(mtime))
            .map_err(io_err(path))
    }

    fn mknod(&self, path: &str, mode: u32, dev: u64) -> VfsResult<()> {
        use rustix::fs::{CWD, FileType, Mode, mknodat};

        self.check_writable()?;
        let host = self.host_path(path, false)?;
        mknodat(
            CWD,
            host.as_path(),
            FileType::from_raw_mode(mode),
            Mode::from_raw_mode(mode),
            dev as rustix::fs::Dev,
        )
        .map_err(|e| VfsError::from_io(e.into(), path))
    }

    fn symlink(&self, target: &str, path: &str) -> VfsResult<()> {
        self.check_writable()?;
        let host = self.host_path(path, false)?;
        std::os::unix::fs::symlink(target, &host).map_err(io_err(path))
    }

    fn link(&self, from: &str, to: &str) -> VfsResult<()> {
        self.check_writable()?;
        let old = self.host_path(from, false)?;
        let new = self.host_path(to, false)?;
        fs::hard_link(&old, &new).map_err(io_err(to))
    }

    fn rename(&self, from: &str, to: &str) -> VfsResult<()> {
        self.check_writable()?;
        let old = self.host_path(from, false)?;
        let new = self.host_path(to, false)?;
        fs::rename(&old, &new).map_err(io_err(from))
    }

    fn unlink(&self, path: &str) -> VfsResult<()> {
        self.check_writable()?;
        let host = self.host_path(path, false)?;
        fs::remove_file(&host).map_err(io_err(path))
    }

    fn mkdir(&self, path: &str, mode: u32) -> VfsResult<()> {
        self.check_writable()?;
        let host = self.host_path(path, false)?;
        DirBuilder::new()
            .mode(mode & 0o7777)
            .create(&host)
            .map_err(io_err(path))
    }

    fn rmdir(&self, path: &str) -> VfsResult<()> {
        self.check_writable()?;
        let host = self.host_path(path, false)?;
        fs::remove_dir(&host).map_err(io_err(path))
    }

    /// Local files already are local copies.
    fn getlocalcopy(&self, path: &str) -> VfsResult<PathBuf> {
        self.host_path(path, true)
    }

    fn ungetlocalcopy(&self, _path: &str, _local: &Path, _changed: bool) -> VfsResult<()> {
        Ok(())
    }
}

/// An open host file.
#[derive(Debug)]
struct LocalFile {
    file: File,
    path: String,
}

impl VfsFile for LocalFile {
    fn read(&mut self, buf: &mut [u8]) -> VfsResult<usize> {
        self.file.read(buf).map_err(io_err(&self.path))
    }

    fn write(&mut self, buf: &[u8]) -> VfsResult<usize> {
        self.file.write(buf).map_err(io_err(&self.path))
    }

    fn lseek(&mut self, pos: SeekFrom) -> VfsResult<u64> {
        self.file.seek(pos).map_err(io_err(&self.path))
    }

    fn fstat(&mut self) -> VfsResult<Stat> {
        let meta = self.file.metadata().map_err(io_err(&self.path))?;
        Ok(stat_from_metadata(&meta))
    }

    fn close(self: Box<Self>) -> VfsResult<()> {
        Ok(())
    }
}
