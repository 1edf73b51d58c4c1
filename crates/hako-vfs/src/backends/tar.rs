//! Read-only tar archive class (`#utar`).
//!
//! The whole archive index is read when an instance opens and the tree is
//! built with the tree resolver's auto-create lookup. File contents are read
//! straight from the archive at the offsets recorded in inode data, either
//! randomly or as a linear stream.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tar::{Archive, EntryType};

use crate::class::{ClassFlags, ClassInfo};
use crate::direntry::{
    ArchiveMatch, DirCache, FileHandle, InodeId, LookupFlags, Subclass, Superblock,
};
use crate::error::{VfsError, VfsResult};
use crate::path::canonicalize;
use crate::types::{
    OpenFlags, S_IFBLK, S_IFCHR, S_IFDIR, S_IFIFO, S_IFLNK, S_IFMT, S_IFREG, Stat,
};

/// Marker prefix of the tar class.
pub const TAR_PREFIX: &str = "utar";

/// Hooks of the tar class.
#[derive(Debug, Default)]
pub struct TarArchive;

/// The tar class as registered with a context.
pub type TarFs = DirCache<TarArchive>;

impl DirCache<TarArchive> {
    pub fn tar() -> Self {
        DirCache::new(
            TarArchive,
            ClassInfo::new("tar", TAR_PREFIX, ClassFlags::READ_ONLY),
        )
    }
}

/// What an instance remembers about its archive file.
#[derive(Debug, Default)]
pub struct TarSource {
    pub path: PathBuf,
    pub mtime: Option<SystemTime>,
}

/// Where a member's data starts in the archive.
#[derive(Debug, Default)]
pub struct TarMember {
    pub offset: u64,
}

/// Result of looking at the archive before opening it.
#[derive(Debug)]
pub struct TarCookie {
    mtime: SystemTime,
}

fn archive_path(archive: &str) -> &Path {
    Path::new(archive)
}

fn kind_bits(kind: EntryType) -> u32 {
    match kind {
        EntryType::Directory => S_IFDIR,
        EntryType::Symlink => S_IFLNK,
        EntryType::Char => S_IFCHR,
        EntryType::Block => S_IFBLK,
        EntryType::Fifo => S_IFIFO,
        _ => S_IFREG,
    }
}

impl TarArchive {
    /// Add one archive member to the tree.
    fn add_member<R: Read>(
        &self,
        sb: &mut Superblock<Self>,
        entry: &tar::Entry<'_, R>,
        name: &str,
    ) -> VfsResult<()> {
        let header = entry.header();
        let kind = header.entry_type();

        let (dirname, base) = match name.rfind('/') {
            Some(slash) => (&name[..slash], &name[slash + 1..]),
            None => ("", name),
        };

        if kind == EntryType::Link {
            let Some(target) = entry.link_name()? else {
                return Err(VfsError::invalid_path(name));
            };
            let target = member_name(&target.to_string_lossy());
            let ino = match sb.find_inode_tree(self, &target, LookupFlags::empty()) {
                Ok(ino) => ino,
                Err(e) => {
                    tracing::warn!("tar: hard link {} to missing {}: {}", name, target, e);
                    return Ok(());
                }
            };
            if sb.inode(ino).st.is_dir() {
                tracing::warn!("tar: hard link {} points at directory {}", name, target);
                return Ok(());
            }
            let dir = sb.find_inode_tree(self, dirname, LookupFlags::MKDIR)?;
            if let Some(old) = sb.lookup_child(dir, base) {
                sb.free_entry(self, old);
            }
            let ent = sb.new_entry(self, base, ino);
            sb.insert_entry(dir, ent);
            return Ok(());
        }

        let mode = kind_bits(kind) | (header.mode()? & 0o7777);
        let mtime = UNIX_EPOCH + Duration::from_secs(header.mtime()?);
        let size = if kind.is_file() || kind == EntryType::Continuous {
            entry.size()
        } else {
            0
        };
        let rdev = match (header.device_major()?, header.device_minor()?) {
            (Some(major), Some(minor)) => libc::makedev(major, minor),
            _ => 0,
        };

        let dir = sb.find_inode_tree(self, dirname, LookupFlags::MKDIR)?;
        let existing = sb.lookup_child(dir, base);

        let ino = match existing {
            // A directory listed after some of its contents keeps them.
            Some(ent) if kind == EntryType::Directory && sb.inode(sb.entry(ent).ino).st.is_dir() => {
                sb.entry(ent).ino
            }
            old => {
                if let Some(old) = old {
                    sb.free_entry(self, old);
                }
                let st = sb.default_stat(mode);
                let ino = sb.new_inode(self, st);
                let ent = sb.new_entry(self, base, ino);
                sb.insert_entry(dir, ent);
                ino
            }
        };

        let node = sb.inode_mut(ino);
        let nlink = node.st.nlink;
        node.st = Stat {
            ino: node.st.ino,
            dev: node.st.dev,
            nlink,
            mode,
            uid: header.uid()? as u32,
            gid: header.gid()? as u32,
            rdev,
            size,
            blocks: size.div_ceil(512),
            atime: mtime,
            mtime,
            ctime: mtime,
            ..Stat::default()
        };
        node.data.offset = entry.raw_file_position();
        if kind == EntryType::Symlink
            && let Some(target) = entry.link_name()?
        {
            let target = target.to_string_lossy().into_owned();
            node.st.size = target.len() as u64;
            node.linkname = Some(target);
        }
        Ok(())
    }

    /// Read `buf.len()` bytes of a member at `pos`, bounded by its size.
    fn read_member(
        &self,
        sb: &Superblock<Self>,
        ino: InodeId,
        file: &mut File,
        pos: u64,
        buf: &mut [u8],
    ) -> VfsResult<usize> {
        let node = sb.inode(ino);
        let left = node.st.size.saturating_sub(pos);
        let want = (buf.len() as u64).min(left) as usize;
        if want == 0 {
            return Ok(0);
        }
        file.seek(SeekFrom::Start(node.data.offset + pos))?;
        Ok(file.read(&mut buf[..want])?)
    }

    fn open_source(&self, sb: &Superblock<Self>) -> VfsResult<File> {
        File::open(&sb.data.path).map_err(|e| VfsError::from_io(e, sb.data.path.display().to_string()))
    }
}

/// Archive member names as cache paths: no `./`, no slashes at the ends.
fn member_name(raw: &str) -> String {
    let canon = canonicalize(raw.trim_start_matches('/'));
    if canon == "." { String::new() } else { canon }
}

impl Subclass for TarArchive {
    type SuperData = TarSource;
    type InodeData = TarMember;
    type FileData = Option<File>;
    type Cookie = TarCookie;

    fn archive_check(&self, archive: &str, _op: &str) -> VfsResult<TarCookie> {
        let meta = std::fs::metadata(archive_path(archive))
            .map_err(|e| VfsError::from_io(e, archive))?;
        if meta.is_dir() {
            return Err(VfsError::is_a_directory(archive));
        }
        Ok(TarCookie {
            mtime: meta.modified()?,
        })
    }

    fn archive_same(
        &self,
        sb: &Superblock<Self>,
        archive: &str,
        _op: &str,
        cookie: &TarCookie,
    ) -> ArchiveMatch {
        if sb.data.path != archive_path(archive) {
            return ArchiveMatch::Other;
        }
        match sb.data.mtime {
            Some(built) if cookie.mtime > built => ArchiveMatch::Stale,
            _ => ArchiveMatch::Same,
        }
    }

    fn open_archive(
        &self,
        sb: &mut Superblock<Self>,
        archive: &str,
        _op: &str,
        cookie: TarCookie,
    ) -> VfsResult<()> {
        sb.data.path = archive_path(archive).to_path_buf();
        sb.data.mtime = Some(cookie.mtime);

        let file = self.open_source(sb)?;
        let mut tar = Archive::new(file);
        let mut members = 0usize;
        for entry in tar.entries()? {
            let entry = entry?;
            let raw = entry.path()?.to_string_lossy().into_owned();
            let name = member_name(&raw);
            if name.is_empty() {
                continue;
            }
            self.add_member(sb, &entry, &name)?;
            members += 1;
        }
        tracing::debug!("tar: {} has {} members", archive, members);
        Ok(())
    }

    fn fh_open(
        &self,
        sb: &mut Superblock<Self>,
        fh: &mut FileHandle<Option<File>>,
        _flags: OpenFlags,
        _mode: u32,
    ) -> VfsResult<()> {
        if sb.inode(fh.ino).st.mode & S_IFMT != S_IFREG {
            return Err(VfsError::NotSupported);
        }
        fh.data = Some(self.open_source(sb)?);
        Ok(())
    }

    fn fh_close(&self, _sb: &mut Superblock<Self>, fh: &mut FileHandle<Option<File>>) -> VfsResult<()> {
        fh.data = None;
        Ok(())
    }

    fn fh_read(
        &self,
        sb: &mut Superblock<Self>,
        fh: &mut FileHandle<Option<File>>,
        buf: &mut [u8],
    ) -> VfsResult<usize> {
        let Some(file) = fh.data.as_mut() else {
            return Err(VfsError::BadHandle);
        };
        self.read_member(sb, fh.ino, file, fh.pos, buf)
    }

    fn supports_linear(&self) -> bool {
        true
    }

    fn linear_start(
        &self,
        sb: &mut Superblock<Self>,
        fh: &mut FileHandle<Option<File>>,
        _offset: u64,
    ) -> VfsResult<()> {
        fh.data = Some(self.open_source(sb)?);
        Ok(())
    }

    fn linear_read(
        &self,
        sb: &mut Superblock<Self>,
        fh: &mut FileHandle<Option<File>>,
        buf: &mut [u8],
    ) -> VfsResult<usize> {
        let Some(file) = fh.data.as_mut() else {
            return Err(VfsError::BadHandle);
        };
        self.read_member(sb, fh.ino, file, fh.pos, buf)
    }

    fn linear_close(&self, _sb: &mut Superblock<Self>, fh: &mut FileHandle<Option<File>>) {
        fh.data = None;
    }
}
