//! In-memory filesystem class (`#mem`).
//!
//! Used for scratch space and testing. The whole state is the directory
//! cache itself: file contents live in inode data and every modification
//! is accepted as-is. Data is lost when the instance is freed, which the
//! GC does once it has been idle for the configured timeout.

use std::time::SystemTime;

use crate::class::{ClassFlags, ClassInfo};
use crate::direntry::{ArchiveMatch, DirCache, FileHandle, Mutation, Subclass, Superblock};
use crate::error::VfsResult;
use crate::types::OpenFlags;

/// Marker prefix of the memory class.
pub const MEM_PREFIX: &str = "mem";

/// Hooks of the memory class. Every archive name is its own instance, so
/// `/#mem/` and `/scratch#mem/` are separate trees.
#[derive(Debug, Default)]
pub struct MemoryBackend;

/// The memory class as registered with a context.
pub type MemFs = DirCache<MemoryBackend>;

impl DirCache<MemoryBackend> {
    pub fn memory() -> Self {
        DirCache::new(
            MemoryBackend,
            ClassInfo::new("memory", MEM_PREFIX, ClassFlags::empty()),
        )
    }
}

impl Subclass for MemoryBackend {
    type SuperData = ();
    type InodeData = Vec<u8>;
    type FileData = ();
    type Cookie = ();

    fn archive_check(&self, _archive: &str, _op: &str) -> VfsResult<()> {
        Ok(())
    }

    fn archive_same(&self, sb: &Superblock<Self>, archive: &str, _op: &str, _: &()) -> ArchiveMatch {
        if sb.archive == archive {
            ArchiveMatch::Same
        } else {
            ArchiveMatch::Other
        }
    }

    fn open_archive(&self, _sb: &mut Superblock<Self>, archive: &str, _op: &str, _: ()) -> VfsResult<()> {
        tracing::debug!("memory: new tree for {:?}", archive);
        Ok(())
    }

    fn fh_open(
        &self,
        sb: &mut Superblock<Self>,
        fh: &mut FileHandle<()>,
        flags: OpenFlags,
        _mode: u32,
    ) -> VfsResult<()> {
        let ino = sb.inode_mut(fh.ino);
        if flags.truncate && flags.wants_write() {
            ino.data.clear();
            ino.st.size = 0;
            ino.st.mtime = SystemTime::now();
        }
        if flags.append {
            fh.pos = ino.st.size;
        }
        Ok(())
    }

    fn fh_read(&self, sb: &mut Superblock<Self>, fh: &mut FileHandle<()>, buf: &mut [u8]) -> VfsResult<usize> {
        let data = &sb.inode(fh.ino).data;
        let start = (fh.pos as usize).min(data.len());
        let n = buf.len().min(data.len() - start);
        buf[..n].copy_from_slice(&data[start..start + n]);
        Ok(n)
    }

    fn fh_write(&self, sb: &mut Superblock<Self>, fh: &mut FileHandle<()>, buf: &[u8]) -> VfsResult<()> {
        let ino = sb.inode_mut(fh.ino);
        let start = if fh.flags.append { ino.data.len() } else { fh.pos as usize };
        if ino.data.len() < start {
            ino.data.resize(start, 0);
        }
        let end = start + buf.len();
        if ino.data.len() < end {
            ino.data.resize(end, 0);
        }
        ino.data[start..end].copy_from_slice(buf);
        ino.st.size = ino.data.len() as u64;
        ino.st.blocks = ino.st.size.div_ceil(512);
        ino.st.mtime = SystemTime::now();
        fh.pos = start as u64;
        Ok(())
    }

    fn mutate(&self, _sb: &mut Superblock<Self>, _op: &Mutation<'_>) -> VfsResult<()> {
        Ok(())
    }
}
