//! Shared fixtures: a scripted `ls`-speaking host and tar archive builders.

#![allow(dead_code)]

use hako_vfs::direntry::{ArchiveMatch, FileHandle, InodeId, Mutation, Superblock};
use hako_vfs::listing::parse_ls_line;
use hako_vfs::{ClassFlags, ClassInfo, DirCache, Subclass, VfsError, VfsResult};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::{Cursor, Read};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

/// A pretend remote host. Directory listings are `ls -l` lines keyed by
/// directory path (`""` is the root) and file contents are keyed by path.
#[derive(Default)]
pub struct ScriptedHost {
    pub listings: Mutex<HashMap<String, Vec<String>>>,
    pub files: Mutex<HashMap<String, Vec<u8>>>,
    /// Directory paths in the order `dir_load` was asked for them.
    pub loads: Mutex<Vec<String>>,
    /// `(path, contents)` per `file_store` call.
    pub stored: Mutex<Vec<(String, Vec<u8>)>>,
    pub mutations: Mutex<Vec<String>>,
    pub linear_starts: AtomicUsize,
    pub linear_closes: AtomicUsize,
    /// Archive names in the order their instances were freed.
    pub freed: Mutex<Vec<String>>,
    /// Archives that refuse to open.
    pub offline: Mutex<Vec<String>>,
    pub streaming: bool,
}

impl ScriptedHost {
    pub fn streaming() -> Self {
        Self {
            streaming: true,
            ..Self::default()
        }
    }

    pub fn list(&self, dir: &str, lines: &[&str]) {
        self.listings
            .lock()
            .insert(dir.to_string(), lines.iter().map(|l| l.to_string()).collect());
    }

    pub fn put(&self, path: &str, data: &[u8]) {
        self.files.lock().insert(path.to_string(), data.to_vec());
    }

    pub fn loads_of(&self, dir: &str) -> usize {
        self.loads.lock().iter().filter(|d| *d == dir).count()
    }

    fn contents(&self, sb: &Superblock<Self>, ino: InodeId) -> VfsResult<Vec<u8>> {
        let path = sb
            .fullpath(ino, true)
            .ok_or_else(|| VfsError::not_found("<unnamed>"))?;
        self.files
            .lock()
            .get(&path)
            .cloned()
            .ok_or_else(|| VfsError::not_found(path))
    }
}

/// Route class logs to the test harness. Set RUST_LOG to see them.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A remote class over a [`ScriptedHost`], resolving linearly.
pub fn remote(host: ScriptedHost, prefix: &str, flags: ClassFlags) -> DirCache<ScriptedHost> {
    init_tracing();
    DirCache::new(host, ClassInfo::new("scripted", prefix, flags | ClassFlags::REMOTE))
}

impl Subclass for ScriptedHost {
    type SuperData = ();
    type InodeData = ();
    type FileData = Option<Cursor<Vec<u8>>>;
    type Cookie = ();

    fn archive_check(&self, _archive: &str, _op: &str) -> VfsResult<()> {
        Ok(())
    }

    fn archive_same(&self, sb: &Superblock<Self>, archive: &str, op: &str, _: &()) -> ArchiveMatch {
        if sb.archive == archive && sb.op == op {
            ArchiveMatch::Same
        } else {
            ArchiveMatch::Other
        }
    }

    fn open_archive(&self, _sb: &mut Superblock<Self>, archive: &str, _op: &str, _: ()) -> VfsResult<()> {
        if self.offline.lock().iter().any(|a| a == archive) {
            return Err(VfsError::not_found(archive));
        }
        Ok(())
    }

    fn free_archive(&self, sb: &mut Superblock<Self>) {
        self.freed.lock().push(sb.archive.clone());
    }

    fn dir_load(&self, sb: &mut Superblock<Self>, dir: InodeId, path: &str) -> VfsResult<()> {
        self.loads.lock().push(path.to_string());
        let lines = self
            .listings
            .lock()
            .get(path)
            .cloned()
            .ok_or_else(|| VfsError::not_found(path))?;
        for line in lines {
            let Some(entry) = parse_ls_line(&line) else {
                continue;
            };
            let ino = sb.new_inode(self, entry.st);
            sb.inode_mut(ino).linkname = entry.linkname;
            let ent = sb.new_entry(self, &entry.name, ino);
            sb.insert_entry(dir, ent);
        }
        Ok(())
    }

    fn fh_read(
        &self,
        sb: &mut Superblock<Self>,
        fh: &mut FileHandle<Self::FileData>,
        buf: &mut [u8],
    ) -> VfsResult<usize> {
        let data = self.contents(sb, fh.ino)?;
        let start = (fh.pos as usize).min(data.len());
        let n = buf.len().min(data.len() - start);
        buf[..n].copy_from_slice(&data[start..start + n]);
        Ok(n)
    }

    fn file_store(
        &self,
        _sb: &mut Superblock<Self>,
        _ino: InodeId,
        path: &str,
        local: &Path,
    ) -> VfsResult<()> {
        let data = std::fs::read(local)?;
        self.files.lock().insert(path.to_string(), data.clone());
        self.stored.lock().push((path.to_string(), data));
        Ok(())
    }

    fn supports_linear(&self) -> bool {
        self.streaming
    }

    fn linear_start(
        &self,
        sb: &mut Superblock<Self>,
        fh: &mut FileHandle<Self::FileData>,
        offset: u64,
    ) -> VfsResult<()> {
        self.linear_starts.fetch_add(1, Ordering::SeqCst);
        let mut cursor = Cursor::new(self.contents(sb, fh.ino)?);
        cursor.set_position(offset);
        fh.data = Some(cursor);
        Ok(())
    }

    fn linear_read(
        &self,
        _sb: &mut Superblock<Self>,
        fh: &mut FileHandle<Self::FileData>,
        buf: &mut [u8],
    ) -> VfsResult<usize> {
        match fh.data.as_mut() {
            Some(cursor) => Ok(cursor.read(buf)?),
            None => Err(VfsError::BadHandle),
        }
    }

    fn linear_close(&self, _sb: &mut Superblock<Self>, fh: &mut FileHandle<Self::FileData>) {
        self.linear_closes.fetch_add(1, Ordering::SeqCst);
        fh.data = None;
    }

    fn mutate(&self, _sb: &mut Superblock<Self>, op: &Mutation<'_>) -> VfsResult<()> {
        self.mutations.lock().push(format!("{op:?}"));
        Ok(())
    }
}

/// Write a tar archive holding `files` (path, contents) and return its path.
pub fn tar_with(dir: &Path, name: &str, files: &[(&str, &[u8])]) -> std::path::PathBuf {
    let path = dir.join(name);
    let mut builder = tar::Builder::new(std::fs::File::create(&path).unwrap());
    for (member, data) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(1_700_000_000);
        header.set_cksum();
        builder.append_data(&mut header, member, *data).unwrap();
    }
    builder.finish().unwrap();
    path
}
