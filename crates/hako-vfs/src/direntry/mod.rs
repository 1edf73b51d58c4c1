//! Generic directory-cache class.
//!
//! Most backends do not want to implement the whole [`VfsClass`] table.
//! They implement the smaller [`Subclass`] hook set instead and wrap it in a
//! [`DirCache`], which keeps one [`Superblock`] per open instance, resolves
//! paths through the cached inode graph and runs the file-handle protocol.
//!
//! The resolver is picked from the class flags: temp-file and remote classes
//! list directories on demand ([`Strategy::Linear`]), everything else builds
//! its whole tree when the instance is opened ([`Strategy::Tree`]).

mod cache;
mod file;
mod resolve;

pub use cache::{Entry, EntryId, Inode, InodeId, Superblock};
pub use file::{DirCacheFile, FileHandle, LinearState, local_temp_file};
pub use resolve::{Follow, LINK_FOLLOW, Lookup, LookupFlags};

use parking_lot::Mutex;
use std::fmt;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Instant, SystemTime};

use crate::class::{
    ClassEnv, ClassFlags, ClassInfo, DirSnapshot, Strategy, VfsClass, VfsDir, VfsFile,
};
use crate::error::{VfsError, VfsResult};
use crate::path;
use crate::types::{DirEntry, OpenFlags, S_IFDIR, S_IFLNK, S_IFMT, SetCtl, Stat, VfsId};

/// Answer of [`Subclass::archive_same`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveMatch {
    /// Some other instance; keep looking.
    Other,
    /// This instance, up to date.
    Same,
    /// This instance, but its source changed. It is rebuilt.
    Stale,
}

/// A modification forwarded to [`Subclass::mutate`]. Paths are relative to
/// the instance root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation<'a> {
    Mkdir { path: &'a str, mode: u32 },
    Rmdir { path: &'a str },
    Unlink { path: &'a str },
    Rename { from: &'a str, to: &'a str },
    Symlink { target: &'a str, path: &'a str },
    Link { from: &'a str, to: &'a str },
    Chmod { path: &'a str, mode: u32 },
    Chown { path: &'a str, uid: Option<u32>, gid: Option<u32> },
    Utime { path: &'a str, atime: SystemTime, mtime: SystemTime },
    Mknod { path: &'a str, mode: u32, dev: u64 },
}

/// Backend hooks for the generic directory cache.
///
/// Only the instance hooks are required. Everything else has a default that
/// either does nothing or reports [`VfsError::NotSupported`].
pub trait Subclass: Send + Sync + Sized + 'static {
    type SuperData: Default + Send;
    type InodeData: Default + Send;
    type FileData: Default + Send;
    /// Whatever `archive_check` learns about the outer object.
    type Cookie;

    /// Can an instance be opened from `archive` with marker `op`?
    fn archive_check(&self, archive: &str, op: &str) -> VfsResult<Self::Cookie>;

    /// Is `sb` the instance for `archive`/`op`?
    fn archive_same(
        &self,
        sb: &Superblock<Self>,
        archive: &str,
        op: &str,
        cookie: &Self::Cookie,
    ) -> ArchiveMatch;

    /// Fill a fresh superblock: connect, or read the archive index.
    fn open_archive(
        &self,
        sb: &mut Superblock<Self>,
        archive: &str,
        op: &str,
        cookie: Self::Cookie,
    ) -> VfsResult<()>;

    /// Release instance resources. The tree is freed separately.
    fn free_archive(&self, _sb: &mut Superblock<Self>) {}

    fn init_inode(&self, _ino: &mut Inode<Self::InodeData>) {}

    fn free_inode(&self, _ino: &mut Inode<Self::InodeData>) {}

    fn init_entry(&self, _ent: &mut Entry) {}

    /// Populate directory `dir`, found at `path`. Linear classes only.
    fn dir_load(&self, _sb: &mut Superblock<Self>, _dir: InodeId, _path: &str) -> VfsResult<()> {
        Err(VfsError::NotSupported)
    }

    /// Is a loaded directory listing still good?
    fn dir_uptodate(&self, ino: &Inode<Self::InodeData>) -> bool {
        Instant::now() < ino.timestamp
    }

    fn fh_open(
        &self,
        _sb: &mut Superblock<Self>,
        _fh: &mut FileHandle<Self::FileData>,
        _flags: OpenFlags,
        _mode: u32,
    ) -> VfsResult<()> {
        Ok(())
    }

    fn fh_close(
        &self,
        _sb: &mut Superblock<Self>,
        _fh: &mut FileHandle<Self::FileData>,
    ) -> VfsResult<()> {
        Ok(())
    }

    /// Read at `fh.pos` when the file has no local copy.
    fn fh_read(
        &self,
        _sb: &mut Superblock<Self>,
        _fh: &mut FileHandle<Self::FileData>,
        _buf: &mut [u8],
    ) -> VfsResult<usize> {
        Err(VfsError::NotSupported)
    }

    /// Write at `fh.pos` when the file has no local copy.
    fn fh_write(
        &self,
        _sb: &mut Superblock<Self>,
        _fh: &mut FileHandle<Self::FileData>,
        _buf: &[u8],
    ) -> VfsResult<()> {
        Err(VfsError::NotSupported)
    }

    /// Upload the local copy `local` of `ino` to `path`.
    fn file_store(
        &self,
        _sb: &mut Superblock<Self>,
        _ino: InodeId,
        _path: &str,
        _local: &Path,
    ) -> VfsResult<()> {
        Err(VfsError::NotSupported)
    }

    /// Whether `linear_start`/`linear_read` are implemented.
    fn supports_linear(&self) -> bool {
        false
    }

    /// Begin streaming the file from `offset`.
    fn linear_start(
        &self,
        _sb: &mut Superblock<Self>,
        _fh: &mut FileHandle<Self::FileData>,
        _offset: u64,
    ) -> VfsResult<()> {
        Err(VfsError::NotSupported)
    }

    /// Next chunk of the stream. `Ok(0)` at the end.
    fn linear_read(
        &self,
        _sb: &mut Superblock<Self>,
        _fh: &mut FileHandle<Self::FileData>,
        _buf: &mut [u8],
    ) -> VfsResult<usize> {
        Err(VfsError::NotSupported)
    }

    /// Finish a stream, draining whatever the other side still sends.
    fn linear_close(&self, _sb: &mut Superblock<Self>, _fh: &mut FileHandle<Self::FileData>) {}

    /// Carry out a modification on the backend.
    fn mutate(&self, _sb: &mut Superblock<Self>, _op: &Mutation<'_>) -> VfsResult<()> {
        Err(VfsError::NotSupported)
    }
}

pub(crate) struct CacheState<S: Subclass> {
    pub(crate) supers: Vec<Superblock<S>>,
    next_id: u64,
    pub(crate) flush: bool,
    logfile: Option<File>,
}

impl<S: Subclass> CacheState<S> {
    pub(crate) fn superblock_mut(&mut self, id: VfsId) -> Option<&mut Superblock<S>> {
        self.supers.iter_mut().find(|sb| sb.id == id)
    }

    fn log(&mut self, line: fmt::Arguments<'_>) {
        if let Some(file) = self.logfile.as_mut()
            && let Err(e) = writeln!(file, "{line}")
        {
            tracing::warn!("protocol log write failed: {}", e);
            self.logfile = None;
        }
    }
}

pub(crate) struct Shared<S: Subclass> {
    pub(crate) sub: S,
    pub(crate) info: ClassInfo,
    pub(crate) state: Mutex<CacheState<S>>,
    env: OnceLock<ClassEnv>,
    verrno: AtomicI32,
}

impl<S: Subclass> Shared<S> {
    pub(crate) fn env(&self) -> &ClassEnv {
        self.env.get_or_init(ClassEnv::detached)
    }

    pub(crate) fn track<T>(&self, result: VfsResult<T>) -> VfsResult<T> {
        if let Err(e) = &result {
            self.verrno.store(e.errno(), Ordering::Relaxed);
        }
        result
    }

    pub(crate) fn flat(&self) -> bool {
        self.info.strategy() == Strategy::Linear
    }
}

/// A [`VfsClass`] built from a [`Subclass`].
pub struct DirCache<S: Subclass> {
    pub(crate) shared: Arc<Shared<S>>,
}

impl<S: Subclass> Clone for DirCache<S> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<S: Subclass> DirCache<S> {
    pub fn new(sub: S, info: ClassInfo) -> Self {
        Self {
            shared: Arc::new(Shared {
                sub,
                info,
                state: Mutex::new(CacheState {
                    supers: Vec::new(),
                    next_id: 1,
                    flush: false,
                    logfile: None,
                }),
                env: OnceLock::new(),
                verrno: AtomicI32::new(0),
            }),
        }
    }

    pub fn subclass(&self) -> &S {
        &self.shared.sub
    }

    /// Number of live instances.
    pub fn instance_count(&self) -> usize {
        self.shared.state.lock().supers.len()
    }

    /// Run `inspect` on an instance, for tests and diagnostics.
    pub fn with_instance<T>(&self, id: VfsId, inspect: impl FnOnce(&Superblock<S>) -> T) -> Option<T> {
        let state = self.shared.state.lock();
        state.supers.iter().find(|sb| sb.id == id).map(inspect)
    }

    /// Find or open the instance `path` lives in. Returns its id and the
    /// path inside it.
    ///
    /// A fresh match loses its stamp, since it is about to be used. A stale
    /// one is freed and rebuilt. With `allow_open` false nothing is opened
    /// or evicted.
    fn get_path<'p>(
        &self,
        state: &mut CacheState<S>,
        path: &'p str,
        allow_open: bool,
    ) -> VfsResult<(VfsId, &'p str)> {
        let shared = &self.shared;
        let env = shared.env();
        let split = path::split(path, |op| self.which(op))
            .ok_or_else(|| VfsError::invalid_path(path))?;
        let cookie = shared.sub.archive_check(split.archive, split.op)?;

        let mut stale = None;
        for (i, sb) in state.supers.iter().enumerate() {
            match shared.sub.archive_same(sb, split.archive, split.op, &cookie) {
                ArchiveMatch::Other => continue,
                ArchiveMatch::Same => {
                    if allow_open {
                        env.gc.rmstamp(env.id, sb.id);
                    }
                    return Ok((sb.id, split.inner));
                }
                ArchiveMatch::Stale => {
                    stale = Some(i);
                    break;
                }
            }
        }

        if !allow_open {
            return Err(VfsError::Io(std::io::Error::from_raw_os_error(libc::EIO)));
        }

        if let Some(i) = stale {
            let sb = state.supers.remove(i);
            tracing::debug!("{}: {} changed, reloading", shared.info.name, sb.archive);
            env.gc.rmstamp(env.id, sb.id);
            self.free_super(sb);
        }

        let id = VfsId(state.next_id);
        state.next_id += 1;
        let mut sb = Superblock::new(&shared.sub, id, split.archive, split.op);
        if let Err(e) = shared.sub.open_archive(&mut sb, split.archive, split.op, cookie) {
            tracing::debug!("{}: cannot open {}#{}: {}", shared.info.name, split.archive, split.op, e);
            self.free_super(sb);
            return Err(e);
        }
        tracing::debug!(
            "{}: opened {}#{} as {:?} ({} inodes)",
            shared.info.name,
            split.archive,
            split.op,
            id,
            sb.ino_usage
        );
        state.log(format_args!("open {}#{}", split.archive, split.op));
        state.supers.push(sb);
        Ok((id, split.inner))
    }

    fn free_super(&self, mut sb: Superblock<S>) {
        let sub = &self.shared.sub;
        sb.free_tree(sub);
        sub.free_archive(&mut sb);
        tracing::debug!("{}: freed {:?}", self.shared.info.name, sb.id);
    }

    /// Run `op` against the instance holding `path`, then stamp the
    /// instance if nothing is open on it.
    pub(crate) fn with_superblock<T>(
        &self,
        path: &str,
        op: impl FnOnce(&mut Lookup<'_, S>, &mut Superblock<S>, &str) -> VfsResult<T>,
    ) -> VfsResult<T> {
        let shared = &self.shared;
        let env = shared.env();
        let (result, idle) = {
            let mut state = shared.state.lock();
            match self.get_path(&mut state, path, true) {
                Err(e) => (Err(e), None),
                Ok((id, inner)) => {
                    let CacheState { supers, flush, .. } = &mut *state;
                    match supers.iter_mut().find(|sb| sb.id == id) {
                        None => (Err(VfsError::not_found(path)), None),
                        Some(sb) => {
                            let mut lookup = Lookup {
                                sub: &shared.sub,
                                strategy: shared.info.strategy(),
                                flush,
                                dir_timeout: env.config.dir_cache_timeout(),
                            };
                            let result = op(&mut lookup, sb, inner);
                            (result, (sb.fd_usage == 0).then_some(sb.id))
                        }
                    }
                }
            }
        };
        if let Some(id) = idle {
            env.gc.stamp_create(env.id, self, id);
        }
        shared.track(result)
    }

    /// Like [`with_superblock`](Self::with_superblock) for two paths that
    /// must live in the same instance. Every instance either path reached
    /// is stamped afterwards if it is idle, whatever the outcome.
    fn with_superblock2<T>(
        &self,
        from: &str,
        to: &str,
        op: impl FnOnce(&mut Lookup<'_, S>, &mut Superblock<S>, &str, &str) -> VfsResult<T>,
    ) -> VfsResult<T> {
        let shared = &self.shared;
        let env = shared.env();
        let mut reached = Vec::with_capacity(2);
        let (result, idle) = {
            let mut state = shared.state.lock();
            let result = (|| -> VfsResult<T> {
                let (a, from_inner) = self.get_path(&mut state, from, true)?;
                reached.push(a);
                let (b, to_inner) = self.get_path(&mut state, to, true)?;
                reached.push(b);
                if a != b {
                    return Err(VfsError::CrossDeviceLink);
                }
                let CacheState { supers, flush, .. } = &mut *state;
                let sb = supers
                    .iter_mut()
                    .find(|sb| sb.id == a)
                    .ok_or_else(|| VfsError::not_found(from))?;
                let mut lookup = Lookup {
                    sub: &shared.sub,
                    strategy: shared.info.strategy(),
                    flush,
                    dir_timeout: env.config.dir_cache_timeout(),
                };
                op(&mut lookup, sb, from_inner, to_inner)
            })();
            let idle: Vec<VfsId> = state
                .supers
                .iter()
                .filter(|sb| sb.fd_usage == 0 && reached.contains(&sb.id))
                .map(|sb| sb.id)
                .collect();
            (result, idle)
        };
        for id in idle {
            env.gc.stamp_create(env.id, self, id);
        }
        shared.track(result)
    }

    pub(crate) fn log(&self, line: fmt::Arguments<'_>) {
        self.shared.state.lock().log(line);
    }

    fn mutate(&self, path: &str, build: impl FnOnce(&str) -> Mutation<'_>) -> VfsResult<()> {
        if self.shared.info.is_read_only() {
            return self.shared.track(Err(VfsError::ReadOnly));
        }
        self.with_superblock(path, |lookup, sb, inner| {
            let inner = resolve::canonical(inner);
            let m = build(&inner);
            self.apply(lookup, sb, &m)
        })?;
        self.log(format_args!("mutate {path}"));
        Ok(())
    }

    fn mutate2(
        &self,
        from: &str,
        to: &str,
        build: impl for<'a> FnOnce(&'a str, &'a str) -> Mutation<'a>,
    ) -> VfsResult<()> {
        if self.shared.info.is_read_only() {
            return self.shared.track(Err(VfsError::ReadOnly));
        }
        self.with_superblock2(from, to, |lookup, sb, a, b| {
            let (a, b) = (resolve::canonical(a), resolve::canonical(b));
            let m = build(&a, &b);
            self.apply(lookup, sb, &m)
        })?;
        self.log(format_args!("mutate {from} -> {to}"));
        Ok(())
    }

    /// Validate a modification against the cache, let the backend do it,
    /// then bring the cache in line. Linear caches are simply dropped.
    fn apply(
        &self,
        lookup: &mut Lookup<'_, S>,
        sb: &mut Superblock<S>,
        m: &Mutation<'_>,
    ) -> VfsResult<()> {
        let sub = &self.shared.sub;
        if self.shared.flat() {
            sub.mutate(sb, m)?;
            sb.invalidate(sub);
            return Ok(());
        }

        match *m {
            Mutation::Mkdir { path, mode } => {
                let (dir, name) = parent_of(lookup, sb, path)?;
                absent(sb, dir, name, path)?;
                sub.mutate(sb, m)?;
                let ent = sb.generate_entry(sub, name, S_IFDIR | (mode & 0o7777));
                sb.insert_entry(dir, ent);
            }
            Mutation::Rmdir { path } => {
                let ent = lookup.find_entry(sb, path, Follow::NoFollow, LookupFlags::empty())?;
                let ino = sb.inode(sb.entry(ent).ino);
                if !ino.st.is_dir() {
                    return Err(VfsError::not_a_directory(path));
                }
                if !ino.children.is_empty() {
                    return Err(VfsError::directory_not_empty(path));
                }
                sub.mutate(sb, m)?;
                sb.free_entry(sub, ent);
            }
            Mutation::Unlink { path } => {
                let ent = lookup.find_entry(sb, path, Follow::NoFollow, LookupFlags::empty())?;
                if sb.inode(sb.entry(ent).ino).st.is_dir() {
                    return Err(VfsError::is_a_directory(path));
                }
                sub.mutate(sb, m)?;
                sb.free_entry(sub, ent);
            }
            Mutation::Rename { from, to } => {
                let ent = lookup.find_entry(sb, from, Follow::NoFollow, LookupFlags::empty())?;
                let moving = sb.entry(ent).ino;
                let (dir, name) = parent_of(lookup, sb, to)?;

                let mut up = Some(dir);
                while let Some(ino) = up {
                    if ino == moving {
                        return Err(VfsError::invalid_path(to));
                    }
                    up = sb.inode(ino).ent.and_then(|e| sb.entry(e).dir);
                }

                let replaced = sb.lookup_child(dir, name);
                if replaced == Some(ent) {
                    return Ok(());
                }
                if let Some(old) = replaced {
                    let old_ino = sb.inode(sb.entry(old).ino);
                    let from_dir = sb.inode(moving).st.is_dir();
                    match (from_dir, old_ino.st.is_dir()) {
                        (true, false) => return Err(VfsError::not_a_directory(to)),
                        (false, true) => return Err(VfsError::is_a_directory(to)),
                        (true, true) if !old_ino.children.is_empty() => {
                            return Err(VfsError::directory_not_empty(to));
                        }
                        _ => {}
                    }
                }
                sub.mutate(sb, m)?;
                if let Some(old) = replaced {
                    sb.free_entry(sub, old);
                }
                sb.move_entry(ent, dir, name);
            }
            Mutation::Symlink { target, path } => {
                let (dir, name) = parent_of(lookup, sb, path)?;
                absent(sb, dir, name, path)?;
                sub.mutate(sb, m)?;
                let ent = sb.generate_entry(sub, name, S_IFLNK | 0o777);
                let ino = sb.entry(ent).ino;
                let node = sb.inode_mut(ino);
                node.linkname = Some(target.to_string());
                node.st.mode = S_IFLNK | 0o777;
                node.st.size = target.len() as u64;
                sb.insert_entry(dir, ent);
            }
            Mutation::Link { from, to } => {
                if self.shared.info.flags.contains(ClassFlags::NO_HARDLINKS) {
                    return Err(VfsError::NotSupported);
                }
                let ent = lookup.find_entry(sb, from, Follow::NoFollow, LookupFlags::empty())?;
                let ino = sb.entry(ent).ino;
                if sb.inode(ino).st.is_dir() {
                    return Err(VfsError::permission_denied(from));
                }
                let (dir, name) = parent_of(lookup, sb, to)?;
                absent(sb, dir, name, to)?;
                sub.mutate(sb, m)?;
                let link = sb.new_entry(sub, name, ino);
                sb.insert_entry(dir, link);
            }
            Mutation::Chmod { path, mode } => {
                let ino = lookup.find_inode(sb, path, LINK_FOLLOW, LookupFlags::empty())?;
                sub.mutate(sb, m)?;
                let st = &mut sb.inode_mut(ino).st;
                st.mode = (st.mode & S_IFMT) | (mode & 0o7777);
                st.ctime = SystemTime::now();
            }
            Mutation::Chown { path, uid, gid } => {
                let ino = lookup.find_inode(sb, path, LINK_FOLLOW, LookupFlags::empty())?;
                sub.mutate(sb, m)?;
                let st = &mut sb.inode_mut(ino).st;
                if let Some(uid) = uid {
                    st.uid = uid;
                }
                if let Some(gid) = gid {
                    st.gid = gid;
                }
                st.ctime = SystemTime::now();
            }
            Mutation::Utime { path, atime, mtime } => {
                let ino = lookup.find_inode(sb, path, LINK_FOLLOW, LookupFlags::empty())?;
                sub.mutate(sb, m)?;
                let st = &mut sb.inode_mut(ino).st;
                st.atime = atime;
                st.mtime = mtime;
            }
            Mutation::Mknod { path, mode, dev } => {
                let (dir, name) = parent_of(lookup, sb, path)?;
                absent(sb, dir, name, path)?;
                sub.mutate(sb, m)?;
                let ent = sb.generate_entry(sub, name, mode);
                let ino = sb.entry(ent).ino;
                sb.inode_mut(ino).st.rdev = dev;
                sb.insert_entry(dir, ent);
            }
        }
        Ok(())
    }

    fn inode_stat(&self, path: &str, follow: Follow) -> VfsResult<Stat> {
        self.with_superblock(path, |lookup, sb, inner| {
            let ino = lookup.find_inode(sb, inner, follow, LookupFlags::empty())?;
            Ok(sb.inode(ino).st.clone())
        })
    }
}

/// Directory and final name of `path`; the directory must exist.
fn parent_of<'p, S: Subclass>(
    lookup: &mut Lookup<'_, S>,
    sb: &mut Superblock<S>,
    path: &'p str,
) -> VfsResult<(InodeId, &'p str)> {
    let (dirname, name) = match path.rfind('/') {
        Some(slash) => (&path[..slash], &path[slash + 1..]),
        None => ("", path),
    };
    if name.is_empty() {
        return Err(VfsError::invalid_path(path));
    }
    let dir = lookup.find_inode(sb, dirname, LINK_FOLLOW, LookupFlags::DIR)?;
    if !sb.inode(dir).st.is_dir() {
        return Err(VfsError::not_a_directory(dirname));
    }
    Ok((dir, name))
}

fn absent<S: Subclass>(sb: &Superblock<S>, dir: InodeId, name: &str, path: &str) -> VfsResult<()> {
    match sb.lookup_child(dir, name) {
        Some(_) => Err(VfsError::already_exists(path)),
        None => Ok(()),
    }
}

impl<S: Subclass> VfsClass for DirCache<S> {
    fn info(&self) -> &ClassInfo {
        &self.shared.info
    }

    fn attach(&self, env: ClassEnv) {
        if self.shared.env.set(env).is_err() {
            tracing::warn!("{}: registered twice, keeping first context", self.shared.info.name);
        }
    }

    fn open(&self, path: &str, flags: OpenFlags, mode: u32) -> VfsResult<Box<dyn VfsFile>> {
        let file = self.with_superblock(path, |lookup, sb, inner| {
            self.open_in(lookup, sb, inner, flags, mode)
        })?;
        Ok(Box::new(file))
    }

    fn opendir(&self, path: &str) -> VfsResult<Box<dyn VfsDir>> {
        let entries = self.with_superblock(path, |lookup, sb, inner| {
            let ino = lookup.find_inode(sb, inner, LINK_FOLLOW, LookupFlags::DIR)?;
            let dir = sb.inode(ino);
            if !dir.st.is_dir() {
                return Err(VfsError::not_a_directory(path));
            }
            Ok(dir
                .children
                .iter()
                .map(|e| {
                    let ent = sb.entry(*e);
                    DirEntry::new(ent.name.clone(), sb.inode(ent.ino).st.ino)
                })
                .collect::<Vec<_>>())
        })?;
        Ok(Box::new(DirSnapshot::new(entries)))
    }

    fn stat(&self, path: &str) -> VfsResult<Stat> {
        self.inode_stat(path, LINK_FOLLOW)
    }

    fn lstat(&self, path: &str) -> VfsResult<Stat> {
        self.inode_stat(path, Follow::NoFollow)
    }

    fn readlink(&self, path: &str) -> VfsResult<String> {
        self.with_superblock(path, |lookup, sb, inner| {
            let ino = lookup.find_inode(sb, inner, Follow::NoFollow, LookupFlags::empty())?;
            let ino = sb.inode(ino);
            match (&ino.linkname, ino.st.is_symlink()) {
                (Some(link), true) => Ok(link.clone()),
                _ => Err(VfsError::NotASymlink(path.to_string())),
            }
        })
    }

    fn chdir(&self, path: &str) -> VfsResult<()> {
        self.with_superblock(path, |lookup, sb, inner| {
            let ino = lookup.find_inode(sb, inner, LINK_FOLLOW, LookupFlags::DIR)?;
            if sb.inode(ino).st.is_dir() {
                Ok(())
            } else {
                Err(VfsError::not_a_directory(path))
            }
        })
    }

    fn chmod(&self, path: &str, mode: u32) -> VfsResult<()> {
        self.mutate(path, |p| Mutation::Chmod { path: p, mode })
    }

    fn chown(&self, path: &str, uid: Option<u32>, gid: Option<u32>) -> VfsResult<()> {
        self.mutate(path, |p| Mutation::Chown { path: p, uid, gid })
    }

    fn utime(&self, path: &str, atime: SystemTime, mtime: SystemTime) -> VfsResult<()> {
        self.mutate(path, |p| Mutation::Utime { path: p, atime, mtime })
    }

    fn mknod(&self, path: &str, mode: u32, dev: u64) -> VfsResult<()> {
        self.mutate(path, |p| Mutation::Mknod { path: p, mode, dev })
    }

    fn symlink(&self, target: &str, path: &str) -> VfsResult<()> {
        if self.shared.info.is_read_only() {
            return self.shared.track(Err(VfsError::ReadOnly));
        }
        self.with_superblock(path, |lookup, sb, inner| {
            let inner = resolve::canonical(inner);
            self.apply(lookup, sb, &Mutation::Symlink { target, path: &inner })
        })?;
        self.log(format_args!("mutate {path} -> {target}"));
        Ok(())
    }

    fn link(&self, from: &str, to: &str) -> VfsResult<()> {
        self.mutate2(from, to, |a, b| Mutation::Link { from: a, to: b })
    }

    fn rename(&self, from: &str, to: &str) -> VfsResult<()> {
        self.mutate2(from, to, |a, b| Mutation::Rename { from: a, to: b })
    }

    fn unlink(&self, path: &str) -> VfsResult<()> {
        self.mutate(path, |p| Mutation::Unlink { path: p })
    }

    fn mkdir(&self, path: &str, mode: u32) -> VfsResult<()> {
        self.mutate(path, |p| Mutation::Mkdir { path: p, mode })
    }

    fn rmdir(&self, path: &str) -> VfsResult<()> {
        self.mutate(path, |p| Mutation::Rmdir { path: p })
    }

    fn getid(&self, path: &str) -> Option<VfsId> {
        let mut state = self.shared.state.lock();
        self.get_path(&mut state, path, false).ok().map(|(id, _)| id)
    }

    fn nothingisopen(&self, id: VfsId) -> bool {
        let state = self.shared.state.lock();
        state
            .supers
            .iter()
            .find(|sb| sb.id == id)
            .is_none_or(|sb| sb.fd_usage == 0)
    }

    fn free(&self, id: VfsId) {
        let sb = {
            let mut state = self.shared.state.lock();
            match state.supers.iter().position(|sb| sb.id == id) {
                Some(i) => state.supers.remove(i),
                None => return,
            }
        };
        self.free_super(sb);
    }

    fn getlocalcopy(&self, path: &str) -> VfsResult<PathBuf> {
        let (file, local) = self.with_superblock(path, |lookup, sb, inner| {
            let file = self.open_in(lookup, sb, inner, OpenFlags::read(), 0)?;
            let local = file.inode().and_then(|ino| sb.inode(ino).localname.clone());
            Ok((file, local))
        })?;
        Box::new(file).close()?;
        local.ok_or(VfsError::NotSupported)
    }

    fn ungetlocalcopy(&self, path: &str, local: &Path, changed: bool) -> VfsResult<()> {
        let flat = self.shared.flat();
        self.with_superblock(path, |lookup, sb, inner| {
            let ino = lookup.find_inode(sb, inner, LINK_FOLLOW, LookupFlags::empty())?;
            if sb.inode(ino).localname.as_deref() != Some(local) {
                return Err(VfsError::NotSupported);
            }
            if changed {
                let full = sb
                    .fullpath(ino, flat)
                    .ok_or_else(|| VfsError::not_found(path))?;
                self.shared.sub.file_store(sb, ino, &full, local)?;
                sb.invalidate(&self.shared.sub);
            }
            Ok(())
        })
    }

    fn setctl(&self, path: &str, op: &SetCtl) -> VfsResult<bool> {
        match op {
            SetCtl::Flush => {
                self.shared.state.lock().flush = true;
                Ok(true)
            }
            SetCtl::StaleData(on) => {
                let on = *on;
                self.with_superblock(path, |lookup, sb, inner| {
                    lookup.find_inode(sb, inner, Follow::NoFollow, LookupFlags::empty())?;
                    sb.want_stale = on;
                    if !on {
                        sb.invalidate(lookup.sub);
                    }
                    Ok(true)
                })
            }
            SetCtl::LogFile(file) => {
                let log = File::create(file)
                    .map_err(|e| VfsError::from_io(e, file.display().to_string()));
                let log = self.shared.track(log)?;
                self.shared.state.lock().logfile = Some(log);
                Ok(true)
            }
        }
    }

    fn fill_names(&self, out: &mut dyn FnMut(String)) {
        let state = self.shared.state.lock();
        for sb in &state.supers {
            out(format!("{}#{}/", sb.archive, sb.op));
        }
    }

    fn ferrno(&self) -> Option<i32> {
        match self.shared.verrno.load(Ordering::Relaxed) {
            0 => None,
            errno => Some(errno),
        }
    }

    fn done(&self) {
        let supers = std::mem::take(&mut self.shared.state.lock().supers);
        for sb in supers {
            self.free_super(sb);
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// A subclass with no backend behind it: every instance starts empty.
    #[derive(Debug, Default)]
    pub(crate) struct Plain;

    impl Subclass for Plain {
        type SuperData = ();
        type InodeData = ();
        type FileData = ();
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

        fn open_archive(&self, _sb: &mut Superblock<Self>, _: &str, _: &str, _: ()) -> VfsResult<()> {
            Ok(())
        }

        fn mutate(&self, _sb: &mut Superblock<Self>, _op: &Mutation<'_>) -> VfsResult<()> {
            Ok(())
        }
    }

    fn plain() -> DirCache<Plain> {
        DirCache::new(Plain, ClassInfo::new("plain", "plain", ClassFlags::empty()))
    }

    #[test]
    fn test_instances_are_shared_per_archive() {
        let cache = plain();
        cache.mkdir("/x#plain/d", 0o755).unwrap();
        cache.mkdir("/y#plain/d", 0o755).unwrap();
        assert_eq!(cache.instance_count(), 2);

        let x = cache.getid("/x#plain/d").unwrap();
        assert_eq!(cache.getid("/x#plain/other"), Some(x));
        assert_ne!(cache.getid("/y#plain"), Some(x));
        assert_eq!(cache.getid("/z#plain"), None);

        let mut names = Vec::new();
        cache.fill_names(&mut |n| names.push(n));
        assert_eq!(names, vec!["/x#plain/", "/y#plain/"]);
    }

    #[test]
    fn test_tree_mutations() {
        let cache = plain();
        cache.mkdir("/#plain/d", 0o755).unwrap();
        cache.symlink("d", "/#plain/l").unwrap();
        assert_eq!(cache.readlink("/#plain/l").unwrap(), "d");
        assert!(cache.stat("/#plain/l").unwrap().is_dir());
        assert!(cache.lstat("/#plain/l").unwrap().is_symlink());

        assert!(matches!(
            cache.mkdir("/#plain/d", 0o755),
            Err(VfsError::AlreadyExists(_))
        ));
        assert!(matches!(
            cache.mkdir("/#plain/nope/d", 0o755),
            Err(VfsError::NotFound(_))
        ));

        cache.mkdir("/#plain/d/inner", 0o700).unwrap();
        assert!(matches!(
            cache.rmdir("/#plain/d"),
            Err(VfsError::DirectoryNotEmpty(_))
        ));
        assert!(matches!(
            cache.rename("/#plain/d", "/#plain/d/inner/d"),
            Err(VfsError::InvalidPath(_))
        ));

        cache.rename("/#plain/d/inner", "/#plain/moved").unwrap();
        assert!(cache.stat("/#plain/moved").unwrap().is_dir());
        cache.rmdir("/#plain/d").unwrap();
        assert!(cache.stat("/#plain/d").is_err());
        assert_eq!(cache.ferrno(), Some(libc::ENOENT));

        cache.chmod("/#plain/moved", 0o711).unwrap();
        assert_eq!(cache.stat("/#plain/moved").unwrap().perm(), 0o711);
    }

    #[test]
    fn test_rename_across_instances_is_exdev() {
        let cache = plain();
        cache.mkdir("/a#plain/d", 0o755).unwrap();
        let err = cache.rename("/a#plain/d", "/b#plain/d").unwrap_err();
        assert!(matches!(err, VfsError::CrossDeviceLink));
    }

    #[test]
    fn test_read_only_refuses_mutation() {
        let cache = DirCache::new(Plain, ClassInfo::new("ro", "plain", ClassFlags::READ_ONLY));
        assert!(matches!(cache.mkdir("/#plain/d", 0o755), Err(VfsError::ReadOnly)));
        assert_eq!(cache.ferrno(), Some(libc::EROFS));
    }

    #[test]
    fn test_free_and_done_drop_instances() {
        let cache = plain();
        cache.mkdir("/a#plain/d", 0o755).unwrap();
        cache.mkdir("/b#plain/d", 0o755).unwrap();
        let a = cache.getid("/a#plain").unwrap();
        cache.free(a);
        assert_eq!(cache.instance_count(), 1);
        cache.done();
        assert_eq!(cache.instance_count(), 0);
    }
}
