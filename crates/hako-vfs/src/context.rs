//! The VFS facade.
//!
//! A [`VfsContext`] owns the registered classes, the stamp registry, the
//! open-handle tables and the current directory. Every path entering it is
//! canonicalized, routed to the class that claims its rightmost `#op`
//! marker (the local class when none does) and forwarded. Failures are
//! remembered as a POSIX errno readable through [`VfsContext::errno`].

use parking_lot::Mutex;
use std::fs::File;
use std::io::{Read, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::{Duration, SystemTime};

use crate::backends::{LocalFs, MemFs, TarFs};
use crate::class::{ClassEnv, VfsClass, VfsDir, VfsFile};
use crate::config::VfsConfig;
use crate::direntry::local_temp_file;
use crate::error::{VfsError, VfsResult};
use crate::interrupt::Interrupt;
use crate::path;
use crate::stamp::Gc;
use crate::types::{ClassId, CtlOp, DirEntry, OpenFlags, SetCtl, Stat, VfsId};

/// First number handed out for open files.
const FIRST_FD: u32 = 3;

const COPY_CHUNK: usize = 8192;

/// An open file, as seen by callers of the facade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fd(pub u32);

/// An open directory stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DirHandle(pub u32);

struct OpenFile {
    class: ClassId,
    file: Box<dyn VfsFile>,
}

struct OpenDir {
    class: ClassId,
    dir: Box<dyn VfsDir>,
}

/// Slot table with the lowest free slot reused first.
struct Table<T> {
    slots: Vec<Option<T>>,
    limit: usize,
}

impl<T> Table<T> {
    fn new(limit: usize) -> Self {
        Self {
            slots: Vec::new(),
            limit,
        }
    }

    fn has_room(&self) -> bool {
        self.slots.iter().any(Option::is_none) || self.slots.len() < self.limit
    }

    fn insert(&mut self, value: T) -> VfsResult<u32> {
        let slot = match self.slots.iter().position(Option::is_none) {
            Some(slot) => slot,
            None if self.slots.len() < self.limit => {
                self.slots.push(None);
                self.slots.len() - 1
            }
            None => return Err(VfsError::TooManyOpenFiles),
        };
        self.slots[slot] = Some(value);
        Ok(slot as u32 + FIRST_FD)
    }

    fn get_mut(&mut self, handle: u32) -> VfsResult<&mut T> {
        handle
            .checked_sub(FIRST_FD)
            .and_then(|slot| self.slots.get_mut(slot as usize))
            .and_then(Option::as_mut)
            .ok_or(VfsError::BadHandle)
    }

    fn remove(&mut self, handle: u32) -> VfsResult<T> {
        handle
            .checked_sub(FIRST_FD)
            .and_then(|slot| self.slots.get_mut(slot as usize))
            .and_then(Option::take)
            .ok_or(VfsError::BadHandle)
    }

    fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }
}

/// The VFS: registered classes plus process-wide state.
pub struct VfsContext {
    classes: Vec<Arc<dyn VfsClass>>,
    gc: Gc,
    interrupt: Interrupt,
    config: Arc<VfsConfig>,
    files: Mutex<Table<OpenFile>>,
    dirs: Mutex<Table<OpenDir>>,
    cwd: Mutex<String>,
    errno: AtomicI32,
}

impl std::fmt::Debug for VfsContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.classes.iter().map(|c| c.info().name.as_str()).collect();
        f.debug_struct("VfsContext")
            .field("classes", &names)
            .field("cwd", &*self.cwd.lock())
            .field("open_files", &self.files.lock().len())
            .finish()
    }
}

impl Default for VfsContext {
    fn default() -> Self {
        Self::new(VfsConfig::default())
    }
}

impl VfsContext {
    /// A context with only the local class registered.
    pub fn new(config: VfsConfig) -> Self {
        let cwd = std::env::current_dir()
            .ok()
            .and_then(|p| p.to_str().map(str::to_string))
            .unwrap_or_else(|| "/".to_string());
        let mut ctx = Self {
            classes: Vec::new(),
            gc: Gc::new(),
            interrupt: Interrupt::new(),
            files: Mutex::new(Table::new(config.max_handles)),
            dirs: Mutex::new(Table::new(config.max_handles)),
            config: Arc::new(config),
            cwd: Mutex::new(path::canonicalize(&cwd)),
            errno: AtomicI32::new(0),
        };
        ctx.register(LocalFs::new());
        ctx
    }

    /// A context with the local, memory and tar classes.
    pub fn with_builtin(config: VfsConfig) -> Self {
        let mut ctx = Self::new(config);
        ctx.register(MemFs::memory());
        ctx.register(TarFs::tar());
        ctx
    }

    /// Register a class. Classes are tried in registration order.
    pub fn register(&mut self, class: impl VfsClass + 'static) -> ClassId {
        self.register_arc(Arc::new(class))
    }

    pub fn register_arc(&mut self, class: Arc<dyn VfsClass>) -> ClassId {
        let id = ClassId(self.classes.len());
        class.attach(ClassEnv {
            id,
            gc: self.gc.clone(),
            interrupt: self.interrupt.clone(),
            config: Arc::clone(&self.config),
        });
        tracing::debug!("registered class {} as {:?}", class.info().name, id);
        self.classes.push(class);
        id
    }

    pub fn config(&self) -> &VfsConfig {
        &self.config
    }

    pub fn gc(&self) -> &Gc {
        &self.gc
    }

    /// The flag long transfers poll. Trip it with [`Interrupt::request`].
    pub fn interrupt(&self) -> &Interrupt {
        &self.interrupt
    }

    /// Errno of the last failed call.
    pub fn errno(&self) -> i32 {
        self.errno.load(Ordering::Relaxed)
    }

    pub fn class(&self, id: ClassId) -> Option<&Arc<dyn VfsClass>> {
        self.classes.get(id.0)
    }

    fn claims(&self, op: &str) -> bool {
        self.classes.iter().any(|c| c.which(op))
    }

    /// Canonical absolute form of `path`, relative to the current directory.
    pub fn canon(&self, path: &str) -> String {
        let cwd = self.cwd.lock().clone();
        path::canon(path, &cwd, self.config.tilde_expand, |op| self.claims(op))
    }

    /// The class handling a canonical path.
    fn route(&self, canon: &str) -> (ClassId, &Arc<dyn VfsClass>) {
        if let Some(split) = path::split(canon, |op| self.claims(op))
            && let Some(i) = self.classes.iter().position(|c| c.which(split.op))
        {
            return (ClassId(i), &self.classes[i]);
        }
        (ClassId(0), &self.classes[0])
    }

    fn track<T>(&self, class: &dyn VfsClass, result: VfsResult<T>) -> VfsResult<T> {
        if let Err(e) = &result {
            // Errors without a specific errno defer to the class's own.
            let errno = match e {
                VfsError::Other(_) => class.ferrno().unwrap_or_else(|| e.errno()),
                _ => e.errno(),
            };
            self.errno.store(errno, Ordering::Relaxed);
        }
        result
    }

    fn fail<T>(&self, err: VfsError) -> VfsResult<T> {
        self.errno.store(err.errno(), Ordering::Relaxed);
        Err(err)
    }

    fn with_class<T>(
        &self,
        path: &str,
        op: impl FnOnce(&dyn VfsClass, &str) -> VfsResult<T>,
    ) -> VfsResult<T> {
        let canon = self.canon(path);
        let (_, class) = self.route(&canon);
        self.track(class.as_ref(), op(class.as_ref(), &canon))
    }

    fn with_class2<T>(
        &self,
        from: &str,
        to: &str,
        op: impl FnOnce(&dyn VfsClass, &str, &str) -> VfsResult<T>,
    ) -> VfsResult<T> {
        let from = self.canon(from);
        let to = self.canon(to);
        let (a, class) = self.route(&from);
        let (b, _) = self.route(&to);
        if a != b {
            return self.fail(VfsError::CrossDeviceLink);
        }
        self.track(class.as_ref(), op(class.as_ref(), &from, &to))
    }

    #[tracing::instrument(skip(self), name = "vfs.open")]
    pub fn open(&self, path: &str, flags: OpenFlags, mode: u32) -> VfsResult<Fd> {
        if !self.files.lock().has_room() {
            return self.fail(VfsError::TooManyOpenFiles);
        }
        let canon = self.canon(path);
        let (cid, class) = self.route(&canon);
        let file = self.track(class.as_ref(), class.open(&canon, flags, mode))?;
        let fd = self.files.lock().insert(OpenFile { class: cid, file });
        match fd {
            Ok(fd) => Ok(Fd(fd)),
            Err(e) => self.fail(e),
        }
    }

    fn with_file<T>(&self, fd: Fd, op: impl FnOnce(&mut dyn VfsFile) -> VfsResult<T>) -> VfsResult<T> {
        let mut files = self.files.lock();
        let open = match files.get_mut(fd.0) {
            Ok(open) => open,
            Err(e) => return self.fail(e),
        };
        let class = Arc::clone(&self.classes[open.class.0]);
        let result = op(open.file.as_mut());
        drop(files);
        self.track(class.as_ref(), result)
    }

    pub fn read(&self, fd: Fd, buf: &mut [u8]) -> VfsResult<usize> {
        self.with_file(fd, |f| f.read(buf))
    }

    pub fn write(&self, fd: Fd, buf: &[u8]) -> VfsResult<usize> {
        self.with_file(fd, |f| f.write(buf))
    }

    pub fn lseek(&self, fd: Fd, pos: SeekFrom) -> VfsResult<u64> {
        self.with_file(fd, |f| f.lseek(pos))
    }

    pub fn fstat(&self, fd: Fd) -> VfsResult<Stat> {
        self.with_file(fd, |f| f.fstat())
    }

    pub fn ctl(&self, fd: Fd, op: CtlOp) -> VfsResult<bool> {
        self.with_file(fd, |f| f.ctl(op))
    }

    #[tracing::instrument(skip(self), name = "vfs.close")]
    pub fn close(&self, fd: Fd) -> VfsResult<()> {
        let open = match self.files.lock().remove(fd.0) {
            Ok(open) => open,
            Err(e) => return self.fail(e),
        };
        let class = Arc::clone(&self.classes[open.class.0]);
        self.track(class.as_ref(), open.file.close())
    }

    /// Number of open files.
    pub fn open_files(&self) -> usize {
        self.files.lock().len()
    }

    #[tracing::instrument(skip(self), name = "vfs.stat")]
    pub fn stat(&self, path: &str) -> VfsResult<Stat> {
        self.with_class(path, |c, p| c.stat(p))
    }

    #[tracing::instrument(skip(self), name = "vfs.lstat")]
    pub fn lstat(&self, path: &str) -> VfsResult<Stat> {
        self.with_class(path, |c, p| c.lstat(p))
    }

    pub fn readlink(&self, path: &str) -> VfsResult<String> {
        self.with_class(path, |c, p| c.readlink(p))
    }

    pub fn chmod(&self, path: &str, mode: u32) -> VfsResult<()> {
        self.with_class(path, |c, p| c.chmod(p, mode))
    }

    pub fn chown(&self, path: &str, uid: Option<u32>, gid: Option<u32>) -> VfsResult<()> {
        self.with_class(path, |c, p| c.chown(p, uid, gid))
    }

    pub fn utime(&self, path: &str, atime: SystemTime, mtime: SystemTime) -> VfsResult<()> {
        self.with_class(path, |c, p| c.utime(p, atime, mtime))
    }

    pub fn mknod(&self, path: &str, mode: u32, dev: u64) -> VfsResult<()> {
        self.with_class(path, |c, p| c.mknod(p, mode, dev))
    }

    /// Create `path` as a symlink to `target`. The target is stored as given.
    pub fn symlink(&self, target: &str, path: &str) -> VfsResult<()> {
        self.with_class(path, |c, p| c.symlink(target, p))
    }

    #[tracing::instrument(skip(self), name = "vfs.link")]
    pub fn link(&self, from: &str, to: &str) -> VfsResult<()> {
        self.with_class2(from, to, |c, a, b| c.link(a, b))
    }

    #[tracing::instrument(skip(self), name = "vfs.rename")]
    pub fn rename(&self, from: &str, to: &str) -> VfsResult<()> {
        self.with_class2(from, to, |c, a, b| c.rename(a, b))
    }

    #[tracing::instrument(skip(self), name = "vfs.unlink")]
    pub fn unlink(&self, path: &str) -> VfsResult<()> {
        self.with_class(path, |c, p| c.unlink(p))
    }

    #[tracing::instrument(skip(self), name = "vfs.mkdir")]
    pub fn mkdir(&self, path: &str, mode: u32) -> VfsResult<()> {
        self.with_class(path, |c, p| c.mkdir(p, mode))
    }

    #[tracing::instrument(skip(self), name = "vfs.rmdir")]
    pub fn rmdir(&self, path: &str) -> VfsResult<()> {
        self.with_class(path, |c, p| c.rmdir(p))
    }

    #[tracing::instrument(skip(self), name = "vfs.opendir")]
    pub fn opendir(&self, path: &str) -> VfsResult<DirHandle> {
        if !self.dirs.lock().has_room() {
            return self.fail(VfsError::TooManyOpenFiles);
        }
        let canon = self.canon(path);
        let (cid, class) = self.route(&canon);
        let dir = self.track(class.as_ref(), class.opendir(&canon))?;
        match self.dirs.lock().insert(OpenDir { class: cid, dir }) {
            Ok(h) => Ok(DirHandle(h)),
            Err(e) => self.fail(e),
        }
    }

    fn with_dir<T>(&self, dh: DirHandle, op: impl FnOnce(&mut dyn VfsDir) -> VfsResult<T>) -> VfsResult<T> {
        let mut dirs = self.dirs.lock();
        let open = match dirs.get_mut(dh.0) {
            Ok(open) => open,
            Err(e) => return self.fail(e),
        };
        let class = Arc::clone(&self.classes[open.class.0]);
        let result = op(open.dir.as_mut());
        drop(dirs);
        self.track(class.as_ref(), result)
    }

    pub fn readdir(&self, dh: DirHandle) -> VfsResult<Option<DirEntry>> {
        self.with_dir(dh, |d| d.readdir())
    }

    pub fn telldir(&self, dh: DirHandle) -> VfsResult<Option<usize>> {
        self.with_dir(dh, |d| Ok(d.telldir()))
    }

    pub fn seekdir(&self, dh: DirHandle, pos: usize) -> VfsResult<()> {
        self.with_dir(dh, |d| d.seekdir(pos))
    }

    pub fn closedir(&self, dh: DirHandle) -> VfsResult<()> {
        let open = match self.dirs.lock().remove(dh.0) {
            Ok(open) => open,
            Err(e) => return self.fail(e),
        };
        let class = Arc::clone(&self.classes[open.class.0]);
        self.track(class.as_ref(), open.dir.closedir())
    }

    /// Read a whole directory listing.
    pub fn read_dir(&self, path: &str) -> VfsResult<Vec<DirEntry>> {
        let dh = self.opendir(path)?;
        let mut out = Vec::new();
        let result = loop {
            match self.readdir(dh) {
                Ok(Some(entry)) => out.push(entry),
                Ok(None) => break Ok(out),
                Err(e) => break Err(e),
            }
        };
        self.closedir(dh)?;
        result
    }

    /// Change the current directory.
    ///
    /// The instance being left is stamped once nothing is open on it; the
    /// instance entered is never stamped while it stays current.
    #[tracing::instrument(skip(self), name = "vfs.chdir")]
    pub fn chdir(&self, path: &str) -> VfsResult<()> {
        let canon = self.canon(path);
        let (cid, class) = self.route(&canon);
        self.track(class.as_ref(), class.chdir(&canon))?;

        let old = {
            let mut cwd = self.cwd.lock();
            std::mem::replace(&mut *cwd, canon.clone())
        };
        let (old_cid, old_class) = self.route(&old);
        let old_id = old_class.getid(&old);

        let current = class.getid(&canon).map(|id| (cid, id));
        self.gc.set_current(current);
        if let Some((cid, id)) = current {
            self.gc.rmstamp(cid, id);
        }
        if let Some(id) = old_id {
            self.gc.stamp_create(old_cid, old_class.as_ref(), id);
        }
        Ok(())
    }

    pub fn getcwd(&self) -> String {
        self.cwd.lock().clone()
    }

    /// Whether `path` is handled by a class working on the host filesystem.
    pub fn file_is_local(&self, path: &str) -> bool {
        let canon = self.canon(path);
        self.route(&canon).1.info().is_local()
    }

    pub fn current_is_local(&self) -> bool {
        let cwd = self.getcwd();
        self.route(&cwd).1.info().is_local()
    }

    /// The class and instance `path` lives in, if the instance is open.
    pub fn getid(&self, path: &str) -> Option<(ClassId, VfsId)> {
        let canon = self.canon(path);
        let (cid, class) = self.route(&canon);
        class.getid(&canon).map(|id| (cid, id))
    }

    pub fn setctl(&self, path: &str, op: &SetCtl) -> VfsResult<bool> {
        self.with_class(path, |c, p| c.setctl(p, op))
    }

    /// A host file holding the contents of `path`.
    ///
    /// Classes without their own local copies get a temp file that keeps
    /// the name's extension and the file's permission bits.
    #[tracing::instrument(skip(self), name = "vfs.getlocalcopy")]
    pub fn getlocalcopy(&self, path: &str) -> VfsResult<PathBuf> {
        let canon = self.canon(path);
        let (_, class) = self.route(&canon);
        match class.getlocalcopy(&canon) {
            Err(VfsError::NotSupported) => {}
            other => return self.track(class.as_ref(), other),
        }
        let copied = self.copy_out(class.as_ref(), &canon);
        self.track(class.as_ref(), copied)
    }

    fn copy_out(&self, class: &dyn VfsClass, canon: &str) -> VfsResult<PathBuf> {
        let st = class.stat(canon)?;
        let name = canon.rsplit('/').next().unwrap_or_default();
        let name = path::strip_suffix(name, |op| self.claims(op));
        let tag = class.info().prefix.clone();
        let (mut out, local) = local_temp_file(&self.config.temp_dir(), &tag, name)?;

        let copied = (|| {
            let mut file = class.open(canon, OpenFlags::read(), 0)?;
            let result = self.pump(|buf| file.read(buf), |data| Ok(out.write_all(data)?));
            let closed = file.close();
            result.and(closed)
        })();
        drop(out);

        let copied = copied.and_then(|()| {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&local, std::fs::Permissions::from_mode(st.perm()))
                .map_err(|e| VfsError::from_io(e, local.display().to_string()))
        });
        match copied {
            Ok(()) => Ok(local),
            Err(e) => {
                remove_local(&local);
                Err(e)
            }
        }
    }

    /// Move data in chunks until `read` reports the end, checking the
    /// interrupt flag between chunks.
    fn pump(
        &self,
        mut read: impl FnMut(&mut [u8]) -> VfsResult<usize>,
        mut write: impl FnMut(&[u8]) -> VfsResult<()>,
    ) -> VfsResult<()> {
        self.interrupt.reset();
        let mut buf = vec![0u8; COPY_CHUNK];
        loop {
            if self.interrupt.is_requested() {
                return Err(VfsError::Interrupted);
            }
            let n = read(&mut buf)?;
            if n == 0 {
                return Ok(());
            }
            write(&buf[..n])?;
        }
    }

    /// Give back a copy from [`getlocalcopy`](Self::getlocalcopy). With
    /// `changed`, its contents are written back to `path`. A temp copy made
    /// by the facade is always removed.
    #[tracing::instrument(skip(self), name = "vfs.ungetlocalcopy")]
    pub fn ungetlocalcopy(&self, path: &str, local: &Path, changed: bool) -> VfsResult<()> {
        let canon = self.canon(path);
        let (_, class) = self.route(&canon);
        match class.ungetlocalcopy(&canon, local, changed) {
            Err(VfsError::NotSupported) => {}
            other => return self.track(class.as_ref(), other),
        }

        let result = if changed {
            self.copy_in(class.as_ref(), &canon, local)
        } else {
            Ok(())
        };
        remove_local(local);
        self.track(class.as_ref(), result)
    }

    fn copy_in(&self, class: &dyn VfsClass, canon: &str, local: &Path) -> VfsResult<()> {
        let mut input =
            File::open(local).map_err(|e| VfsError::from_io(e, local.display().to_string()))?;
        let flags = OpenFlags {
            read: false,
            write: true,
            truncate: true,
            ..OpenFlags::default()
        };
        let mut file = class.open(canon, flags, 0)?;
        let result = self.pump(
            |buf| Ok(input.read(buf)?),
            |data| {
                let mut data = data;
                while !data.is_empty() {
                    let n = file.write(data)?;
                    if n == 0 {
                        return Err(VfsError::other("short write"));
                    }
                    data = &data[n..];
                }
                Ok(())
            },
        );
        let closed = file.close();
        result.and(closed)
    }

    /// Every open instance of every class, as VFS paths.
    pub fn fill_names(&self) -> Vec<String> {
        let mut names = Vec::new();
        for class in &self.classes {
            class.fill_names(&mut |name| names.push(name));
        }
        names
    }

    /// Free instances idle for longer than the configured timeout. With
    /// `force`, free every stamped instance now.
    pub fn expire(&self, force: bool) {
        self.gc.expire(&self.classes, force, self.config.timeout());
    }

    /// Body of the periodic GC timer.
    pub fn timeout_handler(&self) {
        self.expire(false);
    }

    /// When the GC timer should fire next. `None` while nothing is stamped.
    pub fn next_timeout(&self) -> Option<Duration> {
        self.gc.next_timeout()
    }

    /// Free everything. Open handles are closed first.
    #[tracing::instrument(skip(self), name = "vfs.shutdown")]
    pub fn shutdown(&self) {
        let files: Vec<OpenFile> = self.files.lock().slots.drain(..).flatten().collect();
        for open in files {
            if let Err(e) = open.file.close() {
                tracing::warn!("close during shutdown failed: {}", e);
            }
        }
        let dirs: Vec<OpenDir> = self.dirs.lock().slots.drain(..).flatten().collect();
        for open in dirs {
            if let Err(e) = open.dir.closedir() {
                tracing::warn!("closedir during shutdown failed: {}", e);
            }
        }

        self.gc.set_current(None);
        self.expire(true);
        for class in self.classes.iter().rev() {
            class.done();
        }
    }
}

fn remove_local(local: &Path) {
    if let Err(e) = std::fs::remove_file(local) {
        tracing::warn!("could not remove local copy {}: {}", local.display(), e);
    }
}
