//! Open files of the generic directory cache.
//!
//! A handle reads from one of three places: a local copy of the contents
//! (temp-file classes, or anything that set `localname`), a one-shot stream
//! (`linear` opens) or the subclass's own `fh_read`/`fh_write`.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::cache::{InodeId, Superblock};
use super::resolve::{self, LINK_FOLLOW, Lookup, LookupFlags};
use super::{DirCache, Shared, Subclass};
use crate::class::{ClassFlags, VfsFile};
use crate::error::{VfsError, VfsResult};
use crate::types::{OpenFlags, S_IFREG, Stat, VfsId};

const CHUNK: usize = 8192;

/// Where a streaming read is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinearState {
    /// Ordinary random-access handle.
    NotLinear,
    /// Opened for streaming; the stream starts on the first read.
    PreOpen,
    /// Streaming. Seeking is a programming error now.
    Open,
    /// The stream finished or was cut short.
    Closed,
}

/// Per-open state. Subclasses keep their own bits in `data`.
#[derive(Debug)]
pub struct FileHandle<D> {
    pub ino: InodeId,
    pub pos: u64,
    /// Open handle on the inode's local copy.
    pub local: Option<File>,
    pub changed: bool,
    pub linear: LinearState,
    pub flags: OpenFlags,
    pub data: D,
}

/// A [`VfsFile`] over a [`DirCache`] inode.
pub struct DirCacheFile<S: Subclass> {
    shared: Arc<Shared<S>>,
    sb: VfsId,
    fh: Option<FileHandle<S::FileData>>,
}

impl<S: Subclass> DirCacheFile<S> {
    /// The inode this handle holds open.
    pub fn inode(&self) -> Option<InodeId> {
        self.fh.as_ref().map(|fh| fh.ino)
    }

    pub fn linear_state(&self) -> Option<LinearState> {
        self.fh.as_ref().map(|fh| fh.linear)
    }

    fn with_handle<T>(
        &mut self,
        op: impl FnOnce(&S, &mut Superblock<S>, &mut FileHandle<S::FileData>) -> VfsResult<T>,
    ) -> VfsResult<T> {
        let Some(fh) = self.fh.as_mut() else {
            return Err(VfsError::BadHandle);
        };
        let shared = &self.shared;
        let mut state = shared.state.lock();
        let Some(sb) = state.superblock_mut(self.sb) else {
            return shared.track(Err(VfsError::BadHandle));
        };
        shared.track(op(&shared.sub, sb, fh))
    }

    /// Give the handle back: finish streams, store changed local copies and
    /// drop the inode retain. Stamps the instance once it is idle.
    fn release(&mut self) -> VfsResult<()> {
        let Some(mut fh) = self.fh.take() else {
            return Ok(());
        };
        let shared = Arc::clone(&self.shared);
        let env = shared.env();
        let sub = &shared.sub;
        let flat = shared.flat();

        let (result, idle) = {
            let mut state = shared.state.lock();
            let mut stored = None;
            let Some(sb) = state.superblock_mut(self.sb) else {
                return shared.track(Err(VfsError::BadHandle));
            };
            sb.fd_usage = sb.fd_usage.saturating_sub(1);

            let mut result = match fh.linear {
                LinearState::Open => {
                    sub.linear_close(sb, &mut fh);
                    Ok(())
                }
                LinearState::NotLinear => sub.fh_close(sb, &mut fh),
                LinearState::PreOpen | LinearState::Closed => Ok(()),
            };
            fh.local = None;

            if fh.changed
                && let Some(local) = sb.inode(fh.ino).localname.clone()
            {
                match sb.fullpath(fh.ino, flat) {
                    Some(full) => match sub.file_store(sb, fh.ino, &full, &local) {
                        Ok(()) => stored = Some(full),
                        Err(VfsError::NotSupported) => {
                            tracing::warn!("{}: cannot store {}, changes lost", shared.info.name, full);
                        }
                        Err(e) => result = result.and(Err(e)),
                    },
                    None => tracing::warn!(
                        "{}: {} no longer has a name, changes lost",
                        shared.info.name,
                        local.display()
                    ),
                }
                sb.invalidate(sub);
            }

            sb.free_inode(sub, fh.ino);
            let idle = (sb.fd_usage == 0).then_some(sb.id);
            if let Some(full) = stored {
                state.log(format_args!("store {full}"));
            }
            (result, idle)
        };

        if let Some(id) = idle {
            let class = DirCache {
                shared: Arc::clone(&shared),
            };
            env.gc.stamp_create(env.id, &class, id);
        }
        shared.track(result)
    }
}

impl<S: Subclass> Drop for DirCacheFile<S> {
    fn drop(&mut self) {
        if self.fh.is_some()
            && let Err(e) = self.release()
        {
            tracing::warn!("{}: close on drop failed: {}", self.shared.info.name, e);
        }
    }
}

impl<S: Subclass> VfsFile for DirCacheFile<S> {
    fn read(&mut self, buf: &mut [u8]) -> VfsResult<usize> {
        let interrupt = self.shared.env().interrupt.clone();
        self.with_handle(|sub, sb, fh| {
            match fh.linear {
                LinearState::PreOpen => {
                    let pos = fh.pos;
                    sub.linear_start(sb, fh, pos)?;
                    fh.linear = LinearState::Open;
                }
                LinearState::Closed => return Ok(0),
                LinearState::Open | LinearState::NotLinear => {}
            }

            if fh.linear == LinearState::Open {
                if interrupt.is_requested() {
                    sub.linear_close(sb, fh);
                    fh.linear = LinearState::Closed;
                    return Err(VfsError::Interrupted);
                }
                let n = match sub.linear_read(sb, fh, buf) {
                    Ok(n) => n,
                    Err(e) => {
                        sub.linear_close(sb, fh);
                        fh.linear = LinearState::Closed;
                        return Err(e);
                    }
                };
                if n == 0 {
                    sub.linear_close(sb, fh);
                    fh.linear = LinearState::Closed;
                }
                fh.pos += n as u64;
                return Ok(n);
            }

            let n = match fh.local.as_mut() {
                Some(local) => local.read(buf)?,
                None => sub.fh_read(sb, fh, buf)?,
            };
            fh.pos += n as u64;
            Ok(n)
        })
    }

    fn write(&mut self, buf: &[u8]) -> VfsResult<usize> {
        self.with_handle(|sub, sb, fh| {
            if fh.linear != LinearState::NotLinear || !fh.flags.wants_write() {
                return Err(VfsError::BadHandle);
            }
            fh.changed = true;
            let n = match fh.local.as_mut() {
                Some(local) => local.write(buf)?,
                None => {
                    sub.fh_write(sb, fh, buf)?;
                    buf.len()
                }
            };
            fh.pos += n as u64;
            Ok(n)
        })
    }

    fn lseek(&mut self, pos: SeekFrom) -> VfsResult<u64> {
        self.with_handle(|_, sb, fh| {
            if fh.linear == LinearState::Open {
                panic!("cannot lseek() after linear_read");
            }
            if let Some(local) = fh.local.as_mut() {
                fh.pos = local.seek(pos)?;
                return Ok(fh.pos);
            }

            let size = sb.inode(fh.ino).st.size.min(i64::MAX as u64) as i64;
            let target = match pos {
                SeekFrom::Start(offset) => offset.min(i64::MAX as u64) as i64,
                SeekFrom::Current(delta) => (fh.pos as i64).saturating_add(delta),
                SeekFrom::End(delta) => size.saturating_add(delta),
            };
            fh.pos = target.clamp(0, size) as u64;
            Ok(fh.pos)
        })
    }

    fn fstat(&mut self) -> VfsResult<Stat> {
        self.with_handle(|_, sb, fh| {
            let mut st = sb.inode(fh.ino).st.clone();
            if fh.changed
                && let Some(local) = fh.local.as_ref()
                && let Ok(meta) = local.metadata()
            {
                st.size = meta.len();
            }
            Ok(st)
        })
    }

    fn close(mut self: Box<Self>) -> VfsResult<()> {
        self.release()
    }
}

impl<S: Subclass> DirCache<S> {
    /// Open `path` inside `sb`. Called with the class lock held.
    pub(crate) fn open_in(
        &self,
        lookup: &mut Lookup<'_, S>,
        sb: &mut Superblock<S>,
        path: &str,
        flags: OpenFlags,
        mode: u32,
    ) -> VfsResult<DirCacheFile<S>> {
        let shared = &self.shared;
        let sub = &shared.sub;
        let env = shared.env();
        let path = resolve::canonical(path);

        let found = match lookup.find_inode(sb, &path, LINK_FOLLOW, LookupFlags::empty()) {
            Ok(ino) => Some(ino),
            Err(VfsError::NotFound(_)) => None,
            Err(e) => return Err(e),
        };

        if found.is_some() && flags.create && flags.exclusive {
            return Err(VfsError::already_exists(path));
        }
        if found.is_none() && !flags.create {
            return Err(VfsError::not_found(path));
        }
        if shared.info.is_read_only() && (found.is_none() || flags.wants_write()) {
            return Err(VfsError::ReadOnly);
        }

        let usetmp = shared.info.flags.contains(ClassFlags::USETMP);
        let mut changed = false;
        let ino = match found {
            Some(ino) => {
                if sb.inode(ino).st.is_dir() {
                    return Err(VfsError::is_a_directory(path));
                }
                ino
            }
            None => {
                let (dirname, name) = match path.rfind('/') {
                    Some(slash) => (&path[..slash], &path[slash + 1..]),
                    None => ("", path.as_str()),
                };
                if name.is_empty() {
                    return Err(VfsError::invalid_path(path.clone()));
                }
                let dir = lookup.find_inode(sb, dirname, LINK_FOLLOW, LookupFlags::DIR)?;
                if !sb.inode(dir).st.is_dir() {
                    return Err(VfsError::not_a_directory(dirname));
                }
                let ent = sb.generate_entry(sub, name, S_IFREG | (mode & 0o7777));
                sb.insert_entry(dir, ent);
                let ino = sb.entry(ent).ino;
                if usetmp {
                    let (_, local) = local_temp_file(&env.config.temp_dir(), &shared.info.prefix, name)?;
                    sb.inode_mut(ino).localname = Some(local);
                    changed = true;
                }
                ino
            }
        };

        let mut fh = FileHandle {
            ino,
            pos: 0,
            local: None,
            changed,
            linear: LinearState::NotLinear,
            flags,
            data: S::FileData::default(),
        };

        if flags.linear && sub.supports_linear() {
            fh.linear = LinearState::PreOpen;
        } else {
            sub.fh_open(sb, &mut fh, flags, mode)?;
            if usetmp && sb.inode(ino).localname.is_none() {
                let name = path.rsplit('/').next().unwrap_or_default();
                if let Err(e) = self.retrieve_file(sb, &mut fh, name) {
                    if let Err(close) = sub.fh_close(sb, &mut fh) {
                        tracing::debug!("{}: fh_close after failed fetch: {}", shared.info.name, close);
                    }
                    return Err(e);
                }
            }
        }

        if fh.linear == LinearState::NotLinear
            && let Some(local) = sb.inode(ino).localname.clone()
        {
            let file = OpenOptions::new()
                .read(true)
                .write(flags.wants_write())
                .append(flags.append)
                .truncate(flags.truncate && flags.wants_write())
                .open(&local);
            match file {
                Ok(file) => fh.local = Some(file),
                Err(e) => {
                    if let Err(close) = sub.fh_close(sb, &mut fh) {
                        tracing::debug!("{}: fh_close after failed open: {}", shared.info.name, close);
                    }
                    return Err(VfsError::from_io(e, local.display().to_string()));
                }
            }
        }

        env.gc.rmstamp(env.id, sb.id);
        sb.fd_usage += 1;
        sb.inode_mut(ino).st.nlink += 1;
        tracing::trace!("{}: opened {} ({:?})", shared.info.name, path, fh.linear);

        Ok(DirCacheFile {
            shared: Arc::clone(shared),
            sb: sb.id,
            fh: Some(fh),
        })
    }

    /// Copy a file's contents into a fresh local temp file through the
    /// subclass's stream.
    fn retrieve_file(
        &self,
        sb: &mut Superblock<S>,
        fh: &mut FileHandle<S::FileData>,
        name: &str,
    ) -> VfsResult<()> {
        let shared = &self.shared;
        let env = shared.env();
        let (mut file, local) = local_temp_file(&env.config.temp_dir(), &shared.info.prefix, name)?;

        env.interrupt.reset();
        let copied = match shared.sub.linear_start(sb, fh, 0) {
            Ok(()) => {
                fh.linear = LinearState::Open;
                let copied = self.copy_stream(sb, fh, &mut file);
                shared.sub.linear_close(sb, fh);
                copied
            }
            Err(e) => Err(e),
        };
        fh.linear = LinearState::NotLinear;
        drop(file);

        match copied {
            Ok(total) => {
                tracing::debug!(
                    "{}: fetched {} bytes of {} into {}",
                    shared.info.name,
                    total,
                    name,
                    local.display()
                );
                sb.inode_mut(fh.ino).localname = Some(local);
                Ok(())
            }
            Err(e) => {
                if let Err(rm) = std::fs::remove_file(&local) {
                    tracing::warn!("could not remove {}: {}", local.display(), rm);
                }
                Err(e)
            }
        }
    }

    fn copy_stream(
        &self,
        sb: &mut Superblock<S>,
        fh: &mut FileHandle<S::FileData>,
        out: &mut File,
    ) -> VfsResult<u64> {
        let interrupt = &self.shared.env().interrupt;
        let mut buf = vec![0u8; CHUNK];
        let mut total = 0u64;
        loop {
            if interrupt.is_requested() {
                return Err(VfsError::Interrupted);
            }
            let n = self.shared.sub.linear_read(sb, fh, &mut buf)?;
            if n == 0 {
                return Ok(total);
            }
            out.write_all(&buf[..n])?;
            total += n as u64;
        }
    }
}

/// Create a kept temp file in `dir` for a local copy of `name`. The
/// extension of `name` is preserved so external viewers recognize the file.
pub fn local_temp_file(dir: &Path, tag: &str, name: &str) -> VfsResult<(File, PathBuf)> {
    let suffix = Path::new(name)
        .extension()
        .map(|ext| format!(".{}", ext.to_string_lossy()))
        .unwrap_or_default();
    let prefix = format!("hako-{}-", tag.replace(['/', ':'], "_"));
    let tmp = tempfile::Builder::new()
        .prefix(&prefix)
        .suffix(&suffix)
        .tempfile_in(dir)
        .map_err(|e| VfsError::from_io(e, dir.display().to_string()))?;
    tmp.keep().map_err(|e| VfsError::Io(e.error))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_temp_file_keeps_extension() {
        let dir = tempfile::tempdir().unwrap();
        let (mut file, path) = local_temp_file(dir.path(), "sh:host", "notes.txt").unwrap();
        file.write_all(b"hi").unwrap();
        drop(file);

        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("hako-sh_host-"), "{name}");
        assert!(name.ends_with(".txt"), "{name}");
        assert_eq!(std::fs::read(&path).unwrap(), b"hi");
    }
}
