//! Path lookup inside a superblock.
//!
//! Two strategies share one entry point:
//!
//! * the tree walk scans each directory's children segment by segment and
//!   can create missing segments on request;
//! * the linear lookup keeps one flat root entry per listed directory,
//!   named by the directory's full path, reloads it when the subclass says
//!   it is out of date and never creates anything.
//!
//! Symlinks on intermediate segments are always followed. The final segment
//! follows the caller's policy.

use bitflags::bitflags;
use std::time::{Duration, Instant};

use super::Subclass;
use super::cache::{EntryId, InodeId, Superblock};
use crate::class::Strategy;
use crate::error::{VfsError, VfsResult};
use crate::path::canonicalize;
use crate::types::{S_IFDIR, S_IFREG};

/// Symlink policy for the final path segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Follow {
    /// Return the symlink itself.
    NoFollow,
    /// Follow at most this many more links.
    Hops(u32),
}

/// Default symlink budget.
pub const LINK_FOLLOW: Follow = Follow::Hops(15);

impl Follow {
    /// Policy for a segment that has more path after it.
    fn for_intermediate(self) -> Follow {
        match self {
            Follow::NoFollow => LINK_FOLLOW,
            hops => hops,
        }
    }
}

bitflags! {
    /// Lookup modifiers.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct LookupFlags: u8 {
        /// Create missing segments as directories.
        const MKDIR = 1 << 0;
        /// Create a missing final segment as a file.
        const MKFILE = 1 << 1;
        /// The path names a directory.
        const DIR = 1 << 2;
    }
}

/// One lookup's view of the class-wide state it needs.
pub struct Lookup<'a, S: Subclass> {
    pub sub: &'a S,
    pub strategy: Strategy,
    /// Set by `SetCtl::Flush`; the next freshness check consumes it.
    pub flush: &'a mut bool,
    /// How long a freshly loaded directory listing stays valid.
    pub dir_timeout: Duration,
}

impl<S: Subclass> Lookup<'_, S> {
    /// Resolve `path` to an inode.
    ///
    /// The empty path is the root in tree caches. Linear caches list the
    /// root like any other directory.
    pub fn find_inode(
        &mut self,
        sb: &mut Superblock<S>,
        path: &str,
        follow: Follow,
        mut flags: LookupFlags,
    ) -> VfsResult<InodeId> {
        let path = canonical(path);
        if path.is_empty() {
            match self.strategy {
                Strategy::Tree => return Ok(sb.root),
                Strategy::Linear => flags |= LookupFlags::DIR,
            }
        }
        let ent = self.find_entry(sb, &path, follow, flags)?;
        Ok(sb.entry(ent).ino)
    }

    /// Resolve `path` to the entry naming it.
    pub fn find_entry(
        &mut self,
        sb: &mut Superblock<S>,
        path: &str,
        follow: Follow,
        flags: LookupFlags,
    ) -> VfsResult<EntryId> {
        let root = sb.root;
        match self.strategy {
            Strategy::Tree => self.find_entry_tree(sb, root, path, follow, flags),
            Strategy::Linear => self.find_entry_linear(sb, root, path, follow, flags),
        }
    }

    fn find_entry_tree(
        &mut self,
        sb: &mut Superblock<S>,
        start: InodeId,
        path: &str,
        follow: Follow,
        flags: LookupFlags,
    ) -> VfsResult<EntryId> {
        let path = canonical(path);
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        if segments.is_empty() {
            return Err(VfsError::not_found(path));
        }

        let mut dir = start;
        let mut found = None;
        for (i, segment) in segments.iter().enumerate() {
            let last = i + 1 == segments.len();
            if !sb.inode(dir).st.is_dir() {
                return Err(VfsError::not_a_directory(segments[..i].join("/")));
            }

            let ent = match sb.lookup_child(dir, segment) {
                Some(ent) => ent,
                None if flags.intersects(LookupFlags::MKDIR | LookupFlags::MKFILE) => {
                    let mode = if !last || flags.contains(LookupFlags::MKDIR) {
                        S_IFDIR | 0o777
                    } else {
                        S_IFREG | 0o777
                    };
                    let ent = sb.generate_entry(self.sub, segment, mode);
                    sb.insert_entry(dir, ent);
                    ent
                }
                None => return Err(VfsError::not_found(segments[..=i].join("/"))),
            };

            let policy = if last { follow } else { follow.for_intermediate() };
            let ent = self.resolve_symlink(sb, ent, policy)?;
            dir = sb.entry(ent).ino;
            found = Some(ent);
        }

        found.ok_or_else(|| VfsError::not_found(path))
    }

    fn find_entry_linear(
        &mut self,
        sb: &mut Superblock<S>,
        root: InodeId,
        path: &str,
        follow: Follow,
        flags: LookupFlags,
    ) -> VfsResult<EntryId> {
        if root != sb.root {
            panic!("linear lookup must start at the real root");
        }
        let path = canonical(path);

        if !flags.contains(LookupFlags::DIR) {
            let (dirname, name) = match path.rfind('/') {
                Some(slash) => (&path[..slash], &path[slash + 1..]),
                None => ("", path.as_str()),
            };
            let dir = self.find_inode(sb, dirname, follow, flags | LookupFlags::DIR)?;
            let plain = flags - (LookupFlags::MKDIR | LookupFlags::MKFILE);
            return self.find_entry_tree(sb, dir, name, follow, plain);
        }

        let mut ent = sb.lookup_child(root, &path);
        if let Some(cached) = ent {
            let stale = std::mem::take(&mut *self.flush)
                || !self.sub.dir_uptodate(sb.inode(sb.entry(cached).ino));
            if stale && !sb.want_stale {
                tracing::info!("directory cache expired for {}", display(&path));
                sb.free_entry(self.sub, cached);
                ent = None;
            }
        }

        if ent.is_none() {
            let st = sb.default_stat(S_IFDIR | 0o755);
            let ino = sb.new_inode(self.sub, st);
            sb.inode_mut(ino).timestamp = Instant::now() + self.dir_timeout;
            let new = sb.new_entry(self.sub, &path, ino);
            if let Err(e) = self.sub.dir_load(sb, ino, &path) {
                sb.free_entry(self.sub, new);
                return Err(e);
            }
            sb.insert_entry(root, new);
            ent = sb.lookup_child(root, &path);
        }

        match ent {
            Some(ent) => Ok(ent),
            None => panic!("directory {} vanished right after loading", display(&path)),
        }
    }

    /// Follow `ent` if it is a symlink and `follow` allows it.
    ///
    /// Relative targets are taken from the symlink's directory, absolute
    /// ones from the instance root.
    pub fn resolve_symlink(
        &mut self,
        sb: &mut Superblock<S>,
        ent: EntryId,
        follow: Follow,
    ) -> VfsResult<EntryId> {
        let hops = match follow {
            Follow::NoFollow => return Ok(ent),
            Follow::Hops(hops) => hops,
        };

        let entry = sb.entry(ent);
        let ino = sb.inode(entry.ino);
        if !ino.st.is_symlink() {
            return Ok(ent);
        }
        if hops == 0 {
            return Err(VfsError::TooManySymlinks);
        }
        let Some(link) = ino.linkname.clone() else {
            return Err(VfsError::not_found(entry.name.clone()));
        };

        let target = if link.starts_with('/') {
            link
        } else {
            let flat = self.strategy == Strategy::Linear;
            match entry.dir.and_then(|dir| sb.fullpath(dir, flat)) {
                Some(dir) if !dir.is_empty() => format!("{dir}/{link}"),
                _ => link,
            }
        };

        self.find_entry(sb, &target, Follow::Hops(hops - 1), LookupFlags::empty())
    }
}

impl<S: Subclass> Superblock<S> {
    /// Tree lookup for subclasses building their own cache, e.g. while
    /// reading an archive index. Symlinks on the final segment are not
    /// followed.
    pub fn find_inode_tree(
        &mut self,
        sub: &S,
        path: &str,
        flags: LookupFlags,
    ) -> VfsResult<InodeId> {
        let mut flush = false;
        Lookup {
            sub,
            strategy: Strategy::Tree,
            flush: &mut flush,
            dir_timeout: Duration::ZERO,
        }
        .find_inode(self, path, Follow::NoFollow, flags)
    }
}

/// Canonical relative form: no leading, trailing or doubled separators.
pub(crate) fn canonical(path: &str) -> String {
    let trimmed = path.trim_start_matches('/');
    if trimmed.is_empty() {
        return String::new();
    }
    let canon = canonicalize(trimmed);
    if canon == "." { String::new() } else { canon }
}

fn display(path: &str) -> &str {
    if path.is_empty() { "/" } else { path }
}
