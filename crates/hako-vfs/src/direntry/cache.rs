//! Superblock, inode and entry arena.
//!
//! A superblock owns every inode and entry of one backend instance. Inodes
//! and entries refer to each other by id. `st.nlink` of a cached inode is its
//! retain count: one per entry pointing at it plus one per open handle. An
//! inode is freed when its last retain goes away, and a directory inode frees
//! its children first.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Instant, SystemTime};

use super::Subclass;
use crate::types::{S_IFMT, Stat, VfsId};

/// Handle of an inode inside one superblock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InodeId(u64);

/// Handle of an entry inside one superblock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryId(u64);

/// A cached filesystem object.
#[derive(Debug)]
pub struct Inode<D> {
    pub st: Stat,
    /// Child entries in listing order. Empty for non-directories.
    pub children: Vec<EntryId>,
    /// The entry naming this inode in its parent. Only kept for directories
    /// and for the most recent name of a file.
    pub ent: Option<EntryId>,
    /// Symlink target.
    pub linkname: Option<String>,
    /// Host path of a materialized copy of the contents.
    pub localname: Option<PathBuf>,
    /// Directory listing stays fresh until this instant.
    pub timestamp: Instant,
    pub data: D,
}

/// A named edge from a directory to an inode.
#[derive(Debug, Clone)]
pub struct Entry {
    pub name: String,
    /// The directory holding this entry, once inserted.
    pub dir: Option<InodeId>,
    pub ino: InodeId,
}

/// Cached state of one backend instance.
pub struct Superblock<S: Subclass> {
    pub id: VfsId,
    /// Outer object this instance was opened from (archive path), may be empty.
    pub archive: String,
    /// The `#op` marker text that selected the class.
    pub op: String,
    pub root: InodeId,
    inodes: HashMap<InodeId, Inode<S::InodeData>>,
    entries: HashMap<EntryId, Entry>,
    next_ino: u64,
    next_entry: u64,
    pub dev: u64,
    /// Open file handles.
    pub fd_usage: usize,
    /// Live inodes.
    pub ino_usage: usize,
    /// Keep serving cached listings even when they may be stale.
    pub want_stale: bool,
    pub data: S::SuperData,
}

impl<S: Subclass> std::fmt::Debug for Superblock<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Superblock")
            .field("id", &self.id)
            .field("archive", &self.archive)
            .field("op", &self.op)
            .field("fd_usage", &self.fd_usage)
            .field("ino_usage", &self.ino_usage)
            .finish()
    }
}

impl<S: Subclass> Superblock<S> {
    /// An empty instance with a fresh root directory.
    pub fn new(sub: &S, id: VfsId, archive: &str, op: &str) -> Self {
        let mut sb = Self {
            id,
            archive: archive.to_string(),
            op: op.to_string(),
            root: InodeId(0),
            inodes: HashMap::new(),
            entries: HashMap::new(),
            next_ino: 1,
            next_entry: 1,
            dev: id.0,
            fd_usage: 0,
            ino_usage: 0,
            want_stale: false,
            data: S::SuperData::default(),
        };
        sb.root = sb.new_root(sub);
        sb
    }

    fn new_root(&mut self, sub: &S) -> InodeId {
        let st = self.default_stat(crate::types::S_IFDIR | 0o755);
        self.new_inode(sub, st)
    }

    pub fn inode(&self, id: InodeId) -> &Inode<S::InodeData> {
        match self.inodes.get(&id) {
            Some(ino) => ino,
            None => panic!("inode {id:?} is not in superblock {:?}", self.id),
        }
    }

    pub fn inode_mut(&mut self, id: InodeId) -> &mut Inode<S::InodeData> {
        let sb = self.id;
        match self.inodes.get_mut(&id) {
            Some(ino) => ino,
            None => panic!("inode {id:?} is not in superblock {sb:?}"),
        }
    }

    pub fn entry(&self, id: EntryId) -> &Entry {
        match self.entries.get(&id) {
            Some(ent) => ent,
            None => panic!("entry {id:?} is not in superblock {:?}", self.id),
        }
    }

    pub fn has_inode(&self, id: InodeId) -> bool {
        self.inodes.contains_key(&id)
    }

    pub fn has_entry(&self, id: EntryId) -> bool {
        self.entries.contains_key(&id)
    }

    /// Number of live entries pointing at `ino`.
    pub fn entries_pointing_at(&self, ino: InodeId) -> usize {
        self.entries
            .values()
            .filter(|e| e.ino == ino && e.dir.is_some())
            .count()
    }

    /// Stat template for objects the backend does not describe itself.
    ///
    /// The mode is filtered through the process umask, owner is the current
    /// user and all times are now.
    pub fn default_stat(&mut self, mode: u32) -> Stat {
        let mask = current_umask();
        let now = SystemTime::now();
        Stat {
            mode: (mode & S_IFMT) | (mode & !S_IFMT & !mask),
            uid: rustix::process::getuid().as_raw(),
            gid: rustix::process::getgid().as_raw(),
            atime: now,
            mtime: now,
            ctime: now,
            nlink: 1,
            ..Default::default()
        }
    }

    /// Allocate an inode. Its link count starts at zero; inserting an entry
    /// for it is what retains it.
    pub fn new_inode(&mut self, sub: &S, mut st: Stat) -> InodeId {
        let id = InodeId(self.next_ino);
        self.next_ino += 1;

        st.nlink = 0;
        st.ino = id.0;
        st.dev = self.dev;

        let mut ino = Inode {
            st,
            children: Vec::new(),
            ent: None,
            linkname: None,
            localname: None,
            timestamp: Instant::now(),
            data: S::InodeData::default(),
        };
        sub.init_inode(&mut ino);
        self.inodes.insert(id, ino);
        self.ino_usage += 1;
        id
    }

    /// Allocate an entry naming `ino`. It is not part of any directory yet.
    pub fn new_entry(&mut self, sub: &S, name: &str, ino: InodeId) -> EntryId {
        let id = EntryId(self.next_entry);
        self.next_entry += 1;

        let mut ent = Entry {
            name: name.to_string(),
            dir: None,
            ino,
        };
        sub.init_entry(&mut ent);
        self.entries.insert(id, ent);
        self.inode_mut(ino).ent = Some(id);
        id
    }

    /// Append `ent` to `dir`'s listing and retain its inode.
    pub fn insert_entry(&mut self, dir: InodeId, ent: EntryId) {
        let ino = {
            let entry = self.entries.get_mut(&ent);
            let Some(entry) = entry else {
                panic!("entry {ent:?} is not in superblock {:?}", self.id);
            };
            entry.dir = Some(dir);
            entry.ino
        };
        self.inode_mut(dir).children.push(ent);
        self.inode_mut(ino).st.nlink += 1;
    }

    /// Make a new inode with a default stat and an entry for it.
    pub fn generate_entry(&mut self, sub: &S, name: &str, mode: u32) -> EntryId {
        let st = self.default_stat(mode);
        let ino = self.new_inode(sub, st);
        self.new_entry(sub, name, ino)
    }

    /// Detach `ent` from its directory and release its inode.
    pub fn free_entry(&mut self, sub: &S, ent: EntryId) {
        let Some(entry) = self.entries.remove(&ent) else {
            panic!("entry {ent:?} is not in superblock {:?}", self.id);
        };
        if let Some(dir) = entry.dir
            && let Some(parent) = self.inodes.get_mut(&dir)
        {
            parent.children.retain(|e| *e != ent);
        }
        if let Some(ino) = self.inodes.get_mut(&entry.ino)
            && ino.ent == Some(ent)
        {
            ino.ent = None;
        }
        self.free_inode(sub, entry.ino);
    }

    /// Drop one retain of `id`, freeing it when it was the last.
    pub fn free_inode(&mut self, sub: &S, id: InodeId) {
        {
            let ino = self.inode_mut(id);
            if ino.st.nlink > 1 {
                ino.st.nlink -= 1;
                return;
            }
        }

        while let Some(&child) = self.inode(id).children.first() {
            self.free_entry(sub, child);
        }

        let Some(mut ino) = self.inodes.remove(&id) else {
            return;
        };
        sub.free_inode(&mut ino);
        if let Some(local) = ino.localname.take()
            && let Err(e) = std::fs::remove_file(&local)
        {
            tracing::warn!("could not remove local copy {}: {}", local.display(), e);
        }
        self.ino_usage -= 1;
    }

    /// Move `ent` into `dir` under `name`. Its inode keeps its retain count.
    pub fn move_entry(&mut self, ent: EntryId, dir: InodeId, name: &str) {
        let old_dir = self.entry(ent).dir;
        if let Some(old) = old_dir
            && let Some(parent) = self.inodes.get_mut(&old)
        {
            parent.children.retain(|e| *e != ent);
        }
        if let Some(entry) = self.entries.get_mut(&ent) {
            entry.name = name.to_string();
            entry.dir = Some(dir);
        }
        self.inode_mut(dir).children.push(ent);
    }

    /// Find the child of `dir` called `name`.
    pub fn lookup_child(&self, dir: InodeId, name: &str) -> Option<EntryId> {
        self.inode(dir)
            .children
            .iter()
            .copied()
            .find(|e| self.entry(*e).name == name)
    }

    /// Path of `ino` relative to the root, rebuilt from the entry graph.
    ///
    /// Tree-family caches walk the parent chain. Linear caches keep whole
    /// directory paths as the names of root entries, so the path is the
    /// parent's name joined with the inode's own. Returns `None` for
    /// unnamed inodes other than the root.
    pub fn fullpath(&self, ino: InodeId, flat: bool) -> Option<String> {
        if ino == self.root {
            return Some(String::new());
        }
        let ent = self.entry(self.inode(ino).ent?);

        if flat {
            let parent_name = ent
                .dir
                .and_then(|dir| self.inode(dir).ent)
                .map(|pe| self.entry(pe).name.as_str());
            return Some(match parent_name {
                Some(parent) if !parent.is_empty() => format!("{parent}/{}", ent.name),
                _ => ent.name.clone(),
            });
        }

        let mut parts = vec![ent.name.as_str()];
        let mut dir = ent.dir?;
        while dir != self.root {
            let pe = self.entry(self.inode(dir).ent?);
            parts.push(pe.name.as_str());
            dir = pe.dir?;
        }
        parts.reverse();
        Some(parts.join("/"))
    }

    /// Throw the cached tree away, unless stale data was asked for.
    pub fn invalidate(&mut self, sub: &S) {
        if self.want_stale {
            return;
        }
        tracing::debug!("invalidating cache of {:?}", self.id);
        let old = self.root;
        self.free_inode(sub, old);
        self.root = self.new_root(sub);
    }

    /// Free the whole tree. Used when the instance goes away.
    pub(crate) fn free_tree(&mut self, sub: &S) {
        let root = self.root;
        if self.inodes.contains_key(&root) {
            self.free_inode(sub, root);
        }
    }
}

fn current_umask() -> u32 {
    use rustix::fs::Mode;
    let old = rustix::process::umask(Mode::from_bits_truncate(0o022));
    rustix::process::umask(old);
    old.bits() as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::direntry::tests::Plain;
    use crate::types::{S_IFDIR, S_IFREG};

    fn superblock() -> Superblock<Plain> {
        Superblock::new(&Plain, VfsId(1), "/a.tar", "utar")
    }

    #[test]
    fn test_insert_retains_and_free_releases() {
        let mut sb = superblock();
        let root = sb.root;
        let ent = sb.generate_entry(&Plain, "file", S_IFREG | 0o644);
        let ino = sb.entry(ent).ino;
        assert_eq!(sb.inode(ino).st.nlink, 0);

        sb.insert_entry(root, ent);
        assert_eq!(sb.inode(ino).st.nlink, 1);
        assert_eq!(sb.lookup_child(root, "file"), Some(ent));

        sb.free_entry(&Plain, ent);
        assert!(!sb.has_inode(ino));
        assert!(sb.lookup_child(root, "file").is_none());
        assert_eq!(sb.ino_usage, 1);
    }

    #[test]
    fn test_hardlink_keeps_inode_alive() {
        let mut sb = superblock();
        let root = sb.root;
        let first = sb.generate_entry(&Plain, "a", S_IFREG | 0o644);
        let ino = sb.entry(first).ino;
        sb.insert_entry(root, first);
        let second = sb.new_entry(&Plain, "b", ino);
        sb.insert_entry(root, second);
        assert_eq!(sb.inode(ino).st.nlink, 2);

        sb.free_entry(&Plain, first);
        assert!(sb.has_inode(ino));
        assert_eq!(sb.inode(ino).st.nlink, 1);
        assert_eq!(sb.entries_pointing_at(ino), 1);

        sb.free_entry(&Plain, second);
        assert!(!sb.has_inode(ino));
    }

    #[test]
    fn test_directory_frees_children_first() {
        let mut sb = superblock();
        let root = sb.root;
        let dir = sb.generate_entry(&Plain, "d", S_IFDIR | 0o755);
        sb.insert_entry(root, dir);
        let dir_ino = sb.entry(dir).ino;
        let child = sb.generate_entry(&Plain, "f", S_IFREG | 0o644);
        sb.insert_entry(dir_ino, child);
        let child_ino = sb.entry(child).ino;
        assert_eq!(sb.ino_usage, 3);

        sb.free_entry(&Plain, dir);
        assert!(!sb.has_inode(child_ino));
        assert!(!sb.has_entry(child));
        assert_eq!(sb.ino_usage, 1);
    }

    #[test]
    fn test_fullpath_tree_and_flat() {
        let mut sb = superblock();
        let root = sb.root;
        let a = sb.generate_entry(&Plain, "a", S_IFDIR | 0o755);
        sb.insert_entry(root, a);
        let a_ino = sb.entry(a).ino;
        let b = sb.generate_entry(&Plain, "b", S_IFREG | 0o644);
        sb.insert_entry(a_ino, b);
        let b_ino = sb.entry(b).ino;
        assert_eq!(sb.fullpath(b_ino, false).as_deref(), Some("a/b"));
        assert_eq!(sb.fullpath(root, false).as_deref(), Some(""));

        // Flat layout: the root entry's name is the whole directory path.
        let flat = sb.generate_entry(&Plain, "x/y", S_IFDIR | 0o755);
        sb.insert_entry(root, flat);
        let flat_ino = sb.entry(flat).ino;
        let f = sb.generate_entry(&Plain, "f", S_IFREG | 0o644);
        sb.insert_entry(flat_ino, f);
        let f_ino = sb.entry(f).ino;
        assert_eq!(sb.fullpath(f_ino, true).as_deref(), Some("x/y/f"));
    }

    #[test]
    fn test_invalidate_replaces_root() {
        let mut sb = superblock();
        let root = sb.root;
        let ent = sb.generate_entry(&Plain, "f", S_IFREG | 0o644);
        sb.insert_entry(root, ent);

        sb.want_stale = true;
        sb.invalidate(&Plain);
        assert_eq!(sb.root, root);

        sb.want_stale = false;
        sb.invalidate(&Plain);
        assert_ne!(sb.root, root);
        assert!(sb.inode(sb.root).children.is_empty());
        assert_eq!(sb.ino_usage, 1);
    }
}
