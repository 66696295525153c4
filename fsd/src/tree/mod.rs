//! The synthetic control-plane tree: a process-wide table of [`Node`]s addressed by a
//! monotonic path ID, mirroring the "non-owning identifier, looked up via a shared table"
//! pattern called out for avoiding parent/child reference cycles.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::SystemTime;

use crate::error::Error;

pub type PathId = u64;

pub const ROOT_PATH_ID: PathId = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Directory,
    File,
    Symlink,
    /// A file whose read/write are intercepted by the control plane rather than served from
    /// its backing buffer verbatim (the shutdown channel, the release byte, a session's error
    /// ring).
    Channel,
}

/// Policy flags a directory can carry, set at creation time by whichever part of the control
/// plane owns that subtree.
#[derive(Debug, Clone, Copy, Default)]
pub struct DirPolicy {
    /// A child directory that becomes empty is automatically unlinked.
    pub unlink_empty_children: bool,
    /// This directory unlinks itself once it has no children.
    pub unlink_when_empty: bool,
    /// Renaming children of this directory is refused.
    pub without_rename: bool,
}

#[derive(Debug)]
pub struct Node {
    pub path_id: PathId,
    pub kind: NodeKind,
    pub parent: Option<PathId>,
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
    pub mtime: Mutex<SystemTime>,
    pub policy: DirPolicy,
    children: Mutex<Vec<(String, PathId)>>,
    content: Mutex<Vec<u8>>,
}

impl Node {
    fn new(path_id: PathId, kind: NodeKind, parent: Option<PathId>, uid: u32, gid: u32, mode: u32) -> Self {
        Self::with_policy(path_id, kind, parent, uid, gid, mode, DirPolicy::default())
    }

    fn with_policy(
        path_id: PathId,
        kind: NodeKind,
        parent: Option<PathId>,
        uid: u32,
        gid: u32,
        mode: u32,
        policy: DirPolicy,
    ) -> Self {
        Self {
            path_id,
            kind,
            parent,
            uid,
            gid,
            mode,
            mtime: Mutex::new(SystemTime::now()),
            policy,
            children: Mutex::new(Vec::new()),
            content: Mutex::new(Vec::new()),
        }
    }

    pub fn touch(&self) {
        *self.mtime.lock().unwrap() = SystemTime::now();
    }

    pub fn read(&self) -> Vec<u8> {
        self.content.lock().unwrap().clone()
    }

    pub fn write_at(&self, offset: u64, data: &[u8]) {
        let mut content = self.content.lock().unwrap();
        let end = offset as usize + data.len();
        if content.len() < end {
            content.resize(end, 0);
        }
        content[offset as usize..end].copy_from_slice(data);
        drop(content);
        self.touch();
    }

    pub fn set_content(&self, data: Vec<u8>) {
        *self.content.lock().unwrap() = data;
        self.touch();
    }

    pub fn truncate(&self, size: u64) {
        self.content.lock().unwrap().resize(size as usize, 0);
        self.touch();
    }

    pub fn size(&self) -> u64 {
        self.content.lock().unwrap().len() as u64
    }
}

/// The process-wide node table. Every [`Node`] is owned here; everything else refers to nodes
/// by [`PathId`] and looks them up on demand, so a child never holds a strong reference to its
/// parent.
pub struct Tree {
    next_id: AtomicU64,
    nodes: RwLock<HashMap<PathId, Arc<Node>>>,
}

impl Tree {
    /// Builds a tree containing only the root directory.
    pub fn new() -> Arc<Self> {
        let tree = Arc::new(Self {
            next_id: AtomicU64::new(ROOT_PATH_ID + 1),
            nodes: RwLock::new(HashMap::new()),
        });
        let root = Node::new(ROOT_PATH_ID, NodeKind::Directory, None, 0, 0, 0o755);
        tree.nodes.write().unwrap().insert(ROOT_PATH_ID, Arc::new(root));
        tree
    }

    fn alloc_id(&self) -> PathId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn get(&self, path_id: PathId) -> Result<Arc<Node>, Error> {
        self.nodes
            .read()
            .unwrap()
            .get(&path_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(path_id.to_string()))
    }

    fn dir(&self, path_id: PathId) -> Result<Arc<Node>, Error> {
        let node = self.get(path_id)?;
        if node.kind != NodeKind::Directory {
            return Err(Error::NotADirectory(path_id.to_string()));
        }
        Ok(node)
    }

    pub fn lookup_child(&self, parent: PathId, name: &str) -> Option<PathId> {
        let node = self.get(parent).ok()?;
        let children = node.children.lock().unwrap();
        children.iter().find(|(n, _)| n == name).map(|(_, id)| *id)
    }

    pub fn readdir(&self, parent: PathId) -> Result<Vec<(String, PathId)>, Error> {
        let node = self.dir(parent)?;
        Ok(node.children.lock().unwrap().clone())
    }

    /// Creates directory `name` under `parent` with `mode`. Idempotent: if a directory with
    /// that name already exists, returns it unchanged, matching the MkdirAll contract.
    pub fn mkdir(&self, parent: PathId, name: &str, uid: u32, gid: u32, mode: u32) -> Result<Arc<Node>, Error> {
        self.mkdir_with_policy(parent, name, uid, gid, mode, DirPolicy::default())
    }

    /// Like [`Tree::mkdir`], but a freshly created directory carries `policy` from the moment
    /// it's inserted. `policy` isn't mutable once a node exists, so whoever wants a directory to
    /// cascade-clean must ask for that here rather than flip the flag afterward.
    pub fn mkdir_with_policy(
        &self,
        parent: PathId,
        name: &str,
        uid: u32,
        gid: u32,
        mode: u32,
        policy: DirPolicy,
    ) -> Result<Arc<Node>, Error> {
        let parent_node = self.dir(parent)?;
        if let Some(existing) = self.lookup_child(parent, name) {
            let existing = self.get(existing)?;
            return if existing.kind == NodeKind::Directory {
                Ok(existing)
            } else {
                Err(Error::AlreadyExists(name.to_owned()))
            };
        }
        let id = self.alloc_id();
        let node = Arc::new(Node::with_policy(id, NodeKind::Directory, Some(parent), uid, gid, mode, policy));
        self.nodes.write().unwrap().insert(id, node.clone());
        parent_node.children.lock().unwrap().push((name.to_owned(), id));
        parent_node.touch();
        Ok(node)
    }

    /// Creates directories for each component of `path` under `parent`, in order.
    pub fn mkdir_all(&self, parent: PathId, path: &[&str], uid: u32, gid: u32, mode: u32) -> Result<PathId, Error> {
        let mut current = parent;
        for component in path {
            current = self.mkdir(current, component, uid, gid, mode)?.path_id;
        }
        Ok(current)
    }

    pub fn create_node(
        &self,
        parent: PathId,
        name: &str,
        kind: NodeKind,
        uid: u32,
        gid: u32,
        mode: u32,
    ) -> Result<Arc<Node>, Error> {
        let parent_node = self.dir(parent)?;
        if self.lookup_child(parent, name).is_some() {
            return Err(Error::AlreadyExists(name.to_owned()));
        }
        let id = self.alloc_id();
        let node = Arc::new(Node::new(id, kind, Some(parent), uid, gid, mode));
        self.nodes.write().unwrap().insert(id, node.clone());
        parent_node.children.lock().unwrap().push((name.to_owned(), id));
        parent_node.touch();
        Ok(node)
    }

    /// Removes `name` from `parent`, returning the removed node. Cascades up through ancestors
    /// whose *unlink-empty-children*/*unlink-when-empty* policy now applies.
    pub fn unlink(&self, parent: PathId, name: &str) -> Result<Arc<Node>, Error> {
        let parent_node = self.dir(parent)?;
        let removed_id = {
            let mut children = parent_node.children.lock().unwrap();
            let index = children
                .iter()
                .position(|(n, _)| n == name)
                .ok_or_else(|| Error::NotFound(name.to_owned()))?;
            children.remove(index).1
        };
        parent_node.touch();
        let removed = self.nodes.write().unwrap().remove(&removed_id).ok_or_else(|| Error::NotFound(name.to_owned()))?;
        self.cascade_cleanup(parent)?;
        Ok(removed)
    }

    fn cascade_cleanup(&self, dir_id: PathId) -> Result<(), Error> {
        let mut current = dir_id;
        loop {
            let node = match self.get(current) {
                Ok(node) => node,
                Err(_) => return Ok(()),
            };
            let is_empty = node.children.lock().unwrap().is_empty();
            if !is_empty {
                return Ok(());
            }
            let Some(parent) = node.parent else { return Ok(()) };
            let parent_node = self.get(parent)?;
            let should_remove = if current == dir_id {
                node.policy.unlink_when_empty
            } else {
                parent_node.policy.unlink_empty_children
            };
            if !should_remove {
                return Ok(());
            }
            let name = {
                let children = parent_node.children.lock().unwrap();
                children.iter().find(|(_, id)| *id == current).map(|(n, _)| n.clone())
            };
            let Some(name) = name else { return Ok(()) };
            self.unlink(parent, &name)?;
            current = parent;
        }
    }
}

impl Default for Tree {
    fn default() -> Self {
        // `Tree::new` returns an `Arc<Tree>` because the tree is always shared; `Default` exists
        // only so tests can build one without spelling out `Arc::new`'s inverse.
        let tree = Tree {
            next_id: AtomicU64::new(ROOT_PATH_ID + 1),
            nodes: RwLock::new(HashMap::new()),
        };
        tree.nodes
            .write()
            .unwrap()
            .insert(ROOT_PATH_ID, Arc::new(Node::new(ROOT_PATH_ID, NodeKind::Directory, None, 0, 0, 0o755)));
        tree
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mkdir_all_is_idempotent() {
        let tree = Tree::new();
        let a = tree.mkdir_all(ROOT_PATH_ID, &["mounts", "fuse"], 0, 0, 0o755).unwrap();
        let b = tree.mkdir_all(ROOT_PATH_ID, &["mounts", "fuse"], 0, 0, 0o755).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn readdir_reflects_insertion_order() {
        let tree = Tree::new();
        tree.create_node(ROOT_PATH_ID, "b", NodeKind::File, 0, 0, 0o644).unwrap();
        tree.create_node(ROOT_PATH_ID, "a", NodeKind::File, 0, 0, 0o644).unwrap();
        let entries = tree.readdir(ROOT_PATH_ID).unwrap();
        let names: Vec<_> = entries.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["b", "a"]);
    }

    #[test]
    fn unlink_is_exactly_once() {
        let tree = Tree::new();
        tree.create_node(ROOT_PATH_ID, "f", NodeKind::File, 0, 0, 0o644).unwrap();
        tree.unlink(ROOT_PATH_ID, "f").unwrap();
        assert!(matches!(tree.unlink(ROOT_PATH_ID, "f"), Err(Error::NotFound(_))));
    }

    #[test]
    fn without_a_policy_an_emptied_directory_stays() {
        let tree = Tree::new();
        let mounts = tree.mkdir(ROOT_PATH_ID, "mounts", 0, 0, 0o755).unwrap();
        let fuse_id = tree.mkdir(mounts.path_id, "fuse", 0, 0, 0o755).unwrap().path_id;
        tree.create_node(fuse_id, "x.json", NodeKind::File, 0, 0, 0o644).unwrap();
        tree.unlink(fuse_id, "x.json").unwrap();
        assert!(tree.lookup_child(mounts.path_id, "fuse").is_some());
    }

    #[test]
    fn unlink_when_empty_cascades_up_through_every_policy_directory() {
        let tree = Tree::new();
        let mounts = tree.mkdir(ROOT_PATH_ID, "mounts", 0, 0, 0o755).unwrap();
        let policy = DirPolicy { unlink_when_empty: true, ..Default::default() };
        let fuse = tree.mkdir_with_policy(mounts.path_id, "fuse", 0, 0, 0o755, policy).unwrap();
        let keyfs = tree.mkdir_with_policy(fuse.path_id, "keyfs", 0, 0, 0o755, policy).unwrap();
        tree.create_node(keyfs.path_id, "x.json", NodeKind::File, 0, 0, 0o644).unwrap();

        tree.unlink(keyfs.path_id, "x.json").unwrap();

        assert!(tree.get(keyfs.path_id).is_err(), "emptied guest-tag directory should cascade away");
        assert!(tree.get(fuse.path_id).is_err(), "emptied host-tag directory should cascade away too");
        assert!(tree.lookup_child(ROOT_PATH_ID, "mounts").is_some(), "mounts itself is never removed");
    }

    #[test]
    fn path_ids_are_strictly_increasing() {
        let tree = Tree::new();
        let a = tree.create_node(ROOT_PATH_ID, "a", NodeKind::File, 0, 0, 0o644).unwrap();
        let b = tree.create_node(ROOT_PATH_ID, "b", NodeKind::File, 0, 0, 0o644).unwrap();
        assert!(b.path_id > a.path_id);
    }
}
