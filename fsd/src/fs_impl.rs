//! Bridges the synthetic control-plane tree to the wire protocol. Every operation the dispatch
//! loop ([`crate::dispatch`]) can ask for lives here as a plain async method; the loop itself
//! owns framing and never reaches into the tree directly. Everything either answers straight
//! from the [`Tree`](crate::tree::Tree) or delegates to [`crate::mount`], [`crate::listener`],
//! and [`crate::shutdown`] for the handful of paths that aren't plain files.
//!
//! Fids are tracked in a connection-local table: the per-session error ring needs to live
//! somewhere a fresh connection's state can't reach, so the whole mapping lives here instead of
//! on the wire layer.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Instant, SystemTime};

use tracing::{instrument, warn};

use crate::error::{Error, ErrorRing, ExpectedError, ToErrno};
use crate::listener::{ListenerAddr, ListenerHandle};
use crate::mount::{self, MountTable};
use crate::shutdown::{Disposition, ShutdownGovernor};
use crate::tree::{DirPolicy, NodeKind, PathId, Tree, ROOT_PATH_ID};
use crate::wire::{Qid, QTDIR, QTFILE};

const DIR_MOUNTS: &str = "mounts";
const DIR_LISTENERS: &str = "listeners";
const DIR_CONTROL: &str = "control";
const FILE_SHUTDOWN: &str = "shutdown";
const FILE_RELEASE: &str = "release";
const FILE_ERR: &str = "err";

/// What a fid currently refers to: a real node in the shared tree, or the connection-local
/// error ring (a capability handed out at attach time, not stored in the tree at all).
#[derive(Debug, Clone, Copy)]
enum Target {
    Node(PathId),
    ErrorRing,
}

/// The attributes one `Rgetattr` reports for a node. Separate from [`crate::tree::Node`] itself
/// since the tree doesn't track every field the wire format has room for (`ctime` mirrors
/// `mtime`; `btime`/generation/data-version are always zero).
pub(crate) struct Attr {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub nlink: u64,
    pub rdev: u64,
    pub size: u64,
    pub blksize: u64,
    pub blocks: u64,
    pub atime_sec: u64,
    pub atime_nsec: u64,
    pub mtime_sec: u64,
    pub mtime_nsec: u64,
}

/// Handles one 9P connection. Shares the process-wide tree, mount table, listener table, and
/// shutdown governor with every other connection; owns its fid table and error ring alone.
pub struct ControlPlane {
    pub tree: Arc<Tree>,
    pub mounts: Arc<MountTable>,
    pub listeners: Arc<crate::listener::ListenerTable>,
    pub governor: Arc<ShutdownGovernor>,
    last_activity: Arc<Mutex<Instant>>,
    fids: Mutex<HashMap<u32, Target>>,
    ring: Arc<ErrorRing>,
    uid: u32,
    gid: u32,
}

impl ControlPlane {
    pub fn new(
        tree: Arc<Tree>,
        mounts: Arc<MountTable>,
        listeners: Arc<crate::listener::ListenerTable>,
        governor: Arc<ShutdownGovernor>,
        last_activity: Arc<Mutex<Instant>>,
    ) -> Self {
        Self {
            tree,
            mounts,
            listeners,
            governor,
            last_activity,
            fids: Mutex::new(HashMap::new()),
            ring: Arc::new(ErrorRing::default()),
            uid: 0,
            gid: 0,
        }
    }

    /// Builds the fixed top-level layout (`/mounts`, `/listeners`, `/control/shutdown`,
    /// `/control/release`) the first time a tree is served. Idempotent, since `mkdir` and
    /// `create_node` both already tolerate re-creation or report `AlreadyExists` for a file of
    /// the wrong kind.
    pub fn ensure_layout(tree: &Tree) -> Result<(), Error> {
        tree.mkdir(ROOT_PATH_ID, DIR_MOUNTS, 0, 0, 0o755)?;
        tree.mkdir(ROOT_PATH_ID, DIR_LISTENERS, 0, 0, 0o755)?;
        let control = tree.mkdir(ROOT_PATH_ID, DIR_CONTROL, 0, 0, 0o755)?;
        if tree.lookup_child(control.path_id, FILE_SHUTDOWN).is_none() {
            tree.create_node(control.path_id, FILE_SHUTDOWN, NodeKind::Channel, 0, 0, 0o620)?;
        }
        if tree.lookup_child(control.path_id, FILE_RELEASE).is_none() {
            tree.create_node(control.path_id, FILE_RELEASE, NodeKind::Channel, 0, 0, 0o620)?;
        }
        Ok(())
    }

    fn fid_target(&self, fid: u32) -> Result<Target, Error> {
        self.fids.lock().unwrap().get(&fid).copied().ok_or(Error::UnattachedFid)
    }

    fn bind_fid(&self, fid: u32, target: Target) {
        self.fids.lock().unwrap().insert(fid, target);
    }

    fn record(&self, err: Error) -> Error {
        if !matches!(err, Error::Cancelled) {
            self.ring.push(&err);
        }
        err
    }

    /// Records `err` in the session's error ring (unless it's a cancellation) and returns the
    /// errno the dispatch loop should send back on the wire.
    pub(crate) fn fail(&self, err: Error) -> libc::c_int {
        let errno = err.to_errno();
        if !err.expected_error() {
            warn!(error = %err, "unexpected control-plane error");
        }
        let _ = self.record(err);
        errno
    }

    fn qid(&self, path_id: PathId, kind: NodeKind) -> Qid {
        let typ = if matches!(kind, NodeKind::Directory) { QTDIR } else { QTFILE };
        Qid { typ, version: 0, path: path_id }
    }

    fn attr_for(&self, node: &crate::tree::Node) -> Attr {
        let mtime = node.mtime.lock().unwrap().duration_since(SystemTime::UNIX_EPOCH).unwrap_or_default();
        let mode = match node.kind {
            NodeKind::Directory => 0o040000 | node.mode,
            NodeKind::Symlink => 0o120000 | node.mode,
            _ => 0o100000 | node.mode,
        };
        Attr {
            mode,
            uid: node.uid,
            gid: node.gid,
            nlink: 1,
            rdev: 0,
            size: node.size(),
            blksize: 4096,
            blocks: node.size().div_ceil(4096),
            atime_sec: mtime.as_secs(),
            atime_nsec: mtime.subsec_nanos() as u64,
            mtime_sec: mtime.as_secs(),
            mtime_nsec: mtime.subsec_nanos() as u64,
        }
    }

    /// Dispatches a write to one of the two control-plane files whose content has a side effect
    /// as soon as it lands; every other file is a plain buffered write, including mount point
    /// files — those commit on close (see [`ControlPlane::clunk`]), not on write.
    async fn apply_write_semantics(&self, path_id: PathId, name_hint: &str) -> Result<(), Error> {
        match name_hint {
            FILE_SHUTDOWN => {
                let node = self.tree.get(path_id)?;
                let byte = *node.read().first().ok_or(Error::InvalidDisposition(0))?;
                let disposition = Disposition::from_byte(byte)?;
                self.governor.trigger(disposition);
                Ok(())
            }
            FILE_RELEASE => Ok(()), // detach-without-kill is handled by the IPC layer reading this fid's clunk
            _ => Ok(()),
        }
    }

    /// Whether `path_id` names a file under `/mounts/<host_tag>/<guest_tag>/`.
    fn is_under_mounts(&self, path_id: PathId) -> bool {
        let Some(mounts_dir) = self.tree.lookup_child(ROOT_PATH_ID, DIR_MOUNTS) else { return false };
        let mut current = path_id;
        while let Ok(node) = self.tree.get(current) {
            match node.parent {
                Some(parent) if parent == mounts_dir => return true,
                Some(parent) => current = parent,
                None => return false,
            }
        }
        false
    }

    /// The policy a freshly created directory under `parent` should carry: the host-tag and
    /// guest-tag directories under `/mounts` both unlink themselves once empty, so an unmounted
    /// leaf doesn't leave an empty `host/guest` shell behind. `/mounts` itself is exempt — it
    /// must survive having no mounts at all.
    fn mount_dir_policy(&self, parent: PathId) -> DirPolicy {
        let Some(mounts_dir) = self.tree.lookup_child(ROOT_PATH_ID, DIR_MOUNTS) else {
            return DirPolicy::default();
        };
        let is_host_or_guest_dir = parent == mounts_dir
            || self.tree.get(parent).ok().and_then(|node| node.parent).map(|gp| gp == mounts_dir).unwrap_or(false);
        if is_host_or_guest_dir {
            DirPolicy { unlink_when_empty: true, ..Default::default() }
        } else {
            DirPolicy::default()
        }
    }

    /// Derives `(host_tag, guest_tag)` for a mount point file from its ancestry:
    /// `/mounts/<host_tag>/<guest_tag>/<name>.json`.
    fn mount_path_tags(&self, path_id: PathId) -> Option<(String, String)> {
        let node = self.tree.get(path_id).ok()?;
        let guest_dir = node.parent?;
        let guest_tag = self.name_of(guest_dir)?;
        let host_dir = self.tree.get(guest_dir).ok()?.parent?;
        let host_tag = self.name_of(host_dir)?;
        Some((host_tag, guest_tag))
    }

    /// Parses and commits the mount point file at `path_id`, using the tags its path encodes
    /// rather than anything in the body.
    fn commit_mount(&self, path_id: PathId, data: &[u8]) -> Result<(), Error> {
        let (host_tag, guest_tag) = self.mount_path_tags(path_id).ok_or_else(|| Error::NotFound(path_id.to_string()))?;
        let spec = mount::parse(&host_tag, &guest_tag, data)?;
        self.mounts.commit(path_id, spec)
    }

    /// Runs the commit sequence for a mount point file once it's closed. A file outside
    /// `/mounts`, a directory, or one already live is left untouched. A failed commit removes
    /// the file so a client sees a mount point that never came into existence rather than one
    /// left dangling with no backing resource.
    async fn commit_mount_on_close(&self, path_id: PathId) -> Result<(), Error> {
        if !self.is_under_mounts(path_id) || self.mounts.is_live(path_id) {
            return Ok(());
        }
        let Ok(node) = self.tree.get(path_id) else { return Ok(()) };
        if node.kind == NodeKind::Directory {
            return Ok(());
        }
        let data = node.read();
        let result = self.commit_mount(path_id, &data);
        if result.is_err() {
            if let Some(parent) = node.parent {
                if let Some(name) = self.name_of(path_id) {
                    let _ = self.tree.unlink(parent, &name);
                }
            }
        }
        result
    }

    fn name_of(&self, path_id: PathId) -> Option<String> {
        let node = self.tree.get(path_id).ok()?;
        let parent = node.parent?;
        self.tree.readdir(parent).ok()?.into_iter().find(|(_, id)| *id == path_id).map(|(name, _)| name)
    }
}

/// Every accepted connection clones this once, from the template each listener was bound with;
/// resetting the fid table and error ring on every clone is what gives each connection its own
/// session instead of sharing one globally.
impl Clone for ControlPlane {
    fn clone(&self) -> Self {
        Self::new(
            self.tree.clone(),
            self.mounts.clone(),
            self.listeners.clone(),
            self.governor.clone(),
            self.last_activity.clone(),
        )
    }
}

impl ControlPlane {
    #[instrument(level = "debug", skip(self))]
    pub(crate) async fn attach(&self, fid: u32) -> Result<Qid, Error> {
        self.bind_fid(fid, Target::Node(ROOT_PATH_ID));
        Ok(self.qid(ROOT_PATH_ID, NodeKind::Directory))
    }

    #[instrument(level = "debug", skip(self, wnames), fields(wnames = wnames.len()))]
    pub(crate) async fn walk(&self, fid: u32, newfid: u32, wnames: &[String]) -> Result<Vec<Qid>, Error> {
        let start = match self.fid_target(fid)? {
            Target::Node(id) => id,
            Target::ErrorRing => return Err(Error::NotADirectory(FILE_ERR.to_owned())),
        };

        if wnames.is_empty() {
            self.bind_fid(newfid, Target::Node(start));
            return Ok(Vec::new());
        }

        let mut current = start;
        let mut qids = Vec::new();
        for name in wnames {
            if name == FILE_ERR && current == ROOT_PATH_ID {
                if qids.is_empty() {
                    self.bind_fid(newfid, Target::ErrorRing);
                    return Ok(vec![Qid { typ: QTFILE, version: 0, path: 0 }]);
                }
                break;
            }
            match self.tree.lookup_child(current, name) {
                Some(next) => {
                    let node = self.tree.get(next)?;
                    qids.push(self.qid(next, node.kind));
                    current = next;
                }
                None => break,
            }
        }

        if qids.is_empty() {
            return Err(Error::NotFound(wnames.join("/")));
        }
        if qids.len() == wnames.len() {
            self.bind_fid(newfid, Target::Node(current));
        }
        Ok(qids)
    }

    #[instrument(level = "debug", skip(self))]
    pub(crate) async fn getattr(&self, fid: u32) -> Result<(Qid, Attr), Error> {
        match self.fid_target(fid)? {
            Target::ErrorRing => Ok((
                Qid { typ: QTFILE, version: 0, path: 0 },
                Attr {
                    mode: 0o100400,
                    uid: self.uid,
                    gid: self.gid,
                    nlink: 1,
                    rdev: 0,
                    size: self.ring.render().len() as u64,
                    blksize: 4096,
                    blocks: 1,
                    atime_sec: 0,
                    atime_nsec: 0,
                    mtime_sec: 0,
                    mtime_nsec: 0,
                },
            )),
            Target::Node(id) => {
                let node = self.tree.get(id)?;
                Ok((self.qid(id, node.kind), self.attr_for(&node)))
            }
        }
    }

    #[instrument(level = "debug", skip(self))]
    pub(crate) async fn setattr(&self, fid: u32, valid: u32, size: u64) -> Result<(), Error> {
        let Target::Node(id) = self.fid_target(fid)? else { return Ok(()) };
        let node = self.tree.get(id)?;
        if valid & crate::wire::SETATTR_SIZE != 0 {
            node.truncate(size);
        }
        Ok(())
    }

    #[instrument(level = "debug", skip(self))]
    pub(crate) async fn lopen(&self, _fid: u32) -> Result<Qid, Error> {
        Ok(Qid { typ: QTFILE, version: 0, path: 0 })
    }

    #[instrument(level = "debug", skip(self))]
    pub(crate) async fn readdir(&self, fid: u32, offset: u64, count: u32) -> Result<Vec<(String, Qid)>, Error> {
        let Target::Node(id) = self.fid_target(fid)? else {
            return Err(Error::NotADirectory(FILE_ERR.to_owned()));
        };
        let mut entries = self.tree.readdir(id)?;
        if id == ROOT_PATH_ID {
            entries.push((FILE_ERR.to_owned(), 0));
        }
        let slice: Vec<(String, PathId)> = entries.into_iter().skip(offset as usize).take(count as usize).collect();
        let mut out = Vec::new();
        for (name, child_id) in slice {
            let kind = if child_id == 0 { NodeKind::File } else { self.tree.get(child_id)?.kind };
            out.push((name, self.qid(child_id, kind)));
        }
        Ok(out)
    }

    #[instrument(level = "debug", skip(self))]
    pub(crate) async fn read(&self, fid: u32, offset: u64, count: u32) -> Result<Vec<u8>, Error> {
        let bytes = match self.fid_target(fid)? {
            Target::ErrorRing => self.ring.render().into_bytes(),
            Target::Node(id) => {
                let node = self.tree.get(id)?;
                if node.kind == NodeKind::Directory {
                    return Err(Error::IsDirectory(id.to_string()));
                }
                node.read()
            }
        };
        let start = (offset as usize).min(bytes.len());
        let end = (start + count as usize).min(bytes.len());
        Ok(bytes[start..end].to_vec())
    }

    #[instrument(level = "debug", skip(self, data))]
    pub(crate) async fn write(&self, fid: u32, offset: u64, data: &[u8]) -> Result<u32, Error> {
        let Target::Node(id) = self.fid_target(fid)? else {
            return Err(Error::NotFound(FILE_ERR.to_owned()));
        };
        let node = self.tree.get(id)?;
        if node.kind == NodeKind::Directory {
            return Err(Error::IsDirectory(id.to_string()));
        }
        node.write_at(offset, data);
        let name = self.name_of(id).unwrap_or_default();
        self.apply_write_semantics(id, &name).await?;
        Ok(data.len() as u32)
    }

    #[instrument(level = "debug", skip(self))]
    pub(crate) async fn lcreate(&self, fid: u32, name: &str, mode: u32, gid: u32) -> Result<Qid, Error> {
        let Target::Node(parent) = self.fid_target(fid)? else {
            return Err(Error::NotADirectory(FILE_ERR.to_owned()));
        };
        let node = self.tree.create_node(parent, name, NodeKind::File, self.uid, gid, mode)?;
        self.bind_fid(fid, Target::Node(node.path_id));
        Ok(self.qid(node.path_id, NodeKind::File))
    }

    #[instrument(level = "debug", skip(self))]
    pub(crate) async fn mkdir(&self, fid: u32, name: &str, mode: u32, gid: u32) -> Result<Qid, Error> {
        let Target::Node(parent) = self.fid_target(fid)? else {
            return Err(Error::NotADirectory(FILE_ERR.to_owned()));
        };
        let policy = self.mount_dir_policy(parent);
        let node = self.tree.mkdir_with_policy(parent, name, self.uid, gid, mode, policy)?;

        if parent == self.tree.lookup_child(ROOT_PATH_ID, DIR_LISTENERS).unwrap_or(0) {
            if let Ok(addr) = ListenerAddr::parse(name) {
                match ListenerHandle::bind(addr, self.clone(), self.last_activity.clone()).await {
                    Ok(handle) => self.listeners.insert(node.path_id, handle).await,
                    Err(e) => {
                        let _ = self.tree.unlink(parent, name);
                        return Err(e);
                    }
                }
            }
        }
        Ok(self.qid(node.path_id, NodeKind::Directory))
    }

    #[instrument(level = "debug", skip(self))]
    pub(crate) async fn unlinkat(&self, fid: u32, name: &str) -> Result<(), Error> {
        let Target::Node(parent) = self.fid_target(fid)? else {
            return Err(Error::NotADirectory(FILE_ERR.to_owned()));
        };
        let child_id = self.tree.lookup_child(parent, name).ok_or_else(|| Error::NotFound(name.to_owned()))?;

        if self.mounts.is_live(child_id) {
            if let Err(e) = self.mounts.teardown(child_id) {
                self.record(e);
            }
        }
        self.listeners.remove(child_id).await;
        self.tree.unlink(parent, name)?;
        Ok(())
    }

    /// Drops `fid`'s binding and, if it named a mount point file under `/mounts`, runs the
    /// commit sequence now that the body has been fully written. This is the only place a mount
    /// commits; writes to the file itself are plain buffered writes.
    #[instrument(level = "debug", skip(self))]
    pub(crate) async fn clunk(&self, fid: u32) -> Result<(), Error> {
        let target = self.fids.lock().unwrap().remove(&fid);
        let Some(Target::Node(id)) = target else { return Ok(()) };
        self.commit_mount_on_close(id).await
    }

    #[instrument(level = "debug", skip(self))]
    pub(crate) async fn statfs(&self, _fid: u32) -> Result<(), Error> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plane() -> ControlPlane {
        let tree = Tree::new();
        ControlPlane::ensure_layout(&tree).unwrap();
        ControlPlane::new(
            tree,
            MountTable::new(),
            crate::listener::ListenerTable::new(),
            ShutdownGovernor::new(),
            Arc::new(Mutex::new(Instant::now())),
        )
    }

    #[test]
    fn layout_creates_fixed_top_level_entries() {
        let plane = plane();
        let entries = plane.tree.readdir(ROOT_PATH_ID).unwrap();
        let names: Vec<_> = entries.iter().map(|(n, _)| n.clone()).collect();
        assert!(names.contains(&DIR_MOUNTS.to_owned()));
        assert!(names.contains(&DIR_LISTENERS.to_owned()));
        assert!(names.contains(&DIR_CONTROL.to_owned()));
    }

    #[test]
    fn is_under_mounts_recognizes_nested_mount_point_files() {
        let plane = plane();
        let mounts = plane.tree.lookup_child(ROOT_PATH_ID, DIR_MOUNTS).unwrap();
        let fuse = plane.tree.mkdir(mounts, "fuse", 0, 0, 0o755).unwrap();
        let keyfs = plane.tree.mkdir(fuse.path_id, "keyfs", 0, 0, 0o755).unwrap();
        let file = plane.tree.create_node(keyfs.path_id, "a.json", NodeKind::File, 0, 0, 0o644).unwrap();
        assert!(plane.is_under_mounts(file.path_id));
    }

    #[test]
    fn mount_dir_policy_marks_host_and_guest_directories_only() {
        let plane = plane();
        let mounts = plane.tree.lookup_child(ROOT_PATH_ID, DIR_MOUNTS).unwrap();
        assert!(!plane.mount_dir_policy(ROOT_PATH_ID).unlink_when_empty);
        assert!(plane.mount_dir_policy(mounts).unlink_when_empty);
        let fuse = plane.tree.mkdir(mounts, "fuse", 0, 0, 0o755).unwrap();
        assert!(plane.mount_dir_policy(fuse.path_id).unlink_when_empty);
    }

    #[test]
    fn mount_path_tags_reads_tags_from_ancestry_not_the_body() {
        let plane = plane();
        let mounts = plane.tree.lookup_child(ROOT_PATH_ID, DIR_MOUNTS).unwrap();
        let fuse = plane.tree.mkdir(mounts, "fuse", 0, 0, 0o755).unwrap();
        let keyfs = plane.tree.mkdir(fuse.path_id, "keyfs", 0, 0, 0o755).unwrap();
        let file = plane.tree.create_node(keyfs.path_id, "a.json", NodeKind::File, 0, 0, 0o644).unwrap();
        assert_eq!(plane.mount_path_tags(file.path_id), Some(("fuse".to_owned(), "keyfs".to_owned())));
    }

    #[tokio::test]
    async fn writing_shutdown_byte_triggers_governor() {
        let plane = plane();
        let control = plane.tree.lookup_child(ROOT_PATH_ID, DIR_CONTROL).unwrap();
        let shutdown = plane.tree.lookup_child(control, FILE_SHUTDOWN).unwrap();
        plane.tree.get(shutdown).unwrap().write_at(0, &[1u8]);
        plane.apply_write_semantics(shutdown, FILE_SHUTDOWN).await.unwrap();
        assert_eq!(plane.governor.current(), Some(Disposition::Patient));
    }

    #[tokio::test]
    async fn commit_runs_on_clunk_not_on_write() {
        let plane = plane();
        fsd_drivers::install_builtin_drivers();
        let mounts = plane.tree.lookup_child(ROOT_PATH_ID, DIR_MOUNTS).unwrap();
        let fuse = plane.tree.mkdir(mounts, "nfs", 0, 0, 0o755).unwrap();
        let keyfs = plane.tree.mkdir(fuse.path_id, "keyfs", 0, 0, 0o755).unwrap();
        let file = plane.tree.create_node(keyfs.path_id, "a.json", NodeKind::File, 0, 0, 0o644).unwrap();
        file.write_at(0, br#"{"host": {}, "guest": {"entries": {}}}"#);

        // A write alone never attempts a commit: the unimplemented `nfs` driver would fail it.
        plane.apply_write_semantics(file.path_id, "a.json").await.unwrap();
        assert!(!plane.mounts.is_live(file.path_id));

        let err = plane.commit_mount_on_close(file.path_id).await.unwrap_err();
        assert!(matches!(err, Error::Driver(_)));
        // A failed commit removes the file.
        assert!(plane.tree.lookup_child(keyfs.path_id, "a.json").is_none());
    }
}
