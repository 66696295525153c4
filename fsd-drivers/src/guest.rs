use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::DriverError;

pub type GuestIno = u64;

pub const GUEST_ROOT_INO: GuestIno = 1;

/// Inodes produced by a guest are either files or directories; guest file systems are
/// read-only, so there is no symlink or special-file kind to model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuestFileKind {
    File,
    Directory,
}

#[derive(Debug, Clone)]
pub struct GuestAttr {
    pub ino: GuestIno,
    pub kind: GuestFileKind,
    pub size: u64,
    pub mtime: SystemTime,
}

#[derive(Debug, Clone)]
pub struct GuestDirEntry {
    pub ino: GuestIno,
    pub name: String,
    pub kind: GuestFileKind,
}

/// A read-only file system handle produced by a [`Guest`]. This is the object a [`Host`]
/// (see [`crate::host::Host`]) mounts and serves to the operating system.
#[async_trait]
pub trait GuestFs: Send + Sync {
    async fn lookup(&self, parent: GuestIno, name: &str) -> Result<GuestAttr, DriverError>;

    async fn getattr(&self, ino: GuestIno) -> Result<GuestAttr, DriverError>;

    async fn readdir(&self, ino: GuestIno) -> Result<Vec<GuestDirEntry>, DriverError>;

    async fn read(&self, ino: GuestIno, offset: u64, size: u32) -> Result<Vec<u8>, DriverError>;
}

/// A guest driver: something that, given its slice of a mount point file's JSON body,
/// produces a [`GuestFs`] handle. `make_fs` corresponds to the commit-sequence step in the
/// mount subsystem (`Call the guest driver's MakeFS() to obtain a read-only file system
/// handle`).
pub trait Guest: Send + Sync {
    fn make_fs(&self) -> Result<Arc<dyn GuestFs>, DriverError>;
}

/// Builds a configured [`Guest`] from the `"guest"` sub-object of a mount point file.
pub type GuestFactory = fn(&Value) -> Result<Box<dyn Guest>, DriverError>;
