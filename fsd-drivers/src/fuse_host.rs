use std::ffi::OsStr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use fuser::{
    FileAttr, FileType, Filesystem, KernelConfig, MountOption, ReplyAttr, ReplyData, ReplyDirectory, ReplyEmpty,
    ReplyEntry, ReplyOpen, Request,
};
use serde_json::Value;
use tracing::instrument;

use crate::error::{DriverError, FieldError, ToErrno};
use crate::future::Spawn;
use crate::guest::{GuestAttr, GuestFileKind, GuestFs};
use crate::host::{Host, MountHandle};

const TTL: Duration = Duration::from_secs(1);
const ACCEPTED_FIELDS: &[&str] = &["point", "allow_other", "read_only"];

#[derive(Debug, Clone)]
struct FuseHostConfig {
    point: PathBuf,
    allow_other: bool,
    read_only: bool,
}

fn invalid(key: impl Into<String>, tried: &[&str]) -> DriverError {
    DriverError::InvalidConfig {
        driver: "fuse".to_owned(),
        source: FieldError::new(key, tried),
    }
}

fn missing(key: &str) -> DriverError {
    DriverError::InvalidConfig {
        driver: "fuse".to_owned(),
        source: FieldError::missing(key),
    }
}

fn parse_config(config: &Value) -> Result<FuseHostConfig, DriverError> {
    let obj = config.as_object().ok_or_else(|| invalid("<root>", ACCEPTED_FIELDS))?;

    for key in obj.keys() {
        if !ACCEPTED_FIELDS.contains(&key.as_str()) {
            return Err(invalid(key.clone(), ACCEPTED_FIELDS));
        }
    }

    let point = obj.get("point").and_then(Value::as_str).ok_or_else(|| missing("point"))?;
    let allow_other = obj.get("allow_other").and_then(Value::as_bool).unwrap_or(false);
    let read_only = obj.get("read_only").and_then(Value::as_bool).unwrap_or(true);

    Ok(FuseHostConfig {
        point: PathBuf::from(point),
        allow_other,
        read_only,
    })
}

/// Builds a [`Host`] that mounts its guest file system onto the kernel's FUSE driver.
///
/// Requires a running Tokio runtime at the point this is called, since `mount` needs somewhere
/// to run the guest's async lookups from `fuser`'s synchronous callbacks.
pub fn build(config: &Value) -> Result<Box<dyn Host>, DriverError> {
    let config = parse_config(config)?;
    let runtime = tokio::runtime::Handle::try_current().map_err(|e| DriverError::MountFailed(e.into()))?;
    Ok(Box::new(FuseHost { config, runtime }))
}

struct FuseHost {
    config: FuseHostConfig,
    runtime: tokio::runtime::Handle,
}

impl Host for FuseHost {
    fn mount(&self, fs: Arc<dyn GuestFs>) -> Result<Box<dyn MountHandle>, DriverError> {
        let adapter = GuestFuseAdapter {
            fs,
            runtime: self.runtime.clone(),
        };

        let mut options = vec![MountOption::FSName("fsd".to_owned()), MountOption::NoAtime];
        options.push(if self.config.read_only { MountOption::RO } else { MountOption::RW });
        if self.config.allow_other {
            options.push(MountOption::AllowOther);
        }

        let mut session =
            fuser::Session::new(adapter, &self.config.point, &options).map_err(|e| DriverError::MountFailed(e.into()))?;
        let unmounter = session.unmount_callable();
        let background = session.spawn().map_err(|e| DriverError::MountFailed(e.into()))?;

        Ok(Box::new(FuseMountHandle {
            unmounter,
            background: Some(background),
        }))
    }
}

/// The closer returned to the mount subsystem. `close` unmounts synchronously and waits for the
/// FUSE session thread to exit, so that by the time it returns the mount point file's directory
/// entry is safe to drop.
struct FuseMountHandle {
    unmounter: fuser::SessionUnmounter,
    background: Option<fuser::BackgroundSession>,
}

impl MountHandle for FuseMountHandle {
    fn close(mut self: Box<Self>) -> Result<(), DriverError> {
        self.unmounter.unmount().map_err(|e| DriverError::UnmountFailed(e.into()))?;
        if let Some(background) = self.background.take() {
            background.join();
        }
        Ok(())
    }
}

fn guest_attr_to_file_attr(attr: &GuestAttr) -> FileAttr {
    let kind = match attr.kind {
        GuestFileKind::File => FileType::RegularFile,
        GuestFileKind::Directory => FileType::Directory,
    };
    FileAttr {
        ino: attr.ino,
        size: attr.size,
        blocks: (attr.size + 511) / 512,
        atime: attr.mtime,
        mtime: attr.mtime,
        ctime: attr.mtime,
        crtime: attr.mtime,
        kind,
        perm: if kind == FileType::Directory { 0o555 } else { 0o444 },
        nlink: 1,
        uid: 0,
        gid: 0,
        rdev: 0,
        blksize: 4096,
        flags: 0,
    }
}

/// Thin wrapper around a [`GuestFs`] that implements the `fuser` protocol, so the guest itself
/// never has to know it's being served over FUSE rather than some other host.
struct GuestFuseAdapter {
    fs: Arc<dyn GuestFs>,
    runtime: tokio::runtime::Handle,
}

impl Filesystem for GuestFuseAdapter {
    #[instrument(level = "debug", skip_all)]
    fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> Result<(), libc::c_int> {
        Ok(())
    }

    #[instrument(level = "debug", skip_all, fields(ino = parent, name = ?name))]
    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let fs = self.fs.clone();
        let name = name.to_string_lossy().into_owned();
        self.runtime.spawn(async move {
            match fs.lookup(parent, &name).await {
                Ok(attr) => reply.entry(&TTL, &guest_attr_to_file_attr(&attr), 0),
                Err(e) => reply.error(e.to_errno()),
            }
        });
    }

    #[instrument(level = "debug", skip_all, fields(ino = ino))]
    fn getattr(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        let fs = self.fs.clone();
        self.runtime.spawn(async move {
            match fs.getattr(ino).await {
                Ok(attr) => reply.attr(&TTL, &guest_attr_to_file_attr(&attr)),
                Err(e) => reply.error(e.to_errno()),
            }
        });
    }

    #[instrument(level = "debug", skip_all, fields(ino = ino))]
    fn open(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        reply.opened(ino, 0);
    }

    #[instrument(level = "debug", skip_all, fields(ino = ino, offset = offset, size = size))]
    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock: Option<u64>,
        reply: ReplyData,
    ) {
        let fs = self.fs.clone();
        self.runtime.spawn(async move {
            match fs.read(ino, offset.max(0) as u64, size).await {
                Ok(data) => reply.data(&data),
                Err(e) => reply.error(e.to_errno()),
            }
        });
    }

    #[instrument(level = "debug", skip_all, fields(ino = ino))]
    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        reply.opened(ino, 0);
    }

    #[instrument(level = "debug", skip_all, fields(ino = ino, offset = offset))]
    fn readdir(&mut self, _req: &Request<'_>, ino: u64, _fh: u64, offset: i64, mut reply: ReplyDirectory) {
        let fs = self.fs.clone();
        self.runtime.spawn(async move {
            match fs.readdir(ino).await {
                Ok(entries) => {
                    let mut next_offset = offset.max(0) as usize;
                    for entry in entries.into_iter().skip(next_offset) {
                        next_offset += 1;
                        let kind = match entry.kind {
                            GuestFileKind::File => FileType::RegularFile,
                            GuestFileKind::Directory => FileType::Directory,
                        };
                        if reply.add(entry.ino, next_offset as i64, kind, &entry.name) {
                            break;
                        }
                    }
                    reply.ok();
                }
                Err(e) => reply.error(e.to_errno()),
            }
        });
    }

    #[instrument(level = "debug", skip_all, fields(ino = ino, fh = fh))]
    fn release(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        reply.ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unknown_fields() {
        let err = parse_config(&serde_json::json!({"point": "/mnt/x", "bogus": true})).unwrap_err();
        assert!(matches!(err, DriverError::InvalidConfig { driver, .. } if driver == "fuse"));
    }

    #[test]
    fn requires_point() {
        let err = parse_config(&serde_json::json!({"read_only": true})).unwrap_err();
        assert!(matches!(err, DriverError::InvalidConfig { driver, .. } if driver == "fuse"));
    }

    #[test]
    fn defaults_to_read_only() {
        let config = parse_config(&serde_json::json!({"point": "/mnt/x"})).unwrap();
        assert!(config.read_only);
        assert!(!config.allow_other);
    }
}
