use std::sync::Arc;

use serde_json::Value;

use crate::error::DriverError;
use crate::guest::{Guest, GuestFs};
use crate::host::{Host, MountHandle};

/// Driver tags that are registered, and whose mount point paths are therefore recognized and
/// validated, but whose actual mount/make_fs logic isn't implemented in this build. Keeping
/// them registered means an unsupported tag fails with [`DriverError::NotImplemented`] at mount
/// time rather than [`DriverError::UnknownTag`] at path-parse time — the daemon can tell the two
/// apart.
struct StubHost {
    tag: &'static str,
}

impl Host for StubHost {
    fn mount(&self, _fs: Arc<dyn GuestFs>) -> Result<Box<dyn MountHandle>, DriverError> {
        Err(DriverError::NotImplemented(
            self.tag.to_owned(),
            "host driver is registered but not implemented in this build",
        ))
    }
}

struct StubGuest {
    tag: &'static str,
}

impl Guest for StubGuest {
    fn make_fs(&self) -> Result<Arc<dyn GuestFs>, DriverError> {
        Err(DriverError::NotImplemented(
            self.tag.to_owned(),
            "guest driver is registered but not implemented in this build",
        ))
    }
}

pub fn build_nfs_host(_config: &Value) -> Result<Box<dyn Host>, DriverError> {
    Ok(Box::new(StubHost { tag: "nfs" }))
}

pub fn build_ipfs_guest(_config: &Value) -> Result<Box<dyn Guest>, DriverError> {
    Ok(Box::new(StubGuest { tag: "ipfs" }))
}

pub fn build_ipns_guest(_config: &Value) -> Result<Box<dyn Guest>, DriverError> {
    Ok(Box::new(StubGuest { tag: "ipns" }))
}

pub fn build_pinfs_guest(_config: &Value) -> Result<Box<dyn Guest>, DriverError> {
    Ok(Box::new(StubGuest { tag: "pinfs" }))
}

pub fn build_9p_guest(_config: &Value) -> Result<Box<dyn Guest>, DriverError> {
    Ok(Box::new(StubGuest { tag: "9p" }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stub_host_mount_is_not_implemented() {
        let host = build_nfs_host(&Value::Null).unwrap();
        let fs: Arc<dyn GuestFs> = crate::keyfs_guest::build(&serde_json::json!({"entries": {}}))
            .unwrap()
            .make_fs()
            .unwrap();
        assert!(matches!(host.mount(fs), Err(DriverError::NotImplemented(tag, _)) if tag == "nfs"));
    }

    #[test]
    fn stub_guest_make_fs_is_not_implemented() {
        let guest = build_ipfs_guest(&Value::Null).unwrap();
        assert!(matches!(guest.make_fs(), Err(DriverError::NotImplemented(tag, _)) if tag == "ipfs"));
    }
}
