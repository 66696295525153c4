use std::collections::HashMap;
use std::sync::RwLock;

use once_cell::sync::Lazy;
use serde_json::Value;

use crate::error::DriverError;
use crate::guest::{Guest, GuestFactory};
use crate::host::{Host, HostFactory};

/// Identifies a host or guest driver implementation, e.g. `fuse`, `nfs`, `ipfs`, `keyfs`.
/// Mount point paths are `/mounts/<host tag>/<guest tag>/<name>.json`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DriverTag(pub String);

impl DriverTag {
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }
}

impl std::fmt::Display for DriverTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

static HOST_REGISTRY: Lazy<RwLock<HashMap<String, HostFactory>>> = Lazy::new(|| RwLock::new(HashMap::new()));
static GUEST_REGISTRY: Lazy<RwLock<HashMap<String, GuestFactory>>> = Lazy::new(|| RwLock::new(HashMap::new()));

/// Registers a host driver factory under `tag`. Intended to be called once per tag from
/// [`install_builtin_drivers`] or a downstream crate's own `init()`.
pub fn register_host(tag: &str, factory: HostFactory) {
    HOST_REGISTRY.write().unwrap().insert(tag.to_owned(), factory);
}

/// Registers a guest driver factory under `tag`.
pub fn register_guest(tag: &str, factory: GuestFactory) {
    GUEST_REGISTRY.write().unwrap().insert(tag.to_owned(), factory);
}

/// Looks up the host factory for `tag` and invokes it with the `"host"` sub-object.
pub fn build_host(tag: &str, config: &Value) -> Result<Box<dyn Host>, DriverError> {
    let factory = *HOST_REGISTRY
        .read()
        .unwrap()
        .get(tag)
        .ok_or_else(|| DriverError::UnknownTag(tag.to_owned()))?;
    factory(config)
}

/// Looks up the guest factory for `tag` and invokes it with the `"guest"` sub-object.
pub fn build_guest(tag: &str, config: &Value) -> Result<Box<dyn Guest>, DriverError> {
    let factory = *GUEST_REGISTRY
        .read()
        .unwrap()
        .get(tag)
        .ok_or_else(|| DriverError::UnknownTag(tag.to_owned()))?;
    factory(config)
}

/// Registers every driver this build ships with. Call once from `main` before serving any
/// 9P sessions, mirroring the "new drivers register once at process init" contract.
pub fn install_builtin_drivers() {
    register_host("fuse", crate::fuse_host::build);
    register_host("nfs", crate::stub::build_nfs_host);

    register_guest("keyfs", crate::keyfs_guest::build);
    register_guest("ipfs", crate::stub::build_ipfs_guest);
    register_guest("ipns", crate::stub::build_ipns_guest);
    register_guest("pinfs", crate::stub::build_pinfs_guest);
    register_guest("9p", crate::stub::build_9p_guest);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_tag_is_a_resource_error_not_a_panic() {
        install_builtin_drivers();
        let err = build_host("does-not-exist", &Value::Null).unwrap_err();
        assert!(matches!(err, DriverError::UnknownTag(tag) if tag == "does-not-exist"));
    }

    #[test]
    fn builtin_tags_are_registered() {
        install_builtin_drivers();
        assert!(build_host("fuse", &serde_json::json!({"point": "/tmp/doesnotexist-mnt"})).is_ok());
        assert!(build_guest("keyfs", &serde_json::json!({"entries": {}})).is_ok());
    }
}
