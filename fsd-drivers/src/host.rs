use std::sync::Arc;

use serde_json::Value;

use crate::error::DriverError;
use crate::guest::GuestFs;

/// A live mount's closer. Every host implementation's `mount` returns one of these, and the
/// mount subsystem holds it until the mount point file is unlinked, at which point `close` is
/// invoked exactly once.
pub trait MountHandle: Send {
    fn close(self: Box<Self>) -> Result<(), DriverError>;
}

/// A host driver: something that, given its slice of a mount point file's JSON body, can
/// expose a [`GuestFs`] to the operating system. `mount` corresponds to the commit-sequence
/// step `Call the host driver's Mount(fs) to produce a closer representing the live mount`.
pub trait Host: Send + Sync {
    fn mount(&self, fs: Arc<dyn GuestFs>) -> Result<Box<dyn MountHandle>, DriverError>;
}

/// Builds a configured [`Host`] from the `"host"` sub-object of a mount point file.
pub type HostFactory = fn(&Value) -> Result<Box<dyn Host>, DriverError>;
