//! Host and guest file system driver traits, the tag-keyed registry that wires mount point
//! paths to them, and the drivers this build ships with.
//!
//! A host exposes a [`guest::GuestFs`] to the operating system (FUSE, NFS, ...); a guest
//! produces one (a content-addressed store, a remote file server, ...). The daemon's mount
//! subsystem only ever talks to these traits and to [`registry`] — it never names a concrete
//! driver type directly.

pub mod error;
pub mod future;
pub mod guest;
pub mod host;
pub mod registry;
pub mod sync;

mod fuse_host;
mod keyfs_guest;
mod stub;

pub use error::{DriverError, FieldError, ToErrno};
pub use guest::{Guest, GuestAttr, GuestDirEntry, GuestFactory, GuestFileKind, GuestFs, GuestIno, GUEST_ROOT_INO};
pub use host::{Host, HostFactory, MountHandle};
pub use registry::{build_guest, build_host, install_builtin_drivers, register_guest, register_host, DriverTag};
