//! The mount subsystem: parses a mount point file's JSON body, drives the commit sequence
//! (guest `MakeFS` -> host `Mount`) and the teardown sequence (closer -> cascade), and holds
//! the live mounts keyed by the path ID of the mount point file that committed them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use fsd_drivers::MountHandle;
use serde::Deserialize;
use serde_json::Value;

use crate::error::Error;
use crate::tree::PathId;

const BASE58_ALPHABET: [char; 58] = [
    '1', '2', '3', '4', '5', '6', '7', '8', '9', 'A', 'B', 'C', 'D', 'E', 'F', 'G', 'H', 'J', 'K', 'L', 'M', 'N', 'P',
    'Q', 'R', 'S', 'T', 'U', 'V', 'W', 'X', 'Y', 'Z', 'a', 'b', 'c', 'd', 'e', 'f', 'g', 'h', 'i', 'j', 'k', 'm', 'n',
    'o', 'p', 'q', 'r', 's', 't', 'u', 'v', 'w', 'x', 'y', 'z',
];

/// Generates the default mount point file name: an 8-character Base58 NanoID with a `.json`
/// suffix, used whenever a caller creates a mount without naming it explicitly.
pub fn generate_name() -> String {
    format!("{}.json", nanoid::nanoid!(8, &BASE58_ALPHABET))
}

#[derive(Debug, Deserialize)]
struct MountBody {
    host: Value,
    guest: Value,
}

#[derive(Debug, Clone)]
pub struct MountSpec {
    pub host_tag: String,
    pub host_config: Value,
    pub guest_tag: String,
    pub guest_config: Value,
}

/// Parses a mount point file's body. `host_tag`/`guest_tag` come from the committing file's
/// path under `/mounts/<host_tag>/<guest_tag>/`, not from the body — the body holds only each
/// driver's own configuration fields, so a typo in it surfaces as a field error scoped to the
/// side that owns it rather than a generic parse failure. A malformed body is reported through
/// [`Error::Parse`] rather than causing the commit to panic.
pub fn parse(host_tag: &str, guest_tag: &str, bytes: &[u8]) -> Result<MountSpec, Error> {
    let body: MountBody =
        serde_json::from_slice(bytes).map_err(|_| Error::Parse(fsd_drivers::FieldError::new("body", &["host", "guest"])))?;
    Ok(MountSpec {
        host_tag: host_tag.to_owned(),
        host_config: body.host,
        guest_tag: guest_tag.to_owned(),
        guest_config: body.guest,
    })
}

/// Prefixes a driver's [`fsd_drivers::FieldError`] with `scope` (`"host"` or `"guest"`), so
/// `{"pt": ...}` inside the host slice reports as `host.pt` rather than the driver's bare field
/// name — the two slices share a field namespace from the operator's point of view even though
/// each driver only ever sees its own half of the body.
fn scoped(scope: &str, err: fsd_drivers::DriverError) -> fsd_drivers::DriverError {
    match err {
        fsd_drivers::DriverError::InvalidConfig { driver, source } => fsd_drivers::DriverError::InvalidConfig {
            driver,
            source: fsd_drivers::FieldError {
                key: format!("{scope}.{}", source.key),
                tried: source.tried.iter().map(|t| format!("{scope}.{t}")).collect(),
            },
        },
        other => other,
    }
}

struct LiveMount {
    spec: MountSpec,
    closer: Box<dyn MountHandle>,
}

/// The table of currently-committed mounts, keyed by the path ID of the mount point file that
/// owns them. Holding this separately from the node tree keeps driver-trait objects (which
/// aren't `Clone` or introspectable) out of the generic tree data structure.
#[derive(Default)]
pub struct MountTable {
    live: Mutex<HashMap<PathId, LiveMount>>,
}

impl MountTable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Runs the commit sequence: guest `MakeFS()`, then host `Mount(fs)`. On success the
    /// resulting closer is stored under `path_id`; on failure nothing is recorded and the mount
    /// point file must not be left appearing live.
    #[fsd_macros::log_failures(expected_level = "debug")]
    pub fn commit(&self, path_id: PathId, spec: MountSpec) -> Result<(), Error> {
        let guest = fsd_drivers::build_guest(&spec.guest_tag, &spec.guest_config).map_err(|e| scoped("guest", e))?;
        let fs = guest.make_fs().map_err(|e| scoped("guest", e))?;
        let host = fsd_drivers::build_host(&spec.host_tag, &spec.host_config).map_err(|e| scoped("host", e))?;
        let closer = host.mount(fs).map_err(|e| scoped("host", e))?;
        self.live.lock().unwrap().insert(path_id, LiveMount { spec, closer });
        Ok(())
    }

    pub fn is_live(&self, path_id: PathId) -> bool {
        self.live.lock().unwrap().contains_key(&path_id)
    }

    /// Runs the teardown sequence for one mount: invoke the closer, then drop the bookkeeping
    /// regardless of whether the closer itself reported an error (the caller surfaces that
    /// error to the ring but still removes the node).
    pub fn teardown(&self, path_id: PathId) -> Result<(), Error> {
        let Some(live) = self.live.lock().unwrap().remove(&path_id) else {
            return Ok(());
        };
        live.closer.close().map_err(Error::Driver)
    }

    /// Tears down every live mount, collecting errors rather than stopping at the first one, so
    /// a single stuck mount doesn't block the rest from unwinding during shutdown.
    pub fn teardown_all(&self) -> Vec<(PathId, Error)> {
        let ids: Vec<PathId> = self.live.lock().unwrap().keys().copied().collect();
        ids.into_iter().filter_map(|id| self.teardown(id).err().map(|e| (id, e))).collect()
    }

    pub fn len(&self) -> usize {
        self.live.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_rejects_malformed_body() {
        assert!(matches!(parse("fuse", "keyfs", b"not json"), Err(Error::Parse(_))));
    }

    #[test]
    fn parse_takes_tags_from_the_caller_not_the_body() {
        let body = br#"{"host": {"point": "/mnt/x"}, "guest": {"entries": {}}}"#;
        let spec = parse("fuse", "keyfs", body).unwrap();
        assert_eq!(spec.host_tag, "fuse");
        assert_eq!(spec.guest_tag, "keyfs");
        assert_eq!(spec.host_config, serde_json::json!({"point": "/mnt/x"}));
    }

    #[test]
    fn scoped_prefixes_the_field_error_with_the_side_it_came_from() {
        let err = scoped(
            "host",
            fsd_drivers::DriverError::InvalidConfig { driver: "fuse".to_owned(), source: fsd_drivers::FieldError::new("pt", &["point"]) },
        );
        let fsd_drivers::DriverError::InvalidConfig { source, .. } = err else { panic!("expected InvalidConfig") };
        assert_eq!(source.key, "host.pt");
        assert_eq!(source.tried, vec!["host.point".to_owned()]);
    }

    #[test]
    fn generated_names_are_eight_chars_plus_suffix() {
        let name = generate_name();
        assert!(name.ends_with(".json"));
        assert_eq!(name.len(), 8 + ".json".len());
    }

    #[test]
    fn teardown_of_unknown_mount_is_a_no_op() {
        let table = MountTable::new();
        assert!(table.teardown(999).is_ok());
    }
}
