//! Resolves where the daemon listens by default, and the handful of settings the CLI and the
//! daemon process both need to agree on without an explicit flag.

use std::path::PathBuf;

use crate::error::Error;
use crate::listener::ListenerAddr;

/// `<runtime dir>/fsd/server` — the Unix socket a bare `fsd mount`/`fsd shutdown` talks to when
/// the caller didn't pass `-server`. Falls back to the user's home directory when the platform
/// has no runtime directory (no `XDG_RUNTIME_DIR`, e.g. outside a login session).
pub fn default_socket_path() -> Result<PathBuf, Error> {
    let base = dirs::runtime_dir()
        .or_else(dirs::home_dir)
        .ok_or_else(|| Error::ListenFailed { addr: "unix:<default>".to_owned(), source: anyhow::anyhow!("no runtime or home directory") })?;
    Ok(base.join("fsd").join("server"))
}

/// The default listener address, used when the daemon is started with no `-listen` flags at
/// all: a Unix socket at [`default_socket_path`].
pub fn default_listener() -> Result<ListenerAddr, Error> {
    Ok(ListenerAddr::Unix(default_socket_path()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_socket_path_ends_in_fsd_server() {
        let path = default_socket_path().unwrap();
        assert_eq!(path.file_name().unwrap(), "server");
        assert_eq!(path.parent().unwrap().file_name().unwrap(), "fsd");
    }
}
