//! The listener subsystem: binds TCP and Unix-domain sockets and mirrors each as a nested
//! directory under `/listeners`.
//!
//! Binding a listener here means spawning an accept loop directly: every accepted connection gets
//! its own [`crate::dispatch::serve_tcp`]/[`serve_unix`] task driven by a clone of the
//! [`ControlPlane`] template (whose `Clone` impl resets its per-connection state) and the shared
//! [`tokio_util::sync::CancellationToken`] from the control plane's shutdown governor, so a
//! `Short`/`Immediate` disposition can actually tear a connection down instead of waiting for the
//! peer to go away on its own. "Stop accepting on this listener" means aborting the accept task;
//! connections already dispatched to their own tasks are unaffected by that and only stop when the
//! governor's token fires or the peer disconnects.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::net::{TcpListener, UnixListener};
use tracing::{info, warn};

use crate::dispatch;
use crate::error::Error;
use crate::fs_impl::ControlPlane;

/// An address a listener is bound to. The `Display`/`tree_path` forms are what the control
/// plane's `/listeners` mount point files and the CLI's `-server` flag both accept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerAddr {
    Tcp(SocketAddr),
    Unix(PathBuf),
}

impl ListenerAddr {
    /// Parses `tcp:<host>:<port>` or `unix:<path>`, matching the address forms the control
    /// plane's `/listeners` mount point files and the CLI's `-server` flag both accept.
    pub fn parse(raw: &str) -> Result<Self, Error> {
        if let Some(path) = raw.strip_prefix("unix:") {
            return Ok(Self::Unix(PathBuf::from(path)));
        }
        let tcp = raw.strip_prefix("tcp:").unwrap_or(raw);
        tcp.parse::<SocketAddr>().map(Self::Tcp).map_err(|e| Error::ListenFailed {
            addr: raw.to_owned(),
            source: anyhow::anyhow!("{e}: expected tcp:<host>:<port> or unix:<path>"),
        })
    }

    /// Path components this address is mirrored at under `/listeners`, e.g.
    /// `["tcp", "127.0.0.1:9999"]` or `["unix", "run", "fsd.sock"]`.
    pub fn tree_path(&self) -> Vec<String> {
        match self {
            Self::Tcp(addr) => vec!["tcp".to_owned(), addr.to_string()],
            Self::Unix(path) => {
                let mut components = vec!["unix".to_owned()];
                components.extend(
                    path.components()
                        .filter(|c| matches!(c, std::path::Component::Normal(_)))
                        .map(|c| c.as_os_str().to_string_lossy().into_owned()),
                );
                components
            }
        }
    }
}

impl std::fmt::Display for ListenerAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tcp(addr) => write!(f, "tcp:{addr}"),
            Self::Unix(path) => write!(f, "unix:{}", path.display()),
        }
    }
}

/// One bound listener and the task driving its accept loop.
pub struct ListenerHandle {
    pub addr: ListenerAddr,
    task: tokio::task::JoinHandle<()>,
}

impl ListenerHandle {
    /// Binds `addr` and hands the accept loop to a spawned task; every accepted connection is
    /// itself spawned as its own dispatch task against a fresh clone of `plane`.
    pub async fn bind(addr: ListenerAddr, plane: ControlPlane, last_activity: Arc<Mutex<Instant>>) -> Result<Self, Error> {
        let token = plane.governor.cancellation_token();
        let task = match addr.clone() {
            ListenerAddr::Tcp(socket_addr) => {
                let listener = TcpListener::bind(socket_addr)
                    .await
                    .map_err(|e| Error::ListenFailed { addr: socket_addr.to_string(), source: e.into() })?;
                tokio::spawn(accept_tcp(listener, plane, last_activity, token))
            }
            ListenerAddr::Unix(path) => {
                if let Some(parent) = path.parent() {
                    if !parent.as_os_str().is_empty() {
                        std::fs::create_dir_all(parent)
                            .map_err(|e| Error::ListenFailed { addr: path.display().to_string(), source: e.into() })?;
                    }
                }
                // A stale socket file from a previous, uncleanly-terminated run blocks bind.
                let _ = std::fs::remove_file(&path);
                let listener =
                    UnixListener::bind(&path).map_err(|e| Error::ListenFailed { addr: path.display().to_string(), source: e.into() })?;
                tokio::spawn(accept_unix(listener, plane, last_activity, token))
            }
        };
        info!(addr = %addr, "listener bound");
        Ok(Self { addr, task })
    }

    /// Aborts the accept loop. Connections already dispatched to their own tasks are
    /// unaffected.
    pub fn stop(&self) {
        self.task.abort();
    }

    pub async fn join(self) {
        let _ = self.task.await;
    }
}

async fn accept_tcp(
    listener: TcpListener,
    plane: ControlPlane,
    last_activity: Arc<Mutex<Instant>>,
    token: tokio_util::sync::CancellationToken,
) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                info!(%peer, "accepted tcp connection");
                tokio::spawn(dispatch::serve_tcp(stream, plane.clone(), last_activity.clone(), token.clone()));
            }
            Err(e) => warn!(error = %e, "tcp accept failed"),
        }
    }
}

async fn accept_unix(
    listener: UnixListener,
    plane: ControlPlane,
    last_activity: Arc<Mutex<Instant>>,
    token: tokio_util::sync::CancellationToken,
) {
    loop {
        match listener.accept().await {
            Ok((stream, _addr)) => {
                info!("accepted unix connection");
                tokio::spawn(dispatch::serve_unix(stream, plane.clone(), last_activity.clone(), token.clone()));
            }
            Err(e) => warn!(error = %e, "unix accept failed"),
        }
    }
}

/// Listeners keyed by the path ID of their `/listeners` mount point file, so removing the file
/// can look its accept task up and stop it.
#[derive(Default)]
pub struct ListenerTable {
    entries: tokio::sync::Mutex<std::collections::HashMap<crate::tree::PathId, ListenerHandle>>,
}

impl ListenerTable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn insert(&self, path_id: crate::tree::PathId, handle: ListenerHandle) {
        self.entries.lock().await.insert(path_id, handle);
    }

    /// Stops and joins the listener registered under `path_id`, if any.
    pub async fn remove(&self, path_id: crate::tree::PathId) {
        let handle = self.entries.lock().await.remove(&path_id);
        if let Some(handle) = handle {
            handle.stop();
            handle.join().await;
        }
    }

    /// Stops every listener and waits for its accept task to finish.
    pub async fn stop_all(&self) {
        let handles: Vec<_> = self.entries.lock().await.drain().map(|(_, h)| h).collect();
        for handle in &handles {
            handle.stop();
        }
        for handle in handles {
            handle.join().await;
        }
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tcp_and_unix_forms() {
        assert!(matches!(ListenerAddr::parse("tcp:127.0.0.1:9999").unwrap(), ListenerAddr::Tcp(_)));
        assert!(matches!(ListenerAddr::parse("127.0.0.1:9999").unwrap(), ListenerAddr::Tcp(_)));
        assert!(matches!(ListenerAddr::parse("unix:/run/fsd.sock").unwrap(), ListenerAddr::Unix(p) if p == PathBuf::from("/run/fsd.sock")));
    }

    #[test]
    fn rejects_garbage_addresses() {
        assert!(ListenerAddr::parse("not-an-address").is_err());
    }

    #[test]
    fn tree_path_mirrors_unix_socket_components() {
        let addr = ListenerAddr::Unix(PathBuf::from("/run/fsd/control.sock"));
        assert_eq!(addr.tree_path(), vec!["unix", "run", "fsd", "control.sock"]);
    }
}
