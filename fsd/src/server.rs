//! Top-level daemon coordinator: owns the process-wide state, brings the fixed layout and the
//! initial listener up, watches for a shutdown request, and drives the termination sequence.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::error::Error;
use crate::fs_impl::ControlPlane;
use crate::listener::{ListenerAddr, ListenerHandle, ListenerTable};
use crate::mount::MountTable;
use crate::shutdown::{self, Disposition, ShutdownGovernor, SHORT_DEADLINE};
use crate::tree::Tree;

/// How long a mount or listener is allowed to sit with no activity before the idle checker
/// requests a patient shutdown. `None` disables the idle checker entirely.
pub struct ServerOptions {
    pub listen: Vec<ListenerAddr>,
    pub idle_timeout: Option<Duration>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self { listen: Vec::new(), idle_timeout: None }
    }
}

/// Maps a ctrl-c signal's 1-based count to the disposition it should trigger: the first asks
/// nicely, the second loses patience, the third or later means now.
fn escalate(signal_count: u32) -> Disposition {
    match signal_count {
        1 => Disposition::Patient,
        2 => Disposition::Short,
        _ => Disposition::Immediate,
    }
}

/// The running daemon: the shared tree and subsystem tables, plus the tasks watching them.
pub struct Server {
    pub tree: Arc<Tree>,
    pub mounts: Arc<MountTable>,
    pub listeners: Arc<ListenerTable>,
    pub governor: Arc<ShutdownGovernor>,
    last_activity: Arc<std::sync::Mutex<Instant>>,
}

impl Server {
    /// Builds the fixed layout and registers every driver this build ships with. Does not bind
    /// any listener yet; callers add those through [`Server::listen`] or by writing to
    /// `/listeners` once a client is attached.
    pub fn new() -> Result<Arc<Self>, Error> {
        fsd_drivers::install_builtin_drivers();
        let tree = Tree::new();
        ControlPlane::ensure_layout(&tree)?;
        Ok(Arc::new(Self {
            tree,
            mounts: MountTable::new(),
            listeners: ListenerTable::new(),
            governor: ShutdownGovernor::new(),
            last_activity: Arc::new(std::sync::Mutex::new(Instant::now())),
        }))
    }

    /// A fresh control-plane template bound to this server's shared state. Every connection gets
    /// its own clone of this value via `ControlPlane`'s `Clone` impl; this one is never served
    /// directly.
    pub fn control_plane(&self) -> ControlPlane {
        ControlPlane::new(
            self.tree.clone(),
            self.mounts.clone(),
            self.listeners.clone(),
            self.governor.clone(),
            self.last_activity.clone(),
        )
    }

    /// Binds `addr` and registers it under `/listeners`, mirroring what a client does by
    /// `mkdir`-ing the same path over the wire.
    pub async fn listen(&self, addr: ListenerAddr) -> Result<(), Error> {
        let path_id = self.tree.mkdir_all(
            crate::tree::ROOT_PATH_ID,
            &["listeners"],
            0,
            0,
            0o755,
        )?;
        let components = addr.tree_path();
        let (leaf, dirs) = components.split_last().expect("tree_path is never empty");
        let parent = self.tree.mkdir_all(path_id, dirs, 0, 0, 0o755)?;
        let node = self.tree.mkdir(parent, leaf, 0, 0, 0o755)?;
        let handle = ListenerHandle::bind(addr, self.control_plane(), self.last_activity.clone()).await?;
        self.listeners.insert(node.path_id, handle).await;
        Ok(())
    }

    /// Runs the daemon until a shutdown is requested, then drives the termination sequence and
    /// returns. `options.listen` is bound before the idle/emptiness checkers start.
    pub async fn run(self: Arc<Self>, options: ServerOptions) -> Result<(), Error> {
        for addr in options.listen {
            self.listen(addr).await?;
        }

        let idle_task = options.idle_timeout.map(|timeout| {
            tokio::spawn(shutdown::run_idle_checker(self.governor.clone(), self.last_activity.clone(), timeout))
        });
        let empty_task =
            tokio::spawn(shutdown::run_empty_checker(self.governor.clone(), self.mounts.clone(), self.listeners.clone()));

        // Best-effort: a process can only install one of these handlers, which matters for
        // tests that build more than one `Server` in the same binary. Losing it just means
        // ctrl-c falls back to the default "kill the process" behavior; `/control/shutdown` and
        // the idle/empty checkers are still there to request an orderly stop.
        //
        // Each ctrl-c escalates: the first asks for a patient drain, the second cuts it down to
        // the short deadline, and the third or later demands an immediate stop.
        let governor = self.governor.clone();
        let signals = Arc::new(AtomicU32::new(0));
        if let Err(e) = ctrlc::set_handler(move || {
            let count = signals.fetch_add(1, Ordering::Relaxed) + 1;
            governor.trigger(escalate(count));
        }) {
            warn!(error = %e, "could not install ctrl-c handler");
        }

        self.governor.wait_for_trigger().await;
        let disposition = self.governor.current().expect("wait_for_trigger only resolves once triggered");
        info!(?disposition, "beginning shutdown sequence");

        if let Some(task) = idle_task {
            task.abort();
        }
        empty_task.abort();

        self.terminate(disposition).await;
        Ok(())
    }

    /// Stops accepting new connections, gives outstanding work a deadline (unless the
    /// disposition is `Immediate`, which cancels everything up front), then tears down every
    /// live mount.
    async fn terminate(&self, disposition: Disposition) {
        self.listeners.stop_all().await;

        if disposition == Disposition::Immediate {
            self.governor.cancellation_token().cancel();
        } else if disposition == Disposition::Short {
            tokio::time::sleep(SHORT_DEADLINE).await;
            self.governor.cancellation_token().cancel();
        }

        for (path_id, err) in self.mounts.teardown_all() {
            warn!(path_id, error = %err, "mount teardown failed during shutdown");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ctrlc_escalates_patient_then_short_then_immediate() {
        assert_eq!(escalate(1), Disposition::Patient);
        assert_eq!(escalate(2), Disposition::Short);
        assert_eq!(escalate(3), Disposition::Immediate);
        assert_eq!(escalate(4), Disposition::Immediate);
    }

    #[tokio::test]
    async fn new_server_has_the_fixed_layout_and_no_listeners() {
        let server = Server::new().unwrap();
        assert!(server.listeners.is_empty().await);
        assert!(server.mounts.is_empty());
        let entries = server.tree.readdir(crate::tree::ROOT_PATH_ID).unwrap();
        let names: Vec<_> = entries.iter().map(|(n, _)| n.as_str()).collect();
        assert!(names.contains(&"mounts"));
        assert!(names.contains(&"listeners"));
        assert!(names.contains(&"control"));
    }

    #[tokio::test]
    async fn run_terminates_once_a_shutdown_is_triggered() {
        let server = Server::new().unwrap();
        let governor = server.governor.clone();
        let handle = tokio::spawn(server.run(ServerOptions::default()));
        governor.trigger(Disposition::Immediate);
        tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap().unwrap();
    }
}
