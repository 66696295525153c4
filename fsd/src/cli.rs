//! Command-line surface: a long-running `daemon` subcommand plus the short-lived commands that
//! talk to one over the wire (`mount`, `unmount`, `listeners`, `shutdown`).

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "fsd", about = "Exposes mounted virtual file systems over a 9P2000.L control plane.")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Address of a running daemon's control socket (`tcp:<host>:<port>` or `unix:<path>`).
    /// Defaults to the per-user runtime socket.
    #[arg(long = "server", global = true)]
    pub server: Option<String>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Runs the daemon in the foreground.
    Daemon {
        /// Additional addresses to listen on, beyond the default per-user socket.
        #[arg(long = "listen")]
        listen: Vec<String>,

        /// Shut down automatically after this many seconds with no live mounts or listeners.
        #[arg(long = "exit-after")]
        exit_after: Option<u64>,
    },

    /// Mounts a guest file system onto a host, returning the name of its mount point file.
    Mount {
        /// Driver tag for the host side (e.g. `fuse`).
        #[arg(long)]
        host: String,
        /// Driver tag for the guest side (e.g. `keyfs`).
        #[arg(long)]
        guest: String,
        /// JSON config file merged into the host driver's fields.
        #[arg(long = "host-config")]
        host_config: Option<PathBuf>,
        /// JSON config file merged into the guest driver's fields.
        #[arg(long = "guest-config")]
        guest_config: Option<PathBuf>,
    },

    /// Tears down a previously committed mount.
    Unmount {
        /// Mount point file path relative to `/mounts`, as returned by `mount`
        /// (`<host-tag>/<guest-tag>/<name>.json`).
        name: String,
    },

    /// Lists every address the daemon is currently listening on.
    Listeners,

    /// Requests the daemon shut down.
    Shutdown {
        /// How urgently to stop: `patient`, `short`, or `immediate`.
        #[arg(long, default_value = "patient")]
        disposition: String,
    },
}
