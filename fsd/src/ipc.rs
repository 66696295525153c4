//! The subprocess detach handshake: a parent process that spawned the daemon as a child wants
//! to hand it off to run unsupervised, without either killing it or leaving a zombie supervisor
//! around waiting on a process that's meant to outlive it.
//!
//! The wire protocol crate has no stdio transport, only `srv_async`/`srv_async_unix`, so the
//! handshake here runs over a pipe rather than over the 9P connection itself: the child writes
//! its control socket's path as a single line to its inherited stdout once `/control/release`
//! exists, the parent reads that line, attaches as an ordinary client, confirms the daemon is
//! answering by listing `/listeners`, then writes the EOT byte to `/control/release` and detaches
//! by simply dropping the connection and returning — the child is never sent a signal on the
//! success path.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};

use crate::client::FsdClient;
use crate::error::Error;

/// How long the parent waits for the child to print its socket path before giving up and
/// killing it.
const READY_TIMEOUT: Duration = Duration::from_secs(10);

/// How long the parent waits after a failed handshake before escalating from a termination
/// signal to an unconditional kill.
const KILL_GRACE: Duration = Duration::from_millis(500);

/// Spawns `program` with `args`, waits for it to report its control socket, attaches, confirms
/// it is serving, and releases it to run detached. On any failure the child is killed rather
/// than left running unsupervised.
pub async fn spawn_detached(program: &str, args: &[String]) -> Result<(), Error> {
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(Error::from_io)?;

    match handshake(&mut child).await {
        Ok(()) => Ok(()),
        Err(e) => {
            terminate(&mut child).await;
            Err(e)
        }
    }
}

async fn handshake(child: &mut Child) -> Result<(), Error> {
    let stdout = child.stdout.take().expect("spawned with Stdio::piped()");
    let mut lines = BufReader::new(stdout).lines();

    let socket_line = tokio::time::timeout(READY_TIMEOUT, lines.next_line())
        .await
        .map_err(|_| Error::ListenFailed { addr: program_label(child), source: anyhow::anyhow!("timed out waiting for ready line") })?
        .map_err(Error::from_io)?
        .ok_or_else(|| Error::ListenFailed { addr: program_label(child), source: anyhow::anyhow!("child exited before announcing its socket") })?;

    let socket_path = PathBuf::from(socket_line.trim());
    let client = FsdClient::attach_unix(&socket_path).await?;
    client.listeners().await?;
    client.release().await?;
    Ok(())
}

fn program_label(child: &Child) -> String {
    format!("pid {}", child.id().unwrap_or(0))
}

/// Tries a cooperative termination signal first, then escalates to an unconditional kill if the
/// child hasn't exited within [`KILL_GRACE`].
#[cfg(unix)]
async fn terminate(child: &mut Child) {
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
    }
    if tokio::time::timeout(KILL_GRACE, child.wait()).await.is_err() {
        let _ = child.kill().await;
    }
}

#[cfg(not(unix))]
async fn terminate(child: &mut Child) {
    let _ = child.kill().await;
}

/// The child side of the handshake: called once the daemon's control socket is bound and
/// `/control/release` exists, before it settles into serving. Prints the socket path as the
/// single ready line the parent's [`spawn_detached`] waits for.
pub fn announce_ready(socket_path: &std::path::Path) {
    println!("{}", socket_path.display());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn spawn_detached_kills_a_program_that_never_announces() {
        let result = spawn_detached("sleep", &["5".to_owned()]).await;
        assert!(result.is_err());
    }
}
