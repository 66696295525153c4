//! Functions and types shared across integration test modules.
#![allow(dead_code)]

use std::sync::Arc;

use fsd::client::FsdClient;
use fsd::listener::ListenerAddr;
use fsd::server::{Server, ServerOptions};

/// Boots a server bound to a fresh Unix socket under a temp directory, attaches a client to it,
/// and returns both. The server keeps running on its own spawned task for the life of the test;
/// tests drive shutdown themselves through the client, the same way an operator would.
pub async fn boot() -> (Arc<Server>, FsdClient, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("fsd.sock");

    let server = Server::new().unwrap();
    server.listen(ListenerAddr::Unix(socket.clone())).await.unwrap();

    let server_task = server.clone();
    tokio::spawn(async move {
        let _ = server_task.run(ServerOptions::default()).await;
    });

    // The listener task is spawned by `listen` above, independent of `run`; give it a moment to
    // start accepting before the client dials in.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    let client = FsdClient::attach_unix(&socket).await.unwrap();
    (server, client, dir)
}

#[ctor::ctor]
fn init_tracing_subscriber() {
    let _ = tracing_subscriber::fmt::try_init();
}
