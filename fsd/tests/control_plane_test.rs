mod common;

use fsd::shutdown::Disposition;

#[tokio::test]
async fn mount_with_unimplemented_host_driver_reports_the_failure() {
    let (_server, client, _dir) = common::boot().await;

    let result = client
        .mount("nfs", serde_json::json!({}), "keyfs", serde_json::json!({"entries": {}}))
        .await;

    // The commit sequence runs once the mount point file's body has been fully written, on
    // close, so a driver that refuses the mount fails the clunk rather than the write.
    assert!(result.is_err());
    let last_error = client.last_error().await.unwrap();
    assert!(last_error.contains("nfs"), "expected the nfs driver's failure in the ring, got: {last_error}");
}

#[tokio::test]
async fn listeners_reports_the_bound_socket() {
    let (_server, client, _dir) = common::boot().await;
    let listeners = client.listeners().await.unwrap();
    assert_eq!(listeners.len(), 1);
    assert!(listeners[0].starts_with("unix/"));
    assert!(listeners[0].ends_with("fsd.sock"));
}

#[tokio::test]
async fn shutdown_request_is_observed_by_the_daemon() {
    let (server, client, _dir) = common::boot().await;
    client.shutdown(Disposition::Immediate).await.unwrap();
    tokio::time::timeout(std::time::Duration::from_secs(5), server.governor.wait_for_trigger()).await.unwrap();
    assert_eq!(server.governor.current(), Some(Disposition::Immediate));
}
