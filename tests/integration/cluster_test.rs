// tests/integration/cluster_test.rs

//! End-to-end tests against a single-node mock cluster that owns all 16384
//! slots.

use super::test_helpers::MockServer;
use bytes::Bytes;
use citrine::config::ClientConfig;
use citrine::core::batch::{Batch, BatchOptions};
use citrine::{CitrineError, Client, ClusterScanCursor, Cmd, ScanOptions, Value};
use std::time::Duration;

async fn cluster_client(server: &MockServer) -> Client {
    Client::connect(ClientConfig::cluster(vec![server.address()]))
        .await
        .expect("cluster client connects")
}

#[tokio::test]
async fn test_cluster_discovery_and_basic_commands() {
    let server = MockServer::start_cluster().await;
    let client = cluster_client(&server).await;
    assert!(server.seen_commands().iter().any(|c| c == "CLUSTER"));

    client.set("k", "v").await.unwrap();
    assert_eq!(client.get("k").await.unwrap().as_deref(), Some(&b"v"[..]));

    client.close(None).await;
}

#[tokio::test]
async fn test_atomic_batch_cross_slot_fails_before_io() {
    let server = MockServer::start_cluster().await;
    let client = cluster_client(&server).await;

    // "a" (slot 15495) and "foo" (slot 12182) cannot share a transaction.
    let batch = Batch::atomic().set("a", "1").set("foo", "2");
    let result = client.exec_batch(&batch, &BatchOptions::default()).await;
    assert_eq!(result.unwrap_err(), CitrineError::CrossSlot);

    // The check happens locally: the server never saw MULTI.
    assert!(!server.seen_commands().iter().any(|c| c == "MULTI"));

    client.close(None).await;
}

#[tokio::test]
async fn test_atomic_batch_executes_in_order() {
    let server = MockServer::start_cluster().await;
    let client = cluster_client(&server).await;

    let batch = Batch::atomic()
        .watch("{tag}guard")
        .set("{tag}k", "v1")
        .get("{tag}k");
    let values = client
        .exec_batch(&batch, &BatchOptions::default())
        .await
        .unwrap();
    assert_eq!(values.len(), 2);
    assert!(values[0].is_ok());
    assert_eq!(values[1], Value::Bytes(Bytes::from_static(b"v1")));
    assert!(server.seen_commands().iter().any(|c| c == "WATCH"));

    client.close(None).await;
}

#[tokio::test]
async fn test_watch_conflict_surfaces_distinctly() {
    let server = MockServer::start_cluster().await;
    let client = cluster_client(&server).await;

    server.set_fail_next_exec();
    let batch = Batch::atomic().watch("{t}w").set("{t}k", "v");
    let result = client.exec_batch(&batch, &BatchOptions::default()).await;
    assert_eq!(result.unwrap_err(), CitrineError::WatchConflict);

    client.close(None).await;
}

#[tokio::test]
async fn test_atomic_batch_rejects_retry_strategy() {
    let server = MockServer::start_cluster().await;
    let client = cluster_client(&server).await;

    let options = BatchOptions {
        retry_strategy: Some(citrine::BatchRetryStrategy {
            retry_server_error: true,
            retry_connection_error: false,
        }),
        ..Default::default()
    };
    let batch = Batch::atomic().set("{t}k", "v");
    let result = client.exec_batch(&batch, &options).await;
    assert!(matches!(result, Err(CitrineError::Configuration(_))));

    client.close(None).await;
}

#[tokio::test]
async fn test_pipeline_across_slots_preserves_order() {
    let server = MockServer::start_cluster().await;
    let client = cluster_client(&server).await;

    // Keys spanning three different slots.
    client.set("a", "va").await.unwrap();
    client.set("b", "vb").await.unwrap();
    client.set("c", "vc").await.unwrap();

    let values = client
        .mget(vec![
            Bytes::from_static(b"a"),
            Bytes::from_static(b"b"),
            Bytes::from_static(b"c"),
        ])
        .await
        .unwrap();
    assert_eq!(
        values,
        vec![
            Some(Bytes::from_static(b"va")),
            Some(Bytes::from_static(b"vb")),
            Some(Bytes::from_static(b"vc")),
        ]
    );

    client.close(None).await;
}

#[tokio::test]
async fn test_pipeline_batch_error_in_place() {
    let server = MockServer::start_cluster().await;
    let client = cluster_client(&server).await;
    client.set("good", "1").await.unwrap();

    let batch = Batch::pipeline()
        .get("good")
        .add(Cmd::new("BADCMD").arg("x"));
    let options = BatchOptions {
        raise_on_error: Some(false),
        ..Default::default()
    };
    let values = client.exec_batch(&batch, &options).await.unwrap();
    assert_eq!(values.len(), 2);
    assert_eq!(values[0], Value::Bytes(Bytes::from_static(b"1")));
    assert!(matches!(values[1], Value::ServerError(_)));

    // With raise_on_error (the default) the same batch fails.
    let result = client.exec_batch(&batch, &BatchOptions::default()).await;
    assert!(matches!(result, Err(CitrineError::Server(_))));

    client.close(None).await;
}

#[tokio::test]
async fn test_moved_redirect_is_absorbed() {
    let server = MockServer::start_cluster().await;
    let client = cluster_client(&server).await;
    client.set("k", "v").await.unwrap();

    // The next GET answers MOVED (pointing back at the same node); the
    // pipeline must retry and succeed without surfacing the redirect.
    server.set_moved_responses(1);
    assert_eq!(client.get("k").await.unwrap().as_deref(), Some(&b"v"[..]));

    client.close(None).await;
}

#[tokio::test]
async fn test_cluster_scan_visits_all_keys() {
    let server = MockServer::start_cluster().await;
    for i in 0..25 {
        server.store_set(format!("key:{i:02}").as_bytes(), b"v");
    }
    let client = cluster_client(&server).await;

    let mut cursor = ClusterScanCursor::new();
    let mut collected = Vec::new();
    let mut rounds = 0;
    while !cursor.is_finished() {
        let (next, keys) = client.scan(cursor, &ScanOptions::default()).await.unwrap();
        collected.extend(keys);
        cursor = next;
        rounds += 1;
        assert!(rounds < 32, "scan failed to converge");
    }

    collected.sort();
    let expected: Vec<Bytes> = (0..25)
        .map(|i| Bytes::from(format!("key:{i:02}").into_bytes()))
        .collect();
    assert_eq!(collected, expected);
    // Multiple pages were needed for 25 keys at 10 per page.
    assert!(rounds >= 3);

    client.close(None).await;
}

#[tokio::test]
async fn test_scan_cursor_reusable_and_finished_stays_finished() {
    let server = MockServer::start_cluster().await;
    server.store_set(b"only", b"v");
    let client = cluster_client(&server).await;

    let cursor = ClusterScanCursor::new();
    let (cursor, keys) = client.scan(cursor, &ScanOptions::default()).await.unwrap();
    assert_eq!(keys, vec![Bytes::from_static(b"only")]);
    assert!(cursor.is_finished());

    let (cursor, keys) = client.scan(cursor, &ScanOptions::default()).await.unwrap();
    assert!(keys.is_empty());
    assert!(cursor.is_finished());

    client.close(None).await;
}

#[tokio::test]
async fn test_fanout_all_primaries() {
    let server = MockServer::start_cluster().await;
    let client = cluster_client(&server).await;

    let reply = client
        .custom_command(
            vec![Bytes::from_static(b"PING")],
            citrine::RouteIntent::AllPrimaries,
        )
        .await
        .unwrap();
    let Value::Map(entries) = reply else {
        panic!("expected per-node map, got {reply:?}");
    };
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].1, Value::Simple("PONG".to_string()));

    client.close(None).await;
}

#[tokio::test]
async fn test_batch_timeout_is_batch_wide() {
    let server = MockServer::start_cluster().await;
    let client = cluster_client(&server).await;

    let batch = Batch::pipeline().add(
        Cmd::new("DEBUG").arg("SLEEP").arg("0.5"),
    );
    let options = BatchOptions {
        timeout: Some(Duration::from_millis(80)),
        ..Default::default()
    };
    let result = client.exec_batch(&batch, &options).await;
    assert_eq!(result.unwrap_err(), CitrineError::Timeout);

    client.close(None).await;
}
