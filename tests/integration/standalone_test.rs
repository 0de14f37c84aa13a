// tests/integration/standalone_test.rs

//! End-to-end tests against a standalone mock server.

use super::test_helpers::MockServer;
use bytes::Bytes;
use citrine::config::ClientConfig;
use citrine::core::compression::{CompressionBackend, CompressionConfig, ENVELOPE_MAGIC};
use citrine::{CitrineError, Client, RouteIntent};
use std::time::Duration;

async fn client_for(server: &MockServer) -> Client {
    Client::connect(ClientConfig::new(vec![server.address()]))
        .await
        .expect("client connects to mock server")
}

#[tokio::test]
async fn test_set_get_roundtrip() {
    let server = MockServer::start().await;
    let client = client_for(&server).await;

    client.set("greeting", "hello").await.unwrap();
    assert_eq!(server.store_get(b"greeting").as_deref(), Some(&b"hello"[..]));
    assert_eq!(
        client.get("greeting").await.unwrap().as_deref(),
        Some(&b"hello"[..])
    );
    assert_eq!(client.get("missing").await.unwrap(), None);

    client.close(None).await;
}

#[tokio::test]
async fn test_compressed_set_get_end_to_end() {
    let server = MockServer::start().await;
    let mut config = ClientConfig::new(vec![server.address()]);
    config.compression = Some(CompressionConfig::new(CompressionBackend::Zstd));
    let client = Client::connect(config).await.unwrap();

    let payload = vec![b'A'; 1024];
    client.set("k", Bytes::from(payload.clone())).await.unwrap();

    // The server stored the envelope, not the plain value.
    let stored = server.store_get(b"k").unwrap();
    assert!(stored.len() < 1024);
    assert_eq!(&stored[..4], &ENVELOPE_MAGIC);

    // Reads are decompressed transparently.
    let restored = client.get("k").await.unwrap().unwrap();
    assert_eq!(&restored[..], &payload[..]);

    let stats = client.get_statistics();
    assert_eq!(stats.total_values_compressed, 1);
    assert_eq!(stats.total_original_bytes, 1024);
    assert!(stats.total_bytes_compressed < 1024);

    client.close(None).await;
}

#[tokio::test]
async fn test_timeout_then_recovery_on_same_connection() {
    let server = MockServer::start().await;
    let mut config = ClientConfig::new(vec![server.address()]);
    config.request_timeout = Some(Duration::from_millis(100));
    let client = Client::connect(config).await.unwrap();

    // DEBUG SLEEP outlives the deadline: the request must time out.
    let result = client
        .custom_command(
            vec![
                Bytes::from_static(b"DEBUG"),
                Bytes::from_static(b"SLEEP"),
                Bytes::from_static(b"0.5"),
            ],
            RouteIntent::Auto,
        )
        .await;
    assert_eq!(result.unwrap_err(), CitrineError::Timeout);

    // The stale reply is discarded once it arrives; the connection stays
    // usable and correlation stays aligned.
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(client.ping().await.unwrap(), "PONG");

    let stats = client.get_statistics();
    assert_eq!(stats.total_timeouts, 1);

    client.close(None).await;
}

#[tokio::test]
async fn test_mget_and_del() {
    let server = MockServer::start().await;
    let client = client_for(&server).await;

    client.set("a", "1").await.unwrap();
    client.set("b", "2").await.unwrap();

    let values = client
        .mget(vec![
            Bytes::from_static(b"a"),
            Bytes::from_static(b"missing"),
            Bytes::from_static(b"b"),
        ])
        .await
        .unwrap();
    assert_eq!(
        values,
        vec![
            Some(Bytes::from_static(b"1")),
            None,
            Some(Bytes::from_static(b"2")),
        ]
    );

    let removed = client
        .del(vec![Bytes::from_static(b"a"), Bytes::from_static(b"nope")])
        .await
        .unwrap();
    assert_eq!(removed, 1);

    client.close(None).await;
}

#[tokio::test]
async fn test_custom_command_echo() {
    let server = MockServer::start().await;
    let client = client_for(&server).await;

    let reply = client
        .custom_command(
            vec![Bytes::from_static(b"ECHO"), Bytes::from_static(b"payload")],
            RouteIntent::Auto,
        )
        .await
        .unwrap();
    assert_eq!(
        reply,
        citrine::Value::Bytes(Bytes::from_static(b"payload"))
    );

    client.close(None).await;
}

#[tokio::test]
async fn test_update_connection_password_immediate_auth() {
    let server = MockServer::start().await;
    let client = client_for(&server).await;

    client
        .update_connection_password(Some("s3cret".to_string()), true)
        .await
        .unwrap();
    assert!(server.seen_commands().iter().any(|c| c == "AUTH"));

    client.close(None).await;
}

#[tokio::test]
async fn test_lazy_connect_defers_the_socket() {
    let server = MockServer::start().await;
    let mut config = ClientConfig::new(vec![server.address()]);
    config.lazy_connect = true;
    let client = Client::connect(config).await.unwrap();
    assert_eq!(server.accepted_connections(), 0);

    assert_eq!(client.ping().await.unwrap(), "PONG");
    assert!(server.accepted_connections() >= 1);

    client.close(None).await;
}

#[tokio::test]
async fn test_operations_after_close_fail() {
    let server = MockServer::start().await;
    let client = client_for(&server).await;
    client.close(Some(Duration::from_millis(100))).await;

    assert_eq!(
        client.get("k").await.unwrap_err(),
        CitrineError::ClientClosed
    );
    assert!(client.is_closed());
}

#[tokio::test]
async fn test_telemetry_hook_observes_requests() {
    use citrine::core::telemetry::TelemetryHook;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingHook {
        started: AtomicUsize,
        finished: AtomicUsize,
    }
    impl TelemetryHook for CountingHook {
        fn on_request_started(&self, _name: &str) {
            self.started.fetch_add(1, Ordering::SeqCst);
        }
        fn on_request_finished(&self, _name: &str, _latency: Duration, _success: bool) {
            self.finished.fetch_add(1, Ordering::SeqCst);
        }
    }

    let server = MockServer::start().await;
    let client = client_for(&server).await;
    let hook = std::sync::Arc::new(CountingHook::default());
    client.install_telemetry_hook(hook.clone());

    client.ping().await.unwrap();
    client.ping().await.unwrap();
    assert_eq!(hook.started.load(Ordering::SeqCst), 2);
    assert_eq!(hook.finished.load(Ordering::SeqCst), 2);

    // Sampling at zero silences the hook entirely.
    client.set_telemetry_sample_percentage(0).unwrap();
    client.ping().await.unwrap();
    assert_eq!(hook.started.load(Ordering::SeqCst), 2);

    assert!(client.set_telemetry_sample_percentage(101).is_err());

    client.close(None).await;
}

#[tokio::test]
async fn test_request_counter_increments() {
    let server = MockServer::start().await;
    let client = client_for(&server).await;

    client.ping().await.unwrap();
    client.set("x", "y").await.unwrap();
    client.get("x").await.unwrap();

    assert!(client.get_statistics().total_requests >= 3);
    client.close(None).await;
}
