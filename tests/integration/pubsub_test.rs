// tests/integration/pubsub_test.rs

//! Pub/Sub end-to-end: subscribe acknowledgements, message delivery through
//! both the pull API and callbacks, reconciliation after a dropped
//! connection, and sharded channels in cluster mode.

use super::test_helpers::MockServer;
use bytes::Bytes;
use citrine::config::ClientConfig;
use citrine::core::pubsub::PubSubSubscriptions;
use citrine::{Client, PubSubChannelMode, PubSubMsg};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

const ACK_TIMEOUT: Duration = Duration::from_secs(2);

async fn wait_until(mut check: impl FnMut() -> bool, what: &str) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn test_subscribe_ack_and_pull_delivery() {
    let server = MockServer::start().await;
    let client = Client::connect(ClientConfig::new(vec![server.address()]))
        .await
        .unwrap();

    client
        .subscribe(
            PubSubChannelMode::Exact,
            vec![Bytes::from_static(b"ch1")],
            ACK_TIMEOUT,
        )
        .await
        .unwrap();
    assert!(client.subscription_status().is_reconciled());
    assert_eq!(server.subscription_count(), 1);

    assert_eq!(server.publish(b"ch1", b"hello"), 1);
    let msg = tokio::time::timeout(ACK_TIMEOUT, client.get_pubsub_message())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(msg.channel, Bytes::from_static(b"ch1"));
    assert_eq!(msg.message, Bytes::from_static(b"hello"));
    assert_eq!(msg.pattern, None);

    // No duplicates queued.
    assert!(client.try_get_pubsub_message().unwrap().is_none());

    client.close(None).await;
}

#[tokio::test]
async fn test_config_declared_subscription_with_callback() {
    let server = MockServer::start().await;

    let (msg_tx, mut msg_rx) = tokio::sync::mpsc::unbounded_channel::<PubSubMsg>();
    let mut channels = BTreeMap::new();
    channels.insert(
        PubSubChannelMode::Exact,
        BTreeSet::from([Bytes::from_static(b"news")]),
    );
    let mut config = ClientConfig::new(vec![server.address()]);
    config.pubsub = Some(PubSubSubscriptions {
        channels,
        callback: Some(Arc::new(move |msg| {
            let _ = msg_tx.send(msg);
        })),
    });
    let client = Client::connect(config).await.unwrap();

    // The handshake re-issued the declared subscription.
    wait_until(|| server.subscription_count() == 1, "handshake subscribe").await;

    server.publish(b"news", b"breaking");
    let msg = tokio::time::timeout(ACK_TIMEOUT, msg_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(msg.message, Bytes::from_static(b"breaking"));

    // Pull APIs are unavailable in callback mode.
    assert!(client.try_get_pubsub_message().is_err());

    client.close(None).await;
}

#[tokio::test]
async fn test_resubscribe_after_connection_loss() {
    let server = MockServer::start().await;
    let client = Client::connect(ClientConfig::new(vec![server.address()]))
        .await
        .unwrap();

    client
        .subscribe(
            PubSubChannelMode::Exact,
            vec![Bytes::from_static(b"ch1")],
            ACK_TIMEOUT,
        )
        .await
        .unwrap();
    assert_eq!(server.subscription_count(), 1);

    // Sever every connection; the supervisor reconnects and the handshake
    // re-issues the subscription before the connection serves traffic.
    server.kill_connections();
    wait_until(|| server.subscription_count() == 0, "old subscription teardown").await;
    wait_until(|| server.subscription_count() == 1, "resubscription").await;
    wait_until(
        || client.subscription_status().is_reconciled(),
        "acknowledgement reconciliation",
    )
    .await;

    // Exactly one delivery for one publish after the reconnect.
    assert_eq!(server.publish(b"ch1", b"after-reconnect"), 1);
    let msg = tokio::time::timeout(ACK_TIMEOUT, client.get_pubsub_message())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(msg.message, Bytes::from_static(b"after-reconnect"));
    assert!(client.try_get_pubsub_message().unwrap().is_none());

    client.close(None).await;
}

#[tokio::test]
async fn test_unsubscribe_stops_delivery() {
    let server = MockServer::start().await;
    let client = Client::connect(ClientConfig::new(vec![server.address()]))
        .await
        .unwrap();

    client
        .subscribe(
            PubSubChannelMode::Exact,
            vec![Bytes::from_static(b"ch1")],
            ACK_TIMEOUT,
        )
        .await
        .unwrap();
    client
        .unsubscribe(
            PubSubChannelMode::Exact,
            vec![Bytes::from_static(b"ch1")],
            ACK_TIMEOUT,
        )
        .await
        .unwrap();

    let status = client.subscription_status();
    assert!(status.intended.is_empty());
    assert_eq!(server.publish(b"ch1", b"ignored"), 0);

    client.close(None).await;
}

#[tokio::test]
async fn test_sharded_subscription_in_cluster_mode() {
    let server = MockServer::start_cluster().await;
    let client = Client::connect(ClientConfig::cluster(vec![server.address()]))
        .await
        .unwrap();

    client
        .subscribe(
            PubSubChannelMode::Sharded,
            vec![Bytes::from_static(b"shard-ch")],
            ACK_TIMEOUT,
        )
        .await
        .unwrap();

    assert_eq!(server.publish_sharded(b"shard-ch", b"payload"), 1);
    let msg = tokio::time::timeout(ACK_TIMEOUT, client.get_pubsub_message())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(msg.channel, Bytes::from_static(b"shard-ch"));
    assert_eq!(msg.message, Bytes::from_static(b"payload"));

    client.close(None).await;
}

#[tokio::test]
async fn test_sharded_subscribe_rejected_on_standalone() {
    let server = MockServer::start().await;
    let client = Client::connect(ClientConfig::new(vec![server.address()]))
        .await
        .unwrap();

    let result = client
        .subscribe_lazy(
            PubSubChannelMode::Sharded,
            vec![Bytes::from_static(b"sch")],
        )
        .await;
    assert!(matches!(
        result,
        Err(citrine::CitrineError::Configuration(_))
    ));

    client.close(None).await;
}

#[tokio::test]
async fn test_pattern_subscription_acknowledged() {
    let server = MockServer::start().await;
    let client = Client::connect(ClientConfig::new(vec![server.address()]))
        .await
        .unwrap();

    client
        .subscribe(
            PubSubChannelMode::Pattern,
            vec![Bytes::from_static(b"news.*")],
            ACK_TIMEOUT,
        )
        .await
        .unwrap();
    let status = client.subscription_status();
    assert!(status.is_reconciled());
    assert!(
        status
            .acknowledged
            .get(&PubSubChannelMode::Pattern)
            .is_some_and(|set| set.contains(&Bytes::from_static(b"news.*")))
    );

    client.close(None).await;
}
