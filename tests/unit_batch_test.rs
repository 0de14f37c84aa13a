use bytes::Bytes;
use citrine::core::batch::{Batch, BatchOptions, BatchRetryStrategy};
use citrine::core::commands::Cmd;
use citrine::core::pubsub::PubSubChannelMode;

#[test]
fn test_batch_builder_shapes() {
    let atomic = Batch::atomic().set("k", "v").get("k");
    assert!(atomic.is_atomic());
    assert_eq!(atomic.len(), 2);
    assert!(!atomic.is_empty());

    let pipeline = Batch::pipeline();
    assert!(!pipeline.is_atomic());
    assert!(pipeline.is_empty());
}

#[test]
fn test_batch_accepts_raw_commands() {
    let batch = Batch::pipeline()
        .add(Cmd::new("INCR").arg("counter"))
        .add(Cmd::from_args(vec![
            Bytes::from_static(b"SET"),
            Bytes::from_static(b"k"),
            Bytes::from_static(b"v"),
        ]));
    assert_eq!(batch.len(), 2);
}

#[test]
fn test_batch_options_defaults() {
    let options = BatchOptions::default();
    assert!(options.raise_on_error.is_none());
    assert!(options.timeout.is_none());
    assert!(options.retry_strategy.is_none());

    let strategy = BatchRetryStrategy::default();
    assert!(!strategy.retry_server_error);
    assert!(!strategy.retry_connection_error);
}

#[test]
fn test_channel_mode_wire_commands() {
    assert_eq!(PubSubChannelMode::Exact.subscribe_command(), "SUBSCRIBE");
    assert_eq!(PubSubChannelMode::Pattern.subscribe_command(), "PSUBSCRIBE");
    assert_eq!(PubSubChannelMode::Sharded.subscribe_command(), "SSUBSCRIBE");
    assert_eq!(PubSubChannelMode::Exact.unsubscribe_command(), "UNSUBSCRIBE");
    assert_eq!(
        PubSubChannelMode::Pattern.unsubscribe_command(),
        "PUNSUBSCRIBE"
    );
    assert_eq!(
        PubSubChannelMode::Sharded.unsubscribe_command(),
        "SUNSUBSCRIBE"
    );
}
