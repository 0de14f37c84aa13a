use citrine::CitrineError;
use citrine::config::{
    BackoffStrategy, ClientConfig, ClientMode, NodeAddress, PeriodicChecks, ProtocolVersion,
    ReadFrom, TlsMode, TlsSettings,
};
use citrine::core::compression::{CompressionBackend, CompressionConfig};
use citrine::core::pubsub::{PubSubChannelMode, PubSubSubscriptions};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

fn base_config() -> ClientConfig {
    ClientConfig::new(vec![NodeAddress::new("127.0.0.1", 6379)])
}

fn assert_config_error(config: &ClientConfig) {
    assert!(matches!(
        config.validate(),
        Err(CitrineError::Configuration(_))
    ));
}

#[test]
fn test_defaults() {
    let config = base_config();
    assert_eq!(config.effective_request_timeout(), Duration::from_millis(250));
    assert_eq!(
        config.effective_connection_timeout(),
        Duration::from_millis(2000)
    );
    assert_eq!(config.effective_inflight_limit(), 1000);
    assert_eq!(config.protocol, ProtocolVersion::Resp3);
    assert_eq!(config.read_from, ReadFrom::Primary);
    assert!(matches!(
        config.mode,
        ClientMode::Standalone { database_id: 0 }
    ));
    assert!(config.validate().is_ok());
}

#[test]
fn test_empty_addresses_rejected() {
    let config = ClientConfig::new(vec![]);
    assert_config_error(&config);
}

#[test]
fn test_az_affinity_requires_client_az() {
    let mut config = base_config();
    config.read_from = ReadFrom::AzAffinity;
    assert_config_error(&config);

    config.client_az = Some("us-east-1a".to_string());
    assert!(config.validate().is_ok());

    config.read_from = ReadFrom::AzAffinityReplicasAndPrimary;
    config.client_az = Some(String::new());
    assert_config_error(&config);
}

#[test]
fn test_pubsub_requires_resp3() {
    let mut config = base_config();
    let mut channels = BTreeMap::new();
    channels.insert(
        PubSubChannelMode::Exact,
        BTreeSet::from([bytes::Bytes::from_static(b"ch1")]),
    );
    config.pubsub = Some(PubSubSubscriptions {
        channels,
        callback: None,
    });
    assert!(config.validate().is_ok());

    config.protocol = ProtocolVersion::Resp2;
    assert_config_error(&config);
}

#[test]
fn test_sharded_pubsub_requires_cluster_mode() {
    let mut config = base_config();
    let mut channels = BTreeMap::new();
    channels.insert(
        PubSubChannelMode::Sharded,
        BTreeSet::from([bytes::Bytes::from_static(b"sch")]),
    );
    config.pubsub = Some(PubSubSubscriptions {
        channels: channels.clone(),
        callback: None,
    });
    assert_config_error(&config);

    let mut cluster = ClientConfig::cluster(vec![NodeAddress::new("127.0.0.1", 7000)]);
    cluster.pubsub = Some(PubSubSubscriptions {
        channels,
        callback: None,
    });
    assert!(cluster.validate().is_ok());
}

#[test]
fn test_compression_level_validated() {
    let mut config = base_config();
    config.compression = Some(CompressionConfig {
        backend: CompressionBackend::Zstd,
        level: Some(23),
        min_compression_size: 64,
    });
    assert_config_error(&config);
}

#[test]
fn test_custom_ca_rules() {
    let mut config = base_config();
    config.tls = TlsSettings {
        mode: TlsMode::Secure,
        custom_ca: Some(vec![]),
    };
    assert_config_error(&config);

    // A custom CA makes no sense without certificate verification.
    config.tls = TlsSettings {
        mode: TlsMode::Insecure,
        custom_ca: Some(b"-----BEGIN CERTIFICATE-----".to_vec()),
    };
    assert_config_error(&config);
}

#[test]
fn test_jitter_bounds() {
    let mut config = base_config();
    config.reconnect_strategy = BackoffStrategy {
        num_of_retries: 3,
        factor: 10,
        exponent_base: 2,
        jitter_percent: Some(101),
    };
    assert_config_error(&config);
}

#[test]
fn test_zero_inflight_limit_rejected() {
    let mut config = base_config();
    config.inflight_limit = Some(0);
    assert_config_error(&config);
}

#[test]
fn test_backoff_defaults() {
    let strategy = BackoffStrategy::default();
    assert_eq!(strategy.effective_jitter_percent(), 20);
    assert!(strategy.num_of_retries > 0);
}

#[test]
fn test_periodic_checks_intervals() {
    assert!(PeriodicChecks::EnabledDefault.interval().is_some());
    assert_eq!(
        PeriodicChecks::ManualInterval(Duration::from_secs(5)).interval(),
        Some(Duration::from_secs(5))
    );
    assert_eq!(PeriodicChecks::Disabled.interval(), None);
}

#[test]
fn test_node_address_parse() {
    assert_eq!(
        NodeAddress::parse("10.0.0.1:6379"),
        Some(NodeAddress::new("10.0.0.1", 6379))
    );
    assert_eq!(
        NodeAddress::parse("cache.example.com:7000"),
        Some(NodeAddress::new("cache.example.com", 7000))
    );
    assert_eq!(NodeAddress::parse("no-port"), None);
    assert_eq!(NodeAddress::parse(":6379"), None);
    assert_eq!(NodeAddress::parse("host:notaport"), None);
}
