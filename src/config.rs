// src/config.rs

//! Client configuration: every recognized option as an explicit field, plus
//! the construction-time validation pass.

use crate::core::CitrineError;
use crate::core::compression::CompressionConfig;
use crate::core::pubsub::PubSubSubscriptions;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Default request deadline.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(250);
/// Default bound on TCP connect + TLS + handshake.
pub const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_millis(2000);
/// Default cap on requests written but not yet answered.
pub const DEFAULT_INFLIGHT_LIMIT: usize = 1000;
/// Default IAM token refresh interval.
pub const DEFAULT_IAM_REFRESH_INTERVAL: Duration = Duration::from_secs(300);
/// Default interval for cluster periodic topology checks.
pub const DEFAULT_PERIODIC_CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// A server endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeAddress {
    pub host: String,
    pub port: u16,
}

impl NodeAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parses `host:port`, the shape MOVED/ASK redirects carry.
    pub fn parse(s: &str) -> Option<Self> {
        let (host, port) = s.rsplit_once(':')?;
        let port = port.parse().ok()?;
        if host.is_empty() {
            return None;
        }
        Some(Self::new(host, port))
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Transport security for all connections of one client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TlsMode {
    /// Plain TCP.
    #[default]
    Off,
    /// TLS with certificate verification against the system roots (or a
    /// custom CA when one is configured).
    Secure,
    /// TLS without certificate verification. Test environments only.
    Insecure,
}

/// TLS settings grouped with their optional custom trust anchor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsSettings {
    pub mode: TlsMode,
    /// PEM-encoded CA certificate bytes. Only meaningful with `TlsMode::Secure`.
    #[serde(default)]
    pub custom_ca: Option<Vec<u8>>,
}

/// The wire protocol to negotiate during the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProtocolVersion {
    Resp2,
    #[default]
    Resp3,
}

impl ProtocolVersion {
    pub fn as_u8(self) -> u8 {
        match self {
            ProtocolVersion::Resp2 => 2,
            ProtocolVersion::Resp3 => 3,
        }
    }
}

/// Which nodes serve read-only commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReadFrom {
    /// Always the shard primary.
    #[default]
    Primary,
    /// Round-robin across replicas, primary as fallback.
    PreferReplica,
    /// Round-robin across replicas in the client's AZ, then any replica,
    /// then the primary.
    AzAffinity,
    /// Like `AzAffinity`, but a same-AZ primary is preferred over remote
    /// replicas.
    AzAffinityReplicasAndPrimary,
}

impl ReadFrom {
    pub fn requires_client_az(self) -> bool {
        matches!(
            self,
            ReadFrom::AzAffinity | ReadFrom::AzAffinityReplicasAndPrimary
        )
    }
}

/// Reconnection backoff parameters.
///
/// The delay before attempt `n` is `rand(0, factor * exponent_base^n)`
/// with a jitter of up to `jitter_percent` applied, frozen once `n`
/// reaches `num_of_retries`. Retries themselves never stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffStrategy {
    pub num_of_retries: u32,
    /// Multiplier in milliseconds.
    pub factor: u32,
    pub exponent_base: u32,
    /// Jitter percentage; defaults to 20 when unset.
    pub jitter_percent: Option<u32>,
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        Self {
            num_of_retries: 8,
            factor: 100,
            exponent_base: 2,
            jitter_percent: None,
        }
    }
}

impl BackoffStrategy {
    pub fn effective_jitter_percent(&self) -> u32 {
        self.jitter_percent.unwrap_or(20)
    }
}

/// The managed services IAM tokens can authenticate against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum_macros::Display)]
#[serde(rename_all = "kebab-case")]
pub enum ServiceType {
    ElastiCache,
    MemoryDb,
}

/// Generates short-lived IAM authentication tokens.
///
/// The core never talks to the identity service itself; the embedding
/// application injects a generator, and the client calls it on every
/// (re)connect attempt and on the periodic refresh tick.
#[async_trait]
pub trait IamTokenProvider: Send + Sync {
    async fn generate_token(
        &self,
        username: &str,
        config: &IamConfig,
    ) -> Result<String, CitrineError>;
}

/// IAM authentication parameters.
#[derive(Clone)]
pub struct IamConfig {
    pub cluster_name: String,
    pub service: ServiceType,
    pub region: String,
    /// How often the cached token is regenerated. Defaults to 300 seconds.
    pub refresh_interval: Duration,
    pub provider: Arc<dyn IamTokenProvider>,
}

impl fmt::Debug for IamConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IamConfig")
            .field("cluster_name", &self.cluster_name)
            .field("service", &self.service)
            .field("region", &self.region)
            .field("refresh_interval", &self.refresh_interval)
            .finish_non_exhaustive()
    }
}

/// Exactly one authentication mode; the enum makes mixing impossible.
#[derive(Debug, Clone)]
pub enum Credentials {
    Password {
        /// Defaults to `"default"` when unset.
        username: Option<String>,
        password: String,
    },
    Iam {
        username: String,
        config: IamConfig,
    },
}

impl Credentials {
    pub fn username(&self) -> &str {
        match self {
            Credentials::Password { username, .. } => username.as_deref().unwrap_or("default"),
            Credentials::Iam { username, .. } => username,
        }
    }

    pub fn is_iam(&self) -> bool {
        matches!(self, Credentials::Iam { .. })
    }
}

/// Cluster periodic topology check policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PeriodicChecks {
    /// Refresh on the built-in default interval.
    #[default]
    EnabledDefault,
    /// Refresh on an explicit interval.
    ManualInterval(Duration),
    Disabled,
}

impl PeriodicChecks {
    pub fn interval(&self) -> Option<Duration> {
        match self {
            PeriodicChecks::EnabledDefault => Some(DEFAULT_PERIODIC_CHECK_INTERVAL),
            PeriodicChecks::ManualInterval(d) => Some(*d),
            PeriodicChecks::Disabled => None,
        }
    }
}

/// Standalone vs. cluster deployment shape, with the options only one of
/// them recognizes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ClientMode {
    Standalone {
        /// Logical database selected after the handshake. Standalone only.
        database_id: u32,
    },
    Cluster {
        periodic_checks: PeriodicChecks,
        /// When true, topology refreshes always query the originally
        /// configured seeds instead of walking the current view.
        refresh_from_initial_nodes: bool,
    },
}

impl Default for ClientMode {
    fn default() -> Self {
        ClientMode::Standalone { database_id: 0 }
    }
}

impl ClientMode {
    pub fn is_cluster(&self) -> bool {
        matches!(self, ClientMode::Cluster { .. })
    }
}

/// The immutable configuration assembled once at client creation.
#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    pub addresses: Vec<NodeAddress>,
    pub mode: ClientMode,
    pub tls: TlsSettings,
    pub credentials: Option<Credentials>,
    pub read_from: ReadFrom,
    /// Deadline for each request. Defaults to 250 ms.
    pub request_timeout: Option<Duration>,
    /// Bound on connection establishment + handshake. Defaults to 2000 ms.
    pub connection_timeout: Option<Duration>,
    pub reconnect_strategy: BackoffStrategy,
    /// CLIENT SETNAME value, when configured.
    pub client_name: Option<String>,
    pub protocol: ProtocolVersion,
    /// Cap on requests written but not yet answered. Defaults to 1000.
    pub inflight_limit: Option<usize>,
    /// The client's availability zone, for AZ-affinity reads.
    pub client_az: Option<String>,
    pub pubsub: Option<PubSubSubscriptions>,
    pub compression: Option<CompressionConfig>,
    /// Defer the first connection until the first request.
    pub lazy_connect: bool,
}

impl ClientConfig {
    pub fn new(addresses: Vec<NodeAddress>) -> Self {
        Self {
            addresses,
            ..Default::default()
        }
    }

    pub fn cluster(addresses: Vec<NodeAddress>) -> Self {
        Self {
            addresses,
            mode: ClientMode::Cluster {
                periodic_checks: PeriodicChecks::default(),
                refresh_from_initial_nodes: false,
            },
            ..Default::default()
        }
    }

    pub fn effective_request_timeout(&self) -> Duration {
        self.request_timeout.unwrap_or(DEFAULT_REQUEST_TIMEOUT)
    }

    pub fn effective_connection_timeout(&self) -> Duration {
        self.connection_timeout.unwrap_or(DEFAULT_CONNECTION_TIMEOUT)
    }

    pub fn effective_inflight_limit(&self) -> usize {
        self.inflight_limit.unwrap_or(DEFAULT_INFLIGHT_LIMIT)
    }

    /// The construction-time validation pass. Every rule here fails fast
    /// with `ConfigurationError` before any socket is opened.
    pub fn validate(&self) -> Result<(), CitrineError> {
        if self.addresses.is_empty() {
            return Err(CitrineError::Configuration(
                "At least one server address is required".to_string(),
            ));
        }

        if self.read_from.requires_client_az()
            && self.client_az.as_deref().unwrap_or("").is_empty()
        {
            return Err(CitrineError::Configuration(
                "client_az is required when read_from is AZ-affine".to_string(),
            ));
        }

        if self.pubsub.is_some() && self.protocol != ProtocolVersion::Resp3 {
            return Err(CitrineError::Configuration(
                "PubSub subscriptions require RESP3 protocol, but RESP2 was configured".to_string(),
            ));
        }

        if let Some(pubsub) = &self.pubsub {
            pubsub.validate(self.mode.is_cluster())?;
        }

        if let Some(compression) = &self.compression {
            compression.validate()?;
        }

        if let Some(ca) = &self.tls.custom_ca {
            if ca.is_empty() {
                return Err(CitrineError::Configuration(
                    "Custom CA certificate bytes must not be empty".to_string(),
                ));
            }
            if self.tls.mode != TlsMode::Secure {
                return Err(CitrineError::Configuration(
                    "A custom CA certificate requires TlsMode::Secure".to_string(),
                ));
            }
        }

        if let Some(jitter) = self.reconnect_strategy.jitter_percent {
            if jitter > 100 {
                return Err(CitrineError::Configuration(format!(
                    "jitter_percent must be within 0..=100, got {jitter}"
                )));
            }
        }

        if self.effective_inflight_limit() == 0 {
            return Err(CitrineError::Configuration(
                "inflight_limit must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }
}
