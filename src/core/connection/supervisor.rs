// src/core/connection/supervisor.rs

//! Per-connection lifecycle supervision: establish, watch, back off, retry.
//!
//! Retries never stop; the backoff delay simply freezes once the attempt
//! counter passes the configured cap. IAM credentials regenerate their token
//! before every attempt, so a reconnect always authenticates with a fresh
//! token.

use super::stream::connect_stream;
use super::{Connection, HandshakeContext};
use crate::config::{
    BackoffStrategy, Credentials, NodeAddress, ProtocolVersion, TlsSettings,
};
use crate::core::CitrineError;
use crate::core::pubsub::{PubSubState, SubscriptionScope};
use crate::core::routing::ConnectionRole;
use crate::core::stats::Statistics;
use crate::core::telemetry::Telemetry;
use arc_swap::ArcSwapOption;
use parking_lot::{Mutex, RwLock};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// The observable lifecycle of one supervised connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnectionPhase {
    Connecting,
    Handshaking,
    Ready,
    Draining,
    Closed,
}

/// Lifecycle notifications consumed by the client's background task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ConnectionEvent {
    Ready(NodeAddress),
    Lost(NodeAddress),
}

/// The shared recipe for building connections of one client.
pub(crate) struct ConnectionSpec {
    pub tls: TlsSettings,
    pub protocol: ProtocolVersion,
    pub client_name: Option<String>,
    /// Nonzero only for standalone clients.
    pub database_id: u32,
    pub connection_timeout: Duration,
    pub backoff: BackoffStrategy,
    pub credentials: Option<Credentials>,
    /// A rotated password or cached IAM token, preferred over the static
    /// credential on every (re)connect.
    pub current_password: RwLock<Option<String>>,
    pub pubsub: Arc<PubSubState>,
    pub stats: Arc<Statistics>,
    pub telemetry: Arc<Telemetry>,
    pub write_queue_depth: usize,
}

impl ConnectionSpec {
    fn effective_password(&self) -> Option<String> {
        if let Some(p) = self.current_password.read().clone() {
            return Some(p);
        }
        match &self.credentials {
            Some(Credentials::Password { password, .. }) => Some(password.clone()),
            _ => None,
        }
    }

    fn username(&self) -> Option<String> {
        self.credentials.as_ref().map(|c| c.username().to_string())
    }

    /// Regenerates and caches the IAM token. A no-op for password auth.
    pub(crate) async fn refresh_iam_token(&self) -> Result<(), CitrineError> {
        let Some(Credentials::Iam { username, config }) = &self.credentials else {
            return Ok(());
        };
        let token = config.provider.generate_token(username, config).await?;
        *self.current_password.write() = Some(token);
        Ok(())
    }

    /// Replaces the cached password used by future (re)connects.
    pub(crate) fn set_password(&self, password: Option<String>) {
        *self.current_password.write() = password;
    }

    fn handshake_context(&self, role: ConnectionRole, scope: &SubscriptionScope) -> HandshakeContext {
        HandshakeContext {
            protocol_version: self.protocol.as_u8(),
            username: self.username(),
            password: self.effective_password(),
            client_name: self.client_name.clone(),
            database_id: self.database_id,
            readonly: role == ConnectionRole::Replica,
            resubscribe: self.pubsub.resubscribe_commands(scope),
        }
    }
}

/// One supervised connection slot: the live handle plus the task that keeps
/// replacing it whenever it dies.
pub(crate) struct ManagedConnection {
    addr: NodeAddress,
    role: ConnectionRole,
    phase: watch::Sender<ConnectionPhase>,
    current: ArcSwapOption<Connection>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ManagedConnection {
    pub(crate) fn spawn(
        addr: NodeAddress,
        spec: Arc<ConnectionSpec>,
        role: ConnectionRole,
        scope: SubscriptionScope,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Arc<Self> {
        let (phase_tx, _) = watch::channel(ConnectionPhase::Connecting);
        let managed = Arc::new(Self {
            addr,
            role,
            phase: phase_tx,
            current: ArcSwapOption::const_empty(),
            task: Mutex::new(None),
        });
        let handle = tokio::spawn(supervise(Arc::clone(&managed), spec, scope, events));
        *managed.task.lock() = Some(handle);
        managed
    }

    pub(crate) fn addr(&self) -> &NodeAddress {
        &self.addr
    }

    pub(crate) fn role(&self) -> ConnectionRole {
        self.role
    }

    pub(crate) fn phase(&self) -> ConnectionPhase {
        *self.phase.borrow()
    }

    /// The live connection, if this slot is currently Ready.
    pub(crate) fn try_current(&self) -> Option<Connection> {
        self.current
            .load_full()
            .map(|c| (*c).clone())
            .filter(|c| !c.is_closed())
    }

    /// Waits until the slot is Ready and returns the connection, or fails
    /// with `Timeout` at the deadline / `ClientClosed` once shut down.
    pub(crate) async fn ready(&self, deadline: Instant) -> Result<Connection, CitrineError> {
        let mut phase_rx = self.phase.subscribe();
        loop {
            match *phase_rx.borrow_and_update() {
                ConnectionPhase::Ready => {
                    if let Some(conn) = self.try_current() {
                        return Ok(conn);
                    }
                }
                ConnectionPhase::Closed => return Err(CitrineError::ClientClosed),
                _ => {}
            }
            match tokio::time::timeout_at(deadline, phase_rx.changed()).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => return Err(CitrineError::ClientClosed),
                Err(_) => return Err(CitrineError::Timeout),
            }
        }
    }

    /// Stops supervision and drops the live connection.
    pub(crate) fn shutdown(&self) {
        let _ = self.phase.send(ConnectionPhase::Closed);
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        self.current.store(None);
    }

    /// Marks the slot as draining during a graceful close.
    pub(crate) fn drain(&self) {
        let _ = self.phase.send(ConnectionPhase::Draining);
    }
}

impl Drop for ManagedConnection {
    fn drop(&mut self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

/// The supervision loop: connect, hand out, wait for death, back off, repeat.
async fn supervise(
    managed: Arc<ManagedConnection>,
    spec: Arc<ConnectionSpec>,
    scope: SubscriptionScope,
    events: mpsc::UnboundedSender<ConnectionEvent>,
) {
    let mut rng = SmallRng::from_entropy();
    let mut attempt: u32 = 0;
    let mut ever_connected = false;

    loop {
        let _ = managed.phase.send(ConnectionPhase::Connecting);

        if let Err(e) = spec.refresh_iam_token().await {
            warn!(addr = %managed.addr, "IAM token generation failed: {e}");
            attempt = backoff_sleep(&spec.backoff, attempt, &mut rng).await;
            continue;
        }

        let socket = match connect_stream(&managed.addr, &spec.tls, spec.connection_timeout).await
        {
            Ok(socket) => socket,
            Err(e) => {
                warn!(addr = %managed.addr, "connect failed: {e}");
                attempt = backoff_sleep(&spec.backoff, attempt, &mut rng).await;
                continue;
            }
        };

        let _ = managed.phase.send(ConnectionPhase::Handshaking);
        let ctx = spec.handshake_context(managed.role, &scope);
        let (failure_tx, mut failure_rx) = mpsc::channel(2);
        let connection =
            match Connection::start(socket, &managed.addr, &spec, ctx, failure_tx).await {
                Ok(connection) => connection,
                Err(e) => {
                    warn!(addr = %managed.addr, "handshake failed: {e}");
                    attempt = backoff_sleep(&spec.backoff, attempt, &mut rng).await;
                    continue;
                }
            };

        managed.current.store(Some(Arc::new(connection)));
        let _ = managed.phase.send(ConnectionPhase::Ready);
        if ever_connected {
            spec.stats.record_reconnect();
            spec.telemetry.record_reconnect(&managed.addr.to_string());
            info!(addr = %managed.addr, "connection re-established");
        } else {
            debug!(addr = %managed.addr, "connection established");
        }
        ever_connected = true;
        attempt = 0;
        let _ = events.send(ConnectionEvent::Ready(managed.addr.clone()));

        // Park until the read or write task reports a terminal error.
        let cause = failure_rx.recv().await;
        managed.current.store(None);
        spec.pubsub.reset_acknowledged(&scope);
        let _ = events.send(ConnectionEvent::Lost(managed.addr.clone()));
        debug!(
            addr = %managed.addr,
            "connection lost: {}",
            cause.map(|e| e.to_string()).unwrap_or_else(|| "tasks exited".to_string())
        );

        attempt = backoff_sleep(&spec.backoff, attempt, &mut rng).await;
    }
}

/// Sleeps the computed backoff delay and returns the advanced attempt count.
async fn backoff_sleep(strategy: &BackoffStrategy, attempt: u32, rng: &mut SmallRng) -> u32 {
    let delay = compute_backoff_delay(strategy, attempt, rng);
    debug!(attempt, ?delay, "backing off before reconnect");
    tokio::time::sleep(delay).await;
    attempt.saturating_add(1)
}

/// `rand(0, factor * exponent_base^attempt) * (1 ± jitter)`, with the
/// exponent frozen once `attempt` reaches the configured retry cap.
pub fn compute_backoff_delay(
    strategy: &BackoffStrategy,
    attempt: u32,
    rng: &mut impl Rng,
) -> Duration {
    let exponent = attempt.min(strategy.num_of_retries);
    let ceiling = (strategy.factor as u64)
        .saturating_mul((strategy.exponent_base as u64).saturating_pow(exponent));
    let base_ms = rng.gen_range(0..=ceiling.max(1));
    let jitter = strategy.effective_jitter_percent() as i64;
    let adjustment = if jitter > 0 {
        base_ms as i64 * rng.gen_range(-jitter..=jitter) / 100
    } else {
        0
    };
    Duration::from_millis((base_ms as i64 + adjustment).max(0) as u64)
}
