// src/client.rs

//! The public client: construction, the command surface, batches, Pub/Sub,
//! cluster scan, and lifecycle management.

use crate::config::{ClientConfig, ClientMode, Credentials, NodeAddress, ProtocolVersion};
use crate::core::CitrineError;
use crate::core::batch::{Batch, BatchOptions, execute_batch};
use crate::core::cluster::scan::{ClusterScanCursor, ScanOptions, ScanRegistry, scan};
use crate::core::cluster::slot::get_slot;
use crate::core::cluster::topology::TopologyManager;
use crate::core::commands::Cmd;
use crate::core::compression::Compressor;
use crate::core::connection::{
    Connection, ConnectionEvent, ConnectionPool, ConnectionSpec, ManagedConnection, ScopeFactory,
};
use crate::core::dispatch::{DispatchTarget, Dispatcher};
use crate::core::protocol::Value;
use crate::core::pubsub::{
    PubSubChannelMode, PubSubMsg, PubSubState, SubscriptionScope, SubscriptionStatus,
};
use crate::core::routing::{ConnectionRole, RouteIntent, Router};
use crate::core::stats::{Statistics, StatisticsSnapshot};
use crate::core::telemetry::{Telemetry, TelemetryHook};
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Poll interval while waiting for subscription acknowledgements.
const SUBSCRIBE_POLL_INTERVAL: Duration = Duration::from_millis(10);
/// Poll interval while draining inflight requests during close.
const CLOSE_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// An async Valkey/Redis client, standalone or cluster.
///
/// Cheap to clone; all clones share the same connections, topology view,
/// and counters.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    dispatcher: Dispatcher,
    pool: Arc<ConnectionPool>,
    topology: Option<Arc<TopologyManager>>,
    /// Standalone primary, when not in cluster mode.
    primary: Option<NodeAddress>,
    /// The originally configured seed addresses.
    seeds: Vec<NodeAddress>,
    /// Dedicated control connection for Exact/Pattern subscriptions in
    /// cluster mode, allocated on first use.
    control: Mutex<Option<Arc<ManagedConnection>>>,
    spec: Arc<ConnectionSpec>,
    events_tx: mpsc::UnboundedSender<ConnectionEvent>,
    pubsub: Arc<PubSubState>,
    stats: Arc<Statistics>,
    telemetry: Arc<Telemetry>,
    scan_registry: Arc<ScanRegistry>,
    inflight: Arc<Semaphore>,
    inflight_limit: usize,
    request_timeout: Duration,
    connection_timeout: Duration,
    protocol: ProtocolVersion,
    closed: Arc<AtomicBool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.pool.shutdown_all();
        if let Some(control) = self.control.lock().take() {
            control.shutdown();
        }
    }
}

impl Client {
    /// Validates the configuration, builds the runtime, and (unless
    /// `lazy_connect` is set) performs the first handshake.
    pub async fn connect(config: ClientConfig) -> Result<Self, CitrineError> {
        config.validate()?;

        let stats = Arc::new(Statistics::new());
        let telemetry = Arc::new(Telemetry::new());
        let pubsub = PubSubState::new(config.pubsub.as_ref());
        let closed = Arc::new(AtomicBool::new(false));

        let compressor = match &config.compression {
            Some(compression) => Some(Compressor::new(compression.clone(), Arc::clone(&stats))?),
            None => None,
        };

        let (database_id, topology) = match &config.mode {
            ClientMode::Standalone { database_id } => (*database_id, None),
            ClientMode::Cluster {
                refresh_from_initial_nodes,
                ..
            } => {
                let topology = Arc::new(TopologyManager::new(
                    config.addresses.clone(),
                    *refresh_from_initial_nodes,
                    config.read_from.requires_client_az(),
                    config.effective_connection_timeout(),
                ));
                (0, Some(topology))
            }
        };

        let spec = Arc::new(ConnectionSpec {
            tls: config.tls.clone(),
            protocol: config.protocol,
            client_name: config.client_name.clone(),
            database_id,
            connection_timeout: config.effective_connection_timeout(),
            backoff: config.reconnect_strategy,
            credentials: config.credentials.clone(),
            current_password: RwLock::new(None),
            pubsub: Arc::clone(&pubsub),
            stats: Arc::clone(&stats),
            telemetry: Arc::clone(&telemetry),
            write_queue_depth: config.effective_inflight_limit(),
        });

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let scope_factory = build_scope_factory(topology.as_ref());
        let pool = Arc::new(ConnectionPool::new(
            Arc::clone(&spec),
            events_tx.clone(),
            scope_factory,
        ));

        let primary = match &config.mode {
            ClientMode::Standalone { .. } => Some(config.addresses[0].clone()),
            ClientMode::Cluster { .. } => None,
        };

        // Exact/Pattern subscriptions in cluster mode ride a dedicated
        // control connection, pinned to the first seed. Allocated up front
        // when subscriptions were declared in the configuration, lazily on
        // the first dynamic subscribe otherwise.
        let control = match (&topology, pubsub.has_subscriptions()) {
            (Some(_), true) => Some(ManagedConnection::spawn(
                config.addresses[0].clone(),
                Arc::clone(&spec),
                ConnectionRole::Primary,
                SubscriptionScope::Control,
                events_tx.clone(),
            )),
            _ => None,
        };

        let inflight_limit = config.effective_inflight_limit();
        let inflight = Arc::new(Semaphore::new(inflight_limit));
        let dispatcher = Dispatcher {
            target: match &topology {
                Some(topology) => DispatchTarget::Cluster(Arc::clone(topology)),
                None => DispatchTarget::Standalone(
                    primary.clone().expect("standalone primary address"),
                ),
            },
            pool: Arc::clone(&pool),
            router: Router {
                read_from: config.read_from,
                client_az: config.client_az.clone(),
            },
            inflight: Arc::clone(&inflight),
            request_timeout: config.effective_request_timeout(),
            compressor,
            stats: Arc::clone(&stats),
            telemetry: Arc::clone(&telemetry),
            closed: Arc::clone(&closed),
        };

        if !config.lazy_connect {
            let deadline = Instant::now() + config.effective_connection_timeout();
            match (&topology, &primary) {
                (Some(topology), _) => topology.refresh(&pool).await?,
                (None, Some(addr)) => {
                    pool.ready(addr, ConnectionRole::Primary, deadline).await?;
                }
                (None, None) => unreachable!("standalone client without a primary"),
            }
        }

        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(background_loop(
            topology.clone(),
            Arc::clone(&pool),
            Arc::clone(&pubsub),
            events_rx,
            periodic_interval(&config),
            Arc::clone(&closed),
        )));
        if matches!(&config.credentials, Some(Credentials::Iam { .. })) {
            tasks.push(tokio::spawn(iam_refresh_loop(
                Arc::clone(&spec),
                Arc::clone(&closed),
            )));
        }

        Ok(Self {
            inner: Arc::new(ClientInner {
                dispatcher,
                pool,
                topology,
                primary,
                seeds: config.addresses.clone(),
                control: Mutex::new(control),
                spec,
                events_tx,
                pubsub,
                stats,
                telemetry,
                scan_registry: ScanRegistry::new(),
                inflight,
                inflight_limit,
                request_timeout: config.effective_request_timeout(),
                connection_timeout: config.effective_connection_timeout(),
                protocol: config.protocol,
                closed,
                tasks: Mutex::new(tasks),
            }),
        })
    }

    // --- Command surface -------------------------------------------------

    /// Executes an arbitrary command with an explicit routing intent,
    /// applying the compression read policy to bulk replies.
    pub async fn custom_command(
        &self,
        args: Vec<Bytes>,
        route: RouteIntent,
    ) -> Result<Value, CitrineError> {
        let cmd = Cmd::from_args(args);
        if cmd.is_empty() {
            return Err(CitrineError::Configuration(
                "custom_command requires at least a command name".to_string(),
            ));
        }
        self.inner.dispatcher.execute_custom(cmd, route).await
    }

    /// Executes a prepared command through the request pipeline.
    pub async fn execute(&self, cmd: Cmd, route: RouteIntent) -> Result<Value, CitrineError> {
        self.inner.dispatcher.execute(cmd, route).await
    }

    pub async fn get(&self, key: impl Into<Bytes>) -> Result<Option<Bytes>, CitrineError> {
        let reply = self
            .execute(Cmd::new("GET").arg(key), RouteIntent::Auto)
            .await?;
        match reply {
            Value::Null => Ok(None),
            Value::Bytes(b) => Ok(Some(b)),
            other => Err(unexpected_reply("GET", &other)),
        }
    }

    pub async fn set(
        &self,
        key: impl Into<Bytes>,
        value: impl Into<Bytes>,
    ) -> Result<(), CitrineError> {
        let reply = self
            .execute(Cmd::new("SET").arg(key).arg(value), RouteIntent::Auto)
            .await?;
        if reply.is_ok() {
            Ok(())
        } else {
            Err(unexpected_reply("SET", &reply))
        }
    }

    pub async fn mget(&self, keys: Vec<Bytes>) -> Result<Vec<Option<Bytes>>, CitrineError> {
        let mut cmd = Cmd::new("MGET");
        for key in keys {
            cmd = cmd.arg(key);
        }
        let reply = self.execute(cmd, RouteIntent::Auto).await?;
        let values = match reply {
            Value::Array(values) => values,
            other => return Err(unexpected_reply("MGET", &other)),
        };
        values
            .into_iter()
            .map(|v| match v {
                Value::Null => Ok(None),
                Value::Bytes(b) => Ok(Some(b)),
                other => Err(unexpected_reply("MGET", &other)),
            })
            .collect()
    }

    pub async fn mset(&self, pairs: Vec<(Bytes, Bytes)>) -> Result<(), CitrineError> {
        let mut cmd = Cmd::new("MSET");
        for (key, value) in pairs {
            cmd = cmd.arg(key).arg(value);
        }
        let reply = self.execute(cmd, RouteIntent::Auto).await?;
        if reply.is_ok() {
            Ok(())
        } else {
            Err(unexpected_reply("MSET", &reply))
        }
    }

    pub async fn del(&self, keys: Vec<Bytes>) -> Result<i64, CitrineError> {
        let mut cmd = Cmd::new("DEL");
        for key in keys {
            cmd = cmd.arg(key);
        }
        let reply = self.execute(cmd, RouteIntent::Auto).await?;
        reply
            .as_int()
            .ok_or_else(|| unexpected_reply("DEL", &reply))
    }

    pub async fn ping(&self) -> Result<String, CitrineError> {
        let reply = self.execute(Cmd::new("PING"), RouteIntent::Auto).await?;
        match reply {
            Value::Simple(s) => Ok(s),
            Value::Bytes(b) => Ok(String::from_utf8_lossy(&b).to_string()),
            other => Err(unexpected_reply("PING", &other)),
        }
    }

    /// Runs a batch: an atomic transaction or a non-atomic pipeline.
    pub async fn exec_batch(
        &self,
        batch: &Batch,
        options: &BatchOptions,
    ) -> Result<Vec<Value>, CitrineError> {
        execute_batch(&self.inner.dispatcher, batch, options).await
    }

    /// Advances a cluster-wide scan by one step.
    pub async fn scan(
        &self,
        cursor: ClusterScanCursor,
        options: &ScanOptions,
    ) -> Result<(ClusterScanCursor, Vec<Bytes>), CitrineError> {
        self.inner.dispatcher.ensure_open()?;
        scan(
            &self.inner.dispatcher,
            &self.inner.scan_registry,
            cursor,
            options,
        )
        .await
    }

    // --- Pub/Sub ---------------------------------------------------------

    /// Subscribes and blocks until the server acknowledges every channel or
    /// the timeout expires.
    pub async fn subscribe(
        &self,
        mode: PubSubChannelMode,
        channels: Vec<Bytes>,
        timeout: Duration,
    ) -> Result<(), CitrineError> {
        self.subscribe_lazy(mode, channels.clone()).await?;
        self.await_acknowledged(mode, &channels, true, timeout).await
    }

    /// Subscribes without waiting for the server acknowledgement.
    pub async fn subscribe_lazy(
        &self,
        mode: PubSubChannelMode,
        channels: Vec<Bytes>,
    ) -> Result<(), CitrineError> {
        self.inner.dispatcher.ensure_open()?;
        self.check_pubsub_supported(mode)?;
        if channels.is_empty() {
            return Err(CitrineError::Configuration(
                "subscribe requires at least one channel".to_string(),
            ));
        }

        self.inner.pubsub.intend_subscribe(mode, &channels);
        match mode {
            PubSubChannelMode::Sharded => {
                // Sharded channels attach to the shard owning their slot.
                for channel in &channels {
                    let (addr, conn) = self.shard_connection(channel).await?;
                    conn.submit_no_reply(&[Cmd::new("SSUBSCRIBE").arg(channel.clone())])
                        .await?;
                    self.inner
                        .pubsub
                        .set_sharded_attachment(channel.clone(), addr);
                }
            }
            _ => {
                let conn = self.control_connection().await?;
                let mut cmd = Cmd::new(mode.subscribe_command());
                for channel in &channels {
                    cmd = cmd.arg(channel.clone());
                }
                conn.submit_no_reply(&[cmd]).await?;
            }
        }
        Ok(())
    }

    /// Unsubscribes and blocks until acknowledged. An empty channel list
    /// removes every subscription of that mode.
    pub async fn unsubscribe(
        &self,
        mode: PubSubChannelMode,
        channels: Vec<Bytes>,
        timeout: Duration,
    ) -> Result<(), CitrineError> {
        self.unsubscribe_lazy(mode, channels.clone()).await?;
        self.await_acknowledged(mode, &channels, false, timeout)
            .await
    }

    pub async fn unsubscribe_lazy(
        &self,
        mode: PubSubChannelMode,
        channels: Vec<Bytes>,
    ) -> Result<(), CitrineError> {
        self.inner.dispatcher.ensure_open()?;
        self.check_pubsub_supported(mode)?;

        self.inner.pubsub.intend_unsubscribe(mode, &channels);
        match mode {
            PubSubChannelMode::Sharded => {
                for channel in &channels {
                    let addr = self
                        .inner
                        .pubsub
                        .sharded_attachment(channel)
                        .or_else(|| self.shard_owner(channel));
                    if let Some(addr) = addr {
                        let deadline = Instant::now() + self.inner.connection_timeout;
                        if let Ok(conn) = self
                            .inner
                            .pool
                            .ready(&addr, ConnectionRole::Primary, deadline)
                            .await
                        {
                            conn.submit_no_reply(&[
                                Cmd::new("SUNSUBSCRIBE").arg(channel.clone())
                            ])
                            .await?;
                        }
                    }
                }
            }
            _ => {
                let conn = self.control_connection().await?;
                let mut cmd = Cmd::new(mode.unsubscribe_command());
                for channel in &channels {
                    cmd = cmd.arg(channel.clone());
                }
                conn.submit_no_reply(&[cmd]).await?;
            }
        }
        Ok(())
    }

    /// Blocks until a message arrives. Pull mode only (no callback).
    pub async fn get_pubsub_message(&self) -> Result<PubSubMsg, CitrineError> {
        self.inner.dispatcher.ensure_open()?;
        self.inner.pubsub.next_message().await
    }

    /// Returns an already-queued message, if any. Pull mode only.
    pub fn try_get_pubsub_message(&self) -> Result<Option<PubSubMsg>, CitrineError> {
        self.inner.dispatcher.ensure_open()?;
        self.inner.pubsub.try_next_message()
    }

    /// The `{intended, acknowledged}` subscription view, for callers that
    /// want to wait out reconciliation after a reconnect.
    pub fn subscription_status(&self) -> SubscriptionStatus {
        self.inner.pubsub.snapshot()
    }

    // --- Introspection & lifecycle ---------------------------------------

    pub fn get_statistics(&self) -> StatisticsSnapshot {
        self.inner.stats.snapshot()
    }

    /// Installs a telemetry exporter hook.
    pub fn install_telemetry_hook(&self, hook: Arc<dyn TelemetryHook>) {
        self.inner.telemetry.install(hook);
    }

    /// Tunes the percentage of requests that emit telemetry spans.
    pub fn set_telemetry_sample_percentage(&self, percentage: u32) -> Result<(), CitrineError> {
        self.inner.telemetry.set_sample_percentage(percentage)
    }

    /// Replaces the password future (re)connects authenticate with. With
    /// `immediate_auth`, also re-authenticates every live connection now.
    pub async fn update_connection_password(
        &self,
        password: Option<String>,
        immediate_auth: bool,
    ) -> Result<(), CitrineError> {
        self.inner.dispatcher.ensure_open()?;
        self.inner.pool.spec().set_password(password.clone());

        if !immediate_auth {
            return Ok(());
        }
        let Some(password) = password else {
            return Err(CitrineError::Configuration(
                "immediate_auth requires a password".to_string(),
            ));
        };

        let username = self
            .inner
            .pool
            .spec()
            .credentials
            .as_ref()
            .map(|c| c.username().to_string());
        let mut auth = Cmd::new("AUTH");
        if let Some(username) = username {
            auth = auth.arg(username);
        }
        auth = auth.arg(password);

        let deadline = Instant::now() + self.inner.request_timeout;
        let mut connections = self.inner.pool.current_connections();
        if let Some(control) = self.inner.control.lock().as_ref() {
            connections.extend(control.try_current());
        }
        for conn in connections {
            let receiver = conn.request(&auth).await?;
            let frame = tokio::time::timeout_at(deadline, receiver)
                .await
                .map_err(|_| CitrineError::Timeout)?
                .map_err(|_| {
                    CitrineError::Connection("Connection dropped during AUTH".to_string())
                })??;
            Value::try_from(frame)?;
        }
        Ok(())
    }

    /// Drains pending requests (bounded by `grace`), then tears down
    /// connections and background tasks.
    pub async fn close(&self, grace: Option<Duration>) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        // New work now fails with ClientClosed; waiters are woken.
        self.inner.inflight.close();
        self.inner.pool.drain_all();

        if let Some(grace) = grace {
            let deadline = Instant::now() + grace;
            while self.inner.inflight.available_permits() < self.inner.inflight_limit
                && Instant::now() < deadline
            {
                tokio::time::sleep(CLOSE_POLL_INTERVAL).await;
            }
        }

        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }
        self.inner.pool.shutdown_all();
        if let Some(control) = self.inner.control.lock().take() {
            control.shutdown();
        }
        debug!("client closed");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    // --- Internals -------------------------------------------------------

    fn check_pubsub_supported(&self, mode: PubSubChannelMode) -> Result<(), CitrineError> {
        if self.inner.protocol != ProtocolVersion::Resp3 {
            return Err(CitrineError::Configuration(
                "PubSub requires the RESP3 protocol".to_string(),
            ));
        }
        if mode == PubSubChannelMode::Sharded && self.inner.topology.is_none() {
            return Err(CitrineError::Configuration(
                "Sharded PubSub requires cluster mode".to_string(),
            ));
        }
        Ok(())
    }

    /// The connection carrying Exact/Pattern subscriptions.
    async fn control_connection(&self) -> Result<Connection, CitrineError> {
        let deadline = Instant::now() + self.inner.connection_timeout;

        // Standalone: subscriptions ride the single primary connection.
        if let Some(addr) = &self.inner.primary {
            return self
                .inner
                .pool
                .ready(addr, ConnectionRole::Primary, deadline)
                .await;
        }

        let control = {
            let mut slot = self.inner.control.lock();
            slot.get_or_insert_with(|| {
                ManagedConnection::spawn(
                    self.inner.seeds[0].clone(),
                    Arc::clone(&self.inner.spec),
                    ConnectionRole::Primary,
                    SubscriptionScope::Control,
                    self.inner.events_tx.clone(),
                )
            })
            .clone()
        };
        control.ready(deadline).await
    }

    fn shard_owner(&self, channel: &Bytes) -> Option<NodeAddress> {
        let topology = self.inner.topology.as_ref()?;
        topology
            .current()
            .primary_for_slot(get_slot(channel))
            .cloned()
    }

    async fn shard_connection(
        &self,
        channel: &Bytes,
    ) -> Result<(NodeAddress, Connection), CitrineError> {
        let topology = self
            .inner
            .topology
            .as_ref()
            .expect("sharded pubsub implies cluster mode");
        if topology.current().shards().is_empty() {
            topology.refresh(&self.inner.pool).await?;
        }
        let slot = get_slot(channel);
        let addr = topology
            .current()
            .primary_for_slot(slot)
            .cloned()
            .ok_or(CitrineError::SlotNotCovered(slot))?;
        let deadline = Instant::now() + self.inner.connection_timeout;
        let conn = self
            .inner
            .pool
            .ready(&addr, ConnectionRole::Primary, deadline)
            .await?;
        Ok((addr, conn))
    }

    /// Polls the registry until the wanted acknowledgement state holds.
    async fn await_acknowledged(
        &self,
        mode: PubSubChannelMode,
        channels: &[Bytes],
        subscribed: bool,
        timeout: Duration,
    ) -> Result<(), CitrineError> {
        let deadline = Instant::now() + timeout;
        loop {
            let status = self.inner.pubsub.snapshot();
            let acknowledged = status.acknowledged.get(&mode);
            let done = if subscribed {
                channels
                    .iter()
                    .all(|ch| acknowledged.is_some_and(|set| set.contains(ch)))
            } else if channels.is_empty() {
                acknowledged.is_none_or(|set| set.is_empty())
            } else {
                channels
                    .iter()
                    .all(|ch| acknowledged.is_none_or(|set| !set.contains(ch)))
            };
            if done {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(CitrineError::Timeout);
            }
            tokio::time::sleep(SUBSCRIBE_POLL_INTERVAL).await;
        }
    }
}

fn unexpected_reply(command: &str, reply: &Value) -> CitrineError {
    CitrineError::Protocol(format!("Unexpected reply to {command}: {reply:?}"))
}

fn periodic_interval(config: &ClientConfig) -> Option<Duration> {
    match &config.mode {
        ClientMode::Cluster {
            periodic_checks, ..
        } => periodic_checks.interval(),
        ClientMode::Standalone { .. } => None,
    }
}

fn build_scope_factory(topology: Option<&Arc<TopologyManager>>) -> ScopeFactory {
    match topology {
        None => Arc::new(|_| SubscriptionScope::All),
        Some(topology) => {
            let topology = Arc::clone(topology);
            Arc::new(move |addr: &NodeAddress| {
                let topology = Arc::clone(&topology);
                let addr = addr.clone();
                SubscriptionScope::Shard(Arc::new(move |channel: &Bytes| {
                    topology
                        .current()
                        .primary_for_slot(get_slot(channel))
                        .is_some_and(|owner| *owner == addr)
                }))
            })
        }
    }
}

/// The client's background task: consumes connection events, serves refresh
/// requests, runs periodic topology checks, and migrates sharded
/// subscriptions after the slot map changes.
async fn background_loop(
    topology: Option<Arc<TopologyManager>>,
    pool: Arc<ConnectionPool>,
    pubsub: Arc<PubSubState>,
    mut events_rx: mpsc::UnboundedReceiver<ConnectionEvent>,
    periodic: Option<Duration>,
    closed: Arc<AtomicBool>,
) {
    let mut ticker = periodic.map(|period| {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        interval
    });

    loop {
        if closed.load(Ordering::Acquire) {
            return;
        }
        tokio::select! {
            event = events_rx.recv() => {
                match event {
                    Some(ConnectionEvent::Lost(addr)) => {
                        debug!(%addr, "connection lost");
                        if let Some(topology) = &topology {
                            topology.schedule_refresh();
                        }
                    }
                    Some(ConnectionEvent::Ready(addr)) => {
                        debug!(%addr, "connection ready");
                    }
                    None => return,
                }
            }
            _ = refresh_signal(&topology) => {
                run_refresh(&topology, &pool, &pubsub).await;
            }
            _ = periodic_tick(&mut ticker) => {
                run_refresh(&topology, &pool, &pubsub).await;
            }
        }
    }
}

async fn refresh_signal(topology: &Option<Arc<TopologyManager>>) {
    match topology {
        Some(topology) => topology.refresh_signal().await,
        None => futures::future::pending().await,
    }
}

async fn periodic_tick(ticker: &mut Option<tokio::time::Interval>) {
    match ticker {
        Some(interval) => {
            interval.tick().await;
        }
        None => futures::future::pending().await,
    }
}

async fn run_refresh(
    topology: &Option<Arc<TopologyManager>>,
    pool: &Arc<ConnectionPool>,
    pubsub: &Arc<PubSubState>,
) {
    let Some(topology) = topology else { return };
    if let Err(e) = topology.refresh(pool).await {
        warn!("topology refresh failed: {e}");
        return;
    }
    migrate_sharded_subscriptions(topology, pool, pubsub).await;
}

/// Moves sharded subscriptions whose owning shard changed in the new map.
async fn migrate_sharded_subscriptions(
    topology: &Arc<TopologyManager>,
    pool: &Arc<ConnectionPool>,
    pubsub: &Arc<PubSubState>,
) {
    let map = topology.current();
    for channel in pubsub.sharded_channels() {
        let Some(owner) = map.primary_for_slot(get_slot(&channel)).cloned() else {
            continue;
        };
        let attached = pubsub.sharded_attachment(&channel);
        if attached.as_ref() == Some(&owner) {
            continue;
        }

        debug!(channel = ?channel, %owner, "migrating sharded subscription");
        let deadline = Instant::now() + Duration::from_secs(2);
        if let Ok(conn) = pool.ready(&owner, ConnectionRole::Primary, deadline).await {
            if conn
                .submit_no_reply(&[Cmd::new("SSUBSCRIBE").arg(channel.clone())])
                .await
                .is_ok()
            {
                // Best-effort detach from the previous owner.
                if let Some(previous) = attached {
                    if let Ok(old_conn) = pool
                        .ready(&previous, ConnectionRole::Primary, deadline)
                        .await
                    {
                        let _ = old_conn
                            .submit_no_reply(&[Cmd::new("SUNSUBSCRIBE").arg(channel.clone())])
                            .await;
                    }
                }
                pubsub.set_sharded_attachment(channel, owner);
            }
        }
    }
}

/// Regenerates the IAM token on the configured interval so reconnects always
/// have a fresh credential at hand.
async fn iam_refresh_loop(spec: Arc<ConnectionSpec>, closed: Arc<AtomicBool>) {
    let Some(Credentials::Iam { config, .. }) = &spec.credentials else {
        return;
    };
    let mut interval = tokio::time::interval(config.refresh_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick fires immediately; skip it, the connect path already
    // generated a token.
    interval.tick().await;
    loop {
        interval.tick().await;
        if closed.load(Ordering::Acquire) {
            return;
        }
        if let Err(e) = spec.refresh_iam_token().await {
            warn!("periodic IAM token refresh failed: {e}");
        }
    }
}
