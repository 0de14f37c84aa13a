// src/core/dispatch.rs

//! The request pipeline: the single entry point that routes, sends, retries,
//! and completes every command with its deadline enforced.

use crate::config::NodeAddress;
use crate::core::CitrineError;
use crate::core::cluster::topology::TopologyManager;
use crate::core::commands::{Cmd, MultiSlotKind};
use crate::core::compression::Compressor;
use crate::core::connection::ConnectionPool;
use crate::core::errors::{ServerError, ServerErrorKind};
use crate::core::protocol::Value;
use crate::core::routing::{ConnectionRole, ResolvedRoute, RouteIntent, Router, SlotGroup};
use crate::core::stats::Statistics;
use crate::core::telemetry::Telemetry;
use bytes::Bytes;
use futures::future::join_all;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::debug;

/// Bounds redirection/retry attempts per request to prevent live loops.
const MAX_RETRY_ATTEMPTS: usize = 8;
/// Pause before retrying TRYAGAIN/CLUSTERDOWN under the original deadline.
const TRANSIENT_RETRY_PAUSE: Duration = Duration::from_millis(20);

/// Where this client's commands land when no explicit route is given.
pub(crate) enum DispatchTarget {
    /// A single primary node.
    Standalone(NodeAddress),
    /// A slot map maintained by the topology manager.
    Cluster(Arc<TopologyManager>),
}

/// The per-client request pipeline.
pub(crate) struct Dispatcher {
    pub(crate) target: DispatchTarget,
    pub(crate) pool: Arc<ConnectionPool>,
    pub(crate) router: Router,
    /// Global cap on requests written but not yet answered.
    pub(crate) inflight: Arc<Semaphore>,
    pub(crate) request_timeout: Duration,
    pub(crate) compressor: Option<Compressor>,
    pub(crate) stats: Arc<Statistics>,
    pub(crate) telemetry: Arc<Telemetry>,
    pub(crate) closed: Arc<AtomicBool>,
}

impl Dispatcher {
    pub(crate) fn topology(&self) -> Option<&Arc<TopologyManager>> {
        match &self.target {
            DispatchTarget::Cluster(t) => Some(t),
            DispatchTarget::Standalone(_) => None,
        }
    }

    pub(crate) fn ensure_open(&self) -> Result<(), CitrineError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(CitrineError::ClientClosed);
        }
        Ok(())
    }

    /// Executes one command with the client's request timeout.
    pub(crate) async fn execute(
        &self,
        cmd: Cmd,
        intent: RouteIntent,
    ) -> Result<Value, CitrineError> {
        self.execute_with_deadline(cmd, intent, Instant::now() + self.request_timeout)
            .await
    }

    /// The full request lifecycle: compress, gate on the inflight cap,
    /// route, send, retry redirects, decompress, account.
    pub(crate) async fn execute_with_deadline(
        &self,
        mut cmd: Cmd,
        intent: RouteIntent,
        deadline: Instant,
    ) -> Result<Value, CitrineError> {
        self.ensure_open()?;
        self.stats.record_request();
        let span = self.telemetry.request_span(&cmd.name_uppercase());

        if let Some(compressor) = &self.compressor {
            compressor.apply_write_policy(&mut cmd)?;
        }

        let _permit = self.acquire_inflight(deadline).await?;
        let result = self.dispatch(&cmd, &intent, deadline).await;
        let result = match result {
            Ok(value) if cmd.is_compressible_read() => match &self.compressor {
                Some(compressor) => compressor.apply_read_policy(value),
                None => Ok(value),
            },
            other => other,
        };

        self.account(&result);
        if let Some(span) = span {
            span.finish(result.is_ok());
        }
        result
    }

    /// Executes a raw command, applying the compression read policy to any
    /// bulk payloads in the reply.
    pub(crate) async fn execute_custom(
        &self,
        cmd: Cmd,
        intent: RouteIntent,
    ) -> Result<Value, CitrineError> {
        self.ensure_open()?;
        self.stats.record_request();
        let span = self.telemetry.request_span(&cmd.name_uppercase());
        let deadline = Instant::now() + self.request_timeout;

        let _permit = self.acquire_inflight(deadline).await?;
        let result = self.dispatch(&cmd, &intent, deadline).await;
        let result = match (result, &self.compressor) {
            (Ok(value), Some(compressor)) => compressor.apply_read_policy(value),
            (other, _) => other,
        };

        self.account(&result);
        if let Some(span) = span {
            span.finish(result.is_ok());
        }
        result
    }

    pub(crate) async fn acquire_inflight(
        &self,
        deadline: Instant,
    ) -> Result<tokio::sync::OwnedSemaphorePermit, CitrineError> {
        match tokio::time::timeout_at(deadline, Arc::clone(&self.inflight).acquire_owned()).await {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_)) => Err(CitrineError::ClientClosed),
            Err(_) => Err(CitrineError::Timeout),
        }
    }

    pub(crate) fn account<T>(&self, result: &Result<T, CitrineError>) {
        match result {
            Ok(_) => {}
            Err(CitrineError::Timeout) => self.stats.record_timeout(),
            Err(_) => self.stats.record_error(),
        }
    }

    /// Routes and sends with redirection handling, bounded by the deadline
    /// and the per-request attempt counter.
    async fn dispatch(
        &self,
        cmd: &Cmd,
        intent: &RouteIntent,
        deadline: Instant,
    ) -> Result<Value, CitrineError> {
        let topology = match &self.target {
            DispatchTarget::Standalone(addr) => {
                return self
                    .send_with_retries(addr.clone(), ConnectionRole::Primary, cmd, deadline)
                    .await;
            }
            DispatchTarget::Cluster(topology) => topology,
        };

        // Redirect target for a pending ASK, consumed by exactly one attempt.
        let mut ask_target: Option<NodeAddress> = None;
        let mut asked_already = false;

        for _attempt in 0..MAX_RETRY_ATTEMPTS {
            let map = topology.current();
            if map.shards().is_empty() {
                // Lazy construction or a fully lost topology: discover now.
                topology.refresh(&self.pool).await?;
            }
            let map = topology.current();

            let outcome = if let Some(addr) = ask_target.take() {
                self.send_single(&addr, ConnectionRole::Primary, cmd, deadline, true)
                    .await
            } else {
                match self.router.resolve(cmd, intent, &map)? {
                    ResolvedRoute::Single { addr, role } => {
                        self.send_single(&addr, role, cmd, deadline, false).await
                    }
                    ResolvedRoute::Fanout(nodes) => {
                        return self.send_fanout(nodes, cmd, deadline).await;
                    }
                    ResolvedRoute::MultiSlot { kind, groups } => {
                        match self.send_multi_slot(kind, groups, cmd, deadline).await {
                            Err(CitrineError::Server(e)) if e.redirect().is_some() => {
                                // A shard moved mid-flight; refresh and replan.
                                self.note_redirect(topology, &e);
                                continue;
                            }
                            other => return other,
                        }
                    }
                }
            };

            match outcome {
                Err(CitrineError::Server(e)) => match &e.kind {
                    ServerErrorKind::Moved { .. } => {
                        self.note_redirect(topology, &e);
                        continue;
                    }
                    ServerErrorKind::Ask { addr, .. } => {
                        if asked_already {
                            return Err(CitrineError::Server(e.clone()));
                        }
                        let Some(target) = NodeAddress::parse(addr) else {
                            return Err(CitrineError::Server(e.clone()));
                        };
                        asked_already = true;
                        ask_target = Some(target);
                        continue;
                    }
                    _ if e.is_retriable() => {
                        debug!("retrying after transient server error: {e}");
                        if tokio::time::timeout_at(
                            deadline,
                            tokio::time::sleep(TRANSIENT_RETRY_PAUSE),
                        )
                        .await
                        .is_err()
                        {
                            return Err(CitrineError::Timeout);
                        }
                        continue;
                    }
                    _ => return Err(CitrineError::Server(e)),
                },
                Err(CitrineError::Connection(e)) => {
                    // The supervisor is already reconnecting; retry while the
                    // deadline allows.
                    debug!("retrying after connection failure: {e}");
                    if Instant::now() >= deadline {
                        return Err(CitrineError::Timeout);
                    }
                    continue;
                }
                other => return other,
            }
        }
        Err(CitrineError::Server(ServerError::parse(
            "CLUSTERDOWN Retry attempts exhausted following redirections",
        )))
    }

    /// Applies a redirect's optimistic slot move and asks for a refresh.
    fn note_redirect(&self, topology: &Arc<TopologyManager>, error: &ServerError) {
        if let ServerErrorKind::Moved { slot, addr } = &error.kind {
            if let Some(target) = NodeAddress::parse(addr) {
                topology.note_moved(*slot, target);
                return;
            }
        }
        topology.schedule_refresh();
    }

    /// Standalone send: no redirects, but transient connection failures are
    /// retried until the deadline expires.
    async fn send_with_retries(
        &self,
        addr: NodeAddress,
        role: ConnectionRole,
        cmd: &Cmd,
        deadline: Instant,
    ) -> Result<Value, CitrineError> {
        for _attempt in 0..MAX_RETRY_ATTEMPTS {
            match self.send_single(&addr, role, cmd, deadline, false).await {
                Err(CitrineError::Connection(e)) => {
                    debug!("retrying after connection failure: {e}");
                    if Instant::now() >= deadline {
                        return Err(CitrineError::Timeout);
                    }
                }
                other => return other,
            }
        }
        Err(CitrineError::Connection(
            "Retry attempts exhausted".to_string(),
        ))
    }

    /// Sends one command (optionally behind an ASKING preamble) on the
    /// target node and awaits its reply under the deadline.
    pub(crate) async fn send_single(
        &self,
        addr: &NodeAddress,
        role: ConnectionRole,
        cmd: &Cmd,
        deadline: Instant,
        asking: bool,
    ) -> Result<Value, CitrineError> {
        let conn = self.pool.ready(addr, role, deadline).await?;
        let mut receivers = if asking {
            conn.submit(&[Cmd::new("ASKING"), cmd.clone()]).await?
        } else {
            conn.submit(std::slice::from_ref(cmd)).await?
        };

        let reply = receivers.pop().expect("one receiver per command");
        // Drain the ASKING acknowledgement; its content is irrelevant.
        for preamble in receivers {
            let _ = tokio::time::timeout_at(deadline, preamble)
                .await
                .map_err(|_| CitrineError::Timeout)?;
        }

        let frame = tokio::time::timeout_at(deadline, reply)
            .await
            .map_err(|_| CitrineError::Timeout)?
            .map_err(|_| {
                CitrineError::Connection(format!("Connection to {addr} dropped the request"))
            })??;
        Value::try_from(frame)
    }

    /// Issues the command on every target node and aggregates the replies
    /// into an address-keyed map.
    async fn send_fanout(
        &self,
        nodes: Vec<(NodeAddress, ConnectionRole)>,
        cmd: &Cmd,
        deadline: Instant,
    ) -> Result<Value, CitrineError> {
        let sends = nodes.iter().map(|(addr, role)| {
            let addr = addr.clone();
            let role = *role;
            async move {
                let value = self.send_single(&addr, role, cmd, deadline, false).await;
                (addr, value)
            }
        });

        let mut entries = Vec::with_capacity(nodes.len());
        for (addr, value) in join_all(sends).await {
            let value = match value {
                Ok(value) => value,
                // Server-side errors stay in place per node.
                Err(CitrineError::Server(e)) => Value::ServerError(e),
                Err(other) => return Err(other),
            };
            entries.push((Value::Bytes(Bytes::from(addr.to_string())), value));
        }
        Ok(Value::Map(entries))
    }

    /// Runs a split multi-key command: per-slot subcommands in parallel,
    /// replies reassembled in the original key order.
    async fn send_multi_slot(
        &self,
        kind: MultiSlotKind,
        groups: Vec<SlotGroup>,
        cmd: &Cmd,
        deadline: Instant,
    ) -> Result<Value, CitrineError> {
        let total_keys = match kind {
            MultiSlotKind::KeyListArray | MultiSlotKind::KeyListSum => cmd.args().len() - 1,
            MultiSlotKind::KeyValueOk => (cmd.args().len() - 1) / 2,
        };

        let sends = groups.iter().map(|group| {
            self.send_single(&group.addr, group.role, &group.cmd, deadline, false)
        });
        let replies = join_all(sends).await;

        match kind {
            MultiSlotKind::KeyListArray => {
                let mut assembled = vec![Value::Null; total_keys];
                for (group, reply) in groups.iter().zip(replies) {
                    let Value::Array(values) = reply? else {
                        return Err(CitrineError::Protocol(
                            "Expected array reply from shard".to_string(),
                        ));
                    };
                    if values.len() != group.indices.len() {
                        return Err(CitrineError::Protocol(
                            "Shard reply length mismatch".to_string(),
                        ));
                    }
                    for (&index, value) in group.indices.iter().zip(values) {
                        assembled[index] = value;
                    }
                }
                Ok(Value::Array(assembled))
            }
            MultiSlotKind::KeyListSum => {
                let mut sum = 0i64;
                for reply in replies {
                    sum += reply?.as_int().ok_or_else(|| {
                        CitrineError::Protocol("Expected integer reply from shard".to_string())
                    })?;
                }
                Ok(Value::Int(sum))
            }
            MultiSlotKind::KeyValueOk => {
                for reply in replies {
                    reply?;
                }
                Ok(Value::ok())
            }
        }
    }
}
