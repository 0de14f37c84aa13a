// src/core/batch.rs

//! The batch engine: atomic transactions (WATCH/MULTI/EXEC) and non-atomic
//! pipelines with cross-slot fan-out.

use crate::config::NodeAddress;
use crate::core::CitrineError;
use crate::core::commands::{Cmd, MultiSlotKind};
use crate::core::dispatch::{DispatchTarget, Dispatcher};
use crate::core::errors::ServerError;
use crate::core::protocol::{RespFrame, Value};
use crate::core::routing::{ConnectionRole, single_slot_for_keys};
use bytes::Bytes;
use futures::future::join_all;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// How many times a non-atomic pipeline is replayed when its retry strategy
/// opts into retrying failures.
const MAX_BATCH_ATTEMPTS: usize = 3;

/// An ordered set of commands executed together.
#[derive(Debug, Clone, Default)]
pub struct Batch {
    commands: Vec<Cmd>,
    atomic: bool,
    watch_keys: Vec<Bytes>,
}

impl Batch {
    /// An atomic transaction: MULTI, the commands, EXEC.
    pub fn atomic() -> Self {
        Self {
            atomic: true,
            ..Default::default()
        }
    }

    /// A non-atomic pipeline; commands may span slots.
    pub fn pipeline() -> Self {
        Self::default()
    }

    pub fn add(mut self, cmd: Cmd) -> Self {
        self.commands.push(cmd);
        self
    }

    /// Adds a key to WATCH before MULTI. Atomic batches only.
    pub fn watch(mut self, key: impl Into<Bytes>) -> Self {
        self.watch_keys.push(key.into());
        self
    }

    pub fn get(self, key: impl Into<Bytes>) -> Self {
        self.add(Cmd::new("GET").arg(key))
    }

    pub fn set(self, key: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        self.add(Cmd::new("SET").arg(key).arg(value))
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn is_atomic(&self) -> bool {
        self.atomic
    }

    pub(crate) fn commands(&self) -> &[Cmd] {
        &self.commands
    }

    /// Every key this batch touches, for the single-slot check.
    fn keys(&self) -> impl Iterator<Item = &Bytes> {
        self.watch_keys.iter().chain(
            self.commands
                .iter()
                .flat_map(|cmd| match cmd.multi_slot_kind() {
                    Some(MultiSlotKind::KeyValueOk) => {
                        cmd.args().iter().skip(1).step_by(2).collect::<Vec<_>>()
                    }
                    Some(_) => cmd.args().iter().skip(1).collect(),
                    None => cmd.first_key().into_iter().collect(),
                }),
        )
    }
}

/// Opt-in retry behavior for non-atomic pipelines.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchRetryStrategy {
    /// Replay the pipeline when a command fails with a retriable server
    /// error (TRYAGAIN, CLUSTERDOWN, LOADING).
    pub retry_server_error: bool,
    /// Replay the pipeline when a shard connection drops mid-flight.
    pub retry_connection_error: bool,
}

/// Per-execution options.
#[derive(Debug, Clone, Default)]
pub struct BatchOptions {
    /// When false, per-command errors come back in place as values instead
    /// of failing the call.
    pub raise_on_error: Option<bool>,
    /// Overrides the client request timeout for this batch.
    pub timeout: Option<Duration>,
    pub retry_strategy: Option<BatchRetryStrategy>,
}

impl BatchOptions {
    fn raise_on_error(&self) -> bool {
        self.raise_on_error.unwrap_or(true)
    }
}

/// Runs a batch through the pipeline. Entry point used by the client.
pub(crate) async fn execute_batch(
    dispatcher: &Dispatcher,
    batch: &Batch,
    options: &BatchOptions,
) -> Result<Vec<Value>, CitrineError> {
    dispatcher.ensure_open()?;
    if batch.is_empty() {
        return Ok(Vec::new());
    }
    if batch.is_atomic() {
        if let Some(strategy) = &options.retry_strategy {
            if strategy.retry_server_error || strategy.retry_connection_error {
                return Err(CitrineError::Configuration(
                    "Atomic batches cannot opt into retries: a replayed transaction would \
                     violate all-or-nothing semantics"
                        .to_string(),
                ));
            }
        }
    } else if !batch.watch_keys.is_empty() {
        return Err(CitrineError::Configuration(
            "WATCH keys are only meaningful on atomic batches".to_string(),
        ));
    }

    dispatcher.stats.record_request();
    let span = dispatcher.telemetry.request_span("Batch");
    let deadline =
        Instant::now() + options.timeout.unwrap_or(dispatcher.request_timeout);

    // Compression write policy applies to each value-bearing slot.
    let mut commands = batch.commands().to_vec();
    if let Some(compressor) = &dispatcher.compressor {
        for cmd in &mut commands {
            compressor.apply_write_policy(cmd)?;
        }
    }

    let _permit = dispatcher.acquire_inflight(deadline).await?;
    let result = if batch.is_atomic() {
        execute_atomic(dispatcher, batch, &commands, options, deadline).await
    } else {
        execute_pipeline(dispatcher, &commands, options, deadline).await
    };

    dispatcher.account(&result);
    if let Some(span) = span {
        span.finish(result.is_ok());
    }
    result
}

/// WATCH (optional) + MULTI + commands + EXEC on one connection.
async fn execute_atomic(
    dispatcher: &Dispatcher,
    batch: &Batch,
    commands: &[Cmd],
    options: &BatchOptions,
    deadline: Instant,
) -> Result<Vec<Value>, CitrineError> {
    let addr = match &dispatcher.target {
        DispatchTarget::Standalone(addr) => addr.clone(),
        DispatchTarget::Cluster(topology) => {
            // Cross-slot transactions fail locally before any I/O.
            let slot = single_slot_for_keys(batch.keys())?.ok_or_else(|| {
                CitrineError::Configuration(
                    "An atomic batch in cluster mode needs at least one key".to_string(),
                )
            })?;
            if topology.current().shards().is_empty() {
                topology.refresh(&dispatcher.pool).await?;
            }
            topology
                .current()
                .primary_for_slot(slot)
                .cloned()
                .ok_or(CitrineError::SlotNotCovered(slot))?
        }
    };

    let mut block = Vec::with_capacity(commands.len() + 3);
    if !batch.watch_keys.is_empty() {
        let mut watch = Cmd::new("WATCH");
        for key in &batch.watch_keys {
            watch = watch.arg(key.clone());
        }
        block.push(watch);
    }
    block.push(Cmd::new("MULTI"));
    block.extend_from_slice(commands);
    block.push(Cmd::new("EXEC"));

    let conn = dispatcher
        .pool
        .ready(&addr, ConnectionRole::Primary, deadline)
        .await?;
    let receivers = conn.submit(&block).await?;
    let mut frames = Vec::with_capacity(receivers.len());
    for receiver in receivers {
        let frame = tokio::time::timeout_at(deadline, receiver)
            .await
            .map_err(|_| CitrineError::Timeout)?
            .map_err(|_| {
                CitrineError::Connection(format!("Connection to {addr} dropped the transaction"))
            })??;
        frames.push(frame);
    }

    // The EXEC reply is last; everything before it is WATCH/MULTI/QUEUED.
    let exec_reply = frames.pop().expect("EXEC reply present");
    let values = match exec_reply {
        // A null EXEC means a WATCHed key changed: a distinguishable
        // outcome, not a server error.
        RespFrame::Null | RespFrame::NullArray => return Err(CitrineError::WatchConflict),
        RespFrame::Error(line) => {
            return Err(CitrineError::Server(ServerError::parse(&line)));
        }
        RespFrame::Array(elements) => elements,
        other => {
            return Err(CitrineError::Protocol(format!(
                "Unexpected EXEC reply: {other:?}"
            )));
        }
    };

    finalize_replies(dispatcher, commands, values.into_iter().map(frame_to_result), options)
}

/// Groups pipeline commands by shard, runs the groups in parallel, and
/// reassembles the replies in submission order.
async fn execute_pipeline(
    dispatcher: &Dispatcher,
    commands: &[Cmd],
    options: &BatchOptions,
    deadline: Instant,
) -> Result<Vec<Value>, CitrineError> {
    let strategy = options.retry_strategy.unwrap_or_default();
    let mut last_error = None;

    for attempt in 0..MAX_BATCH_ATTEMPTS {
        if attempt > 0 {
            debug!(attempt, "replaying pipeline batch");
        }
        match run_pipeline_once(dispatcher, commands, options, deadline).await {
            Ok(values) => return Ok(values),
            Err(e) => {
                let retriable = match &e {
                    CitrineError::Server(server) => {
                        strategy.retry_server_error && server.is_retriable()
                    }
                    CitrineError::Connection(_) => strategy.retry_connection_error,
                    _ => false,
                };
                if !retriable || Instant::now() >= deadline {
                    return Err(e);
                }
                last_error = Some(e);
            }
        }
    }
    Err(last_error.unwrap_or(CitrineError::Timeout))
}

async fn run_pipeline_once(
    dispatcher: &Dispatcher,
    commands: &[Cmd],
    options: &BatchOptions,
    deadline: Instant,
) -> Result<Vec<Value>, CitrineError> {
    // (address, role) -> ordered (original index, command)
    let mut groups: BTreeMap<NodeAddress, (ConnectionRole, Vec<(usize, Cmd)>)> = BTreeMap::new();

    match &dispatcher.target {
        DispatchTarget::Standalone(addr) => {
            groups.insert(
                addr.clone(),
                (
                    ConnectionRole::Primary,
                    commands.iter().cloned().enumerate().collect(),
                ),
            );
        }
        DispatchTarget::Cluster(topology) => {
            if topology.current().shards().is_empty() {
                topology.refresh(&dispatcher.pool).await?;
            }
            let map = topology.current();
            // Keyless commands ride with the first shard's group.
            let fallback = map
                .all_primaries()
                .first()
                .cloned()
                .ok_or(CitrineError::SlotNotCovered(0))?;
            for (index, cmd) in commands.iter().enumerate() {
                let addr = match cmd.first_key() {
                    Some(key) => {
                        let slot = crate::core::cluster::slot::get_slot(key);
                        map.primary_for_slot(slot)
                            .cloned()
                            .ok_or(CitrineError::SlotNotCovered(slot))?
                    }
                    None => fallback.clone(),
                };
                groups
                    .entry(addr)
                    .or_insert_with(|| (ConnectionRole::Primary, Vec::new()))
                    .1
                    .push((index, cmd.clone()));
            }
        }
    }

    let sends = groups.into_iter().map(|(addr, (role, entries))| {
        let pool = &dispatcher.pool;
        async move {
            let cmds: Vec<Cmd> = entries.iter().map(|(_, c)| c.clone()).collect();
            let conn = pool.ready(&addr, role, deadline).await?;
            let receivers = conn.submit(&cmds).await?;
            let mut results = Vec::with_capacity(receivers.len());
            for ((index, _), receiver) in entries.iter().zip(receivers) {
                let frame = tokio::time::timeout_at(deadline, receiver)
                    .await
                    .map_err(|_| CitrineError::Timeout)?
                    .map_err(|_| {
                        CitrineError::Connection(format!(
                            "Connection to {addr} dropped part of the pipeline"
                        ))
                    })??;
                results.push((*index, frame));
            }
            Ok::<_, CitrineError>(results)
        }
    });

    let mut assembled: Vec<Option<RespFrame>> = vec![None; commands.len()];
    for group_result in join_all(sends).await {
        for (index, frame) in group_result? {
            assembled[index] = Some(frame);
        }
    }

    let frames = assembled
        .into_iter()
        .map(|f| f.expect("every command answered"));
    finalize_replies(dispatcher, commands, frames.map(frame_to_result), options)
}

fn frame_to_result(frame: RespFrame) -> Result<Value, CitrineError> {
    Value::try_from(frame)
}

/// Applies the compression read policy and the `raise_on_error` contract to
/// per-command results.
fn finalize_replies(
    dispatcher: &Dispatcher,
    commands: &[Cmd],
    replies: impl Iterator<Item = Result<Value, CitrineError>>,
    options: &BatchOptions,
) -> Result<Vec<Value>, CitrineError> {
    let raise = options.raise_on_error();
    let mut values = Vec::with_capacity(commands.len());
    for (cmd, reply) in commands.iter().zip(replies) {
        match reply {
            Ok(value) => {
                let value = match (&dispatcher.compressor, cmd.is_compressible_read()) {
                    (Some(compressor), true) => compressor.apply_read_policy(value)?,
                    _ => value,
                };
                values.push(value);
            }
            Err(CitrineError::Server(e)) if !raise => values.push(Value::ServerError(e)),
            Err(e) => return Err(e),
        }
    }
    Ok(values)
}
