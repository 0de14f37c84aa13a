// src/core/cluster/scan.rs

//! Stateful multi-node SCAN across a moving cluster topology.
//!
//! The cursor handed to callers is an opaque id; the per-node progress it
//! names lives in a client-held registry and is freed when the last cursor
//! handle referencing it drops.

use crate::config::NodeAddress;
use crate::core::CitrineError;
use crate::core::commands::Cmd;
use crate::core::dispatch::Dispatcher;
use crate::core::protocol::Value;
use crate::core::routing::RouteIntent;
use bytes::Bytes;
use dashmap::DashMap;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use tracing::debug;

/// Options forwarded to each per-node SCAN call.
#[derive(Debug, Clone, Default)]
pub struct ScanOptions {
    pub match_pattern: Option<Bytes>,
    pub count: Option<u64>,
    pub object_type: Option<String>,
    /// When false (the default), scanning a topology with unowned slots
    /// aborts; when true, the uncovered slots are skipped.
    pub allow_non_covered_slots: bool,
}

/// An opaque cursor over a cluster-wide scan.
///
/// Successive calls with the same cursor progress the iteration; `finished`
/// flips once every node reports cursor 0. Dropping every handle to one scan
/// releases the client-side progress state.
#[derive(Debug, Clone, Default)]
pub struct ClusterScanCursor {
    handle: Option<Arc<CursorHandle>>,
    finished: bool,
}

impl ClusterScanCursor {
    /// A fresh cursor positioned at the start of the keyspace.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// The opaque id, once the scan has started.
    pub fn id(&self) -> Option<&str> {
        self.handle.as_deref().map(|h| h.id.as_str())
    }

    fn finished_cursor(handle: Arc<CursorHandle>) -> Self {
        Self {
            handle: Some(handle),
            finished: true,
        }
    }
}

#[derive(Debug)]
struct CursorHandle {
    id: String,
    registry: Weak<ScanRegistry>,
}

impl Drop for CursorHandle {
    fn drop(&mut self) {
        // Last handle gone: free the per-node progress map.
        if let Some(registry) = self.registry.upgrade() {
            registry.states.remove(&self.id);
        }
    }
}

/// Per-scan progress: where each primary's server-side cursor stands.
#[derive(Debug, Default)]
struct ScanState {
    epoch: u64,
    node_cursors: HashMap<NodeAddress, u64>,
    finished_nodes: HashSet<NodeAddress>,
}

/// The client-held map of in-progress scans.
#[derive(Debug, Default)]
pub(crate) struct ScanRegistry {
    states: DashMap<String, ScanState>,
}

impl ScanRegistry {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn len(&self) -> usize {
        self.states.len()
    }
}

/// Advances a cluster scan by one SCAN call against one node.
pub(crate) async fn scan(
    dispatcher: &Dispatcher,
    registry: &Arc<ScanRegistry>,
    cursor: ClusterScanCursor,
    options: &ScanOptions,
) -> Result<(ClusterScanCursor, Vec<Bytes>), CitrineError> {
    let Some(topology) = dispatcher.topology() else {
        return Err(CitrineError::Configuration(
            "Cluster scan requires a cluster-mode client".to_string(),
        ));
    };
    if cursor.is_finished() {
        return Ok((cursor, Vec::new()));
    }

    if topology.current().shards().is_empty() {
        topology.refresh(&dispatcher.pool).await?;
    }
    let map = topology.current();

    if !options.allow_non_covered_slots {
        if let Some(slot) = map.first_uncovered_slot() {
            return Err(CitrineError::SlotNotCovered(slot));
        }
    }

    let handle = match cursor.handle {
        Some(handle) => handle,
        None => {
            let id = uuid::Uuid::new_v4().to_string();
            registry.states.insert(
                id.clone(),
                ScanState {
                    epoch: map.epoch(),
                    ..Default::default()
                },
            );
            Arc::new(CursorHandle {
                id,
                registry: Arc::downgrade(registry),
            })
        }
    };

    let primaries = map.all_primaries();
    // The guard must drop before any other registry access on this key.
    let selection = {
        let mut state = registry
            .states
            .entry(handle.id.clone())
            .or_default();

        // Topology drift: keep progress for nodes still present, forget
        // vanished ones; new primaries start at cursor 0.
        if state.epoch != map.epoch() {
            debug!(cursor = %handle.id, "slot map changed mid-scan, reconciling progress");
            state.node_cursors.retain(|addr, _| primaries.contains(addr));
            state.finished_nodes.retain(|addr| primaries.contains(addr));
            state.epoch = map.epoch();
        }

        primaries
            .iter()
            .find(|addr| !state.finished_nodes.contains(*addr))
            .map(|addr| {
                let node_cursor = state.node_cursors.get(addr).copied().unwrap_or(0);
                (addr.clone(), node_cursor)
            })
    };
    let Some((target, node_cursor)) = selection else {
        registry.states.remove(&handle.id);
        return Ok((ClusterScanCursor::finished_cursor(handle), Vec::new()));
    };

    let mut cmd = Cmd::new("SCAN").arg(node_cursor.to_string());
    if let Some(pattern) = &options.match_pattern {
        cmd = cmd.arg("MATCH").arg(pattern.clone());
    }
    if let Some(count) = options.count {
        cmd = cmd.arg("COUNT").arg(count.to_string());
    }
    if let Some(object_type) = &options.object_type {
        cmd = cmd.arg("TYPE").arg(object_type.clone());
    }

    let reply = dispatcher
        .execute(cmd, RouteIntent::Address(target.clone()))
        .await?;
    let (next_cursor, keys) = parse_scan_reply(&reply)?;

    let mut all_done = false;
    if let Some(mut state) = registry.states.get_mut(&handle.id) {
        if next_cursor == 0 {
            state.node_cursors.remove(&target);
            state.finished_nodes.insert(target);
            all_done = primaries
                .iter()
                .all(|addr| state.finished_nodes.contains(addr));
        } else {
            state.node_cursors.insert(target, next_cursor);
        }
    }

    if all_done {
        registry.states.remove(&handle.id);
        return Ok((ClusterScanCursor::finished_cursor(handle), keys));
    }
    Ok((
        ClusterScanCursor {
            handle: Some(handle),
            finished: false,
        },
        keys,
    ))
}

/// Parses the `[cursor, [key...]]` SCAN reply shape.
fn parse_scan_reply(reply: &Value) -> Result<(u64, Vec<Bytes>), CitrineError> {
    let Value::Array(parts) = reply else {
        return Err(CitrineError::Protocol(
            "SCAN did not return an array".to_string(),
        ));
    };
    let (Some(cursor_value), Some(Value::Array(key_values))) = (parts.first(), parts.get(1))
    else {
        return Err(CitrineError::Protocol("Malformed SCAN reply".to_string()));
    };
    let cursor = match cursor_value {
        Value::Bytes(b) => std::str::from_utf8(b)?
            .parse::<u64>()
            .map_err(|_| CitrineError::Protocol("Bad SCAN cursor".to_string()))?,
        Value::Int(i) if *i >= 0 => *i as u64,
        _ => return Err(CitrineError::Protocol("Bad SCAN cursor".to_string())),
    };
    let keys = key_values
        .iter()
        .map(|v| match v {
            Value::Bytes(b) => Ok(b.clone()),
            _ => Err(CitrineError::Protocol(
                "Non-bulk key in SCAN reply".to_string(),
            )),
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok((cursor, keys))
}
