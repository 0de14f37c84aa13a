// src/core/cluster/topology.rs

//! Cluster topology discovery and the slot map.
//!
//! The map is discovered with CLUSTER SLOTS against any connectable node and
//! swapped in atomically (RCU style): readers never block, and every map
//! carries an epoch so a stale background refresh can never clobber a newer
//! view.

use super::slot::NUM_SLOTS;
use crate::config::{NodeAddress, ReadFrom};
use crate::core::CitrineError;
use crate::core::commands::Cmd;
use crate::core::connection::ConnectionPool;
use crate::core::routing::ConnectionRole;
use crate::core::protocol::Value;
use arc_swap::ArcSwap;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// One discovered cluster member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterNode {
    pub address: NodeAddress,
    pub id: Option<String>,
    pub az: Option<String>,
}

/// One shard: a primary, its replicas, and the read round-robin cursor.
#[derive(Debug)]
pub struct Shard {
    pub primary: ClusterNode,
    pub replicas: Vec<ClusterNode>,
    read_rr: AtomicUsize,
}

impl Shard {
    pub fn new(primary: ClusterNode, replicas: Vec<ClusterNode>) -> Self {
        Self {
            primary,
            replicas,
            read_rr: AtomicUsize::new(0),
        }
    }

    /// Picks the node serving a read-only command under the given policy.
    pub fn read_node(
        &self,
        read_from: ReadFrom,
        client_az: Option<&str>,
    ) -> (&ClusterNode, ConnectionRole) {
        match read_from {
            ReadFrom::Primary => (&self.primary, ConnectionRole::Primary),
            ReadFrom::PreferReplica => self
                .pick_replica(|_| true)
                .map(|n| (n, ConnectionRole::Replica))
                .unwrap_or((&self.primary, ConnectionRole::Primary)),
            ReadFrom::AzAffinity => {
                let local = |n: &ClusterNode| az_matches(n, client_az);
                self.pick_replica(local)
                    .or_else(|| self.pick_replica(|_| true))
                    .map(|n| (n, ConnectionRole::Replica))
                    .unwrap_or((&self.primary, ConnectionRole::Primary))
            }
            ReadFrom::AzAffinityReplicasAndPrimary => {
                let local = |n: &ClusterNode| az_matches(n, client_az);
                if let Some(replica) = self.pick_replica(local) {
                    (replica, ConnectionRole::Replica)
                } else if az_matches(&self.primary, client_az) {
                    (&self.primary, ConnectionRole::Primary)
                } else if let Some(replica) = self.pick_replica(|_| true) {
                    (replica, ConnectionRole::Replica)
                } else {
                    (&self.primary, ConnectionRole::Primary)
                }
            }
        }
    }

    /// Round-robins over the replicas that satisfy the filter.
    fn pick_replica(&self, filter: impl Fn(&ClusterNode) -> bool) -> Option<&ClusterNode> {
        let eligible: Vec<&ClusterNode> = self.replicas.iter().filter(|n| filter(n)).collect();
        if eligible.is_empty() {
            return None;
        }
        let index = self.read_rr.fetch_add(1, Ordering::Relaxed) % eligible.len();
        Some(eligible[index])
    }
}

fn az_matches(node: &ClusterNode, client_az: Option<&str>) -> bool {
    match (node.az.as_deref(), client_az) {
        (Some(node_az), Some(client_az)) => node_az == client_az,
        _ => false,
    }
}

/// The versioned slot-to-shard mapping. Immutable once installed.
#[derive(Debug)]
pub struct SlotMap {
    epoch: u64,
    shards: Vec<Arc<Shard>>,
    /// 16384 entries, each an index into `shards`.
    slots: Vec<Option<u16>>,
}

impl SlotMap {
    pub fn empty() -> Self {
        Self {
            epoch: 0,
            shards: Vec::new(),
            slots: vec![None; NUM_SLOTS],
        }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn shards(&self) -> &[Arc<Shard>] {
        &self.shards
    }

    pub fn shard_for_slot(&self, slot: u16) -> Option<&Arc<Shard>> {
        self.slots
            .get(slot as usize)
            .copied()
            .flatten()
            .and_then(|index| self.shards.get(index as usize))
    }

    pub fn primary_for_slot(&self, slot: u16) -> Option<&NodeAddress> {
        self.shard_for_slot(slot).map(|s| &s.primary.address)
    }

    /// Every distinct primary address, in shard order.
    pub fn all_primaries(&self) -> Vec<NodeAddress> {
        let mut seen = HashSet::new();
        self.shards
            .iter()
            .map(|s| s.primary.address.clone())
            .filter(|a| seen.insert(a.clone()))
            .collect()
    }

    /// Every distinct node with its role.
    pub fn all_nodes(&self) -> Vec<(NodeAddress, ConnectionRole)> {
        let mut seen = HashSet::new();
        let mut nodes = Vec::new();
        for shard in &self.shards {
            if seen.insert(shard.primary.address.clone()) {
                nodes.push((shard.primary.address.clone(), ConnectionRole::Primary));
            }
            for replica in &shard.replicas {
                if seen.insert(replica.address.clone()) {
                    nodes.push((replica.address.clone(), ConnectionRole::Replica));
                }
            }
        }
        nodes
    }

    pub fn has_full_coverage(&self) -> bool {
        self.slots.iter().all(|s| s.is_some())
    }

    pub fn first_uncovered_slot(&self) -> Option<u16> {
        self.slots.iter().position(|s| s.is_none()).map(|i| i as u16)
    }

    /// Builds a successor map with one slot pointed at a different primary,
    /// used for the optimistic update a MOVED redirect allows.
    pub(crate) fn with_slot_owner(&self, slot: u16, addr: NodeAddress, epoch: u64) -> Self {
        let mut shards = self.shards.clone();
        let index = match shards
            .iter()
            .position(|s| s.primary.address == addr)
        {
            Some(index) => index as u16,
            None => {
                shards.push(Arc::new(Shard::new(
                    ClusterNode {
                        address: addr,
                        id: None,
                        az: None,
                    },
                    Vec::new(),
                )));
                (shards.len() - 1) as u16
            }
        };
        let mut slots = self.slots.clone();
        if let Some(entry) = slots.get_mut(slot as usize) {
            *entry = Some(index);
        }
        Self {
            epoch,
            shards,
            slots,
        }
    }

    /// Parses a CLUSTER SLOTS reply. An empty host in an entry means "the
    /// node that answered", so the queried seed's host fills the blank.
    pub fn parse(
        reply: &Value,
        default_host: &str,
        epoch: u64,
    ) -> Result<Self, CitrineError> {
        let Value::Array(entries) = reply else {
            return Err(CitrineError::Protocol(
                "CLUSTER SLOTS did not return an array".to_string(),
            ));
        };

        let mut shards: Vec<Arc<Shard>> = Vec::new();
        let mut slots: Vec<Option<u16>> = vec![None; NUM_SLOTS];

        for entry in entries {
            let Value::Array(fields) = entry else {
                return Err(CitrineError::Protocol(
                    "Malformed CLUSTER SLOTS entry".to_string(),
                ));
            };
            if fields.len() < 3 {
                return Err(CitrineError::Protocol(
                    "CLUSTER SLOTS entry too short".to_string(),
                ));
            }
            let start = fields[0]
                .as_int()
                .filter(|&s| (0..NUM_SLOTS as i64).contains(&s))
                .ok_or_else(|| CitrineError::Protocol("Bad slot range start".to_string()))?;
            let end = fields[1]
                .as_int()
                .filter(|&e| (start..NUM_SLOTS as i64).contains(&e))
                .ok_or_else(|| CitrineError::Protocol("Bad slot range end".to_string()))?;

            let primary = parse_node(&fields[2], default_host)?;
            let replicas = fields[3..]
                .iter()
                .map(|f| parse_node(f, default_host))
                .collect::<Result<Vec<_>, _>>()?;

            // Ranges for the same primary share one shard descriptor so the
            // read round-robin cursor is per shard, not per range.
            let index = match shards
                .iter()
                .position(|s| s.primary.address == primary.address)
            {
                Some(index) => index as u16,
                None => {
                    shards.push(Arc::new(Shard::new(primary, replicas)));
                    (shards.len() - 1) as u16
                }
            };
            for slot in start..=end {
                slots[slot as usize] = Some(index);
            }
        }

        Ok(Self {
            epoch,
            shards,
            slots,
        })
    }
}

fn parse_node(value: &Value, default_host: &str) -> Result<ClusterNode, CitrineError> {
    let Value::Array(fields) = value else {
        return Err(CitrineError::Protocol(
            "Malformed node entry in CLUSTER SLOTS".to_string(),
        ));
    };
    if fields.len() < 2 {
        return Err(CitrineError::Protocol(
            "Node entry in CLUSTER SLOTS too short".to_string(),
        ));
    }
    let host = match &fields[0] {
        Value::Bytes(b) if !b.is_empty() => String::from_utf8_lossy(b).to_string(),
        Value::Bytes(_) | Value::Null => default_host.to_string(),
        _ => {
            return Err(CitrineError::Protocol(
                "Bad host in CLUSTER SLOTS node entry".to_string(),
            ));
        }
    };
    let port = fields[1]
        .as_int()
        .filter(|&p| (0..=u16::MAX as i64).contains(&p))
        .ok_or_else(|| CitrineError::Protocol("Bad port in CLUSTER SLOTS".to_string()))?;
    let id = fields.get(2).and_then(|f| match f {
        Value::Bytes(b) => Some(String::from_utf8_lossy(b).to_string()),
        _ => None,
    });
    Ok(ClusterNode {
        address: NodeAddress::new(host, port as u16),
        id,
        az: None,
    })
}

/// Owns the current slot map and serializes refreshes.
pub(crate) struct TopologyManager {
    seeds: Vec<NodeAddress>,
    refresh_from_initial_nodes: bool,
    /// Query each node's `INFO server` for its availability zone. Only worth
    /// the roundtrips when the read policy is AZ-affine.
    discover_az: bool,
    map: ArcSwap<SlotMap>,
    epoch: AtomicU64,
    refresh_requested: Notify,
    refresh_gate: tokio::sync::Mutex<()>,
    connection_timeout: Duration,
}

impl TopologyManager {
    pub(crate) fn new(
        seeds: Vec<NodeAddress>,
        refresh_from_initial_nodes: bool,
        discover_az: bool,
        connection_timeout: Duration,
    ) -> Self {
        Self {
            seeds,
            refresh_from_initial_nodes,
            discover_az,
            map: ArcSwap::from_pointee(SlotMap::empty()),
            epoch: AtomicU64::new(0),
            refresh_requested: Notify::new(),
            refresh_gate: tokio::sync::Mutex::new(()),
            connection_timeout,
        }
    }

    /// The current map. Readers never block; the pointer swaps atomically.
    pub(crate) fn current(&self) -> Arc<SlotMap> {
        self.map.load_full()
    }

    /// Requests an asynchronous refresh; concurrent requests coalesce.
    pub(crate) fn schedule_refresh(&self) {
        self.refresh_requested.notify_one();
    }

    pub(crate) async fn refresh_signal(&self) {
        self.refresh_requested.notified().await;
    }

    /// Applies the optimistic slot move a MOVED redirect carries, then asks
    /// for a full refresh to pick up the rest of the reshard.
    pub(crate) fn note_moved(&self, slot: u16, addr: NodeAddress) {
        let epoch = self.epoch.fetch_add(1, Ordering::Relaxed) + 1;
        let updated = self.current().with_slot_owner(slot, addr, epoch);
        self.install(updated);
        self.schedule_refresh();
    }

    /// Discovers the topology from the first answering candidate node. At
    /// most one refresh runs at a time; a caller that lost the race waits
    /// for the in-flight run and adopts its result.
    pub(crate) async fn refresh(&self, pool: &ConnectionPool) -> Result<(), CitrineError> {
        let epoch_before = self.current().epoch();
        let _guard = self.refresh_gate.lock().await;
        if self.current().epoch() > epoch_before {
            // Another refresh completed while we waited for the gate.
            return Ok(());
        }

        let mut candidates: Vec<NodeAddress> = Vec::new();
        if self.refresh_from_initial_nodes {
            candidates.extend(self.seeds.iter().cloned());
        } else {
            candidates.extend(self.current().all_primaries());
            for seed in &self.seeds {
                if !candidates.contains(seed) {
                    candidates.push(seed.clone());
                }
            }
        }

        let mut last_error = CitrineError::Connection(
            "No candidate node answered CLUSTER SLOTS".to_string(),
        );
        for addr in candidates {
            match self.query_topology(pool, &addr).await {
                Ok(map) => {
                    let epoch = map.epoch();
                    let keep: HashSet<NodeAddress> =
                        map.all_nodes().into_iter().map(|(a, _)| a).collect();
                    self.install(map);
                    pool.retain_addresses(&keep);
                    info!(epoch, nodes = keep.len(), "cluster topology refreshed");
                    return Ok(());
                }
                Err(e) => {
                    warn!(%addr, "topology query failed: {e}");
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }

    /// Installs a map unless a newer epoch has already been published.
    fn install(&self, map: SlotMap) {
        let map = Arc::new(map);
        let previous = self.map.load();
        if map.epoch() > previous.epoch() {
            self.map.store(map);
        } else {
            debug!(
                stale = map.epoch(),
                current = previous.epoch(),
                "discarding stale topology refresh"
            );
        }
    }

    async fn query_topology(
        &self,
        pool: &ConnectionPool,
        addr: &NodeAddress,
    ) -> Result<SlotMap, CitrineError> {
        let deadline = Instant::now() + self.connection_timeout;
        let conn = pool.ready(addr, ConnectionRole::Primary, deadline).await?;
        let reply = conn
            .request(&Cmd::new("CLUSTER").arg("SLOTS"))
            .await?;
        let frame = tokio::time::timeout_at(deadline, reply)
            .await
            .map_err(|_| CitrineError::Timeout)?
            .map_err(|_| CitrineError::Connection("Connection lost during CLUSTER SLOTS".to_string()))??;
        let value = Value::try_from(frame)?;
        let epoch = self.epoch.fetch_add(1, Ordering::Relaxed) + 1;
        let mut map = SlotMap::parse(&value, &addr.host, epoch)?;

        if self.discover_az {
            self.tag_availability_zones(pool, &mut map).await;
        }
        Ok(map)
    }

    /// Best-effort AZ tagging: asks each node for `INFO server` and records
    /// its `availability_zone`. Nodes that fail to answer stay untagged.
    async fn tag_availability_zones(&self, pool: &ConnectionPool, map: &mut SlotMap) {
        let nodes = map.all_nodes();
        let mut tags = Vec::with_capacity(nodes.len());
        for (addr, role) in nodes {
            let az = self.query_az(pool, &addr, role).await;
            if let Some(az) = az {
                tags.push((addr, az));
            }
        }
        if tags.is_empty() {
            return;
        }
        let tagged: Vec<Arc<Shard>> = map
            .shards
            .iter()
            .map(|shard| {
                let mut primary = shard.primary.clone();
                apply_az(&mut primary, &tags);
                let mut replicas = shard.replicas.clone();
                for replica in &mut replicas {
                    apply_az(replica, &tags);
                }
                Arc::new(Shard::new(primary, replicas))
            })
            .collect();
        map.shards = tagged;
    }

    async fn query_az(
        &self,
        pool: &ConnectionPool,
        addr: &NodeAddress,
        role: ConnectionRole,
    ) -> Option<String> {
        let deadline = Instant::now() + self.connection_timeout;
        let conn = pool.ready(addr, role, deadline).await.ok()?;
        let reply = conn.request(&Cmd::new("INFO").arg("server")).await.ok()?;
        let frame = tokio::time::timeout_at(deadline, reply).await.ok()?.ok()?.ok()?;
        let value = Value::try_from(frame).ok()?;
        let text = match value {
            Value::Bytes(b) => String::from_utf8_lossy(&b).to_string(),
            Value::Verbatim { text, .. } => String::from_utf8_lossy(&text).to_string(),
            Value::Simple(s) => s,
            _ => return None,
        };
        parse_availability_zone(&text)
    }
}

fn apply_az(node: &mut ClusterNode, tags: &[(NodeAddress, String)]) {
    if let Some((_, az)) = tags.iter().find(|(addr, _)| *addr == node.address) {
        node.az = Some(az.clone());
    }
}

/// Extracts `availability_zone:<az>` from an INFO reply.
pub fn parse_availability_zone(info: &str) -> Option<String> {
    info.lines().find_map(|line| {
        line.strip_prefix("availability_zone:")
            .map(|az| az.trim().to_string())
            .filter(|az| !az.is_empty())
    })
}
