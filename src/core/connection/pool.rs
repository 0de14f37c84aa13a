// src/core/connection/pool.rs

//! The per-client pool of supervised connections, one slot per node address.

use super::supervisor::{ConnectionEvent, ConnectionSpec, ManagedConnection};
use crate::core::routing::ConnectionRole;
use super::Connection;
use crate::config::NodeAddress;
use crate::core::CitrineError;
use crate::core::pubsub::SubscriptionScope;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

/// Chooses which subscriptions a new connection to `addr` re-issues.
pub(crate) type ScopeFactory = Arc<dyn Fn(&NodeAddress) -> SubscriptionScope + Send + Sync>;

pub(crate) struct ConnectionPool {
    spec: Arc<ConnectionSpec>,
    nodes: DashMap<NodeAddress, Arc<ManagedConnection>>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    scope_factory: ScopeFactory,
}

impl ConnectionPool {
    pub(crate) fn new(
        spec: Arc<ConnectionSpec>,
        events: mpsc::UnboundedSender<ConnectionEvent>,
        scope_factory: ScopeFactory,
    ) -> Self {
        Self {
            spec,
            nodes: DashMap::new(),
            events,
            scope_factory,
        }
    }

    pub(crate) fn spec(&self) -> &Arc<ConnectionSpec> {
        &self.spec
    }

    /// Returns the supervised slot for `addr`, creating it on first use.
    /// A role change (replica promotion or demotion) replaces the slot so
    /// the READONLY handshake step matches the node's current role.
    pub(crate) fn get_or_create(
        &self,
        addr: &NodeAddress,
        role: ConnectionRole,
    ) -> Arc<ManagedConnection> {
        if let Some(existing) = self.nodes.get(addr) {
            if existing.role() == role {
                return Arc::clone(&existing);
            }
        }
        if let Some((_, stale)) = self.nodes.remove(addr) {
            if stale.role() != role {
                debug!(%addr, "replacing connection slot after role change");
                stale.shutdown();
            } else {
                // Raced with another caller; keep the equivalent slot.
                return self
                    .nodes
                    .entry(addr.clone())
                    .or_insert(stale)
                    .clone();
            }
        }
        self.nodes
            .entry(addr.clone())
            .or_insert_with(|| {
                ManagedConnection::spawn(
                    addr.clone(),
                    Arc::clone(&self.spec),
                    role,
                    (self.scope_factory)(addr),
                    self.events.clone(),
                )
            })
            .clone()
    }

    /// Waits for a Ready connection to `addr`, bounded by `deadline`.
    pub(crate) async fn ready(
        &self,
        addr: &NodeAddress,
        role: ConnectionRole,
        deadline: Instant,
    ) -> Result<Connection, CitrineError> {
        self.get_or_create(addr, role).ready(deadline).await
    }

    pub(crate) fn addresses(&self) -> Vec<NodeAddress> {
        self.nodes.iter().map(|e| e.key().clone()).collect()
    }

    /// Every currently live connection, for operations that touch them all
    /// (e.g. immediate re-authentication after a password rotation).
    pub(crate) fn current_connections(&self) -> Vec<Connection> {
        self.nodes
            .iter()
            .filter_map(|e| e.value().try_current())
            .collect()
    }

    /// Tears down the slot for a node that left the topology.
    pub(crate) fn remove(&self, addr: &NodeAddress) {
        if let Some((_, managed)) = self.nodes.remove(addr) {
            managed.shutdown();
        }
    }

    /// Keeps only the given addresses, shutting down everything else.
    pub(crate) fn retain_addresses(&self, keep: &HashSet<NodeAddress>) {
        self.nodes.retain(|addr, managed| {
            if keep.contains(addr) {
                true
            } else {
                debug!(%addr, "pruning connection to node no longer in topology");
                managed.shutdown();
                false
            }
        });
    }

    pub(crate) fn drain_all(&self) {
        for entry in self.nodes.iter() {
            entry.value().drain();
        }
    }

    pub(crate) fn shutdown_all(&self) {
        for entry in self.nodes.iter() {
            entry.value().shutdown();
        }
        self.nodes.clear();
    }
}
