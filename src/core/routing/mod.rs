// src/core/routing/mod.rs

//! Decides which connection(s) a command is sent to: slot hashing with hash
//! tags, explicit routes, read-from policies, and multi-slot splitting with
//! order-preserving reassembly metadata.

use crate::config::{NodeAddress, ReadFrom};
use crate::core::CitrineError;
use crate::core::cluster::slot::get_slot;
use crate::core::cluster::topology::SlotMap;
use crate::core::commands::{Cmd, MultiSlotKind};
use bytes::Bytes;
use rand::Rng;
use std::collections::BTreeMap;

/// Whether a command lands on a shard primary or may be served by a replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionRole {
    Primary,
    Replica,
}

/// Where the caller wants a command to go. `Auto` derives the target from
/// the command's first key; the explicit variants override hashing.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum RouteIntent {
    #[default]
    Auto,
    /// Route by the slot of this key.
    SlotKey(Bytes),
    /// Route by an explicit slot number.
    SlotId(u16),
    /// Any primary.
    Random,
    AllPrimaries,
    AllNodes,
    /// A specific node.
    Address(NodeAddress),
}

/// A fully resolved routing decision.
#[derive(Debug)]
pub enum ResolvedRoute {
    Single {
        addr: NodeAddress,
        role: ConnectionRole,
    },
    /// Issue per node and aggregate the replies into an address-keyed map.
    Fanout(Vec<(NodeAddress, ConnectionRole)>),
    /// A multi-key command split by slot; replies reassemble by `indices`.
    MultiSlot {
        kind: MultiSlotKind,
        groups: Vec<SlotGroup>,
    },
}

/// One per-slot subcommand of a split multi-key command.
#[derive(Debug)]
pub struct SlotGroup {
    pub addr: NodeAddress,
    pub role: ConnectionRole,
    pub cmd: Cmd,
    /// Positions (key order) of this group's keys in the original command.
    pub indices: Vec<usize>,
}

/// Routing policy state shared by all requests of one client.
#[derive(Debug, Clone)]
pub struct Router {
    pub read_from: ReadFrom,
    pub client_az: Option<String>,
}

impl Router {
    /// Resolves a command against the current slot map (cluster mode).
    pub fn resolve(
        &self,
        cmd: &Cmd,
        intent: &RouteIntent,
        map: &SlotMap,
    ) -> Result<ResolvedRoute, CitrineError> {
        match intent {
            RouteIntent::Address(addr) => Ok(ResolvedRoute::Single {
                addr: addr.clone(),
                role: ConnectionRole::Primary,
            }),
            RouteIntent::Random => {
                let primaries = map.all_primaries();
                if primaries.is_empty() {
                    return Err(CitrineError::SlotNotCovered(0));
                }
                let index = rand::thread_rng().gen_range(0..primaries.len());
                Ok(ResolvedRoute::Single {
                    addr: primaries[index].clone(),
                    role: ConnectionRole::Primary,
                })
            }
            RouteIntent::AllPrimaries => Ok(ResolvedRoute::Fanout(
                map.all_primaries()
                    .into_iter()
                    .map(|a| (a, ConnectionRole::Primary))
                    .collect(),
            )),
            RouteIntent::AllNodes => Ok(ResolvedRoute::Fanout(map.all_nodes())),
            RouteIntent::SlotId(slot) => self.slot_route(cmd, *slot, map),
            RouteIntent::SlotKey(key) => self.slot_route(cmd, get_slot(key), map),
            RouteIntent::Auto => self.auto_route(cmd, map),
        }
    }

    fn auto_route(&self, cmd: &Cmd, map: &SlotMap) -> Result<ResolvedRoute, CitrineError> {
        // Multi-key commands may span slots; split when they actually do.
        if let Some(kind) = cmd.multi_slot_kind() {
            let groups = self.split_by_slot(cmd, kind, map)?;
            if groups.len() > 1 {
                return Ok(ResolvedRoute::MultiSlot { kind, groups });
            }
        }

        match cmd.first_key() {
            Some(key) => {
                let slot = get_slot(key);
                self.slot_route(cmd, slot, map)
            }
            // Keyless commands go to an arbitrary primary.
            None => self.resolve(cmd, &RouteIntent::Random, map),
        }
    }

    /// Routes a slot-addressed command, applying the read policy for
    /// read-only commands.
    fn slot_route(
        &self,
        cmd: &Cmd,
        slot: u16,
        map: &SlotMap,
    ) -> Result<ResolvedRoute, CitrineError> {
        let shard = map
            .shard_for_slot(slot)
            .ok_or(CitrineError::SlotNotCovered(slot))?;
        let (node, role) = if cmd.is_readonly() {
            shard.read_node(self.read_from, self.client_az.as_deref())
        } else {
            (&shard.primary, ConnectionRole::Primary)
        };
        Ok(ResolvedRoute::Single {
            addr: node.address.clone(),
            role,
        })
    }

    /// Groups a multi-key command's keys by slot, producing one subcommand
    /// per shard plus the index lists reassembly needs.
    fn split_by_slot(
        &self,
        cmd: &Cmd,
        kind: MultiSlotKind,
        map: &SlotMap,
    ) -> Result<Vec<SlotGroup>, CitrineError> {
        let name = String::from_utf8_lossy(cmd.name()).to_string();
        let args = cmd.args();

        // (slot -> ordered key positions)
        let mut by_slot: BTreeMap<u16, Vec<usize>> = BTreeMap::new();
        match kind {
            MultiSlotKind::KeyListArray | MultiSlotKind::KeyListSum => {
                for (position, key) in args[1..].iter().enumerate() {
                    by_slot.entry(get_slot(key)).or_default().push(position);
                }
            }
            MultiSlotKind::KeyValueOk => {
                if args.len() < 3 || (args.len() - 1) % 2 != 0 {
                    return Err(CitrineError::Protocol(format!(
                        "Wrong number of arguments for '{name}'"
                    )));
                }
                for pair in 0..(args.len() - 1) / 2 {
                    let key = &args[1 + pair * 2];
                    by_slot.entry(get_slot(key)).or_default().push(pair);
                }
            }
        }

        let mut groups = Vec::with_capacity(by_slot.len());
        for (slot, indices) in by_slot {
            let shard = map
                .shard_for_slot(slot)
                .ok_or(CitrineError::SlotNotCovered(slot))?;
            let (node, role) = if cmd.is_readonly() {
                shard.read_node(self.read_from, self.client_az.as_deref())
            } else {
                (&shard.primary, ConnectionRole::Primary)
            };
            let mut sub = Cmd::new(&name);
            match kind {
                MultiSlotKind::KeyListArray | MultiSlotKind::KeyListSum => {
                    for &position in &indices {
                        sub = sub.arg(args[1 + position].clone());
                    }
                }
                MultiSlotKind::KeyValueOk => {
                    for &pair in &indices {
                        sub = sub.arg(args[1 + pair * 2].clone());
                        sub = sub.arg(args[2 + pair * 2].clone());
                    }
                }
            }
            groups.push(SlotGroup {
                addr: node.address.clone(),
                role,
                cmd: sub,
                indices,
            });
        }
        Ok(groups)
    }
}

/// Verifies that every key of an atomic batch hashes to one slot and
/// returns it.
pub fn single_slot_for_keys<'a>(
    keys: impl Iterator<Item = &'a Bytes>,
) -> Result<Option<u16>, CitrineError> {
    let mut slot = None;
    for key in keys {
        let key_slot = get_slot(key);
        match slot {
            None => slot = Some(key_slot),
            Some(existing) if existing != key_slot => return Err(CitrineError::CrossSlot),
            Some(_) => {}
        }
    }
    Ok(slot)
}
