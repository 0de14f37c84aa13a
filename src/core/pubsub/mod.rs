// src/core/pubsub/mod.rs

//! The publish-subscribe subsystem: the subscription registry, push-frame
//! demultiplexing, and message delivery.
//!
//! The registry tracks what the application *intends* to be subscribed to and
//! what the server has *acknowledged*; the two drift apart during reconnects
//! and converge again once reconciliation re-issues the SUBSCRIBE family on
//! the fresh connection.

use crate::config::NodeAddress;
use crate::core::commands::Cmd;
use crate::core::errors::CitrineError;
use crate::core::protocol::RespFrame;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Capacity of the in-memory message queue used when no callback is set.
const MESSAGE_QUEUE_CAPACITY: usize = 1024;

/// Subscription modes.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    strum_macros::Display,
)]
#[serde(rename_all = "kebab-case")]
pub enum PubSubChannelMode {
    /// Exact channel name.
    Exact,
    /// Glob-style pattern.
    Pattern,
    /// Sharded channel (cluster only, server >= 7.0).
    Sharded,
}

impl PubSubChannelMode {
    pub fn subscribe_command(self) -> &'static str {
        match self {
            PubSubChannelMode::Exact => "SUBSCRIBE",
            PubSubChannelMode::Pattern => "PSUBSCRIBE",
            PubSubChannelMode::Sharded => "SSUBSCRIBE",
        }
    }

    pub fn unsubscribe_command(self) -> &'static str {
        match self {
            PubSubChannelMode::Exact => "UNSUBSCRIBE",
            PubSubChannelMode::Pattern => "PUNSUBSCRIBE",
            PubSubChannelMode::Sharded => "SUNSUBSCRIBE",
        }
    }
}

/// One delivered message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PubSubMsg {
    pub channel: Bytes,
    pub message: Bytes,
    /// Set only for pattern-mode deliveries.
    pub pattern: Option<Bytes>,
}

/// Invoked for every delivered message when configured. Context travels
/// inside the closure's captures.
pub type PubSubCallback = Arc<dyn Fn(PubSubMsg) + Send + Sync>;

/// Subscriptions declared at client creation.
#[derive(Clone, Default)]
pub struct PubSubSubscriptions {
    pub channels: BTreeMap<PubSubChannelMode, BTreeSet<Bytes>>,
    pub callback: Option<PubSubCallback>,
}

impl PubSubSubscriptions {
    pub fn validate(&self, cluster_mode: bool) -> Result<(), CitrineError> {
        if !cluster_mode && self.channels.contains_key(&PubSubChannelMode::Sharded) {
            return Err(CitrineError::Configuration(
                "Sharded PubSub subscriptions require cluster mode".to_string(),
            ));
        }
        Ok(())
    }
}

impl fmt::Debug for PubSubSubscriptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PubSubSubscriptions")
            .field("channels", &self.channels)
            .field("has_callback", &self.callback.is_some())
            .finish()
    }
}

/// The `{intended, acknowledged}` view exposed to applications so they can
/// wait for reconciliation to finish.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionStatus {
    pub intended: BTreeMap<PubSubChannelMode, BTreeSet<Bytes>>,
    pub acknowledged: BTreeMap<PubSubChannelMode, BTreeSet<Bytes>>,
}

impl SubscriptionStatus {
    /// True once the server has acknowledged every intended subscription.
    pub fn is_reconciled(&self) -> bool {
        self.intended == self.acknowledged
    }
}

/// Which subscriptions a given connection re-issues during its handshake.
#[derive(Clone)]
pub(crate) enum SubscriptionScope {
    /// No subscriptions on this connection.
    None,
    /// Everything (the single standalone connection).
    All,
    /// Exact + Pattern (the cluster control connection).
    Control,
    /// Sharded channels this node owns, per the predicate.
    Shard(Arc<dyn Fn(&Bytes) -> bool + Send + Sync>),
}

#[derive(Default)]
struct ModeState {
    intended: BTreeSet<Bytes>,
    acknowledged: BTreeSet<Bytes>,
}

#[derive(Default)]
struct Registry {
    exact: ModeState,
    pattern: ModeState,
    sharded: ModeState,
    /// Which shard connection each sharded channel is currently attached to.
    sharded_attachment: BTreeMap<Bytes, NodeAddress>,
}

impl Registry {
    fn mode(&mut self, mode: PubSubChannelMode) -> &mut ModeState {
        match mode {
            PubSubChannelMode::Exact => &mut self.exact,
            PubSubChannelMode::Pattern => &mut self.pattern,
            PubSubChannelMode::Sharded => &mut self.sharded,
        }
    }
}

/// The per-client PubSub engine. Shared by connections (push dispatch), the
/// client surface (subscribe calls), and the topology reconciler.
pub(crate) struct PubSubState {
    registry: Mutex<Registry>,
    callback: Option<PubSubCallback>,
    queue_tx: mpsc::Sender<PubSubMsg>,
    queue_rx: tokio::sync::Mutex<mpsc::Receiver<PubSubMsg>>,
}

impl PubSubState {
    pub fn new(initial: Option<&PubSubSubscriptions>) -> Arc<Self> {
        let (queue_tx, queue_rx) = mpsc::channel(MESSAGE_QUEUE_CAPACITY);
        let state = Self {
            registry: Mutex::new(Registry::default()),
            callback: initial.and_then(|s| s.callback.clone()),
            queue_tx,
            queue_rx: tokio::sync::Mutex::new(queue_rx),
        };
        if let Some(initial) = initial {
            let mut registry = state.registry.lock();
            for (mode, channels) in &initial.channels {
                registry.mode(*mode).intended.extend(channels.iter().cloned());
            }
        }
        Arc::new(state)
    }

    pub fn has_subscriptions(&self) -> bool {
        let registry = self.registry.lock();
        !registry.exact.intended.is_empty()
            || !registry.pattern.intended.is_empty()
            || !registry.sharded.intended.is_empty()
    }

    /// Records the intent to subscribe. The wire command is issued by the
    /// caller; acknowledgement arrives later as a push frame.
    pub fn intend_subscribe(&self, mode: PubSubChannelMode, channels: &[Bytes]) {
        let mut registry = self.registry.lock();
        registry.mode(mode).intended.extend(channels.iter().cloned());
    }

    /// Records the intent to unsubscribe. An empty channel list means all
    /// channels of that mode, matching the wire command's semantics.
    pub fn intend_unsubscribe(&self, mode: PubSubChannelMode, channels: &[Bytes]) {
        let mut registry = self.registry.lock();
        let state = registry.mode(mode);
        if channels.is_empty() {
            state.intended.clear();
        } else {
            for channel in channels {
                state.intended.remove(channel);
            }
        }
        if mode == PubSubChannelMode::Sharded {
            if channels.is_empty() {
                registry.sharded_attachment.clear();
            } else {
                for channel in channels {
                    registry.sharded_attachment.remove(channel);
                }
            }
        }
    }

    /// Clears server acknowledgements for everything a lost connection was
    /// carrying; reconciliation will re-earn them.
    pub fn reset_acknowledged(&self, scope: &SubscriptionScope) {
        let mut registry = self.registry.lock();
        match scope {
            SubscriptionScope::None => {}
            SubscriptionScope::All => {
                registry.exact.acknowledged.clear();
                registry.pattern.acknowledged.clear();
                registry.sharded.acknowledged.clear();
            }
            SubscriptionScope::Control => {
                registry.exact.acknowledged.clear();
                registry.pattern.acknowledged.clear();
            }
            SubscriptionScope::Shard(owns) => {
                registry
                    .sharded
                    .acknowledged
                    .retain(|channel| !owns(channel));
            }
        }
    }

    /// The SUBSCRIBE-family commands a connection must issue during its
    /// handshake to restore this client's subscriptions.
    pub fn resubscribe_commands(&self, scope: &SubscriptionScope) -> Vec<Cmd> {
        let registry = self.registry.lock();
        let mut commands = Vec::new();
        let mut push = |command: &str, channels: Vec<Bytes>| {
            if channels.is_empty() {
                return;
            }
            let mut cmd = Cmd::new(command);
            for channel in channels {
                cmd = cmd.arg(channel);
            }
            commands.push(cmd);
        };
        match scope {
            SubscriptionScope::None => {}
            SubscriptionScope::All => {
                push("SUBSCRIBE", registry.exact.intended.iter().cloned().collect());
                push(
                    "PSUBSCRIBE",
                    registry.pattern.intended.iter().cloned().collect(),
                );
            }
            SubscriptionScope::Control => {
                push("SUBSCRIBE", registry.exact.intended.iter().cloned().collect());
                push(
                    "PSUBSCRIBE",
                    registry.pattern.intended.iter().cloned().collect(),
                );
            }
            SubscriptionScope::Shard(owns) => {
                push(
                    "SSUBSCRIBE",
                    registry
                        .sharded
                        .intended
                        .iter()
                        .filter(|ch| owns(ch))
                        .cloned()
                        .collect(),
                );
            }
        }
        commands
    }

    /// All intended sharded channels, for post-refresh migration checks.
    pub fn sharded_channels(&self) -> Vec<Bytes> {
        self.registry.lock().sharded.intended.iter().cloned().collect()
    }

    pub fn sharded_attachment(&self, channel: &Bytes) -> Option<NodeAddress> {
        self.registry.lock().sharded_attachment.get(channel).cloned()
    }

    pub fn set_sharded_attachment(&self, channel: Bytes, addr: NodeAddress) {
        self.registry.lock().sharded_attachment.insert(channel, addr);
    }

    pub fn snapshot(&self) -> SubscriptionStatus {
        let registry = self.registry.lock();
        let mut status = SubscriptionStatus::default();
        for (mode, state) in [
            (PubSubChannelMode::Exact, &registry.exact),
            (PubSubChannelMode::Pattern, &registry.pattern),
            (PubSubChannelMode::Sharded, &registry.sharded),
        ] {
            if !state.intended.is_empty() {
                status.intended.insert(mode, state.intended.clone());
            }
            if !state.acknowledged.is_empty() {
                status.acknowledged.insert(mode, state.acknowledged.clone());
            }
        }
        status
    }

    /// Demultiplexes one RESP3 push frame from a connection's read loop.
    pub fn handle_push(&self, elements: Vec<RespFrame>) {
        match PushEvent::parse(elements) {
            Some(PushEvent::Message(msg)) => self.deliver(msg),
            Some(PushEvent::SubscribeAck { mode, channel }) => {
                debug!(%mode, ?channel, "subscription acknowledged");
                self.registry.lock().mode(mode).acknowledged.insert(channel);
            }
            Some(PushEvent::UnsubscribeAck { mode, channel }) => {
                debug!(%mode, ?channel, "unsubscription acknowledged");
                self.registry.lock().mode(mode).acknowledged.remove(&channel);
            }
            None => debug!("ignoring unrecognized push frame"),
        }
    }

    fn deliver(&self, msg: PubSubMsg) {
        if let Some(callback) = &self.callback {
            // A panicking callback must not take down the read loop or
            // starve other subscribers.
            let result = catch_unwind(AssertUnwindSafe(|| callback(msg)));
            if result.is_err() {
                warn!("PubSub callback panicked; message dropped");
            }
            return;
        }
        if let Err(e) = self.queue_tx.try_send(msg) {
            warn!("PubSub message queue full, dropping message: {e}");
        }
    }

    /// Blocking pull. Only valid when no callback is configured.
    pub async fn next_message(&self) -> Result<PubSubMsg, CitrineError> {
        self.ensure_pull_mode()?;
        let mut rx = self.queue_rx.lock().await;
        rx.recv().await.ok_or(CitrineError::ClientClosed)
    }

    /// Non-blocking pull. Only valid when no callback is configured.
    pub fn try_next_message(&self) -> Result<Option<PubSubMsg>, CitrineError> {
        self.ensure_pull_mode()?;
        let Ok(mut rx) = self.queue_rx.try_lock() else {
            return Ok(None);
        };
        match rx.try_recv() {
            Ok(msg) => Ok(Some(msg)),
            Err(mpsc::error::TryRecvError::Empty) => Ok(None),
            Err(mpsc::error::TryRecvError::Disconnected) => Err(CitrineError::ClientClosed),
        }
    }

    fn ensure_pull_mode(&self) -> Result<(), CitrineError> {
        if self.callback.is_some() {
            return Err(CitrineError::Configuration(
                "Messages are delivered via the configured callback".to_string(),
            ));
        }
        Ok(())
    }
}

impl fmt::Debug for PubSubState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PubSubState")
            .field("status", &self.snapshot())
            .field("has_callback", &self.callback.is_some())
            .finish()
    }
}

/// A decoded push frame.
enum PushEvent {
    Message(PubSubMsg),
    SubscribeAck {
        mode: PubSubChannelMode,
        channel: Bytes,
    },
    UnsubscribeAck {
        mode: PubSubChannelMode,
        channel: Bytes,
    },
}

impl PushEvent {
    fn parse(elements: Vec<RespFrame>) -> Option<Self> {
        let mut iter = elements.into_iter();
        let kind = match iter.next()? {
            RespFrame::BulkString(b) => b,
            RespFrame::SimpleString(s) => Bytes::from(s.into_bytes()),
            _ => return None,
        };
        let bulk = |frame: RespFrame| match frame {
            RespFrame::BulkString(b) => Some(b),
            RespFrame::SimpleString(s) => Some(Bytes::from(s.into_bytes())),
            _ => None,
        };

        if kind.eq_ignore_ascii_case(b"message") || kind.eq_ignore_ascii_case(b"smessage") {
            let channel = bulk(iter.next()?)?;
            let message = bulk(iter.next()?)?;
            return Some(PushEvent::Message(PubSubMsg {
                channel,
                message,
                pattern: None,
            }));
        }
        if kind.eq_ignore_ascii_case(b"pmessage") {
            let pattern = bulk(iter.next()?)?;
            let channel = bulk(iter.next()?)?;
            let message = bulk(iter.next()?)?;
            return Some(PushEvent::Message(PubSubMsg {
                channel,
                message,
                pattern: Some(pattern),
            }));
        }

        let ack = |mode, unsubscribe: bool, channel| {
            Some(if unsubscribe {
                PushEvent::UnsubscribeAck { mode, channel }
            } else {
                PushEvent::SubscribeAck { mode, channel }
            })
        };
        let channel_of = |iter: &mut std::vec::IntoIter<RespFrame>| bulk(iter.next()?);
        match () {
            _ if kind.eq_ignore_ascii_case(b"subscribe") => {
                ack(PubSubChannelMode::Exact, false, channel_of(&mut iter)?)
            }
            _ if kind.eq_ignore_ascii_case(b"unsubscribe") => {
                ack(PubSubChannelMode::Exact, true, channel_of(&mut iter)?)
            }
            _ if kind.eq_ignore_ascii_case(b"psubscribe") => {
                ack(PubSubChannelMode::Pattern, false, channel_of(&mut iter)?)
            }
            _ if kind.eq_ignore_ascii_case(b"punsubscribe") => {
                ack(PubSubChannelMode::Pattern, true, channel_of(&mut iter)?)
            }
            _ if kind.eq_ignore_ascii_case(b"ssubscribe") => {
                ack(PubSubChannelMode::Sharded, false, channel_of(&mut iter)?)
            }
            _ if kind.eq_ignore_ascii_case(b"sunsubscribe") => {
                ack(PubSubChannelMode::Sharded, true, channel_of(&mut iter)?)
            }
            _ => None,
        }
    }
}
