// tests/integration/test_helpers.rs

//! An in-process mock RESP server for end-to-end client tests.
//!
//! It speaks enough of the protocol to exercise the client core: handshake
//! (HELLO/AUTH/SELECT/CLIENT), the string commands, CLUSTER SLOTS, SCAN,
//! MULTI/EXEC, the SUBSCRIBE family with push acknowledgements, and DEBUG
//! SLEEP for timeout tests.

use bytes::Bytes;
use citrine::config::NodeAddress;
use citrine::core::protocol::{RespFrame, RespFrameCodec};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio_util::codec::Framed;

fn bulk(data: impl AsRef<[u8]>) -> RespFrame {
    RespFrame::BulkString(Bytes::copy_from_slice(data.as_ref()))
}

fn ok() -> RespFrame {
    RespFrame::SimpleString("OK".to_string())
}

pub struct MockServer {
    pub port: u16,
    state: Arc<ServerState>,
    accept_task: tokio::task::JoinHandle<()>,
}

struct ServerState {
    store: Mutex<BTreeMap<Vec<u8>, Vec<u8>>>,
    /// channel/pattern -> push senders of subscribed connections.
    subscribers: Mutex<HashMap<Vec<u8>, Vec<mpsc::UnboundedSender<RespFrame>>>>,
    cluster_mode: bool,
    port: AtomicUsize,
    accepted: AtomicUsize,
    subscription_count: AtomicUsize,
    fail_next_exec: AtomicBool,
    moved_remaining: AtomicUsize,
    commands_seen: Mutex<Vec<String>>,
    kill_tx: broadcast::Sender<()>,
    availability_zone: Mutex<Option<String>>,
}

impl MockServer {
    pub async fn start() -> Self {
        Self::start_inner(false).await
    }

    pub async fn start_cluster() -> Self {
        Self::start_inner(true).await
    }

    async fn start_inner(cluster_mode: bool) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (kill_tx, _) = broadcast::channel(4);
        let state = Arc::new(ServerState {
            store: Mutex::new(BTreeMap::new()),
            subscribers: Mutex::new(HashMap::new()),
            cluster_mode,
            port: AtomicUsize::new(port as usize),
            accepted: AtomicUsize::new(0),
            subscription_count: AtomicUsize::new(0),
            fail_next_exec: AtomicBool::new(false),
            moved_remaining: AtomicUsize::new(0),
            commands_seen: Mutex::new(Vec::new()),
            kill_tx,
            availability_zone: Mutex::new(None),
        });

        let accept_state = Arc::clone(&state);
        let accept_task = tokio::spawn(async move {
            loop {
                let Ok((socket, _)) = listener.accept().await else {
                    return;
                };
                accept_state.accepted.fetch_add(1, Ordering::SeqCst);
                let conn_state = Arc::clone(&accept_state);
                tokio::spawn(handle_connection(socket, conn_state));
            }
        });

        Self {
            port,
            state,
            accept_task,
        }
    }

    pub fn address(&self) -> NodeAddress {
        NodeAddress::new("127.0.0.1", self.port)
    }

    pub fn store_get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.state.store.lock().get(key).cloned()
    }

    pub fn store_set(&self, key: &[u8], value: &[u8]) {
        self.state.store.lock().insert(key.to_vec(), value.to_vec());
    }

    pub fn accepted_connections(&self) -> usize {
        self.state.accepted.load(Ordering::SeqCst)
    }

    pub fn subscription_count(&self) -> usize {
        self.state.subscription_count.load(Ordering::SeqCst)
    }

    pub fn seen_commands(&self) -> Vec<String> {
        self.state.commands_seen.lock().clone()
    }

    pub fn set_fail_next_exec(&self) {
        self.state.fail_next_exec.store(true, Ordering::SeqCst);
    }

    /// Makes the next `count` data commands answer with a MOVED redirect
    /// pointing back at this same server.
    pub fn set_moved_responses(&self, count: usize) {
        self.state.moved_remaining.store(count, Ordering::SeqCst);
    }

    pub fn set_availability_zone(&self, az: &str) {
        *self.state.availability_zone.lock() = Some(az.to_string());
    }

    /// Drops every open connection, leaving the listener up for reconnects.
    pub fn kill_connections(&self) {
        let _ = self.state.kill_tx.send(());
    }

    /// Publishes to exact-channel subscribers. Returns the receiver count.
    pub fn publish(&self, channel: &[u8], message: &[u8]) -> usize {
        self.state.publish_kind("message", channel, message)
    }

    /// Publishes to sharded-channel subscribers.
    pub fn publish_sharded(&self, channel: &[u8], message: &[u8]) -> usize {
        self.state.publish_kind("smessage", channel, message)
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.accept_task.abort();
        let _ = self.state.kill_tx.send(());
    }
}

impl ServerState {
    fn publish_kind(&self, kind: &str, channel: &[u8], message: &[u8]) -> usize {
        let mut delivered = 0;
        let mut subscribers = self.subscribers.lock();
        if let Some(senders) = subscribers.get_mut(channel) {
            senders.retain(|tx| {
                tx.send(RespFrame::Push(vec![
                    bulk(kind),
                    bulk(channel),
                    bulk(message),
                ]))
                .is_ok()
            });
            delivered = senders.len();
        }
        delivered
    }
}

fn frame_args(frame: RespFrame) -> Option<Vec<Bytes>> {
    let RespFrame::Array(elements) = frame else {
        return None;
    };
    elements
        .into_iter()
        .map(|f| match f {
            RespFrame::BulkString(b) => Some(b),
            RespFrame::SimpleString(s) => Some(Bytes::from(s.into_bytes())),
            _ => None,
        })
        .collect()
}

async fn handle_connection(socket: TcpStream, state: Arc<ServerState>) {
    let mut framed = Framed::new(socket, RespFrameCodec::new(3));
    let (push_tx, mut push_rx) = mpsc::unbounded_channel::<RespFrame>();
    let mut kill_rx = state.kill_tx.subscribe();
    // Channels this connection subscribed to, for bookkeeping on close.
    let mut my_subscriptions: Vec<Vec<u8>> = Vec::new();
    let mut multi_queue: Option<Vec<Vec<Bytes>>> = None;

    loop {
        tokio::select! {
            _ = kill_rx.recv() => break,
            Some(push) = push_rx.recv() => {
                if framed.send(push).await.is_err() {
                    break;
                }
            }
            incoming = framed.next() => {
                let Some(Ok(frame)) = incoming else { break };
                let Some(args) = frame_args(frame) else { break };
                if args.is_empty() {
                    break;
                }
                let name = String::from_utf8_lossy(&args[0]).to_ascii_uppercase();
                state.commands_seen.lock().push(name.clone());

                // Inside MULTI, everything except the control commands queues.
                if multi_queue.is_some()
                    && !matches!(name.as_str(), "EXEC" | "DISCARD" | "MULTI" | "WATCH")
                {
                    multi_queue.as_mut().unwrap().push(args);
                    if framed
                        .send(RespFrame::SimpleString("QUEUED".to_string()))
                        .await
                        .is_err()
                    {
                        break;
                    }
                    continue;
                }

                let reply = match name.as_str() {
                    "MULTI" => {
                        multi_queue = Some(Vec::new());
                        ok()
                    }
                    "DISCARD" => {
                        multi_queue = None;
                        ok()
                    }
                    "EXEC" => {
                        let queued = multi_queue.take().unwrap_or_default();
                        if state.fail_next_exec.swap(false, Ordering::SeqCst) {
                            RespFrame::NullArray
                        } else {
                            let replies = queued
                                .into_iter()
                                .map(|cmd| execute_data_command(&state, &cmd))
                                .collect();
                            RespFrame::Array(replies)
                        }
                    }
                    "SUBSCRIBE" | "PSUBSCRIBE" | "SSUBSCRIBE" => {
                        let ack_kind = match name.as_str() {
                            "SUBSCRIBE" => "subscribe",
                            "PSUBSCRIBE" => "psubscribe",
                            _ => "ssubscribe",
                        };
                        for channel in &args[1..] {
                            // Duplicate SUBSCRIBE on one connection is
                            // idempotent, like the real server.
                            if !my_subscriptions.contains(&channel.to_vec()) {
                                state
                                    .subscribers
                                    .lock()
                                    .entry(channel.to_vec())
                                    .or_default()
                                    .push(push_tx.clone());
                                my_subscriptions.push(channel.to_vec());
                                state.subscription_count.fetch_add(1, Ordering::SeqCst);
                            }
                            let count = state.subscription_count.load(Ordering::SeqCst);
                            let ack = RespFrame::Push(vec![
                                bulk(ack_kind),
                                RespFrame::BulkString(channel.clone()),
                                RespFrame::Integer(count as i64),
                            ]);
                            if framed.send(ack).await.is_err() {
                                break;
                            }
                        }
                        continue;
                    }
                    "UNSUBSCRIBE" | "PUNSUBSCRIBE" | "SUNSUBSCRIBE" => {
                        let ack_kind = match name.as_str() {
                            "UNSUBSCRIBE" => "unsubscribe",
                            "PUNSUBSCRIBE" => "punsubscribe",
                            _ => "sunsubscribe",
                        };
                        for channel in &args[1..] {
                            if my_subscriptions.contains(&channel.to_vec()) {
                                state.subscribers.lock().remove(&channel.to_vec());
                                my_subscriptions.retain(|c| c != &channel.to_vec());
                                state.subscription_count.fetch_sub(1, Ordering::SeqCst);
                            }
                            let count = state.subscription_count.load(Ordering::SeqCst);
                            let ack = RespFrame::Push(vec![
                                bulk(ack_kind),
                                RespFrame::BulkString(channel.clone()),
                                RespFrame::Integer(count as i64),
                            ]);
                            if framed.send(ack).await.is_err() {
                                break;
                            }
                        }
                        continue;
                    }
                    _ => execute_control_or_data(&state, &name, &args).await,
                };

                if framed.send(reply).await.is_err() {
                    break;
                }
            }
        }
    }

    // Connection gone: its subscriptions die with it. Dropping the push
    // receiver first lets the closed-sender check identify exactly this
    // connection's registrations, so a racing reconnect keeps its own.
    drop(push_rx);
    let mut subscribers = state.subscribers.lock();
    for channel in my_subscriptions {
        if let Some(senders) = subscribers.get_mut(&channel) {
            let before = senders.len();
            senders.retain(|tx| !tx.is_closed());
            let removed = before - senders.len();
            if removed > 0 {
                state.subscription_count.fetch_sub(removed, Ordering::SeqCst);
            }
            if senders.is_empty() {
                subscribers.remove(&channel);
            }
        }
    }
}

async fn execute_control_or_data(
    state: &Arc<ServerState>,
    name: &str,
    args: &[Bytes],
) -> RespFrame {
    match name {
        "HELLO" => RespFrame::Map(vec![
            (bulk("server"), bulk("mock")),
            (bulk("proto"), RespFrame::Integer(3)),
        ]),
        "AUTH" | "CLIENT" | "SELECT" | "READONLY" | "WATCH" | "UNWATCH" => ok(),
        "INFO" => {
            let az = state.availability_zone.lock().clone();
            let mut body = String::from("# Server\r\nredis_version:7.2.0-mock\r\n");
            if let Some(az) = az {
                body.push_str(&format!("availability_zone:{az}\r\n"));
            }
            bulk(body)
        }
        "CLUSTER" if args.len() > 1 && args[1].eq_ignore_ascii_case(b"SLOTS") => {
            let port = state.port.load(Ordering::SeqCst) as i64;
            RespFrame::Array(vec![RespFrame::Array(vec![
                RespFrame::Integer(0),
                RespFrame::Integer(16383),
                RespFrame::Array(vec![
                    bulk("127.0.0.1"),
                    RespFrame::Integer(port),
                    bulk("mock-node-id"),
                ]),
            ])])
        }
        "DEBUG" if args.len() > 2 && args[1].eq_ignore_ascii_case(b"SLEEP") => {
            let seconds: f64 = String::from_utf8_lossy(&args[2]).parse().unwrap_or(0.0);
            tokio::time::sleep(std::time::Duration::from_secs_f64(seconds)).await;
            ok()
        }
        "SCAN" => scan_reply(state, args),
        _ => execute_data_command(state, args),
    }
}

/// Pages through the sorted keyspace, ten keys per call.
fn scan_reply(state: &Arc<ServerState>, args: &[Bytes]) -> RespFrame {
    const PAGE: usize = 10;
    let cursor: usize = String::from_utf8_lossy(&args[1]).parse().unwrap_or(0);
    let store = state.store.lock();
    let keys: Vec<&Vec<u8>> = store.keys().collect();
    let page: Vec<RespFrame> = keys
        .iter()
        .skip(cursor)
        .take(PAGE)
        .map(|k| bulk(k))
        .collect();
    let next = if cursor + PAGE >= keys.len() {
        0
    } else {
        cursor + PAGE
    };
    RespFrame::Array(vec![
        bulk(next.to_string()),
        RespFrame::Array(page),
    ])
}

fn execute_data_command(state: &Arc<ServerState>, args: &[Bytes]) -> RespFrame {
    let name = String::from_utf8_lossy(&args[0]).to_ascii_uppercase();

    // Simulated resharding: answer data commands with MOVED while armed.
    if state.moved_remaining.load(Ordering::SeqCst) > 0
        && matches!(name.as_str(), "GET" | "SET" | "MGET" | "MSET" | "DEL")
    {
        state.moved_remaining.fetch_sub(1, Ordering::SeqCst);
        let port = state.port.load(Ordering::SeqCst);
        return RespFrame::Error(format!("MOVED 12182 127.0.0.1:{port}"));
    }

    match name.as_str() {
        "PING" => RespFrame::SimpleString("PONG".to_string()),
        "ECHO" if args.len() == 2 => RespFrame::BulkString(args[1].clone()),
        "SET" if args.len() >= 3 => {
            state
                .store
                .lock()
                .insert(args[1].to_vec(), args[2].to_vec());
            ok()
        }
        "GET" if args.len() == 2 => match state.store.lock().get(args[1].as_ref()) {
            Some(value) => bulk(value),
            None => RespFrame::Null,
        },
        "MGET" => {
            let store = state.store.lock();
            RespFrame::Array(
                args[1..]
                    .iter()
                    .map(|key| match store.get(key.as_ref()) {
                        Some(value) => bulk(value),
                        None => RespFrame::Null,
                    })
                    .collect(),
            )
        }
        "MSET" => {
            let mut store = state.store.lock();
            for pair in args[1..].chunks(2) {
                if let [key, value] = pair {
                    store.insert(key.to_vec(), value.to_vec());
                }
            }
            ok()
        }
        "DEL" => {
            let mut store = state.store.lock();
            let removed = args[1..]
                .iter()
                .filter(|key| store.remove(key.as_ref()).is_some())
                .count();
            RespFrame::Integer(removed as i64)
        }
        "INCR" if args.len() == 2 => {
            let mut store = state.store.lock();
            let current: i64 = store
                .get(args[1].as_ref())
                .and_then(|v| String::from_utf8_lossy(v).parse().ok())
                .unwrap_or(0);
            let next = current + 1;
            store.insert(args[1].to_vec(), next.to_string().into_bytes());
            RespFrame::Integer(next)
        }
        other => RespFrame::Error(format!("ERR unknown command '{other}'")),
    }
}
