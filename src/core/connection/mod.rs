// src/core/connection/mod.rs

//! One TCP/TLS connection: handshake, an ordered write queue drained by a
//! writer task, and a read loop that correlates replies with pending requests
//! in FIFO order. Push frames bypass the queue and go to Pub/Sub.

mod handshake;
pub(crate) mod pool;
pub(crate) mod supervisor;
mod stream;

pub(crate) use handshake::HandshakeContext;
pub(crate) use pool::{ConnectionPool, ScopeFactory};
pub(crate) use supervisor::{ConnectionEvent, ConnectionPhase, ConnectionSpec, ManagedConnection};

use crate::config::NodeAddress;
use crate::core::CitrineError;
use crate::core::commands::Cmd;
use crate::core::protocol::{RespFrame, RespFrameCodec, encode_command};
use crate::core::pubsub::PubSubState;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io::IoSlice;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use stream::AnyStream;
use tokio::io::{AsyncWrite, AsyncWriteExt, WriteHalf};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::FramedRead;
use tracing::{debug, warn};

pub(crate) use stream::connect_stream;

/// Resolves one pending request with its reply or a terminal error.
pub(crate) type ReplySender = oneshot::Sender<Result<RespFrame, CitrineError>>;
pub(crate) type ReplyReceiver = oneshot::Receiver<Result<RespFrame, CitrineError>>;

/// One unit handed to the writer task: pre-encoded frames plus the
/// completions they expect, registered in submission order.
struct Outbound {
    bytes: Bytes,
    completions: Vec<ReplySender>,
}

struct ConnectionShared {
    addr: NodeAddress,
    /// Single-producer/single-consumer: the writer pushes, the reader pops.
    inflight: Mutex<VecDeque<ReplySender>>,
    closed: AtomicBool,
    last_used: Mutex<Instant>,
}

impl ConnectionShared {
    /// Fails every pending request; called once when the connection dies.
    fn fail_all(&self, error: &CitrineError) {
        let pending: Vec<ReplySender> = self.inflight.lock().drain(..).collect();
        for tx in pending {
            let _ = tx.send(Err(error.clone()));
        }
    }
}

/// A cheaply cloneable handle to one live connection.
#[derive(Clone)]
pub(crate) struct Connection {
    outbound_tx: mpsc::Sender<Outbound>,
    shared: Arc<ConnectionShared>,
}

impl Connection {
    /// Runs the handshake on an open transport and spawns the read and
    /// write tasks. `failure_tx` receives the terminal error when either
    /// task exits, waking the supervisor.
    pub(crate) async fn start(
        mut socket: AnyStream,
        addr: &NodeAddress,
        spec: &ConnectionSpec,
        ctx: HandshakeContext,
        failure_tx: mpsc::Sender<CitrineError>,
    ) -> Result<Self, CitrineError> {
        let residual = handshake::perform(&mut socket, &ctx).await?;
        debug!(%addr, "handshake complete");

        let (read_half, write_half) = tokio::io::split(socket);
        let shared = Arc::new(ConnectionShared {
            addr: addr.clone(),
            inflight: Mutex::new(VecDeque::new()),
            closed: AtomicBool::new(false),
            last_used: Mutex::new(Instant::now()),
        });

        let (outbound_tx, outbound_rx) = mpsc::channel(spec.write_queue_depth);

        let mut framed = FramedRead::new(
            read_half,
            RespFrameCodec::new(spec.protocol.as_u8()),
        );
        // Bytes read past the handshake replies (early pushes) seed the loop.
        framed.read_buffer_mut().extend_from_slice(&residual);

        tokio::spawn(write_loop(
            write_half,
            outbound_rx,
            Arc::clone(&shared),
            failure_tx.clone(),
        ));
        tokio::spawn(read_loop(
            framed,
            Arc::clone(&shared),
            Arc::clone(&spec.pubsub),
            failure_tx,
        ));

        Ok(Self {
            outbound_tx,
            shared,
        })
    }

    pub(crate) fn addr(&self) -> &NodeAddress {
        &self.shared.addr
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Time since the last submission on this connection.
    pub(crate) fn idle_time(&self) -> std::time::Duration {
        self.shared.last_used.lock().elapsed()
    }

    /// Enqueues a contiguous block of commands and returns one receiver per
    /// expected reply. The block is written as a unit, so no other request
    /// can interleave (required for MULTI/EXEC).
    pub(crate) async fn submit(
        &self,
        commands: &[Cmd],
    ) -> Result<Vec<ReplyReceiver>, CitrineError> {
        let mut buf = BytesMut::new();
        let mut completions = Vec::with_capacity(commands.len());
        let mut receivers = Vec::with_capacity(commands.len());
        for cmd in commands {
            encode_command(cmd.args(), &mut buf);
            let (tx, rx) = oneshot::channel();
            completions.push(tx);
            receivers.push(rx);
        }
        *self.shared.last_used.lock() = Instant::now();
        self.outbound_tx
            .send(Outbound {
                bytes: buf.freeze(),
                completions,
            })
            .await
            .map_err(|_| connection_lost(&self.shared.addr))?;
        Ok(receivers)
    }

    /// Enqueues commands whose acknowledgements arrive out-of-band as push
    /// frames (the SUBSCRIBE family) and therefore expect no in-band reply.
    pub(crate) async fn submit_no_reply(&self, commands: &[Cmd]) -> Result<(), CitrineError> {
        let mut buf = BytesMut::new();
        for cmd in commands {
            encode_command(cmd.args(), &mut buf);
        }
        *self.shared.last_used.lock() = Instant::now();
        self.outbound_tx
            .send(Outbound {
                bytes: buf.freeze(),
                completions: Vec::new(),
            })
            .await
            .map_err(|_| connection_lost(&self.shared.addr))
    }

    /// Submits one command and returns its reply receiver.
    pub(crate) async fn request(&self, cmd: &Cmd) -> Result<ReplyReceiver, CitrineError> {
        let mut receivers = self.submit(std::slice::from_ref(cmd)).await?;
        Ok(receivers.pop().expect("one receiver per command"))
    }
}

fn connection_lost(addr: &NodeAddress) -> CitrineError {
    CitrineError::Connection(format!("Connection to {addr} lost"))
}

/// Drains the outbound queue into the socket, registering completions before
/// the bytes hit the wire so a fast reply can never miss its slot.
async fn write_loop(
    mut io: WriteHalf<AnyStream>,
    mut outbound_rx: mpsc::Receiver<Outbound>,
    shared: Arc<ConnectionShared>,
    failure_tx: mpsc::Sender<CitrineError>,
) {
    let mut pending: Vec<Outbound> = Vec::new();
    loop {
        pending.clear();
        if outbound_rx.recv_many(&mut pending, 64).await == 0 {
            // All handles dropped: orderly local close.
            let _ = io.shutdown().await;
            break;
        }

        {
            let mut inflight = shared.inflight.lock();
            for outbound in &mut pending {
                inflight.extend(outbound.completions.drain(..));
            }
        }

        let buffers: Vec<Bytes> = pending.iter().map(|o| o.bytes.clone()).collect();
        if let Err(e) = write_all_buffers(&mut io, &buffers).await {
            let error = CitrineError::from(e);
            warn!(addr = %shared.addr, "write failed: {error}");
            shared.closed.store(true, Ordering::Release);
            shared.fail_all(&error);
            let _ = failure_tx.send(error).await;
            break;
        }
        if let Err(e) = io.flush().await {
            let error = CitrineError::from(e);
            shared.closed.store(true, Ordering::Release);
            shared.fail_all(&error);
            let _ = failure_tx.send(error).await;
            break;
        }
    }
}

/// Writes every buffer, preferring vectored writes to avoid coalescing.
async fn write_all_buffers<W: AsyncWrite + Unpin>(
    io: &mut W,
    buffers: &[Bytes],
) -> std::io::Result<()> {
    if buffers.len() == 1 {
        return io.write_all(&buffers[0]).await;
    }

    // Track progress as (buffer index, offset within that buffer).
    let mut index = 0;
    let mut offset = 0;
    while index < buffers.len() {
        let slices: Vec<IoSlice<'_>> = std::iter::once(IoSlice::new(&buffers[index][offset..]))
            .chain(buffers[index + 1..].iter().map(|b| IoSlice::new(b)))
            .collect();
        let mut written = io.write_vectored(&slices).await?;
        if written == 0 {
            return Err(std::io::ErrorKind::WriteZero.into());
        }
        while written > 0 && index < buffers.len() {
            let remaining = buffers[index].len() - offset;
            if written >= remaining {
                written -= remaining;
                index += 1;
                offset = 0;
            } else {
                offset += written;
                written = 0;
            }
        }
    }
    Ok(())
}

/// Consumes frames from the socket: pushes go to Pub/Sub, everything else
/// resolves the head of the inflight queue in FIFO order.
async fn read_loop(
    mut framed: FramedRead<tokio::io::ReadHalf<AnyStream>, RespFrameCodec>,
    shared: Arc<ConnectionShared>,
    pubsub: Arc<PubSubState>,
    failure_tx: mpsc::Sender<CitrineError>,
) {
    let error = loop {
        match framed.next().await {
            Some(Ok(RespFrame::Push(elements))) => pubsub.handle_push(elements),
            Some(Ok(frame)) => {
                let completion = shared.inflight.lock().pop_front();
                match completion {
                    // A dropped receiver means the request was cancelled or
                    // timed out; the reply is silently discarded.
                    Some(tx) => {
                        let _ = tx.send(Ok(frame));
                    }
                    None => warn!(addr = %shared.addr, "unsolicited reply discarded"),
                }
            }
            Some(Err(e)) => {
                warn!(addr = %shared.addr, "protocol error: {e}");
                break e;
            }
            None => {
                debug!(addr = %shared.addr, "connection closed by peer");
                break connection_lost(&shared.addr);
            }
        }
    };

    shared.closed.store(true, Ordering::Release);
    shared.fail_all(&error);
    let _ = failure_tx.send(error).await;
}
