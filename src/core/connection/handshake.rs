// src/core/connection/handshake.rs

//! The connection handshake: HELLO/AUTH, CLIENT SETNAME, SELECT, READONLY,
//! and re-SUBSCRIBE, performed on the raw stream before the read and write
//! tasks take over.

use super::stream::AnyStream;
use crate::core::CitrineError;
use crate::core::commands::Cmd;
use crate::core::protocol::{RespFrame, RespFrameCodec, encode_command};
use bytes::BytesMut;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::codec::Decoder;
use tracing::debug;

// Per-step timeouts for robust handshakes against slow or wedged peers.
const HANDSHAKE_WRITE_TIMEOUT: Duration = Duration::from_secs(2);
const HANDSHAKE_READ_TIMEOUT: Duration = Duration::from_secs(3);

/// Everything the handshake needs to know about this connection.
pub(crate) struct HandshakeContext {
    /// 2 or 3, as configured.
    pub protocol_version: u8,
    pub username: Option<String>,
    pub password: Option<String>,
    pub client_name: Option<String>,
    /// Nonzero only for standalone clients.
    pub database_id: u32,
    /// Issue READONLY: this connection serves replica reads.
    pub readonly: bool,
    /// SUBSCRIBE-family commands to re-issue before the connection is Ready.
    pub resubscribe: Vec<Cmd>,
}

/// Runs the handshake sequence. Returns any bytes read past the final reply,
/// which must seed the read loop's buffer (e.g. early subscription pushes).
pub(crate) async fn perform(
    stream: &mut AnyStream,
    ctx: &HandshakeContext,
) -> Result<BytesMut, CitrineError> {
    let mut exchange = Exchange {
        stream,
        // Lenient decode: the reply to HELLO 3 is a RESP3 map.
        codec: RespFrameCodec::new(3),
        buf: BytesMut::with_capacity(4096),
    };

    // 1. HELLO with the protocol version, inlining AUTH when credentials exist.
    let mut hello = Cmd::new("HELLO").arg(ctx.protocol_version.to_string());
    if let Some(password) = &ctx.password {
        hello = hello
            .arg("AUTH")
            .arg(ctx.username.clone().unwrap_or_else(|| "default".to_string()))
            .arg(password.clone());
    }
    match exchange.roundtrip(&hello).await? {
        RespFrame::Error(e) if ctx.protocol_version == 2 && is_unknown_command(&e) => {
            // Pre-RESP3 server: fall back to AUTH and the plain protocol.
            debug!("HELLO rejected by pre-RESP3 server, falling back to AUTH");
            if let Some(password) = &ctx.password {
                let mut auth = Cmd::new("AUTH");
                if let Some(username) = &ctx.username {
                    auth = auth.arg(username.clone());
                }
                auth = auth.arg(password.clone());
                exchange.expect_ok(&auth, "AUTH").await?;
            }
        }
        RespFrame::Error(e) => {
            return Err(CitrineError::Connection(format!("HELLO rejected: {e}")));
        }
        _ => {}
    }

    // 2. CLIENT SETNAME if configured.
    if let Some(name) = &ctx.client_name {
        let cmd = Cmd::new("CLIENT").arg("SETNAME").arg(name.clone());
        exchange.expect_ok(&cmd, "CLIENT SETNAME").await?;
    }

    // 3. SELECT the logical database (standalone, nonzero only).
    if ctx.database_id > 0 {
        let cmd = Cmd::new("SELECT").arg(ctx.database_id.to_string());
        exchange.expect_ok(&cmd, "SELECT").await?;
    }

    // 4. READONLY for replica-serving connections.
    if ctx.readonly {
        exchange.expect_ok(&Cmd::new("READONLY"), "READONLY").await?;
    }

    // 5. Re-issue subscriptions. Their acknowledgements arrive as push
    //    frames, so nothing is awaited here; the read loop picks them up.
    for cmd in &ctx.resubscribe {
        exchange.send(cmd).await?;
    }

    Ok(exchange.buf)
}

fn is_unknown_command(error: &str) -> bool {
    let lower = error.to_ascii_lowercase();
    lower.contains("unknown command") || lower.contains("unknown subcommand")
}

/// A minimal encode-write-read-decode exchange over the raw stream.
struct Exchange<'a> {
    stream: &'a mut AnyStream,
    codec: RespFrameCodec,
    buf: BytesMut,
}

impl Exchange<'_> {
    async fn send(&mut self, cmd: &Cmd) -> Result<(), CitrineError> {
        let mut out = BytesMut::new();
        encode_command(cmd.args(), &mut out);
        tokio::time::timeout(HANDSHAKE_WRITE_TIMEOUT, self.stream.write_all(&out))
            .await
            .map_err(|_| CitrineError::Connection("Write timeout during handshake".to_string()))??;
        Ok(())
    }

    async fn recv(&mut self) -> Result<RespFrame, CitrineError> {
        loop {
            // Attempt to decode a full frame from what is buffered so far.
            if let Some(frame) = self.codec.decode(&mut self.buf)? {
                return Ok(frame);
            }
            let read = tokio::time::timeout(
                HANDSHAKE_READ_TIMEOUT,
                self.stream.read_buf(&mut self.buf),
            )
            .await
            .map_err(|_| CitrineError::Connection("Read timeout during handshake".to_string()))??;
            if read == 0 {
                return Err(CitrineError::Connection(
                    "Connection closed by peer during handshake".to_string(),
                ));
            }
        }
    }

    async fn roundtrip(&mut self, cmd: &Cmd) -> Result<RespFrame, CitrineError> {
        self.send(cmd).await?;
        self.recv().await
    }

    /// Sends a step that must succeed; any error reply fails the handshake.
    async fn expect_ok(&mut self, cmd: &Cmd, step: &str) -> Result<(), CitrineError> {
        match self.roundtrip(cmd).await? {
            RespFrame::Error(e) => Err(CitrineError::Connection(format!("{step} rejected: {e}"))),
            _ => Ok(()),
        }
    }
}
