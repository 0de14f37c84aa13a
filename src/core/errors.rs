// src/core/errors.rs

//! Defines the primary error type for the client runtime.

use std::sync::Arc;
use thiserror::Error;

/// The main error enum, representing all possible failures within the client.
/// Using `thiserror` allows for clean error definitions and automatic `From` trait implementations.
#[derive(Error, Debug, Clone)]
pub enum CitrineError {
    #[error("IO Error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("Incomplete data in stream")]
    IncompleteData,

    /// Construction-time validation failure of the client configuration.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Socket, TLS, or handshake failure. Recovered by the reconnect supervisor.
    #[error("Connection error: {0}")]
    Connection(String),

    /// The request deadline expired before a reply arrived.
    #[error("Request timed out")]
    Timeout,

    /// Malformed RESP or an unexpected frame type. Fatal to the connection.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The server returned an `-ERR` style reply.
    #[error("{0}")]
    Server(ServerError),

    /// An atomic batch's EXEC returned null because a WATCHed key was mutated.
    #[error("Transaction aborted (WATCH failed)")]
    WatchConflict,

    /// A multi-key atomic operation addressed keys in different slots.
    #[error("CROSSSLOT Keys in request don't hash to the same slot")]
    CrossSlot,

    /// The cluster topology has no owner for the addressed slot.
    #[error("Slot {0} is not covered by any node")]
    SlotNotCovered(u16),

    /// An operation was issued after `close()`.
    #[error("Client is closed")]
    ClientClosed,

    /// A compression envelope was malformed or named an unknown backend.
    #[error("Decode error: {0}")]
    Decode(String),
}

impl PartialEq for CitrineError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (CitrineError::Io(e1), CitrineError::Io(e2)) => e1.to_string() == e2.to_string(),
            (CitrineError::Configuration(s1), CitrineError::Configuration(s2)) => s1 == s2,
            (CitrineError::Connection(s1), CitrineError::Connection(s2)) => s1 == s2,
            (CitrineError::Protocol(s1), CitrineError::Protocol(s2)) => s1 == s2,
            (CitrineError::Server(e1), CitrineError::Server(e2)) => e1 == e2,
            (CitrineError::SlotNotCovered(s1), CitrineError::SlotNotCovered(s2)) => s1 == s2,
            (CitrineError::Decode(s1), CitrineError::Decode(s2)) => s1 == s2,
            _ => core::mem::discriminant(self) == core::mem::discriminant(other),
        }
    }
}

impl From<std::io::Error> for CitrineError {
    fn from(e: std::io::Error) -> Self {
        CitrineError::Io(Arc::new(e))
    }
}

impl From<rustls::Error> for CitrineError {
    fn from(e: rustls::Error) -> Self {
        CitrineError::Connection(format!("TLS error: {e}"))
    }
}

impl From<std::str::Utf8Error> for CitrineError {
    fn from(e: std::str::Utf8Error) -> Self {
        CitrineError::Protocol(format!("Invalid UTF-8 in frame: {e}"))
    }
}

impl From<std::string::FromUtf8Error> for CitrineError {
    fn from(e: std::string::FromUtf8Error) -> Self {
        CitrineError::Protocol(format!("Invalid UTF-8 in frame: {e}"))
    }
}

impl From<ServerError> for CitrineError {
    fn from(e: ServerError) -> Self {
        CitrineError::Server(e)
    }
}

/// An error reply from the server, classified by its leading token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerError {
    pub kind: ServerErrorKind,
    pub message: String,
}

/// Subkinds of server error replies, detected by prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerErrorKind {
    WrongType,
    NoAuth,
    NoPerm,
    CrossSlot,
    /// The slot has been permanently reassigned; the redirect carries the new owner.
    Moved { slot: u16, addr: String },
    /// A single-request redirect during live resharding.
    Ask { slot: u16, addr: String },
    TryAgain,
    ClusterDown,
    ReadOnly,
    Loading,
    ExecAbort,
    Unrecognized,
}

impl ServerError {
    /// Classifies a raw `-` error line from the server.
    pub fn parse(line: &str) -> Self {
        let kind = match line.split_whitespace().next().unwrap_or("") {
            "WRONGTYPE" => ServerErrorKind::WrongType,
            "NOAUTH" => ServerErrorKind::NoAuth,
            "NOPERM" => ServerErrorKind::NoPerm,
            "CROSSSLOT" => ServerErrorKind::CrossSlot,
            "TRYAGAIN" => ServerErrorKind::TryAgain,
            "CLUSTERDOWN" => ServerErrorKind::ClusterDown,
            "READONLY" => ServerErrorKind::ReadOnly,
            "LOADING" => ServerErrorKind::Loading,
            "EXECABORT" => ServerErrorKind::ExecAbort,
            "MOVED" => match parse_redirect(line) {
                Some((slot, addr)) => ServerErrorKind::Moved { slot, addr },
                None => ServerErrorKind::Unrecognized,
            },
            "ASK" => match parse_redirect(line) {
                Some((slot, addr)) => ServerErrorKind::Ask { slot, addr },
                None => ServerErrorKind::Unrecognized,
            },
            _ => ServerErrorKind::Unrecognized,
        };
        Self {
            kind,
            message: line.to_string(),
        }
    }

    /// True for errors the pipeline may retry under the original deadline.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self.kind,
            ServerErrorKind::TryAgain | ServerErrorKind::ClusterDown | ServerErrorKind::Loading
        )
    }

    /// Returns the redirect target for MOVED and ASK errors.
    pub fn redirect(&self) -> Option<(u16, &str)> {
        match &self.kind {
            ServerErrorKind::Moved { slot, addr } | ServerErrorKind::Ask { slot, addr } => {
                Some((*slot, addr.as_str()))
            }
            _ => None,
        }
    }
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

/// Parses the `<slot> <host>:<port>` tail of a MOVED/ASK error.
fn parse_redirect(line: &str) -> Option<(u16, String)> {
    let mut parts = line.split_whitespace();
    parts.next(); // MOVED / ASK
    let slot = parts.next()?.parse::<u16>().ok()?;
    let addr = parts.next()?;
    addr.contains(':').then(|| (slot, addr.to_string()))
}
