// src/core/protocol/resp_value.rs

//! Defines the simplified reply type handed to application code.

use crate::core::errors::{CitrineError, ServerError};
use crate::core::protocol::RespFrame;
use bytes::Bytes;

/// `Value` is the client-facing view of a server reply.
///
/// It strips the wire-level concerns of `RespFrame`: error frames become
/// `Err(CitrineError::Server)`, attributes are unwrapped to their payload,
/// and push frames never reach this type (they are routed to Pub/Sub before
/// reply correlation). RESP3 maps and sets keep their natural container;
/// RESP2 servers only ever produce arrays.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Simple(String),
    Bytes(Bytes),
    Int(i64),
    Double(f64),
    Boolean(bool),
    Array(Vec<Value>),
    Map(Vec<(Value, Value)>),
    Set(Vec<Value>),
    BigNumber(String),
    Verbatim { format: String, text: Bytes },
    /// A per-command server error inside a batch result (`raise_on_error = false`)
    /// or a per-node error inside a fan-out aggregate.
    ServerError(ServerError),
}

impl Value {
    /// The canonical `+OK` reply.
    pub fn ok() -> Self {
        Value::Simple("OK".to_string())
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Value::Simple(s) if s.eq_ignore_ascii_case("OK"))
    }

    /// Borrows the bulk payload, if this value is one.
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn into_bytes(self) -> Option<Bytes> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }
}

impl TryFrom<RespFrame> for Value {
    type Error = CitrineError;

    /// Converts a decoded reply frame into a `Value`, surfacing error frames
    /// as classified `CitrineError::Server` values.
    fn try_from(frame: RespFrame) -> Result<Self, CitrineError> {
        Ok(match frame {
            RespFrame::SimpleString(s) => Value::Simple(s),
            RespFrame::Error(line) => return Err(CitrineError::Server(ServerError::parse(&line))),
            RespFrame::Integer(i) => Value::Int(i),
            RespFrame::BulkString(b) => Value::Bytes(b),
            RespFrame::Null | RespFrame::NullArray => Value::Null,
            RespFrame::Array(arr) => Value::Array(convert_elements(arr)?),
            RespFrame::Map(entries) => {
                let mut out = Vec::with_capacity(entries.len());
                for (k, v) in entries {
                    out.push((Value::try_from(k)?, Value::try_from(v)?));
                }
                Value::Map(out)
            }
            RespFrame::Set(elems) => Value::Set(convert_elements(elems)?),
            RespFrame::Boolean(b) => Value::Boolean(b),
            RespFrame::Double(d) => Value::Double(d),
            RespFrame::BigNumber(s) => Value::BigNumber(s),
            RespFrame::VerbatimString(format, text) => Value::Verbatim { format, text },
            // Attributes carry metadata the core does not interpret; unwrap the payload.
            RespFrame::Attribute(_, data) => Value::try_from(*data)?,
            RespFrame::Push(_) => {
                return Err(CitrineError::Protocol(
                    "Push frame reached reply correlation".to_string(),
                ));
            }
        })
    }
}

fn convert_elements(frames: Vec<RespFrame>) -> Result<Vec<Value>, CitrineError> {
    frames
        .into_iter()
        .map(|f| match f {
            // Inside aggregates, error elements stay in place as values so a
            // pipeline reply can interleave successes and failures.
            RespFrame::Error(line) => Ok(Value::ServerError(ServerError::parse(&line))),
            other => Value::try_from(other),
        })
        .collect()
}
