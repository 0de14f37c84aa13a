// src/core/protocol/mod.rs

//! The RESP wire protocol layer: frame codec and the client-facing value type.

mod resp_frame;
mod resp_value;

pub use resp_frame::{RespFrame, RespFrameCodec, encode_command};
pub use resp_value::Value;
