// src/core/protocol/resp_frame.rs

//! Implements the RESP (REdis Serialization Protocol) frame structure and the
//! corresponding `Encoder` and `Decoder` for network communication.

use crate::core::CitrineError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// The CRLF (Carriage Return, Line Feed) sequence used to terminate lines in RESP.
const CRLF: &[u8] = b"\r\n";
const CRLF_LEN: usize = 2;

// Protocol-level limits to protect against malformed or hostile frames.
const MAX_FRAME_ELEMENTS: usize = 1_024 * 1_024; // Max elements in an aggregate.
const MAX_BULK_STRING_SIZE: usize = 512 * 1024 * 1024; // 512MB max bulk string size.

/// An enum representing a single frame in the RESP protocol.
/// This is the low-level representation of data exchanged with the server.
#[derive(Debug, Clone, PartialEq)]
pub enum RespFrame {
    SimpleString(String),
    Error(String),
    Integer(i64),
    BulkString(Bytes),
    Null,
    NullArray,
    Array(Vec<RespFrame>),
    // RESP3 additions
    Map(Vec<(RespFrame, RespFrame)>),
    Set(Vec<RespFrame>),
    Boolean(bool),
    Double(f64),
    BigNumber(String),
    VerbatimString(String, Bytes),
    /// An out-of-band server push (`>`), e.g. a Pub/Sub message.
    Push(Vec<RespFrame>),
    Attribute(Vec<(RespFrame, RespFrame)>, Box<RespFrame>),
}

impl RespFrame {
    /// A convenience method to encode a frame into a `Vec<u8>`.
    pub fn encode_to_vec(&self) -> Result<Vec<u8>, CitrineError> {
        let mut buf = BytesMut::new();
        RespFrameCodec::new(3).encode(self.clone(), &mut buf)?;
        Ok(buf.to_vec())
    }

    /// Push frames bypass the request/reply correlation entirely.
    pub fn is_push(&self) -> bool {
        matches!(self, RespFrame::Push(_))
    }
}

/// Encodes a command argument list as a RESP array of bulk strings.
///
/// This is the hot path for outgoing commands, writing `*N\r\n` followed by
/// `$len\r\nbytes\r\n` segments directly without building intermediate frames.
pub fn encode_command(args: &[Bytes], dst: &mut BytesMut) {
    let mut itoa_buf = itoa::Buffer::new();
    dst.put_u8(b'*');
    dst.extend_from_slice(itoa_buf.format(args.len()).as_bytes());
    dst.extend_from_slice(CRLF);
    for arg in args {
        dst.put_u8(b'$');
        dst.extend_from_slice(itoa_buf.format(arg.len()).as_bytes());
        dst.extend_from_slice(CRLF);
        dst.extend_from_slice(arg);
        dst.extend_from_slice(CRLF);
    }
}

/// A `tokio_util::codec` implementation for encoding and decoding `RespFrame`s.
///
/// The negotiated protocol version gates which frame types are legal on the
/// wire: RESP3-only types arriving on a RESP2 connection are a protocol error.
#[derive(Debug)]
pub struct RespFrameCodec {
    protocol_version: u8,
}

impl RespFrameCodec {
    /// Creates a new `RespFrameCodec` with the specified protocol version.
    pub fn new(protocol_version: u8) -> Self {
        Self { protocol_version }
    }
}

impl Encoder<RespFrame> for RespFrameCodec {
    type Error = CitrineError;

    /// Encodes a `RespFrame` into a `BytesMut` buffer according to the RESP specification.
    fn encode(&mut self, item: RespFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match item {
            RespFrame::SimpleString(s) => {
                dst.extend_from_slice(b"+");
                dst.extend_from_slice(s.as_bytes());
                dst.extend_from_slice(CRLF);
            }
            RespFrame::Error(s) => {
                dst.extend_from_slice(b"-");
                dst.extend_from_slice(s.as_bytes());
                dst.extend_from_slice(CRLF);
            }
            RespFrame::Integer(i) => {
                dst.extend_from_slice(b":");
                dst.extend_from_slice(i.to_string().as_bytes());
                dst.extend_from_slice(CRLF);
            }
            RespFrame::BulkString(b) => {
                dst.extend_from_slice(b"$");
                dst.extend_from_slice(b.len().to_string().as_bytes());
                dst.extend_from_slice(CRLF);
                dst.extend_from_slice(&b);
                dst.extend_from_slice(CRLF);
            }
            RespFrame::Null => {
                if self.protocol_version >= 3 {
                    dst.extend_from_slice(b"_\r\n");
                } else {
                    dst.extend_from_slice(b"$-1\r\n");
                }
            }
            RespFrame::NullArray => {
                dst.extend_from_slice(b"*-1\r\n");
            }
            RespFrame::Array(arr) => {
                dst.extend_from_slice(b"*");
                dst.extend_from_slice(arr.len().to_string().as_bytes());
                dst.extend_from_slice(CRLF);
                for frame in arr {
                    // Recursively encode each frame in the array.
                    self.encode(frame, dst)?;
                }
            }
            RespFrame::Map(map) => {
                self.require_resp3("Map")?;
                dst.extend_from_slice(b"%");
                dst.extend_from_slice(map.len().to_string().as_bytes());
                dst.extend_from_slice(CRLF);
                for (k, v) in map {
                    self.encode(k, dst)?;
                    self.encode(v, dst)?;
                }
            }
            RespFrame::Set(set) => {
                self.require_resp3("Set")?;
                dst.extend_from_slice(b"~");
                dst.extend_from_slice(set.len().to_string().as_bytes());
                dst.extend_from_slice(CRLF);
                for frame in set {
                    self.encode(frame, dst)?;
                }
            }
            RespFrame::Boolean(b) => {
                self.require_resp3("Boolean")?;
                dst.extend_from_slice(if b { b"#t" } else { b"#f" });
                dst.extend_from_slice(CRLF);
            }
            RespFrame::Double(d) => {
                self.require_resp3("Double")?;
                dst.extend_from_slice(b",");
                dst.extend_from_slice(d.to_string().as_bytes());
                dst.extend_from_slice(CRLF);
            }
            RespFrame::BigNumber(bn) => {
                self.require_resp3("BigNumber")?;
                dst.extend_from_slice(b"(");
                dst.extend_from_slice(bn.as_bytes());
                dst.extend_from_slice(CRLF);
            }
            RespFrame::VerbatimString(format, text) => {
                self.require_resp3("VerbatimString")?;
                dst.extend_from_slice(b"=");
                dst.extend_from_slice((format.len() + 1 + text.len()).to_string().as_bytes());
                dst.extend_from_slice(CRLF);
                dst.extend_from_slice(format.as_bytes());
                dst.extend_from_slice(b":");
                dst.extend_from_slice(&text);
                dst.extend_from_slice(CRLF);
            }
            RespFrame::Push(arr) => {
                self.require_resp3("Push")?;
                dst.extend_from_slice(b">");
                dst.extend_from_slice(arr.len().to_string().as_bytes());
                dst.extend_from_slice(CRLF);
                for frame in arr {
                    self.encode(frame, dst)?;
                }
            }
            RespFrame::Attribute(attrs, data) => {
                self.require_resp3("Attribute")?;
                dst.extend_from_slice(b"|");
                dst.extend_from_slice(attrs.len().to_string().as_bytes());
                dst.extend_from_slice(CRLF);
                for (k, v) in attrs {
                    self.encode(k, dst)?;
                    self.encode(v, dst)?;
                }
                self.encode(*data, dst)?;
            }
        }
        Ok(())
    }
}

impl RespFrameCodec {
    fn require_resp3(&self, ty: &str) -> Result<(), CitrineError> {
        if self.protocol_version < 3 {
            return Err(CitrineError::Protocol(format!(
                "{ty} type not supported in RESP2"
            )));
        }
        Ok(())
    }
}

impl Decoder for RespFrameCodec {
    type Item = RespFrame;
    type Error = CitrineError;

    /// Decodes a `RespFrame` from a `BytesMut` buffer.
    ///
    /// It returns `Ok(None)` if the buffer does not contain a full frame yet,
    /// allowing the `Framed` stream to wait for more data from the network.
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match parse_frame(src, self.protocol_version) {
            Ok((frame, len)) => {
                // Advance the buffer past the successfully parsed frame.
                src.advance(len);
                Ok(Some(frame))
            }
            // If the data is incomplete, wait for more data.
            Err(CitrineError::IncompleteData) => Ok(None),
            // For other errors, propagate them up to the connection.
            Err(e) => Err(e),
        }
    }
}

/// The main parsing entry point. It inspects the first byte (the type prefix)
/// and dispatches to the appropriate parsing function.
fn parse_frame(src: &[u8], protocol_version: u8) -> Result<(RespFrame, usize), CitrineError> {
    if src.is_empty() {
        return Err(CitrineError::IncompleteData);
    }
    match src[0] {
        b'+' => parse_simple_string(src),
        b'-' => parse_error(src),
        b':' => parse_integer(src),
        b'$' => parse_bulk_string(src),
        b'*' => parse_array(src, protocol_version),
        // RESP3 additions
        b'%' => parse_map(src, protocol_version),
        b'~' => parse_set(src, protocol_version),
        b'#' => parse_boolean(src, protocol_version),
        b',' => parse_double(src, protocol_version),
        b'(' => parse_big_number(src, protocol_version),
        b'=' => parse_verbatim_string(src, protocol_version),
        b'_' => parse_resp3_null(src, protocol_version),
        b'>' => parse_push(src, protocol_version),
        b'|' => parse_attribute(src, protocol_version),
        other => Err(CitrineError::Protocol(format!(
            "Unknown frame type prefix: 0x{other:02x}"
        ))),
    }
}

/// Helper function to find the next CRLF sequence in a buffer.
fn find_crlf(src: &[u8]) -> Option<usize> {
    src.windows(CRLF_LEN).position(|window| window == CRLF)
}

/// Parses a single line (up to CRLF) from a buffer.
fn parse_line(src: &[u8]) -> Result<(&[u8], usize), CitrineError> {
    find_crlf(src)
        .map(|pos| (&src[..pos], pos + CRLF_LEN))
        .ok_or(CitrineError::IncompleteData)
}

/// Parses the decimal length header shared by bulk strings and aggregates.
fn parse_length_line(src: &[u8]) -> Result<(isize, usize), CitrineError> {
    let (line, len) = parse_line(&src[1..])?;
    let s = std::str::from_utf8(line)
        .map_err(|_| CitrineError::Protocol("Non-ASCII length header".to_string()))?;
    let n = s
        .parse::<isize>()
        .map_err(|_| CitrineError::Protocol(format!("Malformed length header: {s:?}")))?;
    Ok((n, len + 1))
}

/// Parses a Simple String (e.g., `+OK\r\n`).
fn parse_simple_string(src: &[u8]) -> Result<(RespFrame, usize), CitrineError> {
    let (line, len) = parse_line(&src[1..])?;
    Ok((
        RespFrame::SimpleString(String::from_utf8_lossy(line).to_string()),
        len + 1,
    ))
}

/// Parses an Error (e.g., `-ERR message\r\n`).
fn parse_error(src: &[u8]) -> Result<(RespFrame, usize), CitrineError> {
    let (line, len) = parse_line(&src[1..])?;
    Ok((
        RespFrame::Error(String::from_utf8_lossy(line).to_string()),
        len + 1,
    ))
}

/// Parses an Integer (e.g., `:1000\r\n`).
fn parse_integer(src: &[u8]) -> Result<(RespFrame, usize), CitrineError> {
    let (line, len) = parse_line(&src[1..])?;
    let s = String::from_utf8_lossy(line);
    let i = s
        .parse::<i64>()
        .map_err(|_| CitrineError::Protocol(format!("Malformed integer: {s:?}")))?;
    Ok((RespFrame::Integer(i), len + 1))
}

/// Parses a Bulk String (e.g., `$5\r\nhello\r\n`).
fn parse_bulk_string(src: &[u8]) -> Result<(RespFrame, usize), CitrineError> {
    // RESP3 streamed string: `$?\r\n` followed by `;len` chunks until `;0`.
    if src.get(1) == Some(&b'?') {
        return parse_streamed_bulk_string(src);
    }
    let (str_len, header_len) = parse_length_line(src)?;

    // Handle Null Bulk String ($-1\r\n).
    if str_len == -1 {
        return Ok((RespFrame::Null, header_len));
    }
    if str_len < 0 {
        return Err(CitrineError::Protocol("Negative bulk length".to_string()));
    }

    let str_len = str_len as usize;
    if str_len > MAX_BULK_STRING_SIZE {
        return Err(CitrineError::Protocol("Bulk string too large".to_string()));
    }

    // Check if the entire bulk string (including its data and final CRLF) is in the buffer.
    if src.len() < header_len + str_len + CRLF_LEN {
        return Err(CitrineError::IncompleteData);
    }

    // Validate the trailing CRLF.
    if &src[header_len + str_len..header_len + str_len + CRLF_LEN] != CRLF {
        return Err(CitrineError::Protocol(
            "Bulk string missing trailing CRLF".to_string(),
        ));
    }

    let data = Bytes::copy_from_slice(&src[header_len..header_len + str_len]);
    Ok((RespFrame::BulkString(data), header_len + str_len + CRLF_LEN))
}

/// Parses a RESP3 streamed bulk string: `;len\r\n<bytes>\r\n` chunks
/// terminated by `;0\r\n`.
fn parse_streamed_bulk_string(src: &[u8]) -> Result<(RespFrame, usize), CitrineError> {
    if src.len() < 4 {
        return Err(CitrineError::IncompleteData);
    }
    if &src[2..4] != CRLF {
        return Err(CitrineError::Protocol("Malformed streamed header".to_string()));
    }
    let mut cursor = 4;
    let mut data = Vec::new();
    loop {
        if src.len() <= cursor {
            return Err(CitrineError::IncompleteData);
        }
        if src[cursor] != b';' {
            return Err(CitrineError::Protocol(
                "Expected chunk header in streamed string".to_string(),
            ));
        }
        let (chunk_len, header_len) = parse_length_line(&src[cursor..])?;
        cursor += header_len;
        if chunk_len == 0 {
            return Ok((RespFrame::BulkString(Bytes::from(data)), cursor));
        }
        if chunk_len < 0 || data.len() + chunk_len as usize > MAX_BULK_STRING_SIZE {
            return Err(CitrineError::Protocol("Bad streamed chunk length".to_string()));
        }
        let chunk_len = chunk_len as usize;
        if src.len() < cursor + chunk_len + CRLF_LEN {
            return Err(CitrineError::IncompleteData);
        }
        if &src[cursor + chunk_len..cursor + chunk_len + CRLF_LEN] != CRLF {
            return Err(CitrineError::Protocol(
                "Streamed chunk missing trailing CRLF".to_string(),
            ));
        }
        data.extend_from_slice(&src[cursor..cursor + chunk_len]);
        cursor += chunk_len + CRLF_LEN;
    }
}

/// Parses a RESP3 streamed aggregate body: frames until the `.\r\n` marker.
fn parse_streamed_elements(
    src: &[u8],
    protocol_version: u8,
) -> Result<(Vec<RespFrame>, usize), CitrineError> {
    if src.len() < 4 {
        return Err(CitrineError::IncompleteData);
    }
    if &src[2..4] != CRLF {
        return Err(CitrineError::Protocol("Malformed streamed header".to_string()));
    }
    let mut cursor = 4;
    let mut frames = Vec::new();
    loop {
        if src.len() <= cursor {
            return Err(CitrineError::IncompleteData);
        }
        if src[cursor] == b'.' {
            let (line, len) = parse_line(&src[cursor + 1..])?;
            if !line.is_empty() {
                return Err(CitrineError::Protocol("Malformed stream end marker".to_string()));
            }
            return Ok((frames, cursor + 1 + len));
        }
        if frames.len() >= MAX_FRAME_ELEMENTS {
            return Err(CitrineError::Protocol("Streamed aggregate too large".to_string()));
        }
        let (frame, frame_len) = parse_frame(&src[cursor..], protocol_version)?;
        frames.push(frame);
        cursor += frame_len;
    }
}

/// Pairs up a flat streamed element list for map-shaped aggregates.
fn into_pairs(
    frames: Vec<RespFrame>,
) -> Result<Vec<(RespFrame, RespFrame)>, CitrineError> {
    if frames.len() % 2 != 0 {
        return Err(CitrineError::Protocol(
            "Streamed map with dangling key".to_string(),
        ));
    }
    let mut pairs = Vec::with_capacity(frames.len() / 2);
    let mut iter = frames.into_iter();
    while let (Some(key), Some(value)) = (iter.next(), iter.next()) {
        pairs.push((key, value));
    }
    Ok(pairs)
}

/// Parses a homogeneous aggregate body: `count` frames following the header.
fn parse_elements(
    src: &[u8],
    mut cursor: usize,
    count: usize,
    protocol_version: u8,
) -> Result<(Vec<RespFrame>, usize), CitrineError> {
    let mut frames = Vec::with_capacity(count);
    for _ in 0..count {
        let (frame, frame_len) = parse_frame(&src[cursor..], protocol_version)?;
        frames.push(frame);
        cursor += frame_len;
    }
    Ok((frames, cursor))
}

/// Parses an Array (e.g., `*2\r\n$3\r\nfoo\r\n$3\r\nbar\r\n`).
fn parse_array(src: &[u8], protocol_version: u8) -> Result<(RespFrame, usize), CitrineError> {
    if src.get(1) == Some(&b'?') {
        require_resp3(protocol_version, "Streamed array")?;
        let (frames, cursor) = parse_streamed_elements(src, protocol_version)?;
        return Ok((RespFrame::Array(frames), cursor));
    }
    let (arr_len, header_len) = parse_length_line(src)?;

    // Handle Null Array (*-1\r\n).
    if arr_len == -1 {
        return Ok((RespFrame::NullArray, header_len));
    }
    if arr_len < 0 || arr_len as usize > MAX_FRAME_ELEMENTS {
        return Err(CitrineError::Protocol("Bad array length".to_string()));
    }

    let (frames, cursor) = parse_elements(src, header_len, arr_len as usize, protocol_version)?;
    Ok((RespFrame::Array(frames), cursor))
}

fn require_resp3(protocol_version: u8, ty: &str) -> Result<(), CitrineError> {
    if protocol_version < 3 {
        return Err(CitrineError::Protocol(format!(
            "{ty} type not supported in RESP2"
        )));
    }
    Ok(())
}

/// Parses a Map (e.g., `%2\r\n+key1\r\n+value1\r\n+key2\r\n+value2\r\n`).
fn parse_map(src: &[u8], protocol_version: u8) -> Result<(RespFrame, usize), CitrineError> {
    require_resp3(protocol_version, "Map")?;
    if src.get(1) == Some(&b'?') {
        let (frames, cursor) = parse_streamed_elements(src, protocol_version)?;
        return Ok((RespFrame::Map(into_pairs(frames)?), cursor));
    }
    let (map_len, header_len) = parse_length_line(src)?;
    if map_len < 0 || map_len as usize > MAX_FRAME_ELEMENTS {
        return Err(CitrineError::Protocol("Bad map length".to_string()));
    }

    let mut map_entries = Vec::with_capacity(map_len as usize);
    let mut cursor = header_len;
    for _ in 0..map_len {
        let (key_frame, key_len) = parse_frame(&src[cursor..], protocol_version)?;
        cursor += key_len;
        let (value_frame, value_len) = parse_frame(&src[cursor..], protocol_version)?;
        cursor += value_len;
        map_entries.push((key_frame, value_frame));
    }

    Ok((RespFrame::Map(map_entries), cursor))
}

/// Parses a Set (e.g., `~2\r\n+element1\r\n+element2\r\n`).
fn parse_set(src: &[u8], protocol_version: u8) -> Result<(RespFrame, usize), CitrineError> {
    require_resp3(protocol_version, "Set")?;
    if src.get(1) == Some(&b'?') {
        let (frames, cursor) = parse_streamed_elements(src, protocol_version)?;
        return Ok((RespFrame::Set(frames), cursor));
    }
    let (set_len, header_len) = parse_length_line(src)?;
    if set_len < 0 || set_len as usize > MAX_FRAME_ELEMENTS {
        return Err(CitrineError::Protocol("Bad set length".to_string()));
    }

    let (frames, cursor) = parse_elements(src, header_len, set_len as usize, protocol_version)?;
    Ok((RespFrame::Set(frames), cursor))
}

/// Parses a Boolean (e.g., `#t\r\n` or `#f\r\n`).
fn parse_boolean(src: &[u8], protocol_version: u8) -> Result<(RespFrame, usize), CitrineError> {
    require_resp3(protocol_version, "Boolean")?;
    let (line, len) = parse_line(&src[1..])?;
    match line {
        b"t" => Ok((RespFrame::Boolean(true), len + 1)),
        b"f" => Ok((RespFrame::Boolean(false), len + 1)),
        _ => Err(CitrineError::Protocol("Malformed boolean".to_string())),
    }
}

/// Parses a Double (e.g., `,1.23\r\n`).
fn parse_double(src: &[u8], protocol_version: u8) -> Result<(RespFrame, usize), CitrineError> {
    require_resp3(protocol_version, "Double")?;
    let (line, len) = parse_line(&src[1..])?;
    let s = String::from_utf8_lossy(line);
    let d = match &*s {
        "inf" => f64::INFINITY,
        "-inf" => f64::NEG_INFINITY,
        other => other
            .parse::<f64>()
            .map_err(|_| CitrineError::Protocol(format!("Malformed double: {s:?}")))?,
    };
    Ok((RespFrame::Double(d), len + 1))
}

/// Parses a Big Number (e.g., `(12345678901234567890\r\n`).
fn parse_big_number(src: &[u8], protocol_version: u8) -> Result<(RespFrame, usize), CitrineError> {
    require_resp3(protocol_version, "BigNumber")?;
    let (line, len) = parse_line(&src[1..])?;
    let s = String::from_utf8_lossy(line).to_string();
    // Basic validation: ensure it's a valid number string.
    if s.is_empty() || !s.chars().all(|c| c.is_ascii_digit() || c == '-' || c == '+') {
        return Err(CitrineError::Protocol("Malformed big number".to_string()));
    }
    Ok((RespFrame::BigNumber(s), len + 1))
}

/// Parses a Verbatim String (e.g., `=15\r\ntxt:Some text\r\n`).
fn parse_verbatim_string(
    src: &[u8],
    protocol_version: u8,
) -> Result<(RespFrame, usize), CitrineError> {
    require_resp3(protocol_version, "VerbatimString")?;
    let (str_len, header_len) = parse_length_line(src)?;
    if str_len < 0 || str_len as usize > MAX_BULK_STRING_SIZE {
        return Err(CitrineError::Protocol(
            "Bad verbatim string length".to_string(),
        ));
    }

    let str_len = str_len as usize;
    if src.len() < header_len + str_len + CRLF_LEN {
        return Err(CitrineError::IncompleteData);
    }
    if &src[header_len + str_len..header_len + str_len + CRLF_LEN] != CRLF {
        return Err(CitrineError::Protocol(
            "Verbatim string missing trailing CRLF".to_string(),
        ));
    }

    let data_slice = &src[header_len..header_len + str_len];

    // Find the first colon to split format and text.
    let colon_pos = data_slice
        .iter()
        .position(|&b| b == b':')
        .ok_or_else(|| CitrineError::Protocol("Verbatim string missing format".to_string()))?;

    let format = String::from_utf8_lossy(&data_slice[..colon_pos]).to_string();
    let text = Bytes::copy_from_slice(&data_slice[colon_pos + 1..]);

    Ok((
        RespFrame::VerbatimString(format, text),
        header_len + str_len + CRLF_LEN,
    ))
}

/// Parses a RESP3 Null (`_\r\n`).
fn parse_resp3_null(src: &[u8], protocol_version: u8) -> Result<(RespFrame, usize), CitrineError> {
    require_resp3(protocol_version, "Null")?;
    let (line, len) = parse_line(&src[1..])?;
    if !line.is_empty() {
        return Err(CitrineError::Protocol("Malformed null".to_string()));
    }
    Ok((RespFrame::Null, len + 1))
}

/// Parses a Push frame (e.g., `>3\r\n$7\r\nmessage\r\n$2\r\nch\r\n$5\r\nhello\r\n`).
fn parse_push(src: &[u8], protocol_version: u8) -> Result<(RespFrame, usize), CitrineError> {
    require_resp3(protocol_version, "Push")?;
    let (push_len, header_len) = parse_length_line(src)?;
    if push_len < 0 || push_len as usize > MAX_FRAME_ELEMENTS {
        return Err(CitrineError::Protocol("Bad push length".to_string()));
    }

    let (frames, cursor) = parse_elements(src, header_len, push_len as usize, protocol_version)?;
    Ok((RespFrame::Push(frames), cursor))
}

/// Parses an Attribute (e.g., `|1\r\n+key\r\n+value\r\n$5\r\nhello\r\n`).
fn parse_attribute(src: &[u8], protocol_version: u8) -> Result<(RespFrame, usize), CitrineError> {
    require_resp3(protocol_version, "Attribute")?;
    let (attr_len, header_len) = parse_length_line(src)?;
    if attr_len < 0 || attr_len as usize > MAX_FRAME_ELEMENTS {
        return Err(CitrineError::Protocol("Bad attribute length".to_string()));
    }

    let mut attributes = Vec::with_capacity(attr_len as usize);
    let mut cursor = header_len;
    for _ in 0..attr_len {
        let (key_frame, key_len) = parse_frame(&src[cursor..], protocol_version)?;
        cursor += key_len;
        let (value_frame, value_len) = parse_frame(&src[cursor..], protocol_version)?;
        cursor += value_len;
        attributes.push((key_frame, value_frame));
    }

    // The last part of an attribute is the actual data frame.
    let (data_frame, data_len) = parse_frame(&src[cursor..], protocol_version)?;
    cursor += data_len;

    Ok((RespFrame::Attribute(attributes, Box::new(data_frame)), cursor))
}
