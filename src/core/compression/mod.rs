// src/core/compression/mod.rs

//! Transparent value compression.
//!
//! Stored blobs carry a framed envelope: a fixed 4-byte magic, one backend id
//! byte, then the backend-native payload. A value without the magic prefix is
//! always read back as plain bytes, so compressed and uncompressed writers can
//! share a keyspace and cross-backend reads work (the backend id travels with
//! the value).

use crate::core::commands::Cmd;
use crate::core::errors::CitrineError;
use crate::core::protocol::Value;
use crate::core::stats::Statistics;
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::trace;

/// The fixed prefix marking a compressed value.
pub const ENVELOPE_MAGIC: [u8; 4] = *b"CZF1";
/// Magic plus the backend id byte.
pub const ENVELOPE_HEADER_LEN: usize = 5;

const BACKEND_ID_ZSTD: u8 = 1;
const BACKEND_ID_LZ4: u8 = 2;

/// Values shorter than this are never compressed, regardless of configuration.
pub const MIN_COMPRESSION_SIZE_FLOOR: usize = 64;

/// The pluggable compression backends.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum_macros::Display, Default,
)]
#[serde(rename_all = "kebab-case")]
pub enum CompressionBackend {
    #[default]
    Zstd,
    Lz4,
}

impl CompressionBackend {
    fn id(self) -> u8 {
        match self {
            CompressionBackend::Zstd => BACKEND_ID_ZSTD,
            CompressionBackend::Lz4 => BACKEND_ID_LZ4,
        }
    }

    fn from_id(id: u8) -> Option<Self> {
        match id {
            BACKEND_ID_ZSTD => Some(CompressionBackend::Zstd),
            BACKEND_ID_LZ4 => Some(CompressionBackend::Lz4),
            _ => None,
        }
    }

    /// The inclusive level range each backend accepts.
    pub fn level_range(self) -> (i32, i32) {
        match self {
            CompressionBackend::Zstd => (-131072, 22),
            CompressionBackend::Lz4 => (-128, 12),
        }
    }

    pub fn default_level(self) -> i32 {
        match self {
            CompressionBackend::Zstd => 3,
            CompressionBackend::Lz4 => 0,
        }
    }
}

/// Compression settings supplied at client construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressionConfig {
    pub backend: CompressionBackend,
    /// Backend-native compression level. Validated against the backend range.
    #[serde(default)]
    pub level: Option<i32>,
    /// Values shorter than this are stored uncompressed. Floors at 64 bytes.
    #[serde(default = "default_min_compression_size")]
    pub min_compression_size: usize,
}

fn default_min_compression_size() -> usize {
    MIN_COMPRESSION_SIZE_FLOOR
}

impl CompressionConfig {
    pub fn new(backend: CompressionBackend) -> Self {
        Self {
            backend,
            level: None,
            min_compression_size: MIN_COMPRESSION_SIZE_FLOOR,
        }
    }

    /// The level to use, defaulted per backend.
    pub fn effective_level(&self) -> i32 {
        self.level.unwrap_or_else(|| self.backend.default_level())
    }

    /// The threshold to use, never below the 64-byte floor.
    pub fn effective_min_size(&self) -> usize {
        self.min_compression_size.max(MIN_COMPRESSION_SIZE_FLOOR)
    }

    pub fn validate(&self) -> Result<(), CitrineError> {
        let (min, max) = self.backend.level_range();
        let level = self.effective_level();
        if level < min || level > max {
            return Err(CitrineError::Configuration(format!(
                "Compression level {level} out of range {min}..={max} for backend {}",
                self.backend
            )));
        }
        Ok(())
    }
}

/// Applies the write/read compression policy and keeps the counters honest.
#[derive(Debug, Clone)]
pub struct Compressor {
    config: CompressionConfig,
    stats: Arc<Statistics>,
}

impl Compressor {
    pub fn new(config: CompressionConfig, stats: Arc<Statistics>) -> Result<Self, CitrineError> {
        config.validate()?;
        Ok(Self { config, stats })
    }

    /// Write policy: compress when the value meets the threshold AND the
    /// envelope ends up strictly smaller than the original. Otherwise the
    /// value passes through untouched and one skip is counted.
    pub fn maybe_compress(&self, value: &Bytes) -> Result<Bytes, CitrineError> {
        if value.len() < self.config.effective_min_size() {
            self.stats.record_compression_skipped();
            return Ok(value.clone());
        }

        let payload = self.compress_raw(value)?;
        if ENVELOPE_HEADER_LEN + payload.len() >= value.len() {
            // Incompressible data: storing the envelope would grow the value.
            self.stats.record_compression_skipped();
            return Ok(value.clone());
        }

        let mut out = BytesMut::with_capacity(ENVELOPE_HEADER_LEN + payload.len());
        out.extend_from_slice(&ENVELOPE_MAGIC);
        out.put_u8(self.config.backend.id());
        out.extend_from_slice(&payload);
        let stored = out.freeze();
        trace!(
            original = value.len(),
            stored = stored.len(),
            backend = %self.config.backend,
            "compressed value"
        );
        self.stats
            .record_compressed(value.len() as u64, stored.len() as u64);
        Ok(stored)
    }

    /// Read policy: decompress only when the magic prefix matches; anything
    /// else passes through unchanged. A matching prefix with an unknown
    /// backend id is a decode error.
    pub fn maybe_decompress(&self, value: &Bytes) -> Result<Bytes, CitrineError> {
        if value.len() < ENVELOPE_HEADER_LEN || value[..4] != ENVELOPE_MAGIC {
            return Ok(value.clone());
        }
        let backend = CompressionBackend::from_id(value[4]).ok_or_else(|| {
            CitrineError::Decode(format!("Unknown compression backend id {}", value[4]))
        })?;
        decompress_raw(backend, &value[ENVELOPE_HEADER_LEN..]).map(Bytes::from)
    }

    /// Rewrites the value-bearing argument positions of a write command.
    pub fn apply_write_policy(&self, cmd: &mut Cmd) -> Result<(), CitrineError> {
        for index in cmd.compressible_value_indices() {
            let Some(value) = cmd.args().get(index).cloned() else {
                continue;
            };
            if value.is_empty() {
                // Empty values are never compressed.
                self.stats.record_compression_skipped();
                continue;
            }
            let stored = self.maybe_compress(&value)?;
            cmd.set_arg(index, stored);
        }
        Ok(())
    }

    /// Walks a reply, decompressing bulk payloads and bulk elements of arrays.
    pub fn apply_read_policy(&self, value: Value) -> Result<Value, CitrineError> {
        Ok(match value {
            Value::Bytes(b) => Value::Bytes(self.maybe_decompress(&b)?),
            Value::Array(elems) => Value::Array(
                elems
                    .into_iter()
                    .map(|v| self.apply_read_policy(v))
                    .collect::<Result<_, _>>()?,
            ),
            other => other,
        })
    }

    fn compress_raw(&self, data: &[u8]) -> Result<Vec<u8>, CitrineError> {
        let level = self.config.effective_level();
        match self.config.backend {
            CompressionBackend::Zstd => zstd::encode_all(data, level)
                .map_err(|e| CitrineError::Decode(format!("zstd compression failed: {e}"))),
            CompressionBackend::Lz4 => {
                // Non-positive levels select the fast path with the magnitude
                // as the acceleration factor; positive levels select HC.
                let mode = if level > 0 {
                    lz4::block::CompressionMode::HIGHCOMPRESSION(level)
                } else {
                    lz4::block::CompressionMode::FAST(1 - level)
                };
                lz4::block::compress(data, Some(mode), true)
                    .map_err(|e| CitrineError::Decode(format!("lz4 compression failed: {e}")))
            }
        }
    }
}

fn decompress_raw(backend: CompressionBackend, payload: &[u8]) -> Result<Vec<u8>, CitrineError> {
    match backend {
        CompressionBackend::Zstd => zstd::decode_all(payload)
            .map_err(|e| CitrineError::Decode(format!("zstd decompression failed: {e}"))),
        CompressionBackend::Lz4 => lz4::block::decompress(payload, None)
            .map_err(|e| CitrineError::Decode(format!("lz4 decompression failed: {e}"))),
    }
}
