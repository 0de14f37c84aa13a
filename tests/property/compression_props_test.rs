// tests/property/compression_props_test.rs

//! Compression invariants: round-trips restore the original bytes, and a
//! stored value is never larger than the original.

use bytes::Bytes;
use citrine::core::compression::{
    CompressionBackend, CompressionConfig, Compressor, ENVELOPE_MAGIC,
};
use citrine::core::stats::Statistics;
use proptest::prelude::*;
use std::sync::Arc;

fn backend() -> impl Strategy<Value = CompressionBackend> {
    prop_oneof![
        Just(CompressionBackend::Zstd),
        Just(CompressionBackend::Lz4),
    ]
}

fn compressor(backend: CompressionBackend) -> Compressor {
    Compressor::new(
        CompressionConfig::new(backend),
        Arc::new(Statistics::new()),
    )
    .unwrap()
}

proptest! {
    #[test]
    fn compress_then_decompress_is_identity(
        backend in backend(),
        data in proptest::collection::vec(any::<u8>(), 0..4096),
    ) {
        let compressor = compressor(backend);
        let original = Bytes::from(data);
        let stored = compressor.maybe_compress(&original).unwrap();
        let restored = compressor.maybe_decompress(&stored).unwrap();
        prop_assert_eq!(restored, original);
    }

    #[test]
    fn stored_value_never_exceeds_original(
        backend in backend(),
        data in proptest::collection::vec(any::<u8>(), 0..4096),
    ) {
        let compressor = compressor(backend);
        let original = Bytes::from(data);
        let stored = compressor.maybe_compress(&original).unwrap();
        prop_assert!(stored.len() <= original.len().max(1));
        // Whatever was stored, the envelope is either present and valid or
        // absent entirely.
        if stored.len() >= 5 && stored[..4] == ENVELOPE_MAGIC {
            prop_assert!(stored[4] == 1 || stored[4] == 2);
        }
    }

    #[test]
    fn repetitive_data_compresses(
        backend in backend(),
        byte in any::<u8>(),
        len in 128usize..2048,
    ) {
        let compressor = compressor(backend);
        let original = Bytes::from(vec![byte; len]);
        let stored = compressor.maybe_compress(&original).unwrap();
        prop_assert!(stored.len() < original.len());
        prop_assert_eq!(&stored[..4], &ENVELOPE_MAGIC);
        prop_assert_eq!(compressor.maybe_decompress(&stored).unwrap(), original);
    }
}
