// tests/property/roundtrip_test.rs

//! Encoding any RESP frame and decoding the bytes yields an equal frame.

use bytes::{Bytes, BytesMut};
use citrine::core::protocol::{RespFrame, RespFrameCodec};
use proptest::prelude::*;
use tokio_util::codec::{Decoder, Encoder};

/// Printable text, safe for line-oriented frames (no CR/LF).
fn line_text() -> impl Strategy<Value = String> {
    "[ -~]{0,40}".prop_map(|s| s.to_string())
}

fn leaf_frame() -> impl Strategy<Value = RespFrame> {
    prop_oneof![
        line_text().prop_map(RespFrame::SimpleString),
        line_text().prop_map(RespFrame::Error),
        any::<i64>().prop_map(RespFrame::Integer),
        proptest::collection::vec(any::<u8>(), 0..64)
            .prop_map(|v| RespFrame::BulkString(Bytes::from(v))),
        Just(RespFrame::Null),
        Just(RespFrame::NullArray),
        any::<bool>().prop_map(RespFrame::Boolean),
        // Finite doubles with an exact decimal representation round-trip
        // through the text encoding.
        any::<i32>().prop_map(|i| RespFrame::Double(i as f64)),
        "[0-9]{1,30}".prop_map(RespFrame::BigNumber),
    ]
}

fn frame() -> impl Strategy<Value = RespFrame> {
    leaf_frame().prop_recursive(3, 24, 6, |inner| {
        prop_oneof![
            proptest::collection::vec(inner.clone(), 0..6).prop_map(RespFrame::Array),
            proptest::collection::vec(inner.clone(), 0..6).prop_map(RespFrame::Set),
            proptest::collection::vec((inner.clone(), inner.clone()), 0..4)
                .prop_map(RespFrame::Map),
            proptest::collection::vec(inner, 1..5).prop_map(RespFrame::Push),
        ]
    })
}

proptest! {
    #[test]
    fn encode_then_decode_is_identity(original in frame()) {
        let mut codec = RespFrameCodec::new(3);
        let mut buf = BytesMut::new();
        codec.encode(original.clone(), &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        prop_assert_eq!(decoded, original);
        prop_assert!(buf.is_empty());
    }

    #[test]
    fn decoding_is_stable_under_chunked_input(original in frame(), split in 0usize..64) {
        let mut codec = RespFrameCodec::new(3);
        let mut encoded = BytesMut::new();
        codec.encode(original.clone(), &mut encoded).unwrap();

        let cut = split.min(encoded.len());
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&encoded[..cut]);

        // Feeding a prefix never errors; it either yields the frame (when
        // the prefix happens to be complete) or asks for more data.
        let first = codec.decode(&mut buf).unwrap();
        match first {
            Some(frame) => prop_assert_eq!(frame, original),
            None => {
                buf.extend_from_slice(&encoded[cut..]);
                let frame = codec.decode(&mut buf).unwrap().unwrap();
                prop_assert_eq!(frame, original);
            }
        }
    }
}
