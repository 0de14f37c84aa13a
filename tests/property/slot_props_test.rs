// tests/property/slot_props_test.rs

//! Slot hashing invariants: slots stay in range and hash tags dominate.

use citrine::core::cluster::slot::{NUM_SLOTS, get_slot};
use proptest::prelude::*;

proptest! {
    #[test]
    fn slot_is_always_in_range(key in proptest::collection::vec(any::<u8>(), 0..128)) {
        prop_assert!((get_slot(&key) as usize) < NUM_SLOTS);
    }

    #[test]
    fn hash_tag_determines_slot(
        tag in proptest::collection::vec(any::<u8>(), 1..16)
            .prop_filter("tag must not contain braces", |t| {
                !t.contains(&b'{') && !t.contains(&b'}')
            }),
        prefix in proptest::collection::vec(any::<u8>(), 0..16)
            .prop_filter("prefix must not open a tag", |p| !p.contains(&b'{')),
        suffix in proptest::collection::vec(any::<u8>(), 0..16),
    ) {
        // Any two keys sharing a hash tag land on the same slot.
        let mut key = prefix.clone();
        key.push(b'{');
        key.extend_from_slice(&tag);
        key.push(b'}');
        key.extend_from_slice(&suffix);
        prop_assert_eq!(get_slot(&key), get_slot(&tag));
    }

    #[test]
    fn keys_without_braces_hash_whole_key(
        key in proptest::collection::vec(any::<u8>(), 1..64)
            .prop_filter("no braces", |k| !k.contains(&b'{')),
    ) {
        // Without a tag the slot is a pure function of the full key, so a
        // single-character change must be allowed to move the slot. Here we
        // only pin determinism.
        prop_assert_eq!(get_slot(&key), get_slot(&key));
    }
}
