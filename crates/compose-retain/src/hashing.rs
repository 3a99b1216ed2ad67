//! Hashing behind every derived key: group and slot positions, shared slot
//! ids, version keys.
//!
//! `ahash` and `hashbrown` are used unless the `std-hash` feature selects the
//! standard library. Both hashers run with fixed keys, so a value maps to the
//! same key in every process of one build. Persisted slot positions depend on
//! that.

use std::hash::{Hash, Hasher};

use crate::Key;

#[cfg(feature = "std-hash")]
pub mod map {
    pub use std::collections::{HashMap, HashSet};
}

#[cfg(not(feature = "std-hash"))]
pub mod map {
    pub use hashbrown::{HashMap, HashSet};
}

#[cfg(feature = "std-hash")]
fn hasher() -> std::collections::hash_map::DefaultHasher {
    std::collections::hash_map::DefaultHasher::new()
}

#[cfg(not(feature = "std-hash"))]
fn hasher() -> ahash::AHasher {
    ahash::AHasher::default()
}

#[inline]
pub fn hash_one<T: Hash + ?Sized>(value: &T) -> Key {
    let mut h = hasher();
    value.hash(&mut h);
    h.finish()
}

/// Key of the `occurrence`-th group keyed `key` inside `parent`.
#[inline]
pub fn group_key(parent: Key, key: Key, occurrence: usize) -> Key {
    hash_one(&(parent, key, occurrence))
}

/// Key of the `cursor`-th positional slot of `group`.
#[inline]
pub fn slot_key(group: Key, cursor: usize) -> Key {
    hash_one(&(group, "slot", cursor))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_stable_for_equal_inputs() {
        assert_eq!(hash_one("item"), hash_one("item"));
        assert_eq!(group_key(1, 2, 0), group_key(1, 2, 0));
        assert_eq!(slot_key(9, 3), slot_key(9, 3));
    }

    #[test]
    fn occurrences_and_positions_separate_keys() {
        assert_ne!(group_key(1, 2, 0), group_key(1, 2, 1));
        assert_ne!(slot_key(9, 0), slot_key(9, 1));
        assert_ne!(group_key(9, 0, 0), slot_key(9, 0));
    }
}
