//! Identity of retained slots.
//!
//! A slot has two independent keys. The [`StableSlotId`] names the consumer
//! and survives recomposition (and process death when it is persisted through
//! the saveable registry). The [`VersionKey`] names the logical object living
//! in that slot; a new version replaces the old object instead of mutating it.

use std::any::TypeId;
use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::hashing::hash_one;
use crate::Key;

static NEXT_TOKEN_SALT: AtomicU64 = AtomicU64::new(1);

/// Opaque identifier of a retained slot.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StableSlotId(Arc<str>);

impl StableSlotId {
    /// Generates a fresh random id.
    pub fn random() -> Self {
        Self::from_raw(random_token())
    }

    /// Derives an id from an identifying value.
    ///
    /// Every call with an equal value yields an equal id, regardless of the
    /// call site, so consumers passing the same value share one slot.
    pub fn derived<K: Hash + ?Sized>(value: &K) -> Self {
        Self::from_raw(format!("shared:{:016x}", hash_one(value)))
    }

    /// Rebuilds an id from its persisted string form.
    pub fn from_raw(raw: impl Into<Arc<str>>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for StableSlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("StableSlotId").field(&&*self.0).finish()
    }
}

impl fmt::Display for StableSlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Random token in the persisted form used for positional slots.
pub fn random_token() -> String {
    let salt = NEXT_TOKEN_SALT.fetch_add(1, Ordering::Relaxed);
    let high = ahash::RandomState::new().hash_one(salt);
    let low = ahash::RandomState::new().hash_one(!salt);
    format!("slot:{high:016x}{low:016x}")
}

/// Comparison key for the object stored in a slot.
///
/// Equality is by value: two keys built from equal values (and for the same
/// value type) compare equal. Only the 64-bit hash of the value is kept, so
/// values that hash alike (a `&str` and a `String` with the same text, or a
/// genuine collision) count as the same version.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub struct VersionKey {
    value: Option<Key>,
    type_tag: Option<Key>,
}

impl VersionKey {
    /// Key of a slot retrieved without a comparison value.
    pub const NONE: VersionKey = VersionKey {
        value: None,
        type_tag: None,
    };

    pub fn of<K: Hash + ?Sized>(value: &K) -> Self {
        Self {
            value: Some(hash_one(value)),
            type_tag: None,
        }
    }

    /// Ties the key to the type of the stored value so a request for another
    /// type replaces the slot instead of returning a value of the wrong type.
    pub fn for_type<T: 'static>(self) -> Self {
        Self {
            value: self.value,
            type_tag: Some(hash_one(&TypeId::of::<T>())),
        }
    }

    pub fn is_none(&self) -> bool {
        self.value.is_none()
    }
}
