//! Scope-key resolvers keep retained slots alive past the composition of
//! their consumer, for as long as some key is still in scope (for example an
//! item of a lazy list that scrolled out of view but is still in the list).

use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::hashing::hash_one;
use crate::hashing::map::HashSet;
use crate::{lock, Key};

pub type ScopeKey = Key;

static NEXT_RESOLVER_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResolverId(u64);

impl ResolverId {
    pub fn next() -> Self {
        Self(NEXT_RESOLVER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Predicate telling whether a key is still in scope.
pub trait ScopeKeyResolver: Send + Sync {
    fn id(&self) -> ResolverId;
    fn is_key_in_scope(&self, key: ScopeKey) -> bool;
}

/// Resolver backed by a live set of keys.
pub struct KeysInScope {
    id: ResolverId,
    keys: Mutex<HashSet<ScopeKey>>,
}

impl KeysInScope {
    pub fn new() -> Self {
        Self {
            id: ResolverId::next(),
            keys: Mutex::new(HashSet::new()),
        }
    }

    pub fn scope_key<K: Hash + ?Sized>(key: &K) -> ScopeKey {
        hash_one(key)
    }

    /// Replaces the key set. Returns whether it changed.
    pub fn set_keys<K: Hash>(&self, keys: impl IntoIterator<Item = K>) -> bool {
        let next: HashSet<ScopeKey> = keys.into_iter().map(|key| hash_one(&key)).collect();
        let mut keys = lock(&self.keys);
        if *keys == next {
            return false;
        }
        *keys = next;
        true
    }

    pub fn contains<K: Hash + ?Sized>(&self, key: &K) -> bool {
        lock(&self.keys).contains(&hash_one(key))
    }

    pub fn len(&self) -> usize {
        lock(&self.keys).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for KeysInScope {
    fn default() -> Self {
        Self::new()
    }
}

impl ScopeKeyResolver for KeysInScope {
    fn id(&self) -> ResolverId {
        self.id
    }

    fn is_key_in_scope(&self, key: ScopeKey) -> bool {
        lock(&self.keys).contains(&key)
    }
}

impl fmt::Debug for KeysInScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeysInScope")
            .field("id", &self.id)
            .field("keys", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_keys_reports_changes() {
        let resolver = KeysInScope::new();
        assert!(resolver.set_keys(["a", "b"]));
        assert!(!resolver.set_keys(["b", "a"]));
        assert!(resolver.contains("a"));
        assert!(resolver.is_key_in_scope(KeysInScope::scope_key("b")));

        assert!(resolver.set_keys(["b"]));
        assert!(!resolver.is_key_in_scope(KeysInScope::scope_key("a")));
        assert_eq!(resolver.len(), 1);
    }

    #[test]
    fn resolvers_get_distinct_ids() {
        assert_ne!(KeysInScope::new().id(), KeysInScope::new().id());
    }
}
