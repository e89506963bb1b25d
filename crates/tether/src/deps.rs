//! Unordered set of dependency edges attached to a handle context.

use rustc_hash::FxHashSet;

use crate::key::{HandleKey, KeyPart};

/// The keys a handle depends on.
///
/// Each entry pins the target handle with one reference for as long as the
/// edge exists. Insertion and removal are idempotent; the boolean return
/// tells the caller whether the edge count actually changed, which is what
/// decides whether the target's refcount moves.
pub(crate) struct DependencySet<C, I> {
    keys: FxHashSet<HandleKey<C, I>>,
}

impl<C: KeyPart, I: KeyPart> DependencySet<C, I> {
    pub(crate) fn new() -> Self {
        Self {
            keys: FxHashSet::default(),
        }
    }

    /// Insert an edge. Returns `true` if it was newly added.
    pub(crate) fn add(&mut self, key: HandleKey<C, I>) -> bool {
        self.keys.insert(key)
    }

    /// Remove an edge. Returns `true` if it was present.
    pub(crate) fn remove(&mut self, key: &HandleKey<C, I>) -> bool {
        self.keys.remove(key)
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.keys.len()
    }

    /// Consume the set for teardown. Order is unspecified.
    pub(crate) fn into_keys(self) -> Vec<HandleKey<C, I>> {
        self.keys.into_iter().collect()
    }
}
