//! Handle identity: the `(class, id)` pair tracked by the registry.

use core::hash::Hash;
use std::fmt;

/// Bounds required of both components of a [`HandleKey`].
///
/// Keys are cloned into the registry's map, compared by value, hashed,
/// carried in error values (hence `Debug`), and travel to the agent thread
/// (hence `Send + Sync + 'static`). Blanket-implemented for every type that
/// qualifies; never implement it by hand.
pub trait KeyPart: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static {}

impl<T> KeyPart for T where T: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static {}

/// Identity of a tracked handle.
///
/// `class` is a caller-chosen category tag (e.g. the foreign type the id
/// belongs to); `id` is the opaque handle value itself. Two keys are equal
/// exactly when both components are equal. Keys are immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HandleKey<C, I> {
    /// Caller-chosen category tag.
    pub class: C,
    /// Opaque handle value, owned outside the registry.
    pub id: I,
}

impl<C, I> HandleKey<C, I> {
    /// Create a key from its two components.
    pub fn new(class: C, id: I) -> Self {
        Self { class, id }
    }
}
