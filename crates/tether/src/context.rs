//! Per-handle state: refcount, destructor, dependency edges.

use std::sync::atomic::{AtomicI64, Ordering};

use parking_lot::Mutex;

use crate::deps::DependencySet;
use crate::key::{HandleKey, KeyPart};

/// Error value produced by a failing [`Destructor`].
pub type DestructorError = Box<dyn std::error::Error + Send + Sync>;

/// Caller-supplied teardown callback for a handle.
///
/// Invoked with the handle id at most once, from the unregistration agent
/// thread. A failure is routed to the registry's error sink; it never
/// reaches the thread that posted the release.
pub type Destructor<I> = Box<dyn FnOnce(&I) -> Result<(), DestructorError> + Send>;

/// Per-key record tracked by the registry.
///
/// The refcount is the only cross-thread hot state and uses a single atomic.
/// The destructor and dependency set are mutated rarely (registration time
/// and teardown time) and sit behind per-context mutexes, so no lock is ever
/// shared between two different handles.
pub(crate) struct HandleContext<C, I> {
    /// Strong references held by clients and by incoming dependency edges.
    /// Signed so that an illegal transition below zero stays observable.
    refcount: AtomicI64,
    destructor: Mutex<Option<Destructor<I>>>,
    /// `None` until the first edge is added; distinct from an empty set.
    dependencies: Mutex<Option<DependencySet<C, I>>>,
}

impl<C: KeyPart, I: KeyPart> HandleContext<C, I> {
    /// New context holding the registering caller's single reference.
    pub(crate) fn new(destructor: Option<Destructor<I>>) -> Self {
        Self {
            refcount: AtomicI64::new(1),
            destructor: Mutex::new(destructor),
            dependencies: Mutex::new(None),
        }
    }

    /// Acquire one reference; returns the post-increment count.
    pub(crate) fn add_ref(&self) -> i64 {
        self.refcount.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Drop one reference; returns the post-decrement count.
    ///
    /// A negative return means the caller released more than was ever
    /// acquired; the registry surfaces that as `InvalidRefCount`.
    pub(crate) fn release(&self) -> i64 {
        self.refcount.fetch_sub(1, Ordering::AcqRel) - 1
    }

    pub(crate) fn refcount(&self) -> i64 {
        self.refcount.load(Ordering::Acquire)
    }

    /// Replace the stored destructor. Latest writer wins, including `None`.
    pub(crate) fn set_destructor(&self, destructor: Option<Destructor<I>>) {
        *self.destructor.lock() = destructor;
    }

    /// Run the destructor if one is still stored.
    ///
    /// The closure is taken out of the slot before the call, so a context
    /// runs its destructor at most once; later calls are no-ops. The lock is
    /// not held across the user callback.
    pub(crate) fn run_destructor(&self, id: &I) -> Result<(), DestructorError> {
        let destructor = self.destructor.lock().take();
        match destructor {
            Some(destroy) => destroy(id),
            None => Ok(()),
        }
    }

    /// Record an edge to `dep`, allocating the set on first use.
    /// Returns `true` if the edge was newly added.
    pub(crate) fn add_dependency(&self, dep: HandleKey<C, I>) -> bool {
        self.dependencies
            .lock()
            .get_or_insert_with(DependencySet::new)
            .add(dep)
    }

    /// Drop the edge to `dep`. Returns `false` when no set was ever
    /// allocated or the edge is not present.
    pub(crate) fn remove_dependency(&self, dep: &HandleKey<C, I>) -> bool {
        match &mut *self.dependencies.lock() {
            Some(set) => set.remove(dep),
            None => false,
        }
    }

    /// Detach and return every recorded edge, for teardown.
    pub(crate) fn take_dependencies(&self) -> Vec<HandleKey<C, I>> {
        match self.dependencies.lock().take() {
            Some(set) => set.into_keys(),
            None => Vec::new(),
        }
    }

    #[cfg(test)]
    pub(crate) fn dependency_count(&self) -> Option<usize> {
        self.dependencies.lock().as_ref().map(|set| set.len())
    }
}
