//! Concurrent handle registry and the registration/destruction protocol.

use std::sync::Arc;
use std::thread;

use crossbeam::channel::{self, Sender};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;

use crate::agent::{AgentRequest, UnregistrationAgent};
use crate::context::{Destructor, HandleContext};
use crate::error::RegistryError;
use crate::key::{HandleKey, KeyPart};

/// Callback receiving every failure from the asynchronous destruction path.
pub type ErrorSink<C, I> = Arc<dyn Fn(&RegistryError<C, I>) + Send + Sync>;

/// State shared between the public registry handle and the agent thread.
pub(crate) struct RegistryInner<C, I> {
    contexts: DashMap<HandleKey<C, I>, Arc<HandleContext<C, I>>>,
    /// Sender into the agent queue, for cascaded dependency releases.
    release_tx: Sender<AgentRequest<C, I>>,
    error_sink: Mutex<Option<ErrorSink<C, I>>>,
}

impl<C: KeyPart, I: KeyPart> RegistryInner<C, I> {
    fn lookup(&self, key: &HandleKey<C, I>) -> Option<Arc<HandleContext<C, I>>> {
        self.contexts.get(key).map(|entry| Arc::clone(entry.value()))
    }

    /// Ensure `key` is tracked and take one strong reference on it.
    ///
    /// The loop resolves the race against a concurrent destroyer of the same
    /// key. `DashMap::entry` fuses insert-if-absent with the lookup of an
    /// existing entry, so the "entry vanished between insert and lookup"
    /// case collapses into the next iteration seeing a vacancy.
    fn register_context(
        &self,
        key: &HandleKey<C, I>,
        destructor: Option<Destructor<I>>,
    ) -> Result<Arc<HandleContext<C, I>>, RegistryError<C, I>> {
        loop {
            let existing = match self.contexts.entry(key.clone()) {
                Entry::Vacant(slot) => {
                    let fresh = Arc::new(HandleContext::new(destructor));
                    slot.insert(Arc::clone(&fresh));
                    return Ok(fresh);
                }
                Entry::Occupied(slot) => Arc::clone(slot.get()),
            };

            let count = existing.add_ref();
            if count <= 0 {
                return Err(RegistryError::invalid_refcount(key, count));
            }
            if count == 1 {
                // Our increment revived a context whose destroyer already
                // committed to tearing it down: the zero it observed stands,
                // and it will unlink the entry shortly. The entry must not
                // be reused, so wait out the unlink and start over.
                self.wait_until_unlinked(key, &existing);
                continue;
            }
            // count >= 2: the context is live and now holds our reference.
            existing.set_destructor(destructor);
            return Ok(existing);
        }
    }

    /// Spin (with yields) until the destroyer removes this exact context
    /// instance from the map. Bounded by the destroyer's post-decrement
    /// removal step; the destroyer holds no lock this thread needs.
    fn wait_until_unlinked(&self, key: &HandleKey<C, I>, context: &Arc<HandleContext<C, I>>) {
        loop {
            let still_mapped = self
                .contexts
                .get(key)
                .map_or(false, |entry| Arc::ptr_eq(entry.value(), context));
            if !still_mapped {
                return;
            }
            thread::yield_now();
        }
    }

    /// Record a dependency edge from `parent` onto `dep`.
    ///
    /// Only a newly inserted edge pins the dependency with a reference;
    /// re-adding an existing edge is a no-op.
    fn link_dependency(
        &self,
        parent: &Arc<HandleContext<C, I>>,
        dep: &HandleKey<C, I>,
    ) -> Result<(), RegistryError<C, I>> {
        let dep_context = self
            .lookup(dep)
            .ok_or_else(|| RegistryError::not_found(dep))?;
        if parent.add_dependency(dep.clone()) {
            dep_context.add_ref();
        }
        Ok(())
    }

    /// Post a release request onto the agent queue.
    pub(crate) fn enqueue_release(&self, key: HandleKey<C, I>) {
        if let Err(rejected) = self.release_tx.send(AgentRequest::Release(key)) {
            if let AgentRequest::Release(key) = rejected.into_inner() {
                tracing::debug!(key = ?key, "release request dropped after agent shutdown");
            }
        }
    }

    /// Drop one reference to `key`; on zero, destroy it. Agent-only.
    ///
    /// Teardown order matters: the dependency edges are snapshotted before
    /// the destructor runs, so a failing destructor cannot leak the
    /// cascaded releases, and the map entry is removed last so the revival
    /// protocol in `register_context` stays sound.
    pub(crate) fn remove_and_destroy(
        &self,
        key: &HandleKey<C, I>,
    ) -> Result<(), RegistryError<C, I>> {
        let context = self
            .lookup(key)
            .ok_or_else(|| RegistryError::not_found(key))?;

        let count = context.release();
        if count > 0 {
            return Ok(());
        }
        if count < 0 {
            return Err(RegistryError::invalid_refcount(key, count));
        }

        // count == 0: this call owns the teardown.
        let dependencies = context.take_dependencies();

        if let Err(source) = context.run_destructor(&key.id) {
            self.report(&RegistryError::destructor_failure(key, source));
        }

        for dep in dependencies {
            self.enqueue_release(dep);
        }

        // Unlink only this exact instance. Until this step completes, a
        // racing registration of the same key is spinning in
        // `wait_until_unlinked`, so the entry cannot have been replaced.
        if self
            .contexts
            .remove_if(key, |_, ctx| Arc::ptr_eq(ctx, &context))
            .is_none()
        {
            return Err(RegistryError::failed_removal(key));
        }

        tracing::trace!(key = ?key, "destroyed handle");
        Ok(())
    }

    /// Deliver an asynchronous failure to the error sink, or swallow it
    /// when none is registered.
    pub(crate) fn report(&self, err: &RegistryError<C, I>) {
        let sink = self.error_sink.lock().clone();
        match sink {
            Some(sink) => sink(err),
            None => {
                tracing::debug!(error = %err, "asynchronous destruction error swallowed (no error sink)");
            }
        }
    }
}

/// Concurrent lifetime manager for externally owned handles.
///
/// Each registered handle carries a refcount, an optional destructor, and an
/// optional set of handles it depends on. Registering an already-tracked key
/// takes another reference on it; declaring a dependency pins the target.
/// Releases posted via [`unregister`](Self::unregister) are drained by a
/// dedicated agent thread, which runs destructors and cascades dependency
/// releases, so callers never block on teardown.
///
/// All methods take `&self`; share the registry across threads with `Arc`.
/// Dropping it stops the agent after draining the queue.
pub struct HandleRegistry<C, I> {
    inner: Arc<RegistryInner<C, I>>,
    agent: UnregistrationAgent<C, I>,
}

impl<C: KeyPart, I: KeyPart> HandleRegistry<C, I> {
    /// Create an empty registry and start its unregistration agent.
    pub fn new() -> Self {
        let (tx, rx) = channel::unbounded();
        let inner = Arc::new(RegistryInner {
            contexts: DashMap::new(),
            release_tx: tx.clone(),
            error_sink: Mutex::new(None),
        });
        let agent = UnregistrationAgent::start(Arc::clone(&inner), tx, rx);
        Self { inner, agent }
    }

    /// Install the callback that receives failures from the asynchronous
    /// destruction path. Replaces any previously installed sink.
    ///
    /// Without a sink such failures are dropped and destruction continues.
    pub fn set_error_sink(&self, sink: impl Fn(&RegistryError<C, I>) + Send + Sync + 'static) {
        *self.inner.error_sink.lock() = Some(Arc::new(sink));
    }

    /// Track `key`, taking one strong reference on it.
    ///
    /// If the key is new, a context is created with refcount 1 and the given
    /// destructor. If the key is already tracked, its refcount is raised and
    /// its destructor replaced by `destructor` (latest writer wins, even
    /// when passing `None`). A registration racing the destruction of the
    /// same key never reuses the dying context; it waits for the destroyer
    /// to unlink the entry and installs a fresh one.
    ///
    /// Every key in `dependencies` must already be registered; each newly
    /// recorded edge raises that dependency's refcount by 1. On
    /// [`RegistryError::ObjectNotFound`] for a dependency, the handle itself
    /// stays registered with the edges recorded so far; callers that treat
    /// that as fatal should `unregister` it.
    pub fn register(
        &self,
        key: HandleKey<C, I>,
        destructor: Option<Destructor<I>>,
        dependencies: Option<&[HandleKey<C, I>]>,
    ) -> Result<(), RegistryError<C, I>> {
        let context = self.inner.register_context(&key, destructor)?;
        if let Some(deps) = dependencies {
            for dep in deps {
                self.inner.link_dependency(&context, dep)?;
            }
        }
        tracing::trace!(key = ?key, "registered handle");
        Ok(())
    }

    /// Post the release of one reference to `key` and return immediately.
    ///
    /// No lookup happens here; releasing an unknown key surfaces as
    /// [`RegistryError::ObjectNotFound`] through the error sink when the
    /// agent drains the request. After [`stop_agent`](Self::stop_agent) the
    /// request is dropped.
    pub fn unregister(&self, key: HandleKey<C, I>) {
        self.inner.enqueue_release(key);
    }

    /// Record a dependency edge from `parent` onto `dep`, pinning `dep`.
    ///
    /// Fails with [`RegistryError::ObjectNotFound`] if either key is not
    /// tracked. Re-adding an existing edge is a no-op and does not touch
    /// `dep`'s refcount.
    pub fn add_dependency(
        &self,
        parent: &HandleKey<C, I>,
        dep: &HandleKey<C, I>,
    ) -> Result<(), RegistryError<C, I>> {
        let parent_context = self
            .inner
            .lookup(parent)
            .ok_or_else(|| RegistryError::not_found(parent))?;
        self.inner.link_dependency(&parent_context, dep)
    }

    /// Remove the dependency edge from `parent` onto `dep` and post the
    /// release of the reference that edge held.
    ///
    /// Fails with [`RegistryError::ObjectNotFound`] if `parent` is not
    /// tracked, or [`RegistryError::DependencyNotFound`] if no such edge was
    /// recorded.
    pub fn remove_dependency(
        &self,
        parent: &HandleKey<C, I>,
        dep: &HandleKey<C, I>,
    ) -> Result<(), RegistryError<C, I>> {
        let parent_context = self
            .inner
            .lookup(parent)
            .ok_or_else(|| RegistryError::not_found(parent))?;
        if !parent_context.remove_dependency(dep) {
            return Err(RegistryError::dependency_not_found(dep));
        }
        self.inner.enqueue_release(dep.clone());
        Ok(())
    }

    /// Block until every release posted so far, cascades included, has been
    /// processed. No-op once the agent is stopped.
    pub fn flush(&self) {
        self.agent.flush();
    }

    /// Stop the unregistration agent: drain queued releases, then join the
    /// consumer thread. Idempotent; after it returns no destructor will run
    /// again. The registry itself stays usable for registration.
    pub fn stop_agent(&self) {
        self.agent.stop();
    }

    /// Number of currently tracked handles.
    pub fn len(&self) -> usize {
        self.inner.contexts.len()
    }

    /// Whether no handle is currently tracked.
    pub fn is_empty(&self) -> bool {
        self.inner.contexts.is_empty()
    }

    /// Whether `key` is currently tracked.
    pub fn contains(&self, key: &HandleKey<C, I>) -> bool {
        self.inner.contexts.contains_key(key)
    }

    /// Current refcount of `key`, if tracked. Snapshot only; concurrent
    /// registrations and releases move it at any time.
    pub fn refcount(&self, key: &HandleKey<C, I>) -> Option<i64> {
        self.inner.lookup(key).map(|context| context.refcount())
    }
}

impl<C: KeyPart, I: KeyPart> Default for HandleRegistry<C, I> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    type TestRegistry = HandleRegistry<&'static str, u64>;

    fn key(id: u64) -> HandleKey<&'static str, u64> {
        HandleKey::new("F", id)
    }

    fn counting(counter: &Arc<AtomicUsize>) -> Destructor<u64> {
        let counter = Arc::clone(counter);
        Box::new(move |_id| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    fn collect_errors(registry: &TestRegistry) -> Arc<Mutex<Vec<String>>> {
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&errors);
        registry.set_error_sink(move |err| sink.lock().push(err.to_string()));
        errors
    }

    #[test]
    fn test_new_registry_is_empty() {
        let registry = TestRegistry::new();
        assert!(registry.is_empty());
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn test_register_tracks_handle_with_one_reference() {
        let registry = TestRegistry::new();
        registry.register(key(1), None, None).unwrap();

        assert!(registry.contains(&key(1)));
        assert_eq!(registry.refcount(&key(1)), Some(1));
    }

    #[test]
    fn test_reregister_takes_another_reference() {
        let registry = TestRegistry::new();
        registry.register(key(1), None, None).unwrap();
        registry.register(key(1), None, None).unwrap();

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.refcount(&key(1)), Some(2));
    }

    #[test]
    fn test_register_with_missing_dependency_fails() {
        let registry = TestRegistry::new();
        let err = registry
            .register(key(1), None, Some(&[key(2)]))
            .unwrap_err();

        assert!(matches!(
            err,
            RegistryError::ObjectNotFound { class: "F", id: 2 }
        ));
        // The handle itself was registered before the dependency lookup
        // failed; the caller decides whether to keep or release it.
        assert!(registry.contains(&key(1)));
    }

    #[test]
    fn test_register_dependencies_pin_targets() {
        let registry = TestRegistry::new();
        registry.register(key(2), None, None).unwrap();
        registry.register(key(3), None, None).unwrap();
        registry
            .register(key(1), None, Some(&[key(2), key(3)]))
            .unwrap();

        assert_eq!(registry.refcount(&key(1)), Some(1));
        assert_eq!(registry.refcount(&key(2)), Some(2));
        assert_eq!(registry.refcount(&key(3)), Some(2));
    }

    #[test]
    fn test_add_dependency_is_idempotent() {
        let registry = TestRegistry::new();
        registry.register(key(1), None, None).unwrap();
        registry.register(key(2), None, None).unwrap();

        registry.add_dependency(&key(1), &key(2)).unwrap();
        registry.add_dependency(&key(1), &key(2)).unwrap();

        assert_eq!(registry.refcount(&key(2)), Some(2));
    }

    #[test]
    fn test_add_dependency_requires_both_keys() {
        let registry = TestRegistry::new();
        registry.register(key(1), None, None).unwrap();

        let err = registry.add_dependency(&key(9), &key(1)).unwrap_err();
        assert!(matches!(
            err,
            RegistryError::ObjectNotFound { class: "F", id: 9 }
        ));

        let err = registry.add_dependency(&key(1), &key(9)).unwrap_err();
        assert!(matches!(
            err,
            RegistryError::ObjectNotFound { class: "F", id: 9 }
        ));
        assert_eq!(registry.refcount(&key(1)), Some(1));
    }

    #[test]
    fn test_remove_dependency_requires_recorded_edge() {
        let registry = TestRegistry::new();
        registry.register(key(1), None, None).unwrap();
        registry.register(key(2), None, None).unwrap();

        let err = registry.remove_dependency(&key(1), &key(2)).unwrap_err();
        assert!(matches!(
            err,
            RegistryError::DependencyNotFound { class: "F", id: 2 }
        ));

        let err = registry.remove_dependency(&key(9), &key(2)).unwrap_err();
        assert!(matches!(
            err,
            RegistryError::ObjectNotFound { class: "F", id: 9 }
        ));
    }

    #[test]
    fn test_remove_dependency_releases_pin() {
        let registry = TestRegistry::new();
        registry.register(key(2), None, None).unwrap();
        registry.register(key(1), None, Some(&[key(2)])).unwrap();
        assert_eq!(registry.refcount(&key(2)), Some(2));

        registry.remove_dependency(&key(1), &key(2)).unwrap();
        registry.flush();
        assert_eq!(registry.refcount(&key(2)), Some(1));
        assert!(registry.contains(&key(2)));
    }

    #[test]
    fn test_unregister_missing_key_reports_to_sink() {
        let registry = TestRegistry::new();
        let errors = collect_errors(&registry);

        registry.unregister(key(42));
        registry.flush();

        let errors = errors.lock();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("not found"));
    }

    #[test]
    fn test_unregister_missing_key_without_sink_is_swallowed() {
        let registry = TestRegistry::new();
        registry.unregister(key(42));
        registry.flush();
        assert!(registry.is_empty());
    }

    #[test]
    fn test_unregister_runs_destructor_on_last_release() {
        let registry = TestRegistry::new();
        let destroyed = Arc::new(AtomicUsize::new(0));

        registry
            .register(key(1), Some(counting(&destroyed)), None)
            .unwrap();
        registry
            .register(key(1), Some(counting(&destroyed)), None)
            .unwrap();

        registry.unregister(key(1));
        registry.flush();
        assert_eq!(destroyed.load(Ordering::SeqCst), 0);
        assert_eq!(registry.refcount(&key(1)), Some(1));

        registry.unregister(key(1));
        registry.flush();
        assert_eq!(destroyed.load(Ordering::SeqCst), 1);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_register_after_stop_still_works() {
        let registry = TestRegistry::new();
        registry.stop_agent();

        registry.register(key(1), None, None).unwrap();
        assert!(registry.contains(&key(1)));

        // Releases posted after shutdown are dropped, not executed.
        registry.unregister(key(1));
        registry.flush();
        assert!(registry.contains(&key(1)));
    }
}
