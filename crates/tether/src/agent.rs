//! Single-consumer agent thread that drains release requests.
//!
//! `unregister` must never block the caller on teardown work: destructors
//! can be expensive, can call back into the foreign library, and can
//! trigger further releases. All of that runs here, on one dedicated
//! thread, which also gives every destruction a single serialized order.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;

use crate::key::{HandleKey, KeyPart};
use crate::registry::RegistryInner;

/// Work items accepted by the agent queue.
pub(crate) enum AgentRequest<C, I> {
    /// Drop one reference to the key; destroy it if that was the last one.
    Release(HandleKey<C, I>),
    /// Queue-position barrier: acknowledged when every request enqueued
    /// before it has been processed.
    Flush(Sender<()>),
    /// Drain whatever is queued, then exit the consumer.
    Stop,
}

/// Handle to the consumer thread.
///
/// The consumer owns the receiving side of the queue and calls back into
/// [`RegistryInner::remove_and_destroy`] for every release. Errors go to
/// the registry's error sink; an individual failure never kills the
/// consumer.
pub(crate) struct UnregistrationAgent<C, I> {
    tx: Sender<AgentRequest<C, I>>,
    consumer: Mutex<Option<JoinHandle<()>>>,
}

impl<C: KeyPart, I: KeyPart> UnregistrationAgent<C, I> {
    /// Spawn the consumer thread over an already-created channel pair.
    ///
    /// The sender half is also held by `inner` so that teardown can enqueue
    /// cascaded dependency releases.
    pub(crate) fn start(
        inner: Arc<RegistryInner<C, I>>,
        tx: Sender<AgentRequest<C, I>>,
        rx: Receiver<AgentRequest<C, I>>,
    ) -> Self {
        let consumer = thread::Builder::new()
            .name("tether-unregister".to_string())
            .spawn(move || Self::run_loop(inner, rx))
            .expect("failed to spawn unregistration agent thread");

        Self {
            tx,
            consumer: Mutex::new(Some(consumer)),
        }
    }

    fn run_loop(inner: Arc<RegistryInner<C, I>>, rx: Receiver<AgentRequest<C, I>>) {
        tracing::debug!("unregistration agent started");

        loop {
            match rx.recv() {
                Ok(AgentRequest::Release(key)) => Self::process_release(&inner, key),
                Ok(AgentRequest::Flush(ack)) => {
                    let _ = ack.send(());
                }
                Ok(AgentRequest::Stop) | Err(_) => break,
            }
        }

        // Drain-then-exit: releases already queued still run, including
        // cascades enqueued behind the stop token while draining.
        // Abandoning them would leak live foreign resources.
        while let Ok(request) = rx.try_recv() {
            match request {
                AgentRequest::Release(key) => Self::process_release(&inner, key),
                AgentRequest::Flush(ack) => {
                    let _ = ack.send(());
                }
                AgentRequest::Stop => {}
            }
        }

        tracing::debug!("unregistration agent stopped");
    }

    fn process_release(inner: &Arc<RegistryInner<C, I>>, key: HandleKey<C, I>) {
        if let Err(err) = inner.remove_and_destroy(&key) {
            inner.report(&err);
        }
    }
}

impl<C, I> UnregistrationAgent<C, I> {
    /// Block until every release enqueued so far, including cascaded
    /// dependency releases, has been processed.
    ///
    /// A single barrier is not enough: processing a release can enqueue the
    /// releases of its dependencies behind the barrier. Loop until an
    /// acknowledged barrier observes an empty queue; for an acyclic
    /// dependency graph this terminates. Returns immediately once the agent
    /// has stopped.
    pub(crate) fn flush(&self) {
        loop {
            let (ack_tx, ack_rx) = channel::bounded(1);
            if self.tx.send(AgentRequest::Flush(ack_tx)).is_err() {
                return;
            }
            if ack_rx.recv().is_err() {
                return;
            }
            if self.tx.len() == 0 {
                return;
            }
        }
    }

    /// Stop the consumer: drain queued requests, then join the thread.
    ///
    /// Idempotent. Every caller returns only after the consumer has exited,
    /// so no destructor runs after `stop` returns. The handle mutex is held
    /// across the join to serialize concurrent stoppers.
    pub(crate) fn stop(&self) {
        let mut consumer = self.consumer.lock();
        if let Some(handle) = consumer.take() {
            let _ = self.tx.send(AgentRequest::Stop);
            if handle.join().is_err() {
                tracing::error!("unregistration agent thread panicked");
            }
        }
    }
}

impl<C, I> Drop for UnregistrationAgent<C, I> {
    fn drop(&mut self) {
        self.stop();
    }
}
