//! Notification registry for subscription set state changes.
//!
//! Registrations race with committing writers, so the registry keeps an
//! outstanding-requests gate: readers raise it before they inspect current
//! state, and writers wait for it to drain before snapshotting the pending
//! list. Promises are always resolved outside the lock.

use crate::error::{Result, StoreError};
use crate::types::SetState;
use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use std::time::Duration;
use tracing::trace;

/// A registered interest in a subscription set reaching a target state.
struct NotificationRequest {
    version: i64,
    notify_when: SetState,
    promise: Sender<Result<SetState>>,
}

#[derive(Default)]
struct RegistryInner {
    pending: Vec<NotificationRequest>,
    outstanding_requests: usize,
    min_outstanding_version: i64,
}

/// Pending promise list, outstanding-reader gate, and the supersession
/// watermark. One per store.
#[derive(Default)]
pub(crate) struct Registry {
    inner: Mutex<RegistryInner>,
    drained: Condvar,
}

impl Registry {
    /// Start a registration for `version`. Returns `false` if the version is
    /// already below the watermark, in which case nothing was registered and
    /// the caller should report `Superseded` directly. On `true`, the gate
    /// has been raised and the caller must hold an [`OutstandingGuard`]
    /// until it either enqueues a request or bails out.
    pub fn begin_request(&self, version: i64) -> bool {
        let mut inner = self.inner.lock();
        if version < inner.min_outstanding_version {
            return false;
        }
        inner.outstanding_requests += 1;
        true
    }

    fn end_request(&self) {
        let mut inner = self.inner.lock();
        inner.outstanding_requests -= 1;
        self.drained.notify_one();
    }

    /// Enqueue a request and hand back the listener side.
    pub fn enqueue(&self, version: i64, notify_when: SetState) -> StateChangeListener {
        let (promise, receiver) = bounded(1);
        let mut inner = self.inner.lock();
        inner.pending.push(NotificationRequest {
            version,
            notify_when,
            promise,
        });
        StateChangeListener { receiver }
    }

    /// The current supersession watermark.
    pub fn min_outstanding_version(&self) -> i64 {
        self.inner.lock().min_outstanding_version
    }

    /// Resolve every pending request satisfied by `version` having just
    /// committed in `new_state`. Called on the committing thread after the
    /// write is durable. If `new_state` is `Complete`, requests for earlier
    /// versions resolve as `Superseded` and the watermark advances.
    pub fn process_notifications(&self, version: i64, new_state: &SetState) {
        let is_error = matches!(new_state, SetState::Error(_));
        let is_complete = *new_state == SetState::Complete;

        let mut inner = self.inner.lock();
        while inner.outstanding_requests > 0 {
            self.drained.wait(&mut inner);
        }

        let mut to_finish = Vec::new();
        let mut keep = Vec::with_capacity(inner.pending.len());
        for req in inner.pending.drain(..) {
            let matches_self =
                req.version == version && (is_error || new_state.reached(&req.notify_when));
            let superseded = is_complete && req.version < version;
            if matches_self || superseded {
                to_finish.push(req);
            } else {
                keep.push(req);
            }
        }
        inner.pending = keep;

        if is_complete {
            inner.min_outstanding_version = version;
        }
        drop(inner);

        trace!(version, state = %new_state, resolved = to_finish.len(), "processed notifications");

        for req in to_finish {
            let result = if is_error && req.version == version {
                Err(StoreError::Runtime(
                    new_state.error_message().unwrap_or_default().to_owned(),
                ))
            } else if req.version < version {
                Ok(SetState::Superseded)
            } else {
                Ok(new_state.clone())
            };
            let _ = req.promise.send(result);
        }
    }

    /// Resolve every pending request except those for `keep_version` as
    /// `Superseded`, and advance the watermark to `keep_version`.
    pub fn supersede_all_except(&self, keep_version: i64) {
        let mut inner = self.inner.lock();
        while inner.outstanding_requests > 0 {
            self.drained.wait(&mut inner);
        }

        let mut to_finish = Vec::new();
        let mut keep = Vec::with_capacity(inner.pending.len());
        for req in inner.pending.drain(..) {
            if req.version != keep_version {
                to_finish.push(req);
            } else {
                keep.push(req);
            }
        }
        inner.pending = keep;

        debug_assert!(keep_version >= inner.min_outstanding_version);
        inner.min_outstanding_version = keep_version;
        drop(inner);

        for req in to_finish {
            let _ = req.promise.send(Ok(SetState::Superseded));
        }
    }

    /// Resolve everything still pending as `Superseded`. Called when the
    /// store shuts down so no listener blocks forever.
    pub fn shutdown(&self) {
        let to_finish = std::mem::take(&mut self.inner.lock().pending);
        for req in to_finish {
            let _ = req.promise.send(Ok(SetState::Superseded));
        }
    }
}

/// Keeps the outstanding-requests gate raised until the registration either
/// enqueued or bailed out, even on an error path.
pub(crate) struct OutstandingGuard<'a> {
    registry: &'a Registry,
}

impl<'a> OutstandingGuard<'a> {
    pub fn new(registry: &'a Registry) -> Self {
        Self { registry }
    }
}

impl Drop for OutstandingGuard<'_> {
    fn drop(&mut self) {
        self.registry.end_request();
    }
}

/// One-shot listener for a state change notification.
///
/// Resolves exactly once: with the observed state, with `Superseded` when a
/// later version completed first, or with [`StoreError::Runtime`] carrying
/// the set's error message.
pub struct StateChangeListener {
    receiver: Receiver<Result<SetState>>,
}

impl StateChangeListener {
    /// Build a listener that is already resolved.
    pub(crate) fn ready(result: Result<SetState>) -> Self {
        let (promise, receiver) = bounded(1);
        let _ = promise.send(result);
        Self { receiver }
    }

    /// Wait for the notification to resolve (blocking).
    pub fn recv(&self) -> Result<SetState> {
        self.receiver
            .recv()
            .map_err(|_| StoreError::BrokenPromise)?
    }

    /// Check for a resolution without blocking. `None` means not yet
    /// resolved.
    pub fn try_recv(&self) -> Option<Result<SetState>> {
        match self.receiver.try_recv() {
            Ok(result) => Some(result),
            Err(crossbeam_channel::TryRecvError::Empty) => None,
            Err(crossbeam_channel::TryRecvError::Disconnected) => {
                Some(Err(StoreError::BrokenPromise))
            }
        }
    }

    /// Wait with a timeout. `None` means the timeout elapsed first.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<Result<SetState>> {
        match self.receiver.recv_timeout(timeout) {
            Ok(result) => Some(result),
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => None,
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                Some(Err(StoreError::BrokenPromise))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_ready_listener_resolves_immediately() {
        let listener = StateChangeListener::ready(Ok(SetState::Complete));
        assert_eq!(listener.recv().unwrap(), SetState::Complete);
    }

    #[test]
    fn test_process_resolves_matching_version() {
        let registry = Registry::default();
        let listener = registry.enqueue(1, SetState::Complete);

        registry.process_notifications(1, &SetState::Complete);
        assert_eq!(listener.recv().unwrap(), SetState::Complete);
    }

    #[test]
    fn test_bootstrapping_satisfies_pending_target() {
        let registry = Registry::default();
        let listener = registry.enqueue(1, SetState::Pending);

        registry.process_notifications(1, &SetState::Bootstrapping);
        assert_eq!(listener.recv().unwrap(), SetState::Bootstrapping);
    }

    #[test]
    fn test_bootstrapping_does_not_satisfy_complete_target() {
        let registry = Registry::default();
        let listener = registry.enqueue(1, SetState::Complete);

        registry.process_notifications(1, &SetState::Bootstrapping);
        assert!(listener.try_recv().is_none());

        registry.process_notifications(1, &SetState::Complete);
        assert_eq!(listener.recv().unwrap(), SetState::Complete);
    }

    #[test]
    fn test_complete_supersedes_older_versions() {
        let registry = Registry::default();
        let old = registry.enqueue(1, SetState::Complete);
        let newer = registry.enqueue(3, SetState::Complete);

        registry.process_notifications(2, &SetState::Complete);
        assert_eq!(old.recv().unwrap(), SetState::Superseded);
        assert!(newer.try_recv().is_none());
        assert_eq!(registry.min_outstanding_version(), 2);
    }

    #[test]
    fn test_error_resolution_carries_message() {
        let registry = Registry::default();
        let listener = registry.enqueue(1, SetState::Complete);

        registry.process_notifications(1, &SetState::Error("boom".into()));
        match listener.recv() {
            Err(StoreError::Runtime(msg)) => assert_eq!(msg, "boom"),
            other => panic!("expected runtime error, got {:?}", other),
        }
    }

    #[test]
    fn test_begin_request_below_watermark() {
        let registry = Registry::default();
        registry.process_notifications(5, &SetState::Complete);

        assert!(!registry.begin_request(3));
        assert!(registry.begin_request(5));
        drop(OutstandingGuard::new(&registry));
    }

    #[test]
    fn test_writer_waits_for_outstanding_readers() {
        let registry = Arc::new(Registry::default());
        assert!(registry.begin_request(1));

        let writer = {
            let registry = Arc::clone(&registry);
            thread::spawn(move || {
                registry.process_notifications(1, &SetState::Complete);
            })
        };

        // The writer must block while the gate is raised.
        thread::sleep(Duration::from_millis(50));
        assert!(!writer.is_finished());

        let listener = registry.enqueue(1, SetState::Complete);
        drop(OutstandingGuard::new(&registry));

        writer.join().unwrap();
        assert_eq!(listener.recv().unwrap(), SetState::Complete);
    }

    #[test]
    fn test_supersede_all_except() {
        let registry = Registry::default();
        let keep = registry.enqueue(4, SetState::Complete);
        let drop_a = registry.enqueue(2, SetState::Complete);
        let drop_b = registry.enqueue(3, SetState::Bootstrapping);

        registry.supersede_all_except(4);
        assert_eq!(drop_a.recv().unwrap(), SetState::Superseded);
        assert_eq!(drop_b.recv().unwrap(), SetState::Superseded);
        assert!(keep.try_recv().is_none());
        assert_eq!(registry.min_outstanding_version(), 4);
    }

    #[test]
    fn test_shutdown_resolves_pending_as_superseded() {
        let registry = Registry::default();
        let listener = registry.enqueue(1, SetState::Complete);

        registry.shutdown();
        assert_eq!(listener.recv().unwrap(), SetState::Superseded);
    }
}
