//! Completion primitives for cross-context results.
//!
//! Both types are handles: cloning shares the underlying slot. Callbacks run
//! on the thread that calls `complete`, which for manager results is always
//! the state context.

use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

type Callback<T> = Box<dyn FnOnce(&T) + Send>;

enum Slot<T> {
    Pending(Vec<Callback<T>>),
    Done(T),
}

struct Inner<T> {
    slot: Mutex<Slot<T>>,
    ready: Condvar,
}

/// A single-shot result slot.
///
/// The first `complete` wins; later completions are ignored. Waiters observe
/// the value by callback or by blocking.
pub struct Completable<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Completable<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone + Send + 'static> Completable<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                slot: Mutex::new(Slot::Pending(Vec::new())),
                ready: Condvar::new(),
            }),
        }
    }

    pub fn completed(value: T) -> Self {
        let this = Self::new();
        this.complete(value);
        this
    }

    /// Resolves the slot. Returns false if it was already resolved.
    pub fn complete(&self, value: T) -> bool {
        let callbacks = {
            let mut slot = self.inner.slot.lock().unwrap_or_else(|e| e.into_inner());
            match &mut *slot {
                Slot::Done(_) => return false,
                Slot::Pending(callbacks) => {
                    let callbacks = std::mem::take(callbacks);
                    *slot = Slot::Done(value.clone());
                    callbacks
                }
            }
        };
        self.inner.ready.notify_all();
        for callback in callbacks {
            callback(&value);
        }
        true
    }

    /// Registers a callback, invoked immediately if already resolved.
    pub fn when_complete(&self, f: impl FnOnce(&T) + Send + 'static) {
        let value = {
            let mut slot = self.inner.slot.lock().unwrap_or_else(|e| e.into_inner());
            match &mut *slot {
                Slot::Pending(callbacks) => {
                    callbacks.push(Box::new(f));
                    return;
                }
                Slot::Done(value) => value.clone(),
            }
        };
        f(&value);
    }

    pub fn is_complete(&self) -> bool {
        matches!(
            &*self.inner.slot.lock().unwrap_or_else(|e| e.into_inner()),
            Slot::Done(_)
        )
    }

    pub fn peek(&self) -> Option<T> {
        match &*self.inner.slot.lock().unwrap_or_else(|e| e.into_inner()) {
            Slot::Done(value) => Some(value.clone()),
            Slot::Pending(_) => None,
        }
    }

    /// Blocks until resolved or the deadline passes.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.inner.slot.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            if let Slot::Done(value) = &*slot {
                return Some(value.clone());
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, _) = self
                .inner
                .ready
                .wait_timeout(slot, deadline - now)
                .unwrap_or_else(|e| e.into_inner());
            slot = guard;
        }
    }
}

impl<T: Clone + Send + 'static> Default for Completable<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// A completion slot whose callbacks are guaranteed to run in registration
/// order.
///
/// The compaction pipeline relies on this: retries queued against the
/// compaction future must fire in the order they were queued. Completing an
/// already-complete slot is a no-op, which lets the compaction path resolve
/// unconditionally.
pub struct OrderedCompletion<T> {
    inner: Completable<T>,
}

impl<T> Clone for OrderedCompletion<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone + Send + 'static> OrderedCompletion<T> {
    pub fn new() -> Self {
        Self {
            inner: Completable::new(),
        }
    }

    pub fn completed(value: T) -> Self {
        Self {
            inner: Completable::completed(value),
        }
    }

    /// Callbacks registered before completion run strictly in insertion
    /// order; callbacks registered after completion run inline.
    pub fn when_complete(&self, f: impl FnOnce(&T) + Send + 'static) {
        self.inner.when_complete(f);
    }

    pub fn complete(&self, value: T) {
        self.inner.complete(value);
    }

    pub fn is_complete(&self) -> bool {
        self.inner.is_complete()
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Option<T> {
        self.inner.wait_timeout(timeout)
    }
}

impl<T: Clone + Send + 'static> Default for OrderedCompletion<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn first_completion_wins() {
        let slot = Completable::new();
        assert!(slot.complete(1));
        assert!(!slot.complete(2));
        assert_eq!(slot.peek(), Some(1));
    }

    #[test]
    fn callbacks_run_in_registration_order() {
        let slot = OrderedCompletion::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for i in 0..8 {
            let seen = Arc::clone(&seen);
            slot.when_complete(move |_: &()| seen.lock().unwrap().push(i));
        }
        slot.complete(());
        assert_eq!(*seen.lock().unwrap(), (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn late_callback_runs_inline() {
        let slot = Completable::completed(7u64);
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        slot.when_complete(move |v| {
            assert_eq!(*v, 7);
            h.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn wait_times_out_when_pending() {
        let slot: Completable<u32> = Completable::new();
        assert_eq!(slot.wait_timeout(Duration::from_millis(10)), None);
        slot.complete(3);
        assert_eq!(slot.wait_timeout(Duration::from_millis(10)), Some(3));
    }

    #[test]
    fn wait_wakes_on_cross_thread_completion() {
        let slot: Completable<u32> = Completable::new();
        let remote = slot.clone();
        let join = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            remote.complete(9);
        });
        assert_eq!(slot.wait_timeout(Duration::from_secs(5)), Some(9));
        join.join().unwrap();
    }
}
