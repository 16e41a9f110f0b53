//! Broadcast dispatch: every live subscriber sees the same parameters.
//!
//! The subscriber list is an immutable `Arc<Vec<_>>` that is replaced as a
//! whole on registration (copy and publish). A `run` clones the current `Arc`
//! and iterates that snapshot, so it never holds a lock while subscribers
//! execute and it never observes entries registered after it started.
//!
//! Removal is lazy. A subscriber that returns the sentinel or an error has its
//! entry flagged in place; flagged entries are skipped by every later `run`
//! and physically dropped by [`SequentialCallbackManager::trim`].
//!
//! ```text
//!   register ──► copy list ──► push ──► publish new Arc
//!   run      ──► clone Arc ──► invoke live entries in order ──► flag removals
//!   trim     ──► copy list ──► drop flagged ──► publish new Arc
//! ```

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tracing::trace;

use crate::error::CallbackResult;

type Callback<P> = Box<dyn Fn(&P) -> CallbackResult + Send + Sync>;

struct Entry<P: ?Sized> {
    callback: Callback<P>,
    pending_removal: AtomicBool,
}

impl<P: ?Sized> Entry<P> {
    fn is_live(&self) -> bool {
        !self.pending_removal.load(Ordering::Acquire)
    }

    /// Returns true for the caller that actually flipped the flag.
    fn mark_removed(&self) -> bool {
        !self.pending_removal.swap(true, Ordering::AcqRel)
    }
}

struct Inner<P: ?Sized> {
    entries: RwLock<Arc<Vec<Arc<Entry<P>>>>>,
    // Serializes writers so that two copy-and-publish cycles never race.
    writer: Mutex<()>,
    pending: AtomicUsize,
    reverse: AtomicBool,
}

/// Sequential callback manager.
///
/// Cloning yields another handle to the same registry.
pub struct SequentialCallbackManager<P: ?Sized> {
    inner: Arc<Inner<P>>,
}

impl<P: ?Sized> Clone for SequentialCallbackManager<P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<P: ?Sized> std::fmt::Debug for SequentialCallbackManager<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SequentialCallbackManager")
            .field("live", &self.len())
            .field("reverse", &self.is_reversed())
            .finish()
    }
}

impl<P: ?Sized> Default for SequentialCallbackManager<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: ?Sized> SequentialCallbackManager<P> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                entries: RwLock::new(Arc::new(Vec::new())),
                writer: Mutex::new(()),
                pending: AtomicUsize::new(0),
                reverse: AtomicBool::new(false),
            }),
        }
    }

    /// Dispatch in reverse registration order. Call before first use.
    pub fn reverse(self) -> Self {
        self.inner.reverse.store(true, Ordering::Release);
        self
    }

    pub fn is_reversed(&self) -> bool {
        self.inner.reverse.load(Ordering::Acquire)
    }

    /// Register a subscriber.
    ///
    /// Safe to call from inside a running subscriber; the new entry is first
    /// visited by the next `run`.
    pub fn register<F>(&self, callback: F)
    where
        F: Fn(&P) -> CallbackResult + Send + Sync + 'static,
    {
        let entry = Arc::new(Entry {
            callback: Box::new(callback),
            pending_removal: AtomicBool::new(false),
        });

        let _writer = self.inner.writer.lock();
        let current = self.snapshot();

        let mut next = Vec::with_capacity(current.len() + 1);
        if self.is_reversed() {
            next.push(entry);
            next.extend(current.iter().cloned());
        } else {
            next.extend(current.iter().cloned());
            next.push(entry);
        }

        *self.inner.entries.write() = Arc::new(next);
    }

    /// Invoke every live subscriber with `params`.
    ///
    /// Returns the errors of subscribers that failed during this pass; the
    /// sentinel is never reported.
    pub fn run(&self, params: &P) -> Vec<anyhow::Error> {
        let snapshot = self.snapshot();
        let mut errors = Vec::new();

        for entry in snapshot.iter() {
            if !entry.is_live() {
                continue;
            }

            if let Err(err) = (entry.callback)(params) {
                if entry.mark_removed() {
                    self.inner.pending.fetch_add(1, Ordering::AcqRel);
                }

                match err.into_reportable() {
                    Some(err) => {
                        trace!("Removing failed subscriber: {}", err);
                        errors.push(err);
                    }
                    None => trace!("Subscriber deregistered"),
                }
            }
        }

        errors
    }

    /// Physically drop entries flagged for removal.
    ///
    /// Does nothing when no removal happened since the last trim.
    pub fn trim(&self) {
        if self.inner.pending.load(Ordering::Acquire) == 0 {
            return;
        }

        let _writer = self.inner.writer.lock();
        let removed = self.inner.pending.swap(0, Ordering::AcqRel);
        if removed == 0 {
            return;
        }

        let current = self.snapshot();
        let next: Vec<_> = current.iter().filter(|e| e.is_live()).cloned().collect();
        trace!("Trimmed {} subscriber entries", current.len() - next.len());

        *self.inner.entries.write() = Arc::new(next);
    }

    /// Number of live subscribers.
    pub fn len(&self) -> usize {
        self.snapshot().iter().filter(|e| e.is_live()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A handle that does not keep the registry alive.
    ///
    /// Subscribers that register further subscribers on their own registry
    /// should capture this instead of a strong handle.
    pub fn downgrade(&self) -> WeakSequentialCallbackManager<P> {
        WeakSequentialCallbackManager {
            inner: Arc::downgrade(&self.inner),
        }
    }

    #[cfg(test)]
    fn stored(&self) -> usize {
        self.snapshot().len()
    }

    fn snapshot(&self) -> Arc<Vec<Arc<Entry<P>>>> {
        Arc::clone(&self.inner.entries.read())
    }
}

pub struct WeakSequentialCallbackManager<P: ?Sized> {
    inner: Weak<Inner<P>>,
}

impl<P: ?Sized> Clone for WeakSequentialCallbackManager<P> {
    fn clone(&self) -> Self {
        Self {
            inner: Weak::clone(&self.inner),
        }
    }
}

impl<P: ?Sized> WeakSequentialCallbackManager<P> {
    pub fn upgrade(&self) -> Option<SequentialCallbackManager<P>> {
        self.inner
            .upgrade()
            .map(|inner| SequentialCallbackManager { inner })
    }
}
