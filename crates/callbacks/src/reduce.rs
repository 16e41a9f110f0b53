//! Pipeline dispatch: a value is threaded through every live subscriber.
//!
//! Registration, iteration and pruning share one reentrant lock, so a `run`
//! sees a stable subscriber list and prunes removed subscribers before
//! anyone else can observe it. The lock is reentrant so that a subscriber may
//! register further subscribers on the same manager from inside a `run`;
//! those are queued behind the current pass and first visited by the next one.

use std::cell::RefCell;
use std::sync::{Arc, Weak};

use parking_lot::ReentrantMutex;
use tracing::{trace, warn};

use crate::error::CallbackError;

type Callback<V, P> = Arc<dyn Fn(&V, &P) -> Result<V, CallbackError> + Send + Sync>;

struct State<V, P: ?Sized> {
    callbacks: Vec<Callback<V, P>>,
    running: bool,
}

struct Inner<V, P: ?Sized> {
    state: ReentrantMutex<RefCell<State<V, P>>>,
    reverse: bool,
}

/// Clears the running flag when a pass ends, including by panic.
struct RunningGuard<'a, V, P: ?Sized> {
    state: &'a RefCell<State<V, P>>,
}

impl<V, P: ?Sized> Drop for RunningGuard<'_, V, P> {
    fn drop(&mut self) {
        self.state.borrow_mut().running = false;
    }
}

/// Reduce callback manager.
///
/// Each subscriber receives the current accumulator and returns the next one.
/// On the sentinel or an error the accumulator is left as it was.
pub struct ReduceCallbackManager<V, P: ?Sized> {
    inner: Arc<Inner<V, P>>,
}

impl<V, P: ?Sized> Clone for ReduceCallbackManager<V, P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V, P: ?Sized> std::fmt::Debug for ReduceCallbackManager<V, P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReduceCallbackManager")
            .field("live", &self.len())
            .field("reverse", &self.inner.reverse)
            .finish()
    }
}

impl<V, P: ?Sized> Default for ReduceCallbackManager<V, P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V, P: ?Sized> ReduceCallbackManager<V, P> {
    pub fn new() -> Self {
        Self::with_order(false)
    }

    /// A manager that dispatches in reverse registration order.
    pub fn reversed() -> Self {
        Self::with_order(true)
    }

    fn with_order(reverse: bool) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: ReentrantMutex::new(RefCell::new(State {
                    callbacks: Vec::new(),
                    running: false,
                })),
                reverse,
            }),
        }
    }

    pub fn is_reversed(&self) -> bool {
        self.inner.reverse
    }

    pub fn register<F>(&self, callback: F)
    where
        F: Fn(&V, &P) -> Result<V, CallbackError> + Send + Sync + 'static,
    {
        let guard = self.inner.state.lock();
        let mut state = guard.borrow_mut();

        let callback: Callback<V, P> = Arc::new(callback);
        if self.inner.reverse {
            state.callbacks.insert(0, callback);
        } else {
            state.callbacks.push(callback);
        }
    }

    /// Fold `initial` through every subscriber.
    ///
    /// Returns the final value and the errors of subscribers that failed.
    /// Failed and deregistered subscribers are pruned before this returns.
    pub fn run(&self, initial: V, params: &P) -> (V, Vec<anyhow::Error>) {
        let guard = self.inner.state.lock();

        let snapshot = {
            let mut state = guard.borrow_mut();
            if state.running {
                warn!("Reentrant run on a reduce callback manager ignored");
                return (
                    initial,
                    vec![anyhow::anyhow!("reduce callback manager is already running")],
                );
            }
            state.running = true;
            state.callbacks.clone()
        };
        let _running = RunningGuard { state: &*guard };

        let mut value = initial;
        let mut errors = Vec::new();
        let mut survivors = Vec::with_capacity(snapshot.len());

        for callback in &snapshot {
            match callback(&value, params) {
                Ok(next) => {
                    value = next;
                    survivors.push(Arc::clone(callback));
                }
                Err(err) => match err.into_reportable() {
                    Some(err) => {
                        trace!("Removing failed reduce subscriber: {}", err);
                        errors.push(err);
                    }
                    None => trace!("Reduce subscriber deregistered"),
                },
            }
        }

        let mut state = guard.borrow_mut();

        // Anything beyond the snapshot was registered by a subscriber during
        // this pass and sits at the end (or the front, when reversed).
        let added = state.callbacks.len() - snapshot.len();
        let mut rebuilt = Vec::with_capacity(survivors.len() + added);
        if self.inner.reverse {
            rebuilt.extend(state.callbacks.drain(..added));
            rebuilt.append(&mut survivors);
        } else {
            let fresh = state.callbacks.split_off(snapshot.len());
            rebuilt.append(&mut survivors);
            rebuilt.extend(fresh);
        }
        state.callbacks = rebuilt;
        drop(state);

        (value, errors)
    }

    /// Like [`run`](Self::run) but discards errors.
    pub fn must_run(&self, initial: V, params: &P) -> V {
        self.run(initial, params).0
    }

    pub fn len(&self) -> usize {
        self.inner.state.lock().borrow().callbacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn downgrade(&self) -> WeakReduceCallbackManager<V, P> {
        WeakReduceCallbackManager {
            inner: Arc::downgrade(&self.inner),
        }
    }
}

pub struct WeakReduceCallbackManager<V, P: ?Sized> {
    inner: Weak<Inner<V, P>>,
}

impl<V, P: ?Sized> Clone for WeakReduceCallbackManager<V, P> {
    fn clone(&self) -> Self {
        Self {
            inner: Weak::clone(&self.inner),
        }
    }
}

impl<V, P: ?Sized> WeakReduceCallbackManager<V, P> {
    pub fn upgrade(&self) -> Option<ReduceCallbackManager<V, P>> {
        self.inner.upgrade().map(|inner| ReduceCallbackManager { inner })
    }
}
