use std::sync::{Arc, Mutex, MutexGuard};

use tracing::trace;

/// Shared ownership guard for per-connection state that is touched by I/O callbacks,
///  timer callbacks and application tasks concurrently.
///
/// The guard combines two things:
/// * a mutex around the guarded state - all reads and writes go through [LifetimeGuard::with],
///   so no two tasks mutate the state concurrently
/// * a holder count - the transport object itself, every in-flight callback task and every
///   armed timer holds a [GuardToken]. The state is torn down (buffers dropped, socket
///   handle invalidated) only when the count reaches zero, so a callback that is already
///   running never observes freed state. After teardown, [LifetimeGuard::with] returns
///  `None` and late callbacks degrade to no-ops.
///
/// Tokens are deliberately not generic over the guarded type so that helper machinery
///  (e.g. timers) can hold them without knowing what they keep alive.
pub struct LifetimeGuard<T> {
    counter: Arc<HolderCounter>,
    slot: Arc<Mutex<Option<T>>>,
}

impl<T> Clone for LifetimeGuard<T> {
    fn clone(&self) -> Self {
        LifetimeGuard {
            counter: self.counter.clone(),
            slot: self.slot.clone(),
        }
    }
}

struct HolderCounter {
    holders: Mutex<usize>,
    teardown: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

fn lock_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl<T: Send + 'static> LifetimeGuard<T> {
    pub fn new(state: T) -> LifetimeGuard<T> {
        let slot = Arc::new(Mutex::new(Some(state)));

        let teardown_slot = slot.clone();
        let teardown = Box::new(move || {
            trace!("lifetime guard: holder count reached zero - tearing down");
            lock_recover(&teardown_slot).take();
        });

        LifetimeGuard {
            counter: Arc::new(HolderCounter {
                holders: Mutex::new(0),
                teardown: Mutex::new(Some(teardown)),
            }),
            slot,
        }
    }

    /// Registers a new holder. The returned token must be held for the whole duration of
    ///  the asynchronous work that references the guarded state - moving it into the
    ///  spawned task guarantees release on all exit paths, including abort.
    pub fn acquire(&self) -> GuardToken {
        let mut holders = lock_recover(&self.counter.holders);
        *holders += 1;
        GuardToken {
            counter: self.counter.clone(),
        }
    }

    /// Runs `f` with exclusive access to the guarded state, or returns `None` if the
    ///  state was already torn down.
    ///
    /// NB: `f` runs under the guard's lock - it must not block, and callers must not
    ///      drop a [GuardToken] from inside it.
    pub fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        lock_recover(&self.slot).as_mut().map(f)
    }

    pub fn holder_count(&self) -> usize {
        *lock_recover(&self.counter.holders)
    }

    pub fn is_torn_down(&self) -> bool {
        lock_recover(&self.slot).is_none()
    }
}

/// RAII holder registration handed out by [LifetimeGuard::acquire]. Dropping the last
///  token triggers teardown of the guarded state.
pub struct GuardToken {
    counter: Arc<HolderCounter>,
}

impl Clone for GuardToken {
    fn clone(&self) -> Self {
        let mut holders = lock_recover(&self.counter.holders);
        *holders += 1;
        GuardToken {
            counter: self.counter.clone(),
        }
    }
}

impl Drop for GuardToken {
    fn drop(&mut self) {
        let mut holders = lock_recover(&self.counter.holders);
        *holders -= 1;
        if *holders == 0 {
            // teardown runs under the holder lock so a racing acquire() cannot observe
            //  partially torn down state; the teardown closure only locks the slot
            if let Some(teardown) = lock_recover(&self.counter.teardown).take() {
                teardown();
            }
        }
    }
}
