//! Ordered, cancelable multicast of events to listeners.
//!
//! [`Listeners`] is shared between the caller registering listeners and the
//! background reader that notifies them. Visiting takes a snapshot first, so
//! listeners can add or cancel registrations (including their own) from
//! inside a callback without deadlocking.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use rtmessage_proto::Message;

use crate::error::Error;

/// Receives every message not claimed by a request callback.
pub trait MessageListener: Send + Sync {
    /// Called on the reader task, in wire order.
    fn on_message(&self, msg: &Message);
}

impl<F: Fn(&Message) + Send + Sync> MessageListener for F {
    fn on_message(&self, msg: &Message) {
        self(msg);
    }
}

/// Receives the error that stopped the background reader.
pub trait ReadErrorListener: Send + Sync {
    /// Called on the reader task just before the connection is torn down.
    fn on_read_error(&self, err: &Error);
}

impl<F: Fn(&Error) + Send + Sync> ReadErrorListener for F {
    fn on_read_error(&self, err: &Error) {
        self(err);
    }
}

/// Registered listeners and the id handed to the next one.
struct Registry<L: ?Sized> {
    /// Id assigned to the next registration.
    next_id: u64,
    /// Live registrations in the order they were added.
    entries: Vec<(u64, Arc<L>)>,
}

/// A thread-safe, ordered set of listeners of one kind.
pub struct Listeners<L: ?Sized> {
    /// Shared registry; cancel handles hold a weak reference to it.
    inner: Arc<Mutex<Registry<L>>>,
}

impl<L: ?Sized + Send + Sync + 'static> Listeners<L> {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Registry {
                next_id: 0,
                entries: Vec::new(),
            })),
        }
    }

    /// Registers `listener` after all existing ones.
    ///
    /// The returned handle removes exactly this registration.
    pub fn add(&self, listener: Arc<L>) -> CancelListener {
        let id = {
            let mut reg = lock(&self.inner);
            let id = reg.next_id;
            reg.next_id += 1;
            reg.entries.push((id, listener));
            id
        };
        let weak: Weak<Mutex<Registry<L>>> = Arc::downgrade(&self.inner);
        CancelListener {
            remove: Arc::new(move || {
                if let Some(inner) = weak.upgrade() {
                    lock(&inner).entries.retain(|(i, _)| *i != id);
                }
            }),
        }
    }

    /// Calls `f` once per listener registered when the visit started, in
    /// registration order.
    pub fn visit(&self, mut f: impl FnMut(&L)) {
        let snapshot: Vec<Arc<L>> = lock(&self.inner)
            .entries
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in &snapshot {
            f(listener);
        }
    }

    /// Number of live registrations.
    pub fn len(&self) -> usize {
        lock(&self.inner).entries.len()
    }

    /// Returns `true` if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<L: ?Sized + Send + Sync + 'static> Default for Listeners<L> {
    fn default() -> Self {
        Self::new()
    }
}

impl<L: ?Sized> fmt::Debug for Listeners<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listeners")
            .field("len", &lock(&self.inner).entries.len())
            .finish()
    }
}

/// Handle that unregisters one listener.
///
/// Cancelling is idempotent, and cancelling after the owning [`Listeners`]
/// (or its connection) is gone does nothing. Dropping the handle leaves the
/// listener registered.
#[derive(Clone)]
pub struct CancelListener {
    /// Removes the registration if the registry still exists.
    remove: Arc<dyn Fn() + Send + Sync>,
}

impl CancelListener {
    /// Removes the listener so it receives no further events.
    pub fn cancel(&self) {
        (self.remove)();
    }
}

impl fmt::Debug for CancelListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelListener").finish_non_exhaustive()
    }
}

/// Locks `m`, recovering the data if a listener panicked while it was held.
fn lock<T: ?Sized>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}
