//! Consumer lifetimes.
//!
//! A [`Context`] stands for "the thing that asked": a UI element, a session,
//! a task. Calls and subscriptions hold a [`WeakContext`] and check it before
//! delivering anything, so results never reach a consumer that is gone.
//! Dropping the last clone of a `Context` runs its destroy callbacks, which is
//! how subscriptions tied to it get released.

use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of a context, stable for its whole lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(u64);

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx#{}", self.0)
    }
}

type DestroyCallback = Box<dyn FnOnce(ContextId) + Send>;

struct ContextInner {
    id: ContextId,
    on_destroyed: Mutex<Vec<DestroyCallback>>,
}

impl Drop for ContextInner {
    fn drop(&mut self) {
        let callbacks = std::mem::take(self.on_destroyed.get_mut());
        for callback in callbacks {
            callback(self.id);
        }
    }
}

/// A consumer lifetime. Cheap to clone; destroyed when the last clone drops.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

impl Context {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ContextInner {
                id: ContextId(NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed)),
                on_destroyed: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn id(&self) -> ContextId {
        self.inner.id
    }

    pub fn downgrade(&self) -> WeakContext {
        WeakContext {
            id: self.inner.id,
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Register a callback to run when the context is destroyed.
    pub fn on_destroyed(&self, callback: impl FnOnce(ContextId) + Send + 'static) {
        self.inner.on_destroyed.lock().push(Box::new(callback));
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Context").field(&self.inner.id).finish()
    }
}

/// Non-owning handle to a [`Context`].
#[derive(Clone)]
pub struct WeakContext {
    id: ContextId,
    inner: Weak<ContextInner>,
}

impl WeakContext {
    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn upgrade(&self) -> Option<Context> {
        self.inner.upgrade().map(|inner| Context { inner })
    }

    pub fn is_alive(&self) -> bool {
        self.inner.strong_count() > 0
    }
}

impl fmt::Debug for WeakContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakContext")
            .field("id", &self.id)
            .field("alive", &self.is_alive())
            .finish()
    }
}
