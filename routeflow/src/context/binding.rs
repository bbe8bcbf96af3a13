//! Thread-scoped context bindings.
//!
//! Values live in a per-thread map keyed by name. A [`ContextKey`] binds a
//! value for the dynamic extent of a closure; a [`ContextCell`] is a mutable
//! slot that stays bound until removed. Both share the same per-thread map,
//! so at most one value per name is active on a thread at any time.

use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

pub(crate) type BoundValue = Arc<dyn Any + Send + Sync>;

thread_local! {
    static BINDINGS: RefCell<HashMap<&'static str, BoundValue>> = RefCell::new(HashMap::new());
}

pub(crate) fn get_raw(name: &'static str) -> Option<BoundValue> {
    BINDINGS.with(|b| b.borrow().get(name).cloned())
}

pub(crate) fn replace_raw(name: &'static str, value: Option<BoundValue>) -> Option<BoundValue> {
    BINDINGS.with(|b| {
        let mut map = b.borrow_mut();
        match value {
            Some(v) => map.insert(name, v),
            None => map.remove(name),
        }
    })
}

pub(crate) fn snapshot_raw() -> HashMap<&'static str, BoundValue> {
    BINDINGS.with(|b| b.borrow().clone())
}

pub(crate) fn swap_all(values: HashMap<&'static str, BoundValue>) -> HashMap<&'static str, BoundValue> {
    BINDINGS.with(|b| std::mem::replace(&mut *b.borrow_mut(), values))
}

/// Restores a single binding when dropped, including during unwinding.
struct RestoreGuard {
    name: &'static str,
    previous: Option<BoundValue>,
}

impl Drop for RestoreGuard {
    fn drop(&mut self) {
        replace_raw(self.name, self.previous.take());
    }
}

/// A named, typed key for a scoped binding.
///
/// ```rust
/// use routeflow::context::ContextKey;
///
/// static ROUTE: ContextKey<String> = ContextKey::new("route");
///
/// let seen = ROUTE.bind("R1".to_string(), || ROUTE.get());
/// assert_eq!(seen.as_deref(), Some("R1"));
/// assert!(ROUTE.get().is_none());
/// ```
pub struct ContextKey<T> {
    name: &'static str,
    _marker: PhantomData<fn() -> T>,
}

impl<T> ContextKey<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Creates a key with the given name.
    #[must_use]
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            _marker: PhantomData,
        }
    }

    /// Returns the key name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Runs `body` with this key resolving to `value`.
    ///
    /// The previous binding, or its absence, is restored on every exit path:
    /// normal return, an `Err` result or a panic.
    pub fn bind<R>(&self, value: T, body: impl FnOnce() -> R) -> R {
        let previous = replace_raw(self.name, Some(Arc::new(value)));
        let _guard = RestoreGuard {
            name: self.name,
            previous,
        };
        body()
    }

    /// Returns the value currently bound on this thread.
    #[must_use]
    pub fn get(&self) -> Option<T> {
        get_raw(self.name).and_then(|v| v.downcast_ref::<T>().cloned())
    }

    /// Returns true if a value is bound on this thread.
    #[must_use]
    pub fn is_bound(&self) -> bool {
        get_raw(self.name).is_some_and(|v| v.is::<T>())
    }
}

impl<T> fmt::Debug for ContextKey<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextKey").field("name", &self.name).finish()
    }
}

/// A mutable thread-scoped cell.
///
/// Unlike [`ContextKey::bind`], the value is not tied to a closure: it stays
/// bound on the thread until [`ContextCell::remove`] is called.
pub struct ContextCell<T> {
    name: &'static str,
    _marker: PhantomData<fn() -> T>,
}

impl<T> ContextCell<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Creates a cell with the given name.
    #[must_use]
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            _marker: PhantomData,
        }
    }

    /// Returns the cell name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Gets the current value.
    #[must_use]
    pub fn get(&self) -> Option<T> {
        get_raw(self.name).and_then(|v| v.downcast_ref::<T>().cloned())
    }

    /// Sets the value, returning the previous one.
    pub fn set(&self, value: T) -> Option<T> {
        replace_raw(self.name, Some(Arc::new(value)))
            .and_then(|v| v.downcast_ref::<T>().cloned())
    }

    /// Updates the value in place, starting from `init` when unbound.
    pub fn update(&self, init: impl FnOnce() -> T, f: impl FnOnce(&mut T)) -> T {
        let mut value = self.get().unwrap_or_else(init);
        f(&mut value);
        self.set(value.clone());
        value
    }

    /// Removes the value, returning it.
    pub fn remove(&self) -> Option<T> {
        replace_raw(self.name, None).and_then(|v| v.downcast_ref::<T>().cloned())
    }

    /// Returns true if a value is bound on this thread.
    #[must_use]
    pub fn is_bound(&self) -> bool {
        get_raw(self.name).is_some_and(|v| v.is::<T>())
    }
}

impl<T> fmt::Debug for ContextCell<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextCell").field("name", &self.name).finish()
    }
}
