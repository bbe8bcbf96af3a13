//! Capturing and re-binding context across thread hops.

use std::collections::HashMap;
use std::fmt;

use super::binding::{self, BoundValue};

/// All context bindings captured from a thread.
///
/// Executors capture a snapshot at submission time and install it on the
/// worker thread for the duration of the task.
#[derive(Clone, Default)]
pub struct CapturedContext {
    values: HashMap<&'static str, BoundValue>,
}

impl CapturedContext {
    /// Captures every binding active on the current thread.
    #[must_use]
    pub fn capture() -> Self {
        Self {
            values: binding::snapshot_raw(),
        }
    }

    /// Returns true if nothing was captured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Returns the number of captured bindings.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns the captured names.
    #[must_use]
    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.values.keys().copied().collect();
        names.sort_unstable();
        names
    }

    /// Runs `body` with the captured bindings installed.
    ///
    /// The thread's own bindings are restored afterwards, even on panic.
    pub fn scope<R>(&self, body: impl FnOnce() -> R) -> R {
        let previous = binding::swap_all(self.values.clone());
        let _guard = SwapGuard {
            previous: Some(previous),
        };
        body()
    }

    /// Wraps a closure so it runs inside this context.
    pub fn wrap<F, R>(self, f: F) -> impl FnOnce() -> R + Send + 'static
    where
        F: FnOnce() -> R + Send + 'static,
    {
        move || self.scope(f)
    }
}

impl fmt::Debug for CapturedContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapturedContext")
            .field("names", &self.names())
            .finish()
    }
}

struct SwapGuard {
    previous: Option<HashMap<&'static str, BoundValue>>,
}

impl Drop for SwapGuard {
    fn drop(&mut self) {
        if let Some(previous) = self.previous.take() {
            binding::swap_all(previous);
        }
    }
}
