//! Shared one-shot loader
//!
//! Cross-camera resources (the detection model is the canonical case) must
//! be initialized at most once no matter how many cameras race to use them.
//! Late callers await the in-flight load instead of starting their own.

use std::future::Future;

use tokio::sync::OnceCell;

use crate::error::Result;

/// At-most-one-initializer wrapper around a shared resource
pub struct SharedLoader<T> {
    cell: OnceCell<T>,
}

impl<T> SharedLoader<T> {
    pub fn new() -> Self {
        Self {
            cell: OnceCell::new(),
        }
    }

    /// Return the resource, running `load` only if nobody has loaded it yet.
    /// Concurrent callers wait on the single in-flight load. A failed load
    /// leaves the loader empty so a later call can try again.
    pub async fn get_or_load<F, Fut>(&self, load: F) -> Result<&T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.cell.get_or_try_init(load).await
    }

    pub fn get(&self) -> Option<&T> {
        self.cell.get()
    }

    pub fn is_loaded(&self) -> bool {
        self.cell.initialized()
    }
}

impl<T> Default for SharedLoader<T> {
    fn default() -> Self {
        Self::new()
    }
}
