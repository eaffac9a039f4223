//! Live-swappable configuration snapshots.
//!
//! Readers take an `Arc<T>` once per request and keep using it even if a reload lands
//! mid-request, so no request ever observes a half-applied configuration. The default backend
//! is `ArcSwap`; feature `adaptive-rwlock` switches to an `RwLock<Arc<T>>`.

use std::sync::Arc;

#[cfg(feature = "adaptive-rwlock")]
use std::sync::{PoisonError, RwLock};

#[cfg(not(feature = "adaptive-rwlock"))]
use arc_swap::ArcSwap;

/// Shared handle to the current snapshot of `T`. Clones observe the same value.
#[derive(Debug)]
pub struct DynamicConfig<T> {
    #[cfg(not(feature = "adaptive-rwlock"))]
    inner: Arc<ArcSwap<T>>,
    #[cfg(feature = "adaptive-rwlock")]
    inner: Arc<RwLock<Arc<T>>>,
}

impl<T> Clone for DynamicConfig<T> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<T> DynamicConfig<T> {
    pub fn new(value: T) -> Self {
        #[cfg(not(feature = "adaptive-rwlock"))]
        {
            Self { inner: Arc::new(ArcSwap::from_pointee(value)) }
        }
        #[cfg(feature = "adaptive-rwlock")]
        {
            Self { inner: Arc::new(RwLock::new(Arc::new(value))) }
        }
    }

    /// The current snapshot.
    pub fn get(&self) -> Arc<T> {
        #[cfg(not(feature = "adaptive-rwlock"))]
        {
            self.inner.load_full()
        }
        #[cfg(feature = "adaptive-rwlock")]
        {
            self.inner.read().unwrap_or_else(PoisonError::into_inner).clone()
        }
    }

    /// Atomically replace the snapshot. Returns the one it replaced.
    pub fn swap(&self, value: T) -> Arc<T> {
        #[cfg(not(feature = "adaptive-rwlock"))]
        {
            self.inner.swap(Arc::new(value))
        }
        #[cfg(feature = "adaptive-rwlock")]
        {
            let mut guard = self.inner.write().unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut *guard, Arc::new(value))
        }
    }
}
