//! Observable snapshots shared between services and polling UIs.
//!
//! An `Observable<T>` is a shared value plus a version counter published over a
//! `watch` channel. Writers call `update`, readers either read on demand or
//! await `changed()` on a subscription.

use std::sync::{Arc, RwLock};
use tokio::sync::watch;

pub struct Observable<T: Send + Sync> {
    inner: Arc<RwLock<T>>,
    tx: watch::Sender<u64>,
}

impl<T: Send + Sync> Observable<T> {
    pub fn new(value: T) -> Self {
        let (tx, _) = watch::channel(0);
        Self {
            inner: Arc::new(RwLock::new(value)),
            tx,
        }
    }

    /// Mutate the value and notify subscribers.
    pub fn update<F, R>(&self, f: F) -> crate::Result<R>
    where
        F: FnOnce(&mut T) -> R,
    {
        let mut guard = self.inner.write().map_err(|_| crate::Error::LockPoisoned)?;
        let res = f(&mut *guard);
        drop(guard);
        self.tx.send_modify(|version| *version = version.wrapping_add(1));
        Ok(res)
    }

    /// Read the value through a closure.
    pub fn read<F, R>(&self, f: F) -> crate::Result<R>
    where
        F: FnOnce(&T) -> R,
    {
        let guard = self.inner.read().map_err(|_| crate::Error::LockPoisoned)?;
        Ok(f(&*guard))
    }

    /// Number of updates published so far.
    pub fn version(&self) -> u64 {
        *self.tx.borrow()
    }

    /// Subscribe to change notifications. The payload is the new version.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.tx.subscribe()
    }
}

impl<T: Clone + Send + Sync> Observable<T> {
    /// Clone the current value out.
    pub fn get(&self) -> crate::Result<T> {
        self.read(T::clone)
    }
}

impl<T: Send + Sync> Clone for Observable<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            tx: self.tx.clone(),
        }
    }
}

impl<T: Send + Sync + Default> Default for Observable<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: Send + Sync + std::fmt::Debug> std::fmt::Debug for Observable<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut s = f.debug_struct("Observable");
        s.field("version", &self.version());
        match self.inner.read() {
            Ok(guard) => s.field("value", &*guard),
            Err(_) => s.field("value", &"<poisoned>"),
        };
        s.finish()
    }
}
