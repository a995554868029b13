//! Listener table and subscription handles.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use super::event::NavigationEvent;
use crate::error::BoxError;

pub type ListenerFuture = Pin<Box<dyn Future<Output = Result<(), BoxError>> + Send>>;

/// Listener callback. It receives a shared handle to the event so one event
/// can be handed to many listeners without copying.
pub type ListenerFn = Arc<dyn Fn(Arc<NavigationEvent>) -> ListenerFuture + Send + Sync>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListenerOptions {
    /// Higher runs first. Ties run in registration order.
    pub priority: i32,
    /// Remove the listener after its first invocation.
    pub once: bool,
}

impl ListenerOptions {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn once(mut self) -> Self {
        self.once = true;
        self
    }
}

pub(crate) struct Listener {
    pub(crate) id: u64,
    pub(crate) callback: ListenerFn,
    pub(crate) options: ListenerOptions,
}

/// Listeners kept in dispatch order.
#[derive(Default)]
pub(crate) struct ListenerTable {
    listeners: Vec<Listener>,
    next_id: u64,
    closed: bool,
}

impl ListenerTable {
    /// Returns `None` once the table is closed.
    pub(crate) fn insert(&mut self, callback: ListenerFn, options: ListenerOptions) -> Option<u64> {
        if self.closed {
            return None;
        }
        self.next_id += 1;
        let id = self.next_id;
        let at = self
            .listeners
            .partition_point(|l| l.options.priority >= options.priority);
        self.listeners.insert(
            at,
            Listener {
                id,
                callback,
                options,
            },
        );
        Some(id)
    }

    pub(crate) fn remove(&mut self, id: u64) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|l| l.id != id);
        self.listeners.len() != before
    }

    pub(crate) fn contains(&self, id: u64) -> bool {
        self.listeners.iter().any(|l| l.id == id)
    }

    /// The current dispatch order, detached from the table.
    pub(crate) fn snapshot(&self) -> Vec<(u64, ListenerFn, bool)> {
        self.listeners
            .iter()
            .map(|l| (l.id, Arc::clone(&l.callback), l.options.once))
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.listeners.len()
    }

    pub(crate) fn close(&mut self) -> usize {
        self.closed = true;
        let dropped = self.listeners.len();
        self.listeners.clear();
        dropped
    }
}

pub(crate) type SharedTable = Arc<Mutex<ListenerTable>>;

pub(crate) fn lock(table: &Mutex<ListenerTable>) -> MutexGuard<'_, ListenerTable> {
    table.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Handle returned by `NavigationBus::add_listener`.
///
/// Dropping it does not unsubscribe. `unsubscribe` is idempotent and stays
/// safe after the bus was destroyed or dropped.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    table: Weak<Mutex<ListenerTable>>,
    active: AtomicBool,
}

impl Subscription {
    pub(crate) fn new(id: u64, table: &SharedTable) -> Self {
        Self {
            id,
            table: Arc::downgrade(table),
            active: AtomicBool::new(true),
        }
    }

    /// A subscription that was never attached (the bus was already destroyed).
    pub(crate) fn detached() -> Self {
        Self {
            id: 0,
            table: Weak::new(),
            active: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Whether the listener is still in the bus table. False after
    /// `unsubscribe`, after a `once` listener fired, and after `destroy`.
    pub fn is_active(&self) -> bool {
        if !self.active.load(Ordering::Acquire) {
            return false;
        }
        self.table
            .upgrade()
            .is_some_and(|table| lock(&table).contains(self.id))
    }

    /// Remove the listener. Returns true only for the call that removed it.
    pub fn unsubscribe(&self) -> bool {
        if !self.active.swap(false, Ordering::AcqRel) {
            return false;
        }
        match self.table.upgrade() {
            Some(table) => lock(&table).remove(self.id),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> ListenerFn {
        Arc::new(|_: Arc<NavigationEvent>| -> ListenerFuture { Box::pin(async { Ok(()) }) })
    }

    #[test]
    fn test_table_orders_by_priority_then_registration() {
        let mut table = ListenerTable::default();
        let a = table.insert(noop(), ListenerOptions::new().priority(1)).unwrap();
        let b = table.insert(noop(), ListenerOptions::new().priority(3)).unwrap();
        let c = table.insert(noop(), ListenerOptions::new().priority(1)).unwrap();
        let d = table.insert(noop(), ListenerOptions::new().priority(2)).unwrap();

        let order: Vec<u64> = table.snapshot().into_iter().map(|(id, _, _)| id).collect();
        assert_eq!(order, [b, d, a, c]);
    }

    #[test]
    fn test_closed_table_rejects_inserts() {
        let mut table = ListenerTable::default();
        table.insert(noop(), ListenerOptions::default());
        assert_eq!(table.close(), 1);
        assert!(table.insert(noop(), ListenerOptions::default()).is_none());
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn test_unsubscribe_is_idempotent() {
        let table: SharedTable = Arc::default();
        let id = lock(&table).insert(noop(), ListenerOptions::default()).unwrap();
        let sub = Subscription::new(id, &table);

        assert!(sub.unsubscribe());
        assert!(!sub.unsubscribe());
        assert!(!sub.is_active());
        assert!(!lock(&table).contains(id));

        let removed = lock(&table).insert(noop(), ListenerOptions::new().once()).unwrap();
        let fired = Subscription::new(removed, &table);
        assert!(fired.is_active());
        lock(&table).remove(removed);
        assert!(!fired.is_active());

        let orphan = Subscription::new(7, &table);
        drop(table);
        assert!(!orphan.unsubscribe());
        assert!(!Subscription::detached().unsubscribe());
    }
}
