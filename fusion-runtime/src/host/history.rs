//! Navigation history primitives.
//!
//! `HistoryBackend` is the host's native navigation mechanism. Application
//! code never calls it directly: it goes through `NavigationBus::navigate`,
//! which invokes the backend and then emits the route-change event.

use std::fmt::Debug;
use std::sync::{Mutex, PoisonError};

/// Host navigation primitive (the browser's history API, a TUI router...).
pub trait HistoryBackend: Send + Sync + Debug + 'static {
    /// Push a new location onto the history.
    fn push(&self, location: &str);

    /// Replace the current location without growing the history.
    fn replace(&self, location: &str);

    /// Pop back to the previous location, returning it.
    fn back(&self) -> Option<String>;

    /// The current location, including any query string.
    fn current(&self) -> String;

    /// Number of entries that `back` can return to.
    fn depth(&self) -> usize;
}

/// A history stack: the current location plus everything before it.
#[derive(Debug, Clone)]
pub struct HistoryStack<R: Clone + PartialEq> {
    current: R,
    history: Vec<R>,
}

impl<R: Clone + PartialEq> HistoryStack<R> {
    pub fn new(initial: R) -> Self {
        Self {
            current: initial,
            history: Vec::new(),
        }
    }

    pub fn current(&self) -> &R {
        &self.current
    }

    /// Navigate to a new location. Navigating to the current one is a no-op.
    pub fn push(&mut self, location: R) -> bool {
        if self.current == location {
            return false;
        }
        self.history.push(self.current.clone());
        self.current = location;
        true
    }

    pub fn replace(&mut self, location: R) {
        self.current = location;
    }

    /// Go back to the previous location. Returns it if there was one.
    pub fn back(&mut self) -> Option<&R> {
        let prev = self.history.pop()?;
        self.current = prev;
        Some(&self.current)
    }

    pub fn can_go_back(&self) -> bool {
        !self.history.is_empty()
    }

    /// Number of entries behind the current location.
    pub fn depth(&self) -> usize {
        self.history.len()
    }
}

/// In-process `HistoryBackend`.
#[derive(Debug)]
pub struct MemoryHistory {
    stack: Mutex<HistoryStack<String>>,
}

impl MemoryHistory {
    pub fn new(initial: impl Into<String>) -> Self {
        Self {
            stack: Mutex::new(HistoryStack::new(initial.into())),
        }
    }

    fn with_stack<R>(&self, f: impl FnOnce(&mut HistoryStack<String>) -> R) -> R {
        let mut guard = self.stack.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }
}

impl Default for MemoryHistory {
    fn default() -> Self {
        Self::new("/")
    }
}

impl HistoryBackend for MemoryHistory {
    fn push(&self, location: &str) {
        self.with_stack(|s| s.push(location.to_string()));
    }

    fn replace(&self, location: &str) {
        self.with_stack(|s| s.replace(location.to_string()));
    }

    fn back(&self) -> Option<String> {
        self.with_stack(|s| s.back().cloned())
    }

    fn current(&self) -> String {
        self.with_stack(|s| s.current().clone())
    }

    fn depth(&self) -> usize {
        self.with_stack(|s| s.depth())
    }
}
