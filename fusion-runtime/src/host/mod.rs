//! Host environment seams.
//!
//! Everything the services consume from their surroundings (heap metrics,
//! session storage, navigation history, a network round trip) sits behind a
//! trait here, with in-process implementations for simulation and tests.

pub mod history;
pub mod memory;
pub mod network;
pub mod storage;

use std::sync::Arc;

pub use history::{HistoryBackend, HistoryStack, MemoryHistory};
pub use memory::{
    MemoryMonitor, MemoryProbe, MemorySample, NoMemoryProbe, StaticMemoryProbe, SystemMemoryProbe,
};
pub use network::{NetworkProbe, StaticNetworkProbe};
pub use storage::{KeyValueStore, MemoryStore};

/// The set of host seams a `ClientRuntime` is built over.
#[derive(Debug, Clone)]
pub struct ClientHost {
    pub memory: Arc<dyn MemoryProbe>,
    pub store: Arc<dyn KeyValueStore>,
    pub history: Arc<dyn HistoryBackend>,
    pub network: Arc<dyn NetworkProbe>,
}

impl ClientHost {
    /// In-process host: system memory probe, memory store, memory history
    /// starting at `/`, and an always-online network probe.
    pub fn in_memory() -> Self {
        Self {
            memory: Arc::new(SystemMemoryProbe::new()),
            store: Arc::new(MemoryStore::new()),
            history: Arc::new(MemoryHistory::default()),
            network: Arc::new(StaticNetworkProbe::default()),
        }
    }

    pub fn with_memory(mut self, probe: Arc<dyn MemoryProbe>) -> Self {
        self.memory = probe;
        self
    }

    pub fn with_store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_history(mut self, history: Arc<dyn HistoryBackend>) -> Self {
        self.history = history;
        self
    }

    pub fn with_network(mut self, network: Arc<dyn NetworkProbe>) -> Self {
        self.network = network;
        self
    }
}
