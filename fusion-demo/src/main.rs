//! Terminal debug panel driving a simulated client runtime.
//!
//! Usage: `fusion-demo [config.toml]`. Logs go to `fusion-demo.log`; set
//! `FUSION_LOG` to change the filter.

mod app;
mod model;
mod scenario;
mod ui;

use std::fs::File;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use fusion_runtime::host::{KeyValueStore, MemoryHistory, MemoryStore, StaticMemoryProbe, StaticNetworkProbe};
use fusion_runtime::{telemetry, ClientHost, ClientRuntime, RuntimeConfig};
use tokio::runtime::Runtime;

fn main() -> anyhow::Result<()> {
    let log = File::create("fusion-demo.log")?;
    telemetry::init_tracing_with_writer("info,fusion_runtime=debug", Mutex::new(log))?;

    let config = match std::env::args().nth(1) {
        Some(path) => RuntimeConfig::load(path)?,
        None => RuntimeConfig::default(),
    };

    let rt = Runtime::new().map_err(|e| anyhow::anyhow!("Failed to start tokio: {}", e))?;
    rt.block_on(async move {
        let memory = Arc::new(StaticMemoryProbe::with_percent(35.0));
        let network = Arc::new(StaticNetworkProbe::new(Duration::from_millis(40)));
        let store = Arc::new(MemoryStore::new());
        store.set(&config.errors.auth_token_key, "demo-session-token")?;
        store.set(
            &format!("{}report_cache", config.errors.storage_namespace),
            &"r".repeat(96 * 1024),
        )?;

        let host = ClientHost::in_memory()
            .with_memory(memory.clone())
            .with_network(network.clone())
            .with_store(store)
            .with_history(Arc::new(MemoryHistory::new("/")));
        let runtime = Arc::new(ClientRuntime::new(config, host)?);
        scenario::register_components(&runtime)?;
        runtime.start();
        tracing::info!("demo.started");

        app::Panel::new(runtime, memory, network).run().await
    })
}
