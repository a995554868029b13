use std::sync::Arc;
use std::time::Duration;

use fusion_runtime::host::{
    KeyValueStore, MemoryHistory, MemoryStore, StaticMemoryProbe, StaticNetworkProbe,
};
use fusion_runtime::{
    BoxError, ClientHost, ClientRuntime, ComponentConfig, ErrorCategory, HealthRating, LoadState,
    Priority, RecoveryOutcome, RuntimeConfig,
};

#[derive(Debug)]
struct Page {
    title: String,
}

struct Harness {
    runtime: ClientRuntime<Page>,
    memory: Arc<StaticMemoryProbe>,
    store: Arc<MemoryStore>,
}

fn harness(config: RuntimeConfig) -> Harness {
    let memory = Arc::new(StaticMemoryProbe::with_percent(20.0));
    let store = Arc::new(MemoryStore::new());
    store.set("ff_auth_token", "token-123").unwrap();
    let host = ClientHost::in_memory()
        .with_memory(memory.clone())
        .with_store(store.clone())
        .with_history(Arc::new(MemoryHistory::new("/")))
        .with_network(Arc::new(StaticNetworkProbe::default()));
    Harness {
        runtime: ClientRuntime::new(config, host).unwrap(),
        memory,
        store,
    }
}

fn page(title: &'static str) -> impl Fn() -> std::future::Ready<Result<Page, BoxError>> + Send + Sync {
    move || {
        std::future::ready(Ok(Page {
            title: title.to_string(),
        }))
    }
}

#[tokio::test(start_paused = true)]
async fn test_bootstrap_load_navigate_and_report() {
    let config = RuntimeConfig::from_toml_str(
        r#"
        [registry]
        tick_interval_ms = 500

        [errors]
        health_interval_ms = 10000
        "#,
    )
    .unwrap();
    let h = harness(config);
    let runtime = &h.runtime;
    runtime.start();
    runtime.start();

    runtime
        .registry()
        .register("dashboard", page("Dashboard"), ComponentConfig::new(Priority::Critical))
        .unwrap();
    runtime
        .registry()
        .register("settings", page("Settings"), ComponentConfig::new(Priority::Low))
        .unwrap();
    runtime.registry().preload("settings").unwrap();

    let dashboard = runtime.registry().get_component("dashboard").await.unwrap();
    assert_eq!(dashboard.title, "Dashboard");

    // The preload loop picks up the queued entry on its next tick.
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(runtime.registry().state("settings"), Some(LoadState::Loaded));

    runtime.bus().navigate("/dashboard?tab=usage").unwrap();
    runtime.bus().notify_error("network connection lost");
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(runtime.bus().current_path(), "/dashboard?tab=usage");
    let stats = runtime.errors().stats();
    assert_eq!(stats.total_errors, 1);
    assert_eq!(stats.errors_by_category[&ErrorCategory::Network], 1);

    tokio::time::sleep(Duration::from_secs(10)).await;
    let health = runtime.errors().last_health().unwrap();
    assert_eq!(health.overall, HealthRating::Healthy);

    let snapshot = serde_json::to_value(runtime.snapshot()).unwrap();
    assert_eq!(snapshot["registry"]["loaded"], 2);
    assert_eq!(snapshot["entries"][0]["id"], "dashboard");
    assert_eq!(snapshot["errors"]["total_errors"], 1);
    assert_eq!(snapshot["current_path"], "/dashboard?tab=usage");

    runtime.shutdown();
    runtime.shutdown();
    assert!(runtime.bus().is_destroyed());
    assert_eq!(runtime.registry().metrics().background_tasks, 0);
}

#[tokio::test(start_paused = true)]
async fn test_critical_memory_error_triggers_recovery() {
    let h = harness(RuntimeConfig::default());
    h.runtime.start();
    h.store.set("ff_report_cache", &"x".repeat(100 * 1024)).unwrap();
    h.memory.set_percent(95.0);

    let report = h.runtime.errors().check_health().await;
    assert_eq!(report.overall, HealthRating::Critical);

    h.runtime.bus().notify_error("JavaScript heap out of memory");
    tokio::time::sleep(Duration::from_millis(100)).await;

    let recent = h.runtime.errors().recent_errors(1);
    let handled = recent.first().unwrap();
    assert_eq!(handled.category, ErrorCategory::Memory);
    assert!(matches!(handled.recovery, Some(RecoveryOutcome::Succeeded { .. })));
    assert!(h.store.get("ff_report_cache").is_none());
    assert_eq!(h.store.get("ff_auth_token").as_deref(), Some("token-123"));

    h.runtime.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_auth_recovery_redirects_through_the_bus() {
    let h = harness(RuntimeConfig::default());
    let errors = h.runtime.errors();
    let err = errors.classify(
        &fusion_runtime::RawError::new("Error", "401 Unauthorized"),
        fusion_runtime::ErrorContext::new(),
    );
    let id = errors.record_error(err);

    let outcome = errors.attempt_recovery(id).await;
    assert!(outcome.is_success());
    assert_eq!(h.runtime.bus().current_path(), "/login");
    assert!(h.store.get("ff_auth_token").is_none());

    h.runtime.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_forwarded_errors_keep_their_name() {
    let h = harness(RuntimeConfig::default());
    h.runtime.start();

    h.runtime.bus().notify_error("TypeError: Failed to fetch /api/projects");
    h.runtime.bus().notify_named_error("ChunkLoadError", "Loading chunk 7 failed");
    tokio::time::sleep(Duration::from_millis(100)).await;

    let stats = h.runtime.errors().stats();
    assert_eq!(stats.errors_by_key["network:TypeError"], 1);
    assert_eq!(stats.errors_by_key["navigation:ChunkLoadError"], 1);
    let fetch = h
        .runtime
        .errors()
        .recent_errors(2)
        .into_iter()
        .find(|e| e.name == "TypeError")
        .unwrap();
    assert_eq!(fetch.message, "Failed to fetch /api/projects");

    h.runtime.shutdown();
}

#[tokio::test]
async fn test_invalid_config_is_rejected() {
    let mut config = RuntimeConfig::default();
    config.errors.memory_degraded_percent = 95.0;
    let err = ClientRuntime::<Page>::new(config, ClientHost::in_memory()).unwrap_err();
    assert!(matches!(err, fusion_runtime::Error::InvalidConfig { .. }));
}
