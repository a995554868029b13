use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use super::*;
use crate::host::StaticMemoryProbe;

#[derive(Debug, PartialEq)]
struct Widget(&'static str);

fn registry_at(percent: f64) -> (ComponentRegistry<Widget>, Arc<StaticMemoryProbe>) {
    let probe = Arc::new(StaticMemoryProbe::with_percent(percent));
    let registry = ComponentRegistry::new(
        RegistryConfig::default(),
        MemoryMonitor::from_arc(probe.clone()),
    );
    (registry, probe)
}

fn counting_loader(
    name: &'static str,
    delay: Duration,
    calls: Arc<AtomicU32>,
) -> impl Fn() -> LoadFuture<Widget> + Send + Sync + 'static {
    move || -> LoadFuture<Widget> {
        let calls = calls.clone();
        Box::pin(async move {
            calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(delay).await;
            Ok::<_, BoxError>(Widget(name))
        })
    }
}

fn rejecting_loader(calls: Arc<AtomicU32>) -> impl Fn() -> LoadFuture<Widget> + Send + Sync + 'static {
    move || -> LoadFuture<Widget> {
        let calls = calls.clone();
        Box::pin(async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<Widget, BoxError>("boom".into())
        })
    }
}

#[tokio::test(start_paused = true)]
async fn test_critical_component_loads_on_first_use() {
    let (registry, _) = registry_at(10.0);
    let calls = Arc::new(AtomicU32::new(0));
    registry
        .register(
            "dashboard",
            counting_loader("dashboard", Duration::from_millis(50), calls.clone()),
            ComponentConfig::new(Priority::Critical),
        )
        .unwrap();
    assert_eq!(registry.state("dashboard"), Some(LoadState::Unloaded));

    let widget = registry.get_component("dashboard").await.unwrap();
    assert_eq!(*widget, Widget("dashboard"));
    assert_eq!(registry.state("dashboard"), Some(LoadState::Loaded));

    // Served from the entry without calling the loader again.
    let again = registry.get_component("dashboard").await.unwrap();
    assert!(Arc::ptr_eq(&widget, &again));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_retries_mark_entry_failed() {
    let (registry, _) = registry_at(10.0);
    let calls = Arc::new(AtomicU32::new(0));
    registry
        .register(
            "widget",
            rejecting_loader(calls.clone()),
            ComponentConfig::new(Priority::Normal).max_retries(2),
        )
        .unwrap();

    let started = Instant::now();
    let err = registry.get_component("widget").await.unwrap_err();
    match err {
        crate::Error::LoadRetriesExhausted {
            id,
            attempts,
            source,
        } => {
            assert_eq!(id, "widget");
            assert_eq!(attempts, 2);
            assert_eq!(
                source,
                LoadError::Rejected {
                    message: "boom".to_string()
                }
            );
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(registry.state("widget"), Some(LoadState::Failed));

    let entry = registry.entry("widget").unwrap();
    assert_eq!(entry.retry_count, 2);
    assert!(entry.last_error.unwrap().contains("boom"));
    // One backoff of base * 2^1 between the two attempts.
    assert!(started.elapsed() >= Duration::from_secs(2));
}

#[tokio::test(start_paused = true)]
async fn test_backoff_grows_between_attempts() {
    let (registry, _) = registry_at(10.0);
    let calls = Arc::new(AtomicU32::new(0));
    registry
        .register("flaky", rejecting_loader(calls.clone()), ComponentConfig::default())
        .unwrap();

    let started = Instant::now();
    assert!(registry.get_component("flaky").await.is_err());
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert!(started.elapsed() >= Duration::from_secs(2 + 4));
    assert_eq!(backoff_delay(Duration::from_secs(1), 3), Duration::from_secs(8));
}

#[tokio::test(start_paused = true)]
async fn test_failed_entry_starts_a_fresh_cycle() {
    let (registry, _) = registry_at(10.0);
    let healthy = Arc::new(AtomicBool::new(false));
    let flag = healthy.clone();
    registry
        .register(
            "report",
            move || {
                let ok = flag.load(Ordering::SeqCst);
                async move {
                    if ok {
                        Ok(Widget("report"))
                    } else {
                        Err::<_, BoxError>("offline".into())
                    }
                }
            },
            ComponentConfig::default().max_retries(1),
        )
        .unwrap();

    assert!(registry.get_component("report").await.is_err());
    assert_eq!(registry.state("report"), Some(LoadState::Failed));

    healthy.store(true, Ordering::SeqCst);
    let widget = registry.get_component("report").await.unwrap();
    assert_eq!(*widget, Widget("report"));
    let entry = registry.entry("report").unwrap();
    assert_eq!(entry.retry_count, 0);
    assert_eq!(entry.last_error, None);
}

#[tokio::test(start_paused = true)]
async fn test_unknown_and_duplicate_ids() {
    let (registry, _) = registry_at(10.0);
    let err = registry.get_component("ghost").await.unwrap_err();
    assert!(matches!(err, crate::Error::NotRegistered { ref id } if id == "ghost"));
    assert!(registry.preload("ghost").is_err());

    let calls = Arc::new(AtomicU32::new(0));
    registry
        .register("a", counting_loader("a", Duration::ZERO, calls.clone()), ComponentConfig::default())
        .unwrap();
    let err = registry
        .register("a", counting_loader("a", Duration::ZERO, calls), ComponentConfig::default())
        .unwrap_err();
    assert!(matches!(err, crate::Error::DuplicateComponent { .. }));
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_callers_share_one_load() {
    let (registry, _) = registry_at(10.0);
    let calls = Arc::new(AtomicU32::new(0));
    registry
        .register(
            "chart",
            counting_loader("chart", Duration::from_millis(200), calls.clone()),
            ComponentConfig::default(),
        )
        .unwrap();

    let (a, b, c) = tokio::join!(
        registry.get_component("chart"),
        registry.get_component("chart"),
        registry.get_component("chart"),
    );
    let (a, b, c) = (a.unwrap(), b.unwrap(), c.unwrap());
    assert!(Arc::ptr_eq(&a, &b));
    assert!(Arc::ptr_eq(&b, &c));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(registry.metrics().loads_started, 1);
}

#[tokio::test(start_paused = true)]
async fn test_attempt_timeout() {
    let (registry, _) = registry_at(10.0);
    let calls = Arc::new(AtomicU32::new(0));
    registry
        .register(
            "slow",
            counting_loader("slow", Duration::from_secs(20), calls),
            ComponentConfig::default()
                .max_retries(1)
                .timeout(Duration::from_secs(1)),
        )
        .unwrap();

    let err = registry.get_component("slow").await.unwrap_err();
    match err {
        crate::Error::LoadRetriesExhausted { source, .. } => {
            assert_eq!(
                source,
                LoadError::Timeout {
                    timeout: Duration::from_secs(1)
                }
            );
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_panicking_loader_is_reported() {
    let (registry, _) = registry_at(10.0);
    registry
        .register(
            "broken",
            || async {
                let parts: Vec<&'static str> = Vec::new();
                Ok::<_, BoxError>(Widget(parts[0]))
            },
            ComponentConfig::default().max_retries(1),
        )
        .unwrap();

    let err = registry.get_component("broken").await.unwrap_err();
    assert!(matches!(
        err,
        crate::Error::LoadRetriesExhausted {
            source: LoadError::Panicked,
            ..
        }
    ));
}

#[tokio::test(start_paused = true)]
async fn test_memory_pressure_evicts_before_loading() {
    let (registry, _) = registry_at(90.0);
    let calls = Arc::new(AtomicU32::new(0));
    registry
        .register(
            "old",
            counting_loader("old", Duration::ZERO, calls.clone()),
            ComponentConfig::new(Priority::Low),
        )
        .unwrap();
    registry.get_component("old").await.unwrap();
    tokio::time::advance(Duration::from_secs(6 * 60)).await;

    let observed = Arc::new(AtomicBool::new(false));
    let seen = observed.clone();
    let handle = registry.clone();
    registry
        .register(
            "new",
            move || {
                seen.store(
                    handle.state("old") == Some(LoadState::Unloaded),
                    Ordering::SeqCst,
                );
                async { Ok::<_, BoxError>(Widget("new")) }
            },
            ComponentConfig::default(),
        )
        .unwrap();

    registry.get_component("new").await.unwrap();
    assert!(observed.load(Ordering::SeqCst));
    assert_eq!(registry.entry("old").unwrap().eviction_count, 1);
}

#[tokio::test(start_paused = true)]
async fn test_eviction_skips_critical_and_recent_entries() {
    let (registry, _) = registry_at(10.0);
    let calls = Arc::new(AtomicU32::new(0));
    for (id, priority) in [
        ("shell", Priority::Critical),
        ("stale", Priority::Normal),
        ("fresh", Priority::Normal),
    ] {
        registry
            .register(
                id,
                counting_loader(id, Duration::ZERO, calls.clone()),
                ComponentConfig::new(priority),
            )
            .unwrap();
        registry.get_component(id).await.unwrap();
    }

    tokio::time::advance(Duration::from_secs(6 * 60)).await;
    registry.get_component("fresh").await.unwrap();

    assert_eq!(registry.evict_idle(), 1);
    assert_eq!(registry.state("shell"), Some(LoadState::Loaded));
    assert_eq!(registry.state("stale"), Some(LoadState::Unloaded));
    assert_eq!(registry.state("fresh"), Some(LoadState::Loaded));

    // An evicted entry reloads through the normal path.
    registry.get_component("stale").await.unwrap();
    assert_eq!(registry.entry("stale").unwrap().load_count, 2);
    assert_eq!(registry.metrics().evictions, 1);
}

#[tokio::test(start_paused = true)]
async fn test_transitions_follow_the_state_machine() {
    let (registry, _) = registry_at(10.0);
    let mut transitions = registry.watch_transitions();
    let calls = Arc::new(AtomicU32::new(0));
    registry
        .register("ok", counting_loader("ok", Duration::ZERO, calls.clone()), ComponentConfig::default())
        .unwrap();
    registry
        .register("bad", rejecting_loader(calls), ComponentConfig::default().max_retries(1))
        .unwrap();

    registry.get_component("ok").await.unwrap();
    let _ = registry.get_component("bad").await;
    let _ = registry.get_component("bad").await;
    tokio::time::advance(Duration::from_secs(6 * 60)).await;
    registry.evict_idle();
    registry.get_component("ok").await.unwrap();

    let mut seen = Vec::new();
    while let Ok(transition) = transitions.try_recv() {
        assert!(
            transition.from.can_transition_to(transition.to),
            "illegal transition {transition:?}"
        );
        seen.push((transition.id, transition.from, transition.to));
    }
    assert!(seen.contains(&("ok".to_string(), LoadState::Loaded, LoadState::Unloaded)));
    assert!(seen.contains(&("bad".to_string(), LoadState::Failed, LoadState::Loading)));
    assert_eq!(seen.len(), 9);
}

#[tokio::test(start_paused = true)]
async fn test_preload_with_registration() {
    let (registry, _) = registry_at(10.0);
    let calls = Arc::new(AtomicU32::new(0));
    registry
        .register(
            "nav",
            counting_loader("nav", Duration::from_millis(10), calls.clone()),
            ComponentConfig::new(Priority::High).preload(true),
        )
        .unwrap();
    registry
        .register(
            "telemetry",
            counting_loader("telemetry", Duration::from_millis(10), calls.clone()),
            ComponentConfig::new(Priority::Background).preload(true),
        )
        .unwrap();

    assert_eq!(registry.state("nav"), Some(LoadState::Loading));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(registry.state("nav"), Some(LoadState::Loaded));
    assert_eq!(registry.state("telemetry"), Some(LoadState::Unloaded));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_preload_tick_one_per_tier_and_background_gate() {
    let (registry, probe) = registry_at(50.0);
    let calls = Arc::new(AtomicU32::new(0));
    for (id, priority) in [
        ("c1", Priority::Critical),
        ("n1", Priority::Normal),
        ("n2", Priority::Normal),
        ("bg", Priority::Background),
    ] {
        registry
            .register(
                id,
                counting_loader(id, Duration::ZERO, calls.clone()),
                ComponentConfig::new(priority),
            )
            .unwrap();
        assert!(registry.preload(id).unwrap());
    }
    assert!(!registry.preload("n1").unwrap());
    assert_eq!(registry.metrics().queued, 4);

    assert_eq!(registry.preload_tick().await, 2);
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(registry.state("c1"), Some(LoadState::Loaded));
    assert_eq!(registry.state("n1"), Some(LoadState::Loaded));
    assert_eq!(registry.state("n2"), Some(LoadState::Unloaded));
    assert_eq!(registry.state("bg"), Some(LoadState::Unloaded));

    probe.set_percent(10.0);
    assert_eq!(registry.preload_tick().await, 2);
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(registry.state("n2"), Some(LoadState::Loaded));
    assert_eq!(registry.state("bg"), Some(LoadState::Loaded));
    assert_eq!(registry.metrics().queued, 0);
}

#[tokio::test(start_paused = true)]
async fn test_background_loop_drains_queue() {
    let (registry, _) = registry_at(10.0);
    let calls = Arc::new(AtomicU32::new(0));
    registry
        .register(
            "sidebar",
            counting_loader("sidebar", Duration::ZERO, calls),
            ComponentConfig::new(Priority::Low),
        )
        .unwrap();
    registry.preload("sidebar").unwrap();

    registry.start();
    registry.start();
    assert_eq!(registry.metrics().background_tasks, 1);

    tokio::time::sleep(Duration::from_millis(2_100)).await;
    assert_eq!(registry.state("sidebar"), Some(LoadState::Loaded));

    assert_eq!(registry.shutdown(), 1);
    assert_eq!(registry.metrics().background_tasks, 0);
}

#[tokio::test(start_paused = true)]
async fn test_entries_are_ordered_by_priority() {
    let (registry, _) = registry_at(10.0);
    let calls = Arc::new(AtomicU32::new(0));
    for (id, priority) in [
        ("z", Priority::Low),
        ("b", Priority::Critical),
        ("a", Priority::Critical),
    ] {
        registry
            .register(id, counting_loader(id, Duration::ZERO, calls.clone()), ComponentConfig::new(priority))
            .unwrap();
    }
    let ids: Vec<_> = registry.entries().into_iter().map(|e| e.id).collect();
    assert_eq!(ids, ["a", "b", "z"]);

    let json = serde_json::to_value(registry.entry("z").unwrap()).unwrap();
    assert_eq!(json["priority"], "low");
    assert_eq!(json["state"], "unloaded");
    assert_eq!(json["timeout"], 10_000);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_cancels_inflight_loads() {
    let (registry, _) = registry_at(10.0);
    let calls = Arc::new(AtomicU32::new(0));
    registry
        .register(
            "reports",
            counting_loader("reports", Duration::from_secs(30), calls.clone()),
            ComponentConfig::new(Priority::Normal).timeout(Duration::from_secs(60)),
        )
        .unwrap();

    let waiter = {
        let registry = registry.clone();
        tokio::spawn(async move { registry.get_component("reports").await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(registry.state("reports"), Some(LoadState::Loading));

    registry.shutdown();
    assert_eq!(registry.state("reports"), Some(LoadState::Failed));
    let err = waiter.await.unwrap().unwrap_err();
    assert!(matches!(
        err,
        crate::Error::LoadRetriesExhausted {
            source: LoadError::Abandoned,
            ..
        }
    ));

    // The loader finishing later does not revive the cancelled cycle.
    tokio::time::sleep(Duration::from_secs(60)).await;
    let entry = registry.entry("reports").unwrap();
    assert_eq!(entry.state, LoadState::Failed);
    assert_eq!(entry.load_count, 0);
    assert_eq!(registry.metrics().loads_failed, 1);

    // A failed entry can still be loaded again.
    let widget = registry.get_component("reports").await.unwrap();
    assert_eq!(*widget, Widget("reports"));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}
