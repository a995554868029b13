//! Simulated application traffic driving the runtime services.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use fusion_runtime::host::StaticMemoryProbe;
use fusion_runtime::{BoxError, ClientRuntime, ComponentConfig, Priority};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// What a loaded mock component holds.
#[derive(Debug)]
pub struct DemoComponent {
    pub id: &'static str,
    pub bundle_kb: u32,
}

struct MockProfile {
    id: &'static str,
    priority: Priority,
    preload: bool,
    latency_ms: (u64, u64),
    failure_rate: f64,
}

const COMPONENTS: &[MockProfile] = &[
    MockProfile { id: "app-shell", priority: Priority::Critical, preload: true, latency_ms: (20, 60), failure_rate: 0.0 },
    MockProfile { id: "dashboard", priority: Priority::Critical, preload: false, latency_ms: (40, 120), failure_rate: 0.05 },
    MockProfile { id: "project-list", priority: Priority::High, preload: true, latency_ms: (60, 200), failure_rate: 0.1 },
    MockProfile { id: "editor", priority: Priority::Normal, preload: false, latency_ms: (150, 600), failure_rate: 0.15 },
    MockProfile { id: "analytics", priority: Priority::Low, preload: false, latency_ms: (300, 1_500), failure_rate: 0.25 },
    MockProfile { id: "billing", priority: Priority::Low, preload: false, latency_ms: (100, 400), failure_rate: 0.1 },
    MockProfile { id: "changelog", priority: Priority::Background, preload: true, latency_ms: (50, 150), failure_rate: 0.0 },
];

pub const ROUTES: &[&str] = &[
    "/dashboard",
    "/projects",
    "/projects/42?tab=files",
    "/editor/42",
    "/analytics?range=7d",
    "/settings/billing",
];

const ERRORS: &[(&str, &str)] = &[
    ("TypeError", "Failed to fetch /api/projects"),
    ("Error", "Session expired, please login again"),
    ("ChunkLoadError", "Loading chunk editor failed"),
    ("Error", "Hydration mismatch in ProjectCard component"),
    ("Error", "403 Forbidden: billing"),
    ("Warning", "Long task blocked the main thread for 230ms"),
    ("Error", "Unexpected end of JSON input"),
];

pub fn register_components(runtime: &ClientRuntime<DemoComponent>) -> fusion_runtime::Result<()> {
    for profile in COMPONENTS {
        let id = profile.id;
        let (min, max) = profile.latency_ms;
        let failure_rate = profile.failure_rate;
        runtime.registry().register(
            id,
            move || {
                let mut rng = rand::thread_rng();
                let delay = Duration::from_millis(rng.gen_range(min..=max));
                let fails = rng.gen_bool(failure_rate);
                let bundle_kb = rng.gen_range(20..400);
                async move {
                    tokio::time::sleep(delay).await;
                    if fails {
                        return Err::<DemoComponent, BoxError>(format!("chunk for {id} failed to load").into());
                    }
                    Ok(DemoComponent { id, bundle_kb })
                }
            },
            ComponentConfig::new(profile.priority).preload(profile.preload),
        )?;
    }
    Ok(())
}

pub fn component_ids() -> impl Iterator<Item = &'static str> {
    COMPONENTS.iter().map(|profile| profile.id)
}

/// One simulated user action.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    Navigate(&'static str),
    Render(&'static str),
    Report(&'static str, &'static str),
    StorageWrite(&'static str),
    Preload(&'static str),
}

impl Step {
    /// Run the action against the runtime. Loads may take several seconds
    /// when a component retries.
    pub async fn run(self, runtime: &ClientRuntime<DemoComponent>) -> String {
        match self {
            Step::Navigate(route) => match runtime.bus().navigate(route) {
                Ok(()) => format!("navigate {route}"),
                Err(err) => format!("navigate failed: {err}"),
            },
            Step::Render(id) => match runtime.registry().get_component(id).await {
                Ok(component) => format!("render {} ({} KB)", component.id, component.bundle_kb),
                Err(err) => format!("render failed: {err}"),
            },
            Step::Report(name, message) => {
                runtime.bus().notify_named_error(name, message);
                format!("report {name}")
            }
            Step::StorageWrite(key) => {
                runtime.bus().notify_storage_change(key, Some("light"), Some("dark"));
                format!("storage {key}")
            }
            Step::Preload(id) => match runtime.registry().preload(id) {
                Ok(true) => format!("preload {id}"),
                Ok(false) => format!("preload {id} skipped"),
                Err(err) => format!("preload failed: {err}"),
            },
        }
    }
}

/// Picks random actions and drifts the simulated heap toward its target.
pub struct Scenario {
    memory: Arc<StaticMemoryProbe>,
    rng: StdRng,
    memory_percent: f64,
    pressure: Arc<AtomicBool>,
}

impl Scenario {
    pub fn new(memory: Arc<StaticMemoryProbe>) -> Self {
        Self {
            memory,
            rng: StdRng::from_entropy(),
            memory_percent: 35.0,
            pressure: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag pushing the heap toward 93 % while set.
    pub fn pressure(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.pressure)
    }

    pub fn next_step(&mut self) -> Step {
        self.drift_memory();
        match self.rng.gen_range(0..10) {
            0..=3 => Step::Navigate(ROUTES[self.rng.gen_range(0..ROUTES.len())]),
            4..=6 => Step::Render(COMPONENTS[self.rng.gen_range(0..COMPONENTS.len())].id),
            7 => {
                let (name, message) = ERRORS[self.rng.gen_range(0..ERRORS.len())];
                Step::Report(name, message)
            }
            8 => Step::StorageWrite(if self.rng.gen_bool(0.7) { "ff_theme" } else { "vendor_session" }),
            _ => Step::Preload(COMPONENTS[self.rng.gen_range(3..COMPONENTS.len())].id),
        }
    }

    fn drift_memory(&mut self) {
        let target = if self.pressure.load(Ordering::Relaxed) { 93.0 } else { 40.0 };
        let delta: f64 = self.rng.gen_range(-3.0..3.0);
        self.memory_percent += (target - self.memory_percent) * 0.2 + delta;
        self.memory_percent = self.memory_percent.clamp(5.0, 99.0);
        self.memory.set_percent(self.memory_percent);
    }
}
