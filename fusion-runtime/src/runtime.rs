//! Client runtime: the bootstrap object owning one instance of every service.

use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::RuntimeConfig;
use crate::diagnostics::{
    ClassifiedError, ErrorContext, ErrorService, ErrorStats, HealthChecker, HostRemediator,
    RawError,
};
use crate::error::BoxError;
use crate::host::{ClientHost, MemoryMonitor};
use crate::navigation::{BusMetrics, EventKind, ListenerOptions, NavigationBus, Subscription};
use crate::registry::{ComponentRegistry, EntrySnapshot, RegistryMetrics};
use crate::task;

/// Everything a debug panel shows, captured at one instant.
#[derive(Debug, Clone, Serialize)]
pub struct RuntimeSnapshot {
    pub taken_at: DateTime<Utc>,
    pub current_path: String,
    pub registry: RegistryMetrics,
    pub entries: Vec<EntrySnapshot>,
    pub bus: BusMetrics,
    pub errors: ErrorStats,
    pub recent_errors: Vec<ClassifiedError>,
}

/// Owns the registry, bus and error service built over one [`ClientHost`].
///
/// The bus spawns its drain tasks on construction, so `new` must be called
/// inside a tokio runtime.
pub struct ClientRuntime<C> {
    config: RuntimeConfig,
    host: ClientHost,
    registry: ComponentRegistry<C>,
    bus: NavigationBus,
    errors: ErrorService,
    error_forwarding: Mutex<Option<Subscription>>,
}

impl<C> std::fmt::Debug for ClientRuntime<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientRuntime")
            .field("bus", &self.bus)
            .field("errors", &self.errors)
            .finish_non_exhaustive()
    }
}

impl<C: Send + Sync + 'static> ClientRuntime<C> {
    pub fn new(config: RuntimeConfig, host: ClientHost) -> crate::Result<Self> {
        config.validate()?;
        let memory = MemoryMonitor::from_arc(host.memory.clone());
        let registry = ComponentRegistry::new(config.registry.clone(), memory.clone());
        let bus = NavigationBus::new(config.bus.clone(), host.history.clone());
        let remediator = HostRemediator::new(host.store.clone(), config.errors.clone())
            .with_navigator(Arc::new(bus.clone()));
        let checker = HealthChecker::new(
            host.store.clone(),
            host.network.clone(),
            memory,
            config.errors.clone(),
        );
        let errors = ErrorService::new(config.errors.clone(), checker, Arc::new(remediator));
        tracing::info!(
            tick_ms = config.registry.tick_interval_ms,
            health_ms = config.errors.health_interval_ms,
            "runtime.created"
        );
        Ok(Self {
            config,
            host,
            registry,
            bus,
            errors,
            error_forwarding: Mutex::new(None),
        })
    }

    /// Start the background loops and route bus `error` events into the
    /// error service. Calling it twice is a no-op.
    pub fn start(&self) {
        self.registry.start();
        self.errors.start();

        let mut forwarding = self
            .error_forwarding
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if forwarding.is_some() {
            return;
        }
        let errors = self.errors.clone();
        *forwarding = Some(self.bus.add_listener(
            move |event| {
                let errors = errors.clone();
                async move {
                    if event.kind != EventKind::Error {
                        return Ok::<(), BoxError>(());
                    }
                    let field = |key: &str| {
                        event
                            .meta
                            .as_ref()
                            .and_then(|meta| meta.get(key))
                            .and_then(serde_json::Value::as_str)
                    };
                    let raw = RawError::new(
                        field("name").unwrap_or("Error"),
                        field("message").unwrap_or("unspecified error"),
                    );
                    let context = ErrorContext::new().url(event.path.clone());
                    // Recovery is bounded by its own timeout, not the listener's.
                    task::spawn("runtime.handle_error", async move {
                        errors.handle_error(&raw, context).await;
                    });
                    Ok(())
                }
            },
            ListenerOptions::new().priority(i32::MAX),
        ));
        tracing::info!("runtime.started");
    }

    /// Stop every background task and destroy the bus. Safe to call twice.
    pub fn shutdown(&self) {
        self.registry.shutdown();
        self.errors.shutdown();
        if let Some(subscription) = self
            .error_forwarding
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            subscription.unsubscribe();
        }
        match self.bus.destroy() {
            Ok(()) => tracing::info!("runtime.shutdown"),
            Err(err) => tracing::debug!(error = %err, "runtime.shutdown.repeated"),
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn host(&self) -> &ClientHost {
        &self.host
    }

    pub fn registry(&self) -> &ComponentRegistry<C> {
        &self.registry
    }

    pub fn bus(&self) -> &NavigationBus {
        &self.bus
    }

    pub fn errors(&self) -> &ErrorService {
        &self.errors
    }

    pub fn snapshot(&self) -> RuntimeSnapshot {
        RuntimeSnapshot {
            taken_at: Utc::now(),
            current_path: self.bus.current_path(),
            registry: self.registry.metrics(),
            entries: self.registry.entries(),
            bus: self.bus.metrics(),
            errors: self.errors.stats(),
            recent_errors: self.errors.recent_errors(10),
        }
    }
}
