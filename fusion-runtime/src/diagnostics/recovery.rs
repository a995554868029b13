//! Recovery actions and the remediator that applies them to the host.

use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use super::classify::ErrorCategory;
use crate::config::ErrorServiceConfig;
use crate::error::BoxError;
use crate::host::KeyValueStore;
use crate::navigation::Navigator;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    /// Drop the stored credentials and send the user to the login path.
    ResetCredentials,
    /// Drop oversized cached values.
    ReleaseMemory,
    /// Replace the current location with itself.
    SoftReload,
    /// Switch the application to its reduced-feature mode.
    EnableDegradedMode,
    /// Clear the application storage namespace.
    ClearCache,
}

impl RecoveryAction {
    pub const fn for_category(category: ErrorCategory) -> Self {
        match category {
            ErrorCategory::Authentication => Self::ResetCredentials,
            ErrorCategory::Memory => Self::ReleaseMemory,
            ErrorCategory::Network => Self::SoftReload,
            ErrorCategory::Performance => Self::EnableDegradedMode,
            ErrorCategory::Navigation
            | ErrorCategory::Rendering
            | ErrorCategory::Permissions
            | ErrorCategory::Unknown => Self::ClearCache,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ResetCredentials => "reset_credentials",
            Self::ReleaseMemory => "release_memory",
            Self::SoftReload => "soft_reload",
            Self::EnableDegradedMode => "enable_degraded_mode",
            Self::ClearCache => "clear_cache",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RecoveryOutcome {
    InProgress { action: RecoveryAction },
    Succeeded { action: RecoveryAction, detail: String },
    Failed { action: RecoveryAction, reason: String },
    AlreadyAttempted,
    Skipped { reason: String },
}

impl RecoveryOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded { .. })
    }
}

/// Applies recovery actions to the host environment.
#[async_trait]
pub trait Remediator: Send + Sync + Debug + 'static {
    /// Returns a short description of what was done.
    async fn apply(&self, action: RecoveryAction) -> Result<String, BoxError>;
}

/// Remediator over the host key-value store and an optional navigator.
#[derive(Debug, Clone)]
pub struct HostRemediator {
    store: Arc<dyn KeyValueStore>,
    navigator: Option<Arc<dyn Navigator>>,
    config: ErrorServiceConfig,
}

impl HostRemediator {
    pub fn new(store: Arc<dyn KeyValueStore>, config: ErrorServiceConfig) -> Self {
        Self {
            store,
            navigator: None,
            config,
        }
    }

    #[must_use]
    pub fn with_navigator(mut self, navigator: Arc<dyn Navigator>) -> Self {
        self.navigator = Some(navigator);
        self
    }

    fn navigator(&self) -> Result<&Arc<dyn Navigator>, BoxError> {
        self.navigator
            .as_ref()
            .ok_or_else(|| "no navigator attached".into())
    }

    fn namespaced_keys(&self) -> Vec<String> {
        self.store.keys_with_prefix(&self.config.storage_namespace)
    }
}

#[async_trait]
impl Remediator for HostRemediator {
    async fn apply(&self, action: RecoveryAction) -> Result<String, BoxError> {
        match action {
            RecoveryAction::ResetCredentials => {
                let had_token = self.store.remove(&self.config.auth_token_key).is_some();
                self.navigator()?.navigate(&self.config.login_path)?;
                Ok(format!(
                    "credentials reset (token present: {had_token}), redirected to {}",
                    self.config.login_path
                ))
            }
            RecoveryAction::ReleaseMemory => {
                let limit = self.config.cache_entry_limit_bytes;
                let released = self
                    .namespaced_keys()
                    .into_iter()
                    .filter(|key| {
                        self.store
                            .get(key)
                            .is_some_and(|value| value.len() > limit)
                    })
                    .filter(|key| self.store.remove(key).is_some())
                    .count();
                Ok(format!("released {released} cached value(s) over {limit} bytes"))
            }
            RecoveryAction::SoftReload => {
                let navigator = self.navigator()?;
                let location = navigator.current_path();
                navigator.replace(&location)?;
                Ok(format!("reloaded {location}"))
            }
            RecoveryAction::EnableDegradedMode => {
                self.store.set(&self.config.degraded_mode_key, "true")?;
                Ok("reduced-feature mode enabled".to_string())
            }
            RecoveryAction::ClearCache => {
                let kept = [
                    self.config.auth_token_key.as_str(),
                    self.config.degraded_mode_key.as_str(),
                ];
                let cleared = self
                    .namespaced_keys()
                    .into_iter()
                    .filter(|key| !kept.contains(&key.as_str()))
                    .filter(|key| self.store.remove(key).is_some())
                    .count();
                Ok(format!("cleared {cleared} cached value(s)"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::host::MemoryStore;

    #[derive(Debug, Default)]
    struct RecordingNavigator {
        calls: Mutex<Vec<String>>,
    }

    impl Navigator for RecordingNavigator {
        fn navigate(&self, path: &str) -> crate::Result<()> {
            self.calls.lock().unwrap().push(format!("push {path}"));
            Ok(())
        }

        fn replace(&self, path: &str) -> crate::Result<()> {
            self.calls.lock().unwrap().push(format!("replace {path}"));
            Ok(())
        }

        fn current_path(&self) -> String {
            "/reports".to_string()
        }
    }

    fn fixture() -> (HostRemediator, Arc<MemoryStore>, Arc<RecordingNavigator>) {
        let store = Arc::new(MemoryStore::new());
        let navigator = Arc::new(RecordingNavigator::default());
        let remediator = HostRemediator::new(store.clone(), ErrorServiceConfig::default())
            .with_navigator(navigator.clone());
        (remediator, store, navigator)
    }

    #[test]
    fn test_category_actions() {
        assert_eq!(
            RecoveryAction::for_category(ErrorCategory::Authentication),
            RecoveryAction::ResetCredentials
        );
        assert_eq!(
            RecoveryAction::for_category(ErrorCategory::Performance),
            RecoveryAction::EnableDegradedMode
        );
        assert_eq!(
            RecoveryAction::for_category(ErrorCategory::Permissions),
            RecoveryAction::ClearCache
        );
    }

    #[tokio::test]
    async fn test_reset_credentials_redirects_to_login() {
        let (remediator, store, navigator) = fixture();
        store.set("ff_auth_token", "abc").unwrap();

        remediator.apply(RecoveryAction::ResetCredentials).await.unwrap();
        assert_eq!(store.get("ff_auth_token"), None);
        assert_eq!(*navigator.calls.lock().unwrap(), ["push /login"]);
    }

    #[tokio::test]
    async fn test_soft_reload_replaces_current_location() {
        let (remediator, _, navigator) = fixture();
        let detail = remediator.apply(RecoveryAction::SoftReload).await.unwrap();
        assert_eq!(detail, "reloaded /reports");
        assert_eq!(*navigator.calls.lock().unwrap(), ["replace /reports"]);
    }

    #[tokio::test]
    async fn test_release_memory_drops_only_oversized_values() {
        let (remediator, store, _) = fixture();
        store.set("ff_small", "x").unwrap();
        store.set("ff_large", &"x".repeat(70 * 1024)).unwrap();
        store.set("vendor_large", &"x".repeat(70 * 1024)).unwrap();

        remediator.apply(RecoveryAction::ReleaseMemory).await.unwrap();
        assert!(store.get("ff_small").is_some());
        assert!(store.get("ff_large").is_none());
        assert!(store.get("vendor_large").is_some());
    }

    #[tokio::test]
    async fn test_clear_cache_keeps_credentials() {
        let (remediator, store, _) = fixture();
        store.set("ff_auth_token", "abc").unwrap();
        store.set("ff_dashboard_layout", "{}").unwrap();
        store.set("other", "1").unwrap();

        let detail = remediator.apply(RecoveryAction::ClearCache).await.unwrap();
        assert_eq!(detail, "cleared 1 cached value(s)");
        assert_eq!(store.keys(), ["ff_auth_token", "other"]);
    }

    #[tokio::test]
    async fn test_degraded_mode_fails_on_read_only_store() {
        let (remediator, store, _) = fixture();
        store.set_read_only(true);
        assert!(remediator.apply(RecoveryAction::EnableDegradedMode).await.is_err());

        store.set_read_only(false);
        remediator.apply(RecoveryAction::EnableDegradedMode).await.unwrap();
        assert_eq!(store.get("ff_degraded_mode").as_deref(), Some("true"));
    }

    #[tokio::test]
    async fn test_navigation_actions_need_a_navigator() {
        let remediator = HostRemediator::new(Arc::new(MemoryStore::new()), ErrorServiceConfig::default());
        let err = remediator.apply(RecoveryAction::SoftReload).await.unwrap_err();
        assert_eq!(err.to_string(), "no navigator attached");
    }
}
