use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    RouteChange,
    AuthChange,
    StorageChange,
    Error,
}

impl EventKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::RouteChange => "route-change",
            Self::AuthChange => "auth-change",
            Self::StorageChange => "storage-change",
            Self::Error => "error",
        }
    }
}

/// A normalized navigation or host signal delivered to listeners.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NavigationEvent {
    pub kind: EventKind,
    pub path: String,
    pub query_params: BTreeMap<String, String>,
    pub timestamp: DateTime<Utc>,
    pub meta: Option<serde_json::Value>,
}

impl NavigationEvent {
    /// Build an event from a location such as `/reports?page=2#top`.
    /// The fragment is dropped and repeated query keys keep the last value.
    pub fn new(kind: EventKind, location: &str) -> Self {
        let (path, query_params) = split_location(location);
        Self {
            kind,
            path,
            query_params,
            timestamp: Utc::now(),
            meta: None,
        }
    }

    #[must_use]
    pub fn with_meta(mut self, meta: serde_json::Value) -> Self {
        self.meta = Some(meta);
        self
    }

    pub fn query(&self, key: &str) -> Option<&str> {
        self.query_params.get(key).map(String::as_str)
    }
}

fn split_location(location: &str) -> (String, BTreeMap<String, String>) {
    let without_fragment = location.split('#').next().unwrap_or_default();
    let (path, query) = match without_fragment.split_once('?') {
        Some((path, query)) => (path, query),
        None => (without_fragment, ""),
    };
    let path = if path.is_empty() { "/" } else { path };
    let params = url::form_urlencoded::parse(query.as_bytes())
        .into_owned()
        .collect();
    (path.to_string(), params)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_location_is_split_into_path_and_query() {
        let event = NavigationEvent::new(
            EventKind::RouteChange,
            "/reports/q3?page=2&title=hello%20world&page=3#summary",
        );
        assert_eq!(event.path, "/reports/q3");
        assert_eq!(event.query("page"), Some("3"));
        assert_eq!(event.query("title"), Some("hello world"));
        assert_eq!(event.query_params.len(), 2);
    }

    #[test]
    fn test_empty_location_is_root() {
        let event = NavigationEvent::new(EventKind::Error, "?retry=1");
        assert_eq!(event.path, "/");
        assert_eq!(event.query("retry"), Some("1"));
        assert!(NavigationEvent::new(EventKind::Error, "").query_params.is_empty());
    }

    #[test]
    fn test_kind_serializes_kebab_case() {
        let event = NavigationEvent::new(EventKind::StorageChange, "/")
            .with_meta(serde_json::json!({ "key": "ff_theme" }));
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], EventKind::StorageChange.as_str());
        assert_eq!(json["meta"]["key"], "ff_theme");
    }
}
