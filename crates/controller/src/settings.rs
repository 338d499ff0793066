use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

/// Driver configuration, read from `CAIRN_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub workers: usize,
    pub steady_requeue: Duration,
    pub pending_requeue: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub cycle_timeout: Duration,
    pub field_manager: String,
    /// Restrict watches to one namespace; all namespaces when unset.
    pub watch_namespace: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            workers: 4,
            steady_requeue: Duration::from_secs(300),
            pending_requeue: Duration::from_secs(5),
            backoff_base: Duration::from_millis(500),
            backoff_max: Duration::from_secs(300),
            cycle_timeout: Duration::from_secs(60),
            field_manager: "cairn".to_string(),
            watch_namespace: None,
        }
    }
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> T {
    match lookup(name) {
        Some(raw) => match raw.trim().parse::<T>() {
            Ok(v) => v,
            Err(_) => {
                warn!(var = name, value = %raw, "malformed setting; using default");
                default
            }
        },
        None => default,
    }
}

impl Settings {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any variable source; malformed values fall back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let d = Self::default();
        Self {
            workers: parsed(&lookup, "CAIRN_WORKERS", d.workers).max(1),
            steady_requeue: Duration::from_secs(parsed(&lookup, "CAIRN_STEADY_REQUEUE_SECS", d.steady_requeue.as_secs())),
            pending_requeue: Duration::from_secs(parsed(&lookup, "CAIRN_PENDING_REQUEUE_SECS", d.pending_requeue.as_secs())),
            backoff_base: Duration::from_millis(parsed(&lookup, "CAIRN_BACKOFF_BASE_MS", d.backoff_base.as_millis() as u64)),
            backoff_max: Duration::from_secs(parsed(&lookup, "CAIRN_BACKOFF_MAX_SECS", d.backoff_max.as_secs())),
            cycle_timeout: Duration::from_secs(parsed(&lookup, "CAIRN_CYCLE_TIMEOUT_SECS", d.cycle_timeout.as_secs())),
            field_manager: lookup("CAIRN_FIELD_MANAGER").filter(|s| !s.is_empty()).unwrap_or(d.field_manager),
            watch_namespace: lookup("CAIRN_WATCH_NAMESPACE").filter(|s| !s.is_empty()),
        }
    }
}
