use std::path::PathBuf;
use std::time::Duration;

use appset_apply::StickyKeys;

/// Runtime knobs, read from `APPSET_*` environment variables.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Namespace to watch; `None` watches all namespaces.
    pub namespace: Option<String>,
    pub sticky: StickyKeys,
    pub cycle_timeout: Duration,
    pub validation_requeue: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// Directory holding checked-out repositories for the git generator.
    pub repo_root: PathBuf,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            namespace: None,
            sticky: StickyKeys::default(),
            cycle_timeout: Duration::from_secs(60),
            validation_requeue: Duration::from_secs(180),
            backoff_base: Duration::from_secs(5),
            backoff_max: Duration::from_secs(300),
            repo_root: PathBuf::from("/var/lib/appset/repos"),
        }
    }
}

fn env_secs(key: &str, default: Duration) -> Duration {
    std::env::var(key).ok().and_then(|s| s.parse::<u64>().ok()).map(Duration::from_secs).unwrap_or(default)
}

/// Comma separated list; blanks dropped.
pub fn parse_sticky(raw: &str) -> StickyKeys {
    StickyKeys::new(raw.split(',').map(str::trim).filter(|s| !s.is_empty()))
}

impl ControllerConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            namespace: std::env::var("APPSET_NAMESPACE").ok().filter(|s| !s.is_empty()),
            sticky: std::env::var("APPSET_STICKY_ANNOTATIONS").ok().map(|s| parse_sticky(&s)).unwrap_or(d.sticky),
            cycle_timeout: env_secs("APPSET_CYCLE_TIMEOUT_SECS", d.cycle_timeout),
            validation_requeue: env_secs("APPSET_VALIDATION_REQUEUE_SECS", d.validation_requeue),
            backoff_base: env_secs("APPSET_BACKOFF_BASE_SECS", d.backoff_base),
            backoff_max: env_secs("APPSET_BACKOFF_MAX_SECS", d.backoff_max),
            repo_root: std::env::var("APPSET_REPO_ROOT").ok().map(PathBuf::from).unwrap_or(d.repo_root),
        }
    }
}
