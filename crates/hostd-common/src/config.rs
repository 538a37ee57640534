//! Operational tunables for the coordinator.
//!
//! The retry ceiling, reconcile tick, and the rest of the knobs here are
//! deployment-specific, so every one of them can be overridden through a
//! `HOSTD_*` environment variable. Defaults target a small single-host
//! deployment.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// SQLite database path for the state store.
    pub db_path: PathBuf,
    /// HTTP listen address of the API layer.
    pub listen_addr: SocketAddr,
    /// Reconciliation tick interval.
    pub reconcile_interval: Duration,
    /// Resource monitor sampling interval.
    pub sample_interval: Duration,
    /// Maximum attempts per lifecycle task before it is marked failed.
    pub retry_ceiling: u32,
    /// Base delay for exponential worker backoff (doubles per attempt).
    pub retry_base_delay: Duration,
    /// Self-healing restarts allowed per instance before it stays failed.
    pub restart_budget: u32,
    /// Consecutive over-threshold samples before a corrective stop.
    pub breach_samples: u32,
    /// Number of queue workers.
    pub workers: usize,
    /// Per-call timeout for container runtime operations.
    pub driver_timeout: Duration,
    /// Ticks an instance may stay drifted before an alert is raised.
    pub drift_alert_ticks: u32,
    /// Resource samples older than this are pruned.
    pub sample_retention: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("hostd.db"),
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            reconcile_interval: Duration::from_millis(2000),
            sample_interval: Duration::from_millis(5000),
            retry_ceiling: 5,
            retry_base_delay: Duration::from_millis(100),
            restart_budget: 3,
            breach_samples: 3,
            workers: 4,
            driver_timeout: Duration::from_millis(30_000),
            drift_alert_ticks: 10,
            sample_retention: Duration::from_secs(3600),
        }
    }
}

impl CoordinatorConfig {
    /// Build a config from the environment, falling back to defaults for
    /// anything unset or unparsable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            db_path: std::env::var("HOSTD_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.db_path),
            listen_addr: env_parse("HOSTD_LISTEN_ADDR", defaults.listen_addr),
            reconcile_interval: env_millis("HOSTD_RECONCILE_INTERVAL_MS", defaults.reconcile_interval),
            sample_interval: env_millis("HOSTD_SAMPLE_INTERVAL_MS", defaults.sample_interval),
            retry_ceiling: env_parse("HOSTD_RETRY_CEILING", defaults.retry_ceiling),
            retry_base_delay: env_millis("HOSTD_RETRY_BASE_DELAY_MS", defaults.retry_base_delay),
            restart_budget: env_parse("HOSTD_RESTART_BUDGET", defaults.restart_budget),
            breach_samples: env_parse("HOSTD_BREACH_SAMPLES", defaults.breach_samples),
            workers: env_parse("HOSTD_WORKERS", defaults.workers),
            driver_timeout: env_millis("HOSTD_DRIVER_TIMEOUT_MS", defaults.driver_timeout),
            drift_alert_ticks: env_parse("HOSTD_DRIFT_ALERT_TICKS", defaults.drift_alert_ticks),
            sample_retention: Duration::from_secs(env_parse(
                "HOSTD_SAMPLE_RETENTION_SECS",
                defaults.sample_retention.as_secs(),
            )),
        }
    }
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_millis(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CoordinatorConfig::default();
        assert_eq!(config.retry_ceiling, 5);
        assert_eq!(config.breach_samples, 3);
        assert_eq!(config.reconcile_interval, Duration::from_millis(2000));
    }

    #[test]
    fn test_env_overrides() {
        std::env::set_var("HOSTD_RETRY_CEILING", "7");
        std::env::set_var("HOSTD_RECONCILE_INTERVAL_MS", "250");
        let config = CoordinatorConfig::from_env();
        assert_eq!(config.retry_ceiling, 7);
        assert_eq!(config.reconcile_interval, Duration::from_millis(250));
        std::env::remove_var("HOSTD_RETRY_CEILING");
        std::env::remove_var("HOSTD_RECONCILE_INTERVAL_MS");

        // Garbage values fall back to defaults rather than panicking.
        std::env::set_var("HOSTD_WORKERS", "not-a-number");
        let config = CoordinatorConfig::from_env();
        assert_eq!(config.workers, CoordinatorConfig::default().workers);
        std::env::remove_var("HOSTD_WORKERS");
    }
}
