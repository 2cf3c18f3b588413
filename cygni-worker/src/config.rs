//! Worker configuration
//!
//! Defines all configurable parameters for the worker including polling and
//! lease renewal intervals, build limits, the image registry and the
//! orchestrator connection.

use std::path::PathBuf;
use std::time::Duration;

/// Worker configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Unique identifier for this worker instance
    pub worker_id: String,

    /// Orchestrator base URL (e.g., "http://localhost:8080")
    pub orchestrator_url: String,

    /// How often to poll the orchestrator for new builds
    pub poll_interval: Duration,

    /// How often to send buffered logs to the orchestrator
    pub log_send_interval: Duration,

    /// How often to renew the lease of a running build; also how quickly a
    /// cancellation is noticed
    pub lease_renew_interval: Duration,

    /// Maximum time a single build may run
    pub build_timeout: Duration,

    /// Builds executed concurrently by this worker
    pub max_parallel_builds: usize,

    /// Registry images are pushed to (e.g., "registry.local:5000/apps")
    pub image_registry: String,

    /// Directory where remote build contexts are checked out
    pub workspace_base: PathBuf,
}

impl Config {
    /// Creates a new configuration with defaults
    pub fn new(worker_id: String, orchestrator_url: String) -> Self {
        Self {
            worker_id,
            orchestrator_url,
            poll_interval: Duration::from_secs(5),
            log_send_interval: Duration::from_secs(2),
            lease_renew_interval: Duration::from_secs(20),
            build_timeout: Duration::from_secs(1800),
            max_parallel_builds: 2,
            image_registry: "localhost:5000".to_string(),
            workspace_base: std::env::temp_dir().join("cygni-builds"),
        }
    }

    /// Creates configuration from environment variables
    ///
    /// Expected environment variables:
    /// - WORKER_ID (required)
    /// - ORCHESTRATOR_URL (required)
    /// - POLL_INTERVAL (optional, seconds, default: 5)
    /// - LOG_SEND_INTERVAL (optional, seconds, default: 2)
    /// - LEASE_RENEW_INTERVAL (optional, seconds, default: 20)
    /// - BUILD_TIMEOUT (optional, seconds, default: 1800)
    /// - MAX_PARALLEL_BUILDS (optional, default: 2)
    /// - IMAGE_REGISTRY (optional, default: localhost:5000)
    /// - WORKSPACE_BASE (optional, default: $TMPDIR/cygni-builds)
    pub fn from_env() -> anyhow::Result<Self> {
        let worker_id = std::env::var("WORKER_ID")
            .map_err(|_| anyhow::anyhow!("WORKER_ID environment variable not set"))?;

        let orchestrator_url = std::env::var("ORCHESTRATOR_URL")
            .map_err(|_| anyhow::anyhow!("ORCHESTRATOR_URL environment variable not set"))?;

        let defaults = Self::new(worker_id, orchestrator_url);

        Ok(Self {
            poll_interval: env_secs("POLL_INTERVAL").unwrap_or(defaults.poll_interval),
            log_send_interval: env_secs("LOG_SEND_INTERVAL")
                .unwrap_or(defaults.log_send_interval),
            lease_renew_interval: env_secs("LEASE_RENEW_INTERVAL")
                .unwrap_or(defaults.lease_renew_interval),
            build_timeout: env_secs("BUILD_TIMEOUT").unwrap_or(defaults.build_timeout),
            max_parallel_builds: std::env::var("MAX_PARALLEL_BUILDS")
                .ok()
                .and_then(|s| s.parse::<usize>().ok())
                .unwrap_or(defaults.max_parallel_builds),
            image_registry: std::env::var("IMAGE_REGISTRY").unwrap_or(defaults.image_registry),
            workspace_base: std::env::var("WORKSPACE_BASE")
                .map(PathBuf::from)
                .unwrap_or(defaults.workspace_base),
            ..defaults
        })
    }

    /// Validates the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.worker_id.is_empty() {
            anyhow::bail!("worker_id cannot be empty");
        }

        if !self.orchestrator_url.starts_with("http://")
            && !self.orchestrator_url.starts_with("https://")
        {
            anyhow::bail!("orchestrator_url must start with http:// or https://");
        }

        if self.poll_interval.as_secs() == 0 {
            anyhow::bail!("poll_interval must be greater than 0");
        }

        if self.log_send_interval.as_secs() == 0 {
            anyhow::bail!("log_send_interval must be greater than 0");
        }

        if self.lease_renew_interval.as_secs() == 0 {
            anyhow::bail!("lease_renew_interval must be greater than 0");
        }

        if self.build_timeout.as_secs() == 0 {
            anyhow::bail!("build_timeout must be greater than 0");
        }

        if self.max_parallel_builds == 0 {
            anyhow::bail!("max_parallel_builds must be at least 1");
        }

        if self.image_registry.trim().is_empty() {
            anyhow::bail!("image_registry cannot be empty");
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new(
            uuid::Uuid::new_v4().to_string(),
            "http://localhost:8080".to_string(),
        )
    }
}

fn env_secs(name: &str) -> Option<Duration> {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.poll_interval, Duration::from_secs(5));
        assert_eq!(config.build_timeout, Duration::from_secs(1800));
        assert_eq!(config.max_parallel_builds, 2);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();

        config.worker_id = String::new();
        assert!(config.validate().is_err());
        config.worker_id = "worker-1".to_string();

        config.orchestrator_url = "not-a-url".to_string();
        assert!(config.validate().is_err());
        config.orchestrator_url = "http://localhost:8080".to_string();

        config.max_parallel_builds = 0;
        assert!(config.validate().is_err());
        config.max_parallel_builds = 4;

        assert!(config.validate().is_ok());
    }
}
