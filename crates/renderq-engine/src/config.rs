//! Engine configuration.

use std::time::Duration;

use uuid::Uuid;

/// Engine configuration.
///
/// `heartbeat_interval` must stay strictly shorter than `lease_cutoff`,
/// otherwise a healthy worker looks dead to the reaper.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Identity of this worker instance in the lease table
    pub instance_id: String,
    /// Maximum concurrent render executions
    pub max_concurrent: usize,
    /// Maximum locally pending (admitted, unclaimed) jobs
    pub max_queue_size: usize,
    /// Interval for refreshing lease heartbeats while executing
    pub heartbeat_interval: Duration,
    /// Staleness cutoff after which the reaper reclaims a lease
    pub lease_cutoff: Duration,
    /// Interval between reaper scans
    pub reaper_interval: Duration,
    /// Execution attempts (including crash recoveries) before a key fails
    /// terminally
    pub max_attempts: u32,
    /// Single render execution timeout
    pub render_timeout: Duration,
    /// How often to pull queued leases from the store into free local slots
    pub pickup_interval: Duration,
    /// Grace period for in-flight executions during shutdown
    pub shutdown_grace: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            instance_id: format!("worker-{}", Uuid::new_v4()),
            max_concurrent: 2,
            max_queue_size: 64,
            heartbeat_interval: Duration::from_secs(30),
            lease_cutoff: Duration::from_secs(3600), // 1 hour
            reaper_interval: Duration::from_secs(60),
            max_attempts: 3,
            render_timeout: Duration::from_secs(1800), // 30 minutes
            pickup_interval: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

impl EngineConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            instance_id: std::env::var("RENDERQ_INSTANCE_ID").unwrap_or(defaults.instance_id),
            max_concurrent: env_parse("RENDERQ_MAX_CONCURRENT", defaults.max_concurrent),
            max_queue_size: env_parse("RENDERQ_MAX_QUEUE_SIZE", defaults.max_queue_size),
            heartbeat_interval: env_secs("RENDERQ_HEARTBEAT_SECS", defaults.heartbeat_interval),
            lease_cutoff: env_secs("RENDERQ_LEASE_CUTOFF_SECS", defaults.lease_cutoff),
            reaper_interval: env_secs("RENDERQ_REAPER_INTERVAL_SECS", defaults.reaper_interval),
            max_attempts: env_parse("RENDERQ_MAX_ATTEMPTS", defaults.max_attempts),
            render_timeout: env_secs("RENDERQ_RENDER_TIMEOUT_SECS", defaults.render_timeout),
            pickup_interval: env_secs("RENDERQ_PICKUP_INTERVAL_SECS", defaults.pickup_interval),
            shutdown_grace: env_secs("RENDERQ_SHUTDOWN_GRACE_SECS", defaults.shutdown_grace),
        }
    }

    /// Check the heartbeat/cutoff relation.
    pub fn validate(&self) -> Result<(), String> {
        if self.heartbeat_interval >= self.lease_cutoff {
            return Err(format!(
                "heartbeat_interval ({:?}) must be strictly shorter than lease_cutoff ({:?})",
                self.heartbeat_interval, self.lease_cutoff
            ));
        }
        if self.max_concurrent == 0 {
            return Err("max_concurrent must be at least 1".to_string());
        }
        if self.max_attempts == 0 {
            return Err("max_attempts must be at least 1".to_string());
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(var: &str, default: T) -> T {
    std::env::var(var)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn env_secs(var: &str, default: Duration) -> Duration {
    std::env::var(var)
        .ok()
        .and_then(|s| s.parse().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}
