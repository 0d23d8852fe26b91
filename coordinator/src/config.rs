//! Coordinator configuration.

use std::time::Duration;

use clusteradmin_common::{constants, DurationExt};

/// Cluster operation lock configuration.
#[derive(Debug, Clone)]
pub struct LockConfig {
    /// Default lock duration.
    pub default_duration: Duration,
    /// Maximum lock duration.
    pub max_duration: Duration,
    /// Lock cleanup interval.
    pub cleanup_interval: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            default_duration: constants::default_lock_duration().as_std(),
            max_duration: constants::max_lock_duration().as_std(),
            cleanup_interval: Duration::from_secs(1),
        }
    }
}

/// Fan-out to existing members (seed lists, auto-increment).
#[derive(Debug, Clone)]
pub struct PropagationConfig {
    /// Update members concurrently.
    pub parallel: bool,
    /// Maximum members updated at once when parallel.
    pub max_in_flight: usize,
}

impl Default for PropagationConfig {
    fn default() -> Self {
        Self {
            parallel: true,
            max_in_flight: 8,
        }
    }
}

/// Main coordinator configuration.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Upper bound on each remote call.
    pub remote_call_timeout: Duration,
    /// How long a join waits for the new member to reach ONLINE by default.
    pub recovery_wait_timeout: Duration,
    /// Interval between member state polls during that wait.
    pub recovery_poll_interval: Duration,
    /// Lock configuration.
    pub lock_config: LockConfig,
    /// Member fan-out configuration.
    pub propagation: PropagationConfig,
    /// Log level.
    pub log_level: String,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            remote_call_timeout: constants::remote_call_timeout().as_std(),
            recovery_wait_timeout: constants::recovery_wait_timeout().as_std(),
            recovery_poll_interval: constants::recovery_poll_interval().as_std(),
            lock_config: LockConfig::default(),
            propagation: PropagationConfig::default(),
            log_level: "info".to_string(),
        }
    }
}

impl CoordinatorConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(ms) = std::env::var("CLUSTERADMIN_REMOTE_TIMEOUT_MS") {
            if let Ok(ms) = ms.parse() {
                config.remote_call_timeout = Duration::from_millis(ms);
            }
        }

        if let Ok(ms) = std::env::var("CLUSTERADMIN_RECOVERY_TIMEOUT_MS") {
            if let Ok(ms) = ms.parse() {
                config.recovery_wait_timeout = Duration::from_millis(ms);
            }
        }

        if let Ok(level) = std::env::var("LOG_LEVEL") {
            config.log_level = level;
        }

        config
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.remote_call_timeout.is_zero() {
            return Err("Remote call timeout cannot be zero".to_string());
        }

        if self.recovery_poll_interval.is_zero() {
            return Err("Recovery poll interval cannot be zero".to_string());
        }

        if self.lock_config.default_duration > self.lock_config.max_duration {
            return Err("Default lock duration cannot exceed max duration".to_string());
        }

        if self.lock_config.default_duration < constants::min_lock_duration().as_std() {
            return Err("Default lock duration is below the minimum".to_string());
        }

        if self.propagation.max_in_flight == 0 {
            return Err("Propagation max_in_flight cannot be 0".to_string());
        }

        Ok(())
    }
}
