//! Advisory operation locks, one per cluster.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{info, warn};

use clusteradmin_common::{ClusterAdminError, OperationId, Result};

use crate::config::LockConfig;

/// Lock status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockStatus {
    /// Held by a running operation.
    Active,
    /// Released by its holder.
    Released,
    /// Holder did not release it in time.
    Expired,
}

/// Exclusive lock on a cluster for one mutating operation.
#[derive(Debug, Clone)]
pub struct ClusterLock {
    /// Cluster the lock covers.
    pub cluster: String,
    /// Operation holding the lock.
    pub holder: OperationId,
    /// Name of the holding operation.
    pub operation: String,
    /// Current status.
    pub status: LockStatus,
    /// When the lock was taken.
    pub created_at: Instant,
    /// When the lock expires.
    pub expires_at: Instant,
}

impl ClusterLock {
    /// Create a new lock.
    pub fn new(cluster: &str, holder: OperationId, operation: &str, duration: Duration) -> Self {
        let now = Instant::now();
        Self {
            cluster: cluster.to_string(),
            holder,
            operation: operation.to_string(),
            status: LockStatus::Active,
            created_at: now,
            expires_at: now + duration,
        }
    }

    /// Check if lock is active.
    pub fn is_active(&self) -> bool {
        self.status == LockStatus::Active && !self.is_expired()
    }

    /// Check if lock has expired.
    pub fn is_expired(&self) -> bool {
        Instant::now() > self.expires_at
    }

    /// Get remaining time until expiry.
    pub fn remaining_time(&self) -> Duration {
        self.expires_at.saturating_duration_since(Instant::now())
    }
}

/// Manager for cluster operation locks.
pub struct LockManager {
    /// Locks by cluster name.
    locks: Arc<DashMap<String, ClusterLock>>,
    /// Configuration.
    config: LockConfig,
}

impl LockManager {
    /// Create a new lock manager.
    pub fn new(config: LockConfig) -> Self {
        Self {
            locks: Arc::new(DashMap::new()),
            config,
        }
    }

    /// Take the lock for `cluster` with the default duration.
    pub fn acquire(&self, cluster: &str, holder: OperationId, operation: &str) -> Result<ClusterLock> {
        self.acquire_for(cluster, holder, operation, self.config.default_duration)
    }

    /// Take the lock for `cluster`, failing fast when another operation
    /// holds it. The duration is capped at the configured maximum.
    pub fn acquire_for(
        &self,
        cluster: &str,
        holder: OperationId,
        operation: &str,
        duration: Duration,
    ) -> Result<ClusterLock> {
        let duration = duration.min(self.config.max_duration);
        let lock = ClusterLock::new(cluster, holder, operation, duration);

        match self.locks.entry(cluster.to_string()) {
            Entry::Occupied(mut entry) => {
                let existing = entry.get();
                if existing.is_active() {
                    warn!(
                        cluster = %cluster,
                        holder = %existing.holder,
                        held_by = %existing.operation,
                        requested_by = %operation,
                        "Cluster lock conflict"
                    );
                    return Err(ClusterAdminError::OperationLocked {
                        cluster: cluster.to_string(),
                        holder: format!("{} ({})", existing.holder, existing.operation),
                    });
                }
                entry.insert(lock.clone());
            }
            Entry::Vacant(entry) => {
                entry.insert(lock.clone());
            }
        }

        info!(cluster = %cluster, holder = %holder, operation = %operation, "Cluster lock acquired");
        Ok(lock)
    }

    /// Release the lock if `holder` still owns it.
    pub fn release(&self, cluster: &str, holder: OperationId) -> bool {
        if let Some(mut lock) = self.locks.get_mut(cluster) {
            if lock.holder == holder && lock.status == LockStatus::Active {
                lock.status = LockStatus::Released;
                info!(cluster = %cluster, holder = %holder, "Cluster lock released");
                return true;
            }
        }
        false
    }

    /// Get the lock record for a cluster.
    pub fn get_lock(&self, cluster: &str) -> Option<ClusterLock> {
        self.locks.get(cluster).map(|l| l.clone())
    }

    /// Check if a cluster is currently locked.
    pub fn is_locked(&self, cluster: &str) -> bool {
        self.locks.get(cluster).map_or(false, |l| l.is_active())
    }

    /// Get count of active locks.
    pub fn active_lock_count(&self) -> usize {
        self.locks.iter().filter(|l| l.is_active()).count()
    }

    /// Run cleanup loop to expire stale locks.
    pub async fn run_cleanup_loop(&self) {
        loop {
            tokio::time::sleep(self.config.cleanup_interval).await;
            self.cleanup_expired_locks();
        }
    }

    /// Mark expired locks and drop released ones. Returns how many expired.
    pub fn cleanup_expired_locks(&self) -> usize {
        let mut expired = 0;
        self.locks.retain(|cluster, lock| match lock.status {
            LockStatus::Active if lock.is_expired() => {
                lock.status = LockStatus::Expired;
                expired += 1;
                warn!(
                    cluster = %cluster,
                    holder = %lock.holder,
                    operation = %lock.operation,
                    "Cluster lock expired"
                );
                true
            }
            LockStatus::Released => false,
            _ => true,
        });
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_lock_manager() -> LockManager {
        LockManager::new(LockConfig::default())
    }

    #[test]
    fn test_lock_acquire_and_release() {
        let manager = create_test_lock_manager();
        let holder = OperationId::new();

        let lock = manager.acquire("prod", holder, "Cluster.addInstance").unwrap();
        assert!(lock.is_active());
        assert!(manager.is_locked("prod"));

        assert!(manager.release("prod", holder));
        assert!(!manager.is_locked("prod"));
        assert!(!manager.release("prod", holder));
    }

    #[test]
    fn test_lock_conflict() {
        let manager = create_test_lock_manager();
        manager.acquire("prod", OperationId::new(), "Cluster.addInstance").unwrap();

        let err = manager
            .acquire("prod", OperationId::new(), "Cluster.removeInstance")
            .unwrap_err();
        assert_eq!(err.error_code(), "OPERATION_LOCKED");
        assert!(err.is_retryable());

        // Other clusters are independent
        assert!(manager.acquire("staging", OperationId::new(), "Cluster.addInstance").is_ok());
        assert_eq!(manager.active_lock_count(), 2);
    }

    #[test]
    fn test_release_requires_holder() {
        let manager = create_test_lock_manager();
        manager.acquire("prod", OperationId::new(), "Cluster.addInstance").unwrap();
        assert!(!manager.release("prod", OperationId::new()));
        assert!(manager.is_locked("prod"));
    }

    #[test]
    fn test_expired_lock_is_reclaimed() {
        let manager = create_test_lock_manager();
        manager
            .acquire_for("prod", OperationId::new(), "Cluster.addInstance", Duration::ZERO)
            .unwrap();
        std::thread::sleep(Duration::from_millis(5));

        assert_eq!(manager.cleanup_expired_locks(), 1);
        assert_eq!(manager.get_lock("prod").map(|l| l.status), Some(LockStatus::Expired));
        assert!(manager.acquire("prod", OperationId::new(), "Cluster.removeInstance").is_ok());
    }

    #[test]
    fn test_duration_capped() {
        let manager = create_test_lock_manager();
        let lock = manager
            .acquire_for("prod", OperationId::new(), "Cluster.addInstance", Duration::from_secs(3600))
            .unwrap();
        assert!(lock.remaining_time() <= Duration::from_secs(300));
    }
}
