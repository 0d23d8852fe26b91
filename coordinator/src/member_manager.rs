//! Fan-out of per-member updates to the rest of the group.
//!
//! Each member gets its own session, opened and closed here. A member that
//! cannot be reached or rejects the update is recorded and the others carry
//! on; callers turn the failures into a warning.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::Serialize;
use tracing::{debug, warn};

use clusteradmin_common::{InstanceAddress, TopologyMode, Warning};
use clusteradmin_session::{ClusterSession, Instance, InstanceHandle, SessionResult};

use crate::command::remote;
use crate::config::PropagationConfig;
use crate::group_replication::{auto_increment_settings, format_seeds, parse_seeds, GROUP_SEEDS};

/// Outcome of one fan-out.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FanOutReport {
    pub succeeded: Vec<InstanceAddress>,
    /// Members that failed, with the reason.
    pub failed: Vec<(InstanceAddress, String)>,
}

impl FanOutReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    /// A warning naming the members that did not take the update.
    pub fn warning(&self, code: &'static str, what: &str) -> Option<Warning> {
        if self.is_complete() {
            return None;
        }
        let members = self
            .failed
            .iter()
            .map(|(address, reason)| format!("{} ({})", address, reason))
            .collect::<Vec<_>>()
            .join(", ");
        Some(Warning::new(
            code,
            format!("Failed to {} on: {}", what, members),
        ))
    }
}

/// Runs updates against group members.
pub struct MemberManager {
    session: ClusterSession,
    config: PropagationConfig,
    timeout: Duration,
}

impl MemberManager {
    pub fn new(session: ClusterSession, config: PropagationConfig, timeout: Duration) -> Self {
        Self {
            session,
            config,
            timeout,
        }
    }

    /// Apply `update` to every member in `members`.
    pub async fn for_each<F, Fut>(&self, members: &[InstanceAddress], update: F) -> FanOutReport
    where
        F: Fn(Arc<dyn Instance>) -> Fut + Sync,
        Fut: Future<Output = SessionResult<()>> + Send,
    {
        let mut report = FanOutReport::default();
        let chunk = if self.config.parallel {
            self.config.max_in_flight.max(1)
        } else {
            1
        };

        for batch in members.chunks(chunk) {
            let results = join_all(batch.iter().map(|address| self.update_one(address, &update))).await;
            for (address, result) in batch.iter().zip(results) {
                match result {
                    Ok(()) => report.succeeded.push(address.clone()),
                    Err(reason) => {
                        warn!(member = %address, error = %reason, "Member update failed");
                        report.failed.push((address.clone(), reason));
                    }
                }
            }
        }

        report
    }

    async fn update_one<F, Fut>(&self, address: &InstanceAddress, update: &F) -> Result<(), String>
    where
        F: Fn(Arc<dyn Instance>) -> Fut,
        Fut: Future<Output = SessionResult<()>>,
    {
        let options = self.session.credentials.for_address(address.clone());
        let handle = remote(
            self.timeout,
            "connect",
            InstanceHandle::open(self.session.connector.as_ref(), &options),
        )
        .await
        .map_err(|e| e.to_string())?;

        let result = remote(self.timeout, "member update", update(handle.instance().clone())).await;
        if let Err(e) = handle.release().await {
            debug!(member = %address, error = %e, "Closing member session failed");
        }
        result.map_err(|e| e.to_string())
    }

    /// Add `seed` to each member's seed list.
    pub async fn add_seed(&self, members: &[InstanceAddress], seed: &str) -> FanOutReport {
        let seed = seed.to_string();
        self.for_each(members, move |instance| {
            let seed = seed.clone();
            async move {
                let current = instance.get_sysvar(GROUP_SEEDS).await?.unwrap_or_default();
                let mut seeds = parse_seeds(&current);
                seeds.push(seed);
                instance.set_sysvar(GROUP_SEEDS, &format_seeds(&seeds)).await
            }
        })
        .await
    }

    /// Remove `seed` from each member's seed list.
    pub async fn remove_seed(&self, members: &[InstanceAddress], seed: &str) -> FanOutReport {
        let seed = seed.to_string();
        self.for_each(members, move |instance| {
            let seed = seed.clone();
            async move {
                let current = instance.get_sysvar(GROUP_SEEDS).await?.unwrap_or_default();
                let seeds: Vec<String> = parse_seeds(&current)
                    .into_iter()
                    .filter(|s| *s != seed)
                    .collect();
                instance.set_sysvar(GROUP_SEEDS, &format_seeds(&seeds)).await
            }
        })
        .await
    }

    /// Recompute auto-increment settings on each member for a group of
    /// `group_size`.
    pub async fn update_auto_increment(
        &self,
        members: &[InstanceAddress],
        mode: TopologyMode,
        group_size: usize,
    ) -> FanOutReport {
        self.for_each(members, move |instance| async move {
            let (increment, offset) = auto_increment_settings(mode, group_size, instance.server_id());
            instance
                .set_sysvar("auto_increment_increment", &increment.to_string())
                .await?;
            instance
                .set_sysvar("auto_increment_offset", &offset.to_string())
                .await
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{addr, seeded_topology, session};
    use clusteradmin_common::warning_codes;
    use clusteradmin_session::memory::Fault;

    fn manager(session: ClusterSession, parallel: bool) -> MemberManager {
        MemberManager::new(
            session,
            PropagationConfig {
                parallel,
                max_in_flight: 2,
            },
            Duration::from_secs(1),
        )
    }

    #[tokio::test]
    async fn test_add_seed_everywhere() {
        let topology = seeded_topology(3, TopologyMode::SinglePrimary);
        let members = vec![addr(3306), addr(3307), addr(3308)];
        let report = manager(session(&topology, 3306).await, true)
            .add_seed(&members, "127.0.0.1:33101")
            .await;

        assert!(report.is_complete());
        assert_eq!(report.succeeded.len(), 3);
        for member in &members {
            let seeds = topology.sysvar(member, GROUP_SEEDS).unwrap();
            assert!(seeds.ends_with(",127.0.0.1:33101"), "{}", seeds);
            assert_eq!(topology.open_sessions(member), u32::from(member.port == 3306));
        }
    }

    #[tokio::test]
    async fn test_partial_failure_is_collected() {
        let topology = seeded_topology(3, TopologyMode::SinglePrimary);
        topology.inject_fault(Fault::Unreachable { address: addr(3308) });

        let report = manager(session(&topology, 3306).await, false)
            .add_seed(&[addr(3307), addr(3308)], "127.0.0.1:33101")
            .await;

        assert_eq!(report.succeeded, vec![addr(3307)]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, addr(3308));

        let warning = report
            .warning(warning_codes::SEED_PROPAGATION_PARTIAL_FAILURE, "update group seeds")
            .unwrap();
        assert!(warning.message.contains("127.0.0.1:3308"));
    }

    #[tokio::test]
    async fn test_remove_seed() {
        let topology = seeded_topology(3, TopologyMode::SinglePrimary);
        let report = manager(session(&topology, 3306).await, true)
            .remove_seed(&[addr(3306), addr(3307)], "127.0.0.1:33081")
            .await;

        assert!(report.is_complete());
        assert_eq!(topology.sysvar(&addr(3306), GROUP_SEEDS).unwrap(), "127.0.0.1:33071");
        assert_eq!(topology.sysvar(&addr(3307), GROUP_SEEDS).unwrap(), "127.0.0.1:33061");
    }

    #[tokio::test]
    async fn test_auto_increment_multi_primary() {
        let topology = seeded_topology(3, TopologyMode::MultiPrimary);
        let report = manager(session(&topology, 3306).await, true)
            .update_auto_increment(&[addr(3306), addr(3307)], TopologyMode::MultiPrimary, 3)
            .await;

        assert!(report.is_complete());
        assert_eq!(topology.sysvar(&addr(3306), "auto_increment_increment").unwrap(), "7");
        assert_eq!(topology.sysvar(&addr(3306), "auto_increment_offset").unwrap(), "3");
        assert_eq!(topology.sysvar(&addr(3307), "auto_increment_offset").unwrap(), "4");
    }
}
