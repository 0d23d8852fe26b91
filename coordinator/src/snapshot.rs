//! Cluster Snapshot Reader.
//!
//! A [`ClusterCheckInfo`] is taken fresh from one metadata and member read
//! and never updated afterwards. Callers that need a current view around a
//! risky step take another one.

use serde::Serialize;
use tracing::{debug, instrument};

use clusteradmin_common::{
    limits, ClusterAdminError, GrInstanceType, ManagedInstanceState, MemberRole, MemberState,
    MetadataStates, QuorumState, Result, ServerUuid, TopologyMode, Version,
};
use clusteradmin_session::{ClusterType, Instance, MemberRow, MetadataStore, SessionError, SourceInfo};

/// Point-in-time classification of the source instance and its group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ClusterCheckInfo {
    pub source_version: Version,
    pub quorum: QuorumState,
    pub source_type: GrInstanceType,
    pub source_state: ManagedInstanceState,
    pub metadata_state: MetadataStates,
    /// Installed metadata schema version, if any.
    pub metadata_version: Option<Version>,
}

fn metadata_error(e: SessionError) -> ClusterAdminError {
    ClusterAdminError::MetadataError(e.to_string())
}

/// Classify the source from what the metadata says about it.
pub fn classify_source(info: Option<&SourceInfo>, metadata_state: MetadataStates) -> GrInstanceType {
    let Some(info) = info else {
        return GrInstanceType::UNKNOWN;
    };

    if metadata_state == MetadataStates::NONEXISTING {
        return if info.gr_active {
            GrInstanceType::GROUP_REPLICATION
        } else {
            GrInstanceType::STANDALONE
        };
    }

    match (info.registered, info.gr_active) {
        (true, _) if info.cluster_type == Some(ClusterType::AsyncReplicaSet) => {
            GrInstanceType::ASYNC_REPLICA_SET
        }
        (true, true) => GrInstanceType::INNODB_CLUSTER,
        (true, false) => GrInstanceType::STANDALONE_IN_METADATA,
        (false, true) => GrInstanceType::GROUP_REPLICATION,
        (false, false) => GrInstanceType::STANDALONE_WITH_METADATA,
    }
}

/// State of the source as seen in the group view.
pub fn source_state(
    members: &[MemberRow],
    source: ServerUuid,
    mode: TopologyMode,
) -> ManagedInstanceState {
    let Some(row) = members.iter().find(|m| m.server_uuid == source) else {
        return ManagedInstanceState::MISSING;
    };

    match row.state {
        MemberState::Online if mode == TopologyMode::MultiPrimary => ManagedInstanceState::ONLINE_RW,
        MemberState::Online if row.role == Some(MemberRole::Primary) => {
            ManagedInstanceState::ONLINE_RW
        }
        MemberState::Online => ManagedInstanceState::ONLINE_RO,
        MemberState::Recovering => ManagedInstanceState::RECOVERING,
        MemberState::Unreachable => ManagedInstanceState::UNREACHABLE,
        MemberState::Offline => ManagedInstanceState::OFFLINE,
        MemberState::Error => ManagedInstanceState::ERROR,
    }
}

/// Quorum of the group as seen from the source.
pub fn quorum_state(members: &[MemberRow], source_state: ManagedInstanceState) -> QuorumState {
    let source_active = (ManagedInstanceState::ONLINE_RW
        | ManagedInstanceState::ONLINE_RO
        | ManagedInstanceState::RECOVERING)
        .intersects(source_state);
    if !source_active {
        return QuorumState::DEAD;
    }

    let total = members.len();
    let reachable = members.iter().filter(|m| m.state.is_active()).count();

    if reachable * 2 > total {
        if members.iter().all(|m| m.state == MemberState::Online) {
            QuorumState::NORMAL | QuorumState::ALL_ONLINE
        } else {
            QuorumState::NORMAL
        }
    } else {
        QuorumState::QUORUMLESS
    }
}

/// Take a snapshot through `source`. Read-only.
#[instrument(skip_all, fields(source = %source.address()))]
pub async fn get_cluster_check_info(
    source: &dyn Instance,
    metadata: &dyn MetadataStore,
) -> Result<ClusterCheckInfo> {
    let metadata_version = metadata
        .read_schema_version()
        .await
        .map_err(metadata_error)?;
    let metadata_state = MetadataStates::compare(metadata_version, limits::CURRENT_METADATA_VERSION);

    let info = match metadata.read_source_info().await {
        Ok(info) => Some(info),
        Err(SessionError::AccessDenied(reason)) => {
            debug!(reason = %reason, "Cannot classify source instance");
            None
        }
        Err(e) => return Err(metadata_error(e)),
    };

    let source_type = classify_source(info.as_ref(), metadata_state);

    let (source_state, quorum) =
        if (GrInstanceType::INNODB_CLUSTER | GrInstanceType::GROUP_REPLICATION).intersects(source_type) {
            let members = metadata
                .read_member_states()
                .await
                .map_err(metadata_error)?;
            let mode = metadata
                .read_cluster()
                .await
                .map_err(metadata_error)?
                .map_or(TopologyMode::SinglePrimary, |c| c.topology);

            let state = source_state(&members, source.server_uuid(), mode);
            (state, quorum_state(&members, state))
        } else if source_type == GrInstanceType::ASYNC_REPLICA_SET {
            let primary = info.as_ref().map_or(false, |i| i.is_primary);
            let state = if primary {
                ManagedInstanceState::ONLINE_RW
            } else {
                ManagedInstanceState::ONLINE_RO
            };
            (state, QuorumState::NORMAL)
        } else {
            (ManagedInstanceState::OFFLINE, QuorumState::NORMAL)
        };

    let snapshot = ClusterCheckInfo {
        source_version: source.version(),
        quorum,
        source_type,
        source_state,
        metadata_state,
        metadata_version,
    };

    debug!(
        quorum = %snapshot.quorum,
        source_type = %snapshot.source_type,
        source_state = %snapshot.source_state,
        metadata = %snapshot.metadata_state,
        "Cluster snapshot taken"
    );

    Ok(snapshot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{addr, seeded_topology, standalone_topology};
    use clusteradmin_common::InstanceAddress;
    use clusteradmin_session::memory::Fault;
    use clusteradmin_session::ConnectionOptions;

    async fn snapshot_via(
        topology: &clusteradmin_session::memory::MemoryTopology,
        source: InstanceAddress,
    ) -> Result<ClusterCheckInfo> {
        let session = topology
            .cluster_session(&source, ConnectionOptions::default())
            .await
            .unwrap();
        get_cluster_check_info(session.source.as_ref(), session.metadata.as_ref()).await
    }

    #[tokio::test]
    async fn test_healthy_cluster_from_primary() {
        let topology = seeded_topology(3, TopologyMode::SinglePrimary);
        let info = snapshot_via(&topology, addr(3306)).await.unwrap();

        assert_eq!(info.source_type, GrInstanceType::INNODB_CLUSTER);
        assert_eq!(info.source_state, ManagedInstanceState::ONLINE_RW);
        assert_eq!(info.quorum, QuorumState::NORMAL | QuorumState::ALL_ONLINE);
        assert_eq!(info.metadata_state, MetadataStates::EQUAL);
    }

    #[tokio::test]
    async fn test_secondary_is_read_only() {
        let topology = seeded_topology(3, TopologyMode::SinglePrimary);
        let info = snapshot_via(&topology, addr(3307)).await.unwrap();
        assert_eq!(info.source_state, ManagedInstanceState::ONLINE_RO);
    }

    #[tokio::test]
    async fn test_multi_primary_members_are_writable() {
        let topology = seeded_topology(3, TopologyMode::MultiPrimary);
        let info = snapshot_via(&topology, addr(3308)).await.unwrap();
        assert_eq!(info.source_state, ManagedInstanceState::ONLINE_RW);
    }

    #[tokio::test]
    async fn test_quorum_degrades_with_unreachable_members() {
        let topology = seeded_topology(3, TopologyMode::SinglePrimary);
        topology.inject_fault(Fault::Unreachable { address: addr(3308) });
        let info = snapshot_via(&topology, addr(3306)).await.unwrap();
        assert_eq!(info.quorum, QuorumState::NORMAL);

        topology.inject_fault(Fault::Unreachable { address: addr(3307) });
        let info = snapshot_via(&topology, addr(3306)).await.unwrap();
        assert_eq!(info.quorum, QuorumState::QUORUMLESS);
    }

    #[tokio::test]
    async fn test_standalone_instances() {
        let topology = standalone_topology(1);
        let info = snapshot_via(&topology, addr(3306)).await.unwrap();
        assert_eq!(info.source_type, GrInstanceType::STANDALONE);
        assert_eq!(info.source_state, ManagedInstanceState::OFFLINE);
        assert_eq!(info.quorum, QuorumState::NORMAL);
        assert_eq!(info.metadata_state, MetadataStates::NONEXISTING);

        let topology = seeded_topology(2, TopologyMode::SinglePrimary);
        topology.add_server(crate::testing::server(3310));
        let info = snapshot_via(&topology, addr(3310)).await.unwrap();
        assert_eq!(info.source_type, GrInstanceType::STANDALONE_WITH_METADATA);
    }

    #[tokio::test]
    async fn test_access_denied_is_unknown() {
        let topology = seeded_topology(3, TopologyMode::SinglePrimary);
        topology.inject_fault(Fault::AccessDenied { address: addr(3306) });
        let info = snapshot_via(&topology, addr(3306)).await.unwrap();
        assert_eq!(info.source_type, GrInstanceType::UNKNOWN);
    }

    #[tokio::test]
    async fn test_unreadable_metadata_fails() {
        let topology = seeded_topology(3, TopologyMode::SinglePrimary);
        let session = topology
            .cluster_session(&addr(3306), ConnectionOptions::default())
            .await
            .unwrap();
        topology.inject_fault(Fault::Unreachable { address: addr(3306) });

        let err = get_cluster_check_info(session.source.as_ref(), session.metadata.as_ref())
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "METADATA_ERROR");
    }

    #[test]
    fn test_classification_table() {
        let info = |registered, gr_active, cluster_type| SourceInfo {
            address: addr(3306),
            server_uuid: ServerUuid::random(),
            gr_active,
            registered,
            cluster_type,
            is_primary: false,
        };
        let eq = MetadataStates::EQUAL;

        assert_eq!(
            classify_source(Some(&info(true, false, Some(ClusterType::GroupReplication))), eq),
            GrInstanceType::STANDALONE_IN_METADATA
        );
        assert_eq!(
            classify_source(Some(&info(true, false, Some(ClusterType::AsyncReplicaSet))), eq),
            GrInstanceType::ASYNC_REPLICA_SET
        );
        assert_eq!(
            classify_source(Some(&info(false, true, None)), MetadataStates::NONEXISTING),
            GrInstanceType::GROUP_REPLICATION
        );
        assert_eq!(classify_source(None, eq), GrInstanceType::UNKNOWN);
    }

    #[test]
    fn test_missing_source_is_dead() {
        let members = vec![MemberRow {
            server_uuid: ServerUuid::random(),
            address: addr(3307),
            state: MemberState::Online,
            role: Some(MemberRole::Primary),
        }];
        let state = source_state(&members, ServerUuid::random(), TopologyMode::SinglePrimary);
        assert_eq!(state, ManagedInstanceState::MISSING);
        assert_eq!(quorum_state(&members, state), QuorumState::DEAD);
    }
}
