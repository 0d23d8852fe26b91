//! `Cluster.status` and `Cluster.describe`: read-only views assembled from
//! the metadata and the group view of the session's instance.

use std::fmt;

use serde::Serialize;
use tracing::{debug, instrument};

use clusteradmin_common::{
    ClusterAdminError, InstanceAddress, MemberRole, MemberState, Result, TopologyMode,
};
use clusteradmin_session::{InstanceRecord, MemberRow};

use crate::command::{metadata_error, CommandContext};
use crate::group_replication::{SslMode, SSL_MODE};
use crate::options::StatusOptions;

/// Overall health, in the terms an operator reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StatusText {
    Ok,
    OkPartial,
    OkNoTolerance,
    NoQuorum,
}

impl fmt::Display for StatusText {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StatusText::Ok => "OK",
            StatusText::OkPartial => "OK_PARTIAL",
            StatusText::OkNoTolerance => "OK_NO_TOLERANCE",
            StatusText::NoQuorum => "NO_QUORUM",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberStatus {
    pub address: InstanceAddress,
    pub label: String,
    /// `(MISSING)` when the member is registered but absent from the view.
    pub status: String,
    pub member_role: Option<MemberRole>,
    /// `R/W` or `R/O`; absent for members that are not ONLINE.
    pub mode: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_id: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
    pub cluster_name: String,
    pub topology_mode: TopologyMode,
    pub ssl: Option<SslMode>,
    pub status: StatusText,
    pub status_text: String,
    pub primary: Option<InstanceAddress>,
    /// How many members may fail while the group keeps quorum.
    pub tolerated_failures: usize,
    pub group_information_source_member: InstanceAddress,
    pub topology: Vec<MemberStatus>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DescribedInstance {
    pub address: InstanceAddress,
    pub label: String,
    pub role: &'static str,
    pub local_address: Option<InstanceAddress>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterDescription {
    pub cluster_name: String,
    pub group_name: String,
    pub topology_mode: TopologyMode,
    pub topology: Vec<DescribedInstance>,
}

/// Health summary for a group of `total` members, `online` of them ONLINE.
pub fn summarize(total: usize, online: usize, active: usize) -> (StatusText, usize, String) {
    if active * 2 <= total {
        let missing = total - active;
        return (
            StatusText::NoQuorum,
            0,
            format!(
                "Cluster has no quorum as visible from this instance and cannot process write \
                 transactions. {} member{} not active.",
                missing,
                if missing == 1 { " is" } else { "s are" }
            ),
        );
    }

    let tolerated = online.saturating_sub(1) / 2;
    let inactive = total - online;
    let suffix = match inactive {
        0 => String::new(),
        1 => " 1 member is not active.".to_string(),
        n => format!(" {} members are not active.", n),
    };

    if tolerated == 0 {
        (
            StatusText::OkNoTolerance,
            0,
            format!("Cluster is NOT tolerant to any failures.{}", suffix),
        )
    } else if inactive > 0 {
        (
            StatusText::OkPartial,
            tolerated,
            format!("Cluster is ONLINE and can tolerate up to {} failure{}.{}", tolerated, plural(tolerated), suffix),
        )
    } else {
        (
            StatusText::Ok,
            tolerated,
            format!("Cluster is ONLINE and can tolerate up to {} failure{}.", tolerated, plural(tolerated)),
        )
    }
}

fn plural(n: usize) -> &'static str {
    if n == 1 {
        ""
    } else {
        "s"
    }
}

fn member_mode(row: &MemberRow, mode: TopologyMode) -> Option<&'static str> {
    if row.state != MemberState::Online {
        return None;
    }
    let writable = mode == TopologyMode::MultiPrimary || row.role == Some(MemberRole::Primary);
    Some(if writable { "R/W" } else { "R/O" })
}

async fn read_topology(ctx: &CommandContext) -> Result<(clusteradmin_session::ClusterRecord, Vec<InstanceRecord>)> {
    let metadata = ctx.session.metadata.clone();
    let cluster = ctx
        .remote("read cluster", metadata.read_cluster())
        .await
        .map_err(metadata_error)?
        .ok_or_else(|| ClusterAdminError::MetadataError("the metadata does not describe a cluster".into()))?;
    let instances = ctx
        .remote("read instances", metadata.read_instances())
        .await
        .map_err(metadata_error)?;
    Ok((cluster, instances))
}

/// Build the `Cluster.status` view.
#[instrument(skip_all, fields(source = %ctx.session.source.address()))]
pub async fn cluster_status(ctx: &CommandContext, options: &StatusOptions) -> Result<ClusterStatus> {
    let (cluster, instances) = read_topology(ctx).await?;
    let source = ctx.session.source.clone();
    let rows = ctx
        .remote("group members", source.group_members())
        .await
        .map_err(metadata_error)?;

    let mut topology = Vec::with_capacity(instances.len());
    for record in &instances {
        let row = rows
            .iter()
            .find(|r| r.server_uuid == record.server_uuid || r.address == record.address);
        let mut member = MemberStatus {
            address: record.address.clone(),
            label: record.label.clone(),
            status: row.map_or_else(|| "(MISSING)".to_string(), |r| r.state.to_string()),
            member_role: row.and_then(|r| r.role),
            mode: row.and_then(|r| member_mode(r, cluster.topology)),
            version: None,
            server_id: None,
        };

        if options.extended > 0 && row.map_or(false, |r| r.state.is_active()) {
            match ctx.open(&record.address).await {
                Ok(handle) => {
                    member.version = Some(handle.version().to_string());
                    member.server_id = Some(handle.server_id());
                    if let Err(e) = handle.release().await {
                        debug!(member = %record.address, error = %e, "Closing member session failed");
                    }
                }
                Err(e) => debug!(member = %record.address, error = %e, "Member details unavailable"),
            }
        }
        topology.push(member);
    }

    let total = rows.len().max(instances.len());
    let online = rows.iter().filter(|r| r.state == MemberState::Online).count();
    let active = rows.iter().filter(|r| r.state.is_active()).count();
    let (status, tolerated_failures, status_text) = summarize(total, online, active);

    let primary = match cluster.topology {
        TopologyMode::SinglePrimary => rows
            .iter()
            .find(|r| r.role == Some(MemberRole::Primary))
            .map(|r| r.address.clone()),
        TopologyMode::MultiPrimary => None,
    };
    let ssl = ctx
        .remote("ssl mode", source.get_sysvar(SSL_MODE))
        .await
        .ok()
        .flatten()
        .as_deref()
        .and_then(SslMode::parse);

    Ok(ClusterStatus {
        cluster_name: cluster.name,
        topology_mode: cluster.topology,
        ssl,
        status,
        status_text,
        primary,
        tolerated_failures,
        group_information_source_member: source.address().clone(),
        topology,
    })
}

/// Build the `Cluster.describe` view. Metadata only.
pub async fn describe_cluster(ctx: &CommandContext) -> Result<ClusterDescription> {
    let (cluster, instances) = read_topology(ctx).await?;
    Ok(ClusterDescription {
        cluster_name: cluster.name,
        group_name: cluster.group_name,
        topology_mode: cluster.topology,
        topology: instances
            .into_iter()
            .map(|r| DescribedInstance {
                address: r.address,
                label: r.label,
                role: "HA",
                local_address: r.local_address,
            })
            .collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{addr, context, seeded_topology};
    use clusteradmin_session::memory::Fault;
    use proptest::prelude::*;

    #[test]
    fn test_summarize() {
        assert_eq!(summarize(3, 3, 3).0, StatusText::Ok);
        assert_eq!(summarize(3, 2, 2).0, StatusText::OkNoTolerance);
        assert_eq!(summarize(5, 4, 4), (StatusText::OkPartial, 1, "Cluster is ONLINE and can tolerate up to 1 failure. 1 member is not active.".to_string()));
        assert_eq!(summarize(3, 1, 1).0, StatusText::NoQuorum);
        assert_eq!(summarize(1, 1, 1).0, StatusText::OkNoTolerance);
    }

    proptest! {
        #[test]
        fn prop_no_quorum_means_no_tolerance(total in 1usize..10, active in 0usize..10) {
            let active = active.min(total);
            let (status, tolerated, _) = summarize(total, active, active);
            prop_assert_eq!(status == StatusText::NoQuorum, active * 2 <= total);
            prop_assert!(tolerated * 2 < total);
        }
    }

    #[tokio::test]
    async fn test_status_of_healthy_cluster() {
        let topology = seeded_topology(3, TopologyMode::SinglePrimary);
        let ctx = context(&topology, 3307).await;
        let status = cluster_status(&ctx, &StatusOptions::default()).await.unwrap();

        assert_eq!(status.cluster_name, "prod");
        assert_eq!(status.status, StatusText::Ok);
        assert_eq!(status.tolerated_failures, 1);
        assert_eq!(status.primary, Some(addr(3306)));
        assert_eq!(status.ssl, Some(SslMode::Required));
        assert_eq!(status.topology[0].mode, Some("R/W"));
        assert_eq!(status.topology[1].mode, Some("R/O"));
        assert!(status.topology[0].version.is_none());
    }

    #[tokio::test]
    async fn test_status_with_unreachable_member() {
        let topology = seeded_topology(3, TopologyMode::SinglePrimary);
        topology.inject_fault(Fault::Unreachable { address: addr(3308) });
        let ctx = context(&topology, 3306).await;
        let status = cluster_status(&ctx, &StatusOptions { extended: 1 }).await.unwrap();

        assert_eq!(status.status, StatusText::OkNoTolerance);
        assert_eq!(status.topology[2].status, "UNREACHABLE");
        assert_eq!(status.topology[2].mode, None);
        assert_eq!(status.topology[0].version.as_deref(), Some("8.0.30"));
        assert_eq!(topology.open_sessions(&addr(3307)), 0);
    }

    #[tokio::test]
    async fn test_describe() {
        let topology = seeded_topology(2, TopologyMode::MultiPrimary);
        let description = describe_cluster(&context(&topology, 3306).await).await.unwrap();
        assert_eq!(description.topology_mode, TopologyMode::MultiPrimary);
        assert_eq!(description.topology.len(), 2);
        assert_eq!(
            description.topology[1].local_address,
            Some(InstanceAddress::new("127.0.0.1", 33071))
        );
    }
}
