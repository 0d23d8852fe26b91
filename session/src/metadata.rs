//! The metadata store interface: the durable record of cluster topology.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use clusteradmin_common::{InstanceAddress, ServerUuid, TopologyMode, Version};

use crate::error::SessionResult;
use crate::instance::MemberRow;

/// Kind of cluster recorded in the metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ClusterType {
    GroupReplication,
    AsyncReplicaSet,
}

/// The cluster row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterRecord {
    pub name: String,
    /// `group_replication_group_name` of the group backing the cluster.
    pub group_name: String,
    pub cluster_type: ClusterType,
    pub topology: TopologyMode,
    /// Primary recorded for async replica sets.
    pub primary: Option<InstanceAddress>,
}

/// One instance row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub address: InstanceAddress,
    pub server_uuid: ServerUuid,
    pub server_id: u32,
    /// Group communication endpoint.
    pub local_address: Option<InstanceAddress>,
    pub label: String,
}

impl InstanceRecord {
    /// Create a record labelled with its address.
    pub fn new(address: InstanceAddress, server_uuid: ServerUuid, server_id: u32) -> Self {
        Self {
            label: address.to_string(),
            address,
            server_uuid,
            server_id,
            local_address: None,
        }
    }
}

/// What the metadata says about the server the store is read through.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceInfo {
    pub address: InstanceAddress,
    pub server_uuid: ServerUuid,
    /// Group Replication is running on the source (ONLINE or RECOVERING).
    pub gr_active: bool,
    /// The source has an instance row.
    pub registered: bool,
    /// The cluster the metadata describes, if any.
    pub cluster_type: Option<ClusterType>,
    /// The metadata marks the source as replica set primary.
    pub is_primary: bool,
}

/// Read and write access to the metadata schema, through one source server.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Installed schema version, `None` when the schema does not exist.
    async fn read_schema_version(&self) -> SessionResult<Option<Version>>;

    /// Classification inputs for the source server.
    async fn read_source_info(&self) -> SessionResult<SourceInfo>;

    /// Group view as seen from the source server.
    async fn read_member_states(&self) -> SessionResult<Vec<MemberRow>>;

    async fn read_cluster(&self) -> SessionResult<Option<ClusterRecord>>;

    async fn read_instances(&self) -> SessionResult<Vec<InstanceRecord>>;

    /// Insert or replace the row for `record.address`.
    async fn write_instance_record(&self, record: &InstanceRecord) -> SessionResult<()>;

    /// Remove the row for `address`. Removing a missing row is not an error.
    async fn remove_instance_record(&self, address: &InstanceAddress) -> SessionResult<()>;

    /// Create the schema if needed and record the cluster.
    async fn create_cluster(&self, cluster: &ClusterRecord) -> SessionResult<()>;

    /// Remove the cluster row and every instance row.
    async fn drop_cluster(&self, name: &str) -> SessionResult<()>;
}
