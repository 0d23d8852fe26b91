//! Shared fixtures for unit tests.

use std::sync::Arc;

use clusteradmin_common::{InstanceAddress, TopologyMode, Version};
use clusteradmin_session::memory::{MemoryTopology, SimServer};
use clusteradmin_session::{ClusterSession, ConnectionOptions};

use crate::command::CommandContext;
use crate::config::CoordinatorConfig;
use crate::preconditions::AvailabilityTable;

pub const CLUSTER: &str = "prod";

pub fn addr(port: u16) -> InstanceAddress {
    InstanceAddress::new("127.0.0.1", port)
}

/// A standalone 8.0.30 server whose server_id is its port.
pub fn server(port: u16) -> SimServer {
    SimServer::new(addr(port), Version::new(8, 0, 30), u32::from(port))
}

/// `n` servers from port 3306 up, none in a group.
pub fn standalone_topology(n: u16) -> MemoryTopology {
    let topology = MemoryTopology::new();
    for port in 3306..3306 + n {
        topology.add_server(server(port));
    }
    topology
}

/// `n` servers from port 3306 up, all members of cluster `prod`. 3306 is
/// the primary.
pub fn seeded_topology(n: u16, mode: TopologyMode) -> MemoryTopology {
    let topology = standalone_topology(n);
    let members: Vec<InstanceAddress> = (3306..3306 + n).map(addr).collect();
    topology
        .seed_group(CLUSTER, &members, mode)
        .expect("seed group");
    topology
}

pub async fn session(topology: &MemoryTopology, port: u16) -> ClusterSession {
    topology
        .cluster_session(&addr(port), ConnectionOptions::default())
        .await
        .expect("cluster session")
}

/// Config with short waits so recovery polling finishes quickly.
pub fn fast_config() -> CoordinatorConfig {
    let mut config = CoordinatorConfig::default();
    config.recovery_wait_timeout = std::time::Duration::from_millis(500);
    config.recovery_poll_interval = std::time::Duration::from_millis(5);
    config
}

pub async fn context(topology: &MemoryTopology, port: u16) -> CommandContext {
    CommandContext::new(
        session(topology, port).await,
        Arc::new(AvailabilityTable::standard()),
        &fast_config(),
    )
}
