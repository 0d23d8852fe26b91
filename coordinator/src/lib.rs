//! Cluster administration coordinator
//!
//! Admits named operations against a snapshot of the cluster, then drives
//! membership changes through prepare, execute, rollback and finish. The
//! [`Coordinator`] ties both together behind one entry point and serializes
//! mutating operations per cluster.

pub mod add_instance;
pub mod command;
pub mod config;
pub mod coordinator;
pub mod group_replication;
pub mod lock_manager;
pub mod member_manager;
pub mod metrics;
pub mod options;
pub mod preconditions;
pub mod remove_instance;
pub mod snapshot;
pub mod state;
pub mod status;

#[cfg(test)]
mod testing;

pub use add_instance::{AddInstance, AddInstanceOutcome};
pub use command::{
    run_command, CancelHandle, CancelToken, Command, CommandContext, OperationFailure,
    OperationPhase, RollbackReport,
};
pub use config::CoordinatorConfig;
pub use coordinator::{Coordinator, OperationReport};
pub use preconditions::{check_preconditions, AvailabilityTable, PreconditionReport};
pub use remove_instance::{RemoveInstance, RemoveInstanceOutcome};
pub use snapshot::{get_cluster_check_info, ClusterCheckInfo};
