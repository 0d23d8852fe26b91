//! ClusterAdmin Sessions
//!
//! The boundary between the control plane and the servers it manages:
//! instance sessions, the metadata store, connection ownership, and an
//! in-memory backend that simulates a replication group.

pub mod config;
pub mod connection;
pub mod error;
pub mod instance;
pub mod memory;
pub mod metadata;
pub mod rowset;

pub use config::ConnectionOptions;
pub use connection::{ClusterSession, Connector, InstanceHandle};
pub use error::{SessionError, SessionResult};
pub use instance::{Instance, MemberRow};
pub use metadata::{ClusterRecord, ClusterType, InstanceRecord, MetadataStore, SourceInfo};
pub use rowset::{Row, RowSet};
