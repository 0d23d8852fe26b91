//! ClusterAdmin Common Types
//!
//! Shared vocabulary for the control plane: versions, GTID sets, instance
//! addresses, state sets used by the precondition engine, metadata
//! compatibility rules and the error taxonomy.

#[macro_use]
mod macros;

pub mod error;
pub mod gtid;
pub mod identifiers;
pub mod metadata;
pub mod states;
pub mod time;
pub mod version;

pub use error::*;
pub use gtid::*;
pub use identifiers::*;
pub use metadata::*;
pub use states::*;
pub use time::*;
pub use version::*;
