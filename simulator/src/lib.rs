//! Simulated InnoDB cluster for exercising the coordinator end to end.
//!
//! Servers live in an in-memory topology; scenarios drive named operations
//! through a [`clusteradmin_coordinator::Coordinator`] while injecting
//! faults, and check the outcomes they expect.

pub mod controller;
pub mod metrics;
pub mod scenario;
pub mod server;

pub use controller::{ScenarioReport, SimulationController};
pub use metrics::SimulationMetrics;
pub use scenario::{Scenario, ScenarioStep};
