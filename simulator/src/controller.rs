//! Simulation controller.

use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tracing::{info, warn};

use clusteradmin_common::{InstanceAddress, TopologyMode};
use clusteradmin_coordinator::{
    AvailabilityTable, Coordinator, CoordinatorConfig, OperationFailure, OperationReport,
};
use clusteradmin_session::memory::MemoryTopology;
use clusteradmin_session::ConnectionOptions;

use crate::metrics::SimulationMetrics;
use crate::scenario::{Scenario, ScenarioStep};
use crate::server::{server_address, ServerFactory};

/// Cluster name used for seeded groups.
pub const CLUSTER_NAME: &str = "sim";

type Outcome = Result<OperationReport, OperationFailure>;

/// What a scenario run observed.
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioReport {
    pub scenario: String,
    pub steps_run: usize,
    /// One entry per invocation, in order.
    pub outcomes: Vec<Value>,
    /// Expectations that did not hold.
    pub failures: Vec<String>,
}

impl ScenarioReport {
    pub fn passed(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Controls the simulation.
pub struct SimulationController {
    /// Number of servers.
    server_count: usize,
    config: CoordinatorConfig,
    /// Random number generator.
    rng: Arc<RwLock<StdRng>>,
    topology: MemoryTopology,
    coordinator: Option<Arc<Coordinator>>,
    /// Simulation metrics.
    metrics: Arc<RwLock<SimulationMetrics>>,
    /// Running flag.
    running: Arc<RwLock<bool>>,
}

impl SimulationController {
    /// Create a new simulation controller.
    pub fn new(server_count: usize, config: CoordinatorConfig, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };

        Self {
            server_count,
            config,
            rng: Arc::new(RwLock::new(rng)),
            topology: MemoryTopology::new(),
            coordinator: None,
            metrics: Arc::new(RwLock::new(SimulationMetrics::new())),
            running: Arc::new(RwLock::new(false)),
        }
    }

    /// Create the servers, seed the first `members` of them into a group and
    /// start a coordinator on the first server.
    pub async fn initialize(&mut self, members: usize) -> anyhow::Result<()> {
        if members > self.server_count {
            anyhow::bail!(
                "cannot seed {} members from {} servers",
                members,
                self.server_count
            );
        }
        info!(servers = self.server_count, members, "Initializing simulation");

        let servers = {
            let mut rng = self.rng.write().await;
            ServerFactory::create_servers(self.server_count, &mut rng)?
        };
        let topology = MemoryTopology::new();
        for server in servers {
            info!(address = %server.address, server_id = server.server_id, "Simulated server created");
            topology.add_server(server);
        }

        if members > 0 {
            let seeded = (0..members)
                .map(server_address)
                .collect::<anyhow::Result<Vec<_>>>()?;
            topology.seed_group(CLUSTER_NAME, &seeded, TopologyMode::SinglePrimary)?;
        }

        if let Some(previous) = self.coordinator.take() {
            previous.stop().await?;
        }
        let session = topology
            .cluster_session(&server_address(0)?, ConnectionOptions::default())
            .await?;
        let coordinator = Arc::new(Coordinator::new(
            self.config.clone(),
            session,
            AvailabilityTable::standard(),
        ));
        coordinator.start().await?;

        self.topology = topology;
        self.coordinator = Some(coordinator);
        Ok(())
    }

    pub fn topology(&self) -> &MemoryTopology {
        &self.topology
    }

    pub fn coordinator(&self) -> anyhow::Result<&Arc<Coordinator>> {
        self.coordinator
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("the simulation is not initialized"))
    }

    /// Run a scenario.
    pub async fn run_scenario(&self, scenario: &Scenario) -> anyhow::Result<ScenarioReport> {
        info!(scenario = %scenario.name, "Running scenario: {}", scenario.description);

        *self.running.write().await = true;

        let mut report = ScenarioReport {
            scenario: scenario.name.clone(),
            steps_run: 0,
            outcomes: Vec::new(),
            failures: Vec::new(),
        };
        let mut last: Option<Outcome> = None;

        for (index, step) in scenario.steps.iter().enumerate() {
            if !*self.running.read().await {
                break;
            }

            if let Some(failure) = self.execute_step(step, &mut last, &mut report).await? {
                warn!(scenario = %scenario.name, step = index, "{}", failure);
                report.failures.push(format!("step {}: {}", index, failure));
            }
            report.steps_run += 1;
        }

        *self.running.write().await = false;

        Ok(report)
    }

    /// Random membership churn: each iteration adds a spare server or
    /// removes a member other than the coordinator's.
    pub async fn run(&self, iterations: usize, pause: Duration) -> anyhow::Result<()> {
        info!(iterations, "Running membership churn");

        *self.running.write().await = true;
        let coordinator = self.coordinator()?;
        let source = coordinator.session().source.address().clone();

        for iteration in 0..iterations {
            if !*self.running.read().await {
                break;
            }

            let members = self.topology.group_members();
            let spares: Vec<InstanceAddress> = self
                .topology
                .server_addresses()
                .into_iter()
                .filter(|a| !members.contains(a))
                .collect();
            let removable: Vec<InstanceAddress> =
                members.iter().filter(|a| **a != source).cloned().collect();

            let (operation, target) = {
                let mut rng = self.rng.write().await;
                let grow = removable.is_empty() || (!spares.is_empty() && rng.gen_bool(0.5));
                let pool = if grow { &spares } else { &removable };
                match pool.choose(&mut *rng) {
                    Some(target) => (
                        if grow { "Cluster.addInstance" } else { "Cluster.removeInstance" },
                        target.clone(),
                    ),
                    None => break,
                }
            };

            info!(iteration, operation, target = %target, "Churn step");
            // Failed churn steps are logged and counted by invoke.
            let _ = self
                .invoke(operation, json!({ "instance": target.to_string() }))
                .await?;
            tokio::time::sleep(pause).await;
        }

        *self.running.write().await = false;
        Ok(())
    }

    async fn invoke(&self, operation: &str, options: Value) -> anyhow::Result<Outcome> {
        let coordinator = self.coordinator()?;
        let started = Instant::now();
        let outcome = coordinator.invoke(operation, options).await;
        let latency = started.elapsed().as_millis() as u64;

        let mut metrics = self.metrics.write().await;
        match &outcome {
            Ok(report) => {
                info!(
                    operation,
                    operation_id = %report.operation_id,
                    warnings = report.warnings.len(),
                    latency_ms = latency,
                    "Operation succeeded"
                );
                metrics.record_success(latency);
            }
            Err(failure) => {
                warn!(
                    operation,
                    code = failure.code(),
                    phase = %failure.phase,
                    latency_ms = latency,
                    "Operation failed: {}",
                    failure.error
                );
                metrics.record_failure(latency);
            }
        }
        Ok(outcome)
    }

    /// Execute a single scenario step. Returns the broken expectation, if
    /// any.
    async fn execute_step(
        &self,
        step: &ScenarioStep,
        last: &mut Option<Outcome>,
        report: &mut ScenarioReport,
    ) -> anyhow::Result<Option<String>> {
        let broken = match step {
            ScenarioStep::Wait { millis } => {
                tokio::time::sleep(Duration::from_millis(*millis)).await;
                None
            }
            ScenarioStep::Invoke { operation, options } => {
                let outcome = self.invoke(operation, options.clone()).await?;
                report.outcomes.push(match &outcome {
                    Ok(done) => serde_json::to_value(done)?,
                    Err(failure) => failure.to_json(),
                });
                *last = Some(outcome);
                None
            }
            ScenarioStep::InjectFault { fault } => {
                self.topology.inject_fault(fault.clone());
                None
            }
            ScenarioStep::ClearFault { fault } => {
                if !self.topology.clear_fault(fault) {
                    warn!(fault = ?fault, "Fault was not active");
                }
                None
            }
            ScenarioStep::ExpectSuccess => match last {
                Some(Ok(_)) => None,
                Some(Err(failure)) => Some(format!("expected success, got {}", failure.code())),
                None => Some("expected success, but nothing was invoked".to_string()),
            },
            ScenarioStep::ExpectFailure { code } => match last {
                Some(Err(failure)) if failure.code() == code => None,
                Some(Err(failure)) => Some(format!("expected {}, got {}", code, failure.code())),
                Some(Ok(_)) => Some(format!("expected {}, but the operation succeeded", code)),
                None => Some(format!("expected {}, but nothing was invoked", code)),
            },
            ScenarioStep::ExpectMembers { count } => {
                let members = self.topology.group_members().len();
                (members != *count)
                    .then(|| format!("expected {} group members, found {}", count, members))
            }
        };

        if matches!(
            step,
            ScenarioStep::ExpectSuccess
                | ScenarioStep::ExpectFailure { .. }
                | ScenarioStep::ExpectMembers { .. }
        ) {
            self.metrics
                .write()
                .await
                .record_expectation(broken.is_none());
        }
        Ok(broken)
    }

    /// Get simulation metrics.
    pub async fn metrics(&self) -> SimulationMetrics {
        self.metrics.read().await.clone()
    }

    /// Stop the simulation and its coordinator.
    pub async fn stop(&self) -> anyhow::Result<()> {
        *self.running.write().await = false;
        if let Some(coordinator) = &self.coordinator {
            coordinator.stop().await?;
        }
        Ok(())
    }
}
