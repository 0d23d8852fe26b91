//! Simulation scenarios.

use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use clusteradmin_session::memory::Fault;

use crate::server::server_address;

/// A simulation scenario.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scenario {
    /// Scenario name.
    pub name: String,
    /// Description.
    #[serde(default)]
    pub description: String,
    /// Servers the scenario needs at least.
    #[serde(default = "default_servers")]
    pub servers: usize,
    /// Servers already in the cluster when the first step runs. 0 starts
    /// from standalone servers.
    #[serde(default = "default_members")]
    pub members: usize,
    /// Steps in the scenario.
    pub steps: Vec<ScenarioStep>,
}

fn default_servers() -> usize {
    4
}

fn default_members() -> usize {
    3
}

/// A step in a scenario.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum ScenarioStep {
    /// Run a named operation through the coordinator.
    Invoke {
        operation: String,
        #[serde(default)]
        options: Value,
    },
    /// Inject a fault into the simulated topology.
    InjectFault { fault: Fault },
    /// Clear a fault injected earlier.
    ClearFault { fault: Fault },
    /// The last invocation succeeded.
    ExpectSuccess,
    /// The last invocation failed with `code`.
    ExpectFailure { code: String },
    /// The group has `count` members.
    ExpectMembers { count: usize },
    /// Wait for a duration.
    Wait { millis: u64 },
}

/// Built-in scenario names.
pub const BUILTIN: &[&str] = &[
    "join-healthy",
    "join-quorumless",
    "join-failure-rollback",
    "remove-instance",
    "precondition-matrix",
];

impl Scenario {
    /// Load a built-in scenario by name.
    pub fn load(name: &str) -> anyhow::Result<Self> {
        match name {
            "join-healthy" => Self::join_healthy(),
            "join-quorumless" => Self::join_quorumless(),
            "join-failure-rollback" => Self::join_failure_rollback(),
            "remove-instance" => Self::remove_instance(),
            "precondition-matrix" => Self::precondition_matrix(),
            _ => Err(anyhow::anyhow!(
                "Unknown scenario: {} (built-in scenarios: {})",
                name,
                BUILTIN.join(", ")
            )),
        }
    }

    /// Read a scenario from a JSON file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> anyhow::Result<Self> {
        let scenario: Self = serde_json::from_str(text)?;
        scenario.validate()?;
        Ok(scenario)
    }

    /// Check the scenario can run at all.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.members > self.servers {
            anyhow::bail!(
                "scenario '{}' seeds {} members but needs only {} servers",
                self.name,
                self.members,
                self.servers
            );
        }
        if self.steps.is_empty() {
            anyhow::bail!("scenario '{}' has no steps", self.name);
        }
        Ok(())
    }

    /// A healthy three-member cluster grows by one.
    fn join_healthy() -> anyhow::Result<Self> {
        Ok(Self {
            name: "join-healthy".to_string(),
            description: "Add a fourth instance to a healthy three-member cluster".to_string(),
            servers: 4,
            members: 3,
            steps: vec![
                invoke("Cluster.addInstance", json!({ "instance": address(3)? })),
                ScenarioStep::ExpectSuccess,
                ScenarioStep::ExpectMembers { count: 4 },
                invoke("Cluster.status", json!({ "extended": 1 })),
                ScenarioStep::ExpectSuccess,
            ],
        })
    }

    /// A join is refused while the majority is unreachable, then succeeds.
    fn join_quorumless() -> anyhow::Result<Self> {
        let second = Fault::Unreachable { address: server_address(1)? };
        let third = Fault::Unreachable { address: server_address(2)? };
        Ok(Self {
            name: "join-quorumless".to_string(),
            description: "Refuse a join without quorum, then join once quorum is back".to_string(),
            servers: 4,
            members: 3,
            steps: vec![
                ScenarioStep::InjectFault { fault: second.clone() },
                ScenarioStep::InjectFault { fault: third.clone() },
                invoke("Cluster.addInstance", json!({ "instance": address(3)? })),
                ScenarioStep::ExpectFailure {
                    code: "QUORUM_NOT_AVAILABLE".to_string(),
                },
                invoke("Cluster.status", Value::Null),
                ScenarioStep::ExpectSuccess,
                ScenarioStep::ClearFault { fault: second },
                ScenarioStep::ClearFault { fault: third },
                invoke("Cluster.addInstance", json!({ "instance": address(3)? })),
                ScenarioStep::ExpectSuccess,
                ScenarioStep::ExpectMembers { count: 4 },
            ],
        })
    }

    /// A join whose metadata write fails is rolled back, then retried.
    fn join_failure_rollback() -> anyhow::Result<Self> {
        Ok(Self {
            name: "join-failure-rollback".to_string(),
            description: "Roll back a join whose metadata registration fails, then retry"
                .to_string(),
            servers: 4,
            members: 3,
            steps: vec![
                ScenarioStep::InjectFault {
                    fault: Fault::FailMetadataWrite,
                },
                invoke("Cluster.addInstance", json!({ "instance": address(3)? })),
                ScenarioStep::ExpectFailure {
                    code: "METADATA_REGISTRATION_FAILED".to_string(),
                },
                ScenarioStep::ExpectMembers { count: 3 },
                ScenarioStep::ClearFault {
                    fault: Fault::FailMetadataWrite,
                },
                invoke("Cluster.addInstance", json!({ "instance": address(3)? })),
                ScenarioStep::ExpectSuccess,
                ScenarioStep::ExpectMembers { count: 4 },
            ],
        })
    }

    fn remove_instance() -> anyhow::Result<Self> {
        Ok(Self {
            name: "remove-instance".to_string(),
            description: "Remove a member, then try to remove it again".to_string(),
            servers: 3,
            members: 3,
            steps: vec![
                invoke("Cluster.removeInstance", json!({ "instance": address(2)? })),
                ScenarioStep::ExpectSuccess,
                ScenarioStep::ExpectMembers { count: 2 },
                invoke("Cluster.removeInstance", json!({ "instance": address(2)? })),
                ScenarioStep::ExpectFailure {
                    code: "NOT_A_MEMBER".to_string(),
                },
                invoke("Cluster.describe", Value::Null),
                ScenarioStep::ExpectSuccess,
            ],
        })
    }

    /// Admission decisions from standalone servers to a running cluster.
    fn precondition_matrix() -> anyhow::Result<Self> {
        let incompatible = || ScenarioStep::ExpectFailure {
            code: "INCOMPATIBLE_INSTANCE_CONFIGURATION".to_string(),
        };
        Ok(Self {
            name: "precondition-matrix".to_string(),
            description: "Check which operations are admitted before and after a cluster exists"
                .to_string(),
            servers: 2,
            members: 0,
            steps: vec![
                invoke("Cluster.status", Value::Null),
                incompatible(),
                invoke("Dba.createCluster", json!({ "name": "sim" })),
                ScenarioStep::ExpectSuccess,
                invoke("Cluster.status", Value::Null),
                ScenarioStep::ExpectSuccess,
                invoke("Dba.createCluster", json!({ "name": "again" })),
                incompatible(),
                invoke("Cluster.addInstance", json!({ "instance": address(1)? })),
                ScenarioStep::ExpectSuccess,
                ScenarioStep::ExpectMembers { count: 2 },
                invoke("Cluster.rescan", Value::Null),
                ScenarioStep::ExpectSuccess,
                invoke("Cluster.frobnicate", Value::Null),
                ScenarioStep::ExpectFailure {
                    code: "UNKNOWN_OPERATION".to_string(),
                },
            ],
        })
    }
}

fn invoke(operation: &str, options: Value) -> ScenarioStep {
    ScenarioStep::Invoke {
        operation: operation.to_string(),
        options,
    }
}

fn address(index: usize) -> anyhow::Result<String> {
    Ok(server_address(index)?.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_scenarios_load() {
        for name in BUILTIN {
            let scenario = Scenario::load(name).unwrap();
            assert_eq!(scenario.name, *name);
            scenario.validate().unwrap();
        }
        assert!(Scenario::load("high-volume").is_err());
    }

    #[test]
    fn test_scenario_from_json() {
        let scenario = Scenario::from_json(
            r#"{
                "name": "custom",
                "steps": [
                    {"step": "inject_fault", "fault": {"type": "unreachable", "address": "127.0.0.1:3308"}},
                    {"step": "invoke", "operation": "Cluster.removeInstance",
                     "options": {"instance": "127.0.0.1:3308", "force": true}},
                    {"step": "expect_success"},
                    {"step": "wait", "millis": 10}
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(scenario.servers, 4);
        assert_eq!(scenario.members, 3);
        assert_eq!(scenario.steps.len(), 4);
        assert_eq!(
            scenario.steps[0],
            ScenarioStep::InjectFault {
                fault: Fault::Unreachable {
                    address: server_address(2).unwrap()
                }
            }
        );
    }

    #[test]
    fn test_invalid_scenarios() {
        assert!(Scenario::from_json(r#"{"name": "empty", "steps": []}"#).is_err());
        assert!(Scenario::from_json(
            r#"{"name": "big", "servers": 2, "members": 3, "steps": [{"step": "expect_success"}]}"#
        )
        .is_err());
        assert!(Scenario::from_json(r#"{"name": "odd", "steps": [{"step": "explode"}]}"#).is_err());
    }
}
