//! Precondition/Quorum Engine.
//!
//! Every named operation has a static [`FunctionAvailability`]. Admission
//! intersects each mask with the single flag observed in a
//! [`ClusterCheckInfo`], in a fixed order, and stops at the first mismatch.
//! A rejection is final for that snapshot; there is no retry here.

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::{debug, warn};

use clusteradmin_common::{
    describe_state, limits, mutating_validations, read_only_validations, warning_codes,
    ClusterAdminError, GrInstanceType, ManagedInstanceState, MdsAction, MetadataStates,
    MetadataValidation, PreconditionFailure, QuorumState, Result, Version, Warning,
};

use crate::snapshot::ClusterCheckInfo;

/// Whether an operation changes cluster state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    ReadOnly,
    Mutating,
}

/// What an operation needs from the source instance and its group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionAvailability {
    pub min_version: Version,
    pub instance_config_state: GrInstanceType,
    pub cluster_status: QuorumState,
    pub instance_status: ManagedInstanceState,
    /// Evaluated in order against the snapshot's metadata state.
    pub metadata_validations: Vec<MetadataValidation>,
}

/// Outcome of a successful admission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PreconditionReport {
    /// Quorum observed in the snapshot, for callers that decide further.
    pub quorum: QuorumState,
    /// Metadata WARN validations that matched.
    pub warnings: Vec<Warning>,
    /// Metadata NOTE validations that matched.
    pub notes: Vec<Warning>,
}

#[derive(Debug, Clone)]
struct TableEntry {
    kind: OperationKind,
    requirement: FunctionAvailability,
}

/// Requirement per operation name. Built explicitly and handed to whoever
/// checks preconditions.
#[derive(Debug, Clone, Default)]
pub struct AvailabilityTable {
    entries: BTreeMap<String, TableEntry>,
}

const ONLINE: ManagedInstanceState =
    ManagedInstanceState::ONLINE_RW.union(ManagedInstanceState::ONLINE_RO);

impl AvailabilityTable {
    /// An empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// The AdminAPI operations and what each requires.
    pub fn standard() -> Self {
        let gr = limits::MIN_GR_VERSION;
        let mut table = Self::new();

        table.insert(
            "Dba.createCluster",
            OperationKind::Mutating,
            FunctionAvailability {
                min_version: gr,
                instance_config_state: GrInstanceType::STANDALONE
                    | GrInstanceType::STANDALONE_WITH_METADATA
                    | GrInstanceType::GROUP_REPLICATION,
                cluster_status: QuorumState::ANY,
                instance_status: ManagedInstanceState::ANY,
                metadata_validations: mutating_validations(),
            },
        );
        table.insert(
            "Dba.getCluster",
            OperationKind::ReadOnly,
            FunctionAvailability {
                min_version: gr,
                instance_config_state: GrInstanceType::INNODB_CLUSTER,
                cluster_status: QuorumState::ANY,
                instance_status: ManagedInstanceState::ANY,
                metadata_validations: read_only_validations(),
            },
        );
        table.insert(
            "Dba.dropMetadataSchema",
            OperationKind::Mutating,
            FunctionAvailability {
                min_version: gr,
                instance_config_state: GrInstanceType::STANDALONE_WITH_METADATA
                    | GrInstanceType::STANDALONE_IN_METADATA
                    | GrInstanceType::INNODB_CLUSTER
                    | GrInstanceType::ASYNC_REPLICA_SET,
                cluster_status: QuorumState::NORMAL,
                instance_status: ManagedInstanceState::ONLINE_RW,
                metadata_validations: vec![MetadataValidation::new(
                    MetadataStates::UPGRADING,
                    MdsAction::RaiseError,
                )],
            },
        );

        for name in [
            "Cluster.addInstance",
            "Cluster.removeInstance",
            "Cluster.rejoinInstance",
            "Cluster.dissolve",
            "Cluster.rescan",
        ] {
            table.insert(
                name,
                OperationKind::Mutating,
                FunctionAvailability {
                    min_version: gr,
                    instance_config_state: GrInstanceType::INNODB_CLUSTER,
                    cluster_status: QuorumState::NORMAL,
                    instance_status: ManagedInstanceState::ONLINE_RW,
                    metadata_validations: mutating_validations(),
                },
            );
        }

        for name in ["Cluster.describe", "Cluster.status", "Cluster.options"] {
            table.insert(
                name,
                OperationKind::ReadOnly,
                FunctionAvailability {
                    min_version: gr,
                    instance_config_state: GrInstanceType::INNODB_CLUSTER,
                    cluster_status: QuorumState::ANY,
                    instance_status: ONLINE | ManagedInstanceState::RECOVERING,
                    metadata_validations: read_only_validations(),
                },
            );
        }

        table.insert(
            "Cluster.checkInstanceState",
            OperationKind::ReadOnly,
            FunctionAvailability {
                min_version: gr,
                instance_config_state: GrInstanceType::INNODB_CLUSTER,
                cluster_status: QuorumState::NORMAL,
                instance_status: ONLINE,
                metadata_validations: read_only_validations(),
            },
        );
        table.insert(
            "Cluster.forceQuorumUsingPartitionOf",
            OperationKind::Mutating,
            FunctionAvailability {
                min_version: gr,
                instance_config_state: GrInstanceType::GROUP_REPLICATION
                    | GrInstanceType::INNODB_CLUSTER,
                cluster_status: QuorumState::ANY,
                instance_status: ONLINE,
                metadata_validations: mutating_validations(),
            },
        );

        for name in [
            "Cluster.switchToSinglePrimaryMode",
            "Cluster.switchToMultiPrimaryMode",
            "Cluster.setPrimaryInstance",
        ] {
            table.insert(
                name,
                OperationKind::Mutating,
                FunctionAvailability {
                    min_version: limits::MIN_PRIMARY_MODE_SWITCH_VERSION,
                    instance_config_state: GrInstanceType::INNODB_CLUSTER,
                    cluster_status: QuorumState::ALL_ONLINE,
                    instance_status: ONLINE,
                    metadata_validations: mutating_validations(),
                },
            );
        }

        table.insert(
            "Cluster.setOption",
            OperationKind::Mutating,
            FunctionAvailability {
                min_version: gr,
                instance_config_state: GrInstanceType::INNODB_CLUSTER,
                cluster_status: QuorumState::ALL_ONLINE,
                instance_status: ONLINE,
                metadata_validations: mutating_validations(),
            },
        );

        table.insert(
            "ReplicaSet.addInstance",
            OperationKind::Mutating,
            FunctionAvailability {
                min_version: limits::MIN_AR_VERSION,
                instance_config_state: GrInstanceType::ASYNC_REPLICA_SET,
                cluster_status: QuorumState::ANY,
                instance_status: ManagedInstanceState::ONLINE_RW,
                metadata_validations: mutating_validations(),
            },
        );
        table.insert(
            "ReplicaSet.status",
            OperationKind::ReadOnly,
            FunctionAvailability {
                min_version: limits::MIN_AR_VERSION,
                instance_config_state: GrInstanceType::ASYNC_REPLICA_SET,
                cluster_status: QuorumState::ANY,
                instance_status: ONLINE,
                metadata_validations: read_only_validations(),
            },
        );

        table
    }

    /// Add or replace an entry.
    pub fn insert(&mut self, name: &str, kind: OperationKind, requirement: FunctionAvailability) {
        self.entries
            .insert(name.to_string(), TableEntry { kind, requirement });
    }

    pub fn get(&self, name: &str) -> Option<&FunctionAvailability> {
        self.entries.get(name).map(|e| &e.requirement)
    }

    pub fn kind(&self, name: &str) -> Option<OperationKind> {
        self.entries.get(name).map(|e| e.kind)
    }

    /// Operation names, sorted.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }
}

fn instance_type_message(actual: GrInstanceType) -> String {
    let reason = if actual == GrInstanceType::STANDALONE {
        "a standalone instance"
    } else if actual == GrInstanceType::STANDALONE_WITH_METADATA {
        "a standalone instance (metadata exists, instance does not belong to that metadata)"
    } else if actual == GrInstanceType::STANDALONE_IN_METADATA {
        "a standalone instance (metadata exists, instance belongs to that metadata, but GR is not active)"
    } else if actual == GrInstanceType::GROUP_REPLICATION {
        "an instance belonging to an unmanaged replication group"
    } else if actual == GrInstanceType::INNODB_CLUSTER {
        "an instance already in an InnoDB cluster"
    } else if actual == GrInstanceType::ASYNC_REPLICA_SET {
        "an instance that is a member of an InnoDB ReplicaSet"
    } else {
        return "Unable to detect target instance state. Please check account privileges."
            .to_string();
    };
    format!("This function is not available through a session to {}", reason)
}

fn quorum_message(actual: QuorumState, required: QuorumState) -> String {
    if required == QuorumState::ALL_ONLINE {
        "This operation requires all the cluster members to be ONLINE".to_string()
    } else if actual.contains(QuorumState::DEAD) {
        "There is no quorum to perform the operation: the group is not reachable from this instance"
            .to_string()
    } else {
        "There is no quorum to perform the operation".to_string()
    }
}

fn instance_state_message(actual: ManagedInstanceState) -> String {
    if actual == ManagedInstanceState::ONLINE_RO {
        "This function is not available through a session to a read only instance".to_string()
    } else {
        format!(
            "This function is not available through a session to an instance in state {}",
            actual.describe()
        )
    }
}

/// Admit or reject `function_name` against `info`.
///
/// `custom` replaces the table entry when given, so callers can tighten or
/// loosen a requirement without a table of their own.
pub fn check_preconditions(
    table: &AvailabilityTable,
    function_name: &str,
    info: &ClusterCheckInfo,
    custom: Option<&FunctionAvailability>,
) -> Result<PreconditionReport> {
    let requirement = match custom {
        Some(requirement) => requirement,
        None => table
            .get(function_name)
            .ok_or_else(|| ClusterAdminError::UnknownOperation(function_name.to_string()))?,
    };

    let mut report = PreconditionReport {
        quorum: info.quorum,
        warnings: Vec::new(),
        notes: Vec::new(),
    };

    let fail = |failure: PreconditionFailure, warnings: Vec<Warning>| {
        debug!(
            operation = %function_name,
            field = failure.field(),
            error = %failure,
            "Precondition failed"
        );
        ClusterAdminError::PreconditionFailed {
            operation: function_name.to_string(),
            failure,
            warnings,
        }
    };

    if info.source_version < requirement.min_version {
        return Err(fail(
            PreconditionFailure::UnsupportedVersion {
                actual: info.source_version,
                required: requirement.min_version,
                message: format!(
                    "This operation requires MySQL version {} or newer, but the instance is {}",
                    requirement.min_version, info.source_version
                ),
            },
            Vec::new(),
        ));
    }

    if !requirement.instance_config_state.intersects(info.source_type) {
        return Err(fail(
            PreconditionFailure::IncompatibleInstanceConfiguration {
                actual: info.source_type,
                allowed: requirement.instance_config_state,
                message: instance_type_message(info.source_type),
            },
            Vec::new(),
        ));
    }

    if !requirement.cluster_status.intersects(info.quorum) {
        return Err(fail(
            PreconditionFailure::QuorumNotAvailable {
                actual: info.quorum,
                required: requirement.cluster_status,
                message: quorum_message(info.quorum, requirement.cluster_status),
            },
            Vec::new(),
        ));
    }

    if !requirement.instance_status.intersects(info.source_state) {
        return Err(fail(
            PreconditionFailure::InstanceNotAvailable {
                actual: info.source_state,
                allowed: requirement.instance_status,
                message: instance_state_message(info.source_state),
            },
            Vec::new(),
        ));
    }

    let supported = limits::CURRENT_METADATA_VERSION;
    for validation in &requirement.metadata_validations {
        if !validation.matches(info.metadata_state) {
            continue;
        }

        let message = describe_state(info.metadata_state, info.metadata_version, supported);
        match validation.action {
            MdsAction::RaiseError => {
                return Err(fail(
                    PreconditionFailure::MetadataIncompatible {
                        actual: info.metadata_state,
                        message,
                    },
                    report.warnings,
                ));
            }
            MdsAction::Warn => {
                warn!(operation = %function_name, metadata = %info.metadata_state, "{}", message);
                report
                    .warnings
                    .push(Warning::new(warning_codes::METADATA_VERSION_WARNING, message));
            }
            MdsAction::Note => {
                report
                    .notes
                    .push(Warning::new(warning_codes::METADATA_VERSION_NOTE, message));
            }
            MdsAction::None => {}
        }
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn snapshot(quorum: QuorumState) -> ClusterCheckInfo {
        ClusterCheckInfo {
            source_version: Version::new(8, 0, 0),
            quorum,
            source_type: GrInstanceType::INNODB_CLUSTER,
            source_state: ManagedInstanceState::ONLINE_RW,
            metadata_state: MetadataStates::EQUAL,
            metadata_version: Some(limits::CURRENT_METADATA_VERSION),
        }
    }

    fn join_requirement() -> FunctionAvailability {
        FunctionAvailability {
            min_version: Version::new(5, 7, 0),
            instance_config_state: GrInstanceType::INNODB_CLUSTER,
            cluster_status: QuorumState::NORMAL | QuorumState::ALL_ONLINE,
            instance_status: ONLINE,
            metadata_validations: vec![],
        }
    }

    fn failed_field(result: Result<PreconditionReport>) -> &'static str {
        match result {
            Err(ClusterAdminError::PreconditionFailed { failure, .. }) => failure.field(),
            other => panic!("expected a precondition failure, got {:?}", other),
        }
    }

    #[test]
    fn test_join_admitted_with_normal_quorum() {
        let table = AvailabilityTable::new();
        let report =
            check_preconditions(&table, "join", &snapshot(QuorumState::NORMAL), Some(&join_requirement()))
                .unwrap();
        assert_eq!(report.quorum, QuorumState::NORMAL);
        assert!(report.warnings.is_empty());
    }

    #[test]
    fn test_join_rejected_without_quorum() {
        let table = AvailabilityTable::new();
        let result = check_preconditions(
            &table,
            "join",
            &snapshot(QuorumState::QUORUMLESS),
            Some(&join_requirement()),
        );
        let err = result.unwrap_err();
        assert_eq!(err.error_code(), "QUORUM_NOT_AVAILABLE");
        assert_eq!(err.to_string(), "join: There is no quorum to perform the operation");
    }

    #[test]
    fn test_unknown_operation() {
        let table = AvailabilityTable::standard();
        let err = check_preconditions(&table, "Cluster.explode", &snapshot(QuorumState::NORMAL), None)
            .unwrap_err();
        assert!(matches!(err, ClusterAdminError::UnknownOperation(_)));
    }

    #[test]
    fn test_check_order_reports_first_failure() {
        let table = AvailabilityTable::standard();
        let mut info = snapshot(QuorumState::QUORUMLESS);
        info.source_type = GrInstanceType::STANDALONE;
        info.source_state = ManagedInstanceState::OFFLINE;

        // Instance type is checked before quorum and state
        let result = check_preconditions(&table, "Cluster.addInstance", &info, None);
        assert_eq!(failed_field(result), "instance_type");
    }

    #[test]
    fn test_read_only_instance_message() {
        let table = AvailabilityTable::standard();
        let mut info = snapshot(QuorumState::NORMAL | QuorumState::ALL_ONLINE);
        info.source_state = ManagedInstanceState::ONLINE_RO;

        let err = check_preconditions(&table, "Cluster.addInstance", &info, None).unwrap_err();
        assert!(err
            .to_string()
            .ends_with("This function is not available through a session to a read only instance"));
        assert!(check_preconditions(&table, "Cluster.status", &info, None).is_ok());
    }

    #[test]
    fn test_all_online_requirement() {
        let table = AvailabilityTable::standard();
        let result = check_preconditions(
            &table,
            "Cluster.setOption",
            &snapshot(QuorumState::NORMAL),
            None,
        );
        let err = result.unwrap_err();
        assert!(err.to_string().contains("all the cluster members to be ONLINE"));

        let info = snapshot(QuorumState::NORMAL | QuorumState::ALL_ONLINE);
        assert!(check_preconditions(&table, "Cluster.setOption", &info, None).is_ok());
    }

    #[test]
    fn test_unknown_type_message() {
        let table = AvailabilityTable::standard();
        let mut info = snapshot(QuorumState::NORMAL);
        info.source_type = GrInstanceType::UNKNOWN;
        let err = check_preconditions(&table, "Cluster.status", &info, None).unwrap_err();
        assert!(err.to_string().contains("Please check account privileges"));
    }

    #[test]
    fn test_metadata_warning_then_error() {
        let table = AvailabilityTable::new();
        let mut requirement = join_requirement();
        requirement.metadata_validations = vec![
            MetadataValidation::new(MetadataStates::COMPATIBLE_LOWER, MdsAction::Warn),
            MetadataValidation::new(MetadataStates::PATCH_LOWER, MdsAction::RaiseError),
        ];
        let mut info = snapshot(QuorumState::NORMAL);
        info.metadata_state = MetadataStates::PATCH_LOWER;
        info.metadata_version = Some(Version::new(1, 9, 9));

        match check_preconditions(&table, "join", &info, Some(&requirement)) {
            Err(ClusterAdminError::PreconditionFailed { failure, warnings, .. }) => {
                assert_eq!(failure.field(), "metadata");
                assert_eq!(warnings.len(), 1);
                assert_eq!(warnings[0].code, warning_codes::METADATA_VERSION_WARNING);
            }
            other => panic!("expected metadata failure, got {:?}", other),
        }
    }

    #[test]
    fn test_metadata_warn_is_not_fatal() {
        let table = AvailabilityTable::standard();
        let mut info = snapshot(QuorumState::NORMAL);
        info.metadata_state = MetadataStates::MINOR_LOWER;
        info.metadata_version = Some(Version::new(2, 0, 0));

        let report = check_preconditions(&table, "Cluster.addInstance", &info, None).unwrap();
        assert_eq!(report.warnings.len(), 1);

        let report = check_preconditions(&table, "Cluster.status", &info, None).unwrap();
        assert!(report.warnings.is_empty());
        assert_eq!(report.notes.len(), 1);
    }

    #[test]
    fn test_standard_table_names() {
        let table = AvailabilityTable::standard();
        assert_eq!(table.names().count(), 19);
        assert_eq!(table.kind("Cluster.status"), Some(OperationKind::ReadOnly));
        assert_eq!(table.kind("Cluster.addInstance"), Some(OperationKind::Mutating));
        assert_eq!(
            table.get("Cluster.setPrimaryInstance").map(|r| r.min_version),
            Some(Version::new(8, 0, 13))
        );
    }

    fn pick<T: Copy>(all: Vec<T>, bits: u8, empty: T, join: fn(T, T) -> T) -> T {
        all.into_iter()
            .enumerate()
            .filter(|(i, _)| bits & (1 << i) != 0)
            .fold(empty, |acc, (_, flag)| join(acc, flag))
    }

    fn type_mask(bits: u8) -> GrInstanceType {
        pick(GrInstanceType::ANY.iter().collect(), bits, GrInstanceType::NONE, GrInstanceType::union)
    }

    fn state_mask(bits: u8) -> ManagedInstanceState {
        pick(
            ManagedInstanceState::ANY.iter().collect(),
            bits,
            ManagedInstanceState::NONE,
            ManagedInstanceState::union,
        )
    }

    fn quorum_mask(bits: u8) -> QuorumState {
        pick(QuorumState::ANY.iter().collect(), bits, QuorumState::NONE, QuorumState::union)
    }

    fn observed_quorum() -> impl Strategy<Value = QuorumState> {
        prop_oneof![
            Just(QuorumState::NORMAL | QuorumState::ALL_ONLINE),
            Just(QuorumState::NORMAL),
            Just(QuorumState::QUORUMLESS),
            Just(QuorumState::DEAD),
        ]
    }

    fn version() -> impl Strategy<Value = Version> {
        (5u32..=9, 0u32..=3, 0u32..=40).prop_map(|(a, b, c)| Version::new(a, b, c))
    }

    prop_compose! {
        fn any_snapshot()(
            source_version in version(),
            quorum in observed_quorum(),
            type_bit in 0usize..7,
            state_bit in 0usize..7,
        ) -> ClusterCheckInfo {
            ClusterCheckInfo {
                source_version,
                quorum,
                source_type: GrInstanceType::ANY.iter().nth(type_bit).unwrap_or(GrInstanceType::STANDALONE),
                source_state: ManagedInstanceState::ANY.iter().nth(state_bit).unwrap_or(ManagedInstanceState::OFFLINE),
                metadata_state: MetadataStates::EQUAL,
                metadata_version: Some(limits::CURRENT_METADATA_VERSION),
            }
        }
    }

    proptest! {
        #[test]
        fn prop_admission_is_monotonic(
            info in any_snapshot(),
            min_version in version(),
            types in any::<u8>(),
            quorum in 0u8..16,
            states in any::<u8>(),
            extra_types in any::<u8>(),
            extra_quorum in 0u8..16,
            extra_states in any::<u8>(),
        ) {
            let table = AvailabilityTable::new();
            let requirement = FunctionAvailability {
                min_version: min_version.min(info.source_version),
                instance_config_state: info.source_type | type_mask(types),
                cluster_status: info.quorum | quorum_mask(quorum),
                instance_status: info.source_state | state_mask(states),
                metadata_validations: mutating_validations(),
            };
            prop_assert!(check_preconditions(&table, "op", &info, Some(&requirement)).is_ok());

            let mut relaxed = requirement.clone();
            relaxed.instance_config_state |= type_mask(extra_types);
            prop_assert!(check_preconditions(&table, "op", &info, Some(&relaxed)).is_ok());

            let mut relaxed = requirement.clone();
            relaxed.cluster_status |= quorum_mask(extra_quorum);
            prop_assert!(check_preconditions(&table, "op", &info, Some(&relaxed)).is_ok());

            let mut relaxed = requirement.clone();
            relaxed.instance_status |= state_mask(extra_states);
            prop_assert!(check_preconditions(&table, "op", &info, Some(&relaxed)).is_ok());

            let mut relaxed = requirement;
            relaxed.min_version = Version::new(0, 0, 0);
            prop_assert!(check_preconditions(&table, "op", &info, Some(&relaxed)).is_ok());
        }

        #[test]
        fn prop_version_boundary(min in version().prop_filter("patch above zero", |v| v.patch > 0)) {
            let table = AvailabilityTable::new();
            let requirement = FunctionAvailability {
                min_version: min,
                instance_config_state: GrInstanceType::ANY,
                cluster_status: QuorumState::ANY,
                instance_status: ManagedInstanceState::ANY,
                metadata_validations: vec![],
            };

            let mut info = snapshot(QuorumState::NORMAL);
            info.source_version = min;
            prop_assert!(check_preconditions(&table, "op", &info, Some(&requirement)).is_ok());

            info.source_version = Version::new(min.major, min.minor, min.patch - 1);
            let result = check_preconditions(&table, "op", &info, Some(&requirement));
            prop_assert_eq!(failed_field(result), "version");
        }
    }

    #[test]
    fn test_dead_quorum_blocks_mutations() {
        let table = AvailabilityTable::standard();
        for name in table.names() {
            let requirement = table.get(name).unwrap();
            if table.kind(name) != Some(OperationKind::Mutating)
                || requirement.cluster_status.intersects(QuorumState::DEAD)
            {
                continue;
            }

            let info = ClusterCheckInfo {
                source_version: Version::new(8, 0, 30),
                quorum: QuorumState::DEAD,
                source_type: requirement.instance_config_state.iter().next().unwrap(),
                source_state: requirement.instance_status.iter().next().unwrap(),
                metadata_state: MetadataStates::EQUAL,
                metadata_version: Some(limits::CURRENT_METADATA_VERSION),
            };
            let result = check_preconditions(&table, name, &info, None);
            assert_eq!(failed_field(result), "quorum", "{}", name);
        }
    }
}
