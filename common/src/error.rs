//! Error types for cluster administration.

use serde::Serialize;
use thiserror::Error;

use crate::{
    GrInstanceType, InstanceAddress, ManagedInstanceState, MetadataStates, QuorumState,
    ServerUuid, Version,
};

/// The precondition that rejected an operation, carrying the observed value
/// and the requirement it failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PreconditionFailure {
    /// Server too old (or too new) for the operation.
    #[error("{message}")]
    UnsupportedVersion {
        actual: Version,
        required: Version,
        message: String,
    },

    /// The instance is not configured the way the operation needs.
    #[error("{message}")]
    IncompatibleInstanceConfiguration {
        actual: GrInstanceType,
        allowed: GrInstanceType,
        message: String,
    },

    /// The group cannot agree on its membership.
    #[error("{message}")]
    QuorumNotAvailable {
        actual: QuorumState,
        required: QuorumState,
        message: String,
    },

    /// The instance is in a state the operation cannot run on.
    #[error("{message}")]
    InstanceNotAvailable {
        actual: ManagedInstanceState,
        allowed: ManagedInstanceState,
        message: String,
    },

    /// A metadata validation demanded an error.
    #[error("{message}")]
    MetadataIncompatible {
        actual: MetadataStates,
        message: String,
    },
}

impl PreconditionFailure {
    /// The snapshot field that failed.
    pub fn field(&self) -> &'static str {
        match self {
            PreconditionFailure::UnsupportedVersion { .. } => "version",
            PreconditionFailure::IncompatibleInstanceConfiguration { .. } => "instance_type",
            PreconditionFailure::QuorumNotAvailable { .. } => "quorum",
            PreconditionFailure::InstanceNotAvailable { .. } => "instance_state",
            PreconditionFailure::MetadataIncompatible { .. } => "metadata",
        }
    }

    /// Get error code for this precondition.
    pub fn error_code(&self) -> &'static str {
        match self {
            PreconditionFailure::UnsupportedVersion { .. } => "UNSUPPORTED_VERSION",
            PreconditionFailure::IncompatibleInstanceConfiguration { .. } => {
                "INCOMPATIBLE_INSTANCE_CONFIGURATION"
            }
            PreconditionFailure::QuorumNotAvailable { .. } => "QUORUM_NOT_AVAILABLE",
            PreconditionFailure::InstanceNotAvailable { .. } => "INSTANCE_NOT_AVAILABLE",
            PreconditionFailure::MetadataIncompatible { .. } => "METADATA_INCOMPATIBLE",
        }
    }
}

/// Coarse grouping of errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    PreconditionFailed,
    OrchestrationFailed,
    InvalidOption,
    Internal,
}

/// Main error type for cluster administration operations.
#[derive(Error, Debug, Clone)]
pub enum ClusterAdminError {
    /// A precondition rejected the operation.
    #[error("{operation}: {failure}")]
    PreconditionFailed {
        operation: String,
        failure: PreconditionFailure,
        /// Metadata warnings raised before the failing check.
        warnings: Vec<Warning>,
    },

    /// Cannot reach an instance.
    #[error("Could not open connection to '{address}': {reason}")]
    ConnectionError { address: String, reason: String },

    /// Target is already part of the cluster.
    #[error("The instance '{address}' is already part of this InnoDB cluster")]
    AlreadyMember { address: InstanceAddress },

    /// Target is not part of the cluster.
    #[error("The instance '{address}' does not belong to the cluster")]
    NotAMember { address: InstanceAddress },

    /// Another member already uses the target's server UUID.
    #[error("Cannot add '{address}': server_uuid {uuid} is already used by '{existing}'")]
    ServerUuidConflict {
        address: InstanceAddress,
        uuid: ServerUuid,
        existing: InstanceAddress,
    },

    /// Binary log filters are not allowed on group members.
    #[error("The instance '{address}' has binary log filters configured ({filters}), which Group Replication does not support")]
    IncompatibleReplicationFilters {
        address: InstanceAddress,
        filters: String,
    },

    /// SSL settings of target and cluster cannot be reconciled.
    #[error("Incompatible SSL mode for '{address}': {reason}")]
    IncompatibleSslMode {
        address: InstanceAddress,
        reason: String,
    },

    /// The target is not configured for Group Replication.
    #[error("The instance '{address}' is not valid for InnoDB cluster usage: {}", issues.join("; "))]
    InstanceNotConfigured {
        address: InstanceAddress,
        issues: Vec<String>,
    },

    /// The requested recovery method cannot be used.
    #[error("Recovery method unavailable for '{address}': {reason}")]
    RecoveryMethodUnavailable {
        address: InstanceAddress,
        reason: String,
    },

    /// The recovery account could not be created or configured.
    #[error("Failed to set up recovery account '{user}': {reason}")]
    RecoveryUserCreationFailed { user: String, reason: String },

    /// The Group Replication plugin could not be installed.
    #[error("Failed to install the group_replication plugin on '{address}': {reason}")]
    PluginInstallFailed {
        address: InstanceAddress,
        reason: String,
    },

    /// Joining an existing group failed.
    #[error("Instance '{address}' failed to join the group: {reason}")]
    GroupJoinFailed {
        address: InstanceAddress,
        reason: String,
    },

    /// Bootstrapping a new group failed.
    #[error("Failed to bootstrap the group on '{address}': {reason}")]
    GroupBootstrapFailed {
        address: InstanceAddress,
        reason: String,
    },

    /// Leaving the group failed.
    #[error("Instance '{address}' failed to leave the group: {reason}")]
    GroupLeaveFailed {
        address: InstanceAddress,
        reason: String,
    },

    /// Writing (or removing) the instance's metadata record failed.
    #[error("Failed to update the metadata for '{address}': {reason}")]
    MetadataRegistrationFailed {
        address: InstanceAddress,
        reason: String,
    },

    /// Metadata could not be read or is malformed.
    #[error("Metadata error: {0}")]
    MetadataError(String),

    /// Unrecognized or invalid option.
    #[error("Invalid value for option '{option}': {reason}")]
    InvalidOption { option: String, reason: String },

    /// No such named operation.
    #[error("Unknown operation: {0}")]
    UnknownOperation(String),

    /// Lifecycle method called in the wrong phase.
    #[error("Invalid command transition from {from} to {to}")]
    InvalidPhase { from: String, to: String },

    /// Another mutating operation holds the cluster lock.
    #[error("Cluster '{cluster}' is locked by operation {holder}, retry later")]
    OperationLocked { cluster: String, holder: String },

    /// The caller cancelled the command between steps.
    #[error("Operation cancelled before step '{step}'")]
    Cancelled { step: String },

    /// Timeout.
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    InternalError(String),
}

impl ClusterAdminError {
    /// Build an invalid-option error.
    pub fn invalid_option(option: impl Into<String>, reason: impl Into<String>) -> Self {
        ClusterAdminError::InvalidOption {
            option: option.into(),
            reason: reason.into(),
        }
    }

    /// Coarse category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ClusterAdminError::PreconditionFailed { .. } => ErrorKind::PreconditionFailed,
            ClusterAdminError::InvalidOption { .. } | ClusterAdminError::UnknownOperation(_) => {
                ErrorKind::InvalidOption
            }
            ClusterAdminError::InvalidPhase { .. }
            | ClusterAdminError::ConfigurationError(_)
            | ClusterAdminError::InternalError(_) => ErrorKind::Internal,
            _ => ErrorKind::OrchestrationFailed,
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClusterAdminError::PreconditionFailed { failure, .. } => matches!(
                failure,
                PreconditionFailure::QuorumNotAvailable { .. }
                    | PreconditionFailure::InstanceNotAvailable { .. }
            ),
            ClusterAdminError::ConnectionError { .. }
            | ClusterAdminError::OperationLocked { .. }
            | ClusterAdminError::Timeout(_) => true,
            _ => false,
        }
    }

    /// Get error code for reports.
    pub fn error_code(&self) -> &'static str {
        match self {
            ClusterAdminError::PreconditionFailed { failure, .. } => failure.error_code(),
            ClusterAdminError::ConnectionError { .. } => "CONNECTION_ERROR",
            ClusterAdminError::AlreadyMember { .. } => "ALREADY_MEMBER",
            ClusterAdminError::NotAMember { .. } => "NOT_A_MEMBER",
            ClusterAdminError::ServerUuidConflict { .. } => "SERVER_UUID_CONFLICT",
            ClusterAdminError::IncompatibleReplicationFilters { .. } => {
                "INCOMPATIBLE_REPLICATION_FILTERS"
            }
            ClusterAdminError::IncompatibleSslMode { .. } => "INCOMPATIBLE_SSL_MODE",
            ClusterAdminError::InstanceNotConfigured { .. } => "INSTANCE_NOT_CONFIGURED",
            ClusterAdminError::RecoveryMethodUnavailable { .. } => "RECOVERY_METHOD_UNAVAILABLE",
            ClusterAdminError::RecoveryUserCreationFailed { .. } => {
                "RECOVERY_USER_CREATION_FAILED"
            }
            ClusterAdminError::PluginInstallFailed { .. } => "PLUGIN_INSTALL_FAILED",
            ClusterAdminError::GroupJoinFailed { .. } => "GROUP_JOIN_FAILED",
            ClusterAdminError::GroupBootstrapFailed { .. } => "GROUP_BOOTSTRAP_FAILED",
            ClusterAdminError::GroupLeaveFailed { .. } => "GROUP_LEAVE_FAILED",
            ClusterAdminError::MetadataRegistrationFailed { .. } => {
                "METADATA_REGISTRATION_FAILED"
            }
            ClusterAdminError::MetadataError(_) => "METADATA_ERROR",
            ClusterAdminError::InvalidOption { .. } => "INVALID_OPTION",
            ClusterAdminError::UnknownOperation(_) => "UNKNOWN_OPERATION",
            ClusterAdminError::InvalidPhase { .. } => "INVALID_PHASE",
            ClusterAdminError::OperationLocked { .. } => "OPERATION_LOCKED",
            ClusterAdminError::Cancelled { .. } => "CANCELLED",
            ClusterAdminError::Timeout(_) => "TIMEOUT",
            ClusterAdminError::ConfigurationError(_) => "CONFIGURATION_ERROR",
            ClusterAdminError::InternalError(_) => "INTERNAL_ERROR",
        }
    }

    /// The precondition failure, if this is one.
    pub fn precondition(&self) -> Option<&PreconditionFailure> {
        match self {
            ClusterAdminError::PreconditionFailed { failure, .. } => Some(failure),
            _ => None,
        }
    }
}

/// Result type alias for cluster administration operations.
pub type Result<T> = std::result::Result<T, ClusterAdminError>;

/// A non-fatal condition attached to an otherwise successful result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Warning {
    /// Warning code.
    pub code: &'static str,
    /// Human-readable message.
    pub message: String,
}

impl Warning {
    /// Create a new warning.
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Warning codes.
pub mod warning_codes {
    pub const SEED_PROPAGATION_PARTIAL_FAILURE: &str = "SEED_PROPAGATION_PARTIAL_FAILURE";
    pub const AUTO_INCREMENT_PARTIAL_FAILURE: &str = "AUTO_INCREMENT_PARTIAL_FAILURE";
    pub const METADATA_VERSION_WARNING: &str = "METADATA_VERSION_WARNING";
    pub const METADATA_VERSION_NOTE: &str = "METADATA_VERSION_NOTE";
    pub const RECOVERY_ACCOUNT_NOT_REMOVED: &str = "RECOVERY_ACCOUNT_NOT_REMOVED";
    pub const INSTANCE_UNREACHABLE: &str = "INSTANCE_UNREACHABLE";
    pub const SLOW_RECOVERY: &str = "SLOW_RECOVERY";
}
