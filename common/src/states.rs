//! Instance, instance-type and quorum state sets.
//!
//! An observation (one snapshot) carries a single flag per set, while an
//! operation requirement carries any union of flags. Admission is then a
//! plain intersection test.

use serde::{Deserialize, Serialize};
use std::fmt;

state_set! {
    /// Observed role of a single managed instance (`ManagedInstance.State`).
    ManagedInstanceState: u8 {
        ONLINE_RW = 0 => "OnlineRW",
        ONLINE_RO = 1 => "OnlineRO",
        RECOVERING = 2 => "Recovering",
        UNREACHABLE = 3 => "Unreachable",
        OFFLINE = 4 => "Offline",
        ERROR = 5 => "Error",
        MISSING = 6 => "Missing",
    }
}

state_set! {
    /// Configuration of an instance relative to cluster membership.
    GrInstanceType: u8 {
        STANDALONE = 0 => "Standalone",
        GROUP_REPLICATION = 1 => "GroupReplication",
        INNODB_CLUSTER = 2 => "InnoDBCluster",
        /// Metadata schema exists but the instance is not registered in it.
        STANDALONE_WITH_METADATA = 3 => "StandaloneWithMetadata",
        /// Registered in the metadata but Group Replication is not running.
        STANDALONE_IN_METADATA = 4 => "StandaloneInMetadata",
        ASYNC_REPLICA_SET = 5 => "AsyncReplicaSet",
        /// Privileges were insufficient to classify the instance.
        UNKNOWN = 6 => "Unknown",
    }
}

state_set! {
    /// Consensus health of the group as observed from one member.
    QuorumState: u8 {
        ALL_ONLINE = 0 => "All_online",
        NORMAL = 1 => "Normal",
        QUORUMLESS = 2 => "Quorumless",
        DEAD = 3 => "Dead",
    }
}

impl ManagedInstanceState {
    /// Human readable description used in operator-facing messages.
    pub fn describe(self) -> &'static str {
        match self {
            Self::ONLINE_RW => "Read/Write",
            Self::ONLINE_RO => "Read Only",
            Self::RECOVERING => "Recovering",
            Self::UNREACHABLE => "Unreachable",
            Self::OFFLINE => "Offline",
            Self::ERROR => "Error",
            Self::MISSING => "(Missing)",
            _ => "Unknown",
        }
    }
}

/// Group Replication `MEMBER_STATE` as reported by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MemberState {
    Online,
    Recovering,
    Offline,
    Error,
    Unreachable,
}

impl MemberState {
    /// Parse the performance_schema representation.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ONLINE" => Some(Self::Online),
            "RECOVERING" => Some(Self::Recovering),
            "OFFLINE" => Some(Self::Offline),
            "ERROR" => Some(Self::Error),
            "UNREACHABLE" => Some(Self::Unreachable),
            _ => None,
        }
    }

    /// Whether the member takes part in the group view.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Online | Self::Recovering)
    }
}

impl fmt::Display for MemberState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Online => "ONLINE",
            Self::Recovering => "RECOVERING",
            Self::Offline => "OFFLINE",
            Self::Error => "ERROR",
            Self::Unreachable => "UNREACHABLE",
        };
        write!(f, "{}", s)
    }
}

/// Group Replication `MEMBER_ROLE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MemberRole {
    Primary,
    Secondary,
}

/// Group topology mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TopologyMode {
    SinglePrimary,
    MultiPrimary,
}

impl fmt::Display for TopologyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SinglePrimary => write!(f, "Single-Primary"),
            Self::MultiPrimary => write!(f, "Multi-Primary"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_any_contains_every_flag() {
        for flag in ManagedInstanceState::ANY.iter() {
            assert!(ManagedInstanceState::ANY.contains(flag));
        }
        assert_eq!(ManagedInstanceState::ANY.iter().count(), 7);
        assert_eq!(QuorumState::ANY.iter().count(), 4);
        assert_eq!(GrInstanceType::ANY.iter().count(), 7);
    }

    #[test]
    fn test_intersection_semantics() {
        let allowed = ManagedInstanceState::ONLINE_RW | ManagedInstanceState::ONLINE_RO;
        assert!(allowed.intersects(ManagedInstanceState::ONLINE_RO));
        assert!(!allowed.intersects(ManagedInstanceState::RECOVERING));
        assert!(!allowed.intersects(ManagedInstanceState::NONE));
    }

    #[test]
    fn test_display() {
        let quorum = QuorumState::NORMAL | QuorumState::ALL_ONLINE;
        assert_eq!(quorum.to_string(), "All_online|Normal");
        assert_eq!(QuorumState::NONE.to_string(), "(none)");
        assert_eq!(GrInstanceType::INNODB_CLUSTER.name(), Some("InnoDBCluster"));
        assert_eq!(quorum.name(), None);
    }

    #[test]
    fn test_serialize_as_string() {
        let json = serde_json::to_string(&ManagedInstanceState::ONLINE_RW).unwrap();
        assert_eq!(json, "\"OnlineRW\"");
    }

    #[test]
    fn test_member_state_parse() {
        assert_eq!(MemberState::parse("online"), Some(MemberState::Online));
        assert_eq!(MemberState::parse("UNREACHABLE"), Some(MemberState::Unreachable));
        assert_eq!(MemberState::parse("bogus"), None);
        assert!(MemberState::Recovering.is_active());
        assert!(!MemberState::Error.is_active());
    }
}
