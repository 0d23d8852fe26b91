//! Identifier types for cluster administration entities.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Unique identifier for one invocation of an administrative operation.
/// Uses UUID v7 for time-ordered identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OperationId(Uuid);

impl OperationId {
    /// Create a new operation ID.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for OperationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The `server_uuid` of a MySQL server, also its Group Replication member id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServerUuid(Uuid);

impl ServerUuid {
    /// Generate a random server UUID.
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create from an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Parse from string.
    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        Ok(Self(Uuid::parse_str(s.trim())?))
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for ServerUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Prefix of the replication accounts created for member recovery.
pub const RECOVERY_ACCOUNT_PREFIX: &str = "mysql_innodb_cluster_";

/// Name of the recovery account owned by the member with `server_id`.
pub fn recovery_account_name(server_id: u32) -> String {
    format!("{}{}", RECOVERY_ACCOUNT_PREFIX, server_id)
}

/// A `host:port` endpoint of a MySQL server. Serialized as its string form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct InstanceAddress {
    pub host: String,
    pub port: u16,
}

/// Error returned when an instance address cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid instance address '{input}': {reason}")]
pub struct AddressParseError {
    pub input: String,
    pub reason: &'static str,
}

/// Default classic protocol port.
pub const DEFAULT_MYSQL_PORT: u16 = 3306;

impl InstanceAddress {
    /// Create a new address.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse `host:port`, `host` (default port) or `[ipv6]:port`.
    pub fn parse(s: &str) -> Result<Self, AddressParseError> {
        let err = |reason| AddressParseError {
            input: s.to_string(),
            reason,
        };

        let s = s.trim();
        if s.is_empty() {
            return Err(err("empty address"));
        }

        let (host, port) = if let Some(rest) = s.strip_prefix('[') {
            let (host, tail) = rest.split_once(']').ok_or_else(|| err("unterminated '['"))?;
            match tail.strip_prefix(':') {
                Some(port) => (host, Some(port)),
                None if tail.is_empty() => (host, None),
                None => return Err(err("unexpected text after ']'")),
            }
        } else {
            match s.rsplit_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (s, None),
            }
        };

        if host.is_empty() {
            return Err(err("empty host"));
        }

        let port = match port {
            Some(p) => p.parse::<u16>().map_err(|_| err("invalid port"))?,
            None => DEFAULT_MYSQL_PORT,
        };
        if port == 0 {
            return Err(err("port cannot be 0"));
        }

        Ok(Self::new(host, port))
    }

    /// The Group Replication local address derived from this endpoint
    /// (`host:port*10+1`). `None` when the derived port is out of range.
    pub fn default_local_address(&self) -> Option<InstanceAddress> {
        let port = u32::from(self.port) * 10 + 1;
        u16::try_from(port)
            .ok()
            .map(|port| InstanceAddress::new(self.host.clone(), port))
    }
}

impl fmt::Display for InstanceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for InstanceAddress {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for InstanceAddress {
    type Error = AddressParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<InstanceAddress> for String {
    fn from(addr: InstanceAddress) -> String {
        addr.to_string()
    }
}
