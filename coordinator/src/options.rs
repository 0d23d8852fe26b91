//! Operation options.
//!
//! Options arrive as a JSON object. Keys are checked against the set each
//! operation recognizes before values are decoded.

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;

use clusteradmin_common::{ClusterAdminError, InstanceAddress, Result};

use crate::group_replication::{RecoveryMethod, SslMode};

/// Decode `value` into `T`, rejecting keys outside `keys`.
pub fn parse_options<T: DeserializeOwned>(value: &Value, keys: &[&str]) -> Result<T> {
    let object = match value {
        Value::Null => serde_json::Map::new(),
        Value::Object(map) => map.clone(),
        _ => {
            return Err(ClusterAdminError::invalid_option(
                "options",
                "Argument #1 is expected to be a map",
            ))
        }
    };

    if let Some(unknown) = object.keys().find(|k| !keys.contains(&k.as_str())) {
        return Err(ClusterAdminError::invalid_option(
            unknown.as_str(),
            "Invalid options: not recognized by this operation",
        ));
    }

    serde_json::from_value(Value::Object(object))
        .map_err(|e| ClusterAdminError::invalid_option("options", e.to_string()))
}

fn check_exit_state_action(value: &Option<String>) -> Result<()> {
    match value.as_deref() {
        None => Ok(()),
        Some(action)
            if ["READ_ONLY", "OFFLINE_MODE", "ABORT_SERVER"]
                .iter()
                .any(|a| a.eq_ignore_ascii_case(action)) =>
        {
            Ok(())
        }
        Some(_) => Err(ClusterAdminError::invalid_option(
            "exitStateAction",
            "must be one of READ_ONLY, OFFLINE_MODE, ABORT_SERVER",
        )),
    }
}

fn check_member_weight(value: Option<u32>) -> Result<()> {
    match value {
        Some(weight) if weight > 100 => Err(ClusterAdminError::invalid_option(
            "memberWeight",
            "must be between 0 and 100",
        )),
        _ => Ok(()),
    }
}

fn check_auto_rejoin_tries(value: Option<u32>) -> Result<()> {
    match value {
        Some(tries) if tries > 2016 => Err(ClusterAdminError::invalid_option(
            "autoRejoinTries",
            "must be between 0 and 2016",
        )),
        _ => Ok(()),
    }
}

/// Group Replication settings shared by create and add.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupOptions {
    pub member_ssl_mode: SslMode,
    pub local_address: Option<InstanceAddress>,
    pub exit_state_action: Option<String>,
    pub member_weight: Option<u32>,
    pub auto_rejoin_tries: Option<u32>,
}

/// Options of `Cluster.addInstance`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddInstanceOptions {
    pub instance: InstanceAddress,
    /// Member to join through; defaults to the session's instance.
    #[serde(default)]
    pub peer: Option<InstanceAddress>,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub local_address: Option<InstanceAddress>,
    /// Extra seeds, comma separated.
    #[serde(default)]
    pub group_seeds: Option<String>,
    /// Use `group_seeds` as the whole seed list.
    #[serde(default)]
    pub overwrite_seed: bool,
    #[serde(default)]
    pub member_ssl_mode: SslMode,
    #[serde(default)]
    pub exit_state_action: Option<String>,
    #[serde(default)]
    pub member_weight: Option<u32>,
    #[serde(default)]
    pub auto_rejoin_tries: Option<u32>,
    #[serde(default)]
    pub recovery_method: RecoveryMethod,
    /// Seconds to wait for the instance to come ONLINE; 0 does not wait.
    #[serde(default)]
    pub wait_recovery: Option<u64>,
    #[serde(default)]
    pub interactive: bool,
    #[serde(default)]
    pub replication_user: Option<String>,
    #[serde(default)]
    pub replication_password: Option<String>,
    /// Reuse an existing recovery account instead of creating one.
    #[serde(default)]
    pub skip_replication_user: bool,
    #[serde(default)]
    pub skip_instance_check: bool,
}

impl AddInstanceOptions {
    pub const KEYS: &'static [&'static str] = &[
        "instance",
        "peer",
        "label",
        "localAddress",
        "groupSeeds",
        "overwriteSeed",
        "memberSslMode",
        "exitStateAction",
        "memberWeight",
        "autoRejoinTries",
        "recoveryMethod",
        "waitRecovery",
        "interactive",
        "replicationUser",
        "replicationPassword",
        "skipReplicationUser",
        "skipInstanceCheck",
    ];

    pub fn parse(value: &Value) -> Result<Self> {
        let options: Self = parse_options(value, Self::KEYS)?;
        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> Result<()> {
        check_exit_state_action(&self.exit_state_action)?;
        check_member_weight(self.member_weight)?;
        check_auto_rejoin_tries(self.auto_rejoin_tries)?;

        if self.replication_password.is_some() && self.replication_user.is_none() {
            return Err(ClusterAdminError::invalid_option(
                "replicationPassword",
                "requires replicationUser",
            ));
        }
        if self.overwrite_seed && self.group_seeds.is_none() {
            return Err(ClusterAdminError::invalid_option(
                "overwriteSeed",
                "requires groupSeeds",
            ));
        }
        if let Some(seeds) = &self.group_seeds {
            for seed in seeds.split(',').map(str::trim).filter(|s| !s.is_empty()) {
                InstanceAddress::parse(seed)
                    .map_err(|e| ClusterAdminError::invalid_option("groupSeeds", e.to_string()))?;
            }
        }
        if matches!(&self.label, Some(label) if label.trim().is_empty()) {
            return Err(ClusterAdminError::invalid_option("label", "cannot be empty"));
        }
        Ok(())
    }

    pub fn group(&self) -> GroupOptions {
        GroupOptions {
            member_ssl_mode: self.member_ssl_mode,
            local_address: self.local_address.clone(),
            exit_state_action: self.exit_state_action.clone(),
            member_weight: self.member_weight,
            auto_rejoin_tries: self.auto_rejoin_tries,
        }
    }
}

/// Options of `Dba.createCluster`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateClusterOptions {
    pub name: String,
    #[serde(default)]
    pub multi_primary: bool,
    #[serde(default)]
    pub group_name: Option<String>,
    #[serde(default)]
    pub local_address: Option<InstanceAddress>,
    #[serde(default)]
    pub member_ssl_mode: SslMode,
    #[serde(default)]
    pub exit_state_action: Option<String>,
    #[serde(default)]
    pub member_weight: Option<u32>,
    #[serde(default)]
    pub auto_rejoin_tries: Option<u32>,
    #[serde(default)]
    pub interactive: bool,
}

impl CreateClusterOptions {
    pub const KEYS: &'static [&'static str] = &[
        "name",
        "multiPrimary",
        "groupName",
        "localAddress",
        "memberSslMode",
        "exitStateAction",
        "memberWeight",
        "autoRejoinTries",
        "interactive",
    ];

    pub fn parse(value: &Value) -> Result<Self> {
        let options: Self = parse_options(value, Self::KEYS)?;
        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> Result<()> {
        let name = self.name.as_str();
        if name.is_empty() || name.len() > 63 {
            return Err(ClusterAdminError::invalid_option(
                "name",
                "The Cluster name must be between 1 and 63 characters long",
            ));
        }
        if name.starts_with(|c: char| c.is_ascii_digit())
            || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
        {
            return Err(ClusterAdminError::invalid_option(
                "name",
                "The Cluster name can only contain alphanumerics, '_', '-' or '.', and cannot start with a number",
            ));
        }
        if let Some(group_name) = &self.group_name {
            uuid::Uuid::parse_str(group_name)
                .map_err(|_| ClusterAdminError::invalid_option("groupName", "must be a UUID"))?;
        }
        check_exit_state_action(&self.exit_state_action)?;
        check_member_weight(self.member_weight)?;
        check_auto_rejoin_tries(self.auto_rejoin_tries)
    }

    pub fn group(&self) -> GroupOptions {
        GroupOptions {
            member_ssl_mode: self.member_ssl_mode,
            local_address: self.local_address.clone(),
            exit_state_action: self.exit_state_action.clone(),
            member_weight: self.member_weight,
            auto_rejoin_tries: self.auto_rejoin_tries,
        }
    }
}

/// Options of `Cluster.removeInstance`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoveInstanceOptions {
    pub instance: InstanceAddress,
    /// Proceed when the instance cannot be reached.
    #[serde(default)]
    pub force: bool,
    #[serde(default)]
    pub interactive: bool,
}

impl RemoveInstanceOptions {
    pub const KEYS: &'static [&'static str] = &["instance", "force", "interactive"];

    pub fn parse(value: &Value) -> Result<Self> {
        parse_options(value, Self::KEYS)
    }
}

/// Options of `Cluster.status`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusOptions {
    /// 0 is the default view; 1 adds versions and replication details.
    #[serde(default)]
    pub extended: u8,
}

impl StatusOptions {
    pub const KEYS: &'static [&'static str] = &["extended"];

    pub fn parse(value: &Value) -> Result<Self> {
        let options: Self = parse_options(value, Self::KEYS)?;
        if options.extended > 3 {
            return Err(ClusterAdminError::invalid_option(
                "extended",
                "must be between 0 and 3",
            ));
        }
        Ok(options)
    }
}

/// `Cluster.describe` takes no options.
pub fn parse_no_options(value: &Value) -> Result<()> {
    let _: serde_json::Map<String, Value> = parse_options(value, &[])?;
    Ok(())
}
