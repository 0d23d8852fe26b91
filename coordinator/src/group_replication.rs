//! Group Replication settings, statements and compatibility checks used by
//! the membership commands.

use std::fmt;

use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};

use clusteradmin_common::{
    limits, ClusterAdminError, GtidSet, InstanceAddress, Result, TopologyMode, Version,
};
use clusteradmin_session::instance::quote;
use clusteradmin_session::{Instance, SessionResult};

pub const GR_PLUGIN: &str = "group_replication";
pub const CLONE_PLUGIN: &str = "clone";
pub const RECOVERY_CHANNEL: &str = "group_replication_recovery";

pub const GROUP_NAME: &str = "group_replication_group_name";
pub const LOCAL_ADDRESS: &str = "group_replication_local_address";
pub const GROUP_SEEDS: &str = "group_replication_group_seeds";
pub const BOOTSTRAP_GROUP: &str = "group_replication_bootstrap_group";
pub const SINGLE_PRIMARY_MODE: &str = "group_replication_single_primary_mode";
pub const SSL_MODE: &str = "group_replication_ssl_mode";
pub const CLONE_THRESHOLD: &str = "group_replication_clone_threshold";
pub const EXIT_STATE_ACTION: &str = "group_replication_exit_state_action";
pub const MEMBER_WEIGHT: &str = "group_replication_member_weight";
pub const AUTO_REJOIN_TRIES: &str = "group_replication_autorejoin_tries";
pub const START_ON_BOOT: &str = "group_replication_start_on_boot";

const RECOVERY_PASSWORD_LEN: usize = 32;

/// `CHANGE REPLICATION SOURCE` replaced `CHANGE MASTER` in 8.0.23.
const REPLICATION_SOURCE_SYNTAX: Version = Version::new(8, 0, 23);

/// `memberSslMode` option and `group_replication_ssl_mode` value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SslMode {
    /// Follow the cluster, or the server's SSL support for a new group.
    #[default]
    Auto,
    Disabled,
    Required,
    VerifyCa,
    VerifyIdentity,
}

impl SslMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SslMode::Auto => "AUTO",
            SslMode::Disabled => "DISABLED",
            SslMode::Required => "REQUIRED",
            SslMode::VerifyCa => "VERIFY_CA",
            SslMode::VerifyIdentity => "VERIFY_IDENTITY",
        }
    }

    /// Parse a `group_replication_ssl_mode` value.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "AUTO" => Some(SslMode::Auto),
            "DISABLED" => Some(SslMode::Disabled),
            "REQUIRED" => Some(SslMode::Required),
            "VERIFY_CA" => Some(SslMode::VerifyCa),
            "VERIFY_IDENTITY" => Some(SslMode::VerifyIdentity),
            _ => None,
        }
    }

    pub fn uses_ssl(&self) -> bool {
        !matches!(self, SslMode::Disabled | SslMode::Auto)
    }
}

impl fmt::Display for SslMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Settle the SSL mode a member will use.
///
/// `cluster_mode` is the mode of the group being joined, `None` when a new
/// group is created.
pub fn resolve_ssl_mode(
    address: &InstanceAddress,
    requested: SslMode,
    cluster_mode: Option<SslMode>,
    have_ssl: bool,
) -> Result<SslMode> {
    let incompatible = |reason: String| ClusterAdminError::IncompatibleSslMode {
        address: address.clone(),
        reason,
    };

    let resolved = match (requested, cluster_mode) {
        (SslMode::Auto, Some(cluster)) => cluster,
        (SslMode::Auto, None) if have_ssl => SslMode::Required,
        (SslMode::Auto, None) => SslMode::Disabled,
        (requested, Some(cluster)) if requested != cluster => {
            return Err(incompatible(format!(
                "memberSslMode '{}' differs from the cluster's '{}'",
                requested, cluster
            )))
        }
        (requested, _) => requested,
    };

    if resolved.uses_ssl() && !have_ssl {
        return Err(incompatible(format!(
            "SSL mode {} requires SSL support, which the instance does not have",
            resolved
        )));
    }
    Ok(resolved)
}

/// `recoveryMethod` option.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecoveryMethod {
    #[default]
    Auto,
    Clone,
    Incremental,
}

/// The method a joining member will actually use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolvedRecovery {
    Clone,
    Incremental,
}

/// Pick how the target catches up with the group.
///
/// Incremental recovery needs the target's transactions to be a subset of
/// the group's. Clone needs both servers at 8.0.17 or later.
pub fn choose_recovery_method(
    address: &InstanceAddress,
    requested: RecoveryMethod,
    target_gtid: &GtidSet,
    group_gtid: &GtidSet,
    target_version: Version,
    donor_version: Version,
) -> Result<ResolvedRecovery> {
    let unavailable = |reason: &str| ClusterAdminError::RecoveryMethodUnavailable {
        address: address.clone(),
        reason: reason.to_string(),
    };
    let clone_supported =
        target_version >= limits::MIN_CLONE_VERSION && donor_version >= limits::MIN_CLONE_VERSION;
    let incremental_safe = target_gtid.is_subset_of(group_gtid);

    match requested {
        RecoveryMethod::Clone if clone_supported => Ok(ResolvedRecovery::Clone),
        RecoveryMethod::Clone => Err(unavailable("clone requires MySQL 8.0.17 or later on both instances")),
        RecoveryMethod::Incremental if incremental_safe => Ok(ResolvedRecovery::Incremental),
        RecoveryMethod::Incremental => Err(unavailable(
            "the instance has transactions that are not present in the cluster",
        )),
        RecoveryMethod::Auto if incremental_safe => Ok(ResolvedRecovery::Incremental),
        RecoveryMethod::Auto if clone_supported => Ok(ResolvedRecovery::Clone),
        RecoveryMethod::Auto => Err(unavailable(
            "the instance has errant transactions and clone is not supported",
        )),
    }
}

/// Random password for a recovery account.
pub fn generate_password() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(RECOVERY_PASSWORD_LEN)
        .map(char::from)
        .collect()
}

pub fn create_user_sql(user: &str, password: &str) -> String {
    format!(
        "CREATE USER {}@'%' IDENTIFIED BY {}",
        quote(user),
        quote(password)
    )
}

pub fn grant_replication_sql(user: &str) -> String {
    format!("GRANT REPLICATION SLAVE ON *.* TO {}@'%'", quote(user))
}

pub fn drop_user_sql(user: &str) -> String {
    format!("DROP USER IF EXISTS {}@'%'", quote(user))
}

pub fn user_exists_sql(user: &str) -> String {
    format!("SELECT COUNT(*) FROM mysql.user WHERE user = {}", quote(user))
}

/// Point the recovery channel at `user`.
pub fn recovery_channel_sql(version: Version, user: &str, password: Option<&str>) -> String {
    let (prefix, user_key, password_key) = if version >= REPLICATION_SOURCE_SYNTAX {
        ("CHANGE REPLICATION SOURCE TO", "SOURCE_USER", "SOURCE_PASSWORD")
    } else {
        ("CHANGE MASTER TO", "MASTER_USER", "MASTER_PASSWORD")
    };
    let password = password
        .map(|p| format!(", {} = {}", password_key, quote(p)))
        .unwrap_or_default();
    format!(
        "{} {} = {}{} FOR CHANNEL {}",
        prefix,
        user_key,
        quote(user),
        password,
        quote(RECOVERY_CHANNEL)
    )
}

/// Split a comma separated seed list.
pub fn parse_seeds(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Join seeds, dropping duplicates but keeping first-seen order.
pub fn format_seeds<I, S>(seeds: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut out: Vec<String> = Vec::new();
    for seed in seeds {
        let seed = seed.as_ref().trim();
        if !seed.is_empty() && !out.iter().any(|s| s == seed) {
            out.push(seed.to_string());
        }
    }
    out.join(",")
}

/// `auto_increment_increment` and `auto_increment_offset` for a member.
///
/// Multi-primary groups spread writers over `max(7, size)` slots so members
/// never generate the same key; single-primary groups use the defaults.
pub fn auto_increment_settings(mode: TopologyMode, group_size: usize, server_id: u32) -> (u32, u32) {
    match mode {
        TopologyMode::SinglePrimary => (1, 2),
        TopologyMode::MultiPrimary => {
            let increment = u32::try_from(group_size).unwrap_or(u32::MAX).max(7);
            (increment, 1 + server_id % increment)
        }
    }
}

/// Settings an instance needs before it can run Group Replication.
pub async fn check_instance_configuration(instance: &dyn Instance) -> SessionResult<Vec<String>> {
    let mut issues = Vec::new();

    for (name, expected) in [
        ("binlog_format", "ROW"),
        ("gtid_mode", "ON"),
        ("enforce_gtid_consistency", "ON"),
    ] {
        let value = instance.get_sysvar(name).await?.unwrap_or_default();
        if !value.eq_ignore_ascii_case(expected) {
            issues.push(format!("{} must be {} (found '{}')", name, expected, value));
        }
    }

    if instance.server_id() == 0 {
        issues.push("server_id must be set to a non-zero value".to_string());
    }

    Ok(issues)
}

/// Binary log filters configured on the instance, if any.
pub async fn replication_filters(instance: &dyn Instance) -> SessionResult<Option<String>> {
    let rows = instance.query("SHOW MASTER STATUS").await?;
    let Some(row) = rows.first() else {
        return Ok(None);
    };

    let filters: Vec<String> = [("Binlog_Do_DB", "do_db"), ("Binlog_Ignore_DB", "ignore_db")]
        .iter()
        .filter_map(|(column, label)| {
            row.get(column)
                .filter(|v| !v.trim().is_empty())
                .map(|v| format!("{}={}", label, v))
        })
        .collect();

    if filters.is_empty() {
        Ok(None)
    } else {
        Ok(Some(filters.join(", ")))
    }
}

/// The account the recovery channel authenticates with, if one is set.
pub async fn recovery_channel_user(instance: &dyn Instance) -> SessionResult<Option<String>> {
    let rows = instance
        .query(&format!(
            "SELECT user_name FROM mysql.slave_master_info WHERE channel_name = {}",
            quote(RECOVERY_CHANNEL)
        ))
        .await?;
    Ok(rows
        .first_value()
        .filter(|user| !user.is_empty())
        .map(str::to_string))
}

pub fn mode_value(mode: TopologyMode) -> &'static str {
    match mode {
        TopologyMode::SinglePrimary => "ON",
        TopologyMode::MultiPrimary => "OFF",
    }
}

/// System variables written on the target before it starts Group Replication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupSettings {
    pub group_name: String,
    pub local_address: InstanceAddress,
    pub seeds: String,
    pub mode: TopologyMode,
    pub ssl_mode: SslMode,
    pub exit_state_action: Option<String>,
    pub member_weight: Option<u32>,
    pub auto_rejoin_tries: Option<u32>,
    pub recovery: ResolvedRecovery,
}

impl GroupSettings {
    /// Variable assignments in the order they are applied.
    pub fn assignments(&self) -> Vec<(&'static str, String)> {
        let mut vars = vec![
            (GROUP_NAME, self.group_name.clone()),
            (LOCAL_ADDRESS, self.local_address.to_string()),
            (GROUP_SEEDS, self.seeds.clone()),
            (SINGLE_PRIMARY_MODE, mode_value(self.mode).to_string()),
            (SSL_MODE, self.ssl_mode.to_string()),
            (START_ON_BOOT, "ON".to_string()),
        ];
        if let Some(action) = &self.exit_state_action {
            vars.push((EXIT_STATE_ACTION, action.to_ascii_uppercase()));
        }
        if let Some(weight) = self.member_weight {
            vars.push((MEMBER_WEIGHT, weight.to_string()));
        }
        if let Some(tries) = self.auto_rejoin_tries {
            vars.push((AUTO_REJOIN_TRIES, tries.to_string()));
        }
        if self.recovery == ResolvedRecovery::Clone {
            vars.push((CLONE_THRESHOLD, "1".to_string()));
        }
        vars
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> InstanceAddress {
        InstanceAddress::new("db4", 3306)
    }

    fn gtid(s: &str) -> GtidSet {
        GtidSet::parse(s).unwrap()
    }

    const G: &str = "3e11fa47-71ca-11e1-9e33-c80aa9429562";

    #[test]
    fn test_ssl_mode_follows_cluster() {
        let mode = resolve_ssl_mode(&target(), SslMode::Auto, Some(SslMode::Required), true).unwrap();
        assert_eq!(mode, SslMode::Required);

        let mode = resolve_ssl_mode(&target(), SslMode::Auto, None, false).unwrap();
        assert_eq!(mode, SslMode::Disabled);
    }

    #[test]
    fn test_ssl_mode_mismatch() {
        let err = resolve_ssl_mode(&target(), SslMode::Disabled, Some(SslMode::Required), true)
            .unwrap_err();
        assert_eq!(err.error_code(), "INCOMPATIBLE_SSL_MODE");

        let err = resolve_ssl_mode(&target(), SslMode::Auto, Some(SslMode::Required), false)
            .unwrap_err();
        assert_eq!(err.error_code(), "INCOMPATIBLE_SSL_MODE");
    }

    #[test]
    fn test_recovery_method_auto() {
        let group = gtid(&format!("{}:1-10", G));
        let v = Version::new(8, 0, 30);

        let method =
            choose_recovery_method(&target(), RecoveryMethod::Auto, &gtid(&format!("{}:1-5", G)), &group, v, v)
                .unwrap();
        assert_eq!(method, ResolvedRecovery::Incremental);

        let errant = gtid("8a94f357-aab4-11df-86ab-c80aa9429562:1");
        let method = choose_recovery_method(&target(), RecoveryMethod::Auto, &errant, &group, v, v).unwrap();
        assert_eq!(method, ResolvedRecovery::Clone);

        let old = Version::new(8, 0, 16);
        let err = choose_recovery_method(&target(), RecoveryMethod::Auto, &errant, &group, old, v).unwrap_err();
        assert_eq!(err.error_code(), "RECOVERY_METHOD_UNAVAILABLE");
    }

    #[test]
    fn test_recovery_method_explicit() {
        let group = gtid(&format!("{}:1-10", G));
        let errant = gtid("8a94f357-aab4-11df-86ab-c80aa9429562:1");
        let v = Version::new(8, 0, 17);

        assert!(choose_recovery_method(&target(), RecoveryMethod::Incremental, &errant, &group, v, v).is_err());
        assert_eq!(
            choose_recovery_method(&target(), RecoveryMethod::Clone, &GtidSet::new(), &group, v, v).unwrap(),
            ResolvedRecovery::Clone
        );
        let old = Version::new(5, 7, 40);
        assert!(choose_recovery_method(&target(), RecoveryMethod::Clone, &GtidSet::new(), &group, old, v).is_err());
    }

    #[test]
    fn test_password_shape() {
        let a = generate_password();
        let b = generate_password();
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(a, b);
    }

    #[test]
    fn test_recovery_channel_syntax() {
        let old = recovery_channel_sql(Version::new(8, 0, 22), "mysql_innodb_cluster_7", Some("pw"));
        assert_eq!(
            old,
            "CHANGE MASTER TO MASTER_USER = 'mysql_innodb_cluster_7', MASTER_PASSWORD = 'pw' \
             FOR CHANNEL 'group_replication_recovery'"
        );
        let new = recovery_channel_sql(Version::new(8, 0, 23), "u", None);
        assert_eq!(
            new,
            "CHANGE REPLICATION SOURCE TO SOURCE_USER = 'u' FOR CHANNEL 'group_replication_recovery'"
        );
    }

    #[test]
    fn test_seed_lists() {
        assert_eq!(parse_seeds(" a:1, ,b:2 "), vec!["a:1", "b:2"]);
        assert_eq!(format_seeds(["a:1", "b:2", "a:1", ""]), "a:1,b:2");
        assert_eq!(format_seeds(Vec::<String>::new()), "");
    }

    #[test]
    fn test_auto_increment() {
        assert_eq!(auto_increment_settings(TopologyMode::SinglePrimary, 5, 12), (1, 2));
        assert_eq!(auto_increment_settings(TopologyMode::MultiPrimary, 3, 12), (7, 6));
        assert_eq!(auto_increment_settings(TopologyMode::MultiPrimary, 9, 18), (9, 1));
    }

    #[test]
    fn test_group_settings_assignments() {
        let settings = GroupSettings {
            group_name: G.to_string(),
            local_address: InstanceAddress::new("db4", 33061),
            seeds: "db1:33061".to_string(),
            mode: TopologyMode::MultiPrimary,
            ssl_mode: SslMode::Required,
            exit_state_action: Some("abort_server".to_string()),
            member_weight: None,
            auto_rejoin_tries: None,
            recovery: ResolvedRecovery::Clone,
        };
        let vars = settings.assignments();
        assert!(vars.contains(&(SINGLE_PRIMARY_MODE, "OFF".to_string())));
        assert!(vars.contains(&(EXIT_STATE_ACTION, "ABORT_SERVER".to_string())));
        assert_eq!(vars.last(), Some(&(CLONE_THRESHOLD, "1".to_string())));
    }
}
