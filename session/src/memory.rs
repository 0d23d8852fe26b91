//! In-memory simulation of a replication group and its metadata schema.
//!
//! One [`MemoryTopology`] holds every simulated server, the group view and
//! the metadata. Sessions interpret statements by prefix, which is enough
//! for the statements the control plane issues, and reject anything else
//! with a parse error. Faults are injected per server or per statement
//! prefix and stay active until cleared.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use clusteradmin_common::{
    limits, recovery_account_name, GtidSet, InstanceAddress, MemberState, ServerUuid,
    TopologyMode, Version,
};

use crate::config::ConnectionOptions;
use crate::connection::{ClusterSession, Connector};
use crate::error::{codes, SessionError, SessionResult};
use crate::instance::{Instance, MemberRow};
use crate::metadata::{ClusterRecord, ClusterType, InstanceRecord, MetadataStore, SourceInfo};
use crate::rowset::RowSet;

/// Group Replication plugin name.
pub const GR_PLUGIN: &str = "group_replication";
/// Clone plugin name.
pub const CLONE_PLUGIN: &str = "clone";

const GROUP_NAME: &str = "group_replication_group_name";
const LOCAL_ADDRESS: &str = "group_replication_local_address";
const GROUP_SEEDS: &str = "group_replication_group_seeds";
const BOOTSTRAP_GROUP: &str = "group_replication_bootstrap_group";
const SINGLE_PRIMARY_MODE: &str = "group_replication_single_primary_mode";
const SSL_MODE: &str = "group_replication_ssl_mode";
const CLONE_THRESHOLD: &str = "group_replication_clone_threshold";

/// Version that ships the clone plugin.
const CLONE_VERSION: Version = limits::MIN_CLONE_VERSION;

/// A fault injected into the simulation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Fault {
    /// Connections and calls to the server fail; peers see it UNREACHABLE.
    Unreachable { address: InstanceAddress },
    /// Statements starting with `prefix` fail, on one server or on all.
    FailStatement {
        #[serde(default)]
        address: Option<InstanceAddress>,
        prefix: String,
    },
    /// Metadata writes fail.
    FailMetadataWrite,
    /// A joining member stays RECOVERING for `polls` member-state reads.
    SlowRecovery { address: InstanceAddress, polls: u32 },
    /// Classification reads through this server are denied.
    AccessDenied { address: InstanceAddress },
}

/// One simulated server.
#[derive(Debug, Clone)]
pub struct SimServer {
    pub address: InstanceAddress,
    pub version: Version,
    pub server_uuid: ServerUuid,
    pub server_id: u32,
    pub sysvars: BTreeMap<String, String>,
    pub plugins: BTreeSet<String>,
    pub users: BTreeSet<String>,
    pub gtid_executed: GtidSet,
    pub binlog_do_db: String,
    pub binlog_ignore_db: String,
    /// Statements executed successfully, in order.
    pub statements: Vec<String>,
    recovery_user: Option<String>,
    gr_state: Option<MemberState>,
    recovery_polls: u32,
    sessions_opened: u32,
    sessions_closed: u32,
}

impl SimServer {
    /// A standalone server configured for Group Replication.
    pub fn new(address: InstanceAddress, version: Version, server_id: u32) -> Self {
        let mut sysvars = BTreeMap::new();
        for (name, value) in [
            ("binlog_format", "ROW"),
            ("gtid_mode", "ON"),
            ("enforce_gtid_consistency", "ON"),
            ("have_ssl", "YES"),
            ("require_secure_transport", "OFF"),
            ("auto_increment_increment", "1"),
            ("auto_increment_offset", "1"),
            ("super_read_only", "OFF"),
        ] {
            sysvars.insert(name.to_string(), value.to_string());
        }
        sysvars.insert("report_host".to_string(), address.host.clone());

        Self {
            address,
            version,
            server_uuid: ServerUuid::random(),
            server_id,
            sysvars,
            plugins: BTreeSet::new(),
            users: BTreeSet::new(),
            gtid_executed: GtidSet::new(),
            binlog_do_db: String::new(),
            binlog_ignore_db: String::new(),
            statements: Vec::new(),
            recovery_user: None,
            gr_state: None,
            recovery_polls: 0,
            sessions_opened: 0,
            sessions_closed: 0,
        }
    }

    pub fn with_sysvar(mut self, name: &str, value: &str) -> Self {
        self.sysvars.insert(name.to_string(), value.to_string());
        self
    }

    pub fn with_server_uuid(mut self, uuid: ServerUuid) -> Self {
        self.server_uuid = uuid;
        self
    }

    pub fn with_gtid_executed(mut self, gtid: GtidSet) -> Self {
        self.gtid_executed = gtid;
        self
    }

    pub fn with_binlog_filters(mut self, do_db: &str, ignore_db: &str) -> Self {
        self.binlog_do_db = do_db.to_string();
        self.binlog_ignore_db = ignore_db.to_string();
        self
    }

    fn install_gr_defaults(&mut self) {
        self.plugins.insert(GR_PLUGIN.to_string());
        for (name, value) in [
            (GROUP_NAME, ""),
            (LOCAL_ADDRESS, ""),
            (GROUP_SEEDS, ""),
            (BOOTSTRAP_GROUP, "OFF"),
            (SINGLE_PRIMARY_MODE, "ON"),
            (SSL_MODE, "DISABLED"),
            (CLONE_THRESHOLD, "9223372036854775807"),
            ("group_replication_start_on_boot", "ON"),
            ("group_replication_exit_state_action", "READ_ONLY"),
            ("group_replication_member_weight", "50"),
            ("group_replication_autorejoin_tries", "3"),
        ] {
            self.sysvars
                .entry(name.to_string())
                .or_insert_with(|| value.to_string());
        }
    }

    fn sysvar(&self, name: &str) -> &str {
        self.sysvars.get(name).map(String::as_str).unwrap_or("")
    }
}

#[derive(Debug, Clone)]
struct GroupView {
    name: Option<String>,
    members: Vec<InstanceAddress>,
    primary: Option<InstanceAddress>,
    mode: TopologyMode,
}

impl Default for GroupView {
    fn default() -> Self {
        Self {
            name: None,
            members: Vec::new(),
            primary: None,
            mode: TopologyMode::SinglePrimary,
        }
    }
}

#[derive(Debug, Clone)]
struct MetadataSchema {
    version: Version,
    cluster: Option<ClusterRecord>,
    instances: Vec<InstanceRecord>,
}

#[derive(Debug, Default)]
struct TopologyState {
    servers: BTreeMap<InstanceAddress, SimServer>,
    group: GroupView,
    metadata: Option<MetadataSchema>,
    faults: Vec<Fault>,
}

fn unknown_host(address: &InstanceAddress) -> SessionError {
    SessionError::Connection {
        address: address.to_string(),
        reason: "Unknown MySQL server host".to_string(),
    }
}

fn parse_error(sql: &str) -> SessionError {
    SessionError::sql(
        codes::ER_PARSE_ERROR,
        format!("You have an error in your SQL syntax near '{}'", sql),
    )
}

fn gr_error(message: impl Into<String>) -> SessionError {
    SessionError::sql(codes::ER_GROUP_REPLICATION_CONFIGURATION, message)
}

fn strip_prefix_ci<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    match s.get(..prefix.len()) {
        Some(head) if head.eq_ignore_ascii_case(prefix) => Some(&s[prefix.len()..]),
        _ => None,
    }
}

fn quoted_values(s: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut rest = s;
    while let Some(start) = rest.find('\'') {
        let tail = &rest[start + 1..];
        let Some(end) = tail.find('\'') else { break };
        out.push(tail[..end].to_string());
        rest = &tail[end + 1..];
    }
    out
}

fn unquote(value: &str) -> String {
    let value = value.trim();
    value
        .strip_prefix('\'')
        .and_then(|v| v.strip_suffix('\''))
        .unwrap_or(value)
        .replace("\\'", "'")
}

impl TopologyState {
    fn server(&self, address: &InstanceAddress) -> SessionResult<&SimServer> {
        self.servers.get(address).ok_or_else(|| unknown_host(address))
    }

    fn server_mut(&mut self, address: &InstanceAddress) -> SessionResult<&mut SimServer> {
        self.servers
            .get_mut(address)
            .ok_or_else(|| unknown_host(address))
    }

    fn is_unreachable(&self, address: &InstanceAddress) -> bool {
        self.faults
            .iter()
            .any(|f| matches!(f, Fault::Unreachable { address: a } if a == address))
    }

    fn check_reachable(&self, address: &InstanceAddress) -> SessionResult<()> {
        self.server(address)?;
        if self.is_unreachable(address) {
            return Err(SessionError::Connection {
                address: address.to_string(),
                reason: "No route to host".to_string(),
            });
        }
        Ok(())
    }

    fn statement_fault(&self, address: &InstanceAddress, sql: &str) -> Option<SessionError> {
        let upper = sql.trim_start().to_ascii_uppercase();
        self.faults.iter().find_map(|f| match f {
            Fault::FailStatement { address: a, prefix }
                if a.as_ref().map_or(true, |a| a == address)
                    && upper.starts_with(&prefix.to_ascii_uppercase()) =>
            {
                Some(SessionError::sql(
                    codes::ER_INJECTED,
                    format!("Injected failure for statement '{}'", prefix),
                ))
            }
            _ => None,
        })
    }

    fn access_denied(&self, address: &InstanceAddress) -> bool {
        self.faults
            .iter()
            .any(|f| matches!(f, Fault::AccessDenied { address: a } if a == address))
    }

    fn recovery_delay(&self, address: &InstanceAddress) -> u32 {
        self.faults
            .iter()
            .find_map(|f| match f {
                Fault::SlowRecovery { address: a, polls } if a == address => Some(*polls),
                _ => None,
            })
            .unwrap_or(0)
    }

    fn check_metadata_write(&self) -> SessionResult<()> {
        if self.faults.contains(&Fault::FailMetadataWrite) {
            return Err(SessionError::sql(
                codes::ER_INJECTED,
                "Injected failure writing the metadata schema",
            ));
        }
        Ok(())
    }

    fn state_of(&self, address: &InstanceAddress) -> Option<MemberState> {
        self.servers.get(address).and_then(|s| s.gr_state)
    }

    fn observed_state(&self, viewer: &InstanceAddress, member: &InstanceAddress) -> MemberState {
        if member != viewer && self.is_unreachable(member) {
            MemberState::Unreachable
        } else {
            self.state_of(member).unwrap_or(MemberState::Offline)
        }
    }

    fn online_members(&self) -> impl Iterator<Item = &SimServer> {
        self.group
            .members
            .iter()
            .filter(move |m| !self.is_unreachable(m))
            .filter_map(move |m| self.servers.get(m))
            .filter(|s| s.gr_state == Some(MemberState::Online))
    }

    fn group_gtid(&self) -> GtidSet {
        self.online_members()
            .fold(GtidSet::new(), |acc, s| acc.union(&s.gtid_executed))
    }

    fn has_quorum(&self) -> bool {
        let reachable = self
            .group
            .members
            .iter()
            .filter(|m| !self.is_unreachable(m))
            .filter(|m| self.state_of(m).map_or(false, |s| s.is_active()))
            .count();
        reachable * 2 > self.group.members.len()
    }

    /// Move RECOVERING members forward; called on every member-state read.
    fn advance_recovery(&mut self) {
        let group_gtid = self.group_gtid();
        let group_users: BTreeSet<String> = self
            .online_members()
            .flat_map(|s| s.users.iter().cloned())
            .collect();

        for address in self.group.members.clone() {
            let Some(server) = self.servers.get_mut(&address) else {
                continue;
            };
            if server.gr_state != Some(MemberState::Recovering) {
                continue;
            }
            if server.recovery_polls > 0 {
                server.recovery_polls -= 1;
                continue;
            }

            let cloned = server.sysvar(CLONE_THRESHOLD) == "1";
            server.gtid_executed = if cloned {
                group_gtid.clone()
            } else {
                server.gtid_executed.union(&group_gtid)
            };
            server.users.extend(group_users.iter().cloned());
            server.gr_state = Some(MemberState::Online);
            info!(address = %address, cloned, "Simulated member finished recovery");
        }
    }

    fn member_rows(&mut self, viewer: &InstanceAddress) -> RowSet {
        self.advance_recovery();

        let mut rows = RowSet::new([
            "MEMBER_ID",
            "MEMBER_HOST",
            "MEMBER_PORT",
            "MEMBER_STATE",
            "MEMBER_ROLE",
        ]);

        let row = |server: &SimServer, state: MemberState, role: &str| {
            [
                Some(server.server_uuid.to_string()),
                Some(server.address.host.clone()),
                Some(server.address.port.to_string()),
                Some(state.to_string()),
                Some(role.to_string()),
            ]
        };

        if self.group.members.contains(viewer) {
            for member in &self.group.members {
                let Some(server) = self.servers.get(member) else {
                    continue;
                };
                let state = self.observed_state(viewer, member);
                let primary = match self.group.mode {
                    TopologyMode::MultiPrimary => state == MemberState::Online,
                    TopologyMode::SinglePrimary => self.group.primary.as_ref() == Some(member),
                };
                rows.push(row(server, state, if primary { "PRIMARY" } else { "SECONDARY" }));
            }
        } else if let Some(server) = self.servers.get(viewer) {
            if let Some(state) = server.gr_state {
                rows.push(row(server, state, ""));
            } else if server.plugins.contains(GR_PLUGIN) {
                rows.push(row(server, MemberState::Offline, ""));
            }
        }

        rows
    }

    /// Servers a user-account change applies to: the whole group when it is
    /// made on an ONLINE member, otherwise just the server itself.
    fn replication_targets(&self, address: &InstanceAddress) -> Vec<InstanceAddress> {
        if self.group.members.contains(address) && self.state_of(address) == Some(MemberState::Online) {
            self.group.members.clone()
        } else {
            vec![address.clone()]
        }
    }

    fn variable(&self, address: &InstanceAddress, name: &str) -> SessionResult<Option<String>> {
        let server = self.server(address)?;
        let value = match name {
            "server_uuid" => server.server_uuid.to_string(),
            "server_id" => server.server_id.to_string(),
            "gtid_executed" => server.gtid_executed.to_string(),
            "version" => server.version.to_string(),
            _ => server.sysvars.get(name).cloned().ok_or_else(|| {
                SessionError::sql(
                    codes::ER_UNKNOWN_SYSTEM_VARIABLE,
                    format!("Unknown system variable '{}'", name),
                )
            })?,
        };
        Ok(Some(value))
    }

    fn set_variable(&mut self, address: &InstanceAddress, name: &str, value: &str) -> SessionResult<()> {
        if matches!(name, "server_uuid" | "server_id" | "gtid_executed" | "version") {
            return Err(SessionError::sql(
                1238,
                format!("Variable '{}' is a read only variable", name),
            ));
        }

        let server = self.server_mut(address)?;
        match server.sysvars.get_mut(name) {
            Some(slot) => {
                *slot = value.to_string();
                Ok(())
            }
            None => Err(SessionError::sql(
                codes::ER_UNKNOWN_SYSTEM_VARIABLE,
                format!("Unknown system variable '{}'", name),
            )),
        }
    }

    fn start_group_replication(&mut self, address: &InstanceAddress) -> SessionResult<()> {
        let server = self.server(address)?;
        if !server.plugins.contains(GR_PLUGIN) {
            return Err(gr_error("The group_replication plugin is not installed"));
        }
        if server.gr_state.map_or(false, |s| s.is_active()) {
            return Err(SessionError::sql(
                codes::ER_GROUP_REPLICATION_RUNNING,
                "Group Replication is already running",
            ));
        }

        let group_name = server.sysvar(GROUP_NAME).to_string();
        if group_name.is_empty() {
            return Err(gr_error("group_replication_group_name is not set"));
        }
        if server.sysvar(LOCAL_ADDRESS).is_empty() {
            return Err(gr_error("group_replication_local_address is not set"));
        }
        let mode = if server.sysvar(SINGLE_PRIMARY_MODE).eq_ignore_ascii_case("OFF") {
            TopologyMode::MultiPrimary
        } else {
            TopologyMode::SinglePrimary
        };

        if server.sysvar(BOOTSTRAP_GROUP).eq_ignore_ascii_case("ON") {
            if self.online_members().next().is_some() {
                return Err(gr_error(
                    "Bootstrapping would create a second group while one is running",
                ));
            }

            self.group = GroupView {
                name: Some(group_name),
                members: vec![address.clone()],
                primary: Some(address.clone()),
                mode,
            };
            let server = self.server_mut(address)?;
            server.gr_state = Some(MemberState::Online);
            server.sysvars.insert("super_read_only".into(), "OFF".into());
            info!(address = %address, "Simulated group bootstrapped");
            return Ok(());
        }

        let seeds: Vec<String> = server
            .sysvar(GROUP_SEEDS)
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let donor = self
            .online_members()
            .find(|m| seeds.iter().any(|s| s == m.sysvar(LOCAL_ADDRESS)))
            .map(|m| m.address.clone())
            .ok_or_else(|| gr_error("Unable to contact any of the group seeds"))?;

        if self.group.name.as_deref() != Some(group_name.as_str()) {
            return Err(gr_error("The group name does not match the group being joined"));
        }
        if self.group.mode != mode {
            return Err(gr_error("The member topology mode does not match the group"));
        }
        if !self.has_quorum() {
            return Err(gr_error("The group does not have quorum"));
        }

        let server = self.server(address)?;
        let cloned = server.sysvar(CLONE_THRESHOLD) == "1";
        if !cloned && !server.gtid_executed.is_subset_of(&self.group_gtid()) {
            return Err(gr_error(
                "This member has more executed transactions than those present in the group",
            ));
        }

        let credentials_valid = match &server.recovery_user {
            Some(user) => self.server(&donor)?.users.contains(user),
            None => false,
        };
        let polls = self.recovery_delay(address);
        let single_primary = mode == TopologyMode::SinglePrimary;

        let server = self.server_mut(address)?;
        if !credentials_valid {
            // Recovery cannot authenticate against the donor: the member
            // drops out of the view and reports ERROR locally.
            server.gr_state = Some(MemberState::Error);
            info!(address = %address, donor = %donor, "Simulated recovery failed to authenticate");
            return Ok(());
        }

        server.gr_state = Some(MemberState::Recovering);
        server.recovery_polls = polls;
        if single_primary {
            server.sysvars.insert("super_read_only".into(), "ON".into());
        }
        self.group.members.push(address.clone());
        info!(address = %address, donor = %donor, "Simulated member joined");
        Ok(())
    }

    fn stop_group_replication(&mut self, address: &InstanceAddress) -> SessionResult<()> {
        let server = self.server_mut(address)?;
        server.gr_state = None;
        server.sysvars.insert("super_read_only".into(), "ON".into());

        self.group.members.retain(|m| m != address);
        if self.group.primary.as_ref() == Some(address) {
            let next = self.online_members().next().map(|s| s.address.clone());
            self.group.primary = next;
        }
        if self.group.members.is_empty() {
            self.group = GroupView::default();
        }
        info!(address = %address, "Simulated member left the group");
        Ok(())
    }

    fn execute(&mut self, address: &InstanceAddress, sql: &str) -> SessionResult<()> {
        self.check_reachable(address)?;
        if let Some(err) = self.statement_fault(address, sql) {
            return Err(err);
        }

        let trimmed = sql.trim();
        let upper = trimmed.to_ascii_uppercase();

        if let Some(rest) =
            strip_prefix_ci(trimmed, "SET GLOBAL ").or_else(|| strip_prefix_ci(trimmed, "SET PERSIST "))
        {
            let (name, value) = rest.split_once('=').ok_or_else(|| parse_error(sql))?;
            self.set_variable(address, &name.trim().to_ascii_lowercase(), &unquote(value))?;
        } else if upper.starts_with("CREATE USER") {
            let user = quoted_values(trimmed).into_iter().next().ok_or_else(|| parse_error(sql))?;
            let exists = self.server(address)?.users.contains(&user);
            if exists && !upper.contains("IF NOT EXISTS") {
                return Err(SessionError::sql(
                    codes::ER_CANNOT_USER,
                    format!("Operation CREATE USER failed for '{}'@'%'", user),
                ));
            }
            for target in self.replication_targets(address) {
                self.server_mut(&target)?.users.insert(user.clone());
            }
        } else if upper.starts_with("DROP USER") {
            let user = quoted_values(trimmed).into_iter().next().ok_or_else(|| parse_error(sql))?;
            let exists = self.server(address)?.users.contains(&user);
            if !exists && !upper.contains("IF EXISTS") {
                return Err(SessionError::sql(
                    codes::ER_CANNOT_USER,
                    format!("Operation DROP USER failed for '{}'@'%'", user),
                ));
            }
            for target in self.replication_targets(address) {
                self.server_mut(&target)?.users.remove(&user);
            }
        } else if upper.starts_with("GRANT") {
            let to = upper.find(" TO ").ok_or_else(|| parse_error(sql))?;
            let user = quoted_values(&trimmed[to..]).into_iter().next().ok_or_else(|| parse_error(sql))?;
            if !self.server(address)?.users.contains(&user) {
                return Err(SessionError::sql(
                    1410,
                    "You are not allowed to create a user with GRANT",
                ));
            }
        } else if upper.starts_with("CHANGE MASTER TO") || upper.starts_with("CHANGE REPLICATION SOURCE TO") {
            let at = upper.find("_USER").ok_or_else(|| parse_error(sql))?;
            let user = quoted_values(&trimmed[at..]).into_iter().next().ok_or_else(|| parse_error(sql))?;
            self.server_mut(address)?.recovery_user = Some(user);
        } else if upper.starts_with("INSTALL PLUGIN") {
            let name = trimmed["INSTALL PLUGIN".len()..]
                .split_whitespace()
                .next()
                .ok_or_else(|| parse_error(sql))?
                .to_ascii_lowercase();
            let server = self.server_mut(address)?;
            if server.plugins.contains(&name) {
                return Err(SessionError::sql(
                    codes::ER_PLUGIN_INSTALLED,
                    format!("Plugin '{}' is already installed", name),
                ));
            }
            if name == CLONE_PLUGIN && server.version < CLONE_VERSION {
                return Err(SessionError::sql(
                    codes::ER_CANT_OPEN_LIBRARY,
                    "Can't open shared library 'mysql_clone.so'",
                ));
            }
            if name == GR_PLUGIN {
                server.install_gr_defaults();
            } else {
                server.plugins.insert(name);
            }
        } else if upper.starts_with("START GROUP_REPLICATION") {
            self.start_group_replication(address)?;
        } else if upper.starts_with("STOP GROUP_REPLICATION") {
            self.stop_group_replication(address)?;
        } else {
            return Err(parse_error(sql));
        }

        debug!(address = %address, statement = %trimmed, "Simulated statement executed");
        self.server_mut(address)?.statements.push(trimmed.to_string());
        Ok(())
    }

    fn query(&mut self, address: &InstanceAddress, sql: &str) -> SessionResult<RowSet> {
        self.check_reachable(address)?;
        if let Some(err) = self.statement_fault(address, sql) {
            return Err(err);
        }

        let trimmed = sql.trim();
        let upper = trimmed.to_ascii_uppercase();

        if let Some(rest) = upper.strip_prefix("SELECT @@") {
            let name = rest
                .trim_start_matches("GLOBAL.")
                .trim()
                .to_ascii_lowercase();
            let value = self.variable(address, &name)?;
            return Ok(RowSet::scalar(format!("@@{}", name), value));
        }

        if upper.contains("REPLICATION_GROUP_MEMBERS") {
            return Ok(self.member_rows(address));
        }

        if upper.contains("INFORMATION_SCHEMA.PLUGINS") {
            let name = quoted_values(trimmed).pop().ok_or_else(|| parse_error(sql))?;
            let mut rows = RowSet::new(["PLUGIN_STATUS"]);
            if self.server(address)?.plugins.contains(&name.to_ascii_lowercase()) {
                rows.push([Some("ACTIVE".to_string())]);
            }
            return Ok(rows);
        }

        if upper.starts_with("SHOW MASTER STATUS") || upper.starts_with("SHOW BINARY LOG STATUS") {
            let server = self.server(address)?;
            let mut rows = RowSet::new([
                "File",
                "Position",
                "Binlog_Do_DB",
                "Binlog_Ignore_DB",
                "Executed_Gtid_Set",
            ]);
            rows.push([
                Some("binlog.000001".to_string()),
                Some("157".to_string()),
                Some(server.binlog_do_db.clone()),
                Some(server.binlog_ignore_db.clone()),
                Some(server.gtid_executed.to_string()),
            ]);
            return Ok(rows);
        }

        if upper.contains("MYSQL.SLAVE_MASTER_INFO") {
            let user = self.server(address)?.recovery_user.clone();
            return Ok(RowSet::scalar("user_name", user));
        }

        if upper.contains("MYSQL.USER") {
            let name = quoted_values(trimmed).pop().ok_or_else(|| parse_error(sql))?;
            let count = usize::from(self.server(address)?.users.contains(&name));
            return Ok(RowSet::scalar("COUNT(*)", Some(count.to_string())));
        }

        Err(parse_error(sql))
    }
}

/// Shared handle to the simulated servers, group and metadata.
#[derive(Clone, Default)]
pub struct MemoryTopology {
    state: Arc<Mutex<TopologyState>>,
}

impl MemoryTopology {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add (or replace) a server.
    pub fn add_server(&self, server: SimServer) {
        self.state.lock().servers.insert(server.address.clone(), server);
    }

    /// Put existing servers into a running group with a matching metadata
    /// schema, as if the cluster had been created and grown earlier.
    /// Returns the group name.
    pub fn seed_group(
        &self,
        cluster_name: &str,
        members: &[InstanceAddress],
        mode: TopologyMode,
    ) -> SessionResult<String> {
        let mut state = self.state.lock();
        let group_name = ServerUuid::random().to_string();

        let mut locals = Vec::with_capacity(members.len());
        let mut accounts = Vec::with_capacity(members.len());
        for address in members {
            let local = address.default_local_address().ok_or_else(|| {
                gr_error(format!("Cannot derive a local address for '{}'", address))
            })?;
            locals.push((address.clone(), local));
            accounts.push(recovery_account_name(state.server(address)?.server_id));
        }

        let mut gtid = GtidSet::new();
        gtid.insert_interval(&group_name, 1, 10);

        let mut records = Vec::with_capacity(members.len());
        for (index, (address, local)) in locals.iter().enumerate() {
            let seeds = locals
                .iter()
                .filter(|(a, _)| a != address)
                .map(|(_, l)| l.to_string())
                .collect::<Vec<_>>()
                .join(",");

            let server = state.server_mut(address)?;
            server.install_gr_defaults();
            let ssl = if server.sysvar("have_ssl") == "YES" { "REQUIRED" } else { "DISABLED" };
            let read_only = mode == TopologyMode::SinglePrimary && index > 0;
            for (name, value) in [
                (GROUP_NAME, group_name.clone()),
                (LOCAL_ADDRESS, local.to_string()),
                (GROUP_SEEDS, seeds),
                (SSL_MODE, ssl.to_string()),
                (
                    SINGLE_PRIMARY_MODE,
                    if mode == TopologyMode::SinglePrimary { "ON" } else { "OFF" }.to_string(),
                ),
                ("super_read_only", if read_only { "ON" } else { "OFF" }.to_string()),
            ] {
                server.sysvars.insert(name.to_string(), value);
            }
            server.users.extend(accounts.iter().cloned());
            server.recovery_user = Some(recovery_account_name(server.server_id));
            server.gtid_executed = server.gtid_executed.union(&gtid);
            server.gr_state = Some(MemberState::Online);

            let mut record = InstanceRecord::new(address.clone(), server.server_uuid, server.server_id);
            record.local_address = Some(local.clone());
            records.push(record);
        }

        state.group = GroupView {
            name: Some(group_name.clone()),
            members: members.to_vec(),
            primary: members.first().cloned(),
            mode,
        };
        state.metadata = Some(MetadataSchema {
            version: limits::CURRENT_METADATA_VERSION,
            cluster: Some(ClusterRecord {
                name: cluster_name.to_string(),
                group_name: group_name.clone(),
                cluster_type: ClusterType::GroupReplication,
                topology: mode,
                primary: None,
            }),
            instances: records,
        });

        info!(cluster = %cluster_name, members = members.len(), "Simulated group seeded");
        Ok(group_name)
    }

    /// Install (or change the version of) the metadata schema.
    pub fn set_metadata_version(&self, version: Version) {
        let mut state = self.state.lock();
        match state.metadata.as_mut() {
            Some(schema) => schema.version = version,
            None => {
                state.metadata = Some(MetadataSchema {
                    version,
                    cluster: None,
                    instances: Vec::new(),
                })
            }
        }
    }

    pub fn inject_fault(&self, fault: Fault) {
        info!(fault = ?fault, "Fault injected");
        self.state.lock().faults.push(fault);
    }

    /// Remove a fault. Returns whether it was active.
    pub fn clear_fault(&self, fault: &Fault) -> bool {
        let mut state = self.state.lock();
        let before = state.faults.len();
        state.faults.retain(|f| f != fault);
        before != state.faults.len()
    }

    pub fn clear_faults(&self) {
        self.state.lock().faults.clear();
    }

    /// Open a cluster session through `source`, with a memory connector.
    pub async fn cluster_session(
        &self,
        source: &InstanceAddress,
        credentials: ConnectionOptions,
    ) -> SessionResult<ClusterSession> {
        let connector: Arc<dyn Connector> = Arc::new(MemoryConnector::new(self.clone()));
        let instance = connector
            .connect(&credentials.for_address(source.clone()))
            .await?;
        let metadata: Arc<dyn MetadataStore> =
            Arc::new(MemoryMetadata::new(self.clone(), source.clone()));
        Ok(ClusterSession::new(instance, metadata, connector, credentials))
    }

    /// Raw Group Replication state of a server.
    pub fn member_state(&self, address: &InstanceAddress) -> Option<MemberState> {
        self.state.lock().state_of(address)
    }

    pub fn group_members(&self) -> Vec<InstanceAddress> {
        self.state.lock().group.members.clone()
    }

    pub fn primary(&self) -> Option<InstanceAddress> {
        self.state.lock().group.primary.clone()
    }

    pub fn has_user(&self, address: &InstanceAddress, user: &str) -> bool {
        self.state
            .lock()
            .servers
            .get(address)
            .map_or(false, |s| s.users.contains(user))
    }

    pub fn has_plugin(&self, address: &InstanceAddress, plugin: &str) -> bool {
        self.state
            .lock()
            .servers
            .get(address)
            .map_or(false, |s| s.plugins.contains(plugin))
    }

    pub fn sysvar(&self, address: &InstanceAddress, name: &str) -> Option<String> {
        self.state
            .lock()
            .servers
            .get(address)
            .and_then(|s| s.sysvars.get(name).cloned())
    }

    pub fn set_sysvar(&self, address: &InstanceAddress, name: &str, value: &str) {
        if let Some(server) = self.state.lock().servers.get_mut(address) {
            server.sysvars.insert(name.to_string(), value.to_string());
        }
    }

    pub fn set_gtid_executed(&self, address: &InstanceAddress, gtid: GtidSet) {
        if let Some(server) = self.state.lock().servers.get_mut(address) {
            server.gtid_executed = gtid;
        }
    }

    pub fn gtid_executed(&self, address: &InstanceAddress) -> Option<GtidSet> {
        self.state
            .lock()
            .servers
            .get(address)
            .map(|s| s.gtid_executed.clone())
    }

    /// Statements executed on a server, in order.
    pub fn statements(&self, address: &InstanceAddress) -> Vec<String> {
        self.state
            .lock()
            .servers
            .get(address)
            .map(|s| s.statements.clone())
            .unwrap_or_default()
    }

    /// Sessions opened to a server and not yet closed.
    pub fn open_sessions(&self, address: &InstanceAddress) -> u32 {
        self.state
            .lock()
            .servers
            .get(address)
            .map_or(0, |s| s.sessions_opened - s.sessions_closed)
    }

    pub fn metadata_instances(&self) -> Vec<InstanceRecord> {
        self.state
            .lock()
            .metadata
            .as_ref()
            .map(|m| m.instances.clone())
            .unwrap_or_default()
    }

    pub fn cluster(&self) -> Option<ClusterRecord> {
        self.state
            .lock()
            .metadata
            .as_ref()
            .and_then(|m| m.cluster.clone())
    }

    pub fn server_addresses(&self) -> Vec<InstanceAddress> {
        self.state.lock().servers.keys().cloned().collect()
    }
}

/// A session to a simulated server.
pub struct MemoryInstance {
    topology: MemoryTopology,
    address: InstanceAddress,
    version: Version,
    server_uuid: ServerUuid,
    server_id: u32,
    open: AtomicBool,
}

impl MemoryInstance {
    fn ensure_open(&self) -> SessionResult<()> {
        if self.open.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(SessionError::Closed)
        }
    }
}

#[async_trait]
impl Instance for MemoryInstance {
    fn address(&self) -> &InstanceAddress {
        &self.address
    }

    fn version(&self) -> Version {
        self.version
    }

    fn server_uuid(&self) -> ServerUuid {
        self.server_uuid
    }

    fn server_id(&self) -> u32 {
        self.server_id
    }

    async fn execute(&self, sql: &str) -> SessionResult<()> {
        self.ensure_open()?;
        self.topology.state.lock().execute(&self.address, sql)
    }

    async fn query(&self, sql: &str) -> SessionResult<RowSet> {
        self.ensure_open()?;
        self.topology.state.lock().query(&self.address, sql)
    }

    async fn close(&self) -> SessionResult<()> {
        if self.open.swap(false, Ordering::SeqCst) {
            if let Some(server) = self.topology.state.lock().servers.get_mut(&self.address) {
                server.sessions_closed += 1;
            }
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

/// Opens sessions to simulated servers.
#[derive(Clone)]
pub struct MemoryConnector {
    topology: MemoryTopology,
}

impl MemoryConnector {
    pub fn new(topology: MemoryTopology) -> Self {
        Self { topology }
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, options: &ConnectionOptions) -> SessionResult<Arc<dyn Instance>> {
        let mut state = self.topology.state.lock();
        state.check_reachable(&options.address)?;

        let server = state.server_mut(&options.address)?;
        server.sessions_opened += 1;

        Ok(Arc::new(MemoryInstance {
            topology: self.topology.clone(),
            address: server.address.clone(),
            version: server.version,
            server_uuid: server.server_uuid,
            server_id: server.server_id,
            open: AtomicBool::new(true),
        }))
    }
}

/// Metadata schema access through one simulated server.
#[derive(Clone)]
pub struct MemoryMetadata {
    topology: MemoryTopology,
    source: InstanceAddress,
}

impl MemoryMetadata {
    pub fn new(topology: MemoryTopology, source: InstanceAddress) -> Self {
        Self { topology, source }
    }

    fn schema_missing() -> SessionError {
        SessionError::sql(
            1146,
            "Table 'mysql_innodb_cluster_metadata.instances' doesn't exist",
        )
    }
}

#[async_trait]
impl MetadataStore for MemoryMetadata {
    async fn read_schema_version(&self) -> SessionResult<Option<Version>> {
        let state = self.topology.state.lock();
        state.check_reachable(&self.source)?;
        Ok(state.metadata.as_ref().map(|m| m.version))
    }

    async fn read_source_info(&self) -> SessionResult<SourceInfo> {
        let state = self.topology.state.lock();
        state.check_reachable(&self.source)?;
        if state.access_denied(&self.source) {
            return Err(SessionError::AccessDenied(format!(
                "SELECT command denied to user on '{}'",
                self.source
            )));
        }

        let server = state.server(&self.source)?;
        let gr_active = state.group.members.contains(&self.source)
            && server.gr_state.map_or(false, |s| s.is_active());
        let registered = state.metadata.as_ref().map_or(false, |m| {
            m.instances
                .iter()
                .any(|r| r.server_uuid == server.server_uuid || r.address == self.source)
        });
        let cluster = state.metadata.as_ref().and_then(|m| m.cluster.as_ref());

        Ok(SourceInfo {
            address: self.source.clone(),
            server_uuid: server.server_uuid,
            gr_active,
            registered,
            cluster_type: cluster.map(|c| c.cluster_type),
            is_primary: cluster.and_then(|c| c.primary.as_ref()) == Some(&self.source),
        })
    }

    async fn read_member_states(&self) -> SessionResult<Vec<MemberRow>> {
        let rows = {
            let mut state = self.topology.state.lock();
            state.check_reachable(&self.source)?;
            state.member_rows(&self.source)
        };
        MemberRow::from_rowset(&rows)
    }

    async fn read_cluster(&self) -> SessionResult<Option<ClusterRecord>> {
        let state = self.topology.state.lock();
        state.check_reachable(&self.source)?;
        Ok(state.metadata.as_ref().and_then(|m| m.cluster.clone()))
    }

    async fn read_instances(&self) -> SessionResult<Vec<InstanceRecord>> {
        let state = self.topology.state.lock();
        state.check_reachable(&self.source)?;
        Ok(state
            .metadata
            .as_ref()
            .map(|m| m.instances.clone())
            .unwrap_or_default())
    }

    async fn write_instance_record(&self, record: &InstanceRecord) -> SessionResult<()> {
        let mut state = self.topology.state.lock();
        state.check_reachable(&self.source)?;
        state.check_metadata_write()?;

        let schema = state.metadata.as_mut().ok_or_else(Self::schema_missing)?;
        schema.instances.retain(|r| r.address != record.address);
        schema.instances.push(record.clone());
        debug!(address = %record.address, "Simulated metadata row written");
        Ok(())
    }

    async fn remove_instance_record(&self, address: &InstanceAddress) -> SessionResult<()> {
        let mut state = self.topology.state.lock();
        state.check_reachable(&self.source)?;
        state.check_metadata_write()?;

        let schema = state.metadata.as_mut().ok_or_else(Self::schema_missing)?;
        schema.instances.retain(|r| &r.address != address);
        debug!(address = %address, "Simulated metadata row removed");
        Ok(())
    }

    async fn create_cluster(&self, cluster: &ClusterRecord) -> SessionResult<()> {
        let mut state = self.topology.state.lock();
        state.check_reachable(&self.source)?;
        state.check_metadata_write()?;

        let schema = state.metadata.get_or_insert_with(|| MetadataSchema {
            version: limits::CURRENT_METADATA_VERSION,
            cluster: None,
            instances: Vec::new(),
        });
        schema.cluster = Some(cluster.clone());
        Ok(())
    }

    async fn drop_cluster(&self, name: &str) -> SessionResult<()> {
        let mut state = self.topology.state.lock();
        state.check_reachable(&self.source)?;
        state.check_metadata_write()?;

        if let Some(schema) = state.metadata.as_mut() {
            if schema.cluster.as_ref().map_or(false, |c| c.name == name) {
                schema.cluster = None;
                schema.instances.clear();
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    fn addr(port: u16) -> InstanceAddress {
        InstanceAddress::new("127.0.0.1", port)
    }

    fn topology_with(ports: &[u16]) -> MemoryTopology {
        let topology = MemoryTopology::new();
        for (i, port) in ports.iter().enumerate() {
            topology.add_server(SimServer::new(addr(*port), Version::new(8, 0, 30), 100 + i as u32));
        }
        topology
    }

    async fn session(topology: &MemoryTopology, port: u16) -> Arc<dyn Instance> {
        MemoryConnector::new(topology.clone())
            .connect(&ConnectionOptions::default().for_address(addr(port)))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_seeded_group_view() {
        let topology = topology_with(&[3306, 3307, 3308]);
        topology
            .seed_group("prod", &[addr(3306), addr(3307), addr(3308)], TopologyMode::SinglePrimary)
            .unwrap();

        let primary = session(&topology, 3306).await;
        let members = primary.group_members().await.unwrap();
        assert_eq!(members.len(), 3);
        assert!(members.iter().all(|m| m.state == MemberState::Online));
        assert!(primary.is_member_of_group().await.unwrap());
        assert_eq!(topology.cluster().unwrap().name, "prod");
        assert_eq!(topology.metadata_instances().len(), 3);
    }

    #[tokio::test]
    async fn test_unreachable_member_seen_by_peers() {
        let topology = topology_with(&[3306, 3307, 3308]);
        topology
            .seed_group("prod", &[addr(3306), addr(3307), addr(3308)], TopologyMode::SinglePrimary)
            .unwrap();
        topology.inject_fault(Fault::Unreachable { address: addr(3308) });

        let primary = session(&topology, 3306).await;
        let members = primary.group_members().await.unwrap();
        let third = members.iter().find(|m| m.address == addr(3308)).unwrap();
        assert_eq!(third.state, MemberState::Unreachable);

        let connector = MemoryConnector::new(topology.clone());
        let result = connector
            .connect(&ConnectionOptions::default().for_address(addr(3308)))
            .await;
        assert!(matches!(result, Err(SessionError::Connection { .. })));
    }

    #[tokio::test]
    async fn test_sysvars_require_plugin() {
        let topology = topology_with(&[3306]);
        let instance = session(&topology, 3306).await;

        assert_eq!(instance.get_sysvar("gtid_mode").await.unwrap().as_deref(), Some("ON"));
        assert_err!(instance.set_sysvar(GROUP_SEEDS, "x:1").await);
        assert!(!instance.has_capability(GR_PLUGIN).await.unwrap());

        assert_ok!(instance.install_capability(GR_PLUGIN).await);
        assert!(instance.has_capability(GR_PLUGIN).await.unwrap());
        assert_ok!(instance.set_sysvar(GROUP_SEEDS, "127.0.0.1:33071").await);
        assert_eq!(
            topology.sysvar(&addr(3306), GROUP_SEEDS).as_deref(),
            Some("127.0.0.1:33071")
        );
    }

    #[tokio::test]
    async fn test_bootstrap_and_join_through_sql() {
        let topology = topology_with(&[3306, 3307]);
        let seed = session(&topology, 3306).await;
        let joiner = session(&topology, 3307).await;

        for instance in [&seed, &joiner] {
            instance.install_capability(GR_PLUGIN).await.unwrap();
            instance.set_sysvar(GROUP_NAME, "aaaaaaaa-aaaa-aaaa-aaaa-aaaaaaaaaaaa").await.unwrap();
        }
        seed.set_sysvar(LOCAL_ADDRESS, "127.0.0.1:33061").await.unwrap();
        seed.set_sysvar(BOOTSTRAP_GROUP, "ON").await.unwrap();
        seed.execute("START GROUP_REPLICATION").await.unwrap();
        seed.execute("CREATE USER 'mysql_innodb_cluster_101'@'%' IDENTIFIED BY 'pw'").await.unwrap();

        joiner.set_sysvar(LOCAL_ADDRESS, "127.0.0.1:33071").await.unwrap();
        joiner.set_sysvar(GROUP_SEEDS, "127.0.0.1:33061").await.unwrap();
        joiner
            .execute("CHANGE REPLICATION SOURCE TO SOURCE_USER = 'mysql_innodb_cluster_101', SOURCE_PASSWORD = 'pw' FOR CHANNEL 'group_replication_recovery'")
            .await
            .unwrap();
        joiner.execute("START GROUP_REPLICATION").await.unwrap();

        assert_eq!(topology.member_state(&addr(3307)), Some(MemberState::Recovering));
        assert_eq!(joiner.member_state().await.unwrap(), Some(MemberState::Online));
        assert_eq!(topology.group_members().len(), 2);
        assert!(topology.has_user(&addr(3307), "mysql_innodb_cluster_101"));
    }

    #[tokio::test]
    async fn test_join_without_recovery_account_errors() {
        let topology = topology_with(&[3306, 3307, 3308]);
        topology
            .seed_group("prod", &[addr(3306), addr(3307)], TopologyMode::SinglePrimary)
            .unwrap();
        let group_name = topology.cluster().unwrap().group_name;

        let joiner = session(&topology, 3308).await;
        joiner.install_capability(GR_PLUGIN).await.unwrap();
        joiner.set_sysvar(GROUP_NAME, &group_name).await.unwrap();
        joiner.set_sysvar(LOCAL_ADDRESS, "127.0.0.1:33081").await.unwrap();
        joiner.set_sysvar(GROUP_SEEDS, "127.0.0.1:33061").await.unwrap();
        joiner.execute("START GROUP_REPLICATION").await.unwrap();

        assert_eq!(joiner.member_state().await.unwrap(), Some(MemberState::Error));
        assert_eq!(topology.group_members().len(), 2);
    }

    #[tokio::test]
    async fn test_errant_transactions_block_incremental_join() {
        let topology = topology_with(&[3306, 3307]);
        topology
            .seed_group("prod", &[addr(3306)], TopologyMode::SinglePrimary)
            .unwrap();
        let group_name = topology.cluster().unwrap().group_name;
        topology.set_gtid_executed(
            &addr(3307),
            GtidSet::parse("8a94f357-aab4-11df-86ab-c80aa9429562:1-3").unwrap(),
        );

        let joiner = session(&topology, 3307).await;
        joiner.install_capability(GR_PLUGIN).await.unwrap();
        joiner.set_sysvar(GROUP_NAME, &group_name).await.unwrap();
        joiner.set_sysvar(LOCAL_ADDRESS, "127.0.0.1:33071").await.unwrap();
        joiner.set_sysvar(GROUP_SEEDS, "127.0.0.1:33061").await.unwrap();

        let err = joiner.execute("START GROUP_REPLICATION").await.unwrap_err();
        assert!(err.to_string().contains("more executed transactions"));
    }

    #[tokio::test]
    async fn test_slow_recovery_counts_polls() {
        let topology = topology_with(&[3306, 3307]);
        topology
            .seed_group("prod", &[addr(3306)], TopologyMode::SinglePrimary)
            .unwrap();
        topology.inject_fault(Fault::SlowRecovery { address: addr(3307), polls: 2 });
        let group_name = topology.cluster().unwrap().group_name;

        let joiner = session(&topology, 3307).await;
        joiner.install_capability(GR_PLUGIN).await.unwrap();
        joiner.set_sysvar(GROUP_NAME, &group_name).await.unwrap();
        joiner.set_sysvar(LOCAL_ADDRESS, "127.0.0.1:33071").await.unwrap();
        joiner.set_sysvar(GROUP_SEEDS, "127.0.0.1:33061").await.unwrap();
        joiner
            .execute("CHANGE MASTER TO MASTER_USER = 'mysql_innodb_cluster_100', MASTER_PASSWORD = 'x' FOR CHANNEL 'group_replication_recovery'")
            .await
            .unwrap();
        joiner.execute("START GROUP_REPLICATION").await.unwrap();

        assert_eq!(joiner.member_state().await.unwrap(), Some(MemberState::Recovering));
        assert_eq!(joiner.member_state().await.unwrap(), Some(MemberState::Recovering));
        assert_eq!(joiner.member_state().await.unwrap(), Some(MemberState::Online));
    }

    #[tokio::test]
    async fn test_statement_fault_and_clear() {
        let topology = topology_with(&[3306]);
        let instance = session(&topology, 3306).await;
        let fault = Fault::FailStatement {
            address: Some(addr(3306)),
            prefix: "CREATE USER".to_string(),
        };
        topology.inject_fault(fault.clone());

        assert_err!(instance.execute("CREATE USER 'u'@'%' IDENTIFIED BY 'p'").await);
        assert!(topology.clear_fault(&fault));
        assert_ok!(instance.execute("CREATE USER 'u'@'%' IDENTIFIED BY 'p'").await);
        assert_err!(instance.execute("CREATE USER 'u'@'%' IDENTIFIED BY 'p'").await);
        assert_eq!(topology.statements(&addr(3306)).len(), 1);
    }

    #[tokio::test]
    async fn test_session_accounting() {
        let topology = topology_with(&[3306]);
        let instance = session(&topology, 3306).await;
        assert_eq!(topology.open_sessions(&addr(3306)), 1);

        instance.close().await.unwrap();
        instance.close().await.unwrap();
        assert!(!instance.is_open());
        assert_eq!(topology.open_sessions(&addr(3306)), 0);
        assert_eq!(instance.execute("STOP GROUP_REPLICATION").await, Err(SessionError::Closed));
    }

    #[tokio::test]
    async fn test_primary_leaving_elects_next_online_member() {
        let topology = topology_with(&[3306, 3307, 3308]);
        topology
            .seed_group("prod", &[addr(3306), addr(3307), addr(3308)], TopologyMode::SinglePrimary)
            .unwrap();
        assert_eq!(topology.primary(), Some(addr(3306)));

        let primary = session(&topology, 3306).await;
        assert_ok!(primary.execute("STOP GROUP_REPLICATION").await);
        assert_eq!(topology.primary(), Some(addr(3307)));
        assert_eq!(topology.group_members(), vec![addr(3307), addr(3308)]);
    }

    #[tokio::test]
    async fn test_recovery_channel_user() {
        let topology = topology_with(&[3306, 3307]);
        topology
            .seed_group("prod", &[addr(3306)], TopologyMode::SinglePrimary)
            .unwrap();
        let query = "SELECT user_name FROM mysql.slave_master_info \
                     WHERE channel_name = 'group_replication_recovery'";

        let seeded = session(&topology, 3306).await;
        let rows = assert_ok!(seeded.query(query).await);
        assert_eq!(rows.first_value(), Some(recovery_account_name(100).as_str()));

        let standalone = session(&topology, 3307).await;
        let rows = assert_ok!(standalone.query(query).await);
        assert_eq!(rows.first_value(), None);
    }

    #[tokio::test]
    async fn test_metadata_store() {
        let topology = topology_with(&[3306, 3307]);
        topology
            .seed_group("prod", &[addr(3306)], TopologyMode::SinglePrimary)
            .unwrap();
        let metadata = MemoryMetadata::new(topology.clone(), addr(3306));

        let info = metadata.read_source_info().await.unwrap();
        assert!(info.gr_active);
        assert!(info.registered);
        assert_eq!(info.cluster_type, Some(ClusterType::GroupReplication));

        topology.inject_fault(Fault::FailMetadataWrite);
        let record = InstanceRecord::new(addr(3307), ServerUuid::random(), 101);
        assert_err!(metadata.write_instance_record(&record).await);
        topology.clear_faults();
        assert_ok!(metadata.write_instance_record(&record).await);
        assert_eq!(metadata.read_instances().await.unwrap().len(), 2);

        assert_ok!(metadata.remove_instance_record(&addr(3307)).await);
        assert_eq!(metadata.read_instances().await.unwrap().len(), 1);

        topology.inject_fault(Fault::AccessDenied { address: addr(3306) });
        assert!(matches!(
            metadata.read_source_info().await,
            Err(SessionError::AccessDenied(_))
        ));
    }

    #[test]
    fn test_fault_json() {
        let fault: Fault = serde_json::from_str(
            r#"{"type": "fail_statement", "address": "127.0.0.1:3307", "prefix": "START GROUP_REPLICATION"}"#,
        )
        .unwrap();
        assert_eq!(
            fault,
            Fault::FailStatement {
                address: Some(addr(3307)),
                prefix: "START GROUP_REPLICATION".to_string()
            }
        );
    }

    #[test]
    fn test_quoted_values() {
        assert_eq!(
            quoted_values("GRANT REPLICATION SLAVE ON *.* TO 'u1'@'%'"),
            vec!["u1".to_string(), "%".to_string()]
        );
        assert_eq!(unquote(" 'a,b' "), "a,b");
        assert_eq!(unquote("ON"), "ON");
    }
}
