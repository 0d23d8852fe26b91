//! The instance handle interface.
//!
//! Only the raw statement calls (`execute`, `query`) are required; the
//! higher-level helpers are provided in terms of them, so any transport that
//! can run SQL gets them for free.

use async_trait::async_trait;
use serde::Serialize;

use clusteradmin_common::{GtidSet, InstanceAddress, MemberRole, MemberState, ServerUuid, Version};

use crate::error::{SessionError, SessionResult};
use crate::rowset::RowSet;

/// Query for the group view as seen from the queried server.
pub const MEMBERS_QUERY: &str = "SELECT MEMBER_ID, MEMBER_HOST, MEMBER_PORT, MEMBER_STATE, \
     MEMBER_ROLE FROM performance_schema.replication_group_members";

/// One row of `performance_schema.replication_group_members`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MemberRow {
    pub server_uuid: ServerUuid,
    pub address: InstanceAddress,
    pub state: MemberState,
    /// Empty role (`None`) is reported by servers outside a running group.
    pub role: Option<MemberRole>,
}

impl MemberRow {
    /// Decode the rows of [`MEMBERS_QUERY`].
    pub fn from_rowset(rows: &RowSet) -> SessionResult<Vec<MemberRow>> {
        let malformed = |what: &str| SessionError::sql(0, format!("malformed group member row: {}", what));

        rows.rows()
            .map(|row| {
                let server_uuid = row
                    .get("MEMBER_ID")
                    .and_then(|id| ServerUuid::parse(id).ok())
                    .ok_or_else(|| malformed("MEMBER_ID"))?;
                let host = row.get("MEMBER_HOST").ok_or_else(|| malformed("MEMBER_HOST"))?;
                let port = row
                    .get_u64("MEMBER_PORT")
                    .and_then(|p| u16::try_from(p).ok())
                    .ok_or_else(|| malformed("MEMBER_PORT"))?;
                let state = row
                    .get("MEMBER_STATE")
                    .and_then(MemberState::parse)
                    .ok_or_else(|| malformed("MEMBER_STATE"))?;
                let role = match row.get("MEMBER_ROLE").map(str::to_ascii_uppercase).as_deref() {
                    Some("PRIMARY") => Some(MemberRole::Primary),
                    Some("SECONDARY") => Some(MemberRole::Secondary),
                    _ => None,
                };

                Ok(MemberRow {
                    server_uuid,
                    address: InstanceAddress::new(host, port),
                    state,
                    role,
                })
            })
            .collect()
    }
}

/// Quote a string literal.
pub fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
}

/// Render a system variable value: numbers and ON/OFF stay bare, the rest is quoted.
pub fn sql_value(value: &str) -> String {
    let bare = !value.is_empty()
        && (value.chars().all(|c| c.is_ascii_digit())
            || value.eq_ignore_ascii_case("ON")
            || value.eq_ignore_ascii_case("OFF"));
    if bare {
        value.to_string()
    } else {
        quote(value)
    }
}

/// A session to one MySQL server.
#[async_trait]
pub trait Instance: Send + Sync {
    /// Endpoint this session is connected to.
    fn address(&self) -> &InstanceAddress;

    /// Server version, read at connect time.
    fn version(&self) -> Version;

    /// `@@server_uuid`, read at connect time.
    fn server_uuid(&self) -> ServerUuid;

    /// `@@server_id`, read at connect time.
    fn server_id(&self) -> u32;

    /// Run a statement that returns no rows.
    async fn execute(&self, sql: &str) -> SessionResult<()>;

    /// Run a statement that returns rows.
    async fn query(&self, sql: &str) -> SessionResult<RowSet>;

    /// Close the session. Closing twice is not an error.
    async fn close(&self) -> SessionResult<()>;

    fn is_open(&self) -> bool;

    /// Read a global system variable.
    async fn get_sysvar(&self, name: &str) -> SessionResult<Option<String>> {
        let rows = self.query(&format!("SELECT @@GLOBAL.{}", name)).await?;
        Ok(rows.first_value().map(str::to_string))
    }

    /// Set a global system variable.
    async fn set_sysvar(&self, name: &str, value: &str) -> SessionResult<()> {
        self.execute(&format!("SET GLOBAL {} = {}", name, sql_value(value)))
            .await
    }

    /// Whether a server plugin is installed and active.
    async fn has_capability(&self, name: &str) -> SessionResult<bool> {
        let rows = self
            .query(&format!(
                "SELECT PLUGIN_STATUS FROM INFORMATION_SCHEMA.PLUGINS WHERE PLUGIN_NAME = {}",
                quote(name)
            ))
            .await?;
        Ok(rows
            .first_value()
            .map_or(false, |status| status.eq_ignore_ascii_case("ACTIVE")))
    }

    /// Install a server plugin.
    async fn install_capability(&self, name: &str) -> SessionResult<()> {
        self.execute(&format!("INSTALL PLUGIN {} SONAME '{}.so'", name, name))
            .await
    }

    /// The group view from this server.
    async fn group_members(&self) -> SessionResult<Vec<MemberRow>> {
        let rows = self.query(MEMBERS_QUERY).await?;
        MemberRow::from_rowset(&rows)
    }

    /// This server's own member state, `None` when it is not in any view.
    async fn member_state(&self) -> SessionResult<Option<MemberState>> {
        let uuid = self.server_uuid();
        Ok(self
            .group_members()
            .await?
            .into_iter()
            .find(|m| m.server_uuid == uuid)
            .map(|m| m.state))
    }

    /// Whether this server is an ONLINE or RECOVERING group member.
    async fn is_member_of_group(&self) -> SessionResult<bool> {
        Ok(self.member_state().await?.map_or(false, |s| s.is_active()))
    }

    /// `@@GLOBAL.gtid_executed`.
    async fn gtid_executed(&self) -> SessionResult<GtidSet> {
        let value = self.get_sysvar("gtid_executed").await?.unwrap_or_default();
        GtidSet::parse(&value).map_err(|e| SessionError::sql(0, e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote() {
        assert_eq!(quote("abc"), "'abc'");
        assert_eq!(quote("it's"), "'it\\'s'");
    }

    #[test]
    fn test_sql_value() {
        assert_eq!(sql_value("ON"), "ON");
        assert_eq!(sql_value("7"), "7");
        assert_eq!(sql_value("db1:33061,db2:33061"), "'db1:33061,db2:33061'");
        assert_eq!(sql_value(""), "''");
    }

    #[test]
    fn test_member_rows() {
        let mut rows = RowSet::new(["MEMBER_ID", "MEMBER_HOST", "MEMBER_PORT", "MEMBER_STATE", "MEMBER_ROLE"]);
        rows.push([
            Some("3e11fa47-71ca-11e1-9e33-c80aa9429562".to_string()),
            Some("db1".to_string()),
            Some("3306".to_string()),
            Some("ONLINE".to_string()),
            Some("PRIMARY".to_string()),
        ]);
        rows.push([
            Some("8a94f357-aab4-11df-86ab-c80aa9429562".to_string()),
            Some("db2".to_string()),
            Some("3306".to_string()),
            Some("OFFLINE".to_string()),
            Some(String::new()),
        ]);

        let members = MemberRow::from_rowset(&rows).unwrap();
        assert_eq!(members.len(), 2);
        assert_eq!(members[0].role, Some(MemberRole::Primary));
        assert_eq!(members[1].state, MemberState::Offline);
        assert_eq!(members[1].role, None);
    }

    #[test]
    fn test_member_rows_malformed() {
        let mut rows = RowSet::new(["MEMBER_ID", "MEMBER_HOST", "MEMBER_PORT", "MEMBER_STATE"]);
        rows.push([
            Some("not-a-uuid".to_string()),
            Some("db1".to_string()),
            Some("3306".to_string()),
            Some("ONLINE".to_string()),
        ]);
        assert!(MemberRow::from_rowset(&rows).is_err());
    }
}
