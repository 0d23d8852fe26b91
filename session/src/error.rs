//! Session-level errors reported by instance and metadata collaborators.

use thiserror::Error;

/// Errors raised by a session to a server.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// The server cannot be reached.
    #[error("Can't connect to MySQL server on '{address}': {reason}")]
    Connection { address: String, reason: String },

    /// A statement was rejected by the server.
    #[error("MySQL Error {code}: {message}")]
    Sql { code: u32, message: String },

    /// The account lacks the privileges for the request.
    #[error("Access denied: {0}")]
    AccessDenied(String),

    /// The call did not complete in time.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// The session was already closed.
    #[error("Session is closed")]
    Closed,
}

impl SessionError {
    /// Build a SQL error.
    pub fn sql(code: u32, message: impl Into<String>) -> Self {
        SessionError::Sql {
            code,
            message: message.into(),
        }
    }

    /// Whether the error came from the transport rather than the server.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            SessionError::Connection { .. } | SessionError::Timeout(_) | SessionError::Closed
        )
    }
}

/// Result type for session calls.
pub type SessionResult<T> = std::result::Result<T, SessionError>;

/// Server error codes used by this crate.
pub mod codes {
    /// Syntax error or unsupported statement.
    pub const ER_PARSE_ERROR: u32 = 1064;
    /// Operation CREATE USER failed.
    pub const ER_CANNOT_USER: u32 = 1396;
    /// Plugin shared library could not be opened.
    pub const ER_CANT_OPEN_LIBRARY: u32 = 1126;
    /// Plugin already installed.
    pub const ER_PLUGIN_INSTALLED: u32 = 1968;
    /// Unknown system variable.
    pub const ER_UNKNOWN_SYSTEM_VARIABLE: u32 = 1193;
    /// Group Replication failed to start or join.
    pub const ER_GROUP_REPLICATION_CONFIGURATION: u32 = 3092;
    /// Group Replication is already running (or not running for STOP).
    pub const ER_GROUP_REPLICATION_RUNNING: u32 = 3093;
    /// Injected failure.
    pub const ER_INJECTED: u32 = 3100;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_classification() {
        assert!(SessionError::Closed.is_transport());
        assert!(SessionError::Timeout("query".into()).is_transport());
        assert!(!SessionError::sql(codes::ER_CANNOT_USER, "exists").is_transport());
        assert!(!SessionError::AccessDenied("root".into()).is_transport());
    }

    #[test]
    fn test_display() {
        let err = SessionError::sql(1064, "You have an error in your SQL syntax");
        assert_eq!(err.to_string(), "MySQL Error 1064: You have an error in your SQL syntax");
    }
}
