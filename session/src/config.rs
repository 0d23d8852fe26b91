//! Connection options.

use std::fmt;
use std::time::Duration;

use clusteradmin_common::{AddressParseError, InstanceAddress};

/// Where and how to connect to a server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionOptions {
    /// Server endpoint.
    pub address: InstanceAddress,
    /// Account name.
    pub user: String,
    /// Account password.
    pub password: Option<String>,
    /// Connect timeout.
    pub connect_timeout: Duration,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            address: InstanceAddress::new("localhost", clusteradmin_common::DEFAULT_MYSQL_PORT),
            user: "root".to_string(),
            password: None,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl ConnectionOptions {
    /// Parse `[user[:password]@]host[:port]`.
    pub fn parse(uri: &str) -> Result<Self, AddressParseError> {
        let mut options = Self::default();

        let endpoint = match uri.rsplit_once('@') {
            Some((credentials, endpoint)) => {
                match credentials.split_once(':') {
                    Some((user, password)) => {
                        options.user = user.to_string();
                        options.password = Some(password.to_string());
                    }
                    None => options.user = credentials.to_string(),
                }
                endpoint
            }
            None => uri,
        };

        options.address = InstanceAddress::parse(endpoint)?;
        Ok(options)
    }

    /// Apply credentials from the environment.
    pub fn from_env() -> Self {
        let mut options = Self::default();

        if let Ok(user) = std::env::var("CLUSTERADMIN_USER") {
            options.user = user;
        }

        if let Ok(password) = std::env::var("CLUSTERADMIN_PASSWORD") {
            options.password = Some(password);
        }

        options
    }

    /// The same credentials for another endpoint.
    pub fn for_address(&self, address: InstanceAddress) -> Self {
        Self {
            address,
            ..self.clone()
        }
    }

    /// Validate options.
    pub fn validate(&self) -> Result<(), String> {
        if self.user.is_empty() {
            return Err("User cannot be empty".to_string());
        }

        if self.connect_timeout.is_zero() {
            return Err("Connect timeout cannot be zero".to_string());
        }

        Ok(())
    }
}

impl fmt::Display for ConnectionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.user, self.address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_uri() {
        let options = ConnectionOptions::parse("admin:s3cret@db1:3310").unwrap();
        assert_eq!(options.user, "admin");
        assert_eq!(options.password.as_deref(), Some("s3cret"));
        assert_eq!(options.address, InstanceAddress::new("db1", 3310));
        assert_eq!(options.to_string(), "admin@db1:3310");
    }

    #[test]
    fn test_parse_host_only() {
        let options = ConnectionOptions::parse("db1").unwrap();
        assert_eq!(options.user, "root");
        assert_eq!(options.password, None);
        assert_eq!(options.address.port, 3306);
    }

    #[test]
    fn test_for_address_keeps_credentials() {
        let options = ConnectionOptions::parse("admin:pw@db1").unwrap();
        let other = options.for_address(InstanceAddress::new("db2", 3306));
        assert_eq!(other.user, "admin");
        assert_eq!(other.address.host, "db2");
    }

    #[test]
    fn test_validate() {
        assert!(ConnectionOptions::default().validate().is_ok());
        let mut options = ConnectionOptions::default();
        options.user.clear();
        assert!(options.validate().is_err());
    }
}
