//! Simulated servers for a scenario run.

use rand::rngs::StdRng;
use rand::Rng;

use clusteradmin_common::{InstanceAddress, ServerUuid, Version};
use clusteradmin_session::memory::SimServer;

/// Host every simulated server listens on.
pub const HOST: &str = "127.0.0.1";
/// Port of the first server; the rest follow consecutively.
pub const BASE_PORT: u16 = 3306;
/// Most servers one run may create.
pub const MAX_SERVERS: usize = 64;

/// Server version every simulated server reports.
pub fn server_version() -> Version {
    Version::new(8, 0, 30)
}

/// Address of the `index`-th server.
pub fn server_address(index: usize) -> anyhow::Result<InstanceAddress> {
    let offset = u16::try_from(index)
        .ok()
        .filter(|i| usize::from(*i) < MAX_SERVERS)
        .ok_or_else(|| anyhow::anyhow!("server index {} is out of range", index))?;
    Ok(InstanceAddress::new(HOST, BASE_PORT + offset))
}

/// Builds simulated servers.
pub struct ServerFactory;

impl ServerFactory {
    /// Create `count` standalone servers. Server ids and UUIDs come from
    /// `rng`, so a seeded generator gives the same servers every run.
    pub fn create_servers(count: usize, rng: &mut StdRng) -> anyhow::Result<Vec<SimServer>> {
        if count == 0 || count > MAX_SERVERS {
            anyhow::bail!("server count must be between 1 and {}", MAX_SERVERS);
        }

        let ids = rand::seq::index::sample(rng, 4_000_000, count);
        (0..count)
            .zip(ids.iter())
            .map(|(index, id)| -> anyhow::Result<SimServer> {
                let server_id = u32::try_from(id + 1)?;
                let uuid = uuid::Builder::from_random_bytes(rng.gen()).into_uuid();
                Ok(
                    SimServer::new(server_address(index)?, server_version(), server_id)
                        .with_server_uuid(ServerUuid::from_uuid(uuid)),
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use std::collections::HashSet;

    #[test]
    fn test_addresses() {
        assert_eq!(server_address(0).unwrap().to_string(), "127.0.0.1:3306");
        assert_eq!(server_address(3).unwrap().port, 3309);
        assert!(server_address(MAX_SERVERS).is_err());
    }

    #[test]
    fn test_servers_are_distinct_and_reproducible() {
        let first = ServerFactory::create_servers(5, &mut StdRng::seed_from_u64(7)).unwrap();
        let again = ServerFactory::create_servers(5, &mut StdRng::seed_from_u64(7)).unwrap();

        let ids: HashSet<u32> = first.iter().map(|s| s.server_id).collect();
        assert_eq!(ids.len(), 5);
        assert!(!ids.contains(&0));
        assert_eq!(
            first.iter().map(|s| s.server_uuid).collect::<Vec<_>>(),
            again.iter().map(|s| s.server_uuid).collect::<Vec<_>>()
        );
        assert_eq!(first[4].address.port, 3310);
    }

    #[test]
    fn test_server_count_bounds() {
        let mut rng = StdRng::seed_from_u64(1);
        assert!(ServerFactory::create_servers(0, &mut rng).is_err());
        assert!(ServerFactory::create_servers(MAX_SERVERS + 1, &mut rng).is_err());
    }
}
