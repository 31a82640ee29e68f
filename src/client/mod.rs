//! Lendset's client functionality modules.

mod endpoint;

use std::fs;
use std::net::SocketAddr;
use std::path::Path;

use crate::server::resolve_addr;
use crate::utils::LendsetError;

pub use endpoint::LibraryClient;

/// Client configuration: the list of servers to pick from.
///
/// File format: first line `<numServers>` (a trailing item count is
/// tolerated), then `numServers` lines of `host:port`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub servers: Vec<SocketAddr>,
}

impl ClientConfig {
    /// Parses a client configuration from its text content.
    pub fn parse(content: &str) -> Result<Self, LendsetError> {
        let mut lines = content
            .lines()
            .map(|l| l.trim())
            .filter(|l| !l.is_empty());

        let num_servers: usize = lines
            .next()
            .and_then(|l| l.split_whitespace().next())
            .ok_or_else(|| LendsetError::msg("empty client config"))?
            .parse()?;
        if num_servers == 0 {
            return Err(LendsetError::msg("no servers in client config"));
        }

        let servers = lines
            .take(num_servers)
            .map(resolve_addr)
            .collect::<Result<Vec<_>, _>>()?;
        if servers.len() != num_servers {
            return Err(LendsetError::msg(format!(
                "expected {} servers, found {}",
                num_servers,
                servers.len()
            )));
        }
        Ok(ClientConfig { servers })
    }

    /// Reads and parses a client configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, LendsetError> {
        let content = fs::read_to_string(path.as_ref()).map_err(|e| {
            LendsetError::msg(format!(
                "cannot read '{}': {}",
                path.as_ref().display(),
                e
            ))
        })?;
        Self::parse(&content)
    }
}
