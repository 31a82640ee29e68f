//! Cluster configuration file parsing.
//!
//! Format: the first line holds `<numServers> <numItems>`; the next
//! `numServers` lines are peer addresses `host:port`, whose line position
//! fixes each process ID; optional trailing lines `<pid+1> <messageMax>
//! <timeoutMillis>` configure the cooperative pause of a process.

use std::collections::HashMap;
use std::fs;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::Path;

use crate::server::ProcessId;
use crate::utils::LendsetError;

use tokio::time::Duration;

/// Cooperative pause setting of a process: after processing `message_max`
/// messages, stop polling for `timeout`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    pub message_max: u64,
    pub timeout: Duration,
}

/// Parsed cluster configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterConfig {
    /// Listen address of every process, indexed by process ID.
    pub addrs: Vec<SocketAddr>,

    /// Number of catalog items.
    pub num_items: usize,

    /// Cooperative pause settings, keyed by process ID.
    pub rate_limits: HashMap<ProcessId, RateLimit>,
}

/// Resolves a `host:port` string to its first socket address.
pub(crate) fn resolve_addr(s: &str) -> Result<SocketAddr, LendsetError> {
    s.to_socket_addrs()?
        .next()
        .ok_or_else(|| LendsetError::msg(format!("cannot resolve '{}'", s)))
}

/// Parses a single whitespace-separated unsigned number token.
fn parse_num<T: std::str::FromStr<Err = std::num::ParseIntError>>(
    token: Option<&str>,
    what: &str,
) -> Result<T, LendsetError> {
    match token {
        Some(t) => Ok(t.parse::<T>()?),
        None => Err(LendsetError::msg(format!("missing {}", what))),
    }
}

impl ClusterConfig {
    /// Parses a cluster configuration from its text content.
    pub fn parse(content: &str) -> Result<Self, LendsetError> {
        let mut lines = content
            .lines()
            .map(|l| l.trim())
            .filter(|l| !l.is_empty());

        let header = lines
            .next()
            .ok_or_else(|| LendsetError::msg("empty cluster config"))?;
        let mut tokens = header.split_whitespace();
        let num_servers: usize = parse_num(tokens.next(), "server count")?;
        let num_items: usize = parse_num(tokens.next(), "item count")?;
        if num_servers == 0 || num_servers > ProcessId::MAX as usize {
            return Err(LendsetError::msg(format!(
                "invalid server count {}",
                num_servers
            )));
        }

        let mut addrs = Vec::with_capacity(num_servers);
        for i in 0..num_servers {
            let line = lines.next().ok_or_else(|| {
                LendsetError::msg(format!(
                    "expected {} addresses, found {}",
                    num_servers, i
                ))
            })?;
            addrs.push(resolve_addr(line)?);
        }

        let mut rate_limits = HashMap::new();
        for line in lines {
            let mut tokens = line.split_whitespace();
            let pid_plus_one: usize = parse_num(tokens.next(), "process")?;
            let message_max: u64 = parse_num(tokens.next(), "message max")?;
            let timeout_ms: u64 = parse_num(tokens.next(), "timeout")?;
            if pid_plus_one == 0 || pid_plus_one > num_servers {
                return Err(LendsetError::msg(format!(
                    "rate limit for unknown process {}",
                    pid_plus_one
                )));
            }
            rate_limits.insert(
                (pid_plus_one - 1) as ProcessId,
                RateLimit {
                    message_max,
                    timeout: Duration::from_millis(timeout_ms),
                },
            );
        }

        Ok(ClusterConfig {
            addrs,
            num_items,
            rate_limits,
        })
    }

    /// Reads and parses a cluster configuration file.
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

    /// Number of processes in the cluster.
    #[inline]
    pub fn population(&self) -> u8 {
        self.addrs.len() as u8
    }
}
