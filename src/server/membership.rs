//! Fixed cluster membership table: peer addresses, my own process ID, and a
//! best-effort liveness hint per peer.

use std::net::{IpAddr, SocketAddr, UdpSocket};

use crate::utils::{Bitmap, LendsetError};

/// Process ID type. Index into every per-process array.
pub type ProcessId = u8;

/// Membership table, fixed at startup.
#[derive(Debug)]
pub(crate) struct Membership {
    /// My process ID.
    me: ProcessId,

    /// Listen address of every process, indexed by ID.
    addrs: Vec<SocketAddr>,

    /// Liveness hint of every process. Never trusted for correctness.
    live: Bitmap,
}

impl Membership {
    /// Creates a new membership table in which every process starts live.
    pub(crate) fn new(
        me: ProcessId,
        addrs: Vec<SocketAddr>,
    ) -> Result<Self, LendsetError> {
        if addrs.is_empty() || addrs.len() > ProcessId::MAX as usize {
            return Err(LendsetError::msg(format!(
                "invalid cluster size {}",
                addrs.len()
            )));
        }
        if me as usize >= addrs.len() {
            return Err(LendsetError::msg(format!(
                "invalid process ID {} / {}",
                me,
                addrs.len()
            )));
        }

        let live = Bitmap::new(addrs.len() as u8, true);
        Ok(Membership { me, addrs, live })
    }

    /// My process ID.
    #[inline]
    pub(crate) fn me(&self) -> ProcessId {
        self.me
    }

    /// Cluster size.
    #[inline]
    pub(crate) fn population(&self) -> u8 {
        self.addrs.len() as u8
    }

    /// Listen address of the given process.
    #[inline]
    pub(crate) fn addr(&self, pid: ProcessId) -> Option<SocketAddr> {
        self.addrs.get(pid as usize).copied()
    }

    /// Iterates over all process IDs except mine.
    pub(crate) fn peers(&self) -> impl Iterator<Item = ProcessId> + '_ {
        (0..self.population()).filter(move |&p| p != self.me)
    }

    /// Is the given process currently believed reachable?
    #[inline]
    pub(crate) fn is_live(&self, pid: ProcessId) -> bool {
        self.live.get(pid).unwrap_or(false)
    }

    /// Updates the liveness hint of a process. Returns the previous value.
    pub(crate) fn set_live(
        &mut self,
        pid: ProcessId,
        flag: bool,
    ) -> Result<bool, LendsetError> {
        let old = self.live.get(pid)?;
        self.live.set(pid, flag)?;
        Ok(old)
    }

    /// Liveness hints of all processes.
    #[inline]
    pub(crate) fn live(&self) -> &Bitmap {
        &self.live
    }
}

/// Is `ip` one of this host's addresses? Binding an ephemeral port on it
/// only succeeds if some local interface carries it.
fn is_local_ip(ip: IpAddr) -> bool {
    ip.is_unspecified() || ip.is_loopback() || UdpSocket::bind((ip, 0)).is_ok()
}

/// Figures out my own process ID: the entry whose port is my listen port
/// and whose IP belongs to this host. A single port match on a foreign IP
/// (e.g. a public address behind NAT) is accepted as well.
pub(crate) fn resolve_identity(
    addrs: &[SocketAddr],
    port: u16,
) -> Result<ProcessId, LendsetError> {
    resolve_identity_with(addrs, port, is_local_ip)
}

fn resolve_identity_with(
    addrs: &[SocketAddr],
    port: u16,
    is_local: impl Fn(IpAddr) -> bool,
) -> Result<ProcessId, LendsetError> {
    let matches: Vec<usize> = addrs
        .iter()
        .enumerate()
        .filter(|(_, a)| a.port() == port)
        .map(|(i, _)| i)
        .collect();
    let local: Vec<usize> = matches
        .iter()
        .copied()
        .filter(|&i| is_local(addrs[i].ip()))
        .collect();

    match (local.as_slice(), matches.as_slice()) {
        ([idx], _) | ([], [idx]) => Ok(*idx as ProcessId),
        ([], []) => Err(LendsetError::msg(format!(
            "listen port {} not found in cluster addresses",
            port
        ))),
        ([], _) => Err(LendsetError::msg(format!(
            "none of the {} entries with port {} is a local address",
            matches.len(),
            port
        ))),
        _ => Err(LendsetError::msg(format!(
            "ambiguous identity: entries {:?} all have local port {}",
            local, port
        ))),
    }
}

#[cfg(test)]
mod membership_tests {
    use super::*;

    fn addrs(list: &[&str]) -> Vec<SocketAddr> {
        list.iter().map(|s| s.parse().unwrap()).collect()
    }

    #[test]
    fn resolve_by_port() -> Result<(), LendsetError> {
        let a = addrs(&["127.0.0.1:5000", "127.0.0.1:5001", "127.0.0.1:5002"]);
        assert_eq!(resolve_identity(&a, 5001)?, 1);
        assert_eq!(resolve_identity(&a, 5002)?, 2);
        assert!(resolve_identity(&a, 6000).is_err());
        Ok(())
    }

    #[test]
    fn resolve_prefers_local_ip() -> Result<(), LendsetError> {
        // documentation-range addresses are never assigned to a test host
        let a = addrs(&["192.0.2.7:5000", "127.0.0.1:5000", "192.0.2.8:5001"]);
        assert_eq!(resolve_identity(&a, 5000)?, 1);
        assert_eq!(resolve_identity(&a, 5001)?, 2);
        Ok(())
    }

    #[test]
    fn resolve_same_port_on_every_host() -> Result<(), LendsetError> {
        let a = addrs(&["192.0.2.1:5000", "192.0.2.2:5000", "192.0.2.3:5000"]);
        let on_host = |host: &'static str| {
            move |ip: IpAddr| ip == host.parse::<IpAddr>().unwrap()
        };
        assert_eq!(resolve_identity_with(&a, 5000, on_host("192.0.2.1"))?, 0);
        assert_eq!(resolve_identity_with(&a, 5000, on_host("192.0.2.2"))?, 1);
        assert_eq!(resolve_identity_with(&a, 5000, on_host("192.0.2.3"))?, 2);
        // not one of them, or more than one of them
        assert!(resolve_identity_with(&a, 5000, on_host("192.0.2.9")).is_err());
        assert!(resolve_identity_with(&a, 5000, |_| true).is_err());
        assert!(resolve_identity(&a, 5000).is_err());
        Ok(())
    }

    #[test]
    fn membership_liveness() -> Result<(), LendsetError> {
        let mut m =
            Membership::new(1, addrs(&["127.0.0.1:1", "127.0.0.1:2", "127.0.0.1:3"]))?;
        assert_eq!(m.me(), 1);
        assert_eq!(m.population(), 3);
        assert_eq!(m.peers().collect::<Vec<_>>(), vec![0, 2]);
        assert!(m.is_live(0));
        assert!(m.set_live(0, false)?);
        assert!(!m.is_live(0));
        assert!(!m.is_live(9));
        assert_eq!(m.live().count(), 2);
        Ok(())
    }

    #[test]
    fn membership_invalid() {
        assert!(Membership::new(0, vec![]).is_err());
        assert!(Membership::new(2, addrs(&["127.0.0.1:1", "127.0.0.1:2"])).is_err());
    }
}
