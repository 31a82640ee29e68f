//! Library replica: one peer process of the replicated inventory.
//!
//! Client commands are serialized across the cluster by the distributed
//! mutex, applied to the local catalog, and pushed to every peer as
//! `COMMAND` messages before the lock is released.

mod request;
mod locking;
mod replication;
mod snapshot;

use std::collections::VecDeque;
use std::net::SocketAddr;

use crate::server::{
    resolve_identity, Catalog, ClusterConfig, ConnId, LogicalClock,
    Membership, Multiplexer, MutexEngine, PeerMsg, PollEvent, ProcessId,
    RateLimit,
};
use crate::utils::{LendsetError, ME};

use serde::Deserialize;

use tokio::sync::watch;
use tokio::time::{self, Duration};

/// Configuration parameters struct.
#[derive(Debug, Clone, Deserialize)]
pub struct ReplicaConfig {
    /// Upper bound of one poll step in millisecs.
    pub poll_timeout_ms: u64,

    /// Maximum length of a received line in bytes.
    pub max_line_len: usize,

    /// Number of retries when connecting to a peer.
    pub connect_retries: u8,

    /// Interval between connection retries in millisecs.
    pub connect_retry_ms: u64,

    /// Require every live peer to acknowledge a lock request before
    /// entering the critical section.
    pub require_acks: bool,

    /// Ask peers for their catalog snapshot when starting up.
    pub sync_on_join: bool,
}

#[allow(clippy::derivable_impls)]
impl Default for ReplicaConfig {
    fn default() -> Self {
        ReplicaConfig {
            poll_timeout_ms: 100,
            max_line_len: 1024,
            connect_retries: 3,
            connect_retry_ms: 500,
            require_acks: true,
            sync_on_join: true,
        }
    }
}

/// Client command waiting to be served from the top of the event loop.
#[derive(Debug, Clone, PartialEq, Eq)]
struct DeferredCmd {
    conn: ConnId,
    line: String,
}

/// Library replica module.
pub struct LibraryReplica {
    /// My process ID.
    me: ProcessId,

    /// Configuration parameters struct.
    config: ReplicaConfig,

    /// Fixed membership table with liveness hints.
    membership: Membership,

    /// Logical clock.
    clock: LogicalClock,

    /// Distributed mutual exclusion engine.
    mutex: MutexEngine,

    /// Local copy of the catalog.
    catalog: Catalog,

    /// Connection multiplexer.
    mux: Multiplexer,

    /// Cooperative pause setting, if any.
    rate_limit: Option<RateLimit>,

    /// Messages processed since the last pause.
    msg_count: u64,

    /// Number of client IDs I have assigned.
    clients_assigned: u64,

    /// Latest client count reported by each process.
    client_counts: Vec<u64>,

    /// Client commands received but not yet served.
    deferred: VecDeque<DeferredCmd>,
}

impl LibraryReplica {
    /// Creates a new replica listening on `port`, whose process ID is found
    /// by matching the port against the cluster addresses. Connects to all
    /// peers that are up; those that are not are marked unreachable.
    pub async fn new_and_setup(
        port: u16,
        cluster: ClusterConfig,
        config_str: Option<&str>,
        rx_term: watch::Receiver<bool>,
    ) -> Result<Self, LendsetError> {
        let me = resolve_identity(&cluster.addrs, port)?;
        let _ = ME.set(format!("p{}", me));
        let population = cluster.population();

        // parse tuning configs
        let config = parsed_config!(config_str => ReplicaConfig;
                                    poll_timeout_ms, max_line_len,
                                    connect_retries, connect_retry_ms,
                                    require_acks, sync_on_join)?;
        if config.poll_timeout_ms == 0 {
            return logged_err!(
                "invalid config.poll_timeout_ms '{}'",
                config.poll_timeout_ms
            );
        }
        if config.max_line_len == 0 {
            return logged_err!(
                "invalid config.max_line_len '{}'",
                config.max_line_len
            );
        }

        let membership = Membership::new(me, cluster.addrs.clone())?;
        let mux = Multiplexer::new_and_setup(
            me,
            population,
            SocketAddr::new(cluster.addrs[me as usize].ip(), port),
            config.max_line_len,
            Duration::from_millis(config.poll_timeout_ms),
            rx_term,
        )
        .await?;

        let rate_limit = cluster.rate_limits.get(&me).copied();
        if let Some(limit) = rate_limit {
            pf_info!(
                "will pause {} ms after every {} messages",
                limit.timeout.as_millis(),
                limit.message_max
            );
        }
        let mut replica = LibraryReplica {
            me,
            membership,
            clock: LogicalClock::new(me, population),
            mutex: MutexEngine::new(me, population, config.require_acks),
            catalog: Catalog::new(cluster.num_items),
            mux,
            rate_limit,
            msg_count: 0,
            clients_assigned: 0,
            client_counts: vec![0; population as usize],
            deferred: VecDeque::new(),
            config,
        };
        pf_info!(
            "process {} of {}, catalog of {} items",
            me,
            population,
            replica.catalog.len()
        );

        replica.connect_peers().await?;
        if replica.config.sync_on_join {
            let clock = replica.clock.advance_local();
            replica
                .broadcast(PeerMsg::Sync { pid: me, clock })
                .await?;
        }

        Ok(replica)
    }

    /// Connects to every peer, marking the ones that cannot be reached.
    async fn connect_peers(&mut self) -> Result<(), LendsetError> {
        let peers: Vec<ProcessId> = self.membership.peers().collect();
        for peer in peers {
            if let Err(e) = self.connect_peer(peer).await {
                pf_warn!("peer {} unreachable: {}", peer, e);
            }
        }
        Ok(())
    }

    /// Connects to a single peer and updates its liveness accordingly. My
    /// hello makes the peer forget my request, so an outstanding one is
    /// sent again over the new link.
    async fn connect_peer(&mut self, peer: ProcessId) -> Result<(), LendsetError> {
        let Some(addr) = self.membership.addr(peer) else {
            return logged_err!("no address for peer {}", peer);
        };
        let result = self
            .mux
            .connect_peer(
                peer,
                addr,
                self.config.connect_retries,
                Duration::from_millis(self.config.connect_retry_ms),
            )
            .await;
        self.membership.set_live(peer, result.is_ok())?;
        result?;
        self.resend_request(peer).await
    }

    /// Sends a message to one peer. A failure marks the peer unreachable
    /// and is otherwise swallowed.
    async fn send_to(&mut self, peer: ProcessId, msg: &PeerMsg) -> Result<(), LendsetError> {
        if !self.mux.has_link(peer) {
            if self.membership.set_live(peer, false)? {
                pf_warn!("no link to peer {}, marked unreachable", peer);
            }
            return Ok(());
        }
        if let Err(e) = self.mux.send_peer(peer, &msg.encode()).await {
            pf_warn!("error sending to peer {}: {}", peer, e);
            self.membership.set_live(peer, false)?;
        }
        Ok(())
    }

    /// Sends a message to every peer.
    async fn broadcast(&mut self, msg: PeerMsg) -> Result<(), LendsetError> {
        let peers: Vec<ProcessId> = self.membership.peers().collect();
        for peer in peers {
            self.send_to(peer, &msg).await?;
        }
        Ok(())
    }

    /// Counts one processed message and takes the cooperative pause once the
    /// configured number is reached. Sockets are left untouched meanwhile.
    async fn count_message(&mut self) {
        let Some(limit) = self.rate_limit else {
            return;
        };
        self.msg_count += 1;
        if self.msg_count >= limit.message_max {
            pf_info!(
                "pausing for {} ms after {} messages",
                limit.timeout.as_millis(),
                self.msg_count
            );
            time::sleep(limit.timeout).await;
            self.msg_count = 0;
        }
    }

    /// Handles one poll event. Returns false iff termination was signalled.
    /// Client commands are only queued here, so this never waits on the
    /// distributed lock itself.
    async fn handle_event(&mut self, event: PollEvent) -> Result<bool, LendsetError> {
        match event {
            PollEvent::Accepted(_) | PollEvent::Idle => {}

            PollEvent::ClientHello(conn) => {
                self.handle_client_hello(conn).await?;
            }

            PollEvent::PeerHello { conn, pid } => {
                self.handle_peer_hello(conn, pid).await?;
            }

            PollEvent::ClientLine { conn, client, line } => {
                pf_trace!("queued command from {}: '{}'", client, line);
                self.deferred.push_back(DeferredCmd { conn, line });
                self.count_message().await;
            }

            PollEvent::PeerLine { pid, line } => {
                self.handle_peer_line(pid, &line).await?;
                self.count_message().await;
            }

            PollEvent::Closed { conn, peer } => {
                if let Some(pid) = peer {
                    if self.membership.set_live(pid, false)? {
                        pf_warn!("lost conn {} with peer {}", conn, pid);
                    }
                }
            }

            PollEvent::Terminate => return Ok(false),
        }

        Ok(true)
    }

    /// Main event loop. Serves queued client commands first, then polls.
    /// Returns when termination is signalled.
    pub async fn run(&mut self) -> Result<(), LendsetError> {
        loop {
            if let Some(cmd) = self.deferred.pop_front() {
                if !self.serve_client_cmd(cmd).await? {
                    break;
                }
                continue;
            }

            let event = self.mux.poll_once().await;
            if !self.handle_event(event).await? {
                break;
            }
        }

        pf_info!("terminating at clock {}", self.clock.local());
        Ok(())
    }

    /// My process ID.
    pub fn id(&self) -> ProcessId {
        self.membership.me()
    }
}
