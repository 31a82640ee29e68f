//! `LibraryReplica` -- replication of committed commands and peer message
//! dispatch.

use super::*;

use crate::server::{Clock, Op, Outcome};

// LibraryReplica replication protocol
impl LibraryReplica {
    /// Pushes a locally committed mutation to every peer. Called inside the
    /// critical section, before the lock is released.
    pub(super) async fn replicate(
        &mut self,
        op: Op,
        client: &str,
        item: &str,
    ) -> Result<(), LendsetError> {
        let clock = self.clock.advance_local();
        self.broadcast(PeerMsg::Command {
            pid: self.me,
            clock,
            op,
            client: client.into(),
            item: item.into(),
        })
        .await
    }

    /// Handler of a peer `COMMAND`: replay it directly, since the sender
    /// already serialized it under the lock.
    fn handle_command(
        &mut self,
        peer: ProcessId,
        clock: Clock,
        op: Op,
        client: &str,
        item: &str,
    ) {
        self.clock.observe(peer, clock);
        match self.catalog.apply(client, item, op) {
            Outcome::Committed => {
                pf_debug!("replayed {} {} {} from peer {}", op, client, item, peer);
            }
            Outcome::Rejected => {
                pf_warn!(
                    "catalog diverged: {} {} {} from peer {} rejected",
                    op,
                    client,
                    item,
                    peer
                );
            }
        }
    }

    /// Handler of a peer `CLIENT_COUNT`.
    fn handle_client_count(&mut self, peer: ProcessId, count: u64, clock: Clock) {
        self.clock.observe(peer, clock);
        if let Some(slot) = self.client_counts.get_mut(peer as usize) {
            *slot = (*slot).max(count);
        }
        pf_debug!(
            "peer {} has {} clients, {} in total",
            peer,
            count,
            self.client_counts.iter().sum::<u64>()
        );
    }

    /// Handler of one line received from a peer. Malformed or spoofed
    /// messages are logged and ignored.
    pub(super) async fn handle_peer_line(
        &mut self,
        peer: ProcessId,
        line: &str,
    ) -> Result<(), LendsetError> {
        let msg = match PeerMsg::decode(line) {
            Ok(msg) => msg,
            Err(e) => {
                pf_warn!("ignoring bad message from peer {}: {}", peer, e);
                return Ok(());
            }
        };
        if msg.pid() != peer {
            pf_warn!(
                "ignoring message claiming pid {} on link of peer {}",
                msg.pid(),
                peer
            );
            return Ok(());
        }

        pf_trace!("peer {} message stamped {}", peer, msg.clock());

        // a peer I believed dead is evidently up; link back to it
        if !self.membership.is_live(peer) {
            pf_info!("heard from unreachable peer {}, reconnecting", peer);
            if let Err(e) = self.connect_peer(peer).await {
                pf_warn!("cannot link back to peer {}: {}", peer, e);
            }
        }

        match msg {
            PeerMsg::Lock { clock, .. } => self.handle_lock(peer, clock).await,
            PeerMsg::Unlock { clock, .. } => self.handle_unlock(peer, clock),
            PeerMsg::Ack { clock, .. } => self.handle_ack(peer, clock),
            PeerMsg::Command {
                clock,
                op,
                client,
                item,
                ..
            } => {
                self.handle_command(peer, clock, op, &client, &item);
                Ok(())
            }
            PeerMsg::ClientCount { count, clock, .. } => {
                self.handle_client_count(peer, count, clock);
                Ok(())
            }
            PeerMsg::Sync { clock, .. } => self.handle_sync(peer, clock).await,
            PeerMsg::State {
                clock,
                version,
                snapshot,
                ..
            } => self.handle_state(peer, clock, version, snapshot),
        }
    }
}
