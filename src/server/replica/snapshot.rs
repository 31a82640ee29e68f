//! `LibraryReplica` -- full catalog state transfer for joining peers.

use super::*;

use crate::server::{Clock, Snapshot};

// LibraryReplica state transfer
impl LibraryReplica {
    /// Handler of a peer `SYNC`: answer with my full catalog.
    pub(super) async fn handle_sync(
        &mut self,
        peer: ProcessId,
        clock: Clock,
    ) -> Result<(), LendsetError> {
        self.clock.observe(peer, clock);
        let clock = self.clock.advance_local();
        pf_debug!(
            "sending catalog version {} to peer {}",
            self.catalog.version(),
            peer
        );
        self.send_to(peer, &PeerMsg::State {
            pid: self.me,
            clock,
            version: self.catalog.version(),
            snapshot: self.catalog.snapshot(),
        })
        .await
    }

    /// Handler of a peer `STATE`: adopt it if it is newer than mine.
    pub(super) fn handle_state(
        &mut self,
        peer: ProcessId,
        clock: Clock,
        version: u64,
        snapshot: Snapshot,
    ) -> Result<(), LendsetError> {
        self.clock.observe(peer, clock);
        if version <= self.catalog.version() {
            pf_debug!(
                "ignoring catalog version {} from peer {}, mine is {}",
                version,
                peer,
                self.catalog.version()
            );
            return Ok(());
        }

        if let Err(e) = self.catalog.restore(version, snapshot) {
            pf_warn!("bad catalog snapshot from peer {}: {}", peer, e);
            return Ok(());
        }
        pf_info!("adopted catalog version {} from peer {}", version, peer);
        Ok(())
    }
}
