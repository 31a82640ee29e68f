//! `LibraryReplica` -- distributed lock acquisition and peer lock messages.

use super::*;

use crate::server::{Clock, LockState};

// LibraryReplica distributed locking
impl LibraryReplica {
    /// Requests the cluster-wide lock and waits until it is granted. The
    /// wait re-enters the poll step, so peer traffic and handshakes keep
    /// being handled; client commands arriving meanwhile are queued.
    /// Returns false iff termination was signalled while waiting.
    pub(super) async fn acquire(&mut self) -> Result<bool, LendsetError> {
        let stamp = self.mutex.request(&mut self.clock)?;
        pf_debug!("requesting lock at clock {}", stamp);
        self.broadcast(PeerMsg::Lock {
            pid: self.me,
            clock: stamp,
        })
        .await?;

        loop {
            if self.mutex.try_enter(&self.clock, self.membership.live()) {
                pf_debug!("entered critical section ({}, {})", stamp, self.me);
                return Ok(true);
            }

            let event = self.mux.poll_once().await;
            if !self.handle_event(event).await? {
                return Ok(false);
            }
        }
    }

    /// Leaves the critical section and tells every peer.
    pub(super) async fn release(&mut self) -> Result<(), LendsetError> {
        let stamp = self.mutex.release(&mut self.clock)?;
        pf_debug!("released lock at clock {}", stamp);
        self.broadcast(PeerMsg::Unlock {
            pid: self.me,
            clock: stamp,
        })
        .await
    }

    /// Handler of a peer `LOCK`.
    pub(super) async fn handle_lock(
        &mut self,
        peer: ProcessId,
        stamp: Clock,
    ) -> Result<(), LendsetError> {
        self.mutex.on_lock(&mut self.clock, peer, stamp)?;
        if self.config.require_acks {
            let clock = self.clock.advance_local();
            self.send_to(peer, &PeerMsg::Ack {
                pid: self.me,
                clock,
            })
            .await?;
        }
        Ok(())
    }

    /// Handler of a peer `UNLOCK`.
    pub(super) fn handle_unlock(
        &mut self,
        peer: ProcessId,
        stamp: Clock,
    ) -> Result<(), LendsetError> {
        self.mutex.on_unlock(&mut self.clock, peer, stamp)
    }

    /// Handler of a peer `ACK`.
    pub(super) fn handle_ack(
        &mut self,
        peer: ProcessId,
        stamp: Clock,
    ) -> Result<(), LendsetError> {
        self.mutex.on_ack(&mut self.clock, peer, stamp)
    }

    /// Sends my outstanding lock request, if any, to one peer.
    pub(super) async fn resend_request(
        &mut self,
        peer: ProcessId,
    ) -> Result<(), LendsetError> {
        let Some(stamp) = self.mutex.my_request() else {
            return Ok(());
        };
        debug_assert_ne!(self.mutex.state(), LockState::Idle);
        pf_debug!("re-sending lock request {} to peer {}", stamp, peer);
        self.send_to(peer, &PeerMsg::Lock {
            pid: self.me,
            clock: stamp,
        })
        .await
    }

    /// Handler of a peer handshake. The peer may have restarted, so forget
    /// its old request, make sure I have a link back to it, and re-send my
    /// own outstanding request over that link.
    pub(super) async fn handle_peer_hello(
        &mut self,
        conn: ConnId,
        peer: ProcessId,
    ) -> Result<(), LendsetError> {
        pf_info!("peer {} introduced itself on conn {}", peer, conn);
        self.mutex.reset_peer(peer)?;

        let was_live = self.membership.set_live(peer, true)?;
        if was_live && self.mux.has_link(peer) {
            return self.resend_request(peer).await;
        }
        // a fresh link re-sends the request itself
        if let Err(e) = self.connect_peer(peer).await {
            pf_warn!("cannot link back to peer {}: {}", peer, e);
        }
        Ok(())
    }
}

#[cfg(test)]
mod locking_tests {
    use crate::server::replica::replica_tests::lonely_replica;
    use crate::server::{LockState, PeerMsg};
    use crate::utils::LendsetError;

    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;

    #[tokio::test(flavor = "current_thread")]
    async fn dead_peers_do_not_block() -> Result<(), LendsetError> {
        let (mut replica, _tx_term) = lonely_replica(
            &[55010, 55011],
            0,
            1,
            "connect_retries = 0\nsync_on_join = false",
        )
        .await?;
        assert!(replica.acquire().await?);
        assert_eq!(replica.mutex.state(), LockState::InCritical);
        replica.release().await?;
        assert_eq!(replica.mutex.state(), LockState::Idle);
        Ok(())
    }

    #[tokio::test(flavor = "current_thread")]
    async fn lock_is_acked() -> Result<(), LendsetError> {
        // stand in for peer 1 with a bare listener
        let listener = TcpListener::bind("127.0.0.1:55021").await?;
        let (mut replica, _tx_term) = lonely_replica(
            &[55020, 55021],
            0,
            1,
            "sync_on_join = false",
        )
        .await?;
        let (stream, _) = listener.accept().await?;
        let mut lines = BufReader::new(stream).lines();
        assert_eq!(lines.next_line().await?, Some("0".into()));

        replica.handle_lock(1, 7).await?;
        assert!(replica.mutex.is_requesting(1));
        assert_eq!(lines.next_line().await?, Some("ACK 0 8".into()));

        replica.handle_unlock(1, 9)?;
        assert!(!replica.mutex.is_requesting(1));
        assert_eq!(replica.clock.get(1), 9);
        Ok(())
    }

    #[tokio::test(flavor = "current_thread")]
    async fn waits_for_peer_unlock() -> Result<(), LendsetError> {
        let listener = TcpListener::bind("127.0.0.1:55031").await?;
        let (mut replica, _tx_term) = lonely_replica(
            &[55030, 55031],
            0,
            1,
            "sync_on_join = false\npoll_timeout_ms = 20",
        )
        .await?;
        let (stream, _) = listener.accept().await?;
        let (read, _write) = stream.into_split();
        let mut lines = BufReader::new(read).lines();
        assert_eq!(lines.next_line().await?, Some("0".into()));

        // peer 1 holds an older request than mine
        replica.handle_lock(1, 1).await?;
        assert_eq!(lines.next_line().await?, Some("ACK 0 2".into()));

        let peer = async {
            // introduce myself as peer 1 and act like one
            let mut link = tokio::net::TcpStream::connect("127.0.0.1:55030").await?;
            link.write_all(b"1\n").await?;
            // the lock request broadcast, then its re-send after the hello
            assert_eq!(lines.next_line().await?, Some("LOCK 0 3".into()));
            assert_eq!(lines.next_line().await?, Some("LOCK 0 3".into()));
            link.write_all(b"LOCK 1 1\nACK 1 4\n").await?;
            assert_eq!(lines.next_line().await?, Some("ACK 0 4".into()));
            link.write_all(b"UNLOCK 1 6\n").await?;
            Ok::<_, LendsetError>(link)
        };

        let (granted, link) = tokio::join!(replica.acquire(), peer);
        assert!(granted?);
        let _link = link?;
        assert_eq!(replica.mutex.state(), LockState::InCritical);
        assert_eq!(replica.clock.get(1), 6);
        Ok(())
    }

    #[tokio::test(flavor = "current_thread")]
    async fn relink_resends_request() -> Result<(), LendsetError> {
        let listener = TcpListener::bind("127.0.0.1:55041").await?;
        let (mut replica, _tx_term) = lonely_replica(
            &[55040, 55041],
            0,
            1,
            "sync_on_join = false\nconnect_retries = 0",
        )
        .await?;
        let (stream, _) = listener.accept().await?;
        let mut old_lines = BufReader::new(stream).lines();
        assert_eq!(old_lines.next_line().await?, Some("0".into()));

        let stamp = replica.mutex.request(&mut replica.clock)?;
        replica.broadcast(PeerMsg::Lock { pid: 0, clock: stamp }).await?;
        assert_eq!(old_lines.next_line().await?, Some("LOCK 0 1".into()));

        // peer 1 was given up on, then speaks again; my hello on the new
        // link makes it forget my request, so the request must follow
        replica.membership.set_live(1, false)?;
        replica.handle_peer_line(1, "ACK 1 50").await?;
        assert!(replica.membership.is_live(1));

        let (stream, _) = listener.accept().await?;
        let mut new_lines = BufReader::new(stream).lines();
        assert_eq!(new_lines.next_line().await?, Some("0".into()));
        assert_eq!(new_lines.next_line().await?, Some("LOCK 0 1".into()));
        assert_eq!(replica.mutex.state(), LockState::Requesting);
        Ok(())
    }
}
