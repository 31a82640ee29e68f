//! `LibraryReplica` -- client sessions and command entrance.

use super::*;

use crate::server::{ClientCmd, Op, Outcome, Reply};

// LibraryReplica client requests entrance
impl LibraryReplica {
    /// Makes the next cluster-unique client ID. Sequence numbers are
    /// interleaved by process ID so no two processes ever hand out the same.
    fn next_client_id(&mut self) -> String {
        let population = self.membership.population() as u64;
        let seq = self.clients_assigned * population + self.me as u64 + 1;
        self.clients_assigned += 1;
        format!("c{}", seq)
    }

    /// Handler of a client handshake: assigns an ID, sends it back, and
    /// tells peers the new client count.
    pub(super) async fn handle_client_hello(
        &mut self,
        conn: ConnId,
    ) -> Result<(), LendsetError> {
        let client = self.next_client_id();
        if let Err(e) = self.mux.admit_client(conn, &client).await {
            pf_warn!("error admitting client on conn {}: {}", conn, e);
            return Ok(());
        }
        pf_info!("client {} joined on conn {}", client, conn);

        self.client_counts[self.me as usize] = self.clients_assigned;
        let clock = self.clock.advance_local();
        self.broadcast(PeerMsg::ClientCount {
            pid: self.me,
            count: self.clients_assigned,
            clock,
        })
        .await
    }

    /// Serves one queued client command: acquire the distributed lock,
    /// apply, replicate, release, then reply. Returns false iff termination
    /// was signalled while waiting for the lock.
    pub(super) async fn serve_client_cmd(
        &mut self,
        cmd: DeferredCmd,
    ) -> Result<bool, LendsetError> {
        let ClientCmd { op, client, item } = match ClientCmd::parse(&cmd.line) {
            Ok(parsed) => parsed,
            Err(e) => {
                pf_debug!("invalid command '{}': {}", cmd.line, e);
                self.send_reply(cmd.conn, Reply::Invalid).await;
                return Ok(true);
            }
        };

        if !self.acquire().await? {
            return Ok(false);
        }

        let outcome = self.catalog.apply(&client, &item, op);
        pf_debug!(
            "{} {} {} -> {:?}, now {:?}",
            op,
            client,
            item,
            outcome,
            self.catalog.status(&item)
        );
        if outcome == Outcome::Committed {
            self.replicate(op, &client, &item).await?;
        }

        self.release().await?;

        let reply = match (outcome, op) {
            (Outcome::Committed, Op::Reserve) => Reply::Reserved { client, item },
            (Outcome::Committed, Op::Return) => Reply::Freed { client, item },
            (Outcome::Rejected, _) => Reply::Failed { client, item },
        };
        self.send_reply(cmd.conn, reply).await;
        Ok(true)
    }

    /// Writes a reply to a client; a failure only drops that client.
    async fn send_reply(&mut self, conn: ConnId, reply: Reply) {
        if let Err(e) = self.mux.reply(conn, &reply.to_string()).await {
            pf_warn!("error replying to conn {}: {}", conn, e);
        }
    }
}

#[cfg(test)]
mod request_tests {
    use crate::server::replica::replica_tests::lonely_replica;
    use crate::server::replica::DeferredCmd;
    use crate::server::{ConnId, ItemStatus, LockState};
    use crate::utils::LendsetError;

    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::time::{self, Duration};

    #[tokio::test(flavor = "current_thread")]
    async fn client_ids_interleave() -> Result<(), LendsetError> {
        let (mut replica, _tx_term) = lonely_replica(
            &[54910, 54911, 54912],
            2,
            1,
            "connect_retries = 0\nsync_on_join = false",
        )
        .await?;
        assert_eq!(replica.next_client_id(), "c3");
        assert_eq!(replica.next_client_id(), "c6");
        assert_eq!(replica.next_client_id(), "c9");
        Ok(())
    }

    #[tokio::test(flavor = "current_thread")]
    async fn single_process_scenario() -> Result<(), LendsetError> {
        let (mut replica, tx_term) =
            lonely_replica(&[54920], 0, 3, "poll_timeout_ms = 20").await?;

        let driver = async {
            let stream = TcpStream::connect("127.0.0.1:54920").await?;
            let (read, mut write) = stream.into_split();
            let mut lines = BufReader::new(read).lines();

            write.write_all(b"client\n").await?;
            assert_eq!(lines.next_line().await?, Some("c1".into()));

            for (cmd, expected) in [
                ("reserve c1 b0", "c1 b0"),
                ("reserve c2 b0", "fail c2 b0"),
                ("return c2 b0", "fail c2 b0"),
                ("return c1 b0", "free c1 b0"),
                ("return c1 b0", "fail c1 b0"),
                ("borrow c1 b0", "Invalid command."),
                ("reserve c1 b9", "fail c1 b9"),
                ("reserve c1 b1", "c1 b1"),
            ] {
                write.write_all(format!("{}\n", cmd).as_bytes()).await?;
                assert_eq!(lines.next_line().await?, Some(expected.into()));
            }

            // garbled bytes are answered, and the session stays usable
            write.write_all(b"reserve c1 b\xff\n").await?;
            assert_eq!(lines.next_line().await?, Some("Invalid command.".into()));
            write.write_all(b"return c1 b1\n").await?;
            assert_eq!(lines.next_line().await?, Some("free c1 b1".into()));
            write.write_all(b"reserve c1 b1\n").await?;
            assert_eq!(lines.next_line().await?, Some("c1 b1".into()));

            tx_term.send(true)?;
            Ok::<(), LendsetError>(())
        };

        let (served, driven) = tokio::join!(replica.run(), driver);
        served?;
        driven?;

        assert_eq!(replica.catalog.status("b0"), Some(&ItemStatus::Free));
        assert_eq!(
            replica.catalog.status("b1"),
            Some(&ItemStatus::Reserved("c1".into()))
        );
        assert_eq!(replica.catalog.version(), 5);
        Ok(())
    }

    #[tokio::test(flavor = "current_thread")]
    async fn peer_sees_lock_order() -> Result<(), LendsetError> {
        let listener = TcpListener::bind("127.0.0.1:54931").await?;
        let (mut replica, _tx_term) = lonely_replica(
            &[54930, 54931],
            0,
            1,
            "sync_on_join = false\nrequire_acks = false",
        )
        .await?;
        let (stream, _) = listener.accept().await?;
        let mut lines = BufReader::new(stream).lines();
        assert_eq!(lines.next_line().await?, Some("0".into()));

        // no client sits on that conn, so only the peer traffic is observed
        let committed = DeferredCmd {
            conn: ConnId::MAX,
            line: "reserve c1 b0".into(),
        };
        assert!(replica.serve_client_cmd(committed).await?);
        assert_eq!(lines.next_line().await?, Some("LOCK 0 1".into()));
        assert_eq!(
            lines.next_line().await?,
            Some("COMMAND 0 2 reserve c1 b0".into())
        );
        assert_eq!(lines.next_line().await?, Some("UNLOCK 0 3".into()));

        let rejected = DeferredCmd {
            conn: ConnId::MAX,
            line: "return c2 b0".into(),
        };
        assert!(replica.serve_client_cmd(rejected).await?);
        assert_eq!(lines.next_line().await?, Some("LOCK 0 4".into()));
        assert_eq!(lines.next_line().await?, Some("UNLOCK 0 5".into()));
        assert!(
            time::timeout(Duration::from_millis(100), lines.next_line())
                .await
                .is_err()
        );

        assert_eq!(replica.mutex.state(), LockState::Idle);
        assert_eq!(
            replica.catalog.status("b0"),
            Some(&ItemStatus::Reserved("c1".into()))
        );
        Ok(())
    }

    #[tokio::test(flavor = "current_thread")]
    async fn invalid_command_skips_lock() -> Result<(), LendsetError> {
        let listener = TcpListener::bind("127.0.0.1:54941").await?;
        let (mut replica, _tx_term) = lonely_replica(
            &[54940, 54941],
            0,
            1,
            "sync_on_join = false\nrequire_acks = false",
        )
        .await?;
        let (stream, _) = listener.accept().await?;
        let mut lines = BufReader::new(stream).lines();
        assert_eq!(lines.next_line().await?, Some("0".into()));

        let invalid = DeferredCmd {
            conn: ConnId::MAX,
            line: "borrow c1 b0".into(),
        };
        assert!(replica.serve_client_cmd(invalid).await?);
        assert!(
            time::timeout(Duration::from_millis(100), lines.next_line())
                .await
                .is_err()
        );
        assert_eq!(replica.clock.local(), 0);
        Ok(())
    }
}
