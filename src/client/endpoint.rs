//! Library client endpoint: holds one connection to a randomly picked server
//! and exchanges command/reply lines over it.

use std::net::SocketAddr;

use crate::utils::safetcp::{
    safe_line_read, safe_line_write, tcp_connect_with_retry,
};
use crate::utils::LendsetError;

use bytes::BytesMut;

use rand::seq::SliceRandom;

use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::time::{self, Duration};

/// Maximum reply line length accepted from a server.
const MAX_REPLY_LEN: usize = 1024;

/// Reply returned when no server can be reached.
pub(crate) const SYSTEM_DOWN: &str = "SYSTEM IS DOWN.";

/// Connection to the server currently in use.
#[derive(Debug)]
struct ServerConn {
    addr: SocketAddr,
    read: OwnedReadHalf,
    read_buf: BytesMut,
    write: OwnedWriteHalf,
}

/// Library client endpoint.
#[derive(Debug)]
pub struct LibraryClient {
    /// Addresses of all servers.
    servers: Vec<SocketAddr>,

    /// How long to wait for a reply.
    timeout: Duration,

    /// Current connection, if any.
    conn: Option<ServerConn>,

    /// Client ID assigned by the current server.
    id: Option<String>,
}

impl LibraryClient {
    /// Creates a new client endpoint. Does not connect yet.
    pub fn new(
        servers: Vec<SocketAddr>,
        timeout: Duration,
    ) -> Result<Self, LendsetError> {
        if servers.is_empty() {
            return Err(LendsetError::msg("empty servers list"));
        }
        if timeout.is_zero() {
            return Err(LendsetError::msg("invalid zero reply timeout"));
        }
        Ok(LibraryClient {
            servers,
            timeout,
            conn: None,
            id: None,
        })
    }

    /// Client ID assigned by the server I am connected to.
    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    /// Address of the server I am connected to.
    pub fn server(&self) -> Option<SocketAddr> {
        self.conn.as_ref().map(|c| c.addr)
    }

    /// Reads one reply line, bounded by the reply timeout. `Ok(None)` means
    /// the timeout elapsed.
    async fn recv_line(
        conn: &mut ServerConn,
        timeout: Duration,
    ) -> Result<Option<String>, LendsetError> {
        match time::timeout(
            timeout,
            safe_line_read(&mut conn.read_buf, &mut conn.read, MAX_REPLY_LEN),
        )
        .await
        {
            Ok(Ok(Some(line))) => Ok(Some(line)),
            Ok(Ok(None)) => Err(LendsetError::msg("server closed connection")),
            Ok(Err(e)) => Err(e),
            Err(_) => Ok(None),
        }
    }

    /// Performs the client handshake with one server.
    async fn handshake(
        addr: SocketAddr,
        timeout: Duration,
    ) -> Result<(ServerConn, String), LendsetError> {
        let stream = tcp_connect_with_retry(addr, 0, Duration::ZERO).await?;
        let (read, write) = stream.into_split();
        let mut conn = ServerConn {
            addr,
            read,
            read_buf: BytesMut::new(),
            write,
        };

        safe_line_write(&mut conn.write, "client").await?;
        match Self::recv_line(&mut conn, timeout).await? {
            Some(id) => Ok((conn, id)),
            None => Err(LendsetError::msg("handshake timed out")),
        }
    }

    /// Connects to the first reachable server in random order and records
    /// the client ID it assigns. Drops any previous connection.
    pub async fn connect(&mut self) -> Result<(), LendsetError> {
        self.conn = None;
        self.id = None;

        let mut order = self.servers.clone();
        order.shuffle(&mut rand::thread_rng());
        for addr in order {
            match Self::handshake(addr, self.timeout).await {
                Ok((conn, id)) => {
                    pf_info!("connected to {} as {}", addr, id);
                    self.conn = Some(conn);
                    self.id = Some(id);
                    return Ok(());
                }
                Err(e) => {
                    pf_warn!("cannot connect to {}: {}", addr, e);
                }
            }
        }
        Err(LendsetError::msg(SYSTEM_DOWN))
    }

    /// One command/reply exchange over the current connection. A timed out
    /// exchange drops the connection, since its reply may still arrive and
    /// would then be taken for the reply to the next command.
    async fn exchange(
        &mut self,
        cmd: &str,
    ) -> Result<Option<String>, LendsetError> {
        let timeout = self.timeout;
        let Some(conn) = self.conn.as_mut() else {
            return Err(LendsetError::msg("not connected"));
        };
        safe_line_write(&mut conn.write, cmd).await?;
        let reply = Self::recv_line(conn, timeout).await?;
        if reply.is_none() {
            pf_warn!(
                "no reply to '{}' from {} in time, dropping connection",
                cmd,
                conn.addr
            );
            self.conn = None;
            self.id = None;
        }
        Ok(reply)
    }

    /// Sends a command and waits for its reply. `Ok(None)` means no reply
    /// arrived within the timeout; the next command then goes over a new
    /// connection. On a transport failure, reconnects once and retries; if
    /// that fails as well, returns the system-down error.
    pub async fn send_cmd(
        &mut self,
        cmd: &str,
    ) -> Result<Option<String>, LendsetError> {
        if self.conn.is_none() {
            self.connect().await?;
        }
        match self.exchange(cmd).await {
            Ok(reply) => Ok(reply),
            Err(e) => {
                pf_warn!("lost server: {}", e);
                self.connect().await?;
                self.exchange(cmd)
                    .await
                    .map_err(|_| LendsetError::msg(SYSTEM_DOWN))
            }
        }
    }
}

#[cfg(test)]
mod endpoint_tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;

    /// Serves one client session with canned behavior: assigns `id`, then
    /// answers every command by echoing it prefixed with the id.
    async fn fake_server(listener: TcpListener, id: &str) -> Result<(), LendsetError> {
        let (stream, _) = listener.accept().await?;
        let (read, mut write) = stream.into_split();
        let mut lines = BufReader::new(read).lines();
        assert_eq!(lines.next_line().await?, Some("client".into()));
        write.write_all(format!("{}\n", id).as_bytes()).await?;
        while let Some(line) = lines.next_line().await? {
            if line == "hang up" {
                break;
            }
            write.write_all(format!("{} {}\n", id, line).as_bytes()).await?;
        }
        Ok(())
    }

    #[test]
    fn new_invalid() {
        assert!(LibraryClient::new(vec![], Duration::from_secs(1)).is_err());
        assert!(LibraryClient::new(
            vec!["127.0.0.1:1".parse().unwrap()],
            Duration::ZERO
        )
        .is_err());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn connect_and_send() -> Result<(), LendsetError> {
        let listener = TcpListener::bind("127.0.0.1:55310").await?;
        let server = fake_server(listener, "c7");
        let client = async {
            let mut client = LibraryClient::new(
                vec![
                    "127.0.0.1:55310".parse()?,
                    "127.0.0.1:55319".parse()?, // nobody there
                ],
                Duration::from_secs(2),
            )?;
            client.connect().await?;
            assert_eq!(client.id(), Some("c7"));
            assert_eq!(client.server(), Some("127.0.0.1:55310".parse::<SocketAddr>()?));
            assert_eq!(
                client.send_cmd("reserve c7 b0").await?,
                Some("c7 reserve c7 b0".into())
            );
            client.send_cmd("hang up").await.map(|_| ())
        };
        let (served, sent) = tokio::join!(server, client);
        served?;
        // the only live server hung up, so the retry finds nobody
        assert_eq!(sent, Err(LendsetError::msg(SYSTEM_DOWN)));
        Ok(())
    }

    #[tokio::test(flavor = "current_thread")]
    async fn reply_timeout() -> Result<(), LendsetError> {
        let listener = TcpListener::bind("127.0.0.1:55320").await?;
        let server = async {
            let (stream, _) = listener.accept().await?;
            let (read, mut write) = stream.into_split();
            let mut lines = BufReader::new(read).lines();
            lines.next_line().await?;
            write.write_all(b"c1\n").await?;
            // never answer commands
            lines.next_line().await?;
            time::sleep(Duration::from_millis(300)).await;
            Ok::<(), LendsetError>(())
        };
        let client = async {
            let mut client = LibraryClient::new(
                vec!["127.0.0.1:55320".parse()?],
                Duration::from_millis(100),
            )?;
            client.connect().await?;
            client.send_cmd("reserve c1 b0").await
        };
        let (served, sent) = tokio::join!(server, client);
        served?;
        assert_eq!(sent?, None);
        Ok(())
    }

    #[tokio::test(flavor = "current_thread")]
    async fn late_reply_not_mistaken() -> Result<(), LendsetError> {
        let listener = TcpListener::bind("127.0.0.1:55340").await?;
        let server = async {
            let (stream, _) = listener.accept().await?;
            let (read, mut write) = stream.into_split();
            let mut lines = BufReader::new(read).lines();
            lines.next_line().await?;
            write.write_all(b"c1\n").await?;
            let slow = lines.next_line().await?;

            let answer_late = async {
                time::sleep(Duration::from_millis(300)).await;
                // the client may have hung up already
                let late = format!("late {}\n", slow.unwrap_or_default());
                let _ = write.write_all(late.as_bytes()).await;
            };
            let answer_fresh = async {
                let (stream, _) = listener.accept().await?;
                let (read, mut write) = stream.into_split();
                let mut lines = BufReader::new(read).lines();
                lines.next_line().await?;
                write.write_all(b"c2\n").await?;
                while let Some(line) = lines.next_line().await? {
                    write.write_all(format!("c2 {}\n", line).as_bytes()).await?;
                }
                Ok::<(), LendsetError>(())
            };
            let ((), fresh) = tokio::join!(answer_late, answer_fresh);
            fresh
        };
        let client = async {
            let mut client = LibraryClient::new(
                vec!["127.0.0.1:55340".parse()?],
                Duration::from_millis(100),
            )?;
            client.connect().await?;
            assert_eq!(client.send_cmd("reserve c1 b0").await?, None);
            assert_eq!(client.id(), None);

            let reply = client.send_cmd("return c1 b0").await?;
            assert_eq!(reply, Some("c2 return c1 b0".into()));
            assert_eq!(client.id(), Some("c2"));

            // wait past the stale answer; it must not show up anywhere
            time::sleep(Duration::from_millis(400)).await;
            let reply = client.send_cmd("reserve c2 b1").await?;
            assert_eq!(reply, Some("c2 reserve c2 b1".into()));
            Ok::<(), LendsetError>(())
        };
        // the second session ends when the client is dropped
        let (served, sent) = tokio::join!(server, client);
        sent?;
        served
    }

    #[tokio::test(flavor = "current_thread")]
    async fn nobody_home() -> Result<(), LendsetError> {
        let mut client = LibraryClient::new(
            vec!["127.0.0.1:55330".parse()?],
            Duration::from_millis(100),
        )?;
        assert_eq!(client.connect().await, Err(LendsetError::msg(SYSTEM_DOWN)));
        assert_eq!(client.id(), None);
        Ok(())
    }
}
