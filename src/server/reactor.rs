//! Connection multiplexer: a single-threaded reactor over the listening
//! socket and every accepted or initiated connection.
//!
//! Each connection's read half is turned into a stream of lines; all these
//! streams are merged into one `SelectAll`, so one `poll_once()` step waits
//! on every socket at once without spawning a task per connection. Writes
//! are awaited in place when a handler sends something.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::pin::Pin;

use crate::server::{Handshake, ProcessId};
use crate::utils::safetcp::{
    safe_line_read, safe_line_write, tcp_bind_with_retry,
    tcp_connect_with_retry,
};
use crate::utils::{LendsetError, Timer};

use bytes::BytesMut;

use futures::stream::{self, AbortHandle, Abortable, SelectAll, Stream};
use futures::StreamExt;

use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::Duration;

/// Connection ID type, local to this process.
pub(crate) type ConnId = u64;

type LineStream =
    Pin<Box<dyn Stream<Item = (ConnId, Result<Option<String>, LendsetError>)>>>;

/// Who is on the other end of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Origin {
    /// Accepted, handshake not received yet.
    Unknown,

    /// Accepted client session with its assigned ID (empty until admitted).
    Client(String),

    /// Accepted connection from a peer; it only sends to us.
    Peer(ProcessId),

    /// Connection we initiated to a peer; we only send on it.
    Outbound(ProcessId),
}

/// Per-connection bookkeeping.
#[derive(Debug)]
struct Conn {
    origin: Origin,
    writer: OwnedWriteHalf,
    abort: AbortHandle,
}

/// Outcome of one poll step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum PollEvent {
    /// A new connection was accepted.
    Accepted(ConnId),

    /// A connection identified itself as a client; it must be admitted.
    ClientHello(ConnId),

    /// A connection identified itself as the given peer.
    PeerHello { conn: ConnId, pid: ProcessId },

    /// A line arrived from an admitted client.
    ClientLine {
        conn: ConnId,
        client: String,
        line: String,
    },

    /// A line arrived from a peer.
    PeerLine { pid: ProcessId, line: String },

    /// A connection was closed; `peer` is set if it was the current link
    /// to or from that peer.
    Closed {
        conn: ConnId,
        peer: Option<ProcessId>,
    },

    /// Nothing happened within the poll timeout.
    Idle,

    /// Termination was signalled.
    Terminate,
}

/// Connection multiplexer.
pub(crate) struct Multiplexer {
    /// My process ID.
    me: ProcessId,

    /// Cluster size.
    population: u8,

    /// Listener for both clients and peers.
    listener: TcpListener,

    /// Merged line streams of all connections.
    readers: SelectAll<Abortable<LineStream>>,

    /// Map from connection ID -> connection state.
    conns: HashMap<ConnId, Conn>,

    /// Map from peer ID -> connection I send to it on.
    outbound: HashMap<ProcessId, ConnId>,

    /// Map from peer ID -> latest connection it sends to me on.
    inbound: HashMap<ProcessId, ConnId>,

    /// Next connection ID to hand out.
    next_conn: ConnId,

    /// Maximum accepted line length in bytes.
    max_line_len: usize,

    /// Upper bound of a single poll step.
    poll_timeout: Duration,
    poll_timer: Timer,

    /// Termination signal receiver.
    rx_term: watch::Receiver<bool>,
}

// Multiplexer setup and connection management
impl Multiplexer {
    /// Binds the listener and creates the multiplexer.
    pub(crate) async fn new_and_setup(
        me: ProcessId,
        population: u8,
        bind_addr: SocketAddr,
        max_line_len: usize,
        poll_timeout: Duration,
        rx_term: watch::Receiver<bool>,
    ) -> Result<Self, LendsetError> {
        if max_line_len == 0 {
            return logged_err!("invalid max_line_len {}", max_line_len);
        }
        if poll_timeout.is_zero() {
            return logged_err!("invalid zero poll timeout");
        }

        let listener = tcp_bind_with_retry(bind_addr, 10).await?;
        pf_info!("listening on port {}", bind_addr.port());

        Ok(Multiplexer {
            me,
            population,
            listener,
            readers: SelectAll::new(),
            conns: HashMap::new(),
            outbound: HashMap::new(),
            inbound: HashMap::new(),
            next_conn: 0,
            max_line_len,
            poll_timeout,
            poll_timer: Timer::new(),
            rx_term,
        })
    }

    /// Splits a stream and registers both halves under a fresh ID.
    fn add_conn(&mut self, stream: TcpStream, origin: Origin) -> ConnId {
        let conn = self.next_conn;
        self.next_conn += 1;

        let (read, writer) = stream.into_split();
        let (abort, reg) = AbortHandle::new_pair();
        self.readers.push(Abortable::new(
            Self::line_stream(conn, read, self.max_line_len),
            reg,
        ));
        self.conns.insert(
            conn,
            Conn {
                origin,
                writer,
                abort,
            },
        );
        conn
    }

    /// Turns a read half into a stream of lines, ending after EOF or the
    /// first error (both of which are yielded).
    fn line_stream(conn: ConnId, read: OwnedReadHalf, max_len: usize) -> LineStream {
        Box::pin(stream::unfold(
            Some((read, BytesMut::new())),
            move |state| async move {
                let (mut read, mut read_buf) = state?;
                let result = safe_line_read(&mut read_buf, &mut read, max_len).await;
                let next = match result {
                    Ok(Some(_)) => Some((read, read_buf)),
                    _ => None,
                };
                Some(((conn, result), next))
            },
        ))
    }

    /// Drops a connection. Returns the peer it was the current link of.
    pub(crate) fn close(&mut self, conn: ConnId) -> Option<ProcessId> {
        let entry = self.conns.remove(&conn)?;
        entry.abort.abort();

        match entry.origin {
            Origin::Outbound(pid) if self.outbound.get(&pid) == Some(&conn) => {
                self.outbound.remove(&pid);
                Some(pid)
            }
            Origin::Peer(pid) if self.inbound.get(&pid) == Some(&conn) => {
                self.inbound.remove(&pid);
                Some(pid)
            }
            _ => None,
        }
    }

    /// Connects to a peer and introduces myself by sending my ID. Replaces
    /// any previous outbound link to that peer.
    pub(crate) async fn connect_peer(
        &mut self,
        pid: ProcessId,
        addr: SocketAddr,
        retries: u8,
        interval: Duration,
    ) -> Result<(), LendsetError> {
        if pid == self.me || pid >= self.population {
            return logged_err!("invalid peer ID {} to connect", pid);
        }

        let stream = tcp_connect_with_retry(addr, retries, interval).await?;
        if let Some(old) = self.outbound.remove(&pid) {
            self.close(old);
        }
        let conn = self.add_conn(stream, Origin::Outbound(pid));
        self.outbound.insert(pid, conn);

        let hello = self.me.to_string();
        if let Err(e) = self.send_conn(conn, &hello).await {
            self.close(conn);
            return Err(e);
        }
        pf_info!("connected to peer {} at {}", pid, addr);
        Ok(())
    }

    /// Do I have an outbound link to the peer?
    #[inline]
    pub(crate) fn has_link(&self, pid: ProcessId) -> bool {
        self.outbound.contains_key(&pid)
    }

    /// Marks a client connection as admitted under the given ID and sends
    /// the ID back to it.
    pub(crate) async fn admit_client(
        &mut self,
        conn: ConnId,
        client: &str,
    ) -> Result<(), LendsetError> {
        match self.conns.get_mut(&conn) {
            Some(entry) if entry.origin == Origin::Client(String::new()) => {
                entry.origin = Origin::Client(client.to_string());
            }
            _ => return logged_err!("conn {} is not a pending client", conn),
        }
        self.send_conn(conn, client).await
    }
}

// Multiplexer sending and polling
impl Multiplexer {
    /// Writes one line to a connection. On failure the connection is
    /// dropped before the error is returned.
    async fn send_conn(&mut self, conn: ConnId, line: &str) -> Result<(), LendsetError> {
        let Some(entry) = self.conns.get_mut(&conn) else {
            return Err(LendsetError::msg(format!("conn {} not found", conn)));
        };

        pf_trace!("send <{}> '{}'", conn, line);
        if let Err(e) = safe_line_write(&mut entry.writer, line).await {
            self.close(conn);
            return Err(e);
        }
        Ok(())
    }

    /// Sends one line to a peer over my outbound link to it.
    pub(crate) async fn send_peer(
        &mut self,
        pid: ProcessId,
        line: &str,
    ) -> Result<(), LendsetError> {
        let Some(&conn) = self.outbound.get(&pid) else {
            return Err(LendsetError::msg(format!("no link to peer {}", pid)));
        };
        self.send_conn(conn, line).await
    }

    /// Sends a reply line to a client connection.
    pub(crate) async fn reply(
        &mut self,
        conn: ConnId,
        line: &str,
    ) -> Result<(), LendsetError> {
        self.send_conn(conn, line).await
    }

    /// Waits until one connection produces something, a new connection
    /// arrives, termination is signalled, or the poll timeout elapses.
    pub(crate) async fn poll_once(&mut self) -> PollEvent {
        if let Err(e) = self.poll_timer.restart(self.poll_timeout) {
            pf_error!("error restarting poll timer: {}", e);
        }

        tokio::select! {
            accepted = self.listener.accept() => {
                match accepted {
                    Ok((stream, addr)) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            pf_warn!("error setting nodelay for {}: {}", addr, e);
                        }
                        let conn = self.add_conn(stream, Origin::Unknown);
                        pf_debug!("accepted conn {} from {}", conn, addr);
                        PollEvent::Accepted(conn)
                    }
                    Err(e) => {
                        pf_warn!("error accepting connection: {}", e);
                        PollEvent::Idle
                    }
                }
            },

            Some((conn, result)) = self.readers.next(), if !self.readers.is_empty() => {
                self.handle_read(conn, result)
            },

            _ = self.poll_timer.timeout() => PollEvent::Idle,

            _ = self.rx_term.changed() => PollEvent::Terminate,
        }
    }

    /// Interprets one read result according to the connection's origin.
    fn handle_read(
        &mut self,
        conn: ConnId,
        result: Result<Option<String>, LendsetError>,
    ) -> PollEvent {
        let Some(origin) = self.conns.get(&conn).map(|e| e.origin.clone()) else {
            // already dropped by us
            return PollEvent::Idle;
        };

        let line = match result {
            Ok(Some(line)) => line,
            Ok(None) => {
                pf_debug!("conn {} closed by remote", conn);
                let peer = self.close(conn);
                return PollEvent::Closed { conn, peer };
            }
            Err(e) => {
                pf_warn!("error reading conn {}: {}", conn, e);
                let peer = self.close(conn);
                return PollEvent::Closed { conn, peer };
            }
        };
        pf_trace!("recv <{}> '{}'", conn, line);

        match origin {
            Origin::Unknown => {
                match Handshake::parse(&line, self.me, self.population) {
                    Ok(Handshake::Client) => {
                        self.set_origin(conn, Origin::Client(String::new()));
                        PollEvent::ClientHello(conn)
                    }
                    Ok(Handshake::Peer(pid)) => {
                        self.set_origin(conn, Origin::Peer(pid));
                        self.inbound.insert(pid, conn);
                        PollEvent::PeerHello { conn, pid }
                    }
                    Err(e) => {
                        pf_warn!("dropping conn {}: {}", conn, e);
                        self.close(conn);
                        PollEvent::Closed { conn, peer: None }
                    }
                }
            }
            Origin::Client(client) => PollEvent::ClientLine { conn, client, line },
            Origin::Peer(pid) => PollEvent::PeerLine { pid, line },
            Origin::Outbound(pid) => {
                pf_warn!("unexpected line from peer {} on my link: '{}'", pid, line);
                PollEvent::Idle
            }
        }
    }

    fn set_origin(&mut self, conn: ConnId, origin: Origin) {
        if let Some(entry) = self.conns.get_mut(&conn) {
            entry.origin = origin;
        }
    }
}
