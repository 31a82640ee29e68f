//! Line-oriented wire codec: handshakes, client commands and replies, and
//! peer coordination/replication messages. One message per line, tokens
//! separated by whitespace.

use std::fmt;
use std::str::SplitWhitespace;

use crate::server::{Clock, Op, ProcessId, Snapshot};
use crate::utils::LendsetError;

/// First line received on a freshly accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Handshake {
    Client,
    Peer(ProcessId),
}

impl Handshake {
    /// Parses a handshake line; a peer ID must be in range and not mine.
    pub(crate) fn parse(
        line: &str,
        me: ProcessId,
        population: u8,
    ) -> Result<Self, LendsetError> {
        let line = line.trim();
        if line == "client" {
            return Ok(Handshake::Client);
        }
        match line.parse::<ProcessId>() {
            Ok(pid) if pid < population && pid != me => Ok(Handshake::Peer(pid)),
            _ => Err(LendsetError::msg(format!("invalid handshake '{}'", line))),
        }
    }
}

/// Client command `<op> <clientId> <itemId>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ClientCmd {
    pub(crate) op: Op,
    pub(crate) client: String,
    pub(crate) item: String,
}

impl ClientCmd {
    /// Parses a client command; exactly three tokens are expected. A line
    /// that arrived as invalid UTF-8 is rejected.
    pub(crate) fn parse(line: &str) -> Result<Self, LendsetError> {
        if line.contains(char::REPLACEMENT_CHARACTER) {
            return Err(LendsetError::msg("command is not valid UTF-8"));
        }
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let [op, client, item] = tokens[..] else {
            return Err(LendsetError::msg(format!(
                "expected 3 tokens, got {}",
                tokens.len()
            )));
        };
        Ok(ClientCmd {
            op: op.parse()?,
            client: client.into(),
            item: item.into(),
        })
    }
}

/// Reply line sent back to a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Reply {
    Reserved { client: String, item: String },
    Freed { client: String, item: String },
    Failed { client: String, item: String },
    Invalid,
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Reply::Reserved { client, item } => write!(f, "{} {}", client, item),
            Reply::Freed { client, item } => {
                write!(f, "free {} {}", client, item)
            }
            Reply::Failed { client, item } => {
                write!(f, "fail {} {}", client, item)
            }
            Reply::Invalid => write!(f, "Invalid command."),
        }
    }
}

/// Peer-to-peer message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum PeerMsg {
    /// Lock request with its request timestamp.
    Lock { pid: ProcessId, clock: Clock },

    /// Lock release.
    Unlock { pid: ProcessId, clock: Clock },

    /// Acknowledgment of a received lock request.
    Ack { pid: ProcessId, clock: Clock },

    /// Committed catalog mutation to replay.
    Command {
        pid: ProcessId,
        clock: Clock,
        op: Op,
        client: String,
        item: String,
    },

    /// Number of clients assigned so far by the sender.
    ClientCount {
        pid: ProcessId,
        count: u64,
        clock: Clock,
    },

    /// Request for a full catalog snapshot.
    Sync { pid: ProcessId, clock: Clock },

    /// Full catalog snapshot answering a `Sync`.
    State {
        pid: ProcessId,
        clock: Clock,
        version: u64,
        snapshot: Snapshot,
    },
}

fn next_num<T: std::str::FromStr<Err = std::num::ParseIntError>>(
    tokens: &mut SplitWhitespace,
    what: &str,
) -> Result<T, LendsetError> {
    match tokens.next() {
        Some(t) => Ok(t.parse::<T>()?),
        None => Err(LendsetError::msg(format!("missing {}", what))),
    }
}

fn next_str(
    tokens: &mut SplitWhitespace,
    what: &str,
) -> Result<String, LendsetError> {
    tokens
        .next()
        .map(String::from)
        .ok_or_else(|| LendsetError::msg(format!("missing {}", what)))
}

impl PeerMsg {
    /// Sender's process ID.
    pub(crate) fn pid(&self) -> ProcessId {
        match self {
            PeerMsg::Lock { pid, .. }
            | PeerMsg::Unlock { pid, .. }
            | PeerMsg::Ack { pid, .. }
            | PeerMsg::Command { pid, .. }
            | PeerMsg::ClientCount { pid, .. }
            | PeerMsg::Sync { pid, .. }
            | PeerMsg::State { pid, .. } => *pid,
        }
    }

    /// Sender's logical timestamp.
    pub(crate) fn clock(&self) -> Clock {
        match self {
            PeerMsg::Lock { clock, .. }
            | PeerMsg::Unlock { clock, .. }
            | PeerMsg::Ack { clock, .. }
            | PeerMsg::Command { clock, .. }
            | PeerMsg::ClientCount { clock, .. }
            | PeerMsg::Sync { clock, .. }
            | PeerMsg::State { clock, .. } => *clock,
        }
    }

    /// Encodes the message as one line, without terminator.
    pub(crate) fn encode(&self) -> String {
        match self {
            PeerMsg::Lock { pid, clock } => format!("LOCK {} {}", pid, clock),
            PeerMsg::Unlock { pid, clock } => {
                format!("UNLOCK {} {}", pid, clock)
            }
            PeerMsg::Ack { pid, clock } => format!("ACK {} {}", pid, clock),
            PeerMsg::Command {
                pid,
                clock,
                op,
                client,
                item,
            } => format!("COMMAND {} {} {} {} {}", pid, clock, op, client, item),
            PeerMsg::ClientCount { pid, count, clock } => {
                format!("CLIENT_COUNT {} {} {}", pid, count, clock)
            }
            PeerMsg::Sync { pid, clock } => format!("SYNC {} {}", pid, clock),
            PeerMsg::State {
                pid,
                clock,
                version,
                snapshot,
            } => {
                let mut line = format!("STATE {} {} {}", pid, clock, version);
                // free items are bare ids; reserved ones are `item=holder`
                for (item, holder) in snapshot {
                    line.push(' ');
                    line.push_str(item);
                    if let Some(holder) = holder {
                        line.push('=');
                        line.push_str(holder);
                    }
                }
                line
            }
        }
    }

    /// Decodes a line into a message.
    pub(crate) fn decode(line: &str) -> Result<Self, LendsetError> {
        let mut tokens = line.split_whitespace();
        let kind = next_str(&mut tokens, "message kind")?;

        let msg = match kind.as_str() {
            "LOCK" => PeerMsg::Lock {
                pid: next_num(&mut tokens, "pid")?,
                clock: next_num(&mut tokens, "clock")?,
            },
            "UNLOCK" => PeerMsg::Unlock {
                pid: next_num(&mut tokens, "pid")?,
                clock: next_num(&mut tokens, "clock")?,
            },
            "ACK" => PeerMsg::Ack {
                pid: next_num(&mut tokens, "pid")?,
                clock: next_num(&mut tokens, "clock")?,
            },
            "COMMAND" => PeerMsg::Command {
                pid: next_num(&mut tokens, "pid")?,
                clock: next_num(&mut tokens, "clock")?,
                op: next_str(&mut tokens, "op")?.parse()?,
                client: next_str(&mut tokens, "client")?,
                item: next_str(&mut tokens, "item")?,
            },
            "CLIENT_COUNT" => PeerMsg::ClientCount {
                pid: next_num(&mut tokens, "pid")?,
                count: next_num(&mut tokens, "count")?,
                clock: next_num(&mut tokens, "clock")?,
            },
            "SYNC" => PeerMsg::Sync {
                pid: next_num(&mut tokens, "pid")?,
                clock: next_num(&mut tokens, "clock")?,
            },
            "STATE" => {
                let pid = next_num(&mut tokens, "pid")?;
                let clock = next_num(&mut tokens, "clock")?;
                let version = next_num(&mut tokens, "version")?;
                let mut snapshot = vec![];
                for token in tokens.by_ref() {
                    let entry = match token.split_once('=') {
                        None => (token.to_string(), None),
                        Some((item, holder))
                            if !item.is_empty() && !holder.is_empty() =>
                        {
                            (item.to_string(), Some(holder.to_string()))
                        }
                        Some(_) => {
                            return Err(LendsetError::msg(format!(
                                "bad state entry '{}'",
                                token
                            )))
                        }
                    };
                    snapshot.push(entry);
                }
                return Ok(PeerMsg::State {
                    pid,
                    clock,
                    version,
                    snapshot,
                });
            }
            _ => {
                return Err(LendsetError::msg(format!(
                    "unknown message kind '{}'",
                    kind
                )))
            }
        };

        if let Some(extra) = tokens.next() {
            return Err(LendsetError::msg(format!(
                "trailing token '{}' in {}",
                extra, kind
            )));
        }
        Ok(msg)
    }
}

#[cfg(test)]
mod messages_tests {
    use super::*;

    #[test]
    fn handshake_parse() {
        assert_eq!(Handshake::parse("client", 0, 3), Ok(Handshake::Client));
        assert_eq!(Handshake::parse(" 2 ", 0, 3), Ok(Handshake::Peer(2)));
        assert!(Handshake::parse("0", 0, 3).is_err());
        assert!(Handshake::parse("3", 0, 3).is_err());
        assert!(Handshake::parse("hello", 0, 3).is_err());
    }

    #[test]
    fn client_cmd_parse() -> Result<(), LendsetError> {
        let cmd = ClientCmd::parse("Reserve c1 b0")?;
        assert_eq!(cmd.op, Op::Reserve);
        assert_eq!(cmd.client, "c1");
        assert_eq!(cmd.item, "b0");
        assert!(ClientCmd::parse("reserve c1").is_err());
        assert!(ClientCmd::parse("reserve c1 b0 b1").is_err());
        assert!(ClientCmd::parse("lend c1 b0").is_err());
        assert!(ClientCmd::parse("").is_err());
        assert!(ClientCmd::parse("reserve c1 b\u{fffd}").is_err());
        Ok(())
    }

    #[test]
    fn reply_display() {
        let (client, item) = (String::from("c1"), String::from("b0"));
        assert_eq!(
            Reply::Reserved {
                client: client.clone(),
                item: item.clone()
            }
            .to_string(),
            "c1 b0"
        );
        assert_eq!(
            Reply::Freed {
                client: client.clone(),
                item: item.clone()
            }
            .to_string(),
            "free c1 b0"
        );
        assert_eq!(Reply::Failed { client, item }.to_string(), "fail c1 b0");
        assert_eq!(Reply::Invalid.to_string(), "Invalid command.");
    }

    #[test]
    fn peer_msg_wire_format() -> Result<(), LendsetError> {
        assert_eq!(PeerMsg::Lock { pid: 1, clock: 7 }.encode(), "LOCK 1 7");
        assert_eq!(
            PeerMsg::decode("CLIENT_COUNT 2 5 9")?,
            PeerMsg::ClientCount {
                pid: 2,
                count: 5,
                clock: 9
            }
        );
        let cmd = PeerMsg::decode("COMMAND 0 4 return c3 b1")?;
        assert_eq!(cmd.pid(), 0);
        assert_eq!(cmd.clock(), 4);
        assert_eq!(cmd.encode(), "COMMAND 0 4 return c3 b1");
        Ok(())
    }

    #[test]
    fn state_msg() -> Result<(), LendsetError> {
        let msg = PeerMsg::State {
            pid: 1,
            clock: 12,
            version: 3,
            snapshot: vec![("b0".into(), None), ("b1".into(), Some("c2".into()))],
        };
        let line = msg.encode();
        assert_eq!(line, "STATE 1 12 3 b0 b1=c2");
        assert_eq!(PeerMsg::decode(&line)?, msg);
        assert!(PeerMsg::decode("STATE 1 12 3 b0=").is_err());
        assert!(PeerMsg::decode("STATE 1 12 3 =c1").is_err());
        Ok(())
    }

    #[test]
    fn state_keeps_odd_holders() -> Result<(), LendsetError> {
        // any client token is a valid holder, including ones that look like
        // markers
        let msg = PeerMsg::State {
            pid: 0,
            clock: 1,
            version: 2,
            snapshot: vec![
                ("b0".into(), Some("-".into())),
                ("b1".into(), Some("x=y".into())),
                ("b2".into(), None),
            ],
        };
        let line = msg.encode();
        assert_eq!(line, "STATE 0 1 2 b0=- b1=x=y b2");
        assert_eq!(PeerMsg::decode(&line)?, msg);
        Ok(())
    }

    #[test]
    fn state_transfers_catalog() -> Result<(), LendsetError> {
        use crate::server::{Catalog, ItemStatus, Outcome};

        let mut source = Catalog::new(3);
        assert_eq!(source.apply("-", "b0", Op::Reserve), Outcome::Committed);
        assert_eq!(source.apply("c4", "b2", Op::Reserve), Outcome::Committed);
        let line = PeerMsg::State {
            pid: 0,
            clock: 1,
            version: source.version(),
            snapshot: source.snapshot(),
        }
        .encode();

        let PeerMsg::State {
            version, snapshot, ..
        } = PeerMsg::decode(&line)?
        else {
            panic!("decoded '{}' as another kind", line);
        };
        let mut target = Catalog::new(3);
        target.restore(version, snapshot)?;
        assert_eq!(target, source);
        assert_eq!(
            target.status("b0"),
            Some(&ItemStatus::Reserved("-".into()))
        );
        Ok(())
    }

    #[test]
    fn peer_msg_malformed() {
        assert!(PeerMsg::decode("").is_err());
        assert!(PeerMsg::decode("LOCK 1").is_err());
        assert!(PeerMsg::decode("LOCK x 1").is_err());
        assert!(PeerMsg::decode("LOCK 1 2 3").is_err());
        assert!(PeerMsg::decode("GRAB 1 2").is_err());
        assert!(PeerMsg::decode("COMMAND 1 2 lend c1 b0").is_err());
    }
}
