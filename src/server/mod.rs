//! Lendset's server functionality modules: the coordination engine and the
//! event loop that drives it.

mod membership;
mod bootstrap;
mod clock;
mod mutex;
mod catalog;
mod messages;
mod reactor;
mod replica;

pub use membership::ProcessId;
pub use bootstrap::{ClusterConfig, RateLimit};
pub use replica::{LibraryReplica, ReplicaConfig};

pub(crate) use membership::{resolve_identity, Membership};
pub(crate) use bootstrap::resolve_addr;
pub(crate) use clock::{Clock, LogicalClock};
pub(crate) use mutex::{LockState, MutexEngine};
pub(crate) use catalog::{Catalog, ItemStatus, Op, Outcome, Snapshot};
pub(crate) use messages::{ClientCmd, Handshake, PeerMsg, Reply};
pub(crate) use reactor::{ConnId, Multiplexer, PollEvent};
