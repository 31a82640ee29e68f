//! Public interface to the Lendset core library, linked by the server
//! executable and the client executable.

#[macro_use]
mod utils;

mod server;
mod client;

#[doc(inline)]
pub use crate::utils::{logger_init, Bitmap, LendsetError, Timer, ME};

#[doc(hidden)]
pub use crate::utils::me_tag;

#[doc(inline)]
pub use crate::server::{
    ClusterConfig, LibraryReplica, ProcessId, RateLimit, ReplicaConfig,
};

#[doc(inline)]
pub use crate::client::{ClientConfig, LibraryClient};
