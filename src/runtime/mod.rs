//! Client runtime.
//!
//! - `Connection`: per-connection issuance/response state machines
//! - `Reactor`: services the event loop lends to a connection per callback
//! - `mio`: readiness-based event loop driving all connections on one thread

mod connection;
mod mio;
mod operation;
mod reactor;
mod state;

pub use connection::{ConnEvent, Connection};
pub use operation::OpKind;
pub use reactor::Reactor;

use crate::config::Config;
use crate::stats::ConnectionStats;

/// Drive every configured connection until the run ends.
pub fn run(config: &Config) -> std::io::Result<ConnectionStats> {
    self::mio::run(config)
}
