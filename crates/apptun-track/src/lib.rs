//! Connection tracking: who owns a flow, and where does it go.
//!
//! The packet hot path only sees raw IP packets. Turning a packet into a
//! routing decision takes two maps:
//!
//! - UID → tunnel (populated from the persisted rules), and
//! - (source ip, source port) → (UID, tunnel), a per-flow cache created on
//!   the first packet of a flow so UID resolution is not repeated.
//!
//! Resolving a UID from a raw socket tuple is OS-specific and expensive
//! (a scan of the kernel connection table), so it sits behind the narrow
//! [`UidResolver`] trait and runs only on cache misses.

mod procnet;
mod resolver;
mod tracker;

pub use procnet::ProcNetResolver;
pub use resolver::{AppRegistry, MemoryAppRegistry, SocketTuple, Transport, Uid, UidResolver};
pub use tracker::{ConnectionTracker, SocketRoute, TrackerStats};

use thiserror::Error;

/// Connection-tracking errors.
#[derive(Debug, Clone, Error)]
pub enum TrackError {
    #[error("failed to read OS connection table: {0}")]
    ConnectionTable(String),
}
