//! Protocol-agnostic tunnel clients.
//!
//! The cryptographic engines (OpenVPN-family, WireGuard-family) are
//! opaque native libraries; their wire protocols are not this crate's
//! business. What this crate owns is everything around them:
//!
//! - the [`TunnelEngine`] contract an engine must satisfy,
//! - the [`TunnelClient`] session state machine
//!   (`Idle → Connecting → Connected → Disconnecting → Idle`, with
//!   `Error` reachable from the two middle states),
//! - the event bridge: engine callbacks post [`EngineEvent`]s onto a
//!   channel consumed by the client's own pump thread, so an engine's
//!   handshake thread is never blocked by client work.
//!
//! The two protocol families differ in lifecycle, not in interface: an
//! OpenVPN-style engine needs a full down→up cycle after a network
//! change, a WireGuard-style engine heals itself. [`TunnelClient`]
//! carries that difference as a tagged variant ([`ProtocolKind`]), not
//! as separate client types.

mod client;
mod config;
mod engine;
mod memory;

pub use client::{AddressCallback, ClientState, DnsCallback, InboundCallback, TunnelClient};
pub use config::{ProtocolKind, TunnelConfig, TunnelCredentials};
pub use engine::{EngineEvent, EngineHandle, EventSink, TunnelEngine};
pub use memory::MemoryTunnelEngine;

use thiserror::Error;

/// Tunnel-level errors, recorded as a client's `last_error`.
///
/// Authentication rejection is deliberately distinct from transport
/// failure: the first needs new credentials, the second is retryable.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TunnelError {
    #[error("malformed tunnel config: {0}")]
    Config(String),

    #[error("credentials rejected: {0}")]
    Auth(String),

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("engine failure: {0}")]
    Engine(String),
}
