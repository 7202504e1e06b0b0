//! The engine contract.
//!
//! A tunnel engine is the native library that speaks the wire protocol.
//! It runs its own threads; all it may do toward us is post events onto
//! the [`EventSink`] it was given at start. Posting never blocks, so the
//! engine's handshake thread is never held up by client work.

use crate::config::{TunnelConfig, TunnelCredentials};
use crate::TunnelError;
use std::net::IpAddr;

/// Opaque handle to one live engine session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EngineHandle(pub u64);

/// Channel on which an engine reports session progress.
pub type EventSink = crossbeam_channel::Sender<EngineEvent>;

/// Events an engine posts during a session's life.
///
/// Any of these may arrive zero or more times, asynchronously; the order
/// within one session is the engine's truth and is consumed as-is by the
/// client's state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// The handshake completed; the session carries traffic now.
    Connected,
    /// The server assigned this session an interface address.
    AddressAssigned { ip: IpAddr, prefix_len: u8 },
    /// The server pushed DNS servers for this session.
    DnsAssigned { servers: Vec<IpAddr> },
    /// A decrypted inbound packet surfaced from the tunnel.
    Inbound(Vec<u8>),
    /// The server rejected the credentials.
    AuthFailed(String),
    /// The handshake or the established transport failed.
    TransportFailed(String),
    /// The session ended; no further events follow.
    Stopped,
}

/// Contract a native tunnel engine adapter must satisfy.
///
/// `start` returns as soon as the engine has accepted the session; true
/// connectivity is observed via [`EngineEvent::Connected`]. The handle is
/// owned exclusively by the calling [`crate::TunnelClient`] and is dead
/// after `stop`, which must also close the event sink so consumers
/// drain out.
pub trait TunnelEngine: Send + Sync {
    fn start(
        &self,
        config: &TunnelConfig,
        credentials: &TunnelCredentials,
        events: EventSink,
    ) -> Result<EngineHandle, TunnelError>;

    /// Hand one outbound IP packet to the engine. Fire-and-forget; the
    /// engine drops packets it cannot take.
    fn send(&self, handle: EngineHandle, packet: &[u8]);

    /// Tear the session down. Must be idempotent and must drop the
    /// session's event sink.
    fn stop(&self, handle: EngineHandle);

    /// Nudge a self-healing engine after a network change. The default
    /// is a no-op; engines that keep sessions alive across network
    /// changes re-post their current state through the event sink.
    fn nudge(&self, handle: EngineHandle) {
        let _ = handle;
    }
}
