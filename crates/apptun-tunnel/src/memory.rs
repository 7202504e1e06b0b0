//! In-memory tunnel engine.
//!
//! Stands in for the native engines in tests and on hosts without one:
//! sessions "handshake" instantly (or after a configured delay), packets
//! are recorded instead of encrypted, and every scripted behavior — auth
//! rejection, transport failure, server pushes — goes through the same
//! event sink a real engine would use.

use crate::config::{TunnelConfig, TunnelCredentials};
use crate::engine::{EngineEvent, EngineHandle, EventSink, TunnelEngine};
use crate::TunnelError;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tracing::debug;

#[derive(Default)]
pub struct MemoryTunnelEngine {
    next_id: AtomicU64,
    started: AtomicUsize,
    sessions: Mutex<HashMap<u64, EventSink>>,
    sent: Mutex<Vec<Vec<u8>>>,
    auth_reject: Mutex<Option<String>>,
    transport_fail: Mutex<Option<String>>,
    connect_delay: Mutex<Option<Duration>>,
}

impl MemoryTunnelEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent sessions fail the handshake with an auth
    /// rejection.
    pub fn reject_auth(&self, reason: impl Into<String>) {
        *self.auth_reject.lock().expect("engine lock poisoned") = Some(reason.into());
    }

    /// Make subsequent sessions fail the handshake with a transport
    /// failure.
    pub fn fail_transport(&self, reason: impl Into<String>) {
        *self.transport_fail.lock().expect("engine lock poisoned") = Some(reason.into());
    }

    /// Delay the simulated handshake.
    pub fn set_connect_delay(&self, delay: Duration) {
        *self.connect_delay.lock().expect("engine lock poisoned") = Some(delay);
    }

    /// Packets handed to the engine, in order, across all sessions.
    pub fn sent_packets(&self) -> Vec<Vec<u8>> {
        self.sent.lock().expect("engine lock poisoned").clone()
    }

    /// Total sessions ever started.
    pub fn sessions_started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    /// Sessions not yet stopped.
    pub fn live_sessions(&self) -> usize {
        self.sessions.lock().expect("engine lock poisoned").len()
    }

    /// Deliver an inbound packet on every live session.
    pub fn inject_inbound(&self, packet: &[u8]) {
        self.broadcast(EngineEvent::Inbound(packet.to_vec()));
    }

    /// Push an interface address on every live session.
    pub fn assign_address(&self, ip: IpAddr, prefix_len: u8) {
        self.broadcast(EngineEvent::AddressAssigned { ip, prefix_len });
    }

    /// Push DNS servers on every live session.
    pub fn assign_dns(&self, servers: Vec<IpAddr>) {
        self.broadcast(EngineEvent::DnsAssigned { servers });
    }

    /// Simulate a mid-session transport loss on every live session.
    pub fn drop_transport(&self, reason: impl Into<String>) {
        self.broadcast(EngineEvent::TransportFailed(reason.into()));
    }

    fn broadcast(&self, event: EngineEvent) {
        let sessions = self.sessions.lock().expect("engine lock poisoned");
        for sink in sessions.values() {
            let _ = sink.send(event.clone());
        }
    }
}

impl TunnelEngine for MemoryTunnelEngine {
    fn start(
        &self,
        config: &TunnelConfig,
        _credentials: &TunnelCredentials,
        events: EventSink,
    ) -> Result<EngineHandle, TunnelError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.started.fetch_add(1, Ordering::SeqCst);
        self.sessions
            .lock()
            .expect("engine lock poisoned")
            .insert(id, events.clone());
        debug!(session = id, host = %config.server_host, "memory engine session started");

        let auth_reject = self.auth_reject.lock().expect("engine lock poisoned").clone();
        let transport_fail = self.transport_fail.lock().expect("engine lock poisoned").clone();
        let delay = *self.connect_delay.lock().expect("engine lock poisoned");

        // Handshake happens on the engine's own thread, as it would with
        // a native library.
        std::thread::spawn(move || {
            if let Some(delay) = delay {
                std::thread::sleep(delay);
            }
            let outcome = if let Some(reason) = auth_reject {
                EngineEvent::AuthFailed(reason)
            } else if let Some(reason) = transport_fail {
                EngineEvent::TransportFailed(reason)
            } else {
                EngineEvent::Connected
            };
            let _ = events.send(outcome);
        });

        Ok(EngineHandle(id))
    }

    fn send(&self, handle: EngineHandle, packet: &[u8]) {
        let sessions = self.sessions.lock().expect("engine lock poisoned");
        if sessions.contains_key(&handle.0) {
            drop(sessions);
            self.sent.lock().expect("engine lock poisoned").push(packet.to_vec());
        }
    }

    fn stop(&self, handle: EngineHandle) {
        let sink = self
            .sessions
            .lock()
            .expect("engine lock poisoned")
            .remove(&handle.0);
        if let Some(sink) = sink {
            let _ = sink.send(EngineEvent::Stopped);
            debug!(session = handle.0, "memory engine session stopped");
        }
    }

    fn nudge(&self, handle: EngineHandle) {
        let sessions = self.sessions.lock().expect("engine lock poisoned");
        if let Some(sink) = sessions.get(&handle.0) {
            let _ = sink.send(EngineEvent::Connected);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProtocolKind;

    fn start(engine: &MemoryTunnelEngine) -> (EngineHandle, crossbeam_channel::Receiver<EngineEvent>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        let config = TunnelConfig::new(ProtocolKind::WireGuard, "vpn.example.net", 51820);
        let creds = TunnelCredentials::from_raw("u", b"k");
        let handle = engine.start(&config, &creds, tx).unwrap();
        (handle, rx)
    }

    #[test]
    fn session_connects_and_stops() {
        let engine = MemoryTunnelEngine::new();
        let (handle, rx) = start(&engine);

        assert_eq!(rx.recv().unwrap(), EngineEvent::Connected);
        assert_eq!(engine.live_sessions(), 1);

        engine.stop(handle);
        assert_eq!(rx.recv().unwrap(), EngineEvent::Stopped);
        assert_eq!(engine.live_sessions(), 0);

        // Idempotent.
        engine.stop(handle);
    }

    #[test]
    fn dead_session_swallows_sends() {
        let engine = MemoryTunnelEngine::new();
        let (handle, _rx) = start(&engine);
        engine.stop(handle);
        engine.send(handle, b"late");
        assert!(engine.sent_packets().is_empty());
    }

    #[test]
    fn scripted_auth_rejection() {
        let engine = MemoryTunnelEngine::new();
        engine.reject_auth("nope");
        let (_, rx) = start(&engine);
        assert_eq!(rx.recv().unwrap(), EngineEvent::AuthFailed("nope".into()));
    }
}
