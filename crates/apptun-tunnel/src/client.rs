//! The tunnel client session state machine.

use crate::config::{ProtocolKind, TunnelConfig, TunnelCredentials};
use crate::engine::{EngineEvent, EngineHandle, TunnelEngine};
use crate::TunnelError;
use apptun_rules::TunnelId;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use tracing::{debug, info, warn};

/// Client lifecycle states.
///
/// `Error` is reachable from `Connecting` and `Connected`;
/// [`TunnelClient::disconnect`] always lands back in `Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Idle,
    Connecting,
    Connected,
    Disconnecting,
    Error,
}

impl ClientState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ClientState::Connected)
    }
}

/// Callback receiving decrypted inbound packets.
pub type InboundCallback = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// Callback for server-assigned interface addresses.
pub type AddressCallback = Box<dyn Fn(&TunnelId, IpAddr, u8) + Send>;

/// Callback for server-pushed DNS servers.
pub type DnsCallback = Box<dyn Fn(&TunnelId, &[IpAddr]) + Send>;

struct Session {
    state: ClientState,
    handle: Option<EngineHandle>,
    last_error: Option<TunnelError>,
    address: Option<(IpAddr, u8)>,
    dns: Vec<IpAddr>,
    // Retained for protocol families that reconnect by cycling.
    config: Option<TunnelConfig>,
    credentials: Option<TunnelCredentials>,
    pump: Option<thread::JoinHandle<()>>,
}

impl Session {
    fn new() -> Self {
        Self {
            state: ClientState::Idle,
            handle: None,
            last_error: None,
            address: None,
            dns: Vec::new(),
            config: None,
            credentials: None,
            pump: None,
        }
    }
}

/// Shared between the client and its event pump thread.
struct Shared {
    tunnel_id: TunnelId,
    session: Mutex<Session>,
    connected: AtomicBool,
    inbound: Mutex<Option<InboundCallback>>,
    on_address: Mutex<Option<AddressCallback>>,
    on_dns: Mutex<Option<DnsCallback>>,
}

/// One client per tunnel id, owning that tunnel's engine session
/// exclusively.
///
/// All engine progress arrives on a channel drained by a dedicated pump
/// thread (one per session), so this type shares no lock with the
/// engine's own threads.
pub struct TunnelClient {
    protocol: ProtocolKind,
    engine: Arc<dyn TunnelEngine>,
    shared: Arc<Shared>,
}

impl TunnelClient {
    pub fn new(tunnel_id: TunnelId, protocol: ProtocolKind, engine: Arc<dyn TunnelEngine>) -> Self {
        Self {
            protocol,
            engine,
            shared: Arc::new(Shared {
                tunnel_id,
                session: Mutex::new(Session::new()),
                connected: AtomicBool::new(false),
                inbound: Mutex::new(None),
                on_address: Mutex::new(None),
                on_dns: Mutex::new(None),
            }),
        }
    }

    pub fn tunnel_id(&self) -> &TunnelId {
        &self.shared.tunnel_id
    }

    pub fn protocol(&self) -> ProtocolKind {
        self.protocol
    }

    /// Observed connectivity. May lag `connect` returning `true`: the
    /// handshake completes asynchronously.
    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    pub fn state(&self) -> ClientState {
        self.shared.session.lock().expect("session lock poisoned").state
    }

    pub fn last_error(&self) -> Option<TunnelError> {
        self.shared
            .session
            .lock()
            .expect("session lock poisoned")
            .last_error
            .clone()
    }

    /// The server-assigned interface address, once one arrived.
    pub fn assigned_address(&self) -> Option<(IpAddr, u8)> {
        self.shared.session.lock().expect("session lock poisoned").address
    }

    /// The server-pushed DNS servers, empty until any arrived.
    pub fn assigned_dns(&self) -> Vec<IpAddr> {
        self.shared
            .session
            .lock()
            .expect("session lock poisoned")
            .dns
            .clone()
    }

    /// Register the inbound packet callback. One active callback at a
    /// time; the last write wins.
    pub fn set_inbound_callback(&self, callback: InboundCallback) {
        *self.shared.inbound.lock().expect("inbound lock poisoned") = Some(callback);
    }

    /// Observer for server-assigned addresses. Last write wins.
    pub fn set_address_callback(&self, callback: AddressCallback) {
        *self.shared.on_address.lock().expect("observer lock poisoned") = Some(callback);
    }

    /// Observer for server-pushed DNS. Last write wins.
    pub fn set_dns_callback(&self, callback: DnsCallback) {
        *self.shared.on_dns.lock().expect("observer lock poisoned") = Some(callback);
    }

    /// Start a session.
    ///
    /// Returns `false` with a typed `last_error` when the config or
    /// credentials are malformed (checked before any engine or network
    /// activity) or when the engine refuses the session. Returning
    /// `true` means the attempt is under way, not that the handshake
    /// finished; observe [`TunnelClient::is_connected`] for that.
    pub fn connect(&self, config: TunnelConfig, credentials: TunnelCredentials) -> bool {
        {
            let session = self.shared.session.lock().expect("session lock poisoned");
            match session.state {
                ClientState::Idle | ClientState::Error => {}
                ClientState::Connecting | ClientState::Connected => {
                    warn!(tunnel = %self.shared.tunnel_id, "connect while session active, ignoring");
                    return true;
                }
                ClientState::Disconnecting => {
                    warn!(tunnel = %self.shared.tunnel_id, "connect while disconnecting, refused");
                    return false;
                }
            }
        }

        if let Err(e) = config.validate().and_then(|()| credentials.validate()) {
            warn!(tunnel = %self.shared.tunnel_id, error = %e, "rejecting malformed connect");
            self.fail(e);
            return false;
        }

        let (tx, rx) = crossbeam_channel::unbounded();
        let handle = match self.engine.start(&config, &credentials, tx) {
            Ok(handle) => handle,
            Err(e) => {
                warn!(tunnel = %self.shared.tunnel_id, error = %e, "engine refused session");
                self.fail(e);
                return false;
            }
        };

        // Session fields must be in place before the pump starts applying
        // events, or an early Connected could be overwritten.
        {
            let mut session = self.shared.session.lock().expect("session lock poisoned");
            session.state = ClientState::Connecting;
            session.handle = Some(handle);
            session.last_error = None;
            session.address = None;
            session.dns.clear();
            session.config = Some(config);
            session.credentials = Some(credentials);
        }
        let pump = spawn_pump(self.shared.clone(), rx);
        self.shared
            .session
            .lock()
            .expect("session lock poisoned")
            .pump = Some(pump);
        info!(tunnel = %self.shared.tunnel_id, protocol = %self.protocol, "session starting");
        true
    }

    /// Hand one outbound packet to the engine. Warns and drops when the
    /// session is not connected; never fails on malformed input.
    pub fn send_packet(&self, packet: &[u8]) {
        if !self.is_connected() {
            warn!(tunnel = %self.shared.tunnel_id, len = packet.len(), "dropping packet, not connected");
            return;
        }
        let handle = self.shared.session.lock().expect("session lock poisoned").handle;
        if let Some(handle) = handle {
            self.engine.send(handle, packet);
        }
    }

    /// Tear the session down. Idempotent; safe before, during, or after
    /// a connect; always lands in `Idle` and never leaks the engine
    /// handle or the pump thread.
    pub fn disconnect(&self) {
        let (handle, pump) = {
            let mut session = self.shared.session.lock().expect("session lock poisoned");
            if session.handle.is_none() && session.pump.is_none() {
                session.state = ClientState::Idle;
                return;
            }
            session.state = ClientState::Disconnecting;
            (session.handle.take(), session.pump.take())
        };
        self.shared.connected.store(false, Ordering::Release);

        if let Some(handle) = handle {
            // stop() drops the engine's event sink, which ends the pump.
            self.engine.stop(handle);
        }
        if let Some(pump) = pump {
            let _ = pump.join();
        }

        let mut session = self.shared.session.lock().expect("session lock poisoned");
        session.state = ClientState::Idle;
        info!(tunnel = %self.shared.tunnel_id, "session closed");
    }

    /// Force a session refresh after a network change.
    ///
    /// OpenVPN-family sessions need a full down→up cycle; WireGuard-family
    /// sessions self-heal, so the engine is only nudged and re-reports its
    /// state through the normal event path.
    pub fn reconnect(&self) -> bool {
        match self.protocol {
            ProtocolKind::WireGuard => {
                let handle = self.shared.session.lock().expect("session lock poisoned").handle;
                match handle {
                    Some(handle) => {
                        debug!(tunnel = %self.shared.tunnel_id, "nudging self-healing session");
                        self.engine.nudge(handle);
                        true
                    }
                    None => false,
                }
            }
            ProtocolKind::OpenVpn => {
                let (config, credentials) = {
                    let session = self.shared.session.lock().expect("session lock poisoned");
                    (session.config.clone(), session.credentials.clone())
                };
                let (Some(config), Some(credentials)) = (config, credentials) else {
                    warn!(tunnel = %self.shared.tunnel_id, "reconnect without prior session");
                    return false;
                };
                self.disconnect();
                self.connect(config, credentials)
            }
        }
    }

    fn fail(&self, error: TunnelError) {
        let mut session = self.shared.session.lock().expect("session lock poisoned");
        session.state = ClientState::Error;
        session.last_error = Some(error);
    }
}

impl Drop for TunnelClient {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Drain engine events into the session state machine.
///
/// Runs on its own thread, since the receiver blocks; exits when the
/// engine drops the sink or posts `Stopped`.
fn spawn_pump(
    shared: Arc<Shared>,
    rx: crossbeam_channel::Receiver<EngineEvent>,
) -> thread::JoinHandle<()> {
    thread::Builder::new()
        .name(format!("tunnel-pump-{}", shared.tunnel_id))
        .spawn(move || {
            for event in rx {
                match event {
                    EngineEvent::Connected => {
                        let mut session = shared.session.lock().expect("session lock poisoned");
                        session.state = ClientState::Connected;
                        session.last_error = None;
                        drop(session);
                        shared.connected.store(true, Ordering::Release);
                        info!(tunnel = %shared.tunnel_id, "tunnel connected");
                    }
                    EngineEvent::AddressAssigned { ip, prefix_len } => {
                        shared
                            .session
                            .lock()
                            .expect("session lock poisoned")
                            .address = Some((ip, prefix_len));
                        debug!(tunnel = %shared.tunnel_id, %ip, prefix_len, "address assigned");
                        if let Some(cb) = shared.on_address.lock().expect("observer lock poisoned").as_ref() {
                            cb(&shared.tunnel_id, ip, prefix_len);
                        }
                    }
                    EngineEvent::DnsAssigned { servers } => {
                        shared
                            .session
                            .lock()
                            .expect("session lock poisoned")
                            .dns = servers.clone();
                        debug!(tunnel = %shared.tunnel_id, count = servers.len(), "dns assigned");
                        if let Some(cb) = shared.on_dns.lock().expect("observer lock poisoned").as_ref() {
                            cb(&shared.tunnel_id, &servers);
                        }
                    }
                    EngineEvent::Inbound(packet) => {
                        let callback = shared.inbound.lock().expect("inbound lock poisoned").clone();
                        if let Some(callback) = callback {
                            callback(&packet);
                        }
                    }
                    EngineEvent::AuthFailed(reason) => {
                        warn!(tunnel = %shared.tunnel_id, reason, "authentication rejected");
                        shared.connected.store(false, Ordering::Release);
                        let mut session = shared.session.lock().expect("session lock poisoned");
                        session.state = ClientState::Error;
                        session.last_error = Some(TunnelError::Auth(reason));
                    }
                    EngineEvent::TransportFailed(reason) => {
                        warn!(tunnel = %shared.tunnel_id, reason, "transport failure");
                        shared.connected.store(false, Ordering::Release);
                        let mut session = shared.session.lock().expect("session lock poisoned");
                        session.state = ClientState::Error;
                        session.last_error = Some(TunnelError::Transport(reason));
                    }
                    EngineEvent::Stopped => {
                        debug!(tunnel = %shared.tunnel_id, "engine reported stop");
                        shared.connected.store(false, Ordering::Release);
                        break;
                    }
                }
            }
        })
        .expect("failed to spawn tunnel event pump")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryTunnelEngine;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn wg_config() -> TunnelConfig {
        TunnelConfig::new(ProtocolKind::WireGuard, "vpn.example.net", 51820)
    }

    fn creds() -> TunnelCredentials {
        TunnelCredentials::from_raw("alice", b"key-material")
    }

    fn wait_until(deadline_ms: u64, mut check: impl FnMut() -> bool) -> bool {
        for _ in 0..deadline_ms {
            if check() {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        check()
    }

    #[test]
    fn connect_reaches_connected_asynchronously() {
        let engine = Arc::new(MemoryTunnelEngine::new());
        let client = TunnelClient::new("T1".into(), ProtocolKind::WireGuard, engine);

        assert!(client.connect(wg_config(), creds()));
        assert!(wait_until(500, || client.is_connected()));
        assert_eq!(client.state(), ClientState::Connected);
        assert!(client.last_error().is_none());
    }

    #[test]
    fn malformed_config_fails_before_engine() {
        let engine = Arc::new(MemoryTunnelEngine::new());
        let client = TunnelClient::new("T1".into(), ProtocolKind::WireGuard, engine.clone());

        let mut config = wg_config();
        config.server_host.clear();
        assert!(!client.connect(config, creds()));
        assert_eq!(client.state(), ClientState::Error);
        assert!(matches!(client.last_error(), Some(TunnelError::Config(_))));
        assert_eq!(engine.sessions_started(), 0);
    }

    #[test]
    fn auth_rejection_is_distinguished_from_transport() {
        let engine = Arc::new(MemoryTunnelEngine::new());
        engine.reject_auth("bad password");
        let client = TunnelClient::new("T1".into(), ProtocolKind::OpenVpn, engine);

        assert!(client.connect(wg_config(), creds()));
        assert!(wait_until(500, || client.state() == ClientState::Error));
        assert!(matches!(client.last_error(), Some(TunnelError::Auth(_))));
        assert!(!client.is_connected());
    }

    #[test]
    fn transport_rejection_surfaces_as_transport_error() {
        let engine = Arc::new(MemoryTunnelEngine::new());
        engine.fail_transport("server unreachable");
        let client = TunnelClient::new("T1".into(), ProtocolKind::WireGuard, engine);

        assert!(client.connect(wg_config(), creds()));
        assert!(wait_until(500, || client.state() == ClientState::Error));
        assert!(matches!(client.last_error(), Some(TunnelError::Transport(_))));
        assert!(!client.is_connected());
    }

    #[test]
    fn send_when_not_connected_is_a_noop() {
        let engine = Arc::new(MemoryTunnelEngine::new());
        let client = TunnelClient::new("T1".into(), ProtocolKind::WireGuard, engine.clone());
        client.send_packet(b"should be dropped");
        assert!(engine.sent_packets().is_empty());
    }

    #[test]
    fn packets_flow_once_connected() {
        let engine = Arc::new(MemoryTunnelEngine::new());
        let client = TunnelClient::new("T1".into(), ProtocolKind::WireGuard, engine.clone());
        client.connect(wg_config(), creds());
        assert!(wait_until(500, || client.is_connected()));

        client.send_packet(b"one");
        client.send_packet(b"two");
        assert_eq!(engine.sent_packets(), vec![b"one".to_vec(), b"two".to_vec()]);
    }

    #[test]
    fn inbound_callback_last_write_wins() {
        let engine = Arc::new(MemoryTunnelEngine::new());
        let client = TunnelClient::new("T1".into(), ProtocolKind::WireGuard, engine.clone());

        let first_hits = Arc::new(AtomicUsize::new(0));
        let second_hits = Arc::new(AtomicUsize::new(0));
        {
            let hits = first_hits.clone();
            client.set_inbound_callback(Arc::new(move |_| {
                hits.fetch_add(1, Ordering::SeqCst);
            }));
        }
        {
            let hits = second_hits.clone();
            client.set_inbound_callback(Arc::new(move |_| {
                hits.fetch_add(1, Ordering::SeqCst);
            }));
        }

        client.connect(wg_config(), creds());
        assert!(wait_until(500, || client.is_connected()));
        engine.inject_inbound(b"reply");
        assert!(wait_until(500, || second_hits.load(Ordering::SeqCst) == 1));
        assert_eq!(first_hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn disconnect_is_idempotent_and_reaches_idle() {
        let engine = Arc::new(MemoryTunnelEngine::new());
        let client = TunnelClient::new("T1".into(), ProtocolKind::WireGuard, engine.clone());

        // Pre-connect disconnect is safe.
        client.disconnect();
        assert_eq!(client.state(), ClientState::Idle);

        client.connect(wg_config(), creds());
        assert!(wait_until(500, || client.is_connected()));
        client.disconnect();
        assert_eq!(client.state(), ClientState::Idle);
        assert!(!client.is_connected());
        assert_eq!(engine.live_sessions(), 0);

        client.disconnect();
        assert_eq!(client.state(), ClientState::Idle);
    }

    #[test]
    fn openvpn_reconnect_cycles_the_session() {
        let engine = Arc::new(MemoryTunnelEngine::new());
        let client = TunnelClient::new("T1".into(), ProtocolKind::OpenVpn, engine.clone());
        client.connect(wg_config(), creds());
        assert!(wait_until(500, || client.is_connected()));

        assert!(client.reconnect());
        assert!(wait_until(500, || client.is_connected()));
        assert_eq!(engine.sessions_started(), 2);
    }

    #[test]
    fn wireguard_reconnect_is_a_nudge() {
        let engine = Arc::new(MemoryTunnelEngine::new());
        let client = TunnelClient::new("T1".into(), ProtocolKind::WireGuard, engine.clone());
        client.connect(wg_config(), creds());
        assert!(wait_until(500, || client.is_connected()));

        assert!(client.reconnect());
        // Still the original session; state re-reported, not cycled.
        assert_eq!(engine.sessions_started(), 1);
        assert!(wait_until(500, || client.is_connected()));
    }

    #[test]
    fn address_and_dns_observers_fire() {
        let engine = Arc::new(MemoryTunnelEngine::new());
        let client = TunnelClient::new("T1".into(), ProtocolKind::WireGuard, engine.clone());

        let addr_seen = Arc::new(Mutex::new(None));
        let dns_seen = Arc::new(Mutex::new(Vec::new()));
        {
            let addr_seen = addr_seen.clone();
            client.set_address_callback(Box::new(move |_, ip, prefix| {
                *addr_seen.lock().unwrap() = Some((ip, prefix));
            }));
        }
        {
            let dns_seen = dns_seen.clone();
            client.set_dns_callback(Box::new(move |_, servers| {
                *dns_seen.lock().unwrap() = servers.to_vec();
            }));
        }

        client.connect(wg_config(), creds());
        assert!(wait_until(500, || client.is_connected()));
        engine.assign_address("10.8.0.2".parse().unwrap(), 24);
        engine.assign_dns(vec!["10.8.0.1".parse().unwrap()]);

        assert!(wait_until(500, || addr_seen.lock().unwrap().is_some()));
        assert_eq!(
            *addr_seen.lock().unwrap(),
            Some(("10.8.0.2".parse().unwrap(), 24))
        );
        assert!(wait_until(500, || !dns_seen.lock().unwrap().is_empty()));
        assert_eq!(client.assigned_address(), Some(("10.8.0.2".parse().unwrap(), 24)));
        assert_eq!(
            client.assigned_dns(),
            vec!["10.8.0.1".parse::<IpAddr>().unwrap()]
        );
    }
}
