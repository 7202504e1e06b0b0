//! Just-in-time connection orchestration.
//!
//! Tunnels are established lazily on first traffic. The orchestrator
//! owns per-route connection state and enforces the two hard rules of
//! the engine:
//!
//! - at most one in-flight connection attempt per route, shared by all
//!   concurrent callers, and
//! - buffered packets are flushed to the tunnel, in arrival order,
//!   before any later packet is forwarded directly.
//!
//! The second rule falls out of the locking scheme: the buffer drain and
//! the flip to `Connected` happen under the same routes lock that every
//! direct forward takes, so a forward can never overtake the drain.

use crate::buffer::PacketBufferManager;
use crate::catalog::{probe_candidates, RegionRequest, ServerCatalog};
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::route::{RouteKey, RouteState};
use crate::stores::{Account, CredentialStore};
use apptun_rules::TunnelId;
use apptun_tunnel::{ClientState, ProtocolKind, TunnelClient, TunnelConfig, TunnelEngine};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// The two protocol engines the orchestrator can drive.
#[derive(Clone)]
pub struct EngineSet {
    pub openvpn: Arc<dyn TunnelEngine>,
    pub wireguard: Arc<dyn TunnelEngine>,
}

impl EngineSet {
    /// Both protocol families served by one engine (tests, hosts with a
    /// single native library).
    pub fn single(engine: Arc<dyn TunnelEngine>) -> Self {
        Self {
            openvpn: engine.clone(),
            wireguard: engine,
        }
    }

    fn for_protocol(&self, protocol: ProtocolKind) -> Arc<dyn TunnelEngine> {
        match protocol {
            ProtocolKind::OpenVpn => self.openvpn.clone(),
            ProtocolKind::WireGuard => self.wireguard.clone(),
        }
    }
}

/// What happened to a packet handed to
/// [`JitOrchestrator::forward_or_buffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardOutcome {
    /// Sent to the connected tunnel.
    Forwarded,
    /// Queued behind an attempt already in flight.
    Buffered,
    /// Queued, and no attempt is in flight: the caller should kick
    /// [`JitOrchestrator::ensure_connected`].
    BufferedNeedsConnect,
}

type AttemptResult = Option<Result<TunnelId, EngineError>>;

/// One in-flight connection attempt.
///
/// Cancellation is cooperative: the flag is checked at every stage
/// boundary, so the attempt always runs its own cleanup (including
/// dropping any engine session it already created) instead of being
/// killed mid-stride.
struct Attempt {
    cancel: Arc<AtomicBool>,
    result: watch::Receiver<AttemptResult>,
}

struct RouteEntry {
    state: RouteState,
    tunnel_id: Option<TunnelId>,
    last_activity: Instant,
    attempt: Option<Attempt>,
}

impl RouteEntry {
    fn new() -> Self {
        Self {
            state: RouteState::Disconnected,
            tunnel_id: None,
            last_activity: Instant::now(),
            attempt: None,
        }
    }
}

enum Begin {
    Done(Result<TunnelId, EngineError>),
    Wait(watch::Receiver<AttemptResult>),
}

/// Coordinates server selection, connection establishment, buffer
/// flushing, and idle eviction, one entry per [`RouteKey`].
pub struct JitOrchestrator {
    config: EngineConfig,
    catalog: Arc<dyn ServerCatalog>,
    credentials: Arc<dyn CredentialStore>,
    engines: EngineSet,
    buffers: Arc<PacketBufferManager>,
    routes: Mutex<HashMap<RouteKey, RouteEntry>>,
    clients: Mutex<HashMap<TunnelId, Arc<TunnelClient>>>,
    /// Every client's decrypted inbound traffic funnels here, toward the
    /// interface writer.
    inbound_tx: crossbeam_channel::Sender<Vec<u8>>,
}

impl JitOrchestrator {
    pub fn new(
        config: EngineConfig,
        catalog: Arc<dyn ServerCatalog>,
        credentials: Arc<dyn CredentialStore>,
        engines: EngineSet,
        buffers: Arc<PacketBufferManager>,
        inbound_tx: crossbeam_channel::Sender<Vec<u8>>,
    ) -> Self {
        Self {
            config,
            catalog,
            credentials,
            engines,
            buffers,
            routes: Mutex::new(HashMap::new()),
            clients: Mutex::new(HashMap::new()),
            inbound_tx,
        }
    }

    /// Ensure a live tunnel for `route`, establishing one if needed.
    ///
    /// A connected route returns its tunnel id with no I/O. A pending
    /// route makes the caller await the one in-flight attempt; every
    /// waiter observes the identical result. Otherwise a new attempt is
    /// started: catalog fetch, reachability probing, handshake, buffer
    /// flush.
    pub async fn ensure_connected(
        self: &Arc<Self>,
        route: &RouteKey,
        account: &Account,
        request: &RegionRequest,
    ) -> Result<TunnelId, EngineError> {
        let mut rx = match self.begin(route, account, request) {
            Begin::Done(result) => return result,
            Begin::Wait(rx) => rx,
        };

        match rx.wait_for(|result| result.is_some()).await {
            Ok(guard) => guard.clone().unwrap_or(Err(EngineError::Cancelled)),
            // Sender dropped without a result: the attempt was aborted.
            Err(_) => Err(EngineError::Cancelled),
        }
    }

    /// One lock pass: answer from state, join the in-flight attempt, or
    /// start one. At most one attempt per route ever exists.
    fn begin(self: &Arc<Self>, route: &RouteKey, account: &Account, request: &RegionRequest) -> Begin {
        let mut routes = self.routes.lock().expect("routes lock poisoned");
        let entry = routes.entry(route.clone()).or_insert_with(RouteEntry::new);

        if entry.state.is_connected() {
            let tunnel_id = entry.tunnel_id.clone().unwrap_or_else(|| route.tunnel_id());
            // A session that died mid-route (transport loss, auth revoked)
            // must not fast-path forever; demote and rebuild.
            let alive = self
                .clients
                .lock()
                .expect("clients lock poisoned")
                .get(&tunnel_id)
                .is_some_and(|client| client.is_connected());
            if alive {
                entry.last_activity = Instant::now();
                return Begin::Done(Ok(tunnel_id));
            }
            warn!(%route, "connected route lost its session, reconnecting");
            entry.state = RouteState::Disconnected;
            entry.tunnel_id = None;
            self.drop_client(&tunnel_id);
        }
        if entry.state.is_pending() {
            if let Some(attempt) = &entry.attempt {
                return Begin::Wait(attempt.result.clone());
            }
        }

        entry.state = RouteState::SelectingServer;
        entry.last_activity = Instant::now();
        let cancel = Arc::new(AtomicBool::new(false));
        let (tx, rx) = watch::channel(None);
        {
            let orchestrator = self.clone();
            let route = route.clone();
            let account = account.clone();
            let request = request.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                orchestrator.run_attempt(route, account, request, tx, cancel).await;
            });
        }
        entry.attempt = Some(Attempt {
            cancel,
            result: rx.clone(),
        });
        debug!(%route, "connection attempt started");
        Begin::Wait(rx)
    }

    async fn run_attempt(
        self: Arc<Self>,
        route: RouteKey,
        account: Account,
        request: RegionRequest,
        tx: watch::Sender<AttemptResult>,
        cancel: Arc<AtomicBool>,
    ) {
        let result = self.connect_route(&route, &account, &request, &cancel).await;

        // Once cancelled, any entry under this key belongs to a newer
        // attempt and is not ours to touch.
        if !cancel.load(Ordering::SeqCst) {
            let mut routes = self.routes.lock().expect("routes lock poisoned");
            if let Some(entry) = routes.get_mut(&route) {
                entry.attempt = None;
                if result.is_err() {
                    entry.state = RouteState::Disconnected;
                    entry.tunnel_id = None;
                }
            }
        }

        if let Err(e) = &result {
            warn!(%route, error = %e, "connection attempt failed");
        }
        let _ = tx.send(Some(result));
    }

    async fn connect_route(
        &self,
        route: &RouteKey,
        account: &Account,
        request: &RegionRequest,
        cancel: &AtomicBool,
    ) -> Result<TunnelId, EngineError> {
        // Server selection. The catalog read may block (store I/O), so it
        // runs off the async worker.
        let catalog = self.catalog.clone();
        let region = request.region.clone();
        let servers = tokio::task::spawn_blocking(move || catalog.fetch(&region, false))
            .await
            .map_err(|e| EngineError::Store(e.to_string()))??;

        let mut candidates: Vec<_> = servers
            .into_iter()
            .filter(|c| c.has_features(&request.required_features))
            .collect();
        candidates.truncate(self.config.max_candidates);
        if candidates.is_empty() {
            return Err(EngineError::NoReachableServer(request.region.clone()));
        }

        let reachable = probe_candidates(candidates, self.config.probe_timeout()).await;
        let Some((winner, latency)) = reachable.into_iter().next() else {
            return Err(EngineError::NoReachableServer(request.region.clone()));
        };
        info!(%route, server = %winner.host, latency_ms = latency.as_millis() as u64, "server selected");

        if cancel.load(Ordering::SeqCst) {
            return Err(EngineError::Cancelled);
        }
        self.set_state(route, RouteState::Connecting);
        let result = self
            .establish(route, account, request, &winner.host, winner.port, cancel)
            .await;
        if result.as_ref().is_err_and(|e| *e != EngineError::Cancelled) {
            // Selection failures above leave the queue for a later retry;
            // a failed handshake discards this attempt's packets. A
            // cancelled attempt's buffer was already cleared by the
            // disconnect, and may since hold a successor's packets.
            self.buffers.clear(route);
        }
        result
    }

    async fn establish(
        &self,
        route: &RouteKey,
        account: &Account,
        request: &RegionRequest,
        host: &str,
        port: u16,
        cancel: &AtomicBool,
    ) -> Result<TunnelId, EngineError> {
        let protocol = request.protocol.unwrap_or(ProtocolKind::WireGuard);
        let credentials = self
            .credentials
            .get(account)?
            .ok_or_else(|| EngineError::Config(format!("no credentials for account {}", account.id)))?;
        let config = TunnelConfig::new(protocol, host, port);
        let tunnel_id = route.tunnel_id();

        let client = {
            let mut clients = self.clients.lock().expect("clients lock poisoned");
            // Checked under the clients lock: a disconnect that fired
            // during the credential fetch must not see us register a
            // session afterwards.
            if cancel.load(Ordering::SeqCst) {
                return Err(EngineError::Cancelled);
            }
            // At most one live session per tunnel id.
            if let Some(stale) = clients.remove(&tunnel_id) {
                warn!(tunnel = %tunnel_id, "replacing stale session");
                stale.disconnect();
            }
            let client = Arc::new(TunnelClient::new(
                tunnel_id.clone(),
                protocol,
                self.engines.for_protocol(protocol),
            ));
            let inbound_tx = self.inbound_tx.clone();
            client.set_inbound_callback(Arc::new(move |packet| {
                let _ = inbound_tx.send(packet.to_vec());
            }));
            clients.insert(tunnel_id.clone(), client.clone());
            client
        };

        if !client.connect(config, credentials) {
            let error = self.client_error(&client);
            self.drop_client_if(&tunnel_id, &client);
            return Err(error);
        }

        // connect() returning true only means the attempt is under way;
        // wait for observed connectivity.
        let deadline = Instant::now() + self.config.handshake_timeout();
        while !client.is_connected() {
            if cancel.load(Ordering::SeqCst) {
                self.drop_client_if(&tunnel_id, &client);
                return Err(EngineError::Cancelled);
            }
            if client.state() == ClientState::Error {
                let error = self.client_error(&client);
                self.drop_client_if(&tunnel_id, &client);
                return Err(error);
            }
            if Instant::now() >= deadline {
                self.drop_client_if(&tunnel_id, &client);
                return Err(EngineError::Transport("handshake timed out".into()));
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        // Drain-then-flip, under the same lock direct forwards take. A
        // disconnect racing the handshake removed the entry and set the
        // flag; the session we just built is an orphan and goes down
        // with us.
        let mut routes = self.routes.lock().expect("routes lock poisoned");
        if cancel.load(Ordering::SeqCst) || !routes.contains_key(route) {
            drop(routes);
            self.drop_client_if(&tunnel_id, &client);
            return Err(EngineError::Cancelled);
        }
        let drained = self.buffers.drain(route);
        let flushed = drained.len();
        for packet in drained {
            client.send_packet(&packet.0);
        }
        if let Some(entry) = routes.get_mut(route) {
            entry.state = RouteState::Connected;
            entry.tunnel_id = Some(tunnel_id.clone());
            entry.last_activity = Instant::now();
        }
        drop(routes);

        info!(%route, tunnel = %tunnel_id, flushed, "route connected");
        Ok(tunnel_id)
    }

    /// Hand an outbound packet toward a route: straight to the tunnel
    /// when connected, into the bounded buffer otherwise. Never
    /// suspends.
    pub fn forward_or_buffer(&self, route: &RouteKey, packet: Vec<u8>) -> ForwardOutcome {
        let mut routes = self.routes.lock().expect("routes lock poisoned");
        match routes.get_mut(route) {
            Some(entry) if entry.state.is_connected() => {
                let tunnel_id = entry.tunnel_id.clone().unwrap_or_else(|| route.tunnel_id());
                let client = self
                    .clients
                    .lock()
                    .expect("clients lock poisoned")
                    .get(&tunnel_id)
                    .cloned();
                match client {
                    Some(client) if client.is_connected() => {
                        entry.last_activity = Instant::now();
                        client.send_packet(&packet);
                        ForwardOutcome::Forwarded
                    }
                    // Session vanished or died under us (transport loss,
                    // auth revoked). Sending would silently drop, and
                    // refreshing the activity clock would starve idle
                    // eviction; treat as a fresh route instead.
                    _ => {
                        warn!(%route, tunnel = %tunnel_id, "tunnel session lost, rebuffering");
                        entry.state = RouteState::Disconnected;
                        entry.tunnel_id = None;
                        self.drop_client(&tunnel_id);
                        self.buffers.enqueue(route, packet);
                        ForwardOutcome::BufferedNeedsConnect
                    }
                }
            }
            Some(entry) if entry.state.is_pending() => {
                entry.last_activity = Instant::now();
                self.buffers.enqueue(route, packet);
                ForwardOutcome::Buffered
            }
            _ => {
                self.buffers.enqueue(route, packet);
                ForwardOutcome::BufferedNeedsConnect
            }
        }
    }

    /// Refresh a route's activity clock without touching traffic.
    pub fn touch(&self, route: &RouteKey) {
        let mut routes = self.routes.lock().expect("routes lock poisoned");
        if let Some(entry) = routes.get_mut(route) {
            entry.last_activity = Instant::now();
        }
    }

    /// Cancel any in-flight work, disconnect the tunnel, clear the
    /// buffer, and forget the route. Safe when no entry exists.
    pub fn disconnect(&self, route: &RouteKey) {
        let entry = self.routes.lock().expect("routes lock poisoned").remove(route);
        if let Some(entry) = entry {
            if let Some(attempt) = entry.attempt {
                // Cancellation is a flag, not an abort: the attempt task
                // finishes its current stage, sees the flag at the next
                // boundary, and tears down whatever session it created.
                attempt.cancel.store(true, Ordering::SeqCst);
            }
        }
        self.drop_client(&route.tunnel_id());
        self.buffers.clear(route);
        info!(%route, "route disconnected");
    }

    /// Tear down every route (engine shutdown, fatal interface loss).
    pub fn disconnect_all(&self) {
        let routes: Vec<RouteKey> = self
            .routes
            .lock()
            .expect("routes lock poisoned")
            .keys()
            .cloned()
            .collect();
        for route in routes {
            self.disconnect(&route);
        }
    }

    /// Disconnect and remove every connected route idle beyond the
    /// configured threshold.
    pub fn evict_idle(&self) {
        let idle_timeout = self.config.idle_timeout();
        let idle: Vec<RouteKey> = {
            let routes = self.routes.lock().expect("routes lock poisoned");
            routes
                .iter()
                .filter(|(_, entry)| {
                    entry.state.is_connected() && entry.last_activity.elapsed() >= idle_timeout
                })
                .map(|(route, _)| route.clone())
                .collect()
        };
        for route in idle {
            info!(%route, "idle eviction");
            self.disconnect(&route);
        }
    }

    /// Periodic idle-eviction sweep. Tunnels are costly; nobody gets to
    /// hold one open without traffic.
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let orchestrator = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(orchestrator.config.sweep_interval());
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                orchestrator.evict_idle();
            }
        })
    }

    pub fn route_state(&self, route: &RouteKey) -> RouteState {
        self.routes
            .lock()
            .expect("routes lock poisoned")
            .get(route)
            .map_or(RouteState::Disconnected, |entry| entry.state)
    }

    /// The recorded tunnel id of a connected route.
    pub fn connected_tunnel(&self, route: &RouteKey) -> Option<TunnelId> {
        let routes = self.routes.lock().expect("routes lock poisoned");
        routes
            .get(route)
            .filter(|entry| entry.state.is_connected())
            .and_then(|entry| entry.tunnel_id.clone())
    }

    pub fn client_for(&self, tunnel_id: &TunnelId) -> Option<Arc<TunnelClient>> {
        self.clients
            .lock()
            .expect("clients lock poisoned")
            .get(tunnel_id)
            .cloned()
    }

    fn set_state(&self, route: &RouteKey, state: RouteState) {
        let mut routes = self.routes.lock().expect("routes lock poisoned");
        if let Some(entry) = routes.get_mut(route) {
            entry.state = state;
        }
    }

    fn client_error(&self, client: &TunnelClient) -> EngineError {
        client
            .last_error()
            .map(EngineError::from)
            .unwrap_or_else(|| EngineError::Transport("engine refused session".into()))
    }

    fn drop_client(&self, tunnel_id: &TunnelId) {
        let client = self
            .clients
            .lock()
            .expect("clients lock poisoned")
            .remove(tunnel_id);
        if let Some(client) = client {
            client.disconnect();
        }
    }

    /// Remove and disconnect `client` only while it is still the
    /// registered session for `tunnel_id`. A cancelled attempt cleaning
    /// up after itself must not take down a successor's session.
    fn drop_client_if(&self, tunnel_id: &TunnelId, client: &Arc<TunnelClient>) {
        let registered = {
            let mut clients = self.clients.lock().expect("clients lock poisoned");
            match clients.get(tunnel_id) {
                Some(current) if Arc::ptr_eq(current, client) => {
                    clients.remove(tunnel_id);
                    true
                }
                _ => false,
            }
        };
        if registered {
            client.disconnect();
        }
    }
}
