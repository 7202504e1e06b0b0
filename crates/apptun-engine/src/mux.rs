//! Virtual interface multiplexing.
//!
//! All applications share one virtual network interface. A single read
//! loop pulls outbound packets off it, keys each by flow, asks the
//! connection tracker which way the owning app routes, and either hands
//! the packet to the direct sink or toward its tunnel. A single writer
//! thread funnels every tunnel's decrypted inbound traffic back onto
//! the interface, so interface writes are never interleaved.

use crate::orchestrator::{ForwardOutcome, JitOrchestrator};
use crate::packet::parse_flow;
use crate::route::RouteKey;
use crate::stores::Account;
use crate::catalog::RegionRequest;
use crate::error::EngineError;
use apptun_rules::RouteDecision;
use apptun_track::ConnectionTracker;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use tracing::{debug, error, trace, warn};

/// The shared virtual network interface.
///
/// `read_packet` blocks until a packet arrives, returns `Ok(None)` on a
/// clean close, and `Err` on interface loss. Implementations wrap the
/// host's TUN device or an in-memory pipe in tests.
pub trait VirtualInterface: Send + Sync {
    fn read_packet(&self) -> Result<Option<Vec<u8>>, EngineError>;
    fn write_packet(&self, packet: &[u8]) -> Result<(), EngineError>;
    /// Unblock any pending read and make subsequent reads return
    /// `Ok(None)`.
    fn shutdown(&self);
}

/// Where non-tunneled traffic goes (the host's plain network path).
pub trait DirectSink: Send + Sync {
    fn send_direct(&self, packet: &[u8]);
}

/// Traffic counters, one snapshot per call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MuxStats {
    pub outbound_direct: u64,
    pub outbound_tunneled: u64,
    pub outbound_unparsed: u64,
    pub inbound_written: u64,
}

struct MuxInner {
    tracker: Arc<ConnectionTracker>,
    orchestrator: Arc<JitOrchestrator>,
    interface: Arc<dyn VirtualInterface>,
    direct: Arc<dyn DirectSink>,
    account: Account,
    runtime: tokio::runtime::Handle,
    outbound_direct: AtomicU64,
    outbound_tunneled: AtomicU64,
    outbound_unparsed: AtomicU64,
    inbound_written: AtomicU64,
}

/// Owns the interface read loop and the single inbound writer.
pub struct PacketMultiplexer {
    inner: Arc<MuxInner>,
    read_thread: Option<thread::JoinHandle<()>>,
    write_thread: Option<thread::JoinHandle<()>>,
    writer_stop: Option<crossbeam_channel::Sender<()>>,
}

impl PacketMultiplexer {
    pub fn new(
        tracker: Arc<ConnectionTracker>,
        orchestrator: Arc<JitOrchestrator>,
        interface: Arc<dyn VirtualInterface>,
        direct: Arc<dyn DirectSink>,
        account: Account,
        runtime: tokio::runtime::Handle,
    ) -> Self {
        Self {
            inner: Arc::new(MuxInner {
                tracker,
                orchestrator,
                interface,
                direct,
                account,
                runtime,
                outbound_direct: AtomicU64::new(0),
                outbound_tunneled: AtomicU64::new(0),
                outbound_unparsed: AtomicU64::new(0),
                inbound_written: AtomicU64::new(0),
            }),
            read_thread: None,
            write_thread: None,
            writer_stop: None,
        }
    }

    /// Spawn the read loop and the inbound writer.
    ///
    /// `inbound_rx` is the channel every tunnel client's decrypted
    /// traffic funnels into.
    pub fn start(&mut self, inbound_rx: crossbeam_channel::Receiver<Vec<u8>>) {
        let inner = self.inner.clone();
        self.read_thread = Some(
            thread::Builder::new()
                .name("mux-read".into())
                .spawn(move || inner.read_loop())
                .expect("failed to spawn interface read loop"),
        );

        let (stop_tx, stop_rx) = crossbeam_channel::bounded(1);
        self.writer_stop = Some(stop_tx);
        let inner = self.inner.clone();
        self.write_thread = Some(
            thread::Builder::new()
                .name("mux-write".into())
                .spawn(move || inner.write_loop(inbound_rx, stop_rx))
                .expect("failed to spawn interface writer"),
        );
    }

    /// Stop both loops and join them.
    pub fn stop(&mut self) {
        self.inner.interface.shutdown();
        // Dropping the stop sender unblocks the writer's select.
        self.writer_stop.take();
        if let Some(read) = self.read_thread.take() {
            let _ = read.join();
        }
        if let Some(write) = self.write_thread.take() {
            let _ = write.join();
        }
    }

    pub fn stats(&self) -> MuxStats {
        MuxStats {
            outbound_direct: self.inner.outbound_direct.load(Ordering::Relaxed),
            outbound_tunneled: self.inner.outbound_tunneled.load(Ordering::Relaxed),
            outbound_unparsed: self.inner.outbound_unparsed.load(Ordering::Relaxed),
            inbound_written: self.inner.inbound_written.load(Ordering::Relaxed),
        }
    }
}

impl MuxInner {
    fn read_loop(&self) {
        loop {
            match self.interface.read_packet() {
                Ok(Some(packet)) => self.route_outbound(packet),
                Ok(None) => {
                    debug!("interface closed, read loop exiting");
                    break;
                }
                Err(e) => {
                    // Interface loss is fatal: without the interface no
                    // route can carry traffic.
                    error!(error = %e, "virtual interface lost, tearing down all routes");
                    self.orchestrator.disconnect_all();
                    break;
                }
            }
        }
    }

    fn route_outbound(&self, packet: Vec<u8>) {
        let Some(tuple) = parse_flow(&packet) else {
            // Not per-app routable (ICMP, fragments, truncated).
            self.outbound_unparsed.fetch_add(1, Ordering::Relaxed);
            self.direct.send_direct(&packet);
            return;
        };

        // An unresolvable flow routes direct, same as a UID with no rule.
        let decision = self
            .tracker
            .lookup_with_fallback(&tuple, None)
            .map(|route| route.decision)
            .unwrap_or(RouteDecision::Direct);

        match decision {
            RouteDecision::Direct => {
                trace!(?tuple, "direct");
                self.outbound_direct.fetch_add(1, Ordering::Relaxed);
                self.direct.send_direct(&packet);
            }
            RouteDecision::Tunnel(tunnel_id) => {
                self.outbound_tunneled.fetch_add(1, Ordering::Relaxed);
                let route = RouteKey::from(&tunnel_id);
                match self.orchestrator.forward_or_buffer(&route, packet) {
                    ForwardOutcome::Forwarded | ForwardOutcome::Buffered => {}
                    ForwardOutcome::BufferedNeedsConnect => self.kick_connect(route),
                }
            }
        }
    }

    /// First packet for a disconnected route: start the JIT attempt.
    /// Fire-and-forget; failures are logged here and surface to traffic
    /// as a buffer that never drains.
    fn kick_connect(&self, route: RouteKey) {
        let orchestrator = self.orchestrator.clone();
        let account = self.account.clone();
        self.runtime.spawn(async move {
            // Keys outside the <provider>_<region> convention request
            // themselves verbatim.
            let region = route.region().unwrap_or(route.as_str()).to_string();
            let request = RegionRequest::new(region);
            if let Err(e) = orchestrator.ensure_connected(&route, &account, &request).await {
                warn!(%route, error = %e, "jit connect failed");
            }
        });
    }

    fn write_loop(
        &self,
        inbound_rx: crossbeam_channel::Receiver<Vec<u8>>,
        stop_rx: crossbeam_channel::Receiver<()>,
    ) {
        loop {
            crossbeam_channel::select! {
                recv(inbound_rx) -> msg => match msg {
                    Ok(packet) => match self.interface.write_packet(&packet) {
                        Ok(()) => {
                            self.inbound_written.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(e) => {
                            warn!(error = %e, len = packet.len(), "interface write failed, packet dropped");
                        }
                    },
                    Err(_) => break,
                },
                recv(stop_rx) -> _ => break,
            }
        }
        debug!("inbound writer exiting");
    }
}

/// In-memory interface backed by channels, for tests and host-side
/// loopback harnesses.
pub struct MemoryInterface {
    outbound_tx: crossbeam_channel::Sender<Option<Vec<u8>>>,
    outbound_rx: crossbeam_channel::Receiver<Option<Vec<u8>>>,
    written: std::sync::Mutex<Vec<Vec<u8>>>,
}

impl Default for MemoryInterface {
    fn default() -> Self {
        let (outbound_tx, outbound_rx) = crossbeam_channel::unbounded();
        Self {
            outbound_tx,
            outbound_rx,
            written: std::sync::Mutex::new(Vec::new()),
        }
    }
}

impl MemoryInterface {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `read_packet` return this packet.
    pub fn inject_outbound(&self, packet: Vec<u8>) {
        let _ = self.outbound_tx.send(Some(packet));
    }

    /// Everything written back onto the interface so far.
    pub fn written(&self) -> Vec<Vec<u8>> {
        self.written.lock().expect("interface lock poisoned").clone()
    }
}

impl VirtualInterface for MemoryInterface {
    fn read_packet(&self) -> Result<Option<Vec<u8>>, EngineError> {
        match self.outbound_rx.recv() {
            Ok(packet) => Ok(packet),
            Err(_) => Ok(None),
        }
    }

    fn write_packet(&self, packet: &[u8]) -> Result<(), EngineError> {
        self.written
            .lock()
            .expect("interface lock poisoned")
            .push(packet.to_vec());
        Ok(())
    }

    fn shutdown(&self) {
        let _ = self.outbound_tx.send(None);
    }
}

/// Direct sink that records what it saw.
#[derive(Default)]
pub struct RecordingDirectSink {
    packets: std::sync::Mutex<Vec<Vec<u8>>>,
}

impl RecordingDirectSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn packets(&self) -> Vec<Vec<u8>> {
        self.packets.lock().expect("sink lock poisoned").clone()
    }
}

impl DirectSink for RecordingDirectSink {
    fn send_direct(&self, packet: &[u8]) {
        self.packets
            .lock()
            .expect("sink lock poisoned")
            .push(packet.to_vec());
    }
}
