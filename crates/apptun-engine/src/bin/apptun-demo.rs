//! Standalone engine demo.
//!
//! Wires the engine entirely out of in-memory components: a loopback
//! "server", a memory catalog and rule store, and the simulated tunnel
//! engine. One app is routed through a tunnel, one packet triggers the
//! just-in-time connect, and the counters are printed on the way out.

use anyhow::Result;
use apptun_engine::{
    Engine, EngineConfig, EngineDeps, EngineSet, MemoryCatalog, MemoryCredentialStore,
    MemoryInterface, MemoryServerCacheStore, RecordingDirectSink, ServerCandidate,
};
use apptun_engine::{Account, CredentialStore};
use apptun_rules::MemoryRuleStore;
use apptun_track::{MemoryAppRegistry, SocketTuple, Uid, UidResolver};
use apptun_tunnel::{MemoryTunnelEngine, TunnelCredentials};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

const DEMO_UID: Uid = 10_123;

struct DemoResolver;

impl UidResolver for DemoResolver {
    fn resolve(&self, _tuple: &SocketTuple) -> Option<Uid> {
        Some(DEMO_UID)
    }
}

/// Minimal IPv4 TCP packet carrying just the flow tuple.
fn demo_packet(src_port: u16) -> Vec<u8> {
    let mut packet = vec![0u8; 28];
    packet[0] = 0x45;
    packet[9] = 6;
    packet[12..16].copy_from_slice(&[10, 0, 0, 2]);
    packet[16..20].copy_from_slice(&[93, 184, 216, 34]);
    packet[20..22].copy_from_slice(&src_port.to_be_bytes());
    packet[22..24].copy_from_slice(&443u16.to_be_bytes());
    packet
}

#[tokio::main]
async fn main() -> Result<()> {
    FmtSubscriber::builder()
        .with_max_level(Level::DEBUG)
        .with_target(false)
        .compact()
        .init();

    info!("apptun demo starting");

    // A loopback listener stands in for a provider server, so the
    // reachability probe has something real to hit.
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let server_port = listener.local_addr()?.port();

    let catalog = Arc::new(MemoryCatalog::new());
    catalog.set_region("UK", vec![ServerCandidate::new("127.0.0.1", server_port)]);

    let store = Arc::new(MemoryRuleStore::new());
    store.set_rule("org.example.browser", "nordvpn_UK");

    let registry = Arc::new(MemoryAppRegistry::new());
    registry.insert("org.example.browser", DEMO_UID);

    let credentials = Arc::new(MemoryCredentialStore::new());
    let account = Account::new("demo-account");
    credentials.save(&account, &TunnelCredentials::from_raw("demo", b"demo-secret"))?;

    let interface = Arc::new(MemoryInterface::new());
    let direct = Arc::new(RecordingDirectSink::new());
    let tunnel_engine = Arc::new(MemoryTunnelEngine::new());

    let engine = Engine::new(
        EngineConfig::default(),
        EngineDeps {
            store,
            registry,
            resolver: Arc::new(DemoResolver),
            catalog,
            server_cache: Arc::new(MemoryServerCacheStore::new()),
            credentials,
            engines: EngineSet::single(tunnel_engine.clone()),
            interface: interface.clone(),
            direct,
            account,
        },
    );
    engine.start().await?;

    info!("injecting first packet for the routed app");
    interface.inject_outbound(demo_packet(41_000));

    // Wait for the just-in-time connect and the buffer flush.
    for _ in 0..200 {
        if !tunnel_engine.sent_packets().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let stats = engine.statistics();
    info!(
        tunneled = stats.mux.outbound_tunneled,
        direct = stats.mux.outbound_direct,
        rules = stats.rule_count,
        "traffic summary"
    );

    engine.shutdown();
    info!("apptun demo shutting down");
    Ok(())
}
