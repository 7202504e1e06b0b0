//! Per-application split-tunnel routing and connection engine.
//!
//! Applications share one virtual network interface; rules decide which
//! of them route through which VPN tunnel and which stay on the plain
//! network path. Tunnels are not pre-established: the first packet that
//! needs one triggers a just-in-time connection (server selection,
//! reachability probing, handshake) while the packet and its followers
//! wait in a bounded buffer, flushed in order the moment the tunnel is
//! up.
//!
//! The moving parts:
//!
//! - [`Engine`]: assembly and lifecycle; hosts plug in their stores,
//!   server catalog, protocol engines, and interface.
//! - [`JitOrchestrator`]: per-route connection state, single-flight
//!   attempts, buffer flushing, idle eviction.
//! - [`PacketMultiplexer`]: the interface read loop and the single
//!   inbound writer.
//! - [`PacketBufferManager`]: bounded per-route FIFO queues.
//! - [`ServerCatalog`] / [`CachedCatalog`]: the provider's server
//!   directory with a TTL'd cache and TCP reachability probing.
//!
//! Rule storage and identity live in `apptun-rules` and `apptun-track`;
//! the protocol-agnostic tunnel session state machine lives in
//! `apptun-tunnel`.

mod buffer;
mod catalog;
mod config;
mod engine;
mod error;
mod mux;
mod orchestrator;
mod packet;
mod route;
mod stores;

pub use buffer::{BufferedPacket, PacketBufferManager};
pub use catalog::{
    probe_candidates, probe_latency, CachedCatalog, MemoryCatalog, RegionRequest, ServerCandidate,
    ServerCatalog,
};
pub use config::EngineConfig;
pub use engine::{Engine, EngineDeps, EngineStats};
pub use error::EngineError;
pub use mux::{
    DirectSink, MemoryInterface, MuxStats, PacketMultiplexer, RecordingDirectSink,
    VirtualInterface,
};
pub use orchestrator::{EngineSet, ForwardOutcome, JitOrchestrator};
pub use packet::parse_flow;
pub use route::{RouteKey, RouteState};
pub use stores::{
    Account, CachedServerList, CredentialStore, MemoryCredentialStore, MemoryServerCacheStore,
    ServerCacheStore,
};
