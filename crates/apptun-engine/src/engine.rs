//! Engine assembly and lifecycle.
//!
//! [`Engine`] wires the rule cache, connection tracker, packet buffers,
//! orchestrator, and multiplexer together and owns their background
//! work: the rule-change pump and the idle sweeper. Hosts construct it
//! with their own store, catalog, and interface implementations and
//! drive it through `start`/`shutdown`.

use crate::buffer::PacketBufferManager;
use crate::catalog::{CachedCatalog, ServerCatalog};
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::mux::{DirectSink, MuxStats, PacketMultiplexer, VirtualInterface};
use crate::orchestrator::{EngineSet, JitOrchestrator};
use crate::route::RouteKey;
use crate::stores::{Account, CredentialStore, ServerCacheStore};
use apptun_rules::{AppId, RuleCache, RuleChange, RuleStore, TunnelId};
use apptun_track::{AppRegistry, ConnectionTracker, TrackerStats, UidResolver};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Host-provided collaborators.
pub struct EngineDeps {
    pub store: Arc<dyn RuleStore>,
    pub registry: Arc<dyn AppRegistry>,
    pub resolver: Arc<dyn UidResolver>,
    pub catalog: Arc<dyn ServerCatalog>,
    pub server_cache: Arc<dyn ServerCacheStore>,
    pub credentials: Arc<dyn CredentialStore>,
    pub engines: EngineSet,
    pub interface: Arc<dyn VirtualInterface>,
    pub direct: Arc<dyn DirectSink>,
    pub account: Account,
}

/// One snapshot of engine-wide counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineStats {
    pub rule_count: usize,
    pub tracker: TrackerStats,
    pub mux: MuxStats,
}

/// The assembled per-app routing engine.
pub struct Engine {
    store: Arc<dyn RuleStore>,
    rules: Arc<RuleCache>,
    tracker: Arc<ConnectionTracker>,
    orchestrator: Arc<JitOrchestrator>,
    interface: Arc<dyn VirtualInterface>,
    direct: Arc<dyn DirectSink>,
    account: Account,
    mux: Mutex<Option<PacketMultiplexer>>,
    inbound_rx: Mutex<Option<crossbeam_channel::Receiver<Vec<u8>>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    pub fn new(config: EngineConfig, deps: EngineDeps) -> Self {
        let rules = Arc::new(RuleCache::new(deps.store.clone()));
        let tracker = Arc::new(ConnectionTracker::new(deps.registry, deps.resolver));
        let buffers = Arc::new(PacketBufferManager::new(
            config.buffer_max_packets,
            config.buffer_max_bytes,
        ));
        let catalog = Arc::new(CachedCatalog::new(
            deps.catalog,
            deps.server_cache,
            config.catalog_ttl(),
        ));
        let (inbound_tx, inbound_rx) = crossbeam_channel::unbounded();
        let orchestrator = Arc::new(JitOrchestrator::new(
            config,
            catalog,
            deps.credentials,
            deps.engines,
            buffers,
            inbound_tx,
        ));

        Self {
            store: deps.store,
            rules,
            tracker,
            orchestrator,
            interface: deps.interface,
            direct: deps.direct,
            account: deps.account,
            mux: Mutex::new(None),
            inbound_rx: Mutex::new(Some(inbound_rx)),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Load the persisted rules, start the background pumps, and begin
    /// multiplexing the interface. Call once, from inside a runtime.
    pub async fn start(&self) -> Result<(), EngineError> {
        self.rules
            .refresh()
            .map_err(|e| EngineError::Store(e.to_string()))?;
        let rules = self
            .store
            .load_all()
            .map_err(|e| EngineError::Store(e.to_string()))?;
        for rule in &rules {
            if !self
                .tracker
                .bind_application_to_tunnel(&rule.app_id, rule.tunnel_id.clone())
            {
                warn!(app = %rule.app_id, "rule references an unresolvable application");
            }
        }
        info!(rules = rules.len(), "engine starting");

        let mut tasks = self.tasks.lock().expect("task list poisoned");
        tasks.push(self.spawn_rule_pump());
        tasks.push(self.orchestrator.spawn_sweeper());
        drop(tasks);

        let inbound_rx = self
            .inbound_rx
            .lock()
            .expect("inbound slot poisoned")
            .take()
            .ok_or_else(|| EngineError::Config("engine already started".into()))?;
        let mut mux = PacketMultiplexer::new(
            self.tracker.clone(),
            self.orchestrator.clone(),
            self.interface.clone(),
            self.direct.clone(),
            self.account.clone(),
            tokio::runtime::Handle::current(),
        );
        mux.start(inbound_rx);
        *self.mux.lock().expect("mux slot poisoned") = Some(mux);
        Ok(())
    }

    /// Stop multiplexing, cancel background work, and tear down every
    /// route. Idempotent.
    pub fn shutdown(&self) {
        info!("engine shutting down");
        if let Some(mut mux) = self.mux.lock().expect("mux slot poisoned").take() {
            mux.stop();
        }
        for task in self.tasks.lock().expect("task list poisoned").drain(..) {
            task.abort();
        }
        self.orchestrator.disconnect_all();
    }

    /// Apply rule changes as the store pushes them: the cache snapshot
    /// swaps, and the tracker's UID bindings follow.
    fn spawn_rule_pump(&self) -> JoinHandle<()> {
        let mut changes = self.store.changes();
        let rules = self.rules.clone();
        let tracker = self.tracker.clone();
        tokio::spawn(async move {
            while let Some(change) = changes.recv().await {
                debug!(app = %change.app_id(), "rule change");
                rules.apply(&change);
                match &change {
                    RuleChange::Set { app_id, tunnel_id } => {
                        if !tracker.bind_application_to_tunnel(app_id, tunnel_id.clone()) {
                            warn!(app = %app_id, "rule set for unresolvable application");
                        }
                    }
                    RuleChange::Cleared { app_id } => {
                        // No rule means direct; dropping the UID state gets
                        // the next packet there through the normal fallback.
                        tracker.clear_for_application(app_id);
                    }
                }
            }
        })
    }

    /// Bind an application to a tunnel imperatively, without going
    /// through the rule store. Fails when the application's UID cannot
    /// be resolved; persisted rules tolerate that softly at load, but a
    /// direct request deserves the real answer.
    pub fn bind_application(&self, app_id: &AppId, tunnel_id: TunnelId) -> Result<(), EngineError> {
        if self.tracker.bind_application_to_tunnel(app_id, tunnel_id) {
            Ok(())
        } else {
            Err(EngineError::Resolution(format!(
                "no UID known for application {app_id}"
            )))
        }
    }

    /// Eagerly bring up a route (e.g. ahead of expected traffic).
    pub async fn connect_route(&self, route: &RouteKey) -> Result<(), EngineError> {
        let region = route.region().unwrap_or(route.as_str()).to_string();
        let request = crate::catalog::RegionRequest::new(region);
        self.orchestrator
            .ensure_connected(route, &self.account, &request)
            .await?;
        Ok(())
    }

    /// Tear down one route and discard its queue.
    pub fn disconnect_route(&self, route: &RouteKey) {
        self.orchestrator.disconnect(route);
        self.tracker.clear_for_tunnel(&route.tunnel_id());
    }

    pub fn statistics(&self) -> EngineStats {
        EngineStats {
            rule_count: self.rules.len(),
            tracker: self.tracker.statistics(),
            mux: self
                .mux
                .lock()
                .expect("mux slot poisoned")
                .as_ref()
                .map(|mux| mux.stats())
                .unwrap_or_default(),
        }
    }

    pub fn rules(&self) -> &Arc<RuleCache> {
        &self.rules
    }

    pub fn tracker(&self) -> &Arc<ConnectionTracker> {
        &self.tracker
    }

    pub fn orchestrator(&self) -> &Arc<JitOrchestrator> {
        &self.orchestrator
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}
