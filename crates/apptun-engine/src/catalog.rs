//! Server catalog and reachability probing.
//!
//! The provider's server directory is an external collaborator reached
//! through [`ServerCatalog`]; a TTL'd cache in front of it keeps route
//! establishment from hammering the provider API. Candidates are probed
//! over TCP before a winner is picked, so a stale catalog entry cannot
//! absorb a connection attempt.

use crate::error::EngineError;
use crate::stores::ServerCacheStore;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::task::JoinSet;
use tracing::{debug, trace, warn};

use apptun_tunnel::ProtocolKind;

/// One server offered by the provider for a region.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerCandidate {
    pub host: String,
    pub port: u16,
    /// Provider feature tags, e.g. `p2p`, `obfuscated`.
    #[serde(default)]
    pub features: Vec<String>,
}

impl ServerCandidate {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            features: Vec::new(),
        }
    }

    pub fn with_features(mut self, features: &[&str]) -> Self {
        self.features = features.iter().map(|f| f.to_string()).collect();
        self
    }

    pub fn has_features(&self, required: &[String]) -> bool {
        required.iter().all(|f| self.features.contains(f))
    }
}

/// What the configuration layer asks for when a route connects.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RegionRequest {
    pub region: String,
    /// Preferred protocol; the engine defaults when unset.
    pub protocol: Option<ProtocolKind>,
    /// Feature tags every candidate must carry.
    pub required_features: Vec<String>,
}

impl RegionRequest {
    pub fn new(region: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            ..Self::default()
        }
    }
}

/// The provider's server directory.
///
/// `force` bypasses any caching layer; a plain provider implementation
/// may ignore it.
pub trait ServerCatalog: Send + Sync {
    fn fetch(&self, region: &str, force: bool) -> Result<Vec<ServerCandidate>, EngineError>;
}

/// TTL'd cache in front of a provider catalog.
pub struct CachedCatalog {
    provider: Arc<dyn ServerCatalog>,
    cache: Arc<dyn ServerCacheStore>,
    ttl: Duration,
}

impl CachedCatalog {
    pub fn new(provider: Arc<dyn ServerCatalog>, cache: Arc<dyn ServerCacheStore>, ttl: Duration) -> Self {
        Self { provider, cache, ttl }
    }
}

impl ServerCatalog for CachedCatalog {
    fn fetch(&self, region: &str, force: bool) -> Result<Vec<ServerCandidate>, EngineError> {
        if !force {
            match self.cache.get(region) {
                Ok(Some(cached)) if cached.stored_at.elapsed() < self.ttl => {
                    trace!(region, servers = cached.servers.len(), "catalog cache hit");
                    return Ok(cached.servers);
                }
                Ok(_) => {}
                Err(e) => warn!(region, error = %e, "server cache read failed"),
            }
        }

        let servers = self.provider.fetch(region, force)?;
        if let Err(e) = self.cache.save(region, &servers) {
            warn!(region, error = %e, "server cache write failed");
        }
        debug!(region, servers = servers.len(), "catalog fetched from provider");
        Ok(servers)
    }
}

/// Fixed catalog, for tests and offline hosts.
#[derive(Default)]
pub struct MemoryCatalog {
    regions: std::sync::Mutex<std::collections::HashMap<String, Vec<ServerCandidate>>>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_region(&self, region: impl Into<String>, servers: Vec<ServerCandidate>) {
        self.regions
            .lock()
            .expect("catalog lock poisoned")
            .insert(region.into(), servers);
    }
}

impl ServerCatalog for MemoryCatalog {
    fn fetch(&self, region: &str, _force: bool) -> Result<Vec<ServerCandidate>, EngineError> {
        Ok(self
            .regions
            .lock()
            .expect("catalog lock poisoned")
            .get(region)
            .cloned()
            .unwrap_or_default())
    }
}

/// TCP-probe one candidate; `None` when unreachable within the budget.
pub async fn probe_latency(candidate: &ServerCandidate, timeout: Duration) -> Option<Duration> {
    let started = Instant::now();
    match tokio::time::timeout(timeout, TcpStream::connect((candidate.host.as_str(), candidate.port)))
        .await
    {
        Ok(Ok(_stream)) => Some(started.elapsed()),
        Ok(Err(e)) => {
            trace!(host = %candidate.host, error = %e, "probe failed");
            None
        }
        Err(_) => {
            trace!(host = %candidate.host, "probe timed out");
            None
        }
    }
}

/// Probe candidates concurrently and return the reachable ones with
/// their measured latency, fastest first. Ties are broken randomly so
/// equally-close servers share the load.
pub async fn probe_candidates(
    candidates: Vec<ServerCandidate>,
    timeout: Duration,
) -> Vec<(ServerCandidate, Duration)> {
    let mut probes = JoinSet::new();
    for candidate in candidates {
        probes.spawn(async move {
            let latency = probe_latency(&candidate, timeout).await;
            (candidate, latency)
        });
    }

    let mut reachable = Vec::new();
    while let Some(result) = probes.join_next().await {
        if let Ok((candidate, Some(latency))) = result {
            reachable.push((candidate, latency));
        }
    }

    reachable.shuffle(&mut rand::thread_rng());
    reachable.sort_by_key(|(_, latency)| *latency);
    reachable
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stores::MemoryServerCacheStore;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::net::TcpListener;

    struct CountingProvider {
        fetches: AtomicUsize,
    }

    impl ServerCatalog for CountingProvider {
        fn fetch(&self, _region: &str, _force: bool) -> Result<Vec<ServerCandidate>, EngineError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            Ok(vec![ServerCandidate::new("uk1.example.net", 443)])
        }
    }

    #[test]
    fn cached_catalog_hits_within_ttl() {
        let provider = Arc::new(CountingProvider {
            fetches: AtomicUsize::new(0),
        });
        let catalog = CachedCatalog::new(
            provider.clone(),
            Arc::new(MemoryServerCacheStore::new()),
            Duration::from_secs(60),
        );

        catalog.fetch("UK", false).unwrap();
        catalog.fetch("UK", false).unwrap();
        assert_eq!(provider.fetches.load(Ordering::SeqCst), 1);

        // force bypasses the cache.
        catalog.fetch("UK", true).unwrap();
        assert_eq!(provider.fetches.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn expired_cache_refetches() {
        let provider = Arc::new(CountingProvider {
            fetches: AtomicUsize::new(0),
        });
        let catalog = CachedCatalog::new(
            provider.clone(),
            Arc::new(MemoryServerCacheStore::new()),
            Duration::from_secs(0),
        );
        catalog.fetch("UK", false).unwrap();
        catalog.fetch("UK", false).unwrap();
        assert_eq!(provider.fetches.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn provider_payloads_deserialize() {
        let payload = r#"[
            {"host": "uk1.example.net", "port": 51820, "features": ["p2p"]},
            {"host": "uk2.example.net", "port": 1194}
        ]"#;
        let servers: Vec<ServerCandidate> = serde_json::from_str(payload).unwrap();
        assert_eq!(servers.len(), 2);
        assert_eq!(servers[0].features, vec!["p2p".to_string()]);
        assert!(servers[1].features.is_empty());
    }

    #[test]
    fn feature_filtering() {
        let candidate = ServerCandidate::new("uk1", 443).with_features(&["p2p", "obfuscated"]);
        assert!(candidate.has_features(&["p2p".into()]));
        assert!(!candidate.has_features(&["double".into()]));
        assert!(candidate.has_features(&[]));
    }

    #[tokio::test]
    async fn probing_ranks_reachable_candidates() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let live_port = listener.local_addr().unwrap().port();

        // A port nothing listens on: refused fast.
        let dead = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_port = dead.local_addr().unwrap().port();
        drop(dead);

        let candidates = vec![
            ServerCandidate::new("127.0.0.1", dead_port),
            ServerCandidate::new("127.0.0.1", live_port),
        ];
        let reachable = probe_candidates(candidates, Duration::from_millis(500)).await;
        assert_eq!(reachable.len(), 1);
        assert_eq!(reachable[0].0.port, live_port);
    }
}
