//! Credential and server-cache store seams.
//!
//! Persisted storage belongs to the host application; the engine talks
//! to it through these narrow traits. In-memory implementations back
//! tests and hosts that do their own persistence.

use crate::catalog::ServerCandidate;
use crate::error::EngineError;
use apptun_tunnel::TunnelCredentials;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

/// The subscriber account tunnels are established for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
}

impl Account {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

/// Credential persistence.
pub trait CredentialStore: Send + Sync {
    fn get(&self, account: &Account) -> Result<Option<TunnelCredentials>, EngineError>;
    fn save(&self, account: &Account, credentials: &TunnelCredentials) -> Result<(), EngineError>;
}

/// A cached server list with its storage time, for TTL checks.
#[derive(Debug, Clone)]
pub struct CachedServerList {
    pub servers: Vec<ServerCandidate>,
    pub stored_at: Instant,
}

/// Server-list cache persistence, keyed by region.
pub trait ServerCacheStore: Send + Sync {
    fn get(&self, region: &str) -> Result<Option<CachedServerList>, EngineError>;
    fn save(&self, region: &str, servers: &[ServerCandidate]) -> Result<(), EngineError>;
}

#[derive(Default)]
pub struct MemoryCredentialStore {
    credentials: Mutex<HashMap<String, TunnelCredentials>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn get(&self, account: &Account) -> Result<Option<TunnelCredentials>, EngineError> {
        Ok(self
            .credentials
            .lock()
            .expect("credential store lock poisoned")
            .get(&account.id)
            .cloned())
    }

    fn save(&self, account: &Account, credentials: &TunnelCredentials) -> Result<(), EngineError> {
        self.credentials
            .lock()
            .expect("credential store lock poisoned")
            .insert(account.id.clone(), credentials.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryServerCacheStore {
    lists: Mutex<HashMap<String, CachedServerList>>,
}

impl MemoryServerCacheStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ServerCacheStore for MemoryServerCacheStore {
    fn get(&self, region: &str) -> Result<Option<CachedServerList>, EngineError> {
        Ok(self
            .lists
            .lock()
            .expect("server cache lock poisoned")
            .get(region)
            .cloned())
    }

    fn save(&self, region: &str, servers: &[ServerCandidate]) -> Result<(), EngineError> {
        self.lists.lock().expect("server cache lock poisoned").insert(
            region.to_string(),
            CachedServerList {
                servers: servers.to_vec(),
                stored_at: Instant::now(),
            },
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credential_store_roundtrip() {
        let store = MemoryCredentialStore::new();
        let account = Account::new("acct-1");
        assert_eq!(store.get(&account).unwrap(), None);

        let creds = TunnelCredentials::from_raw("alice", b"token");
        store.save(&account, &creds).unwrap();
        assert_eq!(store.get(&account).unwrap(), Some(creds));
    }

    #[test]
    fn server_cache_records_storage_time() {
        let store = MemoryServerCacheStore::new();
        let servers = vec![ServerCandidate::new("uk1.example.net", 443)];
        store.save("UK", &servers).unwrap();

        let cached = store.get("UK").unwrap().unwrap();
        assert_eq!(cached.servers, servers);
        assert!(cached.stored_at.elapsed().as_secs() < 1);
        assert!(store.get("DE").unwrap().is_none());
    }
}
