//! Rule store contract.
//!
//! The persisted store itself (database, preferences file) belongs to the
//! configuration layer. The engine only needs two things from it: a full
//! read for cache rebuilds, and a stream of change notifications.

use crate::rule::{AppId, AppRule, RuleChange, TunnelId};
use std::collections::HashMap;
use std::sync::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;

/// Rule store errors.
#[derive(Debug, Clone, Error)]
pub enum RuleError {
    #[error("rule store read failed: {0}")]
    Store(String),

    #[error("malformed rule data: {0}")]
    Parse(String),
}

/// Contract for the persisted application→tunnel rule store.
///
/// `load_all` is called from cache refreshes, never from the packet hot
/// path, so a blocking read is acceptable. Changes are pushed through the
/// receiver returned by [`RuleStore::changes`].
pub trait RuleStore: Send + Sync {
    /// Read the complete rule set.
    fn load_all(&self) -> Result<Vec<AppRule>, RuleError>;

    /// Subscribe to rule changes. Every subscriber sees every change made
    /// after the call.
    fn changes(&self) -> mpsc::UnboundedReceiver<RuleChange>;
}

/// In-memory rule store.
///
/// The default store for tests and for hosts that keep rules in their own
/// settings layer and push them into the engine at startup.
#[derive(Default)]
pub struct MemoryRuleStore {
    rules: Mutex<HashMap<AppId, TunnelId>>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<RuleChange>>>,
}

impl MemoryRuleStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a rule and notify subscribers.
    pub fn set_rule(&self, app_id: impl Into<AppId>, tunnel_id: impl Into<TunnelId>) {
        let app_id = app_id.into();
        let tunnel_id = tunnel_id.into();
        self.rules
            .lock()
            .expect("rule store lock poisoned")
            .insert(app_id.clone(), tunnel_id.clone());
        self.notify(RuleChange::Set { app_id, tunnel_id });
    }

    /// Remove an application's rule and notify subscribers.
    pub fn clear_rule(&self, app_id: impl Into<AppId>) {
        let app_id = app_id.into();
        self.rules
            .lock()
            .expect("rule store lock poisoned")
            .remove(&app_id);
        self.notify(RuleChange::Cleared { app_id });
    }

    fn notify(&self, change: RuleChange) {
        let mut subscribers = self.subscribers.lock().expect("subscriber lock poisoned");
        // Drop subscribers whose receiver side is gone.
        subscribers.retain(|tx| tx.send(change.clone()).is_ok());
    }
}

impl RuleStore for MemoryRuleStore {
    fn load_all(&self) -> Result<Vec<AppRule>, RuleError> {
        let rules = self.rules.lock().expect("rule store lock poisoned");
        Ok(rules
            .iter()
            .map(|(app_id, tunnel_id)| AppRule {
                app_id: app_id.clone(),
                tunnel_id: tunnel_id.clone(),
            })
            .collect())
    }

    fn changes(&self) -> mpsc::UnboundedReceiver<RuleChange> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .expect("subscriber lock poisoned")
            .push(tx);
        rx
    }
}
