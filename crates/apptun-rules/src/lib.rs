//! Per-application routing rules.
//!
//! Applications are mapped to tunnels by rules kept in a persisted store
//! (owned by the configuration layer, not by this crate). This crate holds
//! the in-memory side of that relationship:
//!
//! - [`RuleCache`]: an atomically-swapped snapshot of the full rule set,
//!   giving the packet hot path an O(1), never-blocking lookup.
//! - [`RuleStore`]: the contract a persisted store must satisfy, including
//!   a change-notification stream.
//!
//! The cache is rebuilt wholesale on every change notification so readers
//! always observe a consistent snapshot, never a half-applied update.

mod cache;
mod rule;
mod store;

pub use cache::RuleCache;
pub use rule::{AppId, AppRule, RouteDecision, RuleChange, TunnelId};
pub use store::{MemoryRuleStore, RuleError, RuleStore};
