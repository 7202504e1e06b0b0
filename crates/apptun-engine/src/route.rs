//! Route identity and per-route connection state.

use apptun_rules::TunnelId;
use serde::{Deserialize, Serialize};

/// Identifier of one logical packet-routing destination group,
/// conventionally `<provider>_<region>`, e.g. `nordvpn_UK`.
///
/// One RouteKey owns at most one connection entry, one buffered-packet
/// queue, and one tunnel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RouteKey(String);

impl RouteKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The region suffix, when the key follows the
    /// `<provider>_<region>` convention.
    pub fn region(&self) -> Option<&str> {
        self.0.rsplit_once('_').map(|(_, region)| region)
    }

    /// The tunnel id this route connects as. One route, one tunnel.
    pub fn tunnel_id(&self) -> TunnelId {
        TunnelId::new(self.0.clone())
    }
}

impl std::fmt::Display for RouteKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RouteKey {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<&TunnelId> for RouteKey {
    fn from(id: &TunnelId) -> Self {
        Self::new(id.as_str())
    }
}

/// Connection lifecycle of one route.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteState {
    Disconnected,
    SelectingServer,
    Connecting,
    Connected,
    Disconnecting,
}

impl RouteState {
    pub fn is_connected(&self) -> bool {
        matches!(self, RouteState::Connected)
    }

    /// An attempt is under way; callers should await it rather than
    /// start another.
    pub fn is_pending(&self) -> bool {
        matches!(self, RouteState::SelectingServer | RouteState::Connecting)
    }
}
