//! Rule model shared across the engine.

use serde::{Deserialize, Serialize};

/// Application identifier, e.g. a package name like `com.example.game`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AppId(String);

impl AppId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for AppId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AppId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Identifier of one logical tunnel, e.g. `nordvpn_UK`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TunnelId(String);

impl TunnelId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TunnelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TunnelId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Where traffic for an application (or flow) should go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteDecision {
    /// Route through the named tunnel.
    Tunnel(TunnelId),
    /// No rule: leave the traffic on the normal network path.
    Direct,
}

impl RouteDecision {
    /// The tunnel id, if this decision routes through a tunnel.
    pub fn tunnel_id(&self) -> Option<&TunnelId> {
        match self {
            RouteDecision::Tunnel(id) => Some(id),
            RouteDecision::Direct => None,
        }
    }

    pub fn is_direct(&self) -> bool {
        matches!(self, RouteDecision::Direct)
    }
}

/// One persisted rule: route `app_id`'s traffic through `tunnel_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppRule {
    pub app_id: AppId,
    pub tunnel_id: TunnelId,
}

impl AppRule {
    pub fn new(app_id: impl Into<AppId>, tunnel_id: impl Into<TunnelId>) -> Self {
        Self {
            app_id: app_id.into(),
            tunnel_id: tunnel_id.into(),
        }
    }
}

/// A change event emitted by a [`crate::RuleStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleChange {
    /// A rule was added or replaced.
    Set { app_id: AppId, tunnel_id: TunnelId },
    /// The rule for an application was removed.
    Cleared { app_id: AppId },
}

impl RuleChange {
    /// The application this change affects.
    pub fn app_id(&self) -> &AppId {
        match self {
            RuleChange::Set { app_id, .. } | RuleChange::Cleared { app_id } => app_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decision_accessors() {
        let tunneled = RouteDecision::Tunnel(TunnelId::new("nordvpn_UK"));
        assert_eq!(tunneled.tunnel_id().unwrap().as_str(), "nordvpn_UK");
        assert!(!tunneled.is_direct());
        assert!(RouteDecision::Direct.is_direct());
        assert!(RouteDecision::Direct.tunnel_id().is_none());
    }

    #[test]
    fn rule_serde_roundtrip() {
        let rule = AppRule::new("com.example.game", "nordvpn_UK");
        let json = serde_json::to_string(&rule).unwrap();
        assert_eq!(json, r#"{"app_id":"com.example.game","tunnel_id":"nordvpn_UK"}"#);
        let back: AppRule = serde_json::from_str(&json).unwrap();
        assert_eq!(back, rule);
    }

    #[test]
    fn change_app_id() {
        let set = RuleChange::Set {
            app_id: "pkg.a".into(),
            tunnel_id: "T1".into(),
        };
        assert_eq!(set.app_id().as_str(), "pkg.a");
        let cleared = RuleChange::Cleared { app_id: "pkg.a".into() };
        assert_eq!(cleared.app_id().as_str(), "pkg.a");
    }
}
