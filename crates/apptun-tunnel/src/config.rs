//! Tunnel configuration and credentials.

use crate::TunnelError;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};

/// The tunnel protocol family driving a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolKind {
    /// Event-driven engine; requires an explicit down→up cycle after a
    /// network change.
    OpenVpn,
    /// Self-healing engine; survives network changes on its own.
    WireGuard,
}

impl ProtocolKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProtocolKind::OpenVpn => "openvpn",
            ProtocolKind::WireGuard => "wireguard",
        }
    }
}

impl std::fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Generated per-connection configuration handed to an engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelConfig {
    pub protocol: ProtocolKind,
    /// Server endpoint, hostname or literal address.
    pub server_host: String,
    pub server_port: u16,
    /// Interface MTU the engine should assume.
    #[serde(default = "default_mtu")]
    pub mtu: u16,
}

fn default_mtu() -> u16 {
    1420
}

impl TunnelConfig {
    pub fn new(protocol: ProtocolKind, server_host: impl Into<String>, server_port: u16) -> Self {
        Self {
            protocol,
            server_host: server_host.into(),
            server_port,
            mtu: default_mtu(),
        }
    }

    /// Check the config before any engine or network activity.
    pub fn validate(&self) -> Result<(), TunnelError> {
        if self.server_host.trim().is_empty() {
            return Err(TunnelError::Config("empty server host".into()));
        }
        if self.server_port == 0 {
            return Err(TunnelError::Config("server port is zero".into()));
        }
        if !(576..=9000).contains(&self.mtu) {
            return Err(TunnelError::Config(format!("mtu {} out of range", self.mtu)));
        }
        Ok(())
    }
}

/// Credentials for one connection attempt.
///
/// The material itself is opaque to this engine (an OpenVPN auth token,
/// a WireGuard keypair blob) and travels base64-encoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelCredentials {
    pub username: String,
    /// Base64-encoded, protocol-specific secret material.
    pub secret: String,
}

impl TunnelCredentials {
    pub fn new(username: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            secret: secret.into(),
        }
    }

    /// Wrap raw secret material.
    pub fn from_raw(username: impl Into<String>, raw: &[u8]) -> Self {
        Self::new(username, BASE64.encode(raw))
    }

    /// Check shape before any engine or network activity. The username
    /// may be empty (key-only protocols); the secret must be non-empty,
    /// well-formed base64.
    pub fn validate(&self) -> Result<(), TunnelError> {
        if self.secret.is_empty() {
            return Err(TunnelError::Config("empty credential secret".into()));
        }
        BASE64
            .decode(&self.secret)
            .map_err(|e| TunnelError::Config(format!("credential secret is not base64: {e}")))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_config_passes() {
        let config = TunnelConfig::new(ProtocolKind::WireGuard, "vpn.example.net", 51820);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn malformed_configs_fail_fast() {
        let mut config = TunnelConfig::new(ProtocolKind::OpenVpn, "", 1194);
        assert!(matches!(config.validate(), Err(TunnelError::Config(_))));

        config.server_host = "vpn.example.net".into();
        config.server_port = 0;
        assert!(matches!(config.validate(), Err(TunnelError::Config(_))));

        config.server_port = 1194;
        config.mtu = 100;
        assert!(matches!(config.validate(), Err(TunnelError::Config(_))));
    }

    #[test]
    fn credentials_roundtrip_and_validate() {
        let creds = TunnelCredentials::from_raw("alice", b"secret-key-material");
        assert!(creds.validate().is_ok());

        let empty = TunnelCredentials::new("alice", "");
        assert!(matches!(empty.validate(), Err(TunnelError::Config(_))));

        let garbage = TunnelCredentials::new("", "not base64 at all!!!");
        assert!(matches!(garbage.validate(), Err(TunnelError::Config(_))));
    }
}
