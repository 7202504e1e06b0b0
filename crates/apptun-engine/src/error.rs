//! Engine error taxonomy.

use apptun_tunnel::TunnelError;
use thiserror::Error;

/// Errors surfaced by the routing/connection engine.
///
/// `Clone` because a single connection attempt's result is broadcast to
/// every caller awaiting it.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    /// Unknown application or UID on an explicit bind request. On the
    /// traffic path resolution misses stay soft (the flow goes direct);
    /// only imperative binds surface this.
    #[error("identity resolution failed: {0}")]
    Resolution(String),

    /// No candidate server answered a reachability probe. The route
    /// fails without creating a tunnel; retry is caller-driven.
    #[error("no reachable server for region {0}")]
    NoReachableServer(String),

    /// The server rejected the credentials. Distinct from transport
    /// failure so the UI can prompt for new credentials instead of
    /// retrying.
    #[error("authentication rejected: {0}")]
    Authentication(String),

    /// Handshake or network failure. Eligible for caller-driven retry.
    #[error("transport failure: {0}")]
    Transport(String),

    /// Malformed generated configuration or credentials. An upstream
    /// bug; not auto-retried.
    #[error("configuration error: {0}")]
    Config(String),

    /// The credential or server-cache store failed.
    #[error("store failure: {0}")]
    Store(String),

    /// The in-flight connection attempt was cancelled by an explicit
    /// disconnect or engine shutdown.
    #[error("connection attempt cancelled")]
    Cancelled,
}

impl From<TunnelError> for EngineError {
    fn from(e: TunnelError) -> Self {
        match e {
            TunnelError::Config(msg) => EngineError::Config(msg),
            TunnelError::Auth(msg) => EngineError::Authentication(msg),
            TunnelError::Transport(msg) => EngineError::Transport(msg),
            TunnelError::Engine(msg) => EngineError::Transport(msg),
        }
    }
}
