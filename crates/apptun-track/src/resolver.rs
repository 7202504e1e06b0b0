//! UID and application identity seams.

use apptun_rules::AppId;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::RwLock;

/// OS-level numeric identity of the process owning a socket.
pub type Uid = u32;

/// Transport protocol of a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    Tcp,
    Udp,
}

/// The socket tuple of one flow as seen on the shared interface.
///
/// The remote side is optional: unconnected UDP sockets have no stable
/// remote address in the OS table, and matching is anchored on the local
/// side either way.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketTuple {
    pub transport: Transport,
    pub local: SocketAddr,
    pub remote: Option<SocketAddr>,
}

impl SocketTuple {
    pub fn new(transport: Transport, local: SocketAddr, remote: Option<SocketAddr>) -> Self {
        Self {
            transport,
            local,
            remote,
        }
    }
}

/// Resolves the owning UID of a socket tuple.
///
/// One implementation per target OS; [`crate::ProcNetResolver`] covers
/// Linux-derived systems. Implementations may block briefly (procfs
/// reads) and are only called on socket-cache misses.
pub trait UidResolver: Send + Sync {
    fn resolve(&self, tuple: &SocketTuple) -> Option<Uid>;
}

/// Resolves an application id to its UID.
///
/// On Android this is the package manager; on desktops a process table.
/// Unknown applications resolve to `None`, never an error.
pub trait AppRegistry: Send + Sync {
    fn resolve_uid(&self, app_id: &AppId) -> Option<Uid>;
}

/// In-memory registry, for tests and for hosts that push the app→UID
/// table in from their own platform layer.
#[derive(Default)]
pub struct MemoryAppRegistry {
    uids: RwLock<HashMap<AppId, Uid>>,
}

impl MemoryAppRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, app_id: impl Into<AppId>, uid: Uid) {
        self.uids
            .write()
            .expect("app registry lock poisoned")
            .insert(app_id.into(), uid);
    }

    pub fn remove(&self, app_id: &AppId) {
        self.uids
            .write()
            .expect("app registry lock poisoned")
            .remove(app_id);
    }
}

impl AppRegistry for MemoryAppRegistry {
    fn resolve_uid(&self, app_id: &AppId) -> Option<Uid> {
        self.uids
            .read()
            .expect("app registry lock poisoned")
            .get(app_id)
            .copied()
    }
}
