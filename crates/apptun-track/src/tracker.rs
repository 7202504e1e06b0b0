//! The per-flow and per-UID routing maps.

use crate::resolver::{AppRegistry, SocketTuple, Uid, UidResolver};
use apptun_rules::{AppId, RouteDecision, TunnelId};
use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, RwLock};
use tracing::{debug, trace};

/// Key of one flow on the shared interface: its source endpoint.
type SocketKey = (IpAddr, u16);

/// A resolved routing decision for one flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketRoute {
    pub uid: Uid,
    pub decision: RouteDecision,
}

/// Counters reported by [`ConnectionTracker::statistics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TrackerStats {
    /// Live socket bindings.
    pub connection_count: usize,
    /// Applications with a resolved UID.
    pub application_count: usize,
    /// Distinct tunnels referenced by UID mappings.
    pub tunnel_count: usize,
}

/// Maps application identity to tunnels, and socket tuples to both.
///
/// The socket map is the hot-path read for every outbound packet; it is
/// populated lazily on the first packet of a flow so the O(n) OS-table
/// scan happens at most once per flow. All maps are guarded by plain
/// `RwLock`s that are never held across an await point, so readers never
/// wait on I/O.
pub struct ConnectionTracker {
    registry: Arc<dyn AppRegistry>,
    resolver: Arc<dyn UidResolver>,
    /// UID → routing decision, populated from persisted rules.
    uid_routes: RwLock<HashMap<Uid, RouteDecision>>,
    /// Application → UID memo, filled on first resolution.
    app_uids: RwLock<HashMap<AppId, Uid>>,
    /// Flow source endpoint → resolved route.
    sockets: RwLock<HashMap<SocketKey, SocketRoute>>,
}

impl ConnectionTracker {
    pub fn new(registry: Arc<dyn AppRegistry>, resolver: Arc<dyn UidResolver>) -> Self {
        Self {
            registry,
            resolver,
            uid_routes: RwLock::new(HashMap::new()),
            app_uids: RwLock::new(HashMap::new()),
            sockets: RwLock::new(HashMap::new()),
        }
    }

    /// Resolve an application to its UID and memoize the result.
    ///
    /// Unknown applications return `None` softly; the caller falls back
    /// to direct routing.
    pub fn register_application(&self, app_id: &AppId) -> Option<Uid> {
        if let Some(&uid) = self.app_uids.read().expect("app map poisoned").get(app_id) {
            return Some(uid);
        }
        let uid = self.registry.resolve_uid(app_id)?;
        self.app_uids
            .write()
            .expect("app map poisoned")
            .insert(app_id.clone(), uid);
        debug!(app = %app_id, uid, "application registered");
        Some(uid)
    }

    /// Route a UID's traffic through `tunnel_id`.
    ///
    /// Existing socket bindings of that UID are invalidated so live flows
    /// pick up the new rule on their next packet.
    pub fn bind_uid_to_tunnel(&self, uid: Uid, tunnel_id: TunnelId) {
        self.bind_uid(uid, RouteDecision::Tunnel(tunnel_id));
    }

    /// Route a UID's traffic directly, bypassing all tunnels.
    pub fn bind_uid_direct(&self, uid: Uid) {
        self.bind_uid(uid, RouteDecision::Direct);
    }

    fn bind_uid(&self, uid: Uid, decision: RouteDecision) {
        debug!(uid, ?decision, "uid bound");
        self.uid_routes
            .write()
            .expect("uid map poisoned")
            .insert(uid, decision);
        self.invalidate_sockets_for(uid);
    }

    /// Resolve an application and bind its UID. `false` when the
    /// application cannot be resolved.
    pub fn bind_application_to_tunnel(&self, app_id: &AppId, tunnel_id: TunnelId) -> bool {
        match self.register_application(app_id) {
            Some(uid) => {
                self.bind_uid_to_tunnel(uid, tunnel_id);
                true
            }
            None => {
                debug!(app = %app_id, "cannot bind unresolvable application");
                false
            }
        }
    }

    /// O(1) hot-path lookup by flow source endpoint.
    pub fn lookup_by_socket(&self, src_ip: IpAddr, src_port: u16) -> Option<SocketRoute> {
        self.sockets
            .read()
            .expect("socket map poisoned")
            .get(&(src_ip, src_port))
            .cloned()
    }

    /// Socket lookup with UID resolution on miss.
    ///
    /// On a miss the UID is resolved (via the application registry when
    /// an application id is supplied, else the OS connection table) and
    /// the socket cache is populated as a side effect, so the next
    /// [`ConnectionTracker::lookup_by_socket`] for this flow hits.
    pub fn lookup_with_fallback(
        &self,
        tuple: &SocketTuple,
        app_id: Option<&AppId>,
    ) -> Option<SocketRoute> {
        if let Some(route) = self.lookup_by_socket(tuple.local.ip(), tuple.local.port()) {
            return Some(route);
        }

        let uid = match app_id {
            Some(app_id) => self.register_application(app_id),
            None => self.resolver.resolve(tuple),
        }?;

        let decision = {
            let mut uid_routes = self.uid_routes.write().expect("uid map poisoned");
            uid_routes
                .entry(uid)
                .or_insert(RouteDecision::Direct)
                .clone()
        };

        let route = SocketRoute { uid, decision };
        trace!(local = %tuple.local, uid, "socket binding created");
        self.sockets
            .write()
            .expect("socket map poisoned")
            .insert((tuple.local.ip(), tuple.local.port()), route.clone());
        Some(route)
    }

    /// Drop the binding of one flow.
    pub fn unregister_connection(&self, src_ip: IpAddr, src_port: u16) {
        self.sockets
            .write()
            .expect("socket map poisoned")
            .remove(&(src_ip, src_port));
    }

    /// Remove a UID's mapping and every socket binding that references it.
    pub fn clear_for_uid(&self, uid: Uid) {
        self.uid_routes.write().expect("uid map poisoned").remove(&uid);
        self.invalidate_sockets_for(uid);
    }

    /// Remove an application's mapping (and its UID's state).
    pub fn clear_for_application(&self, app_id: &AppId) {
        let uid = self.app_uids.write().expect("app map poisoned").remove(app_id);
        if let Some(uid) = uid {
            self.clear_for_uid(uid);
        }
    }

    /// Remove every binding tied to `tunnel_id` (tunnel stopped).
    pub fn clear_for_tunnel(&self, tunnel_id: &TunnelId) {
        let uids: Vec<Uid> = {
            let uid_routes = self.uid_routes.read().expect("uid map poisoned");
            uid_routes
                .iter()
                .filter(|(_, decision)| decision.tunnel_id() == Some(tunnel_id))
                .map(|(&uid, _)| uid)
                .collect()
        };
        for uid in uids {
            self.clear_for_uid(uid);
        }
    }

    /// Drop everything.
    pub fn clear_all(&self) {
        self.sockets.write().expect("socket map poisoned").clear();
        self.uid_routes.write().expect("uid map poisoned").clear();
        self.app_uids.write().expect("app map poisoned").clear();
    }

    pub fn statistics(&self) -> TrackerStats {
        let connection_count = self.sockets.read().expect("socket map poisoned").len();
        let application_count = self.app_uids.read().expect("app map poisoned").len();
        let tunnel_count = {
            let uid_routes = self.uid_routes.read().expect("uid map poisoned");
            uid_routes
                .values()
                .filter_map(RouteDecision::tunnel_id)
                .collect::<HashSet<_>>()
                .len()
        };
        TrackerStats {
            connection_count,
            application_count,
            tunnel_count,
        }
    }

    fn invalidate_sockets_for(&self, uid: Uid) {
        let mut sockets = self.sockets.write().expect("socket map poisoned");
        let before = sockets.len();
        sockets.retain(|_, route| route.uid != uid);
        let dropped = before - sockets.len();
        if dropped > 0 {
            trace!(uid, dropped, "socket bindings invalidated");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::{MemoryAppRegistry, Transport};
    use std::collections::HashMap as StdHashMap;
    use std::sync::Mutex;

    /// Resolver backed by a fixed (port → uid) table.
    struct TableResolver {
        by_port: Mutex<StdHashMap<u16, Uid>>,
    }

    impl TableResolver {
        fn new(entries: &[(u16, Uid)]) -> Self {
            Self {
                by_port: Mutex::new(entries.iter().copied().collect()),
            }
        }
    }

    impl UidResolver for TableResolver {
        fn resolve(&self, tuple: &SocketTuple) -> Option<Uid> {
            self.by_port.lock().unwrap().get(&tuple.local.port()).copied()
        }
    }

    fn tracker(entries: &[(u16, Uid)]) -> (Arc<MemoryAppRegistry>, ConnectionTracker) {
        let registry = Arc::new(MemoryAppRegistry::new());
        let tracker = ConnectionTracker::new(registry.clone(), Arc::new(TableResolver::new(entries)));
        (registry, tracker)
    }

    fn tcp_tuple(local: &str) -> SocketTuple {
        SocketTuple::new(Transport::Tcp, local.parse().unwrap(), None)
    }

    #[test]
    fn register_application_is_soft_on_unknown() {
        let (registry, tracker) = tracker(&[]);
        assert_eq!(tracker.register_application(&"pkg.x".into()), None);

        registry.insert("pkg.a", 10001);
        assert_eq!(tracker.register_application(&"pkg.a".into()), Some(10001));
        // Memoized.
        registry.remove(&"pkg.a".into());
        assert_eq!(tracker.register_application(&"pkg.a".into()), Some(10001));
    }

    #[test]
    fn fallback_then_direct_lookup_agree() {
        let (_, tracker) = tracker(&[(40000, 10001)]);
        tracker.bind_uid_to_tunnel(10001, "T1".into());

        let tuple = tcp_tuple("10.0.0.2:40000");
        let via_fallback = tracker.lookup_with_fallback(&tuple, None).unwrap();
        let via_socket = tracker
            .lookup_by_socket("10.0.0.2".parse().unwrap(), 40000)
            .unwrap();
        assert_eq!(via_fallback, via_socket);
        assert_eq!(via_fallback.decision, RouteDecision::Tunnel("T1".into()));
    }

    #[test]
    fn unknown_uid_falls_back_to_direct() {
        let (_, tracker) = tracker(&[(40000, 777)]);
        let route = tracker
            .lookup_with_fallback(&tcp_tuple("10.0.0.2:40000"), None)
            .unwrap();
        assert_eq!(route.decision, RouteDecision::Direct);
        // A binding never exists without a UID mapping backing it.
        assert_eq!(tracker.statistics().connection_count, 1);
    }

    #[test]
    fn unresolvable_socket_yields_none() {
        let (_, tracker) = tracker(&[]);
        assert!(tracker
            .lookup_with_fallback(&tcp_tuple("10.0.0.2:40000"), None)
            .is_none());
        assert_eq!(tracker.statistics().connection_count, 0);
    }

    #[test]
    fn rebind_invalidates_stale_socket_bindings() {
        let (registry, tracker) = tracker(&[(40000, 10001), (40001, 10001)]);
        registry.insert("pkg.a", 10001);

        assert!(tracker.bind_application_to_tunnel(&"pkg.a".into(), "T1".into()));
        let first = tracker
            .lookup_with_fallback(&tcp_tuple("10.0.0.2:40000"), None)
            .unwrap();
        assert_eq!(first.decision, RouteDecision::Tunnel("T1".into()));

        // Rebind: the stale binding must go, fresh flows must see T2.
        assert!(tracker.bind_application_to_tunnel(&"pkg.a".into(), "T2".into()));
        assert!(tracker
            .lookup_by_socket("10.0.0.2".parse().unwrap(), 40000)
            .is_none());

        let fresh = tracker
            .lookup_with_fallback(&tcp_tuple("10.0.0.2:40001"), None)
            .unwrap();
        assert_eq!(fresh.decision, RouteDecision::Tunnel("T2".into()));
    }

    #[test]
    fn bind_unresolvable_application_fails() {
        let (_, tracker) = tracker(&[]);
        assert!(!tracker.bind_application_to_tunnel(&"pkg.x".into(), "T1".into()));
    }

    #[test]
    fn clear_operations_remove_only_matching_entries() {
        let (registry, tracker) = tracker(&[(1111, 100), (2222, 200)]);
        registry.insert("pkg.a", 100);
        registry.insert("pkg.b", 200);
        tracker.bind_application_to_tunnel(&"pkg.a".into(), "T1".into());
        tracker.bind_application_to_tunnel(&"pkg.b".into(), "T2".into());
        tracker.lookup_with_fallback(&tcp_tuple("10.0.0.2:1111"), None);
        tracker.lookup_with_fallback(&tcp_tuple("10.0.0.2:2222"), None);
        assert_eq!(tracker.statistics().connection_count, 2);

        tracker.clear_for_uid(100);
        assert!(tracker.lookup_by_socket("10.0.0.2".parse().unwrap(), 1111).is_none());
        assert!(tracker.lookup_by_socket("10.0.0.2".parse().unwrap(), 2222).is_some());

        tracker.clear_for_application(&"pkg.b".into());
        assert!(tracker.lookup_by_socket("10.0.0.2".parse().unwrap(), 2222).is_none());
        assert_eq!(tracker.statistics().tunnel_count, 0);

        tracker.clear_all();
        assert_eq!(tracker.statistics(), TrackerStats::default());
    }

    #[test]
    fn clear_for_tunnel_unbinds_its_uids() {
        let (_, tracker) = tracker(&[(1111, 100), (2222, 200)]);
        tracker.bind_uid_to_tunnel(100, "T1".into());
        tracker.bind_uid_to_tunnel(200, "T2".into());
        tracker.lookup_with_fallback(&tcp_tuple("10.0.0.2:1111"), None);
        tracker.lookup_with_fallback(&tcp_tuple("10.0.0.2:2222"), None);

        tracker.clear_for_tunnel(&"T1".into());
        assert!(tracker.lookup_by_socket("10.0.0.2".parse().unwrap(), 1111).is_none());
        assert!(tracker.lookup_by_socket("10.0.0.2".parse().unwrap(), 2222).is_some());
        assert_eq!(tracker.statistics().tunnel_count, 1);
    }

    #[test]
    fn unregister_connection_drops_single_flow() {
        let (_, tracker) = tracker(&[(1111, 100)]);
        tracker.bind_uid_to_tunnel(100, "T1".into());
        tracker.lookup_with_fallback(&tcp_tuple("10.0.0.2:1111"), None);

        tracker.unregister_connection("10.0.0.2".parse().unwrap(), 1111);
        assert!(tracker.lookup_by_socket("10.0.0.2".parse().unwrap(), 1111).is_none());
        // The UID mapping itself stays.
        let again = tracker
            .lookup_with_fallback(&tcp_tuple("10.0.0.2:1111"), None)
            .unwrap();
        assert_eq!(again.decision, RouteDecision::Tunnel("T1".into()));
    }

    #[test]
    fn statistics_counts() {
        let (registry, tracker) = tracker(&[(1111, 100)]);
        registry.insert("pkg.a", 100);
        tracker.bind_application_to_tunnel(&"pkg.a".into(), "T1".into());
        tracker.bind_uid_to_tunnel(200, "T1".into());
        tracker.bind_uid_direct(300);
        tracker.lookup_with_fallback(&tcp_tuple("10.0.0.2:1111"), None);

        let stats = tracker.statistics();
        assert_eq!(stats.connection_count, 1);
        assert_eq!(stats.application_count, 1);
        // T1 referenced twice, direct does not count.
        assert_eq!(stats.tunnel_count, 1);
    }
}
