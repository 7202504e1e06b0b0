//! Bounded per-route packet buffering.
//!
//! While a route's tunnel is still coming up, its outbound packets wait
//! here. Queues are FIFO and bounded in both count and bytes; when a
//! ceiling is crossed the oldest entries are dropped and counted, so a
//! stalled route can never grow without bound or block the interface
//! read loop.

use crate::route::RouteKey;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use tracing::{debug, trace};

/// One buffered outbound packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferedPacket(pub Vec<u8>);

#[derive(Default)]
struct RouteQueue {
    packets: VecDeque<BufferedPacket>,
    bytes: usize,
    dropped: u64,
}

/// Per-route bounded FIFO queues.
///
/// A single map lock covers enqueue and drain, which is what makes
/// drains atomic: a packet is returned by exactly one drain, and two
/// concurrent drains for the same route can never interleave.
pub struct PacketBufferManager {
    max_packets: usize,
    max_bytes: usize,
    queues: Mutex<HashMap<RouteKey, RouteQueue>>,
}

impl PacketBufferManager {
    pub fn new(max_packets: usize, max_bytes: usize) -> Self {
        Self {
            max_packets,
            max_bytes,
            queues: Mutex::new(HashMap::new()),
        }
    }

    /// Append a packet to a route's queue, evicting the oldest entries
    /// once a ceiling is exceeded. Never blocks.
    pub fn enqueue(&self, route: &RouteKey, packet: Vec<u8>) {
        let mut queues = self.queues.lock().expect("buffer lock poisoned");
        let queue = queues.entry(route.clone()).or_default();

        queue.bytes += packet.len();
        queue.packets.push_back(BufferedPacket(packet));

        let mut evicted = 0u64;
        while queue.packets.len() > self.max_packets || queue.bytes > self.max_bytes {
            let Some(oldest) = queue.packets.pop_front() else {
                break;
            };
            queue.bytes -= oldest.0.len();
            evicted += 1;
        }
        if evicted > 0 {
            queue.dropped += evicted;
            debug!(%route, evicted, total_dropped = queue.dropped, "buffer ceiling hit, oldest dropped");
        } else {
            trace!(%route, queued = queue.packets.len(), "packet buffered");
        }
    }

    /// Atomically empty a route's queue, returning packets in arrival
    /// order. A given packet is returned by exactly one drain.
    pub fn drain(&self, route: &RouteKey) -> Vec<BufferedPacket> {
        let mut queues = self.queues.lock().expect("buffer lock poisoned");
        match queues.get_mut(route) {
            Some(queue) => {
                queue.bytes = 0;
                queue.packets.drain(..).collect()
            }
            None => Vec::new(),
        }
    }

    /// Discard a route's queue without delivering.
    pub fn clear(&self, route: &RouteKey) {
        self.queues.lock().expect("buffer lock poisoned").remove(route);
    }

    pub fn clear_all(&self) {
        self.queues.lock().expect("buffer lock poisoned").clear();
    }

    /// Packets currently queued for a route.
    pub fn len(&self, route: &RouteKey) -> usize {
        self.queues
            .lock()
            .expect("buffer lock poisoned")
            .get(route)
            .map_or(0, |q| q.packets.len())
    }

    pub fn is_empty(&self, route: &RouteKey) -> bool {
        self.len(route) == 0
    }

    /// Packets dropped for a route since its queue was created.
    pub fn dropped_count(&self, route: &RouteKey) -> u64 {
        self.queues
            .lock()
            .expect("buffer lock poisoned")
            .get(route)
            .map_or(0, |q| q.dropped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route() -> RouteKey {
        RouteKey::new("nordvpn_UK")
    }

    #[test]
    fn drain_preserves_arrival_order() {
        let buffers = PacketBufferManager::new(100, 1 << 20);
        for i in 0..5u8 {
            buffers.enqueue(&route(), vec![i]);
        }
        let drained = buffers.drain(&route());
        let payloads: Vec<u8> = drained.iter().map(|p| p.0[0]).collect();
        assert_eq!(payloads, vec![0, 1, 2, 3, 4]);
        // Exactly once: a second drain returns nothing.
        assert!(buffers.drain(&route()).is_empty());
    }

    #[test]
    fn count_ceiling_drops_oldest() {
        let buffers = PacketBufferManager::new(100, 1 << 20);
        for i in 0..150u32 {
            buffers.enqueue(&route(), i.to_be_bytes().to_vec());
        }
        assert_eq!(buffers.len(&route()), 100);
        assert_eq!(buffers.dropped_count(&route()), 50);

        let drained = buffers.drain(&route());
        let first = u32::from_be_bytes(drained.first().unwrap().0[..4].try_into().unwrap());
        let last = u32::from_be_bytes(drained.last().unwrap().0[..4].try_into().unwrap());
        // Exactly the most recent 100 remain.
        assert_eq!((first, last), (50, 149));
    }

    #[test]
    fn byte_ceiling_drops_oldest() {
        let buffers = PacketBufferManager::new(1000, 64);
        buffers.enqueue(&route(), vec![1u8; 40]);
        buffers.enqueue(&route(), vec![2u8; 40]);
        // 80 bytes > 64: the first packet goes.
        assert_eq!(buffers.len(&route()), 1);
        assert_eq!(buffers.dropped_count(&route()), 1);
        assert_eq!(buffers.drain(&route())[0].0[0], 2);
    }

    #[test]
    fn queues_are_independent_per_route() {
        let buffers = PacketBufferManager::new(10, 1 << 20);
        let other = RouteKey::new("nordvpn_DE");
        buffers.enqueue(&route(), vec![1]);
        buffers.enqueue(&other, vec![2]);

        buffers.clear(&route());
        assert!(buffers.is_empty(&route()));
        assert_eq!(buffers.len(&other), 1);

        buffers.clear_all();
        assert!(buffers.is_empty(&other));
    }

    #[test]
    fn oversized_single_packet_is_dropped_immediately() {
        let buffers = PacketBufferManager::new(10, 16);
        buffers.enqueue(&route(), vec![0u8; 64]);
        assert!(buffers.is_empty(&route()));
        assert_eq!(buffers.dropped_count(&route()), 1);
    }
}
