use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

use super::identifier::{NodeId, NodeInfo, ID_BITS};

/// Maximum peers per bucket.
pub const K: usize = 20;

/// A peer older than this is considered gone and becomes an eviction
/// candidate when its bucket fills up.
pub const ACTIVE_WINDOW: Duration = Duration::from_secs(15 * 60);

/// A peer as tracked by the routing table: the wire descriptor plus the
/// last time we heard from it.
#[derive(Debug, Clone, Copy)]
pub struct Peer {
    pub info: NodeInfo,
    last_seen: Instant,
}

impl Peer {
    pub fn new(info: NodeInfo) -> Self {
        Self {
            info,
            last_seen: Instant::now(),
        }
    }

    pub fn touch(&mut self) {
        self.last_seen = Instant::now();
    }

    pub fn is_active(&self, now: Instant) -> bool {
        now.duration_since(self.last_seen) < ACTIVE_WINDOW
    }
}

impl PartialEq for Peer {
    /// Peers are equal iff their identifiers are equal.
    fn eq(&self, other: &Self) -> bool {
        self.info.node_id == other.info.node_id
    }
}

#[derive(Debug)]
struct KBucket {
    k: usize,
    // Least-recently-seen peer at the front, most-recently-seen at the back.
    peers: VecDeque<Peer>,
}

impl KBucket {
    fn new(k: usize) -> Self {
        Self {
            k,
            peers: VecDeque::with_capacity(k),
        }
    }

    /// Insert or refresh a peer.
    ///
    /// A resident peer is touched and moved to the MRU end. A new peer goes
    /// to the MRU end if there is room, or replaces a stale LRU head.
    /// Returns false only when the bucket is full and its head is still
    /// active; the head keeps its seat.
    fn add(&mut self, info: NodeInfo, now: Instant) -> bool {
        if let Some(pos) = self.peers.iter().position(|p| p.info.node_id == info.node_id) {
            let mut peer = self.peers.remove(pos).unwrap();
            peer.info = info;
            peer.touch();
            self.peers.push_back(peer);
            return true;
        }
        if !self.is_full() {
            self.peers.push_back(Peer::new(info));
            return true;
        }
        let head = self.peers.front().expect("full bucket has a head");
        if !head.is_active(now) {
            self.peers.pop_front();
            self.peers.push_back(Peer::new(info));
            return true;
        }
        false
    }

    fn remove(&mut self, node_id: NodeId) -> bool {
        if let Some(pos) = self.peers.iter().position(|p| p.info.node_id == node_id) {
            self.peers.remove(pos);
            true
        } else {
            false
        }
    }

    fn get(&self, node_id: NodeId) -> Option<&Peer> {
        self.peers.iter().find(|p| p.info.node_id == node_id)
    }

    fn is_full(&self) -> bool {
        self.peers.len() >= self.k
    }

    fn len(&self) -> usize {
        self.peers.len()
    }
}

/// One bucket per bit of the identifier. Bucket `i` holds peers whose id
/// first differs from ours at bit `i` (MSB-first), so all of a bucket's
/// peers share a common prefix of exactly `i` bits with the local id.
#[derive(Debug)]
pub struct RoutingTable {
    my_id: NodeId,
    k: usize,
    buckets: Vec<KBucket>,
}

impl RoutingTable {
    pub fn new(my_id: NodeId, k: usize) -> Self {
        Self {
            my_id,
            k,
            buckets: (0..ID_BITS).map(|_| KBucket::new(k)).collect(),
        }
    }

    pub fn my_id(&self) -> NodeId {
        self.my_id
    }

    /// Bucket index for a peer: the first bit (MSB-first) where its id
    /// differs from ours. Zero distance maps to the last bucket, though the
    /// local id itself is refused before dispatch.
    pub fn bucket_index(&self, node_id: NodeId) -> usize {
        self.my_id
            .distance(&node_id)
            .leading_bit()
            .unwrap_or(ID_BITS - 1)
    }

    /// Insert or refresh a peer. The local identifier is never admitted.
    pub fn add(&mut self, info: NodeInfo) -> bool {
        if info.node_id == self.my_id {
            return false;
        }
        let index = self.bucket_index(info.node_id);
        self.buckets[index].add(info, Instant::now())
    }

    pub fn remove(&mut self, node_id: NodeId) -> bool {
        let index = self.bucket_index(node_id);
        self.buckets[index].remove(node_id)
    }

    pub fn get(&self, node_id: NodeId) -> Option<NodeInfo> {
        let index = self.bucket_index(node_id);
        self.buckets[index].get(node_id).map(|p| p.info)
    }

    pub fn contains(&self, node_id: NodeId) -> bool {
        self.get(node_id).is_some()
    }

    pub fn peer_count(&self) -> usize {
        self.buckets.iter().map(|b| b.len()).sum()
    }

    pub fn all_peers(&self) -> Vec<NodeInfo> {
        self.buckets
            .iter()
            .flat_map(|b| b.peers.iter().map(|p| p.info))
            .collect()
    }

    /// The `n` peers closest to `target` by XOR distance, ascending, with
    /// ties broken by identifier.
    pub fn closest(&self, target: NodeId, n: usize) -> Vec<NodeInfo> {
        let mut peers = self.all_peers();
        peers.sort_by_key(|p| (p.node_id.distance(&target), p.node_id));
        peers.truncate(n);
        peers
    }

    /// The K closest peers to `target`.
    pub fn k_closest(&self, target: NodeId) -> Vec<NodeInfo> {
        self.closest(target, self.k)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_support::test_support::{id_with_first_byte, make_peer, peer_at};

    fn peer_in_bucket(table: &RoutingTable, bucket: usize, octet: u8, port: u16) -> NodeInfo {
        // Flip bit `bucket` of the local id so the peer lands exactly there.
        peer_at(
            std::net::IpAddr::V4(std::net::Ipv4Addr::new(127, 0, 0, octet)),
            port,
            table.my_id().flip_bit(bucket),
        )
    }

    #[test]
    fn refuses_local_id() {
        let my_id = id_with_first_byte(0xAA);
        let mut rt = RoutingTable::new(my_id, 3);
        let me = peer_at("127.0.0.1".parse().unwrap(), 4000, my_id);
        assert!(!rt.add(me));
        assert_eq!(rt.peer_count(), 0);
    }

    #[test]
    fn insert_and_remove() {
        let my_id = id_with_first_byte(0xAA);
        let mut rt = RoutingTable::new(my_id, 3);
        let p1 = make_peer(1, 4001, 0x02);
        let p2 = make_peer(2, 4002, 0x03);
        assert!(rt.add(p1));
        assert!(rt.add(p2));
        assert!(rt.contains(p1.node_id));
        assert!(rt.remove(p1.node_id));
        assert!(!rt.contains(p1.node_id));
        assert!(rt.get(p2.node_id).is_some());
    }

    #[test]
    fn bucket_index_is_common_prefix_length() {
        let my_id = id_with_first_byte(0xAA);
        let rt = RoutingTable::new(my_id, 20);
        for i in [0, 1, 7, 8, 100, 159] {
            assert_eq!(rt.bucket_index(my_id.flip_bit(i)), i);
        }
        assert_eq!(rt.bucket_index(my_id), ID_BITS - 1);
    }

    #[test]
    fn invariants_over_random_insertions() {
        let my_id = NodeId::new_random();
        let mut rt = RoutingTable::new(my_id, K);
        for _ in 0..500 {
            let info = NodeInfo {
                ip_address: "10.0.0.1".parse().unwrap(),
                udp_port: 9999,
                node_id: NodeId::new_random(),
            };
            rt.add(info);
        }

        // No bucket over capacity, every peer in the bucket matching its
        // common-prefix length, and never the local id.
        for (i, bucket) in rt.buckets.iter().enumerate() {
            assert!(bucket.len() <= K);
            for peer in &bucket.peers {
                assert_ne!(peer.info.node_id, my_id);
                assert_eq!(
                    my_id.distance(&peer.info.node_id).leading_bit(),
                    Some(i)
                );
            }
        }
    }

    #[test]
    fn closest_is_sorted_and_bounded() {
        let my_id = NodeId::new_random();
        let mut rt = RoutingTable::new(my_id, K);
        for _ in 0..64 {
            rt.add(NodeInfo {
                ip_address: "10.0.0.2".parse().unwrap(),
                udp_port: 1234,
                node_id: NodeId::new_random(),
            });
        }
        let total = rt.peer_count();
        let target = NodeId::new_random();

        for n in [1, 5, total, total + 10] {
            let closest = rt.closest(target, n);
            assert_eq!(closest.len(), n.min(total));
            for pair in closest.windows(2) {
                assert!(pair[0].node_id.distance(&target) <= pair[1].node_id.distance(&target));
            }
            let mut ids: Vec<_> = closest.iter().map(|p| p.node_id).collect();
            ids.dedup();
            assert_eq!(ids.len(), closest.len(), "no duplicates");
        }

        // Against a full-scan oracle.
        let mut oracle = rt.all_peers();
        oracle.sort_by_key(|p| (p.node_id.distance(&target), p.node_id));
        oracle.truncate(K);
        assert_eq!(rt.closest(target, K), oracle);
    }

    #[tokio::test]
    async fn resident_peer_moves_to_tail() {
        let my_id = id_with_first_byte(0xAA);
        let mut rt = RoutingTable::new(my_id, 3);
        let bucket = 42;
        let p1 = peer_in_bucket(&rt, bucket, 1, 5001);
        let mut p2 = peer_in_bucket(&rt, bucket, 2, 5002);
        p2.node_id = p2.node_id.flip_bit(150); // same bucket, distinct id
        assert!(rt.add(p1));
        assert!(rt.add(p2));

        // Re-adding p1 moves it to the MRU end.
        assert!(rt.add(p1));
        let tail = rt.buckets[bucket].peers.back().unwrap();
        assert_eq!(tail.info.node_id, p1.node_id);
        assert_eq!(rt.buckets[bucket].len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn full_bucket_rejects_when_head_is_live() {
        let my_id = id_with_first_byte(0xAA);
        let k = 4;
        let mut rt = RoutingTable::new(my_id, k);
        let bucket = 17;

        for i in 0..k {
            let mut info = peer_in_bucket(&rt, bucket, i as u8, 6000 + i as u16);
            info.node_id = info.node_id.flip_bit(150 - i);
            assert!(rt.add(info));
        }
        assert!(rt.buckets[bucket].is_full());
        let before: Vec<_> = rt.buckets[bucket].peers.iter().map(|p| p.info).collect();

        let mut newcomer = peer_in_bucket(&rt, bucket, 99, 6999);
        newcomer.node_id = newcomer.node_id.flip_bit(140);
        assert!(!rt.add(newcomer));

        let after: Vec<_> = rt.buckets[bucket].peers.iter().map(|p| p.info).collect();
        assert_eq!(before, after, "bucket unchanged on rejected add");
    }

    #[tokio::test(start_paused = true)]
    async fn full_bucket_evicts_stale_head() {
        let my_id = id_with_first_byte(0xAA);
        let k = 4;
        let mut rt = RoutingTable::new(my_id, k);
        let bucket = 17;

        // The head goes in first, then the clock jumps past the activity
        // window before the rest fill the bucket, leaving only the head stale.
        let mut head = peer_in_bucket(&rt, bucket, 0, 6000);
        head.node_id = head.node_id.flip_bit(150);
        assert!(rt.add(head));

        tokio::time::advance(ACTIVE_WINDOW + Duration::from_millis(1)).await;

        for i in 1..k {
            let mut info = peer_in_bucket(&rt, bucket, i as u8, 6000 + i as u16);
            info.node_id = info.node_id.flip_bit(150 - i);
            assert!(rt.add(info));
        }
        assert!(rt.buckets[bucket].is_full());

        let mut newcomer = peer_in_bucket(&rt, bucket, 99, 6999);
        newcomer.node_id = newcomer.node_id.flip_bit(140);
        assert!(rt.add(newcomer));

        assert_eq!(rt.buckets[bucket].len(), k);
        assert!(!rt.contains(head.node_id), "stale head is gone");
        let tail = rt.buckets[bucket].peers.back().unwrap();
        assert_eq!(tail.info.node_id, newcomer.node_id, "newcomer sits at the tail");
    }
}
