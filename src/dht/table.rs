use std::net::SocketAddr;
use std::time::Instant;

pub const K: usize = 8;
const NUM_BUCKETS: usize = 160;

#[derive(Debug, Clone)]
pub struct Peer {
    pub id: [u8; 20],
    pub addr: SocketAddr,
    pub last_seen: Instant,
}

fn xor(a: [u8; 20], b: [u8; 20]) -> [u8; 20] {
    let mut out = [0u8; 20];
    for i in 0..20 {
        out[i] = a[i] ^ b[i];
    }
    out
}

/// Index of the most significant set bit of `id`, scanning from byte 0
/// (most significant). An all-zero id (distance 0, i.e. identical ids)
/// has no set bit; callers never look this up since self is excluded.
fn prefix_len(id: [u8; 20]) -> usize {
    for (byte_idx, &byte) in id.iter().enumerate() {
        if byte == 0 {
            continue;
        }
        for bit_idx in 0..8 {
            if byte & (0x80 >> bit_idx) != 0 {
                return byte_idx * 8 + bit_idx;
            }
        }
    }
    NUM_BUCKETS - 1
}

/// 160-bucket XOR-distance routing table. Bucket `k` holds peers whose
/// distance to the local id has its most significant set bit at
/// position `k`; each bucket holds at most `K` peers, least-recently-seen
/// evicted first. Carries no internal lock — the owning node wraps it in
/// a `RwLock` (mutators take write, readers take read).
pub struct Table {
    self_id: [u8; 20],
    buckets: Vec<Vec<Peer>>,
}

impl Table {
    pub fn new(self_id: [u8; 20]) -> Self {
        Self { self_id, buckets: vec![Vec::new(); NUM_BUCKETS] }
    }

    /// Inserts or refreshes `peer`. Self is never stored. Re-inserting an
    /// already-present peer moves it to the tail (most-recently-seen)
    /// without growing the bucket.
    pub fn update(&mut self, peer: Peer) {
        if peer.id == self.self_id {
            return;
        }

        let idx = prefix_len(xor(peer.id, self.self_id));
        let bucket = &mut self.buckets[idx];

        if let Some(pos) = bucket.iter().position(|p| p.id == peer.id) {
            bucket.remove(pos);
        }
        bucket.push(peer);

        if bucket.len() > K {
            bucket.remove(0);
        }
    }

    /// Peers ordered by ascending XOR-distance to `target`, truncated to
    /// `n`. Ties are not specially broken; `Vec::sort_by_key` is stable
    /// so insertion order is preserved among equal distances.
    pub fn closest(&self, target: [u8; 20], n: usize) -> Vec<Peer> {
        let mut candidates: Vec<Peer> =
            self.buckets.iter().flat_map(|b| b.iter().cloned()).collect();
        candidates.sort_by_key(|p| xor(p.id, target));
        candidates.truncate(n);
        candidates
    }

    pub fn sample(&self, n: usize) -> Vec<Peer> {
        self.buckets.iter().flat_map(|b| b.iter().cloned()).take(n).collect()
    }

    pub fn addresses(&self) -> Vec<SocketAddr> {
        self.buckets.iter().flat_map(|b| b.iter().map(|p| p.addr)).collect()
    }

    pub fn bucket_len(&self, k: usize) -> usize {
        self.buckets[k].len()
    }
}
